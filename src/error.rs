use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid track reference: {0}")]
    InvalidReference(String),

    #[error("metadata lookup failed for {reference}: {message}")]
    MetadataHttp { reference: String, message: String },

    #[error("metadata lookup for {reference} returned status {status}: {message}")]
    MetadataStatus {
        reference: String,
        status: u16,
        message: String,
    },

    #[error("no usable title/artist in lookup response for {0}")]
    ParseFallbackExhausted(String),

    #[error("lookup response for {0} has no audio source")]
    NoAudioAsset(String),

    #[error("asset request failed for {url}: {message}")]
    AssetHttp { url: String, message: String },

    #[error("asset {url} returned status {status}")]
    AssetStatus { url: String, status: u16 },

    #[error("asset {0} downloaded zero bytes")]
    EmptyAsset(String),

    #[error("failed to write manifest {path}: {message}")]
    #[diagnostic(help("the previous manifest was left untouched"))]
    ManifestIo { path: String, message: String },

    #[error("failed to parse manifest {path}: {message}")]
    #[diagnostic(help("fix or move the file away; it will not be overwritten"))]
    ManifestParse { path: String, message: String },

    #[error("missing lookup endpoint (set lookup.endpoint in tracksync.json or pass --endpoint)")]
    MissingLookupEndpoint,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SyncError {
    /// True for failures of the lookup request itself, which fall back to cached state.
    pub fn is_metadata_fetch(&self) -> bool {
        matches!(
            self,
            SyncError::MetadataHttp { .. } | SyncError::MetadataStatus { .. }
        )
    }

    pub fn is_asset_download(&self) -> bool {
        matches!(
            self,
            SyncError::AssetHttp { .. } | SyncError::AssetStatus { .. } | SyncError::EmptyAsset(_)
        )
    }
}
