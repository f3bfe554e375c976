use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::debug;

use crate::error::SyncError;
use crate::pacing::RequestPacer;
use crate::store::is_satisfied;

pub trait AssetClient: Send + Sync {
    /// Streams `url` into `destination` and returns the number of bytes written.
    fn download(&self, url: &str, destination: &Path) -> Result<u64, SyncError>;
}

#[derive(Clone)]
pub struct HttpAssetClient {
    client: Client,
    pacer: Arc<RequestPacer>,
}

impl HttpAssetClient {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        pacer: Arc<RequestPacer>,
    ) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|err| SyncError::InvalidConfig(format!("user agent: {err}")))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self { client, pacer })
    }
}

impl AssetClient for HttpAssetClient {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, SyncError> {
        self.pacer.acquire();
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SyncError::AssetHttp {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(SyncError::AssetStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let mut file =
            File::create(destination).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let bytes = io::copy(&mut response, &mut file).map_err(|err| SyncError::AssetHttp {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        file.flush()
            .and_then(|_| file.sync_all())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FetchOutcome {
    /// Target already present and non-empty; nothing was requested.
    Skipped,
    Downloaded { bytes: u64 },
}

/// Downloads assets into the library, publishing each file only once it is complete.
#[derive(Debug, Clone)]
pub struct AssetFetcher<A: AssetClient> {
    client: A,
}

impl<A: AssetClient> AssetFetcher<A> {
    pub fn new(client: A) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &A {
        &self.client
    }

    pub fn fetch(&self, url: &str, target: &Utf8Path) -> Result<FetchOutcome, SyncError> {
        if is_satisfied(target) {
            debug!(target = %target, "asset present, skipping");
            return Ok(FetchOutcome::Skipped);
        }
        let parent = match target.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("create {parent}: {err}")))?;

        // Partial downloads live under a dot-prefixed temp name and are removed on drop.
        let temp = tempfile::Builder::new()
            .prefix(".tracksync-")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let bytes = self.client.download(url, temp.path())?;
        let written = temp
            .as_file()
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if bytes == 0 || written == 0 {
            return Err(SyncError::EmptyAsset(url.to_string()));
        }
        temp.persist(target.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        debug!(target = %target, bytes, "asset published");
        Ok(FetchOutcome::Downloaded { bytes })
    }
}
