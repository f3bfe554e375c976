use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::TrackId;
use crate::error::SyncError;

pub const AUDIO_EXT: &str = "mp3";
pub const COVER_EXT: &str = "jpg";
pub const MANIFEST_FILE: &str = "library.json";

/// On-disk layout of the local library.
#[derive(Debug, Clone)]
pub struct LibraryStore {
    library_root: Utf8PathBuf,
    manifest_path: Utf8PathBuf,
}

impl LibraryStore {
    pub fn new(library_root: Utf8PathBuf) -> Self {
        let manifest_path = library_root.join(MANIFEST_FILE);
        Self {
            library_root,
            manifest_path,
        }
    }

    pub fn with_manifest(library_root: Utf8PathBuf, manifest_path: Utf8PathBuf) -> Self {
        Self {
            library_root,
            manifest_path,
        }
    }

    pub fn library_root(&self) -> &Utf8Path {
        &self.library_root
    }

    pub fn manifest_path(&self) -> &Utf8Path {
        &self.manifest_path
    }

    pub fn audio_path(&self, id: &TrackId) -> Utf8PathBuf {
        self.library_root.join(format!("{id}.{AUDIO_EXT}"))
    }

    pub fn cover_path(&self, id: &TrackId) -> Utf8PathBuf {
        self.library_root
            .join("covers")
            .join(format!("{id}.{COVER_EXT}"))
    }

    pub fn ensure_library_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.library_root.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("create {}: {err}", self.library_root)))
    }
}

/// A local asset counts as present only when it exists and is non-empty.
pub fn is_satisfied(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Path as recorded in the manifest: forward slashes regardless of platform.
pub fn manifest_path_string(path: &Utf8Path) -> String {
    path.as_str().replace('\\', "/")
}

/// Writes `content` next to `path` and renames it into place, so readers see either
/// the old file or the complete new one.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("create {parent}: {err}")))?;
    let mut temp = Builder::new()
        .prefix(".tracksync-")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}
