use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::store::{manifest_path_string, write_bytes_atomic};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryImage {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GalleryResult {
    pub output: Option<String>,
    pub images: Vec<GalleryImage>,
    pub dir_missing: bool,
}

/// Lists image files directly inside `dir`, sorted by file name.
pub fn scan(dir: &Utf8Path) -> Result<Vec<GalleryImage>, SyncError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("read {dir}: {err}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.is_file() && is_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths
        .into_iter()
        .filter_map(|path| {
            Some(GalleryImage {
                name: path.file_name()?.to_string(),
                path: manifest_path_string(&path),
            })
        })
        .collect())
}

/// Scans `dir` and writes the listing to `output`. A missing directory writes nothing.
pub fn generate(dir: &Utf8Path, output: &Utf8Path) -> Result<GalleryResult, SyncError> {
    if !dir.as_std_path().is_dir() {
        tracing::warn!(dir = %dir, "gallery directory not found");
        return Ok(GalleryResult {
            output: None,
            images: Vec::new(),
            dir_missing: true,
        });
    }
    let images = scan(dir)?;
    let content =
        serde_json::to_vec_pretty(&images).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    write_bytes_atomic(output, &content)?;
    tracing::info!(output = %output, count = images.len(), "gallery listing written");
    Ok(GalleryResult {
        output: Some(output.to_string()),
        images,
        dir_missing: false,
    })
}

fn is_image(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
