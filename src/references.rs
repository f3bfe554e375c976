use std::collections::HashSet;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::error::SyncError;

const COMMENT_MARKER: char = '#';

/// Ordered, de-duplicated references read from the reference list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceList {
    pub source: Utf8PathBuf,
    pub references: Vec<String>,
    pub source_missing: bool,
}

impl ReferenceList {
    pub fn load(path: &Utf8Path) -> Result<Self, SyncError> {
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => Ok(Self {
                source: path.to_path_buf(),
                references: parse_references(&content),
                source_missing: false,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path, "reference list not found, nothing to sync");
                Ok(Self {
                    source: path.to_path_buf(),
                    references: Vec::new(),
                    source_missing: true,
                })
            }
            Err(err) => Err(SyncError::Filesystem(format!("read {path}: {err}"))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// Trims lines, drops blanks and comments, and keeps the first occurrence of each reference.
pub fn parse_references(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}
