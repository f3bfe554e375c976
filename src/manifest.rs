use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::TrackId;
use crate::error::SyncError;
use crate::store::{is_satisfied, write_bytes_atomic};

/// Persisted state of one track. Field names match what the front end reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: TrackId,
    #[serde(rename = "url", alias = "source_reference")]
    pub source_reference: String,
    pub title: String,
    pub artist: String,
    #[serde(alias = "audioPath")]
    pub audio_path: String,
    #[serde(default, alias = "coverPath")]
    pub cover_path: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
}

/// Read-only view of the manifest as it was before the run.
#[derive(Debug, Clone, Default)]
pub struct ManifestSnapshot {
    entries: Vec<LibraryEntry>,
    index: HashMap<TrackId, usize>,
}

impl ManifestSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LibraryEntry>) -> Self {
        let mut unique = Vec::with_capacity(entries.len());
        let mut index = HashMap::new();
        for entry in entries {
            if index.contains_key(&entry.id) {
                warn!(id = %entry.id, "duplicate manifest entry ignored");
                continue;
            }
            index.insert(entry.id.clone(), unique.len());
            unique.push(entry);
        }
        Self {
            entries: unique,
            index,
        }
    }

    /// Loads the manifest at `path`; a missing file is an empty snapshot.
    pub fn load(path: &Utf8Path) -> Result<Self, SyncError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(err) => {
                return Err(SyncError::ManifestParse {
                    path: path.to_string(),
                    message: err.to_string(),
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::empty());
        }
        let entries: Vec<LibraryEntry> =
            serde_json::from_str(&content).map_err(|err| SyncError::ManifestParse {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self::from_entries(entries))
    }

    pub fn get(&self, id: &TrackId) -> Option<&LibraryEntry> {
        self.index.get(id).map(|idx| &self.entries[*idx])
    }

    pub fn entries(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The manifest produced by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LibraryManifest {
    entries: Vec<LibraryEntry>,
}

impl LibraryManifest {
    /// Entries processed this run come first, in processing order; prior entries that were
    /// not touched are retained after them in their prior order.
    pub fn assemble<'a, I>(processed: I, snapshot: &ManifestSnapshot) -> Self
    where
        I: IntoIterator<Item = &'a LibraryEntry>,
    {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for entry in processed {
            if seen.insert(entry.id.clone()) {
                entries.push(entry.clone());
            }
        }
        for entry in snapshot.entries() {
            if seen.insert(entry.id.clone()) {
                entries.push(entry.clone());
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best-effort check that every `downloaded` entry still has a non-empty audio file.
    pub fn verify_downloads(&mut self) -> usize {
        let mut downgraded = 0;
        for entry in &mut self.entries {
            if entry.downloaded && !is_satisfied(Utf8Path::new(&entry.audio_path)) {
                warn!(id = %entry.id, path = %entry.audio_path, "audio file missing, clearing downloaded flag");
                entry.downloaded = false;
                downgraded += 1;
            }
        }
        downgraded
    }
}

pub struct ManifestWriter;

impl ManifestWriter {
    /// Replaces the manifest file as a whole; on failure the previous file is untouched.
    pub fn write(path: &Utf8Path, manifest: &LibraryManifest) -> Result<(), SyncError> {
        let mut content =
            serde_json::to_vec_pretty(manifest).map_err(|err| SyncError::ManifestIo {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        content.push(b'\n');
        write_bytes_atomic(path, &content).map_err(|err| SyncError::ManifestIo {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}
