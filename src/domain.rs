use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const URI_MARKER: &str = "spotify:track:";
const PATH_MARKER: &str = "track";

/// Canonical catalog token for one track, the primary key of all library state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the identifier from a raw reference line.
    ///
    /// Accepts the URI form (`spotify:track:<id>`) and any URL whose path contains a
    /// `track` segment followed by the identifier (`https://open.spotify.com/track/<id>?si=..`).
    pub fn from_reference(reference: &str) -> Result<Self, SyncError> {
        let trimmed = reference.trim();
        from_uri(trimmed)
            .or_else(|| from_path(trimmed))
            .map(Self)
            .ok_or_else(|| SyncError::InvalidReference(reference.to_string()))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrackId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if is_token(trimmed) {
            return Ok(Self(trimmed.to_string()));
        }
        Self::from_reference(value)
    }
}

fn from_uri(reference: &str) -> Option<String> {
    let position = reference.find(URI_MARKER)?;
    let rest = &reference[position + URI_MARKER.len()..];
    let candidate = rest.rsplit(':').next()?;
    let candidate = leading_token(candidate);
    is_token(candidate).then(|| candidate.to_string())
}

fn from_path(reference: &str) -> Option<String> {
    let without_fragment = reference.split('#').next().unwrap_or_default();
    let path = without_fragment.split('?').next().unwrap_or_default();
    let mut segments = path.split('/');
    while let Some(segment) = segments.next() {
        if segment != PATH_MARKER {
            continue;
        }
        let candidate = segments.next().map(leading_token).unwrap_or_default();
        if is_token(candidate) {
            return Some(candidate.to_string());
        }
    }
    None
}

fn leading_token(value: &str) -> &str {
    let end = value
        .find(|ch: char| !ch.is_ascii_alphanumeric())
        .unwrap_or(value.len());
    &value[..end]
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}
