use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::extract::{ExtractionPlan, first_match};
use crate::pacing::RequestPacer;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Metadata and asset locations for one track, as reported by the lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMetadata {
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub cover_url: Option<String>,
}

pub trait LookupClient: Send + Sync {
    /// Returns the raw response body for `reference`.
    fn fetch(&self, reference: &str) -> Result<String, SyncError>;

    /// Base against which relative asset URLs in the response are resolved.
    fn base_url(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub endpoint: String,
    pub query_param: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: usize,
    /// Backoff before retry `n` is `retry_delay * n`.
    pub retry_delay: Duration,
}

#[derive(Clone)]
pub struct HttpLookupClient {
    client: Client,
    settings: LookupSettings,
    pacer: Arc<RequestPacer>,
}

impl HttpLookupClient {
    pub fn new(settings: LookupSettings, pacer: Arc<RequestPacer>) -> Result<Self, SyncError> {
        Url::parse(&settings.endpoint).map_err(|err| {
            SyncError::InvalidConfig(format!("lookup endpoint {}: {err}", settings.endpoint))
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .map_err(|err| SyncError::InvalidConfig(format!("user agent: {err}")))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| SyncError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self {
            client,
            settings,
            pacer,
        })
    }

    fn send_with_retries<F>(
        &self,
        reference: &str,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, SyncError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let max_retries = self.settings.max_retries;
        let mut attempt = 0usize;
        loop {
            self.pacer.acquire();
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < max_retries && is_retryable_status(status) {
                        debug!(reference, status, attempt, "lookup retry");
                        thread::sleep(self.backoff(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < max_retries && is_retryable_error(&err) {
                        debug!(reference, attempt, error = %err, "lookup retry");
                        thread::sleep(self.backoff(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::MetadataHttp {
                        reference: reference.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.settings.retry_delay * (attempt as u32 + 1)
    }
}

impl LookupClient for HttpLookupClient {
    fn fetch(&self, reference: &str) -> Result<String, SyncError> {
        let response = self.send_with_retries(reference, || {
            self.client
                .get(&self.settings.endpoint)
                .query(&[(self.settings.query_param.as_str(), reference)])
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .map(|body| truncate(&body, 200))
                .unwrap_or_else(|_| "lookup request failed".to_string());
            return Err(SyncError::MetadataStatus {
                reference: reference.to_string(),
                status,
                message,
            });
        }
        response.text().map_err(|err| SyncError::MetadataHttp {
            reference: reference.to_string(),
            message: err.to_string(),
        })
    }

    fn base_url(&self) -> Option<&str> {
        Some(&self.settings.endpoint)
    }
}

/// Turns lookup responses into [`ResolvedMetadata`] using an [`ExtractionPlan`].
pub struct MetadataResolver<L: LookupClient> {
    client: L,
    plan: ExtractionPlan,
}

impl<L: LookupClient> MetadataResolver<L> {
    pub fn new(client: L, plan: ExtractionPlan) -> Self {
        Self { client, plan }
    }

    pub fn resolve(&self, reference: &str) -> Result<ResolvedMetadata, SyncError> {
        let body = self.client.fetch(reference)?;
        parse_metadata(reference, &body, self.client.base_url(), &self.plan)
    }
}

/// Applies the fallback chain to a response body.
///
/// Missing title or artist degrade to placeholders; a missing audio source is fatal.
pub fn parse_metadata(
    reference: &str,
    body: &str,
    base_url: Option<&str>,
    plan: &ExtractionPlan,
) -> Result<ResolvedMetadata, SyncError> {
    let audio = first_match(&plan.audio, body)
        .ok_or_else(|| SyncError::NoAudioAsset(reference.to_string()))?;

    let (title, artist) = match track_text(reference, body, plan) {
        Ok(found) => found,
        Err(err) => {
            warn!(reference, "{err}; using placeholders");
            (UNKNOWN_TITLE.to_string(), UNKNOWN_ARTIST.to_string())
        }
    };

    let cover_url = first_match(&plan.cover, body).map(|found| {
        debug!(reference, strategy = %found.strategy, "cover located");
        absolutize(base_url, &found.value)
    });

    Ok(ResolvedMetadata {
        title,
        artist,
        audio_url: absolutize(base_url, &audio.value),
        cover_url,
    })
}

fn track_text(
    reference: &str,
    body: &str,
    plan: &ExtractionPlan,
) -> Result<(String, String), SyncError> {
    let title = first_match(&plan.title, body).map(|found| found.value);
    let artist = first_match(&plan.artist, body).map(|found| found.value);
    match (title, artist) {
        (None, None) => Err(SyncError::ParseFallbackExhausted(reference.to_string())),
        (title, artist) => Ok((
            title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
        )),
    }
}

fn absolutize(base_url: Option<&str>, value: &str) -> String {
    let value = value.trim();
    let value = match value.strip_prefix("//") {
        Some(rest) => return format!("https://{rest}"),
        None => value,
    };
    if Url::parse(value).is_ok() {
        return value.to_string();
    }
    base_url
        .and_then(|base| Url::parse(base).ok())
        .and_then(|base| base.join(value).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| value.to_string())
}

fn truncate(value: &str, max_chars: usize) -> String {
    let trimmed = value.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
