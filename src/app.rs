use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::assets::{AssetClient, AssetFetcher, FetchOutcome};
use crate::domain::TrackId;
use crate::error::SyncError;
use crate::lookup::{
    LookupClient, MetadataResolver, ResolvedMetadata, UNKNOWN_ARTIST, UNKNOWN_TITLE,
};
use crate::manifest::{LibraryEntry, LibraryManifest, ManifestSnapshot, ManifestWriter};
use crate::store::{LibraryStore, is_satisfied, manifest_path_string};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub workers: usize,
    pub checkpoint: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            workers: 1,
            checkpoint: true,
        }
    }
}

/// Shared stop request; checked before each identifier starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    NeedsResolve,
    Resolving,
    ResolvedFresh,
    ResolvedFromCache,
    Failed,
}

impl TrackState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackState::NeedsResolve => "needs_resolve",
            TrackState::Resolving => "resolving",
            TrackState::ResolvedFresh => "resolved_fresh",
            TrackState::ResolvedFromCache => "resolved_from_cache",
            TrackState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetAction {
    Present,
    Downloaded,
    Failed,
    Unavailable,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub id: String,
    pub reference: String,
    pub state: TrackState,
    /// Set when a failed refresh fell back to the prior manifest entry.
    pub kept_cached: bool,
    pub downloaded: bool,
    pub audio: AssetAction,
    pub cover: AssetAction,
    pub error: Option<String>,
    pub cover_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedReference {
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub manifest_path: String,
    pub dry_run: bool,
    pub cancelled: bool,
    pub fresh: usize,
    pub cached: usize,
    pub failed: usize,
    pub planned: usize,
    pub retained: usize,
    pub items: Vec<TrackReport>,
    pub skipped: Vec<SkippedReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub manifest_path: String,
    pub tracks: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub downloaded: bool,
    pub audio_present: bool,
    pub cover_present: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Decision taken for an identifier before any network request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    UseCache,
    Resolve,
}

/// A prior entry can be reused without a lookup when it has a title, its audio file is
/// present, and its recorded cover (if any) is present.
pub fn decide(prior: Option<&LibraryEntry>) -> Decision {
    let Some(prior) = prior else {
        return Decision::Resolve;
    };
    let has_title = !prior.title.trim().is_empty();
    let audio_ok = is_satisfied(Utf8Path::new(&prior.audio_path));
    let cover_ok = prior
        .cover_path
        .as_deref()
        .map(|path| is_satisfied(Utf8Path::new(path)))
        .unwrap_or(true);
    if has_title && audio_ok && cover_ok {
        Decision::UseCache
    } else {
        Decision::Resolve
    }
}

struct WorkItem {
    id: TrackId,
    reference: String,
}

struct Processed {
    entry: Option<LibraryEntry>,
    report: TrackReport,
}

pub struct App<L: LookupClient, A: AssetClient> {
    store: LibraryStore,
    resolver: MetadataResolver<L>,
    fetcher: AssetFetcher<A>,
}

impl<L: LookupClient, A: AssetClient> App<L, A> {
    pub fn new(
        store: LibraryStore,
        resolver: MetadataResolver<L>,
        fetcher: AssetFetcher<A>,
    ) -> Self {
        Self {
            store,
            resolver,
            fetcher,
        }
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    /// Runs the pipeline over `references` and writes the merged manifest.
    ///
    /// Per-identifier failures become degraded entries; only manifest I/O aborts the run.
    pub fn sync(
        &self,
        references: &[String],
        snapshot: &ManifestSnapshot,
        options: &SyncOptions,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let (work, skipped) = plan_work(references, sink);
        if !options.dry_run {
            self.store.ensure_library_root()?;
        }

        let slots: Mutex<Vec<Option<Processed>>> =
            Mutex::new(work.iter().map(|_| None).collect());
        let cursor = AtomicUsize::new(0);
        let write_error: Mutex<Option<SyncError>> = Mutex::new(None);
        let stop = AtomicBool::new(false);

        let worker = || {
            loop {
                if cancel.is_cancelled() || stop.load(Ordering::SeqCst) {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = work.get(idx) else {
                    break;
                };
                let processed = self.process(item, snapshot, options.dry_run, sink);
                let mut guard = slots.lock().unwrap_or_else(PoisonError::into_inner);
                guard[idx] = Some(processed);
                if options.checkpoint && !options.dry_run {
                    let manifest = assemble(&guard, snapshot);
                    if let Err(err) = ManifestWriter::write(self.store.manifest_path(), &manifest) {
                        stop.store(true, Ordering::SeqCst);
                        write_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(err);
                    }
                }
            }
        };

        let workers = options.workers.clamp(1, work.len().max(1));
        if workers == 1 {
            worker();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&worker);
                }
            });
        }

        if let Some(err) = write_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }

        let slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        let cancelled = slots.iter().any(Option::is_none);
        if cancelled {
            warn!(
                remaining = slots.iter().filter(|slot| slot.is_none()).count(),
                "run interrupted; unprocessed tracks keep their previous entries"
            );
        }

        let mut manifest = assemble(&slots, snapshot);
        if !options.dry_run {
            sink.event(ProgressEvent {
                message: format!("phase=Store; writing manifest {}", self.store.manifest_path()),
                elapsed: None,
            });
            manifest.verify_downloads();
            ManifestWriter::write(self.store.manifest_path(), &manifest)?;
        }

        let items: Vec<TrackReport> = slots
            .into_iter()
            .flatten()
            .map(|processed| processed.report)
            .collect();
        let processed_ids: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
        let retained = manifest
            .entries()
            .iter()
            .filter(|entry| !processed_ids.contains(entry.id.as_str()))
            .count();
        let count = |state: TrackState| items.iter().filter(|item| item.state == state).count();

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            manifest_path: self.store.manifest_path().to_string(),
            dry_run: options.dry_run,
            cancelled,
            fresh: count(TrackState::ResolvedFresh),
            cached: count(TrackState::ResolvedFromCache),
            failed: count(TrackState::Failed),
            planned: count(TrackState::NeedsResolve),
            retained,
            skipped,
            items,
        };
        info!(
            fresh = report.fresh,
            cached = report.cached,
            failed = report.failed,
            retained = report.retained,
            "sync finished"
        );
        Ok(report)
    }

    /// Reports every manifest entry together with what is actually on disk.
    pub fn list(&self, snapshot: &ManifestSnapshot) -> ListResult {
        ListResult {
            manifest_path: self.store.manifest_path().to_string(),
            tracks: snapshot
                .entries()
                .iter()
                .map(|entry| ListEntry {
                    id: entry.id.to_string(),
                    title: entry.title.clone(),
                    artist: entry.artist.clone(),
                    downloaded: entry.downloaded,
                    audio_present: is_satisfied(Utf8Path::new(&entry.audio_path)),
                    cover_present: entry
                        .cover_path
                        .as_deref()
                        .map(|path| is_satisfied(Utf8Path::new(path)))
                        .unwrap_or(false),
                })
                .collect(),
        }
    }

    fn process(
        &self,
        item: &WorkItem,
        snapshot: &ManifestSnapshot,
        dry_run: bool,
        sink: &dyn ProgressSink,
    ) -> Processed {
        let prior = snapshot.get(&item.id);
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; track {}", item.id),
            elapsed: None,
        });

        if let (Decision::UseCache, Some(prior)) = (decide(prior), prior) {
            info!(id = %item.id, "up to date, reusing cached entry");
            let entry = LibraryEntry {
                downloaded: true,
                ..prior.clone()
            };
            return Processed {
                report: TrackReport {
                    id: item.id.to_string(),
                    reference: item.reference.clone(),
                    state: TrackState::ResolvedFromCache,
                    kept_cached: false,
                    downloaded: true,
                    audio: AssetAction::Present,
                    cover: if entry.cover_path.is_some() {
                        AssetAction::Present
                    } else {
                        AssetAction::Unavailable
                    },
                    error: None,
                    cover_error: None,
                },
                entry: Some(entry),
            };
        }

        if dry_run {
            return Processed {
                entry: prior.cloned(),
                report: TrackReport {
                    id: item.id.to_string(),
                    reference: item.reference.clone(),
                    state: TrackState::NeedsResolve,
                    kept_cached: false,
                    downloaded: prior.map(|entry| entry.downloaded).unwrap_or(false),
                    audio: AssetAction::Pending,
                    cover: AssetAction::Pending,
                    error: None,
                    cover_error: None,
                },
            };
        }

        sink.event(ProgressEvent {
            message: format!(
                "track {} state={}",
                item.id,
                TrackState::Resolving.as_str()
            ),
            elapsed: None,
        });
        let start = Instant::now();
        let resolved = self.resolver.resolve(&item.reference);
        sink.event(ProgressEvent {
            message: format!(
                "lookup.response id={} latency_ms={}",
                item.id,
                start.elapsed().as_millis()
            ),
            elapsed: Some(start.elapsed()),
        });

        match resolved {
            Ok(meta) => self.refresh(item, prior, meta, sink),
            Err(err) => self.fall_back(item, prior, err),
        }
    }

    fn refresh(
        &self,
        item: &WorkItem,
        prior: Option<&LibraryEntry>,
        meta: ResolvedMetadata,
        sink: &dyn ProgressSink,
    ) -> Processed {
        let audio_target = self.store.audio_path(&item.id);
        let cover_target = self.store.cover_path(&item.id);
        let cover_offered = meta.cover_url.is_some();
        let cover_url = meta
            .cover_url
            .as_deref()
            .filter(|_| !is_satisfied(&cover_target));

        sink.event(ProgressEvent {
            message: format!("phase=Fetch; assets for {}", item.id),
            elapsed: None,
        });
        let cover_dest = &cover_target;
        let (audio_result, cover_result) = thread::scope(|scope| {
            let cover_task =
                cover_url.map(|url| scope.spawn(move || self.fetcher.fetch(url, cover_dest)));
            let audio_result = self.fetcher.fetch(&meta.audio_url, &audio_target);
            let cover_result = cover_task.map(|task| {
                task.join().unwrap_or_else(|_| {
                    Err(SyncError::AssetHttp {
                        url: meta.cover_url.clone().unwrap_or_default(),
                        message: "cover download panicked".to_string(),
                    })
                })
            });
            (audio_result, cover_result)
        });

        let (audio, error) = match audio_result {
            Ok(FetchOutcome::Skipped) => (AssetAction::Present, None),
            Ok(FetchOutcome::Downloaded { bytes }) => {
                info!(id = %item.id, bytes, "audio downloaded");
                (AssetAction::Downloaded, None)
            }
            Err(err) => {
                warn!(id = %item.id, "audio download failed: {err}");
                (AssetAction::Failed, Some(err.to_string()))
            }
        };
        let (cover, cover_error) = match cover_result {
            None if is_satisfied(&cover_target) => (AssetAction::Present, None),
            None => (AssetAction::Unavailable, None),
            Some(Ok(_)) => (AssetAction::Downloaded, None),
            Some(Err(err)) => {
                warn!(id = %item.id, "cover download failed: {err}");
                (AssetAction::Failed, Some(err.to_string()))
            }
        };

        let downloaded = is_satisfied(&audio_target);
        let (title, artist) = merge_text(prior, meta);
        let entry = LibraryEntry {
            id: item.id.clone(),
            source_reference: item.reference.clone(),
            title,
            artist,
            audio_path: manifest_path_string(&audio_target),
            // An offered cover stays recorded after a failed download so the next run retries it.
            cover_path: (cover_offered || is_satisfied(&cover_target))
                .then(|| manifest_path_string(&cover_target)),
            downloaded,
        };
        info!(id = %item.id, title = %entry.title, artist = %entry.artist, downloaded, "resolved");

        Processed {
            report: TrackReport {
                id: item.id.to_string(),
                reference: item.reference.clone(),
                state: TrackState::ResolvedFresh,
                kept_cached: false,
                downloaded,
                audio,
                cover,
                error,
                cover_error,
            },
            entry: Some(entry),
        }
    }

    fn fall_back(
        &self,
        item: &WorkItem,
        prior: Option<&LibraryEntry>,
        err: SyncError,
    ) -> Processed {
        let (entry, kept_cached) = match prior {
            Some(prior) => {
                warn!(id = %item.id, "{err}; keeping previous entry");
                (prior.clone(), true)
            }
            None => {
                warn!(id = %item.id, "{err}; recording placeholder");
                let entry = LibraryEntry {
                    id: item.id.clone(),
                    source_reference: item.reference.clone(),
                    title: UNKNOWN_TITLE.to_string(),
                    artist: UNKNOWN_ARTIST.to_string(),
                    audio_path: manifest_path_string(&self.store.audio_path(&item.id)),
                    cover_path: None,
                    downloaded: false,
                };
                (entry, false)
            }
        };
        Processed {
            report: TrackReport {
                id: item.id.to_string(),
                reference: item.reference.clone(),
                state: TrackState::Failed,
                kept_cached,
                downloaded: entry.downloaded,
                audio: if entry.downloaded {
                    AssetAction::Present
                } else {
                    AssetAction::Unavailable
                },
                cover: if entry
                    .cover_path
                    .as_deref()
                    .is_some_and(|path| is_satisfied(Utf8Path::new(path)))
                {
                    AssetAction::Present
                } else {
                    AssetAction::Unavailable
                },
                error: Some(err.to_string()),
                cover_error: None,
            },
            entry: Some(entry),
        }
    }
}

/// Fresh text wins unless it is a placeholder and the prior entry knew better.
fn merge_text(prior: Option<&LibraryEntry>, meta: ResolvedMetadata) -> (String, String) {
    let keep = |fresh: String, placeholder: &str, previous: Option<&String>| match previous {
        Some(previous) if fresh == placeholder && !previous.trim().is_empty() => previous.clone(),
        _ => fresh,
    };
    (
        keep(meta.title, UNKNOWN_TITLE, prior.map(|entry| &entry.title)),
        keep(meta.artist, UNKNOWN_ARTIST, prior.map(|entry| &entry.artist)),
    )
}

fn plan_work(
    references: &[String],
    sink: &dyn ProgressSink,
) -> (Vec<WorkItem>, Vec<SkippedReference>) {
    let mut work = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = HashSet::new();
    for reference in references {
        match TrackId::from_reference(reference) {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    work.push(WorkItem {
                        id,
                        reference: reference.clone(),
                    });
                } else {
                    skipped.push(SkippedReference {
                        reference: reference.clone(),
                        reason: format!("duplicate of track {id}"),
                    });
                }
            }
            Err(err) => {
                warn!("skipping: {err}");
                skipped.push(SkippedReference {
                    reference: reference.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    sink.event(ProgressEvent {
        message: format!(
            "phase=Prepare; {} tracks, {} skipped references",
            work.len(),
            skipped.len()
        ),
        elapsed: None,
    });
    (work, skipped)
}

fn assemble(slots: &[Option<Processed>], snapshot: &ManifestSnapshot) -> LibraryManifest {
    LibraryManifest::assemble(
        slots
            .iter()
            .flatten()
            .filter_map(|processed| processed.entry.as_ref()),
        snapshot,
    )
}
