use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use tracksync::app::{
    App, AssetAction, CancelFlag, ProgressEvent, ProgressSink, SyncOptions, SyncReport, TrackState,
};
use tracksync::assets::{AssetClient, AssetFetcher};
use tracksync::error::SyncError;
use tracksync::extract::ExtractionPlan;
use tracksync::lookup::{LookupClient, MetadataResolver, UNKNOWN_ARTIST, UNKNOWN_TITLE};
use tracksync::manifest::{LibraryEntry, LibraryManifest, ManifestSnapshot, ManifestWriter};
use tracksync::output::JsonOutput;
use tracksync::store::LibraryStore;

fn page(title: &str, artist: &str, id: &str) -> String {
    format!(
        r#"<html><head><title>{title} - {artist}</title>
<style>.cover {{ background-image: url('https://cdn.example/{id}.jpg'); }}</style></head>
<body><audio controls><source src="https://cdn.example/{id}.mp3" type="audio/mpeg"></audio></body></html>"#
    )
}

#[derive(Default)]
struct MockLookup {
    pages: HashMap<String, String>,
    calls: Arc<Mutex<usize>>,
    cancel_after_first: Option<CancelFlag>,
    watch_manifest: Option<Utf8PathBuf>,
    seen_manifest_sizes: Arc<Mutex<Vec<usize>>>,
}

impl MockLookup {
    fn with_page(mut self, reference: &str, body: String) -> Self {
        self.pages.insert(reference.to_string(), body);
        self
    }
}

impl LookupClient for MockLookup {
    fn fetch(&self, reference: &str) -> Result<String, SyncError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(flag) = &self.cancel_after_first {
            flag.cancel();
        }
        if let Some(path) = &self.watch_manifest {
            let size = ManifestSnapshot::load(path).unwrap().len();
            self.seen_manifest_sizes.lock().unwrap().push(size);
        }
        self.pages
            .get(reference)
            .cloned()
            .ok_or_else(|| SyncError::MetadataStatus {
                reference: reference.to_string(),
                status: 503,
                message: "service unavailable".to_string(),
            })
    }
}

#[derive(Default)]
struct MockAssets {
    calls: Arc<Mutex<usize>>,
    failing: HashSet<String>,
}

impl AssetClient for MockAssets {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, SyncError> {
        *self.calls.lock().unwrap() += 1;
        if self.failing.contains(url) {
            fs::write(destination, b"trunc").unwrap();
            return Err(SyncError::AssetHttp {
                url: url.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let body = format!("bytes of {url}");
        fs::write(destination, body.as_bytes()).unwrap();
        Ok(body.len() as u64)
    }
}

fn library() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("music")).unwrap();
    (temp, root)
}

fn run(
    root: &Utf8Path,
    lookup: MockLookup,
    assets: MockAssets,
    references: &[&str],
    options: &SyncOptions,
    cancel: &CancelFlag,
) -> Result<SyncReport, SyncError> {
    let store = LibraryStore::new(root.to_path_buf());
    let snapshot = ManifestSnapshot::load(store.manifest_path())?;
    let app = App::new(
        store,
        MetadataResolver::new(lookup, ExtractionPlan::default()),
        AssetFetcher::new(assets),
    );
    let references: Vec<String> = references.iter().map(|r| r.to_string()).collect();
    app.sync(&references, &snapshot, options, cancel, &JsonOutput)
}

fn manifest_entries(root: &Utf8Path) -> Vec<LibraryEntry> {
    ManifestSnapshot::load(&root.join("library.json"))
        .unwrap()
        .entries()
        .to_vec()
}

fn seed_manifest(root: &Utf8Path, entries: Vec<LibraryEntry>) {
    let snapshot = ManifestSnapshot::from_entries(entries);
    let manifest = LibraryManifest::assemble(std::iter::empty(), &snapshot);
    ManifestWriter::write(&root.join("library.json"), &manifest).unwrap();
}

fn prior_entry(root: &Utf8Path, id: &str, title: &str) -> LibraryEntry {
    LibraryEntry {
        id: id.parse().unwrap(),
        source_reference: format!("spotify:track:{id}"),
        title: title.to_string(),
        artist: "Known Artist".to_string(),
        audio_path: root.join(format!("{id}.mp3")).to_string(),
        cover_path: None,
        downloaded: true,
    }
}

#[test]
fn second_run_is_idempotent() {
    let (_temp, root) = library();
    let references = ["spotify:track:AAA111", "https://open.spotify.com/track/BBB222?si=x"];
    let lookup = MockLookup::default()
        .with_page(references[0], page("First", "One", "AAA111"))
        .with_page(references[1], page("Second", "Two", "BBB222"));

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &references,
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();
    assert_eq!(report.fresh, 2);
    let first = fs::read(root.join("library.json").as_std_path()).unwrap();

    let entries = manifest_entries(&root);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].title, "First");
    assert_eq!(entries[0].artist, "One");
    assert!(entries[0].downloaded);
    assert!(entries[0].cover_path.as_deref().unwrap().ends_with("covers/AAA111.jpg"));
    assert!(root.join("covers/BBB222.jpg").as_std_path().is_file());

    let lookup = MockLookup::default();
    let lookup_calls = lookup.calls.clone();
    let assets = MockAssets::default();
    let asset_calls = assets.calls.clone();
    let report = run(
        &root,
        lookup,
        assets,
        &references,
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(*lookup_calls.lock().unwrap(), 0);
    assert_eq!(*asset_calls.lock().unwrap(), 0);
    assert_eq!(report.cached, 2);
    assert!(report.items.iter().all(|item| item.state == TrackState::ResolvedFromCache));
    let second = fs::read(root.join("library.json").as_std_path()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn lookup_failure_keeps_prior_entry() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("AAA111.mp3").as_std_path(), b"ID3").unwrap();
    let prior = LibraryEntry {
        cover_path: Some(root.join("covers/AAA111.jpg").to_string()),
        ..prior_entry(&root, "AAA111", "Known Song")
    };
    seed_manifest(&root, vec![prior.clone()]);

    let report = run(
        &root,
        MockLookup::default(),
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.items[0].kept_cached);
    assert_eq!(manifest_entries(&root), vec![prior]);
}

#[test]
fn failed_lookup_without_history_records_placeholder() {
    let (_temp, root) = library();
    let report = run(
        &root,
        MockLookup::default(),
        MockAssets::default(),
        &["spotify:track:NEW1"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.items[0].state, TrackState::Failed);
    let entries = manifest_entries(&root);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title, UNKNOWN_TITLE);
    assert_eq!(entries[0].artist, UNKNOWN_ARTIST);
    assert!(!entries[0].downloaded);
}

#[test]
fn equivalent_references_are_processed_once() {
    let (_temp, root) = library();
    let lookup = MockLookup::default().with_page(
        "spotify:track:ABC123",
        page("Song", "Artist", "ABC123"),
    );
    let calls = lookup.calls.clone();

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:ABC123", "https://x/track/ABC123", "not a track"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(report.items.len(), 1);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(manifest_entries(&root).len(), 1);
}

#[test]
fn zero_byte_audio_is_downloaded_again() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("AAA111.mp3").as_std_path(), b"").unwrap();
    seed_manifest(&root, vec![prior_entry(&root, "AAA111", "Song")]);

    let lookup = MockLookup::default()
        .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111"));
    let calls = lookup.calls.clone();
    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(report.items[0].audio, AssetAction::Downloaded);
    let len = fs::metadata(root.join("AAA111.mp3").as_std_path()).unwrap().len();
    assert!(len > 0);
    assert!(manifest_entries(&root)[0].downloaded);
}

#[test]
fn interrupted_audio_leaves_no_artifact() {
    let (_temp, root) = library();
    let lookup = MockLookup::default()
        .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111"));
    let assets = MockAssets {
        failing: HashSet::from(["https://cdn.example/AAA111.mp3".to_string()]),
        ..MockAssets::default()
    };

    let report = run(
        &root,
        lookup,
        assets,
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.items[0].audio, AssetAction::Failed);
    assert!(!root.join("AAA111.mp3").as_std_path().exists());
    let leftovers: Vec<_> = fs::read_dir(root.as_std_path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());

    let entries = manifest_entries(&root);
    assert_eq!(entries[0].title, "Song");
    assert!(!entries[0].downloaded);
}

#[test]
fn fallback_extraction_fills_text() {
    let (_temp, root) = library();
    let bare = r#"<html><body><source src="https://cdn.example/BBB222.mp3"></body></html>"#;
    let headed = r#"<h1 class="track-title">Heading Song</h1><p class="artist-name">Para Artist</p>
<audio src="https://cdn.example/AAA111.mp3"></audio>"#;
    let lookup = MockLookup::default()
        .with_page("spotify:track:AAA111", headed.to_string())
        .with_page("spotify:track:BBB222", bare.to_string());

    run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111", "spotify:track:BBB222"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    let entries = manifest_entries(&root);
    assert_eq!(entries[0].title, "Heading Song");
    assert_eq!(entries[0].artist, "Para Artist");
    assert_eq!(entries[1].title, UNKNOWN_TITLE);
    assert_eq!(entries[1].artist, UNKNOWN_ARTIST);
    assert!(entries[1].downloaded);
}

#[test]
fn missing_audio_source_does_not_stop_the_run() {
    let (_temp, root) = library();
    let lookup = MockLookup::default()
        .with_page(
            "spotify:track:AAA111",
            "<title>Song - Artist</title>".to_string(),
        )
        .with_page("spotify:track:BBB222", page("Other", "Band", "BBB222"));

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111", "spotify:track:BBB222"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.items[0].state, TrackState::Failed);
    assert_eq!(report.items[1].state, TrackState::ResolvedFresh);
    let entries = manifest_entries(&root);
    assert!(!entries[0].downloaded);
    assert!(entries[1].downloaded);
}

#[test]
fn missing_cover_still_counts_as_downloaded() {
    let (_temp, root) = library();
    let body = r#"<title>Song - Artist</title><audio src="https://cdn.example/AAA111.mp3"></audio>"#;
    let lookup = MockLookup::default().with_page("spotify:track:AAA111", body.to_string());

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.items[0].cover, AssetAction::Unavailable);
    let entries = manifest_entries(&root);
    assert!(entries[0].downloaded);
    assert_eq!(entries[0].cover_path, None);
}

#[test]
fn failed_cover_is_retried_on_next_run() {
    let (_temp, root) = library();
    let lookup = MockLookup::default()
        .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111"));
    let assets = MockAssets {
        failing: HashSet::from(["https://cdn.example/AAA111.jpg".to_string()]),
        ..MockAssets::default()
    };

    let report = run(
        &root,
        lookup,
        assets,
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.items[0].cover, AssetAction::Failed);
    assert!(report.items[0].cover_error.is_some());
    assert!(report.items[0].downloaded);
    let entries = manifest_entries(&root);
    assert!(entries[0].downloaded);
    assert!(entries[0].cover_path.as_deref().unwrap().ends_with("covers/AAA111.jpg"));
    assert!(!root.join("covers/AAA111.jpg").as_std_path().exists());

    let lookup = MockLookup::default()
        .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111"));
    let calls = lookup.calls.clone();
    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(report.items[0].state, TrackState::ResolvedFresh);
    assert_eq!(report.items[0].audio, AssetAction::Present);
    assert_eq!(report.items[0].cover, AssetAction::Downloaded);
    assert!(root.join("covers/AAA111.jpg").as_std_path().is_file());
}

#[test]
fn missing_audio_source_keeps_prior_entry() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("AAA111.mp3").as_std_path(), b"ID3").unwrap();
    let prior = LibraryEntry {
        cover_path: Some(root.join("covers/AAA111.jpg").to_string()),
        ..prior_entry(&root, "AAA111", "Known Song")
    };
    seed_manifest(&root, vec![prior.clone()]);
    let lookup = MockLookup::default().with_page(
        "spotify:track:AAA111",
        "<title>Renamed - Someone</title><div>no player</div>".to_string(),
    );
    let calls = lookup.calls.clone();

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &SyncOptions::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(report.items[0].state, TrackState::Failed);
    assert!(report.items[0].kept_cached);
    assert_eq!(manifest_entries(&root), vec![prior]);
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

#[test]
fn only_looked_up_tracks_report_resolving() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("AAA111.mp3").as_std_path(), b"ID3").unwrap();
    let snapshot = ManifestSnapshot::from_entries(vec![prior_entry(&root, "AAA111", "Cached")]);
    let app = App::new(
        LibraryStore::new(root.clone()),
        MetadataResolver::new(
            MockLookup::default()
                .with_page("spotify:track:BBB222", page("New", "Band", "BBB222")),
            ExtractionPlan::default(),
        ),
        AssetFetcher::new(MockAssets::default()),
    );
    let sink = RecordingSink::default();

    app.sync(
        &["spotify:track:AAA111".to_string(), "spotify:track:BBB222".to_string()],
        &snapshot,
        &SyncOptions::default(),
        &CancelFlag::new(),
        &sink,
    )
    .unwrap();

    let messages = sink.messages.into_inner().unwrap();
    assert!(messages.iter().any(|m| m == "track BBB222 state=resolving"));
    assert!(!messages.iter().any(|m| m == "track AAA111 state=resolving"));
}

#[test]
fn cancellation_keeps_unprocessed_prior_entries() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("BBB222.mp3").as_std_path(), b"ID3").unwrap();
    let prior_b = prior_entry(&root, "BBB222", "Old Song");
    seed_manifest(&root, vec![prior_b.clone()]);

    let cancel = CancelFlag::new();
    let lookup = MockLookup {
        cancel_after_first: Some(cancel.clone()),
        ..MockLookup::default()
    }
    .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111"));
    let calls = lookup.calls.clone();

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111", "spotify:track:BBB222"],
        &SyncOptions::default(),
        &cancel,
    )
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(*calls.lock().unwrap(), 1);
    let entries = manifest_entries(&root);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].title, "Song");
    assert_eq!(entries[1], prior_b);
}

#[test]
fn parallel_workers_preserve_input_order() {
    let (_temp, root) = library();
    let ids = ["AAA1", "BBB2", "CCC3", "DDD4", "EEE5", "FFF6"];
    let references: Vec<String> = ids.iter().map(|id| format!("spotify:track:{id}")).collect();
    let mut lookup = MockLookup::default();
    for (reference, id) in references.iter().zip(ids) {
        lookup = lookup.with_page(reference, page(&format!("Song {id}"), "Artist", id));
    }
    let options = SyncOptions {
        workers: 4,
        ..SyncOptions::default()
    };
    let refs: Vec<&str> = references.iter().map(String::as_str).collect();

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &refs,
        &options,
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.fresh, ids.len());
    let order: Vec<String> = manifest_entries(&root)
        .into_iter()
        .map(|entry| entry.id.to_string())
        .collect();
    assert_eq!(order, ids);
}

#[test]
fn checkpoint_writes_after_each_track() {
    for (checkpoint, expected) in [(true, vec![0, 1]), (false, vec![0, 0])] {
        let (_temp, root) = library();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let lookup = MockLookup {
            watch_manifest: Some(root.join("library.json")),
            seen_manifest_sizes: sizes.clone(),
            ..MockLookup::default()
        }
        .with_page("spotify:track:AAA111", page("A", "X", "AAA111"))
        .with_page("spotify:track:BBB222", page("B", "Y", "BBB222"));
        let options = SyncOptions {
            checkpoint,
            ..SyncOptions::default()
        };

        run(
            &root,
            lookup,
            MockAssets::default(),
            &["spotify:track:AAA111", "spotify:track:BBB222"],
            &options,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(*sizes.lock().unwrap(), expected);
        assert_eq!(manifest_entries(&root).len(), 2);
    }
}

#[test]
fn dry_run_touches_nothing() {
    let (_temp, root) = library();
    let lookup = MockLookup::default();
    let calls = lookup.calls.clone();
    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };

    let report = run(
        &root,
        lookup,
        MockAssets::default(),
        &["spotify:track:AAA111"],
        &options,
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.planned, 1);
    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(!root.as_std_path().exists());
}

#[test]
fn manifest_write_failure_aborts_run() {
    let (_temp, root) = library();
    fs::create_dir_all(root.join("library.json").as_std_path()).unwrap();
    let store = LibraryStore::new(root.clone());
    let app = App::new(
        store,
        MetadataResolver::new(
            MockLookup::default()
                .with_page("spotify:track:AAA111", page("Song", "Artist", "AAA111")),
            ExtractionPlan::default(),
        ),
        AssetFetcher::new(MockAssets::default()),
    );

    let result = app.sync(
        &["spotify:track:AAA111".to_string()],
        &ManifestSnapshot::empty(),
        &SyncOptions::default(),
        &CancelFlag::new(),
        &JsonOutput,
    );
    assert_matches!(result, Err(SyncError::ManifestIo { .. }));
}

#[test]
fn list_reports_disk_state() {
    let (_temp, root) = library();
    fs::create_dir_all(root.as_std_path()).unwrap();
    fs::write(root.join("AAA111.mp3").as_std_path(), b"ID3").unwrap();
    let snapshot = ManifestSnapshot::from_entries(vec![
        prior_entry(&root, "AAA111", "Here"),
        prior_entry(&root, "BBB222", "Gone"),
    ]);
    let app = App::new(
        LibraryStore::new(root.clone()),
        MetadataResolver::new(MockLookup::default(), ExtractionPlan::default()),
        AssetFetcher::new(MockAssets::default()),
    );

    let result = app.list(&snapshot);
    assert_eq!(result.tracks.len(), 2);
    assert!(result.tracks[0].audio_present);
    assert!(!result.tracks[1].audio_present);
    assert!(result.tracks[1].downloaded);
}
