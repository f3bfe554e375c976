use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use tracksync::app::{App, CancelFlag, SyncOptions};
use tracksync::assets::{AssetClient, AssetFetcher, HttpAssetClient};
use tracksync::config::{ConfigLoader, ConfigOverrides, ResolvedConfig};
use tracksync::error::SyncError;
use tracksync::extract::ExtractionPlan;
use tracksync::gallery;
use tracksync::lookup::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, HttpLookupClient, LookupClient, LookupSettings,
    MetadataResolver,
};
use tracksync::manifest::ManifestSnapshot;
use tracksync::output::{HumanOutput, JsonOutput, OutputMode, TracingSink};
use tracksync::pacing::RequestPacer;
use tracksync::references::ReferenceList;
use tracksync::store::LibraryStore;

#[derive(Parser)]
#[command(name = "tracksync")]
#[command(about = "Sync a list of track references into a local music library and manifest")]
#[command(version)]
struct Cli {
    /// Config file (default: ./tracksync.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    library_root: Option<String>,

    #[arg(long, global = true)]
    manifest: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve references, download assets and rewrite the manifest")]
    Sync(SyncArgs),
    #[command(about = "Show manifest entries and their on-disk state")]
    List,
    #[command(about = "Write the gallery image listing")]
    Gallery(GalleryArgs),
}

#[derive(Args, Clone, Default)]
struct SyncArgs {
    /// Reference list, one track URL or URI per line
    #[arg(long)]
    references: Option<String>,

    /// Lookup service endpoint
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    /// Minimum milliseconds between lookup requests
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Only write the manifest once, at the end of the run
    #[arg(long)]
    no_checkpoint: bool,

    /// Report decisions without network requests or writes
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone, Default)]
struct GalleryArgs {
    #[arg(long)]
    dir: Option<String>,

    #[arg(long)]
    output: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingLookupEndpoint
        | SyncError::InvalidConfig(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::ManifestParse { .. }
        | SyncError::InvalidReference(_) => 2,
        err if err.is_metadata_fetch() || err.is_asset_download() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tracksync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Sync(SyncArgs::default()));

    let mut overrides = ConfigOverrides {
        library_root: cli.library_root,
        manifest: cli.manifest,
        ..ConfigOverrides::default()
    };
    match &command {
        Commands::Sync(args) => {
            overrides.references = args.references.clone();
            overrides.endpoint = args.endpoint.clone();
            overrides.workers = args.workers;
            overrides.interval_ms = args.interval_ms;
            overrides.no_checkpoint = args.no_checkpoint;
        }
        Commands::Gallery(args) => {
            overrides.gallery_dir = args.dir.clone();
            overrides.gallery_output = args.output.clone();
        }
        Commands::List => {}
    }
    let config = ConfigLoader::resolve(cli.config.as_deref(), overrides)?;

    match command {
        Commands::Sync(args) => run_sync(&config, args.dry_run, output_mode),
        Commands::List => run_list(&config, output_mode),
        Commands::Gallery(_) => run_gallery(&config, output_mode),
    }
}

fn run_sync(config: &ResolvedConfig, dry_run: bool, output_mode: OutputMode) -> miette::Result<()> {
    let store = LibraryStore::with_manifest(config.library_root.clone(), config.manifest.clone());
    let snapshot = ManifestSnapshot::load(store.manifest_path())?;
    let references = ReferenceList::load(&config.references)?;
    let plan = ExtractionPlan::new(config.cover_selectors.as_slice())?;
    let options = SyncOptions {
        dry_run,
        workers: config.workers,
        checkpoint: config.checkpoint,
    };

    if dry_run {
        let app = App::new(
            store,
            MetadataResolver::new(NopLookup, plan),
            AssetFetcher::new(NopAssets),
        );
        return finish_sync(&app, &references, &snapshot, &options, output_mode);
    }

    let endpoint = config
        .lookup
        .endpoint
        .clone()
        .ok_or(SyncError::MissingLookupEndpoint)?;
    let lookup_pacer = Arc::new(RequestPacer::new(config.lookup.min_interval));
    let asset_pacer = Arc::new(RequestPacer::new(config.assets.min_interval));
    let lookup = HttpLookupClient::new(
        LookupSettings {
            endpoint,
            query_param: config.lookup.query_param.clone(),
            user_agent: config.lookup.user_agent.clone(),
            timeout: config.lookup.timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        },
        lookup_pacer,
    )?;
    let assets = HttpAssetClient::new(
        &config.lookup.user_agent,
        config.assets.timeout,
        asset_pacer,
    )?;
    let app = App::new(
        store,
        MetadataResolver::new(lookup, plan),
        AssetFetcher::new(assets),
    );
    finish_sync(&app, &references, &snapshot, &options, output_mode)
}

fn finish_sync<L: LookupClient, A: AssetClient>(
    app: &App<L, A>,
    references: &ReferenceList,
    snapshot: &ManifestSnapshot,
    options: &SyncOptions,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let cancel = CancelFlag::new();
    match output_mode {
        OutputMode::Json => {
            let report = app.sync(
                &references.references,
                snapshot,
                options,
                &cancel,
                &JsonOutput,
            )?;
            JsonOutput::print_sync(&report).into_diagnostic()
        }
        OutputMode::Human => {
            let report = app.sync(
                &references.references,
                snapshot,
                options,
                &cancel,
                &TracingSink,
            )?;
            HumanOutput::print_sync(&report).into_diagnostic()
        }
    }
}

fn run_list(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let store = LibraryStore::with_manifest(config.library_root.clone(), config.manifest.clone());
    let snapshot = ManifestSnapshot::load(store.manifest_path())?;
    let app = App::new(
        store,
        MetadataResolver::new(NopLookup, ExtractionPlan::default()),
        AssetFetcher::new(NopAssets),
    );
    let result = app.list(&snapshot);
    match output_mode {
        OutputMode::Json => JsonOutput::print_list(&result).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_list(&result).into_diagnostic(),
    }
}

fn run_gallery(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let result = gallery::generate(&config.gallery.dir, &config.gallery.output)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_gallery(&result).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_gallery(&result).into_diagnostic(),
    }
}

struct NopLookup;
struct NopAssets;

impl LookupClient for NopLookup {
    fn fetch(&self, reference: &str) -> Result<String, SyncError> {
        Err(SyncError::MetadataHttp {
            reference: reference.to_string(),
            message: "lookup client not configured".to_string(),
        })
    }
}

impl AssetClient for NopAssets {
    fn download(&self, url: &str, _destination: &std::path::Path) -> Result<u64, SyncError> {
        Err(SyncError::AssetHttp {
            url: url.to_string(),
            message: "asset client not configured".to_string(),
        })
    }
}
