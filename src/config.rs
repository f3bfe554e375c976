use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::extract::DEFAULT_COVER_SELECTORS;
use crate::store::MANIFEST_FILE;

pub const CONFIG_FILE: &str = "tracksync.json";
pub const DEFAULT_LIBRARY_ROOT: &str = "music";
pub const DEFAULT_REFERENCES: &str = "data/url.txt";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub library_root: Option<String>,
    #[serde(default)]
    pub references: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub lookup: LookupSection,
    #[serde(default)]
    pub assets: AssetSection,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub checkpoint: Option<bool>,
    #[serde(default)]
    pub cover_selectors: Option<Vec<String>>,
    #[serde(default)]
    pub gallery: GallerySection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LookupSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub query_param: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AssetSection {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GallerySection {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub library_root: Option<String>,
    pub references: Option<String>,
    pub manifest: Option<String>,
    pub endpoint: Option<String>,
    pub workers: Option<usize>,
    pub interval_ms: Option<u64>,
    pub no_checkpoint: bool,
    pub gallery_dir: Option<String>,
    pub gallery_output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub endpoint: Option<String>,
    pub query_param: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub timeout: Duration,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GalleryConfig {
    pub dir: Utf8PathBuf,
    pub output: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub library_root: Utf8PathBuf,
    pub references: Utf8PathBuf,
    pub manifest: Utf8PathBuf,
    pub lookup: LookupConfig,
    pub assets: AssetConfig,
    pub workers: usize,
    pub checkpoint: bool,
    pub cover_selectors: Vec<String>,
    pub gallery: GalleryConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `tracksync.json` in the working directory, or the per-user config
    /// file. Only an explicit path is required to exist.
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let config = match path {
            Some(path) => Self::read(&PathBuf::from(path))?,
            None => match Self::default_location() {
                Some(found) => Self::read(&found)?,
                None => Config::default(),
            },
        };
        Self::resolve_config(config, overrides)
    }

    fn default_location() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "tracksync")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    fn read(path: &PathBuf) -> Result<Config, SyncError> {
        let content = fs::read_to_string(path).map_err(|_| SyncError::ConfigRead(path.clone()))?;
        serde_json::from_str(&content).map_err(|err| SyncError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let library_root = Utf8PathBuf::from(
            overrides
                .library_root
                .or(config.library_root)
                .unwrap_or_else(|| DEFAULT_LIBRARY_ROOT.to_string()),
        );
        let references = Utf8PathBuf::from(
            overrides
                .references
                .or(config.references)
                .unwrap_or_else(|| DEFAULT_REFERENCES.to_string()),
        );
        let manifest = overrides
            .manifest
            .or(config.manifest)
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| library_root.join(MANIFEST_FILE));

        let workers = overrides.workers.or(config.workers).unwrap_or(1);
        if workers == 0 {
            return Err(SyncError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        let endpoint = overrides
            .endpoint
            .or(config.lookup.endpoint)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let lookup = LookupConfig {
            endpoint,
            query_param: config
                .lookup
                .query_param
                .unwrap_or_else(|| "url".to_string()),
            user_agent: config
                .lookup
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout: Duration::from_secs(config.lookup.timeout_secs.unwrap_or(30)),
            min_interval: Duration::from_millis(
                overrides
                    .interval_ms
                    .or(config.lookup.min_interval_ms)
                    .unwrap_or(1500),
            ),
        };
        let assets = AssetConfig {
            timeout: Duration::from_secs(config.assets.timeout_secs.unwrap_or(120)),
            min_interval: Duration::from_millis(config.assets.min_interval_ms.unwrap_or(0)),
        };

        let cover_selectors = config
            .cover_selectors
            .filter(|selectors| !selectors.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_COVER_SELECTORS
                    .iter()
                    .map(|selector| selector.to_string())
                    .collect()
            });

        let gallery = GalleryConfig {
            dir: Utf8PathBuf::from(
                overrides
                    .gallery_dir
                    .or(config.gallery.dir)
                    .unwrap_or_else(|| "gallery".to_string()),
            ),
            output: Utf8PathBuf::from(
                overrides
                    .gallery_output
                    .or(config.gallery.output)
                    .unwrap_or_else(|| "gallery.json".to_string()),
            ),
        };

        Ok(ResolvedConfig {
            library_root,
            references,
            manifest,
            lookup,
            assets,
            workers,
            checkpoint: !overrides.no_checkpoint && config.checkpoint.unwrap_or(true),
            cover_selectors,
            gallery,
        })
    }
}
