//! Configuration for the similarity index engine.
//!
//! Layered the usual way:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `MODSIM_` and use double
//! underscores to separate nested levels:
//! - `MODSIM_INDEX_DIR=/srv/indexes` sets `index_dir`
//! - `MODSIM_BUILD__MAX_LISTS=64` sets `build.max_lists`
//! - `MODSIM_QUERY__SEARCH_BREADTH=4` sets `query.search_breadth`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::DEFAULT_EMBED_BATCH_SIZE;
use crate::posts::{DEFAULT_K, DEFAULT_SEARCH_BREADTH};
use crate::vector::{
    DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_LISTS, DEFAULT_SEED, DuplicatePolicy, IndexBuilder,
    IndexStore,
};

/// Directory name searched for while walking up from the working directory.
const WORKSPACE_DIR: &str = ".modsim";

/// Per-user data directory shared with the moderation backend.
const HOME_DIR: &str = ".reddit-auto-mod";

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding one subdirectory of index generations per subreddit
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Upper bound on inverted lists per index
    #[serde(default = "default_max_lists")]
    pub max_lists: usize,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// k-means++ seed
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Posts embedded per model call
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "default_k")]
    pub k: usize,

    #[serde(default = "default_search_breadth", alias = "nprobe")]
    pub search_breadth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// fastembed model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Where downloaded model files live; fastembed's default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub show_download_progress: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_index_dir() -> PathBuf {
    home_data_dir().join("indexes")
}
fn default_max_lists() -> usize {
    DEFAULT_MAX_LISTS
}
fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_embed_batch_size() -> usize {
    DEFAULT_EMBED_BATCH_SIZE
}
fn default_k() -> usize {
    DEFAULT_K
}
fn default_search_breadth() -> usize {
    DEFAULT_SEARCH_BREADTH
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

fn home_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(HOME_DIR))
        .unwrap_or_else(|| PathBuf::from(HOME_DIR))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_dir: default_index_dir(),
            debug: false,
            build: BuildConfig::default(),
            query: QueryConfig::default(),
            embedding: EmbeddingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_lists: default_max_lists(),
            max_iterations: default_max_iterations(),
            seed: default_seed(),
            duplicate_policy: DuplicatePolicy::default(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            search_breadth: default_search_breadth(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            cache_dir: None,
            show_download_progress: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from the discovered config file, if any.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration with `path` as the file layer. A missing file only
    /// contributes nothing.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore becomes a dot, single underscores stay
            .merge(Env::prefixed("MODSIM_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                settings.index_dir = expand_home(&settings.index_dir);
                settings
            })
    }

    /// Config file to use: `.modsim/settings.toml` in the working directory
    /// or an ancestor, else the per-user file.
    pub fn config_path() -> PathBuf {
        Self::find_workspace_config().unwrap_or_else(|| home_data_dir().join(SETTINGS_FILE))
    }

    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(WORKSPACE_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(SETTINGS_FILE))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a commented settings file at `path`.
    pub fn init_config_file(path: &Path, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        if !force && path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# modsim configuration

# Version of the configuration schema
version = 1

# Directory holding one index file pair per subreddit
index_dir = "{index_dir}"

debug = false

[build]
# Upper bound on inverted lists per index (nlist = min(max_lists, posts))
max_lists = {max_lists}

# k-means iteration cap and seed
max_iterations = {max_iterations}
seed = {seed}

# What to do with a repeated submission id: "reject" or "last_write_wins"
duplicate_policy = "reject"

# Posts embedded per model call
embed_batch_size = {batch}

[query]
# Neighbors returned per query
k = {k}

# Inverted lists probed per query (nprobe)
search_breadth = {breadth}

[embedding]
# fastembed model name
model = "AllMiniLML6V2"

# Model download directory (fastembed default when unset)
# cache_dir = "~/.reddit-auto-mod/models"

show_download_progress = false

[logging]
# Used when RUST_LOG is not set
level = "info"
"#,
            index_dir = default_index_dir().display(),
            max_lists = DEFAULT_MAX_LISTS,
            max_iterations = DEFAULT_MAX_ITERATIONS,
            seed = DEFAULT_SEED,
            batch = default_embed_batch_size(),
            k = DEFAULT_K,
            breadth = DEFAULT_SEARCH_BREADTH,
        );

        std::fs::write(path, template)?;
        Ok(path.to_path_buf())
    }

    /// Index builder configured from `[build]`.
    pub fn index_builder(&self) -> IndexBuilder {
        IndexBuilder::new()
            .with_max_lists(self.build.max_lists)
            .with_max_iterations(self.build.max_iterations)
            .with_seed(self.build.seed)
            .with_duplicate_policy(self.build.duplicate_policy)
    }

    pub fn index_store(&self) -> IndexStore {
        IndexStore::new(&self.index_dir)
    }
}

/// Expands a leading `~/` against the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
