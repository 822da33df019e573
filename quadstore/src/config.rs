//! Store configuration.
//!
//! A [`StoreConfig`] is built in code with [`StoreConfig::new`] and the
//! builder-style setters, or loaded from the environment with
//! [`StoreConfig::from_env`].
//!
//! # Environment Variables
//!
//! - `QUADSTORE_DATA_DIR`: directory holding the store files (required)
//! - `QUADSTORE_TRIPLE_INDEXES`: index permutations (default: `spoc,posc`)
//! - `QUADSTORE_VALUE_CACHE_SIZE`: id-to-term cache entries (default: `512`)
//! - `QUADSTORE_VALUE_ID_CACHE_SIZE`: term-to-id cache entries (default: `128`)
//! - `QUADSTORE_VALUE_EVICTION_INTERVAL_MS`: idle time before a cached term
//!   is swept (default: `60000`)
//! - `QUADSTORE_AUTO_GROW`: grow the page file on demand (default: `true`)
//! - `QUADSTORE_INITIAL_PAGES`: pages allocated for a new store (default: `64`)
//! - `QUADSTORE_ITERATION_CACHE_SYNC_THRESHOLD`: batch size of bulk removals
//!   (default: `10000`)
//! - `QUADSTORE_NODE_CACHE_SIZE`: soft cap on cached nodes (default: `4096`)
//! - `QUADSTORE_NODE_CACHE_MIN_RELEASED`: released nodes always kept
//!   (default: `64`)
//! - `QUADSTORE_LOCK_TIMEOUT_MS`: how long a commit waits for the writer slot
//!   (default: `10000`)
//! - `QUADSTORE_FORCE_SYNC`: force writes to stable storage at commit
//!   (default: `true`)
//!
//! # Invariants
//!
//! - `triple_indexes` is validated when the store opens, not when it is set.
//! - Sizes of 0 disable the corresponding term cache.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dictionary::{
    DEFAULT_VALUE_CACHE_SIZE, DEFAULT_VALUE_EVICTION_INTERVAL, DEFAULT_VALUE_ID_CACHE_SIZE,
    DictionaryOptions,
};
use crate::index::{DEFAULT_PERMUTATIONS, Permutation, parse_permutations};
use crate::storage::{DEFAULT_NODE_CACHE_MIN_RELEASED, DEFAULT_NODE_CACHE_SIZE, PagerOptions};

/// Tuning options of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding `quads.db`, `terms.dat`, `terms.idx` and
    /// `namespaces.dat`.
    pub data_dir: PathBuf,
    /// Comma separated index permutations, e.g. `spoc,posc`.
    pub triple_indexes: String,
    pub value_cache_size: usize,
    pub value_id_cache_size: usize,
    pub value_eviction_interval: Duration,
    pub auto_grow: bool,
    pub initial_pages: u64,
    /// Maximum number of quads a bulk removal holds in memory at once.
    pub iteration_cache_sync_threshold: usize,
    pub node_cache_size: usize,
    pub node_cache_min_released: usize,
    /// How long a commit waits for the writer slot.
    pub lock_timeout: Duration,
    pub force_sync: bool,
    /// Fanout override for index trees. Only small stores in tests set it.
    pub btree_fanout: Option<usize>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreConfig {
    pub const DEFAULT_INITIAL_PAGES: u64 = 64;
    pub const DEFAULT_ITERATION_CACHE_SYNC_THRESHOLD: usize = 10_000;
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Defaults for a store in `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            triple_indexes: DEFAULT_PERMUTATIONS.to_string(),
            value_cache_size: DEFAULT_VALUE_CACHE_SIZE,
            value_id_cache_size: DEFAULT_VALUE_ID_CACHE_SIZE,
            value_eviction_interval: DEFAULT_VALUE_EVICTION_INTERVAL,
            auto_grow: true,
            initial_pages: Self::DEFAULT_INITIAL_PAGES,
            iteration_cache_sync_threshold: Self::DEFAULT_ITERATION_CACHE_SYNC_THRESHOLD,
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
            node_cache_min_released: DEFAULT_NODE_CACHE_MIN_RELEASED,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            force_sync: true,
            btree_fanout: None,
        }
    }

    #[must_use]
    pub fn with_triple_indexes(mut self, indexes: &str) -> Self {
        indexes.clone_into(&mut self.triple_indexes);
        self
    }

    #[must_use]
    pub const fn with_value_cache_size(mut self, size: usize) -> Self {
        self.value_cache_size = size;
        self
    }

    #[must_use]
    pub const fn with_value_id_cache_size(mut self, size: usize) -> Self {
        self.value_id_cache_size = size;
        self
    }

    #[must_use]
    pub const fn with_value_eviction_interval(mut self, interval: Duration) -> Self {
        self.value_eviction_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_auto_grow(mut self, auto_grow: bool) -> Self {
        self.auto_grow = auto_grow;
        self
    }

    #[must_use]
    pub const fn with_initial_pages(mut self, pages: u64) -> Self {
        self.initial_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_iteration_cache_sync_threshold(mut self, threshold: usize) -> Self {
        self.iteration_cache_sync_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    #[must_use]
    pub const fn with_node_cache_min_released(mut self, count: usize) -> Self {
        self.node_cache_min_released = count;
        self
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }

    #[must_use]
    pub const fn with_btree_fanout(mut self, fanout: usize) -> Self {
        self.btree_fanout = Some(fanout);
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `QUADSTORE_DATA_DIR` is not set, or if any other
    /// variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any name-to-value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("QUADSTORE_DATA_DIR")
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("QUADSTORE_DATA_DIR".to_string()))?;
        let mut config = Self::new(data_dir);

        if let Some(indexes) = lookup("QUADSTORE_TRIPLE_INDEXES") {
            config.triple_indexes = indexes;
            config.permutations()?;
        }
        let parsed = |name: &str| lookup(name).map(|value| parse_value(name, &value)).transpose();
        if let Some(size) = parsed("QUADSTORE_VALUE_CACHE_SIZE")? {
            config.value_cache_size = size;
        }
        if let Some(size) = parsed("QUADSTORE_VALUE_ID_CACHE_SIZE")? {
            config.value_id_cache_size = size;
        }
        if let Some(ms) = lookup("QUADSTORE_VALUE_EVICTION_INTERVAL_MS") {
            config.value_eviction_interval =
                Duration::from_millis(parse_value("QUADSTORE_VALUE_EVICTION_INTERVAL_MS", &ms)?);
        }
        if let Some(value) = lookup("QUADSTORE_AUTO_GROW") {
            config.auto_grow = parse_bool("QUADSTORE_AUTO_GROW", &value)?;
        }
        if let Some(pages) = lookup("QUADSTORE_INITIAL_PAGES") {
            config.initial_pages = parse_value("QUADSTORE_INITIAL_PAGES", &pages)?;
        }
        if let Some(threshold) = parsed("QUADSTORE_ITERATION_CACHE_SYNC_THRESHOLD")? {
            if threshold == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "QUADSTORE_ITERATION_CACHE_SYNC_THRESHOLD".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.iteration_cache_sync_threshold = threshold;
        }
        if let Some(size) = parsed("QUADSTORE_NODE_CACHE_SIZE")? {
            config.node_cache_size = size;
        }
        if let Some(count) = parsed("QUADSTORE_NODE_CACHE_MIN_RELEASED")? {
            config.node_cache_min_released = count;
        }
        if let Some(ms) = lookup("QUADSTORE_LOCK_TIMEOUT_MS") {
            config.lock_timeout =
                Duration::from_millis(parse_value("QUADSTORE_LOCK_TIMEOUT_MS", &ms)?);
        }
        if let Some(value) = lookup("QUADSTORE_FORCE_SYNC") {
            config.force_sync = parse_bool("QUADSTORE_FORCE_SYNC", &value)?;
        }
        Ok(config)
    }

    /// The configured index permutations.
    pub fn permutations(&self) -> Result<Vec<Permutation>, ConfigError> {
        parse_permutations(&self.triple_indexes).map_err(|e| ConfigError::InvalidValue {
            name: "triple_indexes".to_string(),
            message: format!("'{}': {e}", self.triple_indexes),
        })
    }

    #[must_use]
    pub const fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            auto_grow: self.auto_grow,
            initial_pages: self.initial_pages,
            force_sync: self.force_sync,
        }
    }

    #[must_use]
    pub const fn dictionary_options(&self) -> DictionaryOptions {
        DictionaryOptions {
            value_cache_size: self.value_cache_size,
            value_id_cache_size: self.value_id_cache_size,
            eviction_interval: self.value_eviction_interval,
        }
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid non-negative integer"),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}
