use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `STAGEPASS__` and optional TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub experiments: ExperimentDefaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Store backend selector; `memory` is the development default.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    pub url: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_experiment_ttl_secs")]
    pub experiment_ttl_secs: u64,
    #[serde(default = "default_flag_ttl_secs")]
    pub flag_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

/// Defaults applied to experiment settings when a create request leaves
/// them unset.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentDefaults {
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_minimum_detectable_effect")]
    pub minimum_detectable_effect: f64,
    #[serde(default = "default_max_duration_hours")]
    pub max_duration_hours: u32,
}

// Default functions
fn default_node_id() -> String {
    "backoffice-01".to_string()
}
fn default_store_backend() -> String {
    "memory".to_string()
}
fn default_namespace() -> String {
    "stagepass".to_string()
}
fn default_experiment_ttl_secs() -> u64 {
    60
}
fn default_flag_ttl_secs() -> u64 {
    30
}
fn default_cache_max_entries() -> usize {
    100_000
}
fn default_min_sample_size() -> u64 {
    1000
}
fn default_confidence_level() -> f64 {
    95.0
}
fn default_minimum_detectable_effect() -> f64 {
    5.0
}
fn default_max_duration_hours() -> u32 {
    720
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: None,
            namespace: default_namespace(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            experiment_ttl_secs: default_experiment_ttl_secs(),
            flag_ttl_secs: default_flag_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            confidence_level: default_confidence_level(),
            minimum_detectable_effect: default_minimum_detectable_effect(),
            max_duration_hours: default_max_duration_hours(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            experiments: ExperimentDefaults::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("STAGEPASS")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
