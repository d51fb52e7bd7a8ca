use crate::constants;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// HTTP endpoint of the external embedding provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// API key for the provider; usually injected via TESSERA_EMBEDDING_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_embedding_cache_capacity")]
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_chunk_target")]
    pub target_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_chars: usize,
    #[serde(default = "default_heading_levels")]
    pub heading_levels: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_min_query_len")]
    pub min_query_len: usize,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    /// Minimum cosine similarity for vector-channel hits.
    #[serde(default)]
    pub similarity_threshold: f64,
    /// Per-query deadline; 0 disables the deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional LLM endpoint for answer phrasing.
    #[serde(default)]
    pub llm_endpoint: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,
}

fn default_data_dir() -> String {
    format!("~/{}", constants::DEFAULT_DATA_DIR)
}
fn default_busy_timeout() -> u32 {
    5000
}
fn default_cache_size() -> i32 {
    -64000
}
fn default_embedding_model() -> String {
    "text-embedding-default".into()
}
fn default_embedding_dimensions() -> usize {
    constants::EMBEDDING_DIMENSIONS
}
fn default_embedding_batch_size() -> usize {
    constants::EMBEDDING_BATCH_SIZE
}
fn default_embedding_max_retries() -> u32 {
    3
}
fn default_embedding_retry_base_ms() -> u64 {
    1000
}
fn default_embedding_cache_capacity() -> usize {
    4096
}
fn default_chunk_target() -> usize {
    constants::CHUNK_TARGET_CHARS
}
fn default_chunk_overlap() -> usize {
    constants::CHUNK_OVERLAP_CHARS
}
fn default_heading_levels() -> Vec<u8> {
    vec![1, 2, 3]
}
fn default_limit() -> usize {
    constants::DEFAULT_LIMIT
}
fn default_alpha() -> f64 {
    constants::DEFAULT_ALPHA
}
fn default_rrf_k() -> f64 {
    constants::DEFAULT_RRF_K
}
fn default_min_query_len() -> usize {
    constants::MIN_QUERY_LEN
}
fn default_max_query_len() -> usize {
    constants::MAX_QUERY_LEN
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            batch_size: default_embedding_batch_size(),
            max_retries: default_embedding_max_retries(),
            retry_base_ms: default_embedding_retry_base_ms(),
            cache_capacity: default_embedding_cache_capacity(),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_chars: default_chunk_target(),
            overlap_chars: default_chunk_overlap(),
            heading_levels: default_heading_levels(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            alpha: default_alpha(),
            rrf_k: default_rrf_k(),
            min_query_len: default_min_query_len(),
            max_query_len: default_max_query_len(),
            similarity_threshold: 0.0,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            llm_endpoint: None,
            llm_api_key: None,
        }
    }
}

impl Config {
    /// Load configuration with layered precedence:
    /// 1. Explicit config file (from `--config`, highest priority)
    /// 2. Project config: `<root>/tessera.toml`
    /// 3. Global config: `~/.tessera/config.toml`
    /// 4. Built-in defaults (lowest priority)
    pub fn load(root: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_file(root, None)
    }

    /// Load configuration with an explicit config file path as the top layer.
    pub fn load_with_file(
        root: Option<&Path>,
        config_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        // Start with an empty TOML value and layer each file onto it so only
        // explicitly-set fields override lower layers.
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if let Some(home) = dirs::home_dir() {
            let global_path = home.join(constants::DEFAULT_DATA_DIR).join("config.toml");
            if global_path.exists() {
                let raw = load_toml_value(&global_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(root) = root {
            let project_path = root.join(constants::PROJECT_CONFIG_FILE);
            if project_path.exists() {
                let raw = load_toml_value(&project_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(cf) = config_file {
            if !cf.exists() {
                return Err(ConfigError::NotFound {
                    path: cf.display().to_string(),
                });
            }
            let raw = load_toml_value(cf)?;
            merge_toml_values(&mut merged, &raw);
        }

        let config_str =
            toml::to_string(&merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        apply_env_overrides(&mut config);
        config.normalize();

        if config.embedding.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding.dimensions".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(config)
    }

    /// Clamp out-of-range values instead of failing; warn once per field.
    fn normalize(&mut self) {
        if !(0.0..=1.0).contains(&self.search.alpha) {
            warn!(
                alpha = self.search.alpha,
                "search.alpha outside [0,1], clamping"
            );
            self.search.alpha = self.search.alpha.clamp(0.0, 1.0);
        }
        if self.search.default_limit == 0 || self.search.default_limit > constants::MAX_LIMIT {
            warn!(
                limit = self.search.default_limit,
                "search.default_limit outside 1..=100, clamping"
            );
            self.search.default_limit = self.search.default_limit.clamp(1, constants::MAX_LIMIT);
        }
        if self.search.min_query_len == 0 {
            self.search.min_query_len = default_min_query_len();
        }
        if self.search.max_query_len < self.search.min_query_len {
            warn!("search.max_query_len below min_query_len, restoring defaults");
            self.search.max_query_len = default_max_query_len();
        }
        if self.embedding.batch_size == 0 {
            self.embedding.batch_size = default_embedding_batch_size();
        }
        if self.chunker.target_chars < constants::CHUNK_MIN_CHARS {
            warn!(
                target = self.chunker.target_chars,
                "chunker.target_chars too small, restoring default"
            );
            self.chunker.target_chars = default_chunk_target();
        }
        if self.chunker.heading_levels.is_empty() {
            self.chunker.heading_levels = default_heading_levels();
        }
        self.chunker.heading_levels.retain(|level| (1..=6u8).contains(level));
        self.storage.data_dir = expand_tilde(&self.storage.data_dir);
    }

    /// Resolve the on-disk data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    /// SQLite database path under the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(constants::STATE_DB_FILE)
    }

    /// Root directory of the per-config lexical indexes.
    pub fn lexical_index_root(&self) -> PathBuf {
        self.data_dir().join(constants::LEXICAL_INDEX_DIR)
    }
}

fn load_toml_value(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    content
        .parse::<toml::Value>()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Deep-merge `overlay` into `base`. Only keys present in `overlay` are written.
fn merge_toml_values(base: &mut toml::Value, overlay: &toml::Value) {
    if let (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) = (base, overlay) {
        for (key, overlay_val) in overlay_map {
            if let Some(base_val) = base_map.get_mut(key) {
                if base_val.is_table() && overlay_val.is_table() {
                    merge_toml_values(base_val, overlay_val);
                } else {
                    *base_val = overlay_val.clone();
                }
            } else {
                base_map.insert(key.clone(), overlay_val.clone());
            }
        }
    }
}

/// Environment overrides, convention `TESSERA_<SECTION>_<KEY>`.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("TESSERA_STORAGE_DATA_DIR") {
        config.storage.data_dir = v;
    }
    if let Ok(v) = std::env::var("TESSERA_EMBEDDING_ENDPOINT") {
        config.embedding.endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("TESSERA_EMBEDDING_API_KEY") {
        config.embedding.api_key = Some(v);
    }
    if let Ok(v) = std::env::var("TESSERA_EMBEDDING_DIMENSIONS")
        && let Ok(n) = v.parse()
    {
        config.embedding.dimensions = n;
    }
    if let Ok(v) = std::env::var("TESSERA_LLM_ENDPOINT") {
        config.logging.llm_endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("TESSERA_LLM_API_KEY") {
        config.logging.llm_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("TESSERA_LOG_LEVEL") {
        config.logging.level = v;
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.search.default_limit, 10);
        assert_eq!(config.search.alpha, 0.7);
        assert_eq!(config.search.rrf_k, 60.0);
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.chunker.target_chars, 2000);
        assert_eq!(config.chunker.heading_levels, vec![1, 2, 3]);
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            "[search]\nalpha = 0.4\n[embedding]\ndimensions = 384\n",
        )
        .unwrap();

        let config = Config::load_with_file(None, Some(&path)).unwrap();
        assert_eq!(config.search.alpha, 0.4);
        assert_eq!(config.embedding.dimensions, 384);
        // Untouched fields keep defaults.
        assert_eq!(config.search.default_limit, 10);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[search]\nalpha = 3.5\ndefault_limit = 5000\n").unwrap();

        let config = Config::load_with_file(None, Some(&path)).unwrap();
        assert_eq!(config.search.alpha, 1.0);
        assert_eq!(config.search.default_limit, 100);
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let err = Config::load_with_file(None, Some(Path::new("/nonexistent/t.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dims.toml");
        std::fs::write(&path, "[embedding]\ndimensions = 0\n").unwrap();
        let err = Config::load_with_file(None, Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn invalid_heading_levels_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("levels.toml");
        std::fs::write(&path, "[chunker]\nheading_levels = [1, 2, 9]\n").unwrap();

        let config = Config::load_with_file(None, Some(&path)).unwrap();
        assert_eq!(config.chunker.heading_levels, vec![1, 2]);
    }
}
