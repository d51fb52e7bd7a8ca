/// Default final result count for queries.
pub const DEFAULT_LIMIT: usize = 10;

/// Hard ceiling on the final result count; requested limits are clamped.
pub const MAX_LIMIT: usize = 100;

/// Default vector-channel weight for hybrid fusion.
pub const DEFAULT_ALPHA: f64 = 0.7;

/// Reciprocal Rank Fusion dampening constant (standard value from the RRF paper).
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Minimum accepted query length in characters.
pub const MIN_QUERY_LEN: usize = 2;

/// Maximum accepted query length in characters.
pub const MAX_QUERY_LEN: usize = 1000;

/// Channel fan-out is the smallest multiple of this step that covers the limit.
pub const RETRIEVAL_POOL_STEP: usize = 64;

/// Default embedding dimension.
pub const EMBEDDING_DIMENSIONS: usize = 1024;

/// Default batch size for embedding calls.
pub const EMBEDDING_BATCH_SIZE: usize = 16;

/// Default chunk target size in characters.
pub const CHUNK_TARGET_CHARS: usize = 2000;

/// Default overlap between size-split chunks in characters.
pub const CHUNK_OVERLAP_CHARS: usize = 200;

/// Chunks shorter than this after trimming are discarded.
pub const CHUNK_MIN_CHARS: usize = 50;

/// Fallback language code when detection finds nothing.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Registry key for the fallback tokenizer configuration.
pub const DEFAULT_TOKENIZER_CONFIG: &str = "simple";

/// SQLite database file name.
pub const STATE_DB_FILE: &str = "state.db";

/// Lexical index directory name under the data dir.
pub const LEXICAL_INDEX_DIR: &str = "lexical";

/// Default data directory name under home.
pub const DEFAULT_DATA_DIR: &str = ".tessera";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = "tessera.toml";

/// Separator used when materializing tag ancestor paths.
pub const TAG_PATH_SEPARATOR: &str = " > ";

/// Cosine distance bound for the similar-queries diagnostic view.
pub const SIMILAR_QUERY_DISTANCE: f64 = 0.3;
