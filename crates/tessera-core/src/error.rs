use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the storage layer (SQLite, tantivy, vector index).
#[derive(Error, Debug)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("tantivy error: {0}")]
    Tantivy(String),

    #[error("fulltext search error: {0}")]
    Fulltext(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("tag move would create a cycle: tag {tag_id} under {new_parent_id}")]
    TagCycle { tag_id: i64, new_parent_id: i64 },

    #[error("schema migration required: current={current}, required={required}")]
    SchemaMigrationRequired { current: u32, required: u32 },

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// Convenience constructor for SQLite errors — use with `.map_err(StateError::sqlite)`.
    pub fn sqlite<E: std::fmt::Display>(e: E) -> Self {
        Self::Sqlite(e.to_string())
    }

    /// Convenience constructor for Tantivy errors — use with `.map_err(StateError::tantivy)`.
    pub fn tantivy<E: std::fmt::Display>(e: E) -> Self {
        Self::Tantivy(e.to_string())
    }

    /// Convenience constructor for lexical search failures.
    pub fn fulltext<E: std::fmt::Display>(e: E) -> Self {
        Self::Fulltext(e.to_string())
    }

    /// Convenience constructor for embedding provider failures.
    pub fn embedding<E: std::fmt::Display>(e: E) -> Self {
        Self::Embedding(e.to_string())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Machine-readable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "database_error",
            Self::Tantivy(_) => "database_error",
            Self::Fulltext(_) => "fulltext_search_error",
            Self::InvalidArgument(_) => "argument_error",
            Self::DimensionMismatch { .. } => "argument_error",
            Self::NotFound { .. } => "not_found",
            Self::TagCycle { .. } => "argument_error",
            Self::SchemaMigrationRequired { .. } => "database_error",
            Self::Embedding(_) => "embedding_generation_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Errors surfaced by the ingestion pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("converter error for {source_ref}: {message}")]
    Converter { source_ref: String, message: String },

    #[error("embedding generation failed: {0}")]
    EmbeddingGeneration(String),

    #[error("document processing failed for {source_ref}: {message}")]
    DocumentProcessing { source_ref: String, message: String },

    #[error("ingestion cancelled")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn converter(source_ref: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Converter {
            source_ref: source_ref.into(),
            message: message.to_string(),
        }
    }

    pub fn processing(source_ref: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::DocumentProcessing {
            source_ref: source_ref.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Converter { .. } => "converter_error",
            Self::EmbeddingGeneration(_) => "embedding_generation_error",
            Self::DocumentProcessing { .. } => "document_processing_error",
            Self::Cancelled => "cancelled",
            Self::State(e) => e.kind(),
            Self::Io(_) => "io_error",
        }
    }
}

/// Errors surfaced by the query pipeline.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Validation(String),

    #[error("query parse error: {0}")]
    Parse(String),

    #[error("query timed out")]
    Timeout,

    #[error("{channel} channel failed: {message}")]
    ChannelFailed { channel: &'static str, message: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl QueryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn channel(channel: &'static str, message: impl std::fmt::Display) -> Self {
        Self::ChannelFailed {
            channel,
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "argument_error",
            Self::Parse(_) => "query_parse_error",
            Self::Timeout => "timeout_error",
            Self::ChannelFailed { .. } => "channel_error",
            Self::State(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(StateError::sqlite("x").kind(), "database_error");
        assert_eq!(
            StateError::invalid_argument("query must not be empty").kind(),
            "argument_error"
        );
        assert_eq!(
            IngestError::EmbeddingGeneration("boom".into()).kind(),
            "embedding_generation_error"
        );
        assert_eq!(QueryError::Timeout.kind(), "timeout_error");
        assert_eq!(QueryError::validation("too short").kind(), "argument_error");
    }

    #[test]
    fn state_errors_pass_through_ingest_and_query_kinds() {
        let ingest: IngestError = StateError::not_found("document", 42).into();
        assert_eq!(ingest.kind(), "not_found");

        let query: QueryError = StateError::fulltext("index corrupt").into();
        assert_eq!(query.kind(), "fulltext_search_error");
    }
}
