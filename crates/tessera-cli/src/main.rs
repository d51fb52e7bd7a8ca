mod commands;

use clap::{Parser, Subcommand};
use tessera_core::error::{IngestError, QueryError, StateError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tessera",
    version,
    about = "Hybrid retrieval search over a structured document corpus",
    long_about = "Tessera ingests documents, chunks them into sections, and indexes\n\
        each section for both dense-vector and multi-language full-text search.\n\
        Queries run both channels in parallel and fuse them with Reciprocal\n\
        Rank Fusion.\n\n\
        Quick start:\n  \
        tessera ingest ./notes.md\n  \
        tessera search \"rank fusion\"\n  \
        tessera stats"
)]
struct Cli {
    /// Enable verbose logging (set log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ./tessera.toml, then ~/.tessera/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a document from a URL or local path
    ///
    /// Chunks the document into sections, generates embeddings, and updates
    /// the lexical index. Re-ingesting the same URL replaces the document's
    /// sections atomically.
    ///
    /// Examples:
    ///   tessera ingest ./paper.md --tag ml --tag retrieval
    ///   tessera ingest https://example.com/guide --lang en --no-embed
    Ingest {
        /// URL or local file path
        source: String,

        /// Override the document title
        #[arg(long)]
        title: Option<String>,

        /// Document author
        #[arg(long)]
        author: Option<String>,

        /// ISO-639-1 language code (default: detected from content)
        #[arg(long)]
        lang: Option<String>,

        /// Publication date (ISO format)
        #[arg(long)]
        date: Option<String>,

        /// Skip embedding generation
        #[arg(long)]
        no_embed: bool,

        /// Tag to attach to every section (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Research topic id to link (repeatable)
        #[arg(long = "topic-id")]
        topic_ids: Vec<i64>,
    },
    /// Remove a document and everything derived from it
    Remove {
        /// Document id
        document_id: i64,
    },
    /// Search the corpus
    ///
    /// Examples:
    ///   tessera search "rank fusion"
    ///   tessera search "机器学习" --type fulltext --limit 5
    ///   tessera search "embeddings" --doc-id 3 --from 2024-01-01 --content
    Search {
        /// The query text; wrap in double quotes for a phrase query,
        /// use AND/OR/NOT and parentheses for advanced queries
        query: String,

        /// Search type: hybrid, vector, or fulltext
        #[arg(long = "type", default_value = "hybrid")]
        search_type: String,

        /// Final result count (1..=100)
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Vector-channel weight in [0,1]
        #[arg(long, default_value = "0.7")]
        alpha: f64,

        /// Language override for the lexical channel
        #[arg(long)]
        lang: Option<String>,

        /// Restrict to a document id (repeatable)
        #[arg(long = "doc-id")]
        doc_ids: Vec<i64>,

        /// Restrict to a tag id (repeatable)
        #[arg(long = "tag-id")]
        tag_ids: Vec<i64>,

        /// Only documents published on or after this date
        #[arg(long)]
        from: Option<String>,

        /// Only documents published on or before this date
        #[arg(long)]
        to: Option<String>,

        /// Attach section content to results
        #[arg(long)]
        content: bool,

        /// Attach document metadata to results
        #[arg(long)]
        metadata: bool,

        /// Page number over the fused list
        #[arg(long, default_value = "1")]
        page: usize,

        /// Results per page (default: limit)
        #[arg(long = "per-page")]
        per_page: Option<usize>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage research topics
    Topics {
        #[command(subcommand)]
        command: commands::topics::TopicCommands,
    },
    /// Corpus and query statistics
    Stats,
    /// Show recent search log entries
    Logs {
        /// Maximum entries to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Filter by search type: vector, fulltext, or hybrid
        #[arg(long = "type")]
        search_type: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_file = cli.config.as_deref().map(std::path::Path::new);

    let result = match cli.command {
        Commands::Ingest {
            source,
            title,
            author,
            lang,
            date,
            no_embed,
            tags,
            topic_ids,
        } => commands::ingest::run(
            config_file,
            &source,
            commands::ingest::IngestArgs {
                title,
                author,
                lang,
                date,
                no_embed,
                tags,
                topic_ids,
            },
        ),
        Commands::Remove { document_id } => commands::remove::run(config_file, document_id),
        Commands::Search {
            query,
            search_type,
            limit,
            alpha,
            lang,
            doc_ids,
            tag_ids,
            from,
            to,
            content,
            metadata,
            page,
            per_page,
            json,
        } => commands::search::run(
            config_file,
            &query,
            commands::search::SearchArgs {
                search_type,
                limit,
                alpha,
                lang,
                doc_ids,
                tag_ids,
                from,
                to,
                content,
                metadata,
                page,
                per_page,
                json,
            },
        ),
        Commands::Topics { command } => commands::topics::run(config_file, command),
        Commands::Stats => commands::stats::run(config_file),
        Commands::Logs { limit, search_type } => {
            commands::logs::run(config_file, limit, search_type.as_deref())
        }
    };

    if let Err(error) = result {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}

/// Map the error taxonomy onto the documented exit codes:
/// 2 invalid argument, 3 not found, 4 store/embedder error, 5 cancelled/timeout.
fn exit_code(error: &anyhow::Error) -> i32 {
    let kind = if let Some(e) = error.downcast_ref::<QueryError>() {
        e.kind()
    } else if let Some(e) = error.downcast_ref::<IngestError>() {
        e.kind()
    } else if let Some(e) = error.downcast_ref::<StateError>() {
        e.kind()
    } else {
        return 4;
    };
    exit_code_for_kind(kind)
}

fn exit_code_for_kind(kind: &str) -> i32 {
    match kind {
        "argument_error" | "query_parse_error" => 2,
        "not_found" => 3,
        "cancelled" | "timeout_error" => 5,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code_for_kind("argument_error"), 2);
        assert_eq!(exit_code_for_kind("query_parse_error"), 2);
        assert_eq!(exit_code_for_kind("not_found"), 3);
        assert_eq!(exit_code_for_kind("database_error"), 4);
        assert_eq!(exit_code_for_kind("embedding_generation_error"), 4);
        assert_eq!(exit_code_for_kind("timeout_error"), 5);
        assert_eq!(exit_code_for_kind("cancelled"), 5);
    }

    #[test]
    fn downcasting_recovers_error_kinds() {
        let err: anyhow::Error = QueryError::Timeout.into();
        assert_eq!(exit_code(&err), 5);

        let err: anyhow::Error = StateError::not_found("document", 7).into();
        assert_eq!(exit_code(&err), 3);

        let err: anyhow::Error = anyhow::anyhow!("opaque");
        assert_eq!(exit_code(&err), 4);
    }
}
