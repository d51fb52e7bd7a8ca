pub mod ingest;
pub mod logs;
pub mod remove;
pub mod search;
pub mod stats;
pub mod topics;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tessera_core::config::Config;
use tessera_query::search::SearchContext;

/// Load config and build the shared search context every command starts from.
pub fn load_context(config_file: Option<&Path>) -> Result<(Config, Arc<SearchContext>)> {
    let root = std::env::current_dir().ok();
    let config = Config::load_with_file(root.as_deref(), config_file)?;
    let ctx = SearchContext::from_config(&config)?;
    Ok((config, Arc::new(ctx)))
}
