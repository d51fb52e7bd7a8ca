use anyhow::Result;
use std::path::Path;
use tessera_core::error::QueryError;
use tessera_core::types::SearchType;
use tessera_state::search_log;

pub fn run(config_file: Option<&Path>, limit: usize, search_type: Option<&str>) -> Result<()> {
    let (_config, ctx) = super::load_context(config_file)?;
    let conn = ctx.open_connection()?;

    let entries = match search_type {
        Some(raw) => {
            let parsed = SearchType::parse(raw).ok_or_else(|| {
                QueryError::validation(format!(
                    "invalid search type: {raw} (expected hybrid, vector, or fulltext)"
                ))
            })?;
            search_log::by_type(&conn, parsed, limit)?
        }
        None => search_log::recent(&conn, limit)?,
    };

    if entries.is_empty() {
        println!("No log entries.");
        return Ok(());
    }

    println!(
        "{:<20} {:<9} {:<8} {:<8} {:<6} QUERY",
        "CREATED", "TYPE", "TIME_MS", "RESULTS", "LANG"
    );
    println!("{}", "-".repeat(80));
    for entry in entries {
        println!(
            "{:<20} {:<9} {:<8} {:<8} {:<6} {}",
            entry.created_at,
            entry.search_type,
            entry.execution_time_ms,
            entry.results_count,
            entry.language.as_deref().unwrap_or("-"),
            entry.query
        );
    }
    Ok(())
}
