use anyhow::Result;
use std::path::Path;
use tessera_state::{db, documents, search_log, sections, tags, topics, vector_index};

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let (_config, ctx) = super::load_context(config_file)?;
    let conn = ctx.open_connection()?;

    let (healthy, detail) = db::check_sqlite_health(&conn)?;
    if !healthy {
        println!(
            "Store health: DEGRADED ({})",
            detail.unwrap_or_else(|| "unknown".into())
        );
    }

    println!("Corpus");
    let by_state = documents::count_by_state(&conn)?;
    let total_docs: i64 = by_state.iter().map(|(_, count)| count).sum();
    println!("  documents: {total_docs}");
    for (state, count) in by_state {
        println!("    {}: {}", state.as_str(), count);
    }
    println!("  sections: {}", sections::count_all(&conn)?);
    println!("  embeddings: {}", vector_index::count(&conn)?);
    println!("  lexical documents: {}", ctx.lexical.doc_count()?);
    println!("  tags: {}", tags::count(&conn)?);
    println!("  topics: {}", topics::count(&conn)?);

    let languages = documents::language_distribution(&conn)?;
    if !languages.is_empty() {
        println!();
        println!("Languages");
        for (language, count) in languages {
            println!("  {language}: {count}");
        }
    }

    println!();
    println!("Queries");
    println!("  logged: {}", search_log::count(&conn)?);
    for (search_type, average_ms) in search_log::average_execution_time(&conn)? {
        println!("  {search_type}: avg {average_ms:.1} ms");
    }
    let popular = search_log::popular_since_hours(&conn, 24, 5)?;
    if !popular.is_empty() {
        println!("  popular (24h):");
        for (query, uses) in popular {
            println!("    {uses}x {query}");
        }
    }

    Ok(())
}
