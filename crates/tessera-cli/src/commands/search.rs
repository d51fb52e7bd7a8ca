use anyhow::Result;
use std::path::Path;
use tessera_core::error::QueryError;
use tessera_core::types::{SearchFilters, SearchType};
use tessera_query::search::{self, SearchOptions};

pub struct SearchArgs {
    pub search_type: String,
    pub limit: usize,
    pub alpha: f64,
    pub lang: Option<String>,
    pub doc_ids: Vec<i64>,
    pub tag_ids: Vec<i64>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub content: bool,
    pub metadata: bool,
    pub page: usize,
    pub per_page: Option<usize>,
    pub json: bool,
}

pub fn run(config_file: Option<&Path>, query: &str, args: SearchArgs) -> Result<()> {
    let (config, ctx) = super::load_context(config_file)?;

    let search_type = SearchType::parse(&args.search_type).ok_or_else(|| {
        QueryError::validation(format!(
            "invalid search type: {} (expected hybrid, vector, or fulltext)",
            args.search_type
        ))
    })?;

    let options = SearchOptions {
        search_type,
        limit: args.limit,
        alpha: args.alpha,
        rrf_k: config.search.rrf_k,
        language: args.lang,
        filters: SearchFilters {
            document_ids: args.doc_ids,
            tag_ids: args.tag_ids,
            date_from: args.from,
            date_to: args.to,
        },
        include_content: args.content || args.json,
        include_metadata: args.metadata || args.json,
        page: args.page,
        per_page: args.per_page,
        threshold: config.search.similarity_threshold,
        deadline_ms: None,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let response = runtime.block_on(search::search(ctx, query, options))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!(
        "Results: {} of {} (language {}, {} ms)",
        response.results.len(),
        response.metadata.total_count,
        response.metadata.language,
        response.metadata.execution_time_ms
    );
    if let Some(error) = &response.metadata.error {
        println!("Degraded: {error}");
    }
    println!();

    if response.results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!(
        "{:<6} {:<10} {:<8} {:<40} {:<10} {:<8}",
        "RANK", "SECTION", "DOC", "TITLE", "SOURCE", "SCORE"
    );
    println!("{}", "-".repeat(86));
    for hit in &response.results {
        let title = hit.section_title.as_deref().unwrap_or("-");
        let title = if title.chars().count() > 38 {
            let truncated: String = title.chars().take(37).collect();
            format!("{truncated}…")
        } else {
            title.to_string()
        };
        println!(
            "{:<6} {:<10} {:<8} {:<40} {:<10} {:<8.5}",
            hit.rank, hit.section_id, hit.document_id, title, hit.source, hit.score
        );
    }

    if args.content {
        for hit in &response.results {
            if let Some(content) = &hit.content {
                println!();
                println!("── section {} ──", hit.section_id);
                println!("{content}");
            }
        }
    }

    Ok(())
}
