use anyhow::Result;
use std::path::Path;
use tessera_core::cancel::CancelSignal;
use tessera_ingest::converter::DefaultConverter;
use tessera_ingest::pipeline::{IngestOptions, Pipeline};

pub struct IngestArgs {
    pub title: Option<String>,
    pub author: Option<String>,
    pub lang: Option<String>,
    pub date: Option<String>,
    pub no_embed: bool,
    pub tags: Vec<String>,
    pub topic_ids: Vec<i64>,
}

pub fn run(config_file: Option<&Path>, source: &str, args: IngestArgs) -> Result<()> {
    let (config, ctx) = super::load_context(config_file)?;
    let conn = ctx.open_connection()?;
    let converter = DefaultConverter::new();
    let pipeline = Pipeline {
        conn: &conn,
        lexical: &ctx.lexical,
        registry: &ctx.registry,
        gateway: &ctx.gateway,
        converter: &converter,
        chunker: config.chunker.clone(),
    };

    let options = IngestOptions {
        title: args.title,
        author: args.author,
        language: args.lang,
        publication_date: args.date,
        description: None,
        generate_embeddings: !args.no_embed,
        tags: args.tags,
        topic_ids: args.topic_ids,
    };

    let report = pipeline.ingest(source, &options, &CancelSignal::new())?;
    println!(
        "Ingested document {} ({} sections, {} embedded, language {})",
        report.document_id, report.section_count, report.embedded_count, report.language
    );
    Ok(())
}
