use anyhow::Result;
use std::path::Path;
use tessera_ingest::converter::DefaultConverter;
use tessera_ingest::pipeline::Pipeline;

pub fn run(config_file: Option<&Path>, document_id: i64) -> Result<()> {
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
    pipeline.remove_document(document_id)?;
    println!("Removed document {document_id}");
    Ok(())
}
