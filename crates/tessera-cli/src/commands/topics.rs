use anyhow::Result;
use clap::Subcommand;
use std::path::Path;
use tessera_core::types::SearchType;
use tessera_query::search::{self, SearchOptions};
use tessera_state::topics;

#[derive(Subcommand)]
pub enum TopicCommands {
    /// Create a research topic
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List all topics
    List,
    /// Update a topic's name or description
    Update {
        topic_id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a topic (links go with it, documents stay)
    Delete { topic_id: i64 },
    /// Link every section of a document to a topic
    AddDoc { topic_id: i64, document_id: i64 },
    /// Unlink a document's sections from a topic
    RemoveDoc { topic_id: i64, document_id: i64 },
    /// Recommend sections for a topic via hybrid search
    Recommend {
        topic_id: i64,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

pub fn run(config_file: Option<&Path>, command: TopicCommands) -> Result<()> {
    let (_config, ctx) = super::load_context(config_file)?;
    let conn = ctx.open_connection()?;

    match command {
        TopicCommands::Create { name, description } => {
            let topic = topics::create(&conn, &name, description.as_deref())?;
            println!("Created topic {} ({})", topic.id, topic.name);
        }
        TopicCommands::List => {
            let all = topics::list(&conn)?;
            if all.is_empty() {
                println!("No topics.");
                return Ok(());
            }
            for topic in all {
                let linked = topics::section_ids(&conn, topic.id)?.len();
                println!(
                    "{:<6} {:<30} {:<4} sections  {}",
                    topic.id,
                    topic.name,
                    linked,
                    topic.description.as_deref().unwrap_or("")
                );
            }
        }
        TopicCommands::Update {
            topic_id,
            name,
            description,
        } => {
            let topic = topics::update(&conn, topic_id, name.as_deref(), description.as_deref())?;
            println!("Updated topic {} ({})", topic.id, topic.name);
        }
        TopicCommands::Delete { topic_id } => {
            topics::delete(&conn, topic_id)?;
            println!("Deleted topic {topic_id}");
        }
        TopicCommands::AddDoc {
            topic_id,
            document_id,
        } => {
            let linked = topics::link_document(&conn, topic_id, document_id)?;
            println!("Linked {linked} sections of document {document_id} to topic {topic_id}");
        }
        TopicCommands::RemoveDoc {
            topic_id,
            document_id,
        } => {
            let unlinked = topics::unlink_document(&conn, topic_id, document_id)?;
            println!(
                "Unlinked {unlinked} sections of document {document_id} from topic {topic_id}"
            );
        }
        TopicCommands::Recommend { topic_id, limit } => {
            let topic = topics::get(&conn, topic_id)?.ok_or_else(|| {
                tessera_core::error::StateError::not_found("research_topic", topic_id)
            })?;
            let already_linked = topics::section_ids(&conn, topic_id)?;

            let query = match &topic.description {
                Some(description) => format!("{} {}", topic.name, description),
                None => topic.name.clone(),
            };
            let options = SearchOptions {
                search_type: SearchType::Hybrid,
                limit: limit.min(100),
                ..Default::default()
            };
            let runtime = tokio::runtime::Runtime::new()?;
            let response = runtime.block_on(search::search(ctx, &query, options))?;

            let suggestions: Vec<_> = response
                .results
                .iter()
                .filter(|hit| !already_linked.contains(&hit.section_id))
                .collect();
            if suggestions.is_empty() {
                println!("No new sections to recommend for topic {}", topic.name);
                return Ok(());
            }
            println!("Recommended sections for topic {}:", topic.name);
            for hit in suggestions {
                println!(
                    "  section {} (doc {}) {:<40} score {:.5}",
                    hit.section_id,
                    hit.document_id,
                    hit.section_title.as_deref().unwrap_or("-"),
                    hit.score
                );
            }
        }
    }
    Ok(())
}
