use crate::parser;
use rusqlite::Connection;
use std::collections::HashSet;
use tantivy::TantivyDocument;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::snippet::SnippetGenerator;
use tantivy::Term;
use tessera_core::cancel::CancelSignal;
use tessera_core::error::{QueryError, StateError};
use tessera_state::lexical_index::LexicalIndexSet;
use tessera_state::tokenizers::TokenizerRegistry;
use tessera_state::vector_index::{self, VectorSearch};
use tracing::debug;

/// One hit from a single retrieval channel, rank-ordered by channel score.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub section_id: i64,
    pub document_id: i64,
    pub section_title: Option<String>,
    pub language: String,
    /// Channel-native score: BM25 relevance or cosine similarity.
    pub score: f64,
    pub highlight: Option<String>,
}

/// Shared read handles a channel needs to execute.
pub struct ChannelContext<'a> {
    pub conn: &'a Connection,
    pub lexical: &'a LexicalIndexSet,
    pub registry: &'a TokenizerRegistry,
    pub dimensions: usize,
    pub min_query_len: usize,
    pub max_query_len: usize,
}

/// The two retrieval paths the orchestrator composes over.
pub enum RetrievalChannel {
    Vector {
        query_vector: Vec<f32>,
        threshold: f64,
    },
    Lexical {
        query_text: String,
        language: String,
    },
}

impl RetrievalChannel {
    /// Execute the channel. Hits come back ordered best-first; the filter
    /// set (when present) is applied before the limit.
    pub fn search(
        &self,
        ctx: &ChannelContext<'_>,
        limit: usize,
        allowed_sections: Option<&HashSet<i64>>,
        cancel: &CancelSignal,
    ) -> Result<Vec<RankedHit>, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Timeout);
        }
        match self {
            Self::Vector {
                query_vector,
                threshold,
            } => vector_search(ctx, query_vector, *threshold, limit, allowed_sections),
            Self::Lexical {
                query_text,
                language,
            } => lexical_search(ctx, query_text, language, limit, allowed_sections, cancel),
        }
    }
}

fn vector_search(
    ctx: &ChannelContext<'_>,
    query_vector: &[f32],
    threshold: f64,
    limit: usize,
    allowed_sections: Option<&HashSet<i64>>,
) -> Result<Vec<RankedHit>, QueryError> {
    let matches = vector_index::search(
        ctx.conn,
        &VectorSearch {
            query_vector: query_vector.to_vec(),
            limit,
            threshold,
            allowed_sections: allowed_sections.cloned(),
        },
        ctx.dimensions,
    )?;
    Ok(matches
        .into_iter()
        .map(|hit| RankedHit {
            section_id: hit.section_id,
            document_id: hit.document_id,
            section_title: hit.section_title,
            language: hit.language,
            score: hit.similarity,
            highlight: None,
        })
        .collect())
}

/// Lexical channel body: resolve the tokenizer config, emit and compile the
/// store-native query, execute with a language filter, snippet each hit.
fn lexical_search(
    ctx: &ChannelContext<'_>,
    query_text: &str,
    language: &str,
    limit: usize,
    allowed_sections: Option<&HashSet<i64>>,
    cancel: &CancelSignal,
) -> Result<Vec<RankedHit>, QueryError> {
    let config_name = ctx.registry.lookup(ctx.conn, language)?;
    let parsed = parser::parse(query_text, ctx.min_query_len, ctx.max_query_len)?;
    let expr = parser::emit(&parsed, &config_name)?;
    debug!(expr = %expr, language, "lexical query emitted");

    let index = ctx.lexical.index_for(&config_name)?;
    let fields = ctx.lexical.fields(&index)?;
    let compiled = parser::compile(&expr, &index, &fields)?;

    let final_query: Box<dyn Query> = Box::new(BooleanQuery::new(vec![
        (Occur::Must, compiled),
        (
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_text(fields.language, language),
                IndexRecordOption::Basic,
            )),
        ),
    ]));

    let reader = index.reader().map_err(StateError::tantivy)?;
    let searcher = reader.searcher();
    // Over-fetch when a filter is in play so post-filtering can still fill
    // the requested pool.
    let fetch = if allowed_sections.is_some() {
        (limit * 4).clamp(limit, 1024)
    } else {
        limit
    };
    let top_docs = searcher
        .search(&final_query, &TopDocs::with_limit(fetch))
        .map_err(|e| StateError::fulltext(e.to_string()))?;

    if cancel.is_cancelled() {
        return Err(QueryError::Timeout);
    }

    let snippets = SnippetGenerator::create(&searcher, &*final_query, fields.content)
        .map_err(|e| StateError::fulltext(e.to_string()))
        .ok();

    let mut hits = Vec::new();
    for (score, address) in top_docs {
        if hits.len() >= limit {
            break;
        }
        let stored: TantivyDocument = searcher
            .doc(address)
            .map_err(|e| StateError::fulltext(e.to_string()))?;
        let section_id: i64 = stored
            .get_first(fields.section_id)
            .and_then(|value| value.as_str())
            .and_then(|text| text.parse().ok())
            .unwrap_or(0);
        if section_id <= 0 {
            continue;
        }
        if let Some(allowed) = allowed_sections
            && !allowed.contains(&section_id)
        {
            continue;
        }
        // The relational store is the source of truth: a lexical document
        // whose section row is gone is invisible to readers.
        let Some(section) = tessera_state::sections::get(ctx.conn, section_id)? else {
            continue;
        };

        let highlight = snippets
            .as_ref()
            .map(|generator| generator.snippet_from_doc(&stored).to_html())
            .filter(|html| !html.is_empty());

        hits.push(RankedHit {
            section_id,
            document_id: section.document_id,
            section_title: section.title,
            language: language.to_string(),
            score: score as f64,
            highlight,
        });
    }
    Ok(hits)
}
