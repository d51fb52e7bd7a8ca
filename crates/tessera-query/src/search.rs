use crate::channels::{ChannelContext, RankedHit, RetrievalChannel};
use crate::parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::cancel::CancelSignal;
use tessera_core::config::{Config, SearchConfig};
use tessera_core::constants::RETRIEVAL_POOL_STEP;
use crate::parser::detect_language;
use tessera_core::error::{QueryError, StateError};
use tessera_core::types::{Document, SearchFilters, SearchType};
use tessera_state::embedding::EmbeddingGateway;
use tessera_state::lexical_index::LexicalIndexSet;
use tessera_state::search_log::{self, NewSearchLog};
use tessera_state::tokenizers::TokenizerRegistry;
use tessera_state::{db, documents, filters, sections};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{debug, warn};

/// Options for one search; defaults follow the orchestrator contract.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub search_type: SearchType,
    pub limit: usize,
    pub alpha: f64,
    pub rrf_k: f64,
    pub language: Option<String>,
    pub filters: SearchFilters,
    pub include_content: bool,
    pub include_metadata: bool,
    pub page: usize,
    pub per_page: Option<usize>,
    /// Vector-channel minimum similarity.
    pub threshold: f64,
    /// Per-query deadline in milliseconds; None falls back to the
    /// configured timeout, 0 disables it.
    pub deadline_ms: Option<u64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_type: SearchType::Hybrid,
            limit: tessera_core::constants::DEFAULT_LIMIT,
            alpha: tessera_core::constants::DEFAULT_ALPHA,
            rrf_k: tessera_core::constants::DEFAULT_RRF_K,
            language: None,
            filters: SearchFilters::default(),
            include_content: false,
            include_metadata: false,
            page: 1,
            per_page: None,
            threshold: 0.0,
            deadline_ms: None,
        }
    }
}

/// Document fields attached to a hit when metadata enrichment is requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    pub language: String,
}

/// One result row in the final ranked list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub rank: usize,
    pub section_id: i64,
    pub document_id: i64,
    pub score: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub total_count: usize,
    pub execution_time_ms: i64,
    pub language: String,
    pub alpha: f64,
    pub text_result_count: usize,
    pub vector_result_count: usize,
    pub page: usize,
    pub per_page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub metadata: SearchMetadata,
}

/// External answer-phrasing contract.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, question: &str, passages: &[String]) -> Result<String, QueryError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub search: SearchResponse,
}

/// Shared handles for query execution. Channel tasks open their own SQLite
/// connections; tantivy indexes and the embedding gateway are shared.
pub struct SearchContext {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u32,
    pub cache_size: i32,
    pub lexical: Arc<LexicalIndexSet>,
    pub registry: Arc<TokenizerRegistry>,
    pub gateway: Arc<EmbeddingGateway>,
    pub search: SearchConfig,
}

impl SearchContext {
    pub fn from_config(config: &Config) -> Result<Self, StateError> {
        let conn = db::open_connection_with_config(
            &config.db_path(),
            config.storage.busy_timeout_ms,
            config.storage.cache_size,
        )?;
        tessera_state::schema::create_tables(&conn)?;
        let registry = TokenizerRegistry::load(&conn)?;
        let lexical = LexicalIndexSet::open(&config.lexical_index_root())?;
        let gateway = EmbeddingGateway::from_config(&config.embedding);
        Ok(Self {
            db_path: config.db_path(),
            busy_timeout_ms: config.storage.busy_timeout_ms,
            cache_size: config.storage.cache_size,
            lexical: Arc::new(lexical),
            registry: Arc::new(registry),
            gateway: Arc::new(gateway),
            search: config.search.clone(),
        })
    }

    pub fn open_connection(&self) -> Result<Connection, StateError> {
        db::open_connection_with_config(&self.db_path, self.busy_timeout_ms, self.cache_size)
    }
}

/// Channel fan-out: the smallest multiple of the pool step covering the limit.
pub fn retrieval_pool(limit: usize) -> usize {
    RETRIEVAL_POOL_STEP.max(RETRIEVAL_POOL_STEP * limit.div_ceil(RETRIEVAL_POOL_STEP))
}

/// One fused candidate before pagination.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub hit: RankedHit,
    pub score: f64,
    pub source: &'static str,
}

/// Reciprocal Rank Fusion over the two channel lists.
///
/// `score(s) = α·1/(k+rank_vec(s)) + (1−α)·1/(k+rank_txt(s))`, with a
/// missing channel contributing zero. Sorted by descending score, ties
/// broken by ascending section id, so the output is a total order.
pub fn rrf_fuse(
    vector_hits: &[RankedHit],
    lexical_hits: &[RankedHit],
    alpha: f64,
    k: f64,
) -> Vec<FusedHit> {
    struct Accumulator {
        hit: RankedHit,
        score: f64,
        in_vector: bool,
        in_lexical: bool,
    }

    let mut by_section: BTreeMap<i64, Accumulator> = BTreeMap::new();
    for (rank0, hit) in vector_hits.iter().enumerate() {
        let contribution = alpha / (k + (rank0 + 1) as f64);
        by_section
            .entry(hit.section_id)
            .and_modify(|acc| {
                acc.score += contribution;
                acc.in_vector = true;
            })
            .or_insert(Accumulator {
                hit: hit.clone(),
                score: contribution,
                in_vector: true,
                in_lexical: false,
            });
    }
    for (rank0, hit) in lexical_hits.iter().enumerate() {
        let contribution = (1.0 - alpha) / (k + (rank0 + 1) as f64);
        by_section
            .entry(hit.section_id)
            .and_modify(|acc| {
                acc.score += contribution;
                acc.in_lexical = true;
                if acc.hit.highlight.is_none() {
                    acc.hit.highlight = hit.highlight.clone();
                }
            })
            .or_insert(Accumulator {
                hit: hit.clone(),
                score: contribution,
                in_vector: false,
                in_lexical: true,
            });
    }

    let mut fused: Vec<FusedHit> = by_section
        .into_values()
        .map(|acc| FusedHit {
            source: match (acc.in_vector, acc.in_lexical) {
                (true, true) => "hybrid",
                (true, false) => "vector",
                _ => "fulltext",
            },
            hit: acc.hit,
            score: acc.score,
        })
        .collect();
    fused.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.hit.section_id.cmp(&right.hit.section_id))
    });
    fused
}

fn single_channel(hits: Vec<RankedHit>, source: &'static str) -> Vec<FusedHit> {
    hits.into_iter()
        .map(|hit| FusedHit {
            score: hit.score,
            hit,
            source,
        })
        .collect()
}

/// Execute a search: validate, detect language, run the channels in
/// parallel, fuse, paginate, enrich, and log.
pub async fn search(
    ctx: Arc<SearchContext>,
    query: &str,
    options: SearchOptions,
) -> Result<SearchResponse, QueryError> {
    let started = Instant::now();
    let query = query.trim().to_string();

    // Validation and parse failures are still logged (zero counts).
    if let Err(e) = parser::parse(
        &query,
        ctx.search.min_query_len,
        ctx.search.max_query_len,
    ) {
        log_best_effort(
            &ctx,
            &NewSearchLog {
                query: query.clone(),
                search_type: options.search_type,
                execution_time_ms: 0,
                results_count: 0,
                language: None,
                query_vector: None,
                section_ids: Vec::new(),
                filters: Some(options.filters.clone()),
            },
        );
        return Err(e);
    }

    let limit = options.limit.clamp(1, tessera_core::constants::MAX_LIMIT);
    let alpha = options.alpha.clamp(0.0, 1.0);
    let rrf_k = if options.rrf_k > 0.0 {
        options.rrf_k
    } else {
        tessera_core::constants::DEFAULT_RRF_K
    };
    let page = options.page.max(1);
    let per_page = options.per_page.unwrap_or(limit).max(1);
    let pool = retrieval_pool(limit);
    let language = options
        .language
        .clone()
        .map(|code| tessera_core::language::normalize_language_code(&code))
        .unwrap_or_else(|| detect_language(&query).to_string());

    let cancel = CancelSignal::new();
    let deadline_ms = options.deadline_ms.unwrap_or(ctx.search.timeout_ms);
    let deadline = (deadline_ms > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_millis(deadline_ms));

    // Filters resolve once; both channels share the allowed set.
    let allowed_sections = {
        let ctx = ctx.clone();
        let query_filters = options.filters.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<HashSet<i64>>, QueryError> {
            let conn = ctx.open_connection()?;
            Ok(filters::resolve_allowed_sections(&conn, &query_filters)?)
        })
        .await
        .map_err(|e| QueryError::channel("filter", e))??
    };

    let run_lexical = matches!(options.search_type, SearchType::Fulltext | SearchType::Hybrid);
    let run_vector = matches!(options.search_type, SearchType::Vector | SearchType::Hybrid);

    // Both channels are spawned before either is awaited.
    let lexical_handle: Option<JoinHandle<Result<Vec<RankedHit>, QueryError>>> =
        run_lexical.then(|| {
            let ctx = ctx.clone();
            let query = query.clone();
            let language = language.clone();
            let allowed = allowed_sections.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let conn = ctx.open_connection()?;
                let channel = RetrievalChannel::Lexical {
                    query_text: query,
                    language,
                };
                channel.search(
                    &ChannelContext {
                        conn: &conn,
                        lexical: &ctx.lexical,
                        registry: &ctx.registry,
                        dimensions: ctx.gateway.dimensions(),
                        min_query_len: ctx.search.min_query_len,
                        max_query_len: ctx.search.max_query_len,
                    },
                    pool,
                    allowed.as_ref(),
                    &cancel,
                )
            })
        });

    type VectorOutcome = Result<(Vec<RankedHit>, Vec<f32>), QueryError>;
    let vector_handle: Option<JoinHandle<VectorOutcome>> = run_vector.then(|| {
        let ctx = ctx.clone();
        let query = query.clone();
        let allowed = allowed_sections.clone();
        let cancel = cancel.clone();
        let threshold = options.threshold;
        tokio::task::spawn_blocking(move || {
            // Embed the query once, then query the vector index.
            let query_vector = ctx.gateway.embed_one(&query, &cancel)?;
            let conn = ctx.open_connection()?;
            let channel = RetrievalChannel::Vector {
                query_vector: query_vector.clone(),
                threshold,
            };
            let hits = channel.search(
                &ChannelContext {
                    conn: &conn,
                    lexical: &ctx.lexical,
                    registry: &ctx.registry,
                    dimensions: ctx.gateway.dimensions(),
                    min_query_len: ctx.search.min_query_len,
                    max_query_len: ctx.search.max_query_len,
                },
                pool,
                allowed.as_ref(),
                &cancel,
            )?;
            Ok((hits, query_vector))
        })
    });

    let (lexical_outcome, vector_outcome) = tokio::join!(
        await_channel(lexical_handle, deadline, &cancel),
        await_channel(vector_handle, deadline, &cancel),
    );

    let mut metadata_error = None;
    let mut query_vector = None;
    let mut vector_hits: Vec<RankedHit> = Vec::new();
    let mut lexical_hits: Vec<RankedHit> = Vec::new();

    let fused: Vec<FusedHit> = match options.search_type {
        SearchType::Fulltext => {
            let outcome = lexical_outcome.unwrap_or(Err(QueryError::Timeout));
            lexical_hits = outcome?;
            single_channel(lexical_hits.clone(), "fulltext")
        }
        SearchType::Vector => {
            let outcome = vector_outcome.unwrap_or(Err(QueryError::Timeout));
            let (hits, vector) = outcome?;
            query_vector = Some(vector);
            vector_hits = hits;
            single_channel(vector_hits.clone(), "vector")
        }
        SearchType::Hybrid => {
            let lexical = lexical_outcome.unwrap_or(Err(QueryError::Timeout));
            let vector = vector_outcome.unwrap_or(Err(QueryError::Timeout));
            match (vector, lexical) {
                (Ok((v_hits, vector)), Ok(l_hits)) => {
                    query_vector = Some(vector);
                    vector_hits = v_hits;
                    lexical_hits = l_hits;
                    rrf_fuse(&vector_hits, &lexical_hits, alpha, rrf_k)
                }
                (Ok((v_hits, vector)), Err(lexical_err)) => {
                    warn!(error = %lexical_err, "lexical channel failed; degrading to vector-only");
                    metadata_error = Some(lexical_err.to_string());
                    query_vector = Some(vector);
                    vector_hits = v_hits;
                    single_channel(vector_hits.clone(), "vector")
                }
                (Err(vector_err), Ok(l_hits)) => {
                    warn!(error = %vector_err, "vector channel failed; degrading to lexical-only");
                    metadata_error = Some(vector_err.to_string());
                    lexical_hits = l_hits;
                    single_channel(lexical_hits.clone(), "fulltext")
                }
                (Err(vector_err), Err(lexical_err)) => {
                    // No channel produced results before the deadline.
                    if matches!(vector_err, QueryError::Timeout)
                        || matches!(lexical_err, QueryError::Timeout)
                    {
                        return Err(QueryError::Timeout);
                    }
                    metadata_error =
                        Some(format!("vector: {vector_err}; fulltext: {lexical_err}"));
                    Vec::new()
                }
            }
        }
    };

    let total_count = fused.len();
    let offset = (page - 1) * per_page;
    let final_hits: Vec<FusedHit> = fused
        .into_iter()
        .skip(offset)
        .take(per_page.min(limit))
        .collect();

    debug!(
        query = %query,
        total_count,
        returned = final_hits.len(),
        language = %language,
        "search complete"
    );

    // Enrichment and logging share one blocking hop.
    let response = {
        let ctx = ctx.clone();
        let query = query.clone();
        let filters_snapshot = options.filters.clone();
        let include_content = options.include_content;
        let include_metadata = options.include_metadata;
        let search_type = options.search_type;
        let language = language.clone();
        let text_result_count = lexical_hits.len();
        let vector_result_count = vector_hits.len();
        let execution_time_ms = started.elapsed().as_millis() as i64;
        tokio::task::spawn_blocking(move || -> Result<SearchResponse, QueryError> {
            let conn = ctx.open_connection()?;
            let mut results = Vec::with_capacity(final_hits.len());
            for (index, fused_hit) in final_hits.into_iter().enumerate() {
                results.push(enrich_hit(
                    &conn,
                    fused_hit,
                    index + 1,
                    include_content,
                    include_metadata,
                )?);
            }

            search_log::record(
                &conn,
                &NewSearchLog {
                    query: query.clone(),
                    search_type,
                    execution_time_ms,
                    results_count: results.len() as i64,
                    language: Some(language.clone()),
                    query_vector,
                    section_ids: results.iter().map(|hit| hit.section_id).collect(),
                    filters: Some(filters_snapshot),
                },
            );

            Ok(SearchResponse {
                query,
                results,
                metadata: SearchMetadata {
                    total_count,
                    execution_time_ms,
                    language,
                    alpha,
                    text_result_count,
                    vector_result_count,
                    page,
                    per_page,
                    error: metadata_error,
                },
            })
        })
        .await
        .map_err(|e| QueryError::channel("response", e))??
    };

    Ok(response)
}

/// Run the search and phrase an answer from the top passages.
pub async fn answer(
    ctx: Arc<SearchContext>,
    question: &str,
    mut options: SearchOptions,
    summarizer: &dyn Summarizer,
) -> Result<AnswerResponse, QueryError> {
    options.include_content = true;
    let search_response = search(ctx, question, options).await?;
    let passages: Vec<String> = search_response
        .results
        .iter()
        .filter_map(|hit| hit.content.clone())
        .collect();
    let answer = summarizer.summarize(question, &passages)?;
    Ok(AnswerResponse {
        answer,
        search: search_response,
    })
}

fn log_best_effort(ctx: &SearchContext, entry: &NewSearchLog) {
    match ctx.open_connection() {
        Ok(conn) => search_log::record(&conn, entry),
        Err(e) => warn!(error = %e, "could not open connection for search log"),
    }
}

async fn await_channel<T>(
    handle: Option<JoinHandle<Result<T, QueryError>>>,
    deadline: Option<tokio::time::Instant>,
    cancel: &CancelSignal,
) -> Option<Result<T, QueryError>> {
    let handle = handle?;
    let joined = match deadline {
        Some(deadline) => match timeout_at(deadline, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // Deadline hit: make the straggler observe cancellation.
                cancel.cancel();
                return Some(Err(QueryError::Timeout));
            }
        },
        None => handle.await,
    };
    Some(match joined {
        Ok(inner) => inner,
        Err(join_error) => Err(QueryError::channel("task", join_error)),
    })
}

fn enrich_hit(
    conn: &Connection,
    fused: FusedHit,
    rank: usize,
    include_content: bool,
    include_metadata: bool,
) -> Result<SearchHit, QueryError> {
    let content = if include_content {
        sections::get(conn, fused.hit.section_id)?.map(|section| section.content)
    } else {
        None
    };
    let document = if include_metadata {
        documents::get(conn, fused.hit.document_id)?.map(document_info)
    } else {
        None
    };
    Ok(SearchHit {
        rank,
        section_id: fused.hit.section_id,
        document_id: fused.hit.document_id,
        score: fused.score,
        source: fused.source.to_string(),
        section_title: fused.hit.section_title,
        highlight: fused.hit.highlight,
        content,
        document,
    })
}

fn document_info(document: Document) -> DocumentInfo {
    DocumentInfo {
        title: document.title,
        url: document.url,
        author: document.author,
        publication_date: document.publication_date,
        language: document.language,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(section_id: i64) -> RankedHit {
        RankedHit {
            section_id,
            document_id: 1,
            section_title: None,
            language: "en".into(),
            score: 1.0,
            highlight: None,
        }
    }

    #[test]
    fn retrieval_pool_steps_by_64() {
        assert_eq!(retrieval_pool(1), 64);
        assert_eq!(retrieval_pool(10), 64);
        assert_eq!(retrieval_pool(64), 64);
        assert_eq!(retrieval_pool(65), 128);
        assert_eq!(retrieval_pool(100), 128);
    }

    #[test]
    fn rrf_matches_the_worked_example() {
        // Vector ranks [A,B,C]; text ranks [B,C,D]; k=60, alpha=0.5.
        let vector = vec![hit(1), hit(2), hit(3)]; // A=1, B=2, C=3
        let lexical = vec![hit(2), hit(3), hit(4)]; // B, C, D=4
        let fused = rrf_fuse(&vector, &lexical, 0.5, 60.0);

        let order: Vec<i64> = fused.iter().map(|f| f.hit.section_id).collect();
        assert_eq!(order, vec![2, 3, 1, 4]); // B, C, A, D

        let score_of = |id: i64| {
            fused
                .iter()
                .find(|f| f.hit.section_id == id)
                .map(|f| f.score)
                .unwrap()
        };
        assert!((score_of(1) - 0.5 / 61.0).abs() < 1e-9);
        assert!((score_of(2) - (0.5 / 62.0 + 0.5 / 61.0)).abs() < 1e-9);
        assert!((score_of(3) - (0.5 / 63.0 + 0.5 / 62.0)).abs() < 1e-9);
        assert!((score_of(4) - 0.5 / 63.0).abs() < 1e-9);
    }

    #[test]
    fn rrf_alpha_zero_is_lexical_order() {
        let vector = vec![hit(10), hit(20)];
        let lexical = vec![hit(30), hit(20), hit(40)];
        let fused = rrf_fuse(&vector, &lexical, 0.0, 60.0);
        let order: Vec<i64> = fused
            .iter()
            .filter(|f| f.score > 0.0)
            .map(|f| f.hit.section_id)
            .collect();
        assert_eq!(order, vec![30, 20, 40]);
    }

    #[test]
    fn rrf_alpha_one_is_vector_order() {
        let vector = vec![hit(10), hit(20)];
        let lexical = vec![hit(30), hit(20)];
        let fused = rrf_fuse(&vector, &lexical, 1.0, 60.0);
        let order: Vec<i64> = fused
            .iter()
            .filter(|f| f.score > 0.0)
            .map(|f| f.hit.section_id)
            .collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn rrf_ties_break_by_ascending_section_id() {
        // Two sections each appearing only in one channel at the same rank:
        // identical scores, so the smaller id wins.
        let vector = vec![hit(99)];
        let lexical = vec![hit(7)];
        let fused = rrf_fuse(&vector, &lexical, 0.5, 60.0);
        assert_eq!(fused[0].hit.section_id, 7);
        assert_eq!(fused[1].hit.section_id, 99);
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
    }

    #[test]
    fn rrf_emits_no_duplicates() {
        let vector = vec![hit(1), hit(2)];
        let lexical = vec![hit(2), hit(1)];
        let fused = rrf_fuse(&vector, &lexical, 0.5, 60.0);
        let mut ids: Vec<i64> = fused.iter().map(|f| f.hit.section_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), fused.len());
        assert!(fused.iter().all(|f| f.source == "hybrid"));
    }

    #[test]
    fn rrf_output_is_sorted_strictly() {
        let vector: Vec<RankedHit> = (1i64..=20).map(hit).collect();
        let lexical: Vec<RankedHit> = (10i64..=30).map(hit).collect();
        let fused = rrf_fuse(&vector, &lexical, 0.7, 60.0);
        for pair in fused.windows(2) {
            let ordered = pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score
                    && pair[0].hit.section_id < pair[1].hit.section_id);
            assert!(ordered, "fused list not strictly ordered");
        }
    }

    #[test]
    fn single_channel_preserves_order_and_source() {
        let hits = vec![hit(5), hit(3)];
        let fused = single_channel(hits, "vector");
        assert_eq!(fused[0].hit.section_id, 5);
        assert_eq!(fused[1].hit.section_id, 3);
        assert!(fused.iter().all(|f| f.source == "vector"));
    }
}
