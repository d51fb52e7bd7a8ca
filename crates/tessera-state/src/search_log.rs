use crate::vector_index::{cosine_similarity, l2_norm, parse_vector};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, OnceLock};
use tessera_core::error::StateError;
use tessera_core::time::now_iso8601;
use tessera_core::types::{SearchFilters, SearchType};
use tracing::warn;

/// One query about to be logged.
#[derive(Debug, Clone)]
pub struct NewSearchLog {
    pub query: String,
    pub search_type: SearchType,
    pub execution_time_ms: i64,
    pub results_count: i64,
    pub language: Option<String>,
    pub query_vector: Option<Vec<f32>>,
    pub section_ids: Vec<i64>,
    pub filters: Option<SearchFilters>,
}

/// One persisted log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchLogEntry {
    pub id: i64,
    pub query: String,
    pub search_type: String,
    pub execution_time_ms: i64,
    pub results_count: i64,
    pub language: Option<String>,
    pub query_vector: Option<String>,
    pub section_ids: Vec<i64>,
    pub created_at: String,
}

static LAST_TIMESTAMP: OnceLock<Mutex<String>> = OnceLock::new();

/// Next log timestamp, clamped so rows within this process never go backwards.
fn monotonic_timestamp() -> String {
    let cell = LAST_TIMESTAMP.get_or_init(|| Mutex::new(String::new()));
    let now = now_iso8601();
    match cell.lock() {
        Ok(mut last) => {
            if now > *last {
                *last = now;
            }
            last.clone()
        }
        Err(_) => now,
    }
}

/// Write one log row. Failures never propagate to the surrounding query.
pub fn record(conn: &Connection, entry: &NewSearchLog) {
    if let Err(e) = try_record(conn, entry) {
        warn!(error = %e, query = %entry.query, "search log write failed");
    }
}

fn try_record(conn: &Connection, entry: &NewSearchLog) -> Result<(), StateError> {
    let vector_text = entry
        .query_vector
        .as_deref()
        .map(crate::vector_index::format_vector);
    let section_ids_json =
        serde_json::to_string(&entry.section_ids).map_err(StateError::sqlite)?;
    let filters_json = match &entry.filters {
        Some(filters) if !filters.is_empty() => {
            Some(serde_json::to_string(filters).map_err(StateError::sqlite)?)
        }
        _ => None,
    };

    conn.execute(
        "INSERT INTO search_logs
         (query, search_type, execution_time_ms, results_count, language,
          query_vector, section_ids, filters, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.query,
            entry.search_type.as_str(),
            entry.execution_time_ms,
            entry.results_count,
            entry.language,
            vector_text,
            section_ids_json,
            filters_json,
            monotonic_timestamp(),
        ],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Most recent entries, newest first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<SearchLogEntry>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_LOG} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_entry)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

/// Most recent entries of one search type, newest first.
pub fn by_type(
    conn: &Connection,
    search_type: SearchType,
    limit: usize,
) -> Result<Vec<SearchLogEntry>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_LOG} WHERE search_type = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![search_type.as_str(), limit as i64], row_to_entry)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

/// Query strings by frequency over a rolling window.
pub fn popular_since_hours(
    conn: &Connection,
    hours: u32,
    limit: usize,
) -> Result<Vec<(String, i64)>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT query, COUNT(*) AS uses FROM search_logs
             WHERE created_at >= datetime('now', ?1)
             GROUP BY query
             ORDER BY uses DESC, query
             LIMIT ?2",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(
            params![format!("-{hours} hours"), limit as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

/// Average execution time in milliseconds, grouped by search type.
pub fn average_execution_time(conn: &Connection) -> Result<Vec<(String, f64)>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT search_type, AVG(execution_time_ms) FROM search_logs
             GROUP BY search_type ORDER BY search_type",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

/// Diagnostic view: logged queries whose stored vector lies within the given
/// cosine distance of `query_vector`.
pub fn similar_queries(
    conn: &Connection,
    query_vector: &[f32],
    max_distance: f64,
    limit: usize,
) -> Result<Vec<(SearchLogEntry, f64)>, StateError> {
    if query_vector.is_empty() {
        return Err(StateError::invalid_argument("query vector must not be empty"));
    }
    let query_norm = l2_norm(query_vector);

    let mut stmt = conn
        .prepare(&format!("{SELECT_LOG} WHERE query_vector IS NOT NULL"))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], row_to_entry)
        .map_err(StateError::sqlite)?;

    let mut matches = Vec::new();
    for row in rows {
        let entry = row.map_err(StateError::sqlite)?;
        let Some(vector_text) = entry.query_vector.as_deref() else {
            continue;
        };
        let Ok(vector) = parse_vector(vector_text) else {
            continue;
        };
        if vector.len() != query_vector.len() {
            continue;
        }
        let distance =
            1.0 - cosine_similarity(query_vector, query_norm, &vector, l2_norm(&vector));
        if distance < max_distance {
            matches.push((entry, distance));
        }
    }
    matches.sort_by(|left, right| {
        left.1
            .partial_cmp(&right.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.0.id.cmp(&right.0.id))
    });
    matches.truncate(limit);
    Ok(matches)
}

pub fn count(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM search_logs", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}

const SELECT_LOG: &str = "SELECT id, query, search_type, execution_time_ms, results_count,
    language, query_vector, section_ids, created_at FROM search_logs";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchLogEntry> {
    let section_ids_json: Option<String> = row.get(7)?;
    let section_ids = section_ids_json
        .as_deref()
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();
    Ok(SearchLogEntry {
        id: row.get(0)?,
        query: row.get(1)?,
        search_type: row.get(2)?,
        execution_time_ms: row.get(3)?,
        results_count: row.get(4)?,
        language: row.get(5)?,
        query_vector: row.get(6)?,
        section_ids,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, schema};
    use tempfile::tempdir;

    fn setup() -> Connection {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        conn
    }

    fn log(query: &str, search_type: SearchType) -> NewSearchLog {
        NewSearchLog {
            query: query.to_string(),
            search_type,
            execution_time_ms: 12,
            results_count: 3,
            language: Some("en".to_string()),
            query_vector: None,
            section_ids: vec![1, 2, 3],
            filters: None,
        }
    }

    #[test]
    fn record_and_read_back() {
        let conn = setup();
        record(&conn, &log("rust search", SearchType::Hybrid));

        let entries = recent(&conn, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query, "rust search");
        assert_eq!(entries[0].search_type, "hybrid");
        assert_eq!(entries[0].section_ids, vec![1, 2, 3]);
    }

    #[test]
    fn timestamps_never_decrease() {
        let conn = setup();
        for i in 0..5 {
            record(&conn, &log(&format!("q{i}"), SearchType::Fulltext));
        }
        let entries = recent(&conn, 10).unwrap();
        let mut stamps: Vec<&str> = entries.iter().map(|e| e.created_at.as_str()).collect();
        stamps.reverse();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn by_type_filters() {
        let conn = setup();
        record(&conn, &log("a", SearchType::Vector));
        record(&conn, &log("b", SearchType::Hybrid));
        record(&conn, &log("c", SearchType::Vector));

        let vector_only = by_type(&conn, SearchType::Vector, 10).unwrap();
        assert_eq!(vector_only.len(), 2);
        assert!(vector_only.iter().all(|e| e.search_type == "vector"));
    }

    #[test]
    fn popular_counts_repeats() {
        let conn = setup();
        record(&conn, &log("dup", SearchType::Hybrid));
        record(&conn, &log("dup", SearchType::Hybrid));
        record(&conn, &log("once", SearchType::Hybrid));

        let popular = popular_since_hours(&conn, 24, 10).unwrap();
        assert_eq!(popular[0], ("dup".to_string(), 2));
    }

    #[test]
    fn average_time_by_type() {
        let conn = setup();
        let mut fast = log("fast", SearchType::Vector);
        fast.execution_time_ms = 10;
        let mut slow = log("slow", SearchType::Vector);
        slow.execution_time_ms = 30;
        record(&conn, &fast);
        record(&conn, &slow);

        let averages = average_execution_time(&conn).unwrap();
        assert_eq!(averages, vec![("vector".to_string(), 20.0)]);
    }

    #[test]
    fn similar_queries_respects_distance_bound() {
        let conn = setup();
        let mut near = log("near", SearchType::Hybrid);
        near.query_vector = Some(vec![1.0, 0.0]);
        let mut far = log("far", SearchType::Hybrid);
        far.query_vector = Some(vec![0.0, 1.0]);
        record(&conn, &near);
        record(&conn, &far);

        let found = similar_queries(
            &conn,
            &[0.95, 0.05],
            tessera_core::constants::SIMILAR_QUERY_DISTANCE,
            10,
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.query, "near");
    }

    #[test]
    fn logger_failure_does_not_panic() {
        let conn = setup();
        conn.execute("DROP TABLE search_logs", []).unwrap();
        // Table is gone; the write must be swallowed.
        record(&conn, &log("orphan", SearchType::Hybrid));
    }
}
