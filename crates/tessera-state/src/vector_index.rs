use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tessera_core::error::StateError;

/// Serialize a vector in the store format: `[f0,f1,…]`, `.` decimal
/// separator, no whitespace. This format is bit-exact and owned by the core.
pub fn format_vector(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 8 + 2);
    out.push('[');
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

/// Parse a vector in the store format. Inverse of [`format_vector`].
pub fn parse_vector(text: &str) -> Result<Vec<f32>, StateError> {
    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| StateError::invalid_argument("vector text must be bracketed"))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.parse::<f32>()
                .map_err(|e| StateError::invalid_argument(format!("bad vector component: {e}")))
        })
        .collect()
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    if vector.is_empty() {
        return 0.0;
    }
    let sum_squares = vector
        .iter()
        .map(|value| {
            let value = *value as f64;
            value * value
        })
        .sum::<f64>();
    sum_squares.sqrt() as f32
}

/// `dot(a,b)/(‖a‖·‖b‖)`; zero when either magnitude is zero.
pub fn cosine_similarity(left: &[f32], left_norm: f32, right: &[f32], right_norm: f32) -> f64 {
    if left_norm <= f32::EPSILON || right_norm <= f32::EPSILON {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    for (l, r) in left.iter().zip(right.iter()) {
        dot += *l as f64 * *r as f64;
    }
    let norm = left_norm as f64 * right_norm as f64;
    if norm == 0.0 { 0.0 } else { dot / norm }
}

/// A nearest-neighbor request against the embeddings table.
#[derive(Debug, Clone)]
pub struct VectorSearch {
    pub query_vector: Vec<f32>,
    pub limit: usize,
    /// Minimum similarity in [0,1]; applied as `distance < 1 − threshold`.
    pub threshold: f64,
    /// Pre-resolved filter; `None` means unfiltered.
    pub allowed_sections: Option<HashSet<i64>>,
}

/// One vector-channel hit with the joined metadata the orchestrator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    pub section_id: i64,
    pub document_id: i64,
    pub section_number: i64,
    pub section_title: Option<String>,
    pub language: String,
    pub similarity: f64,
    pub distance: f64,
}

/// Insert the embedding row for a section; one row per section.
pub fn insert(
    conn: &Connection,
    section_id: i64,
    vector: &[f32],
    expected_dimensions: usize,
) -> Result<(), StateError> {
    if vector.len() != expected_dimensions {
        return Err(StateError::DimensionMismatch {
            expected: expected_dimensions,
            actual: vector.len(),
        });
    }
    conn.execute(
        "INSERT INTO embeddings (section_id, vector, dimensions)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(section_id) DO UPDATE SET
             vector = excluded.vector,
             dimensions = excluded.dimensions,
             created_at = datetime('now')",
        params![section_id, format_vector(vector), vector.len() as i64],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Brute-force cosine search over the embeddings table.
///
/// Rows are joined to sections and documents in-query so hits carry the
/// metadata the orchestrator needs. This reference backend loads candidate
/// vectors into memory; it is fine below ~50k rows, and the seam is shaped
/// so an ANN-indexed store can replace it without touching callers.
pub fn search(
    conn: &Connection,
    request: &VectorSearch,
    expected_dimensions: usize,
) -> Result<Vec<VectorMatch>, StateError> {
    if request.query_vector.is_empty() {
        return Err(StateError::invalid_argument("query vector must not be empty"));
    }
    if request.query_vector.len() != expected_dimensions {
        return Err(StateError::DimensionMismatch {
            expected: expected_dimensions,
            actual: request.query_vector.len(),
        });
    }
    if request.limit == 0 {
        return Ok(Vec::new());
    }
    if let Some(allowed) = &request.allowed_sections
        && allowed.is_empty()
    {
        return Ok(Vec::new());
    }

    let query_norm = l2_norm(&request.query_vector);

    let mut stmt = conn
        .prepare(
            "SELECT e.section_id, e.vector, s.document_id, s.section_number, s.title, d.language
             FROM embeddings e
             JOIN sections s ON s.id = e.section_id
             JOIN documents d ON d.id = s.document_id",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(StateError::sqlite)?;

    let max_distance = 1.0 - request.threshold;
    let mut scored = Vec::new();
    for row in rows {
        let (section_id, vector_text, document_id, section_number, section_title, language) =
            row.map_err(StateError::sqlite)?;
        if let Some(allowed) = &request.allowed_sections
            && !allowed.contains(&section_id)
        {
            continue;
        }
        let vector = parse_vector(&vector_text)?;
        if vector.len() != request.query_vector.len() {
            continue;
        }
        let similarity = cosine_similarity(
            &request.query_vector,
            query_norm,
            &vector,
            l2_norm(&vector),
        );
        let distance = 1.0 - similarity;
        if distance >= max_distance {
            continue;
        }
        scored.push(VectorMatch {
            section_id,
            document_id,
            section_number,
            section_title,
            language,
            similarity,
            distance,
        });
    }

    scored.sort_by(|left, right| {
        left.distance
            .partial_cmp(&right.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.section_id.cmp(&right.section_id))
    });
    scored.truncate(request.limit);
    Ok(scored)
}

pub fn delete_by_section(conn: &Connection, section_id: i64) -> Result<usize, StateError> {
    conn.execute(
        "DELETE FROM embeddings WHERE section_id = ?1",
        params![section_id],
    )
    .map_err(StateError::sqlite)
}

/// Reap embedding rows older than the given age in days.
pub fn delete_older_than(conn: &Connection, days: u32) -> Result<usize, StateError> {
    conn.execute(
        "DELETE FROM embeddings
         WHERE created_at < datetime('now', ?1)",
        params![format!("-{days} days")],
    )
    .map_err(StateError::sqlite)
}

/// Delete embedding rows whose section no longer exists.
pub fn cleanup_orphaned(conn: &Connection) -> Result<usize, StateError> {
    conn.execute(
        "DELETE FROM embeddings WHERE section_id NOT IN (SELECT id FROM sections)",
        [],
    )
    .map_err(StateError::sqlite)
}

pub fn count(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}
