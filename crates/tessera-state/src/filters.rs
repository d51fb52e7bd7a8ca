use rusqlite::{Connection, params_from_iter, types::Value};
use std::collections::HashSet;
use tessera_core::error::StateError;
use tessera_core::types::SearchFilters;

/// Resolve search filters into the set of section ids both channels may
/// return. `None` means no filtering is in effect.
///
/// Document-id and date constraints restrict the owning document; tag
/// constraints restrict sections directly through `section_tags`. The date
/// window applies to the publication date, falling back to the ingestion
/// timestamp for documents without one.
pub fn resolve_allowed_sections(
    conn: &Connection,
    filters: &SearchFilters,
) -> Result<Option<HashSet<i64>>, StateError> {
    if filters.is_empty() {
        return Ok(None);
    }

    let mut sql = String::from(
        "SELECT s.id FROM sections s JOIN documents d ON d.id = s.document_id WHERE 1=1",
    );
    let mut params: Vec<Value> = Vec::new();

    if !filters.document_ids.is_empty() {
        let placeholders = vec!["?"; filters.document_ids.len()].join(", ");
        sql.push_str(&format!(" AND d.id IN ({placeholders})"));
        params.extend(filters.document_ids.iter().copied().map(Value::from));
    }

    if !filters.tag_ids.is_empty() {
        let placeholders = vec!["?"; filters.tag_ids.len()].join(", ");
        sql.push_str(&format!(
            " AND s.id IN (SELECT section_id FROM section_tags WHERE tag_id IN ({placeholders}))"
        ));
        params.extend(filters.tag_ids.iter().copied().map(Value::from));
    }

    if let Some(from) = &filters.date_from {
        sql.push_str(" AND COALESCE(d.publication_date, d.created_at) >= ?");
        params.push(Value::from(from.clone()));
    }
    if let Some(to) = &filters.date_to {
        sql.push_str(" AND COALESCE(d.publication_date, d.created_at) <= ?");
        params.push(Value::from(to.clone()));
    }

    let mut stmt = conn.prepare(&sql).map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| row.get::<_, i64>(0))
        .map_err(StateError::sqlite)?;

    let mut allowed = HashSet::new();
    for row in rows {
        allowed.insert(row.map_err(StateError::sqlite)?);
    }
    Ok(Some(allowed))
}
