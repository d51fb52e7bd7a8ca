use rusqlite::{Connection, OptionalExtension, params};
use tessera_core::error::StateError;
use tessera_core::types::ResearchTopic;

pub fn create(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
) -> Result<ResearchTopic, StateError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StateError::invalid_argument("topic name must not be empty"));
    }
    conn.execute(
        "INSERT INTO research_topics (name, description) VALUES (?1, ?2)",
        params![name, description],
    )
    .map_err(StateError::sqlite)?;
    Ok(ResearchTopic {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        description: description.map(String::from),
    })
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<ResearchTopic>, StateError> {
    conn.query_row(
        "SELECT id, name, description FROM research_topics WHERE id = ?1",
        params![id],
        row_to_topic,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<ResearchTopic>, StateError> {
    conn.query_row(
        "SELECT id, name, description FROM research_topics WHERE name = ?1",
        params![name.trim()],
        row_to_topic,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn list(conn: &Connection) -> Result<Vec<ResearchTopic>, StateError> {
    let mut stmt = conn
        .prepare("SELECT id, name, description FROM research_topics ORDER BY name")
        .map_err(StateError::sqlite)?;
    let rows = stmt.query_map([], row_to_topic).map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn update(
    conn: &Connection,
    id: i64,
    name: Option<&str>,
    description: Option<&str>,
) -> Result<ResearchTopic, StateError> {
    let existing = get(conn, id)?.ok_or_else(|| StateError::not_found("research_topic", id))?;
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(existing.name.as_str());
    let description = description.or(existing.description.as_deref());
    conn.execute(
        "UPDATE research_topics SET name = ?1, description = ?2 WHERE id = ?3",
        params![name, description, id],
    )
    .map_err(StateError::sqlite)?;
    get(conn, id)?.ok_or_else(|| StateError::not_found("research_topic", id))
}

pub fn delete(conn: &Connection, id: i64) -> Result<(), StateError> {
    let changed = conn
        .execute("DELETE FROM research_topics WHERE id = ?1", params![id])
        .map_err(StateError::sqlite)?;
    if changed == 0 {
        return Err(StateError::not_found("research_topic", id));
    }
    Ok(())
}

pub fn link_section(conn: &Connection, topic_id: i64, section_id: i64) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO research_topic_sections (topic_id, section_id) VALUES (?1, ?2)
         ON CONFLICT(topic_id, section_id) DO NOTHING",
        params![topic_id, section_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn unlink_section(conn: &Connection, topic_id: i64, section_id: i64) -> Result<(), StateError> {
    conn.execute(
        "DELETE FROM research_topic_sections WHERE topic_id = ?1 AND section_id = ?2",
        params![topic_id, section_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Link every section of a document to a topic.
pub fn link_document(conn: &Connection, topic_id: i64, document_id: i64) -> Result<usize, StateError> {
    conn.execute(
        "INSERT INTO research_topic_sections (topic_id, section_id)
         SELECT ?1, id FROM sections WHERE document_id = ?2
         ON CONFLICT(topic_id, section_id) DO NOTHING",
        params![topic_id, document_id],
    )
    .map_err(StateError::sqlite)
}

pub fn unlink_document(
    conn: &Connection,
    topic_id: i64,
    document_id: i64,
) -> Result<usize, StateError> {
    conn.execute(
        "DELETE FROM research_topic_sections
         WHERE topic_id = ?1
           AND section_id IN (SELECT id FROM sections WHERE document_id = ?2)",
        params![topic_id, document_id],
    )
    .map_err(StateError::sqlite)
}

pub fn link_tag(conn: &Connection, topic_id: i64, tag_id: i64) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO research_topic_tags (topic_id, tag_id) VALUES (?1, ?2)
         ON CONFLICT(topic_id, tag_id) DO NOTHING",
        params![topic_id, tag_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn section_ids(conn: &Connection, topic_id: i64) -> Result<Vec<i64>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT section_id FROM research_topic_sections
             WHERE topic_id = ?1 ORDER BY section_id",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![topic_id], |row| row.get(0))
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn count(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM research_topics", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}

fn row_to_topic(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResearchTopic> {
    Ok(ResearchTopic {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
    })
}
