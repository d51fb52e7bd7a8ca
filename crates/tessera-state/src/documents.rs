use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use tessera_core::error::StateError;
use tessera_core::types::{Document, DownloadState};

/// Fields accepted when creating or updating a document.
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub publication_date: Option<String>,
    pub language: Option<String>,
    pub description: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Create a document, or update the existing row when the URL is already
/// known. Re-ingest of a URL mutates the same document id.
pub fn create_or_update(conn: &Connection, new: &NewDocument) -> Result<Document, StateError> {
    let language = new
        .language
        .as_deref()
        .map(tessera_core::language::normalize_language_code)
        .unwrap_or_else(|| "en".to_string());
    let metadata_json =
        serde_json::to_string(&new.metadata).map_err(StateError::sqlite)?;

    let existing = match new.url.as_deref() {
        Some(url) => get_by_url(conn, url)?,
        None => None,
    };

    match existing {
        Some(doc) => {
            conn.execute(
                "UPDATE documents
                 SET title = ?1, author = ?2, publication_date = ?3, language = ?4,
                     description = ?5, download_state = ?6, metadata = ?7,
                     updated_at = datetime('now')
                 WHERE id = ?8",
                params![
                    new.title,
                    new.author,
                    new.publication_date,
                    language,
                    new.description,
                    DownloadState::Pending.as_i64(),
                    metadata_json,
                    doc.id,
                ],
            )
            .map_err(StateError::sqlite)?;
            get(conn, doc.id)?.ok_or_else(|| StateError::not_found("document", doc.id))
        }
        None => {
            conn.execute(
                "INSERT INTO documents
                 (title, url, author, publication_date, language, description,
                  download_state, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.title,
                    new.url,
                    new.author,
                    new.publication_date,
                    language,
                    new.description,
                    DownloadState::Pending.as_i64(),
                    metadata_json,
                ],
            )
            .map_err(StateError::sqlite)?;
            let id = conn.last_insert_rowid();
            get(conn, id)?.ok_or_else(|| StateError::not_found("document", id))
        }
    }
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Document>, StateError> {
    conn.query_row(
        &format!("{SELECT_DOCUMENT} WHERE id = ?1"),
        params![id],
        row_to_document,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn get_by_url(conn: &Connection, url: &str) -> Result<Option<Document>, StateError> {
    conn.query_row(
        &format!("{SELECT_DOCUMENT} WHERE url = ?1"),
        params![url],
        row_to_document,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn list(conn: &Connection, limit: usize) -> Result<Vec<Document>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_DOCUMENT} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_document)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn set_download_state(
    conn: &Connection,
    id: i64,
    state: DownloadState,
) -> Result<(), StateError> {
    let changed = conn
        .execute(
            "UPDATE documents
             SET download_state = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![state.as_i64(), id],
        )
        .map_err(StateError::sqlite)?;
    if changed == 0 {
        return Err(StateError::not_found("document", id));
    }
    Ok(())
}

/// Update just the language code; the caller is responsible for rebuilding
/// the lexical rows afterwards.
pub fn set_language(conn: &Connection, id: i64, language: &str) -> Result<(), StateError> {
    let language = tessera_core::language::normalize_language_code(language);
    let changed = conn
        .execute(
            "UPDATE documents SET language = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![language, id],
        )
        .map_err(StateError::sqlite)?;
    if changed == 0 {
        return Err(StateError::not_found("document", id));
    }
    Ok(())
}

/// Delete a document. Sections, embeddings, lexical rows, and link rows go
/// with it through the cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<(), StateError> {
    let changed = conn
        .execute("DELETE FROM documents WHERE id = ?1", params![id])
        .map_err(StateError::sqlite)?;
    if changed == 0 {
        return Err(StateError::not_found("document", id));
    }
    Ok(())
}

pub fn count_by_state(conn: &Connection) -> Result<Vec<(DownloadState, i64)>, StateError> {
    let mut stmt = conn
        .prepare("SELECT download_state, COUNT(*) FROM documents GROUP BY download_state")
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((DownloadState::from_i64(row.get(0)?), row.get::<_, i64>(1)?))
        })
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn language_distribution(conn: &Connection) -> Result<Vec<(String, i64)>, StateError> {
    let mut stmt = conn
        .prepare("SELECT language, COUNT(*) FROM documents GROUP BY language ORDER BY COUNT(*) DESC")
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

const SELECT_DOCUMENT: &str = "SELECT id, title, url, author, publication_date, language,
    description, download_state, metadata, created_at, updated_at FROM documents";

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let metadata_json: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        author: row.get(3)?,
        publication_date: row.get(4)?,
        language: row.get(5)?,
        description: row.get(6)?,
        download_state: DownloadState::from_i64(row.get(7)?),
        metadata,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
