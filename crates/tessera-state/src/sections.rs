use rusqlite::{Connection, OptionalExtension, params};
use tessera_core::error::StateError;
use tessera_core::types::Section;

/// One chunk produced by the chunker, before it has a row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSection {
    pub title: Option<String>,
    pub content: String,
}

/// Replace the whole section set of a document in one transaction.
///
/// Old sections cascade their embeddings, lexical rows, and link rows; the
/// new set is inserted in order. Readers see either the old set or the new
/// one, never a mix. Returns the new section ids in section order.
pub fn replace_for_document(
    conn: &Connection,
    document_id: i64,
    sections: &[NewSection],
) -> Result<Vec<i64>, StateError> {
    let tx = conn.unchecked_transaction().map_err(StateError::sqlite)?;
    let ids = replace_rows(&tx, document_id, sections)?;
    tx.commit().map_err(StateError::sqlite)?;
    Ok(ids)
}

/// Delete-and-insert body of [`replace_for_document`], without transaction
/// management. Callers that need embeddings in the same commit run this
/// inside their own transaction.
pub fn replace_rows(
    conn: &Connection,
    document_id: i64,
    sections: &[NewSection],
) -> Result<Vec<i64>, StateError> {
    for section in sections {
        if section.content.trim().is_empty() {
            return Err(StateError::invalid_argument(
                "section content must not be empty",
            ));
        }
        if let Some(title) = &section.title
            && title.chars().count() > 500
        {
            return Err(StateError::invalid_argument(
                "section title must be at most 500 characters",
            ));
        }
    }

    conn.execute(
        "DELETE FROM sections WHERE document_id = ?1",
        params![document_id],
    )
    .map_err(StateError::sqlite)?;

    let mut ids = Vec::with_capacity(sections.len());
    let mut stmt = conn
        .prepare(
            "INSERT INTO sections (document_id, section_number, title, content)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(StateError::sqlite)?;
    for (number, section) in sections.iter().enumerate() {
        stmt.execute(params![
            document_id,
            number as i64,
            section.title,
            section.content
        ])
        .map_err(StateError::sqlite)?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Section>, StateError> {
    conn.query_row(
        &format!("{SELECT_SECTION} WHERE id = ?1"),
        params![id],
        row_to_section,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn list_for_document(conn: &Connection, document_id: i64) -> Result<Vec<Section>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_SECTION} WHERE document_id = ?1 ORDER BY section_number"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![document_id], row_to_section)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn count_for_document(conn: &Connection, document_id: i64) -> Result<i64, StateError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sections WHERE document_id = ?1",
        params![document_id],
        |row| row.get(0),
    )
    .map_err(StateError::sqlite)
}

pub fn count_all(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM sections", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}

const SELECT_SECTION: &str = "SELECT id, document_id, section_number, title, content,
    created_at, updated_at FROM sections";

fn row_to_section(row: &rusqlite::Row<'_>) -> rusqlite::Result<Section> {
    Ok(Section {
        id: row.get(0)?,
        document_id: row.get(1)?,
        section_number: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, documents, schema};
    use tempfile::tempdir;

    fn setup() -> Connection {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        conn
    }

    fn make_doc(conn: &Connection) -> i64 {
        documents::create_or_update(
            conn,
            &documents::NewDocument {
                title: "doc".into(),
                ..Default::default()
            },
        )
        .unwrap()
        .id
    }

    fn section(title: &str, content: &str) -> NewSection {
        NewSection {
            title: Some(title.to_string()),
            content: content.to_string(),
        }
    }

    #[test]
    fn replace_inserts_in_order() {
        let mut conn = setup();
        let doc_id = make_doc(&conn);
        let ids = replace_for_document(
            &mut conn,
            doc_id,
            &[section("a", "first"), section("b", "second")],
        )
        .unwrap();
        assert_eq!(ids.len(), 2);

        let sections = list_for_document(&conn, doc_id).unwrap();
        assert_eq!(sections[0].section_number, 0);
        assert_eq!(sections[0].title.as_deref(), Some("a"));
        assert_eq!(sections[1].content, "second");
    }

    #[test]
    fn replace_swaps_the_whole_set() {
        let mut conn = setup();
        let doc_id = make_doc(&conn);
        let old_ids =
            replace_for_document(&mut conn, doc_id, &[section("a", "one"), section("b", "two")])
                .unwrap();

        let new_ids = replace_for_document(&mut conn, doc_id, &[section("c", "three")]).unwrap();
        assert_eq!(new_ids.len(), 1);
        assert!(old_ids.iter().all(|old| !new_ids.contains(old)));
        assert_eq!(count_for_document(&conn, doc_id).unwrap(), 1);
    }

    #[test]
    fn empty_content_is_rejected_without_touching_rows() {
        let mut conn = setup();
        let doc_id = make_doc(&conn);
        replace_for_document(&mut conn, doc_id, &[section("a", "keep me")]).unwrap();

        let err = replace_for_document(&mut conn, doc_id, &[section("b", "   ")]).unwrap_err();
        assert_eq!(err.kind(), "argument_error");
        // Old set still intact.
        assert_eq!(count_for_document(&conn, doc_id).unwrap(), 1);
    }

    #[test]
    fn replace_cascades_embeddings() {
        let mut conn = setup();
        let doc_id = make_doc(&conn);
        let ids = replace_for_document(&mut conn, doc_id, &[section("a", "body")]).unwrap();
        conn.execute(
            "INSERT INTO embeddings (section_id, vector, dimensions) VALUES (?1, '[1]', 1)",
            params![ids[0]],
        )
        .unwrap();

        replace_for_document(&mut conn, doc_id, &[section("b", "new body")]).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
