use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use tessera_core::constants::TAG_PATH_SEPARATOR;
use tessera_core::error::StateError;
use tessera_core::types::Tag;

pub fn create(conn: &Connection, name: &str, parent_id: Option<i64>) -> Result<Tag, StateError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StateError::invalid_argument("tag name must not be empty"));
    }
    if let Some(parent) = parent_id
        && get(conn, parent)?.is_none()
    {
        return Err(StateError::not_found("tag", parent));
    }
    conn.execute(
        "INSERT INTO tags (name, parent_id) VALUES (?1, ?2)",
        params![name, parent_id],
    )
    .map_err(StateError::sqlite)?;
    let id = conn.last_insert_rowid();
    Ok(Tag {
        id,
        name: name.to_string(),
        parent_id,
    })
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Tag>, StateError> {
    conn.query_row(
        "SELECT id, name, parent_id FROM tags WHERE id = ?1",
        params![id],
        row_to_tag,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Tag>, StateError> {
    conn.query_row(
        "SELECT id, name, parent_id FROM tags WHERE name = ?1",
        params![name.trim()],
        row_to_tag,
    )
    .optional()
    .map_err(StateError::sqlite)
}

/// Find a tag by name or create it.
pub fn get_or_create(conn: &Connection, name: &str) -> Result<Tag, StateError> {
    match get_by_name(conn, name)? {
        Some(tag) => Ok(tag),
        None => create(conn, name, None),
    }
}

pub fn list(conn: &Connection) -> Result<Vec<Tag>, StateError> {
    let mut stmt = conn
        .prepare("SELECT id, name, parent_id FROM tags ORDER BY name")
        .map_err(StateError::sqlite)?;
    let rows = stmt.query_map([], row_to_tag).map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

/// Re-parent a tag, rejecting moves that would close a cycle.
///
/// The forbidden parents are the tag itself and its descendants; the check
/// walks the subtree iteratively with a visited set.
pub fn move_to(
    conn: &Connection,
    tag_id: i64,
    new_parent_id: Option<i64>,
) -> Result<(), StateError> {
    if get(conn, tag_id)?.is_none() {
        return Err(StateError::not_found("tag", tag_id));
    }
    if let Some(parent) = new_parent_id {
        if get(conn, parent)?.is_none() {
            return Err(StateError::not_found("tag", parent));
        }
        if parent == tag_id || descendants(conn, tag_id)?.contains(&parent) {
            return Err(StateError::TagCycle {
                tag_id,
                new_parent_id: parent,
            });
        }
    }
    conn.execute(
        "UPDATE tags SET parent_id = ?1 WHERE id = ?2",
        params![new_parent_id, tag_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// All descendant ids of a tag, iteratively.
pub fn descendants(conn: &Connection, tag_id: i64) -> Result<HashSet<i64>, StateError> {
    let mut seen = HashSet::new();
    let mut frontier = vec![tag_id];
    let mut stmt = conn
        .prepare("SELECT id FROM tags WHERE parent_id = ?1")
        .map_err(StateError::sqlite)?;
    while let Some(current) = frontier.pop() {
        let children = stmt
            .query_map(params![current], |row| row.get::<_, i64>(0))
            .map_err(StateError::sqlite)?;
        for child in children {
            let child = child.map_err(StateError::sqlite)?;
            if seen.insert(child) {
                frontier.push(child);
            }
        }
    }
    Ok(seen)
}

/// Materialize the ancestor path of a tag, root first, `" > "`-separated.
pub fn ancestor_path(conn: &Connection, tag_id: i64) -> Result<String, StateError> {
    let mut names = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(tag_id);
    while let Some(id) = current {
        // A visited id means the forest invariant was violated on disk;
        // stop rather than loop.
        if !visited.insert(id) {
            break;
        }
        let tag = get(conn, id)?.ok_or_else(|| StateError::not_found("tag", id))?;
        names.push(tag.name);
        current = tag.parent_id;
    }
    names.reverse();
    Ok(names.join(TAG_PATH_SEPARATOR))
}

pub fn delete(conn: &Connection, tag_id: i64) -> Result<(), StateError> {
    let changed = conn
        .execute("DELETE FROM tags WHERE id = ?1", params![tag_id])
        .map_err(StateError::sqlite)?;
    if changed == 0 {
        return Err(StateError::not_found("tag", tag_id));
    }
    Ok(())
}

pub fn link_section(conn: &Connection, section_id: i64, tag_id: i64) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO section_tags (section_id, tag_id) VALUES (?1, ?2)
         ON CONFLICT(section_id, tag_id) DO NOTHING",
        params![section_id, tag_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn unlink_section(conn: &Connection, section_id: i64, tag_id: i64) -> Result<(), StateError> {
    conn.execute(
        "DELETE FROM section_tags WHERE section_id = ?1 AND tag_id = ?2",
        params![section_id, tag_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn tags_for_section(conn: &Connection, section_id: i64) -> Result<Vec<Tag>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.parent_id FROM tags t
             JOIN section_tags st ON st.tag_id = t.id
             WHERE st.section_id = ?1 ORDER BY t.name",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![section_id], row_to_tag)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StateError::sqlite)
}

pub fn count(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}

fn row_to_tag(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
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

    #[test]
    fn create_and_lookup() {
        let conn = setup();
        let root = create(&conn, "ml", None).unwrap();
        let child = create(&conn, "nlp", Some(root.id)).unwrap();
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(get_by_name(&conn, "nlp").unwrap().unwrap().id, child.id);
    }

    #[test]
    fn move_to_rejects_self_and_descendants() {
        let conn = setup();
        let a = create(&conn, "a", None).unwrap();
        let b = create(&conn, "b", Some(a.id)).unwrap();
        let c = create(&conn, "c", Some(b.id)).unwrap();

        let err = move_to(&conn, a.id, Some(a.id)).unwrap_err();
        assert!(matches!(err, StateError::TagCycle { .. }));

        let err = move_to(&conn, a.id, Some(c.id)).unwrap_err();
        assert!(matches!(err, StateError::TagCycle { .. }));

        // Sideways move is fine.
        move_to(&conn, c.id, Some(a.id)).unwrap();
        assert_eq!(get(&conn, c.id).unwrap().unwrap().parent_id, Some(a.id));
    }

    #[test]
    fn ancestor_path_uses_exact_separator() {
        let conn = setup();
        let a = create(&conn, "science", None).unwrap();
        let b = create(&conn, "computing", Some(a.id)).unwrap();
        let c = create(&conn, "search", Some(b.id)).unwrap();

        assert_eq!(
            ancestor_path(&conn, c.id).unwrap(),
            "science > computing > search"
        );
    }

    #[test]
    fn descendants_walks_the_subtree() {
        let conn = setup();
        let a = create(&conn, "a", None).unwrap();
        let b = create(&conn, "b", Some(a.id)).unwrap();
        let c = create(&conn, "c", Some(b.id)).unwrap();
        let _other = create(&conn, "other", None).unwrap();

        let found = descendants(&conn, a.id).unwrap();
        assert_eq!(found, [b.id, c.id].into_iter().collect());
    }

    #[test]
    fn deleting_a_parent_detaches_children() {
        let conn = setup();
        let a = create(&conn, "a", None).unwrap();
        let b = create(&conn, "b", Some(a.id)).unwrap();
        delete(&conn, a.id).unwrap();
        assert_eq!(get(&conn, b.id).unwrap().unwrap().parent_id, None);
    }

    #[test]
    fn section_links_deduplicate() {
        let conn = setup();
        conn.execute("INSERT INTO documents (id, title) VALUES (1, 'd')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO sections (id, document_id, section_number, content)
             VALUES (5, 1, 0, 'x')",
            [],
        )
        .unwrap();
        let tag = create(&conn, "t", None).unwrap();
        link_section(&conn, 5, tag.id).unwrap();
        link_section(&conn, 5, tag.id).unwrap();
        assert_eq!(tags_for_section(&conn, 5).unwrap().len(), 1);

        unlink_section(&conn, 5, tag.id).unwrap();
        assert!(tags_for_section(&conn, 5).unwrap().is_empty());
    }
}
