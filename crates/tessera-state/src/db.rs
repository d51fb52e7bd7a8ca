use rusqlite::Connection;
use std::path::Path;
use tessera_core::error::StateError;
use tracing::info;

/// Open a SQLite connection with default pragmas.
pub fn open_connection(db_path: &Path) -> Result<Connection, StateError> {
    open_connection_with_config(db_path, 5000, -64000)
}

/// Open a SQLite connection with configurable pragmas.
///
/// `foreign_keys = ON` is load-bearing: cascading deletes from documents to
/// sections, embeddings, lexical rows, and link tables rely on it.
pub fn open_connection_with_config(
    db_path: &Path,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<Connection, StateError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    }

    let conn = Connection::open(db_path).map_err(StateError::sqlite)?;

    apply_pragmas(&conn, busy_timeout_ms, cache_size)?;

    info!(?db_path, "SQLite connection opened");
    Ok(conn)
}

fn apply_pragmas(
    conn: &Connection,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<(), StateError> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};
         PRAGMA cache_size = {};",
        busy_timeout_ms, cache_size
    ))
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Run SQLite quick_check to verify database integrity.
pub fn check_sqlite_health(conn: &Connection) -> Result<(bool, Option<String>), StateError> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(StateError::sqlite)?;

    if result == "ok" {
        Ok((true, None))
    } else {
        Ok((false, Some(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_connection_applies_pragmas() {
        let dir = tempdir().unwrap();
        let conn = open_connection(&dir.path().join("test.db")).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn custom_pragmas_are_honored() {
        let dir = tempdir().unwrap();
        let conn = open_connection_with_config(&dir.path().join("c.db"), 3000, -32000).unwrap();

        let timeout: i32 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 3000);
    }

    #[test]
    fn health_check_passes_on_fresh_db() {
        let dir = tempdir().unwrap();
        let conn = open_connection(&dir.path().join("h.db")).unwrap();
        let (ok, detail) = check_sqlite_health(&conn).unwrap();
        assert!(ok);
        assert!(detail.is_none());
    }
}
