use rusqlite::Connection;
use tessera_core::error::StateError;
use tracing::info;

/// Current schema version. Bump this when adding a new migration step.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Create all required SQLite tables and run any pending migrations.
pub fn create_tables(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(SCHEMA_SQL).map_err(StateError::sqlite)?;
    migrate(conn)?;
    seed_language_configs(conn)?;
    info!("SQLite schema ready (version {})", CURRENT_SCHEMA_VERSION);
    Ok(())
}

/// Run incremental schema migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// The `schema_migrations` table records which versions have been applied.
/// Migrations are forward-only and each step must be idempotent.
pub fn migrate(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(StateError::sqlite)?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(StateError::sqlite)?;

    type MigrationFn = fn(&Connection) -> Result<(), StateError>;

    // Indexed by version (1-based: index 0 = V1).
    // V1 is the baseline schema created by SCHEMA_SQL, so it only gets recorded.
    let migrations: &[MigrationFn] = &[
        // V1: baseline
        |_conn| Ok(()),
        // V2: language-partitioned partial indexes on lexical rows for the
        // most common corpus languages.
        |conn| {
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_lexical_vectors_lang_en
                     ON lexical_vectors(section_id) WHERE language = 'en';
                 CREATE INDEX IF NOT EXISTS idx_lexical_vectors_lang_zh
                     ON lexical_vectors(section_id) WHERE language = 'zh';",
            )
            .map_err(StateError::sqlite)?;
            Ok(())
        },
    ];

    for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
        let idx = (version - 1) as usize;
        if idx < migrations.len() {
            let tx_guard = conn.unchecked_transaction().map_err(StateError::sqlite)?;
            migrations[idx](conn)?;
            conn.execute(
                "INSERT INTO schema_migrations (version) VALUES (?1)",
                [version],
            )
            .map_err(StateError::sqlite)?;
            tx_guard.commit().map_err(StateError::sqlite)?;
            info!(version, "Applied schema migration");
        }
    }

    Ok(())
}

/// Seed the tokenizer registry rows. Idempotent; existing rows win so
/// administrative installs survive restarts.
fn seed_language_configs(conn: &Connection) -> Result<(), StateError> {
    const SEED: &[(&str, &str)] = &[
        ("en", "english"),
        ("zh", "jieba"),
        ("zh_cn", "jieba"),
        ("zh_tw", "jieba"),
        ("ja", "simple"),
        ("ko", "simple"),
        ("ar", "simple"),
        ("es", "spanish"),
        ("fr", "french"),
        ("de", "german"),
        ("it", "italian"),
        ("ru", "russian"),
        ("default", "simple"),
    ];

    let mut stmt = conn
        .prepare(
            "INSERT INTO language_configs (code, config_name, installed)
             VALUES (?1, ?2, 1)
             ON CONFLICT(code) DO NOTHING",
        )
        .map_err(StateError::sqlite)?;
    for (code, config_name) in SEED {
        stmt.execute(rusqlite::params![code, config_name])
            .map_err(StateError::sqlite)?;
    }
    Ok(())
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    url TEXT,
    author TEXT,
    publication_date TEXT,
    language TEXT NOT NULL DEFAULT 'en',
    description TEXT,
    download_state INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_url
    ON documents(url) WHERE url IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_documents_language ON documents(language);
CREATE INDEX IF NOT EXISTS idx_documents_download_state ON documents(download_state);

CREATE TABLE IF NOT EXISTS sections (
    id INTEGER PRIMARY KEY,
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    section_number INTEGER NOT NULL CHECK (section_number >= 0),
    title TEXT CHECK (title IS NULL OR length(title) <= 500),
    content TEXT NOT NULL CHECK (length(content) > 0),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sections_document_id ON sections(document_id);
CREATE INDEX IF NOT EXISTS idx_sections_document_number
    ON sections(document_id, section_number);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY,
    section_id INTEGER NOT NULL UNIQUE REFERENCES sections(id) ON DELETE CASCADE,
    vector TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS lexical_vectors (
    section_id INTEGER PRIMARY KEY REFERENCES sections(id) ON DELETE CASCADE,
    language TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    parent_id INTEGER REFERENCES tags(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS section_tags (
    section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (section_id, tag_id)
);

CREATE TABLE IF NOT EXISTS research_topics (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT
);

CREATE TABLE IF NOT EXISTS research_topic_sections (
    topic_id INTEGER NOT NULL REFERENCES research_topics(id) ON DELETE CASCADE,
    section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
    PRIMARY KEY (topic_id, section_id)
);

CREATE TABLE IF NOT EXISTS research_topic_tags (
    topic_id INTEGER NOT NULL REFERENCES research_topics(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (topic_id, tag_id)
);

CREATE TABLE IF NOT EXISTS language_configs (
    code TEXT PRIMARY KEY,
    config_name TEXT NOT NULL,
    installed INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS search_logs (
    id INTEGER PRIMARY KEY,
    query TEXT NOT NULL,
    search_type TEXT NOT NULL CHECK (search_type IN ('vector','fulltext','hybrid')),
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    results_count INTEGER NOT NULL DEFAULT 0,
    language TEXT,
    query_vector TEXT,
    section_ids TEXT,
    filters TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_search_logs_created_at ON search_logs(created_at);
CREATE INDEX IF NOT EXISTS idx_search_logs_search_type ON search_logs(search_type);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::tempdir;

    fn setup() -> Connection {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn create_tables_is_idempotent() {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let version: u32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn language_configs_are_seeded() {
        let conn = setup();
        let config: String = conn
            .query_row(
                "SELECT config_name FROM language_configs WHERE code = 'zh'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(config, "jieba");

        let fallback: String = conn
            .query_row(
                "SELECT config_name FROM language_configs WHERE code = 'default'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fallback, "simple");
    }

    #[test]
    fn seed_does_not_clobber_admin_installs() {
        let conn = setup();
        conn.execute(
            "UPDATE language_configs SET config_name = 'japanese' WHERE code = 'ja'",
            [],
        )
        .unwrap();
        create_tables(&conn).unwrap();
        let config: String = conn
            .query_row(
                "SELECT config_name FROM language_configs WHERE code = 'ja'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(config, "japanese");
    }

    #[test]
    fn section_cascade_is_wired() {
        let conn = setup();
        conn.execute(
            "INSERT INTO documents (id, title) VALUES (1, 'doc')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sections (id, document_id, section_number, content)
             VALUES (10, 1, 0, 'body')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO embeddings (section_id, vector, dimensions) VALUES (10, '[1]', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO lexical_vectors (section_id, language) VALUES (10, 'en')",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM documents WHERE id = 1", []).unwrap();

        let sections: i64 = conn
            .query_row("SELECT COUNT(*) FROM sections", [], |row| row.get(0))
            .unwrap();
        let embeddings: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .unwrap();
        let lexical: i64 = conn
            .query_row("SELECT COUNT(*) FROM lexical_vectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!((sections, embeddings, lexical), (0, 0, 0));
    }
}
