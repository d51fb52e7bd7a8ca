use crate::tokenizers::{self, TokenizerRegistry};
use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tantivy::collector::DocSetCollector;
use tantivy::query::AllQuery;
use tantivy::schema::{
    IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing, TextOptions, Value,
};
use tantivy::{Index, TantivyDocument, Term, doc};
use tessera_core::error::StateError;
use tracing::{debug, info};

const REQUIRED_FIELDS: &[&str] = &["section_id", "document_id", "language", "title", "content"];

/// Marker file recording which schema version built a partition. Read back
/// when an existing partition fails field validation, so the error reports
/// the version actually found on disk (0 = pre-versioned or foreign index).
const SCHEMA_VERSION_FILE: &str = "schema_version";

/// Writer heap per tantivy index writer.
const WRITER_BUFFER_BYTES: usize = 50_000_000;

/// One lexical document, mirrored by a `lexical_vectors` bookkeeping row.
#[derive(Debug, Clone)]
pub struct LexicalDoc {
    pub section_id: i64,
    pub document_id: i64,
    pub language: String,
    pub title: String,
    pub content: String,
}

/// Field handles for a lexical index.
#[derive(Debug, Clone, Copy)]
pub struct LexicalFields {
    pub section_id: tantivy::schema::Field,
    pub document_id: tantivy::schema::Field,
    pub language: tantivy::schema::Field,
    pub title: tantivy::schema::Field,
    pub content: tantivy::schema::Field,
}

/// The lexical store: one tantivy index per tokenizer configuration, opened
/// lazily under `<root>/<config_name>`. Partitioning by config keeps each
/// index tokenizer-homogeneous and doubles as the language partitioning of
/// the search path.
pub struct LexicalIndexSet {
    root: PathBuf,
    indexes: RwLock<HashMap<String, Index>>,
}

impl LexicalIndexSet {
    pub fn open(root: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(root).map_err(StateError::Io)?;
        Ok(Self {
            root: root.to_path_buf(),
            indexes: RwLock::new(HashMap::new()),
        })
    }

    /// Create or open the index for one tokenizer configuration.
    pub fn index_for(&self, config_name: &str) -> Result<Index, StateError> {
        if !tokenizers::CONFIG_NAMES.contains(&config_name) {
            return Err(StateError::invalid_argument(format!(
                "unknown tokenizer config: {config_name}"
            )));
        }

        if let Ok(indexes) = self.indexes.read()
            && let Some(index) = indexes.get(config_name)
        {
            return Ok(index.clone());
        }

        let dir = self.root.join(config_name);
        std::fs::create_dir_all(&dir).map_err(StateError::Io)?;
        let index = if dir_is_empty(&dir)? {
            let index = Index::create_in_dir(&dir, build_schema(config_name))
                .map_err(StateError::tantivy)?;
            std::fs::write(
                dir.join(SCHEMA_VERSION_FILE),
                crate::schema::CURRENT_SCHEMA_VERSION.to_string(),
            )
            .map_err(StateError::Io)?;
            index
        } else {
            Index::open_in_dir(&dir).map_err(|e| {
                StateError::Tantivy(format!("failed to open index at {}: {}", dir.display(), e))
            })?
        };
        validate_required_fields(&index, read_schema_version(&dir))?;
        tokenizers::register_tokenizers(index.tokenizers())?;
        info!(?dir, config_name, "lexical index opened");

        if let Ok(mut indexes) = self.indexes.write() {
            indexes.insert(config_name.to_string(), index.clone());
        }
        Ok(index)
    }

    /// Existing config partitions on disk (plus any opened this process).
    pub fn existing_configs(&self) -> Vec<String> {
        tokenizers::CONFIG_NAMES
            .iter()
            .filter(|name| self.root.join(name).join("meta.json").exists())
            .map(|name| (*name).to_string())
            .collect()
    }

    /// Upsert lexical documents under one tokenizer configuration.
    ///
    /// Tantivy side: delete-by-term then re-add, committed once per batch.
    /// SQLite side: the bookkeeping row keyed by section id is upserted in
    /// the same call (conflict on section id overwrites).
    pub fn upsert_sections(
        &self,
        conn: &Connection,
        config_name: &str,
        docs: &[LexicalDoc],
    ) -> Result<(), StateError> {
        if docs.is_empty() {
            return Ok(());
        }
        for entry in docs {
            if entry.section_id <= 0 {
                return Err(StateError::invalid_argument(
                    "section id is required for lexical update",
                ));
            }
        }

        let index = self.index_for(config_name)?;
        let fields = self.fields(&index)?;
        let mut writer = index
            .writer(WRITER_BUFFER_BYTES)
            .map_err(StateError::tantivy)?;

        for entry in docs {
            let key = entry.section_id.to_string();
            writer.delete_term(Term::from_field_text(fields.section_id, &key));
            writer
                .add_document(doc!(
                    fields.section_id => key.as_str(),
                    fields.document_id => entry.document_id.to_string(),
                    fields.language => entry.language.as_str(),
                    fields.title => entry.title.as_str(),
                    fields.content => entry.content.as_str(),
                ))
                .map_err(StateError::tantivy)?;
        }
        writer.commit().map_err(StateError::tantivy)?;

        let mut stmt = conn
            .prepare(
                "INSERT INTO lexical_vectors (section_id, language, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(section_id) DO UPDATE SET
                     language = excluded.language,
                     updated_at = datetime('now')",
            )
            .map_err(StateError::sqlite)?;
        for entry in docs {
            stmt.execute(params![entry.section_id, entry.language])
                .map_err(StateError::sqlite)?;
        }
        debug!(count = docs.len(), config_name, "lexical sections upserted");
        Ok(())
    }

    /// Delete lexical documents for the given sections from every partition.
    pub fn delete_sections(&self, conn: &Connection, section_ids: &[i64]) -> Result<(), StateError> {
        if section_ids.is_empty() {
            return Ok(());
        }
        for config_name in self.existing_configs() {
            let index = self.index_for(&config_name)?;
            let fields = self.fields(&index)?;
            let mut writer: tantivy::IndexWriter = index
                .writer(WRITER_BUFFER_BYTES)
                .map_err(StateError::tantivy)?;
            for section_id in section_ids {
                writer.delete_term(Term::from_field_text(
                    fields.section_id,
                    &section_id.to_string(),
                ));
            }
            writer.commit().map_err(StateError::tantivy)?;
        }

        let mut stmt = conn
            .prepare("DELETE FROM lexical_vectors WHERE section_id = ?1")
            .map_err(StateError::sqlite)?;
        for section_id in section_ids {
            stmt.execute(params![section_id]).map_err(StateError::sqlite)?;
        }
        Ok(())
    }

    /// Delete every lexical document belonging to a document id.
    pub fn delete_document(&self, conn: &Connection, document_id: i64) -> Result<(), StateError> {
        for config_name in self.existing_configs() {
            let index = self.index_for(&config_name)?;
            let fields = self.fields(&index)?;
            let mut writer: tantivy::IndexWriter = index
                .writer(WRITER_BUFFER_BYTES)
                .map_err(StateError::tantivy)?;
            writer.delete_term(Term::from_field_text(
                fields.document_id,
                &document_id.to_string(),
            ));
            writer.commit().map_err(StateError::tantivy)?;
        }
        conn.execute(
            "DELETE FROM lexical_vectors
             WHERE section_id IN (SELECT id FROM sections WHERE document_id = ?1)",
            params![document_id],
        )
        .map_err(StateError::sqlite)?;
        Ok(())
    }

    /// Re-compute every lexical row of a document after a language change.
    pub fn rebuild_document(
        &self,
        conn: &Connection,
        registry: &TokenizerRegistry,
        document_id: i64,
    ) -> Result<usize, StateError> {
        let document = crate::documents::get(conn, document_id)?
            .ok_or_else(|| StateError::not_found("document", document_id))?;
        let sections = crate::sections::list_for_document(conn, document_id)?;
        let config_name = registry.lookup(conn, &document.language)?;

        self.delete_document(conn, document_id)?;
        let docs: Vec<LexicalDoc> = sections
            .into_iter()
            .map(|section| LexicalDoc {
                section_id: section.id,
                document_id,
                language: document.language.clone(),
                title: section.title.unwrap_or_default(),
                content: section.content,
            })
            .collect();
        self.upsert_sections(conn, &config_name, &docs)?;
        Ok(docs.len())
    }

    /// Delete lexical rows and tantivy documents whose section no longer
    /// exists. Returns the number of tantivy documents removed.
    pub fn remove_orphaned(&self, conn: &Connection) -> Result<usize, StateError> {
        conn.execute(
            "DELETE FROM lexical_vectors
             WHERE section_id NOT IN (SELECT id FROM sections)",
            [],
        )
        .map_err(StateError::sqlite)?;

        let mut live: HashSet<String> = HashSet::new();
        let mut stmt = conn
            .prepare("SELECT id FROM sections")
            .map_err(StateError::sqlite)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(StateError::sqlite)?;
        for row in rows {
            live.insert(row.map_err(StateError::sqlite)?.to_string());
        }

        let mut removed = 0usize;
        for config_name in self.existing_configs() {
            let index = self.index_for(&config_name)?;
            let fields = self.fields(&index)?;
            let reader = index.reader().map_err(StateError::tantivy)?;
            let searcher = reader.searcher();
            let docs = searcher
                .search(&AllQuery, &DocSetCollector)
                .map_err(StateError::tantivy)?;

            let mut stale = Vec::new();
            for address in docs {
                let stored: TantivyDocument =
                    searcher.doc(address).map_err(StateError::tantivy)?;
                let section_id = stored
                    .get_first(fields.section_id)
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !live.contains(&section_id) {
                    stale.push(section_id);
                }
            }
            if stale.is_empty() {
                continue;
            }
            let mut writer: tantivy::IndexWriter = index
                .writer(WRITER_BUFFER_BYTES)
                .map_err(StateError::tantivy)?;
            for section_id in &stale {
                writer.delete_term(Term::from_field_text(fields.section_id, section_id));
            }
            writer.commit().map_err(StateError::tantivy)?;
            removed += stale.len();
        }
        Ok(removed)
    }

    pub fn fields(&self, index: &Index) -> Result<LexicalFields, StateError> {
        let schema = index.schema();
        let field = |name: &str| schema.get_field(name).map_err(StateError::tantivy);
        Ok(LexicalFields {
            section_id: field("section_id")?,
            document_id: field("document_id")?,
            language: field("language")?,
            title: field("title")?,
            content: field("content")?,
        })
    }

    /// Count lexical documents across all partitions.
    pub fn doc_count(&self) -> Result<u64, StateError> {
        let mut total = 0u64;
        for config_name in self.existing_configs() {
            let index = self.index_for(&config_name)?;
            let reader = index.reader().map_err(StateError::tantivy)?;
            total += reader.searcher().num_docs();
        }
        Ok(total)
    }
}

fn build_schema(config_name: &str) -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field("section_id", STRING | STORED);
    builder.add_text_field("document_id", STRING | STORED);
    builder.add_text_field("language", STRING | STORED);

    let text_options = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(config_name)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field("title", text_options.clone());
    builder.add_text_field("content", text_options);

    builder.build()
}

fn validate_required_fields(index: &Index, current: u32) -> Result<(), StateError> {
    let schema = index.schema();
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|name| schema.get_field(name).is_err())
        .collect();
    if !missing.is_empty() {
        return Err(StateError::SchemaMigrationRequired {
            current,
            required: crate::schema::CURRENT_SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Version recorded when the partition was built; 0 when the marker is
/// missing or unreadable.
fn read_schema_version(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join(SCHEMA_VERSION_FILE))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

fn dir_is_empty(path: &Path) -> Result<bool, StateError> {
    let mut entries = std::fs::read_dir(path).map_err(StateError::Io)?;
    Ok(entries.next().is_none())
}
