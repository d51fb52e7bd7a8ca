use crate::chunker::{self, Chunk};
use crate::converter::DocumentConverter;
use rusqlite::Connection;
use tessera_core::cancel::CancelSignal;
use tessera_core::config::ChunkerConfig;
use tessera_core::error::{IngestError, StateError};
use tessera_core::language::detect_language;
use tessera_core::types::DownloadState;
use tessera_state::embedding::EmbeddingGateway;
use tessera_state::lexical_index::{LexicalDoc, LexicalIndexSet};
use tessera_state::tokenizers::TokenizerRegistry;
use tessera_state::{documents, sections, tags, topics, vector_index};
use tracing::{info, warn};

/// Per-ingest options; defaults match the CLI surface.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub publication_date: Option<String>,
    pub description: Option<String>,
    pub generate_embeddings: bool,
    pub tags: Vec<String>,
    pub topic_ids: Vec<i64>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            title: None,
            author: None,
            language: None,
            publication_date: None,
            description: None,
            generate_embeddings: true,
            tags: Vec::new(),
            topic_ids: Vec::new(),
        }
    }
}

/// Outcome of one successful ingest.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: i64,
    pub section_count: usize,
    pub embedded_count: usize,
    pub language: String,
}

/// Outcome of a batch: individual failures never abort the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<(String, String)>,
}

/// The ingestion pipeline: converter fetch, document upsert, chunking,
/// embedding, transactional section replacement, lexical indexing.
pub struct Pipeline<'a> {
    pub conn: &'a Connection,
    pub lexical: &'a LexicalIndexSet,
    pub registry: &'a TokenizerRegistry,
    pub gateway: &'a EmbeddingGateway,
    pub converter: &'a dyn DocumentConverter,
    pub chunker: ChunkerConfig,
}

impl Pipeline<'_> {
    /// Ingest one source. From a reader's viewpoint the document's section
    /// set swaps atomically: embeddings are computed before the write
    /// transaction opens, so a failed embed leaves the previous set intact.
    pub fn ingest(
        &self,
        source: &str,
        options: &IngestOptions,
        cancel: &CancelSignal,
    ) -> Result<IngestReport, IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let fetched = self.converter.fetch(source, cancel)?;

        let title = options
            .title
            .clone()
            .or(fetched.title)
            .unwrap_or_else(|| source.to_string());
        let language = options
            .language
            .clone()
            .unwrap_or_else(|| detect_language(&fetched.markdown).to_string());

        let document = documents::create_or_update(
            self.conn,
            &documents::NewDocument {
                title,
                url: fetched.url.clone(),
                author: options.author.clone(),
                publication_date: options.publication_date.clone(),
                language: Some(language),
                description: options.description.clone(),
                metadata: Default::default(),
            },
        )?;

        match self.process_document(document.id, &fetched.markdown, options, cancel) {
            Ok(report) => {
                documents::set_download_state(self.conn, document.id, DownloadState::Completed)?;
                info!(
                    document_id = document.id,
                    sections = report.section_count,
                    embedded = report.embedded_count,
                    "document ingested"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(state_err) =
                    documents::set_download_state(self.conn, document.id, DownloadState::Failed)
                {
                    warn!(error = %state_err, document_id = document.id,
                        "failed to mark document as failed");
                }
                Err(match e {
                    IngestError::Cancelled | IngestError::EmbeddingGeneration(_) => e,
                    other => IngestError::processing(source, other),
                })
            }
        }
    }

    fn process_document(
        &self,
        document_id: i64,
        markdown: &str,
        options: &IngestOptions,
        cancel: &CancelSignal,
    ) -> Result<IngestReport, IngestError> {
        let document = documents::get(self.conn, document_id)?
            .ok_or_else(|| StateError::not_found("document", document_id))?;

        let chunks = chunker::chunk_markdown(markdown, &self.chunker);
        if chunks.is_empty() {
            return Err(IngestError::processing(
                document_id.to_string(),
                "chunker produced no sections",
            ));
        }

        // Embeddings first: chunk contents are known before any row changes,
        // and a provider failure must leave the old section set visible.
        let vectors = if options.generate_embeddings {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .gateway
                .embed_batch(&texts, cancel)
                .map_err(|e| IngestError::EmbeddingGeneration(e.to_string()))?;
            Some(vectors)
        } else {
            None
        };

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        // One transaction: old sections out (cascading embeddings and lexical
        // rows), new sections and embeddings in.
        let section_ids = {
            let tx = self
                .conn
                .unchecked_transaction()
                .map_err(StateError::sqlite)?;
            let new_sections: Vec<sections::NewSection> = chunks
                .iter()
                .map(|chunk| sections::NewSection {
                    title: chunk.title.clone(),
                    content: chunk.content.clone(),
                })
                .collect();
            let section_ids = sections::replace_rows(&tx, document_id, &new_sections)?;
            if let Some(vectors) = &vectors {
                for (section_id, vector) in section_ids.iter().zip(vectors) {
                    vector_index::insert(&tx, *section_id, vector, self.gateway.dimensions())?;
                }
            }
            tx.commit().map_err(StateError::sqlite)?;
            section_ids
        };

        // Lexical rows follow the committed sections; readers join through
        // the sections table, so a lagging lexical doc is invisible.
        let config_name = self.registry.lookup(self.conn, &document.language)?;
        let lexical_docs: Vec<LexicalDoc> = section_ids
            .iter()
            .zip(&chunks)
            .map(|(section_id, chunk): (&i64, &Chunk)| LexicalDoc {
                section_id: *section_id,
                document_id,
                language: document.language.clone(),
                title: chunk.title.clone().unwrap_or_default(),
                content: chunk.content.clone(),
            })
            .collect();
        self.lexical
            .upsert_sections(self.conn, &config_name, &lexical_docs)?;

        for tag_name in &options.tags {
            let tag = tags::get_or_create(self.conn, tag_name)?;
            for section_id in &section_ids {
                tags::link_section(self.conn, *section_id, tag.id)?;
            }
        }
        for topic_id in &options.topic_ids {
            for section_id in &section_ids {
                topics::link_section(self.conn, *topic_id, *section_id)?;
            }
        }

        Ok(IngestReport {
            document_id,
            section_count: section_ids.len(),
            embedded_count: vectors.map(|v| v.len()).unwrap_or(0),
            language: document.language,
        })
    }

    /// Ingest many sources; failures are collected, not fatal.
    pub fn batch_update(
        &self,
        items: &[(String, IngestOptions)],
        cancel: &CancelSignal,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (source, options) in items {
            if cancel.is_cancelled() {
                report.failed += 1;
                report
                    .errors
                    .push((source.clone(), "cancelled".to_string()));
                continue;
            }
            match self.ingest(source, options, cancel) {
                Ok(_) => report.success += 1,
                Err(e) => {
                    warn!(source = %source, error = %e, "batch ingest item failed");
                    report.failed += 1;
                    report.errors.push((source.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Remove a document and everything hanging off it, lexical docs included.
    pub fn remove_document(&self, document_id: i64) -> Result<(), IngestError> {
        self.lexical.delete_document(self.conn, document_id)?;
        documents::delete(self.conn, document_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::FetchedDocument;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tessera_core::config::EmbeddingConfig;
    use tessera_state::embedding::{DeterministicEmbedder, EmbeddingProvider};
    use tessera_state::{db, schema, search_log};

    struct StaticConverter {
        markdown: String,
        url: Option<String>,
    }

    impl DocumentConverter for StaticConverter {
        fn fetch(&self, _source: &str, _cancel: &CancelSignal) -> Result<FetchedDocument, IngestError> {
            Ok(FetchedDocument {
                markdown: self.markdown.clone(),
                title: None,
                url: self.url.clone(),
            })
        }
    }

    struct FailingProvider;

    impl EmbeddingProvider for FailingProvider {
        fn model_id(&self) -> &str {
            "failing"
        }
        fn dimensions(&self) -> usize {
            8
        }
        fn embed_batch(&mut self, _inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
            Err(StateError::Embedding("provider down".into()))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        conn: Connection,
        lexical: LexicalIndexSet,
        registry: TokenizerRegistry,
        gateway: EmbeddingGateway,
    }

    fn embedding_config(dimensions: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions,
            batch_size: 4,
            max_retries: 2,
            retry_base_ms: 1,
            ..Default::default()
        }
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        let lexical = LexicalIndexSet::open(&dir.path().join("lexical")).unwrap();
        let registry = TokenizerRegistry::load(&conn).unwrap();
        let gateway = EmbeddingGateway::new(
            Box::new(DeterministicEmbedder::new(8)),
            &embedding_config(8),
        );
        Harness {
            _dir: dir,
            conn,
            lexical,
            registry,
            gateway,
        }
    }

    fn pipeline<'a>(h: &'a Harness, converter: &'a dyn DocumentConverter) -> Pipeline<'a> {
        Pipeline {
            conn: &h.conn,
            lexical: &h.lexical,
            registry: &h.registry,
            gateway: &h.gateway,
            converter,
            chunker: ChunkerConfig::default(),
        }
    }

    const DOC: &str = "# Guide\n\nintro text\n\n## Alpha\n\nalpha body text\n\n## Beta\n\nbeta body text";

    #[test]
    fn ingest_creates_sections_embeddings_and_lexical_rows() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let report = pipeline(&h, &converter)
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        assert_eq!(report.section_count, 2);
        assert_eq!(report.embedded_count, 2);
        assert_eq!(report.language, "en");

        let document = documents::get_by_url(&h.conn, "https://x/guide")
            .unwrap()
            .unwrap();
        assert_eq!(document.download_state, DownloadState::Completed);
        assert_eq!(sections::count_for_document(&h.conn, document.id).unwrap(), 2);
        assert_eq!(vector_index::count(&h.conn).unwrap(), 2);

        let lexical_rows: i64 = h
            .conn
            .query_row("SELECT COUNT(*) FROM lexical_vectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(lexical_rows, 2);
    }

    #[test]
    fn section_count_matches_chunker_output() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        pipeline(&h, &converter)
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        let expected = chunker::chunk_markdown(DOC, &ChunkerConfig::default()).len();
        let document = documents::get_by_url(&h.conn, "https://x/guide")
            .unwrap()
            .unwrap();
        assert_eq!(
            sections::count_for_document(&h.conn, document.id).unwrap() as usize,
            expected
        );
    }

    #[test]
    fn reingest_replaces_sections_atomically() {
        let h = harness();
        let first = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let report_one = pipeline(&h, &first)
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        let second = StaticConverter {
            markdown: "## Only\n\nreplacement body".into(),
            url: Some("https://x/guide".into()),
        };
        let report_two = pipeline(&h, &second)
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        assert_eq!(report_one.document_id, report_two.document_id);
        let sections = sections::list_for_document(&h.conn, report_two.document_id).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title.as_deref(), Some("Only"));
        // Embeddings follow the swap.
        assert_eq!(vector_index::count(&h.conn).unwrap(), 1);
    }

    #[test]
    fn reingesting_identical_content_preserves_shape() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let p = pipeline(&h, &converter);
        let first = p
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();
        let before = sections::list_for_document(&h.conn, first.document_id).unwrap();

        let second = p
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();
        let after = sections::list_for_document(&h.conn, second.document_id).unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.section_number, b.section_number);
            assert_eq!(a.title, b.title);
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn embedding_failure_marks_failed_and_keeps_old_sections() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        pipeline(&h, &converter)
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        let failing_gateway = EmbeddingGateway::new(Box::new(FailingProvider), &embedding_config(8));
        let p = Pipeline {
            gateway: &failing_gateway,
            ..pipeline(&h, &converter)
        };
        let err = p
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap_err();
        assert_eq!(err.kind(), "embedding_generation_error");

        let document = documents::get_by_url(&h.conn, "https://x/guide")
            .unwrap()
            .unwrap();
        assert_eq!(document.download_state, DownloadState::Failed);
        // The previous section set survived the failed re-ingest.
        assert_eq!(sections::count_for_document(&h.conn, document.id).unwrap(), 2);
    }

    #[test]
    fn no_embed_option_skips_vectors() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let options = IngestOptions {
            generate_embeddings: false,
            ..Default::default()
        };
        let report = pipeline(&h, &converter)
            .ingest("https://x/guide", &options, &CancelSignal::new())
            .unwrap();
        assert_eq!(report.embedded_count, 0);
        assert_eq!(vector_index::count(&h.conn).unwrap(), 0);
    }

    #[test]
    fn chinese_document_lands_in_the_jieba_partition() {
        let h = harness();
        let converter = StaticConverter {
            markdown: "## 机器学习\n\n机器学习是人工智能的一个分支领域".into(),
            url: Some("https://x/zh".into()),
        };
        let report = pipeline(&h, &converter)
            .ingest("https://x/zh", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();
        assert_eq!(report.language, "zh");

        let lang: String = h
            .conn
            .query_row(
                "SELECT language FROM lexical_vectors LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(lang, "zh");
        assert!(h.lexical.existing_configs().contains(&"jieba".to_string()));
    }

    #[test]
    fn tags_and_topics_are_linked() {
        let h = harness();
        let topic = topics::create(&h.conn, "retrieval", None).unwrap();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let options = IngestOptions {
            tags: vec!["ml".into()],
            topic_ids: vec![topic.id],
            ..Default::default()
        };
        let report = pipeline(&h, &converter)
            .ingest("https://x/guide", &options, &CancelSignal::new())
            .unwrap();

        let tag = tags::get_by_name(&h.conn, "ml").unwrap().unwrap();
        let sections = sections::list_for_document(&h.conn, report.document_id).unwrap();
        for section in &sections {
            let linked = tags::tags_for_section(&h.conn, section.id).unwrap();
            assert_eq!(linked[0].id, tag.id);
        }
        assert_eq!(
            topics::section_ids(&h.conn, topic.id).unwrap().len(),
            sections.len()
        );
    }

    #[test]
    fn batch_update_collects_failures() {
        let h = harness();

        struct FlakyConverter {
            calls: Mutex<usize>,
        }
        impl DocumentConverter for FlakyConverter {
            fn fetch(
                &self,
                source: &str,
                _cancel: &CancelSignal,
            ) -> Result<FetchedDocument, IngestError> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if source.contains("bad") {
                    return Err(IngestError::converter(source, "unreachable"));
                }
                Ok(FetchedDocument {
                    markdown: DOC.into(),
                    title: None,
                    url: Some(source.to_string()),
                })
            }
        }

        let converter = FlakyConverter {
            calls: Mutex::new(0),
        };
        let p = pipeline(&h, &converter);
        let report = p.batch_update(
            &[
                ("https://x/good-1".to_string(), IngestOptions::default()),
                ("https://x/bad".to_string(), IngestOptions::default()),
                ("https://x/good-2".to_string(), IngestOptions::default()),
            ],
            &CancelSignal::new(),
        );

        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].0.contains("bad"));
    }

    #[test]
    fn remove_document_clears_every_table() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let p = pipeline(&h, &converter);
        let report = p
            .ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        p.remove_document(report.document_id).unwrap();

        assert!(documents::get(&h.conn, report.document_id).unwrap().is_none());
        assert_eq!(sections::count_all(&h.conn).unwrap(), 0);
        assert_eq!(vector_index::count(&h.conn).unwrap(), 0);
        let lexical_rows: i64 = h
            .conn
            .query_row("SELECT COUNT(*) FROM lexical_vectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(lexical_rows, 0);
        // The logger table is untouched by removal.
        assert_eq!(search_log::count(&h.conn).unwrap(), 0);
    }

    #[test]
    fn cancellation_aborts_before_section_swap() {
        let h = harness();
        let converter = StaticConverter {
            markdown: DOC.into(),
            url: Some("https://x/guide".into()),
        };
        let p = pipeline(&h, &converter);
        p.ingest("https://x/guide", &IngestOptions::default(), &CancelSignal::new())
            .unwrap();

        let signal = CancelSignal::new();
        signal.cancel();
        let err = p
            .ingest("https://x/guide", &IngestOptions::default(), &signal)
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        // Old sections still in place.
        let document = documents::get_by_url(&h.conn, "https://x/guide")
            .unwrap()
            .unwrap();
        assert_eq!(sections::count_for_document(&h.conn, document.id).unwrap(), 2);
    }
}
