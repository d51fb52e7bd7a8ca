use std::path::Path;
use std::time::Duration;
use tessera_core::cancel::CancelSignal;
use tessera_core::error::IngestError;

/// Output of the external document-to-text collaborator.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub markdown: String,
    /// Title inferred by the converter when the caller supplied none.
    pub title: Option<String>,
    /// Canonical URL for create-or-update keying; None for local paths.
    pub url: Option<String>,
}

/// External converter contract: bytes from a URL or path, markdown out.
pub trait DocumentConverter: Send + Sync {
    fn fetch(&self, source: &str, cancel: &CancelSignal) -> Result<FetchedDocument, IngestError>;
}

/// Default converter: HTTP(S) sources are fetched over the network, anything
/// else is read as a local markdown/plain-text file. The HTTP client is
/// built on first use; local ingestion never touches the network stack.
#[derive(Default)]
pub struct DefaultConverter;

impl DefaultConverter {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentConverter for DefaultConverter {
    fn fetch(&self, source: &str, cancel: &CancelSignal) -> Result<FetchedDocument, IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|e| IngestError::converter(source, e))?;
            let response = client
                .get(source)
                .send()
                .map_err(|e| IngestError::converter(source, e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(IngestError::converter(
                    source,
                    format!("fetch returned {status}"),
                ));
            }
            let markdown = response
                .text()
                .map_err(|e| IngestError::converter(source, e))?;
            let title = infer_title(&markdown).or_else(|| last_url_segment(source));
            Ok(FetchedDocument {
                markdown,
                title,
                url: Some(source.to_string()),
            })
        } else {
            let path = Path::new(source);
            let markdown = std::fs::read_to_string(path)
                .map_err(|e| IngestError::converter(source, e))?;
            let title = infer_title(&markdown).or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            });
            // Canonical path keys re-ingest of the same file to one document.
            let url = std::fs::canonicalize(path)
                .map(|canonical| format!("file://{}", canonical.display()))
                .ok();
            Ok(FetchedDocument {
                markdown,
                title,
                url,
            })
        }
    }
}

/// First level-1 heading, if any.
fn infer_title(markdown: &str) -> Option<String> {
    markdown.lines().find_map(|line| {
        let trimmed = line.trim_start();
        trimmed
            .strip_prefix("# ")
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
    })
}

fn last_url_segment(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let trimmed = without_scheme.trim_end_matches('/');
    let (_, segment) = trimmed.rsplit_once('/')?;
    (!segment.is_empty()).then(|| segment.to_string())
}
