use lindera::dictionary::load_dictionary;
use lindera::mode::Mode;
use lindera::segmenter::Segmenter;
use lindera::tokenizer::Tokenizer as LinderaTokenizer;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tantivy::tokenizer::{
    BoxTokenStream, Language, LowerCaser, SimpleTokenizer, Stemmer, TextAnalyzer, Token,
    TokenStream, Tokenizer, TokenizerManager,
};
use tessera_core::constants::DEFAULT_TOKENIZER_CONFIG;
use tessera_core::error::StateError;
use tessera_core::language::normalize_language_code;
use tracing::{info, warn};

/// Every tokenizer configuration the lexical store understands.
///
/// `jieba` is the Chinese segmentation config; `japanese` and `korean` ship
/// registered so administrators can install them onto the `ja`/`ko` codes.
pub const CONFIG_NAMES: &[&str] = &[
    "simple",
    "english",
    "spanish",
    "french",
    "german",
    "italian",
    "russian",
    "jieba",
    "japanese",
    "korean",
];

/// In-process view of the `language_configs` table.
///
/// Read-mostly after warm-up; the only writers are the rare administrative
/// mutations and on-the-fly synthesis of unknown codes.
pub struct TokenizerRegistry {
    cache: RwLock<HashMap<String, ConfigEntry>>,
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    config_name: String,
    installed: bool,
}

impl TokenizerRegistry {
    /// Warm the registry from the persisted rows.
    pub fn load(conn: &Connection) -> Result<Self, StateError> {
        let mut stmt = conn
            .prepare("SELECT code, config_name, installed FROM language_configs")
            .map_err(StateError::sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ConfigEntry {
                        config_name: row.get(1)?,
                        installed: row.get::<_, i64>(2)? != 0,
                    },
                ))
            })
            .map_err(StateError::sqlite)?;

        let mut cache = HashMap::new();
        for row in rows {
            let (code, entry) = row.map_err(StateError::sqlite)?;
            cache.insert(code, entry);
        }
        info!(configs = cache.len(), "tokenizer registry loaded");
        Ok(Self {
            cache: RwLock::new(cache),
        })
    }

    /// Resolve a language code to a tokenizer configuration name.
    ///
    /// Policy: exact code, then the `_`-prefix (`zh_hk` → `zh`), then the
    /// `default` row; an unknown code gets a `simple` row synthesized and
    /// persisted so later lookups are exact.
    pub fn lookup(&self, conn: &Connection, code: &str) -> Result<String, StateError> {
        let code = normalize_language_code(code);
        if code.is_empty() {
            return self.lookup(conn, "default");
        }

        if let Some(found) = self.cached_installed(&code) {
            return Ok(found);
        }

        if let Some(prefix) = code.split('_').next()
            && prefix != code
            && let Some(found) = self.cached_installed(prefix)
        {
            return Ok(found);
        }

        if code != "default"
            && let Some(found) = self.cached_installed("default")
        {
            return Ok(found);
        }

        // Unknown code with no usable default: synthesize a simple row.
        conn.execute(
            "INSERT INTO language_configs (code, config_name, installed)
             VALUES (?1, ?2, 1)
             ON CONFLICT(code) DO UPDATE SET config_name = excluded.config_name, installed = 1",
            params![code, DEFAULT_TOKENIZER_CONFIG],
        )
        .map_err(StateError::sqlite)?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                code.clone(),
                ConfigEntry {
                    config_name: DEFAULT_TOKENIZER_CONFIG.to_string(),
                    installed: true,
                },
            );
        }
        warn!(code = %code, "synthesized simple tokenizer config for unknown language");
        Ok(DEFAULT_TOKENIZER_CONFIG.to_string())
    }

    fn cached_installed(&self, code: &str) -> Option<String> {
        let cache = self.cache.read().ok()?;
        cache
            .get(code)
            .filter(|entry| entry.installed)
            .map(|entry| entry.config_name.clone())
    }

    /// Administrative install: bind a language code to a config name.
    pub fn install(
        &self,
        conn: &Connection,
        code: &str,
        config_name: &str,
    ) -> Result<(), StateError> {
        if !CONFIG_NAMES.contains(&config_name) {
            return Err(StateError::invalid_argument(format!(
                "unknown tokenizer config: {config_name}"
            )));
        }
        let code = normalize_language_code(code);
        conn.execute(
            "INSERT INTO language_configs (code, config_name, installed)
             VALUES (?1, ?2, 1)
             ON CONFLICT(code) DO UPDATE SET config_name = excluded.config_name, installed = 1",
            params![code, config_name],
        )
        .map_err(StateError::sqlite)?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                code,
                ConfigEntry {
                    config_name: config_name.to_string(),
                    installed: true,
                },
            );
        }
        Ok(())
    }

    /// Administrative uninstall: the code falls back through the lookup policy.
    pub fn uninstall(&self, conn: &Connection, code: &str) -> Result<(), StateError> {
        let code = normalize_language_code(code);
        let changed = conn
            .execute(
                "UPDATE language_configs SET installed = 0 WHERE code = ?1",
                params![code],
            )
            .map_err(StateError::sqlite)?;
        if changed == 0 {
            return Err(StateError::not_found("language_config", code));
        }
        if let Ok(mut cache) = self.cache.write()
            && let Some(entry) = cache.get_mut(&code)
        {
            entry.installed = false;
        }
        Ok(())
    }

}

/// Segmenting tokenizer backed by a lindera dictionary (cc-cedict, unidic,
/// ko-dic). The dictionary is shared; clones are cheap.
#[derive(Clone)]
pub struct SegmentingTokenizer {
    inner: Arc<LinderaTokenizer>,
}

type SegmenterCache = HashMap<String, SegmentingTokenizer>;
static SEGMENTER_CACHE: OnceLock<Mutex<SegmenterCache>> = OnceLock::new();

impl SegmentingTokenizer {
    fn new(dictionary_uri: &str) -> Result<Self, StateError> {
        let dictionary = load_dictionary(dictionary_uri)
            .map_err(|e| StateError::tantivy(format!("lindera dictionary {dictionary_uri}: {e}")))?;
        let segmenter = Segmenter::new(Mode::Normal, dictionary, None);
        Ok(Self {
            inner: Arc::new(LinderaTokenizer::new(segmenter)),
        })
    }

    /// Dictionaries are large; load each one once per process and share it.
    fn cached(dictionary_uri: &str) -> Result<Self, StateError> {
        let cache = SEGMENTER_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        if let Ok(guard) = cache.lock()
            && let Some(tokenizer) = guard.get(dictionary_uri)
        {
            return Ok(tokenizer.clone());
        }
        let built = Self::new(dictionary_uri)?;
        if let Ok(mut guard) = cache.lock() {
            guard.insert(dictionary_uri.to_string(), built.clone());
        }
        Ok(built)
    }
}

impl Tokenizer for SegmentingTokenizer {
    type TokenStream<'a> = BoxTokenStream<'a>;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        let tokens = match self.inner.tokenize(text) {
            Ok(segments) => segments
                .into_iter()
                .filter(|segment| !segment.surface.trim().is_empty())
                .map(|segment| (segment.surface.to_lowercase(), segment.byte_start, segment.byte_end))
                .collect(),
            Err(e) => {
                warn!(error = %e, "lindera tokenization failed; emitting no tokens");
                Vec::new()
            }
        };
        BoxTokenStream::new(OffsetTokenStream::new(tokens))
    }
}

/// A token stream backed by pre-segmented (text, byte_start, byte_end) triples.
struct OffsetTokenStream {
    tokens: Vec<Token>,
    index: usize,
}

impl OffsetTokenStream {
    fn new(segments: Vec<(String, usize, usize)>) -> Self {
        let tokens = segments
            .into_iter()
            .enumerate()
            .map(|(position, (text, offset_from, offset_to))| Token {
                offset_from,
                offset_to,
                position,
                text,
                position_length: 1,
            })
            .collect();
        Self { tokens, index: 0 }
    }
}

impl TokenStream for OffsetTokenStream {
    fn advance(&mut self) -> bool {
        if self.index < self.tokens.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.index - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.index - 1]
    }
}

/// Register every named tokenizer configuration on a tantivy manager.
pub fn register_tokenizers(manager: &TokenizerManager) -> Result<(), StateError> {
    manager.register(
        "simple",
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build(),
    );

    for (name, language) in [
        ("english", Language::English),
        ("spanish", Language::Spanish),
        ("french", Language::French),
        ("german", Language::German),
        ("italian", Language::Italian),
        ("russian", Language::Russian),
    ] {
        manager.register(
            name,
            TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(LowerCaser)
                .filter(Stemmer::new(language))
                .build(),
        );
    }

    manager.register("jieba", SegmentingTokenizer::cached("embedded://cc-cedict")?);
    manager.register("japanese", SegmentingTokenizer::cached("embedded://unidic")?);
    manager.register("korean", SegmentingTokenizer::cached("embedded://ko-dic")?);

    Ok(())
}
