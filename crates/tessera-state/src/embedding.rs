use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tessera_core::cancel::CancelSignal;
use tessera_core::config::EmbeddingConfig;
use tessera_core::error::StateError;
use tracing::{debug, warn};

/// External embedding contract: a batch of texts in, one vector per text out.
pub trait EmbeddingProvider: Send {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError>;
}

/// Build the configured provider: HTTP when an endpoint is configured,
/// otherwise the deterministic local fallback.
pub fn build_provider(config: &EmbeddingConfig) -> Box<dyn EmbeddingProvider> {
    match &config.endpoint {
        Some(endpoint) => Box::new(HttpEmbeddingProvider::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.dimensions,
        )),
        None => {
            warn!("no embedding endpoint configured; using deterministic embeddings");
            Box::new(DeterministicEmbedder::new(config.dimensions))
        }
    }
}

/// HTTP provider for an external embedding service.
pub struct HttpEmbeddingProvider {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            api_key,
            model,
            dimensions,
            client,
        }
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(StateError::embedding)?;
        let status = response.status();
        if !status.is_success() {
            return Err(StateError::Embedding(format!(
                "embedding endpoint returned {status}"
            )));
        }
        let parsed: EmbeddingResponse = response.json().map_err(StateError::embedding)?;
        if parsed.data.len() != inputs.len() {
            return Err(StateError::Embedding(format!(
                "embedding count mismatch: sent {}, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Deterministic hash-based embeddings for tests and offline operation.
///
/// Vectors are stable functions of the input text, so identical texts stay
/// nearest neighbors of themselves across runs.
pub struct DeterministicEmbedder {
    dimensions: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut bytes = vec![0u8; self.dimensions];
        reader.fill(&mut bytes);
        let mut vector: Vec<f32> = bytes
            .into_iter()
            .map(|b| (b as f32 - 127.5) / 127.5)
            .collect();
        let norm = crate::vector_index::l2_norm(&vector);
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl EmbeddingProvider for DeterministicEmbedder {
    fn model_id(&self) -> &str {
        "deterministic"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Batching, retrying, caching front of an [`EmbeddingProvider`].
///
/// Transient provider failures are retried with capped exponential backoff;
/// exhaustion surfaces as an embedding error. Vectors are verified against
/// the configured dimension before they reach any caller. The cache is keyed
/// by content hash with LRU eviction.
pub struct EmbeddingGateway {
    provider: Mutex<Box<dyn EmbeddingProvider>>,
    dimensions: usize,
    batch_size: usize,
    max_retries: u32,
    retry_base: Duration,
    cache: Mutex<VectorCache>,
}

struct VectorCache {
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl VectorCache {
    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, vector: Vec<f32>) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&evicted);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, vector);
    }
}

impl EmbeddingGateway {
    pub fn new(provider: Box<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            dimensions: provider.dimensions(),
            provider: Mutex::new(provider),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            cache: Mutex::new(VectorCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: config.cache_capacity,
            }),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(build_provider(config), config)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed one query string.
    pub fn embed_one(&self, text: &str, cancel: &CancelSignal) -> Result<Vec<f32>, StateError> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string()), cancel)?;
        vectors
            .pop()
            .ok_or_else(|| StateError::Embedding("provider returned no vector".into()))
    }

    /// Embed a list of texts, preserving order.
    pub fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancelSignal,
    ) -> Result<Vec<Vec<f32>>, StateError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String)> = Vec::new();

        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| StateError::Embedding("embedding cache poisoned".into()))?;
            for (i, text) in texts.iter().enumerate() {
                let key = blake3::hash(text.as_bytes()).to_hex().to_string();
                match cache.get(&key) {
                    Some(vector) => results[i] = Some(vector),
                    None => pending.push((i, key)),
                }
            }
        }

        for chunk in pending.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(StateError::Embedding("embedding cancelled".into()));
            }
            let inputs: Vec<String> = chunk.iter().map(|(i, _)| texts[*i].clone()).collect();
            let vectors = self.call_with_retry(&inputs)?;
            if vectors.len() != inputs.len() {
                return Err(StateError::Embedding(format!(
                    "embedding count mismatch: sent {}, got {}",
                    inputs.len(),
                    vectors.len()
                )));
            }
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| StateError::Embedding("embedding cache poisoned".into()))?;
            for ((i, key), vector) in chunk.iter().zip(vectors) {
                if vector.len() != self.dimensions {
                    return Err(StateError::Embedding(format!(
                        "provider returned dimension {}, expected {}",
                        vector.len(),
                        self.dimensions
                    )));
                }
                cache.put(key.clone(), vector.clone());
                results[*i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn call_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
        let mut provider = self
            .provider
            .lock()
            .map_err(|_| StateError::Embedding("embedding provider poisoned".into()))?;
        let mut delay = self.retry_base;
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match provider.embed_batch(inputs) {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    debug!(attempt, error = %e, "embedding call failed");
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        Err(StateError::Embedding(format!(
            "embedding failed after {} attempts: {}",
            self.max_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(dimensions: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions,
            batch_size: 2,
            max_retries: 3,
            retry_base_ms: 1,
            ..Default::default()
        }
    }

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        dimensions: usize,
    }

    impl EmbeddingProvider for CountingProvider {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(StateError::Embedding("transient".into()));
            }
            Ok(inputs.iter().map(|_| vec![1.0; self.dimensions]).collect())
        }
    }

    #[test]
    fn deterministic_embedder_is_stable_and_normalized() {
        let mut embedder = DeterministicEmbedder::new(8);
        let a = embedder.embed_batch(&["hello".into()]).unwrap();
        let b = embedder.embed_batch(&["hello".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 8);
        let norm = crate::vector_index::l2_norm(&a[0]);
        assert!((norm - 1.0).abs() < 1e-5);

        let c = embedder.embed_batch(&["other".into()]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn gateway_batches_and_preserves_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = EmbeddingGateway::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                fail_first: 0,
                dimensions: 4,
            }),
            &config(4),
        );
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let vectors = gateway
            .embed_batch(&texts, &CancelSignal::new())
            .unwrap();
        assert_eq!(vectors.len(), 5);
        // 5 inputs at batch size 2 -> 3 provider calls.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gateway_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = EmbeddingGateway::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                fail_first: 2,
                dimensions: 4,
            }),
            &config(4),
        );
        let vectors = gateway
            .embed_batch(&["a".to_string()], &CancelSignal::new())
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gateway_surfaces_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = EmbeddingGateway::new(
            Box::new(CountingProvider {
                calls,
                fail_first: 100,
                dimensions: 4,
            }),
            &config(4),
        );
        let err = gateway
            .embed_batch(&["a".to_string()], &CancelSignal::new())
            .unwrap_err();
        assert_eq!(err.kind(), "embedding_generation_error");
    }

    #[test]
    fn gateway_caches_repeat_content() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = EmbeddingGateway::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                fail_first: 0,
                dimensions: 4,
            }),
            &config(4),
        );
        let signal = CancelSignal::new();
        gateway.embed_batch(&["same".to_string()], &signal).unwrap();
        gateway.embed_batch(&["same".to_string()], &signal).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_batch_stops_before_provider_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = EmbeddingGateway::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                fail_first: 0,
                dimensions: 4,
            }),
            &config(4),
        );
        let signal = CancelSignal::new();
        signal.cancel();
        let err = gateway
            .embed_batch(&["a".to_string()], &signal)
            .unwrap_err();
        assert_eq!(err.kind(), "embedding_generation_error");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
