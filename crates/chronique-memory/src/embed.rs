//! Embedding provider with mode detection, fallback, and an on-disk
//! vector cache.
//!
//! Three modes, detected once per process and cached:
//!
//! - [`EmbedMode::RemoteHttp`] -- an Ollama-compatible HTTP endpoint.
//!   Availability is probed with a `GET /api/tags` (0.9 s timeout); any
//!   status below 500 proves a listener. Batch embedding posts to
//!   `/api/embed` (8 s timeout) with a per-text `/api/embeddings`
//!   fallback.
//! - [`EmbedMode::LocalModel`] -- a deterministic in-process
//!   feature-hashing embedder (fixed 256 dimensions, token hashes folded
//!   into buckets). No I/O, no model download, stable across runs.
//! - [`EmbedMode::Disabled`] -- misses embed to empty vectors and
//!   retrieval falls back to lexical overlap.
//!
//! The `MEMORY_EMBED_MODE` environment variable forces a mode
//! (`off|none|disabled`, `ollama|remote-http`, `sentence|local-model`);
//! unrecognized values are ignored. When the remote backend fails at
//! embed time the provider falls through to the local embedder; if that
//! too produces nothing the mode degrades to disabled for the rest of
//! the process.
//!
//! Every returned vector is L2-normalized. Empty vectors (unembeddable
//! input or disabled mode) stay empty and are distinct from zero-filled
//! vectors. The cache is one `{"text_hash": …, "vector": […]}` object
//! per line, keyed by [`content_hash`] of the text, sorted by key for
//! reproducibility, and flushed through the store's atomic-write path.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chronique_types::content_hash;
use serde_json::Value;

use crate::error::MemoryError;
use crate::store::MemoryStore;

/// Fixed dimension of the local feature-hashing embedder.
pub const LOCAL_EMBED_DIM: usize = 256;

/// Health-check timeout for the remote backend.
const HEALTH_TIMEOUT: Duration = Duration::from_millis(900);

/// Batch-embedding timeout for the remote backend.
const EMBED_TIMEOUT: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Active embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    /// Ollama-compatible HTTP endpoint.
    RemoteHttp,
    /// In-process deterministic feature-hashing embedder.
    LocalModel,
    /// No embeddings; retrieval degrades to lexical overlap.
    Disabled,
}

impl EmbedMode {
    /// Lowercase wire name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RemoteHttp => "remote-http",
            Self::LocalModel => "local-model",
            Self::Disabled => "disabled",
        }
    }
}

/// Parse the `MEMORY_EMBED_MODE` override; unrecognized values are
/// ignored.
fn forced_mode(raw: &str) -> Option<EmbedMode> {
    match raw.trim().to_lowercase().as_str() {
        "off" | "none" | "disabled" => Some(EmbedMode::Disabled),
        "ollama" | "remote-http" => Some(EmbedMode::RemoteHttp),
        "sentence" | "local-model" => Some(EmbedMode::LocalModel),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

struct CacheState {
    entries: BTreeMap<String, Vec<f32>>,
    dirty: bool,
}

/// Mode-detected embedding backend with a text-hash-keyed vector cache.
pub struct EmbeddingProvider {
    store: MemoryStore,
    base_url: String,
    model: String,
    client: reqwest::Client,
    mode: Mutex<Option<EmbedMode>>,
    cache: Mutex<CacheState>,
}

impl EmbeddingProvider {
    /// Default remote endpoint.
    pub const DEFAULT_BASE_URL: &'static str = "http://127.0.0.1:11434";

    /// Default remote embedding model name.
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";

    /// Provider caching under the store's `emb_cache.jsonl`, talking to
    /// the default remote endpoint.
    pub fn new(store: &MemoryStore) -> Self {
        Self::with_remote(store, Self::DEFAULT_BASE_URL, Self::DEFAULT_MODEL)
    }

    /// Provider with an explicit remote endpoint and model.
    pub fn with_remote(store: &MemoryStore, base_url: &str, model: &str) -> Self {
        let provider = Self {
            store: store.clone(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: if model.trim().is_empty() {
                Self::DEFAULT_MODEL.to_owned()
            } else {
                model.trim().to_owned()
            },
            client: reqwest::Client::new(),
            mode: Mutex::new(None),
            cache: Mutex::new(CacheState {
                entries: BTreeMap::new(),
                dirty: false,
            }),
        };
        provider.load_cache();
        provider
    }

    /// Provider pinned to a mode (tests and deterministic tooling).
    pub fn with_mode(store: &MemoryStore, mode: EmbedMode) -> Self {
        let provider = Self::new(store);
        provider.set_mode(mode);
        provider
    }

    fn set_mode(&self, mode: EmbedMode) {
        let mut guard = self.mode.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(mode);
    }

    fn cached_mode(&self) -> Option<EmbedMode> {
        *self.mode.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Active mode, detecting it on first use.
    pub async fn mode(&self) -> EmbedMode {
        if let Some(mode) = self.cached_mode() {
            return mode;
        }
        let detected = self.detect_mode().await;
        tracing::debug!(mode = detected.as_str(), "embedding mode detected");
        self.set_mode(detected);
        detected
    }

    /// Whether embeddings are produced at all.
    pub async fn enabled(&self) -> bool {
        self.mode().await != EmbedMode::Disabled
    }

    async fn detect_mode(&self) -> EmbedMode {
        if let Ok(raw) = std::env::var("MEMORY_EMBED_MODE") {
            if let Some(forced) = forced_mode(&raw) {
                return forced;
            }
        }
        if self.remote_is_available().await {
            return EmbedMode::RemoteHttp;
        }
        EmbedMode::LocalModel
    }

    async fn remote_is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    fn load_cache(&self) {
        let mut entries: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        for row in self.store.read_jsonl(&self.store.emb_cache_path()) {
            let Some(key) = row.get("text_hash").and_then(Value::as_str) else {
                continue;
            };
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let Some(raw) = row.get("vector").and_then(Value::as_array) else {
                continue;
            };
            let vector: Vec<f32> = raw
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();
            if vector.len() == raw.len() && !vector.is_empty() {
                entries.insert(key, vector);
            }
        }
        let mut guard = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.entries = entries;
        guard.dirty = false;
    }

    /// Atomic rewrite of the cache file, entries sorted by key. A clean
    /// cache is a no-op.
    pub fn flush_cache(&self) -> Result<(), MemoryError> {
        let rows: Vec<Value> = {
            let mut guard =
                self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !guard.dirty {
                return Ok(());
            }
            guard.dirty = false;
            guard
                .entries
                .iter()
                .map(|(key, vector)| {
                    serde_json::json!({
                        "text_hash": key,
                        "vector": vector,
                    })
                })
                .collect()
        };
        self.store.write_jsonl(&self.store.emb_cache_path(), &rows)
    }

    // -----------------------------------------------------------------------
    // Embedding
    // -----------------------------------------------------------------------

    /// Embed a batch of texts, consulting the cache first.
    ///
    /// Always returns one vector per input text, in order. Misses that no
    /// backend can serve come back empty.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let clean: Vec<String> = texts.iter().map(|t| t.trim().to_owned()).collect();
        let hashes: Vec<String> = clean.iter().map(|t| content_hash(t)).collect();

        let mut out: Vec<Option<Vec<f32>>> = vec![None; clean.len()];
        let mut missing_indexes: Vec<usize> = Vec::new();
        let mut missing_texts: Vec<String> = Vec::new();
        {
            let guard = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (idx, key) in hashes.iter().enumerate() {
                match guard.entries.get(key) {
                    Some(cached) if !cached.is_empty() => {
                        if let Some(slot) = out.get_mut(idx) {
                            *slot = Some(cached.clone());
                        }
                    }
                    _ => {
                        missing_indexes.push(idx);
                        missing_texts.push(clean.get(idx).cloned().unwrap_or_default());
                    }
                }
            }
        }

        if !missing_texts.is_empty() {
            let generated = self.embed_misses(&missing_texts).await;
            let mut guard = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (local_idx, vector) in generated.into_iter().enumerate() {
                let Some(&source_idx) = missing_indexes.get(local_idx) else {
                    continue;
                };
                let normalized = normalize_vector(&vector);
                if !normalized.is_empty() {
                    if let Some(key) = hashes.get(source_idx) {
                        guard.entries.insert(key.clone(), normalized.clone());
                        guard.dirty = true;
                    }
                }
                if let Some(slot) = out.get_mut(source_idx) {
                    *slot = Some(normalized);
                }
            }
        }

        self.flush_cache()?;
        Ok(out.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Embed a single text.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vectors = self.embed_texts(&[text.to_owned()]).await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    /// Produce vectors for cache misses through the active backend,
    /// falling through modes on failure.
    async fn embed_misses(&self, texts: &[String]) -> Vec<Vec<f32>> {
        match self.mode().await {
            EmbedMode::Disabled => texts.iter().map(|_| Vec::new()).collect(),
            EmbedMode::LocalModel => texts.iter().map(|t| embed_local(t)).collect(),
            EmbedMode::RemoteHttp => {
                let generated = self.embed_with_remote(texts).await;
                if generated.len() == texts.len() {
                    return generated;
                }
                tracing::warn!("remote embedding backend failed, falling back to local");
                self.set_mode(EmbedMode::LocalModel);
                let local: Vec<Vec<f32>> = texts.iter().map(|t| embed_local(t)).collect();
                if local.iter().all(Vec::is_empty) {
                    self.set_mode(EmbedMode::Disabled);
                }
                local
            }
        }
    }

    /// Batch call against the remote backend; an empty result signals
    /// failure.
    async fn embed_with_remote(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });
        if let Ok(response) = self
            .client
            .post(&url)
            .timeout(EMBED_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            if response.status().is_success() {
                if let Ok(json) = response.json::<Value>().await {
                    if let Some(rows) = json.get("embeddings").and_then(Value::as_array) {
                        let parsed: Vec<Vec<f32>> = rows
                            .iter()
                            .filter_map(Value::as_array)
                            .map(|row| {
                                normalize_vector(
                                    &row.iter()
                                        .filter_map(Value::as_f64)
                                        .map(|v| v as f32)
                                        .collect::<Vec<f32>>(),
                                )
                            })
                            .collect();
                        if parsed.len() == texts.len() {
                            return parsed;
                        }
                    }
                }
            }
        }

        // Older endpoints only expose the per-text route.
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for text in texts {
            let url = format!("{}/api/embeddings", self.base_url);
            let body = serde_json::json!({ "model": self.model, "prompt": text });
            let vector = match self
                .client
                .post(&url)
                .timeout(EMBED_TIMEOUT)
                .json(&body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|json| {
                        json.get("embedding").and_then(Value::as_array).map(|row| {
                            normalize_vector(
                                &row.iter()
                                    .filter_map(Value::as_f64)
                                    .map(|v| v as f32)
                                    .collect::<Vec<f32>>(),
                            )
                        })
                    })
                    .unwrap_or_default(),
                _ => return Vec::new(),
            };
            out.push(vector);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

/// L2-normalize; zero or empty input passes through as empty.
pub fn normalize_vector(vector: &[f32]) -> Vec<f32> {
    let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
    if norm_sq <= 0.0 {
        return Vec::new();
    }
    let norm = norm_sq.sqrt();
    vector.iter().map(|v| v / norm).collect()
}

/// Deterministic feature-hashing embedding.
///
/// Tokens of the normalized text (and their adjacent bigrams) are hashed
/// with FNV-1a into [`LOCAL_EMBED_DIM`] buckets; the bucket histogram is
/// L2-normalized. Blank input yields an empty vector.
pub fn embed_local(text: &str) -> Vec<f32> {
    let normalized = chronique_types::normalize_for_hash(text);
    let tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut buckets = vec![0.0_f32; LOCAL_EMBED_DIM];
    let mut bump = |key: &str| {
        let slot = (fnv1a(key.as_bytes()) as usize) % LOCAL_EMBED_DIM;
        if let Some(cell) = buckets.get_mut(slot) {
            *cell += 1.0;
        }
    };
    for token in &tokens {
        bump(token);
    }
    for pair in tokens.windows(2) {
        if let [a, b] = pair {
            bump(&format!("{a} {b}"));
        }
    }
    normalize_vector(&buckets)
}

/// FNV-1a 64-bit hash.
const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_roots(
            &dir.path().join("memory"),
            &dir.path().join("memory_index"),
        );
        (dir, store)
    }

    // -----------------------------------------------------------------------
    // Local embedder
    // -----------------------------------------------------------------------

    #[test]
    fn local_embedding_is_deterministic_and_normalized() {
        let a = embed_local("Le marchand vend des potions");
        let b = embed_local("le  marchand   vend des potions");
        assert_eq!(a, b);
        assert_eq!(a.len(), LOCAL_EMBED_DIM);
        let norm: f32 = a.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn local_embedding_empty_for_blank_text() {
        assert!(embed_local("   ").is_empty());
        assert!(embed_local("a").is_empty());
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let base = embed_local("le marchand vend des potions au marche");
        let close = embed_local("le marchand vend des potions");
        let far = embed_local("embuscade nocturne sur la route du temple");
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&base, &close) > dot(&base, &far));
    }

    #[test]
    fn normalize_vector_handles_zero() {
        assert!(normalize_vector(&[0.0, 0.0]).is_empty());
        let unit = normalize_vector(&[3.0, 4.0]);
        assert!((unit.first().copied().unwrap() - 0.6).abs() < 1e-6);
    }

    // -----------------------------------------------------------------------
    // Mode override
    // -----------------------------------------------------------------------

    #[test]
    fn forced_mode_parses_documented_values() {
        assert_eq!(forced_mode("off"), Some(EmbedMode::Disabled));
        assert_eq!(forced_mode("NONE"), Some(EmbedMode::Disabled));
        assert_eq!(forced_mode("ollama"), Some(EmbedMode::RemoteHttp));
        assert_eq!(forced_mode("remote-http"), Some(EmbedMode::RemoteHttp));
        assert_eq!(forced_mode("sentence"), Some(EmbedMode::LocalModel));
        assert_eq!(forced_mode("local-model"), Some(EmbedMode::LocalModel));
        assert_eq!(forced_mode("quantum"), None);
    }

    // -----------------------------------------------------------------------
    // Cache behavior (local mode keeps everything deterministic)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cache_round_trips_across_provider_instances() {
        let (_dir, store) = temp_store();
        let provider = EmbeddingProvider::with_mode(&store, EmbedMode::LocalModel);
        let first = provider
            .embed_texts(&[String::from("le garde surveille la porte")])
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first.first().unwrap().is_empty());
        assert!(store.emb_cache_path().exists());

        // A fresh provider reads the flushed cache; a disabled mode would
        // otherwise embed nothing, so a hit proves the cache served it.
        let reread = EmbeddingProvider::with_mode(&store, EmbedMode::Disabled);
        let second = reread
            .embed_texts(&[String::from("le garde surveille la porte")])
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn disabled_mode_embeds_empty_vectors() {
        let (_dir, store) = temp_store();
        let provider = EmbeddingProvider::with_mode(&store, EmbedMode::Disabled);
        let out = provider
            .embed_texts(&[String::from("texte sans embedding")])
            .await
            .unwrap();
        assert_eq!(out, vec![Vec::<f32>::new()]);
    }

    #[tokio::test]
    async fn cache_file_is_sorted_by_key() {
        let (_dir, store) = temp_store();
        let provider = EmbeddingProvider::with_mode(&store, EmbedMode::LocalModel);
        provider
            .embed_texts(&[
                String::from("zeta derniere ligne"),
                String::from("alpha premiere ligne"),
            ])
            .await
            .unwrap();
        let raw = std::fs::read_to_string(store.emb_cache_path()).unwrap();
        let keys: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| {
                row.get("text_hash")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn invalid_cache_lines_are_ignored() {
        let (_dir, store) = temp_store();
        store
            .atomic_write_text(
                &store.emb_cache_path(),
                "not json\n{\"text_hash\": \"abc\", \"vector\": [1.0, 0.0]}\n",
            )
            .unwrap();
        let provider = EmbeddingProvider::with_mode(&store, EmbedMode::Disabled);
        // The valid entry survives; hashing "abc" is not what we cached,
        // so just assert the provider loaded without error by embedding.
        let out = provider.embed_texts(&[String::from("x y")]).await.unwrap();
        assert_eq!(out.len(), 1);
    }
}
