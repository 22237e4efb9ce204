//! Memory service: orchestration of store, embeddings, index, compactor,
//! and retrieval.
//!
//! Per-NPC memories are scoped by save profile: the key for an NPC is
//! `safe_id(profile)__safe_id(npc_id)`, so two profiles never share
//! dialogue history. The world memory is scope-free and serialized
//! globally.
//!
//! The service owns the in-process cache of per-NPC vector indices and
//! the single world index. Appends run compaction inline (planner first,
//! deterministic fallback otherwise); a compaction that changed the
//! memory triggers an index rebuild before the append returns, so the
//! next retrieval on the same scope reads a current index.
//!
//! A process-wide singleton is available through
//! [`get_memory_service`] / [`set_memory_service`]; the setter exists for
//! test injection and is the only supported replacement path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use chronique_types::{
    ImpactLevel, MemoryDebt, MemoryEvent, MemoryFact, MemoryPromise, NpcMemory, Role, ShortTurn,
    WorldMemory, clean_tag, clean_text, content_hash, utc_now_iso,
};
use serde_json::Value;
use uuid::Uuid;

use crate::compactor::{
    CompactionPlanner, compact_npc_memory, compact_world_memory, log_compaction_result,
};
use crate::embed::EmbeddingProvider;
use crate::error::MemoryError;
use crate::index::{IndexRecord, VectorHit, VectorIndex};
use crate::retrieval::{RetrievalMode, retrieve_context};
use crate::store::{MemoryStore, safe_id};

// ---------------------------------------------------------------------------
// Prompt context envelope
// ---------------------------------------------------------------------------

/// The four context streams packaged for prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptMemoryContext {
    /// Recent dialogue lines.
    pub short_lines: Vec<String>,
    /// Scored long-memory lines.
    pub long_lines: Vec<String>,
    /// World-scope lines (populated in world/both modes).
    pub world_lines: Vec<String>,
    /// Semantic recall lines.
    pub retrieved_lines: Vec<String>,
}

impl PromptMemoryContext {
    /// Short lines joined, or a placeholder.
    pub fn short_text(&self) -> String {
        if self.short_lines.is_empty() {
            String::from("(aucun echange recent)")
        } else {
            self.short_lines.join("\n")
        }
    }

    /// Long lines joined, or a placeholder.
    pub fn long_text(&self) -> String {
        if self.long_lines.is_empty() {
            String::from("(aucune memoire long terme)")
        } else {
            self.long_lines.join("\n")
        }
    }

    /// World lines joined, or a placeholder.
    pub fn world_text(&self) -> String {
        if self.world_lines.is_empty() {
            String::from("(aucune memoire globale)")
        } else {
            self.world_lines.join("\n")
        }
    }

    /// Retrieved lines joined, or a placeholder.
    pub fn retrieved_text(&self) -> String {
        if self.retrieved_lines.is_empty() {
            String::from("(aucun rappel semantique)")
        } else {
            self.retrieved_lines.join("\n")
        }
    }
}

// ---------------------------------------------------------------------------
// Tag helpers
// ---------------------------------------------------------------------------

/// Keyword families mixed into short-turn tags on append.
const KIND_TAG_RULES: &[(&str, &[&str])] = &[
    ("trade", &["acheter", "vendre", "prix", "or", "echange", "marchand"]),
    ("quest", &["quete", "mission", "objectif", "contrat"]),
    ("combat", &["combat", "attaque", "monstre", "donjon", "defaite", "victoire"]),
    ("training", &["entrain", "competence", "sort", "niveau"]),
    ("travel", &["voyage", "route", "deplacement", "ville"]),
    ("promise", &["promis", "promets", "je vais", "je ferai"]),
    ("debt", &["dette", "rembours", "payer", "creance"]),
    ("relationship", &["confiance", "trahison", "amour", "haine", "respect"]),
];

fn extract_kind_tags(text: &str) -> Vec<String> {
    let hay = text.to_lowercase();
    KIND_TAG_RULES
        .iter()
        .filter(|(_, words)| words.iter().any(|w| hay.contains(w)))
        .map(|(tag, _)| (*tag).to_owned())
        .collect()
}

const fn role_tag(role: Role) -> &'static str {
    match role {
        Role::Player => "player",
        Role::Npc => "npc",
        Role::System => "system",
        Role::Narration => "narration",
    }
}

/// Normalize an importance value into `[0, 1]`; legacy 0-5 scales are
/// divided down.
fn to_importance_01(value: f64, default: f64) -> f64 {
    let mut num = if value.is_finite() { value } else { default };
    if num > 1.0 {
        num /= 5.0;
    }
    num.clamp(0.0, 1.0)
}

/// Words that promote a system event to high impact.
const HIGH_IMPACT_WORDS: &[&str] = &["mort", "defaite", "rupture", "boss"];

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct IndexCache {
    npc: HashMap<String, VectorIndex>,
    npc_loaded: HashSet<String>,
    world: VectorIndex,
    world_loaded: bool,
}

/// Orchestrates persistence, compaction, indexing, and retrieval for all
/// memory scopes.
pub struct MemoryService {
    store: MemoryStore,
    embeddings: EmbeddingProvider,
    planner: Option<Arc<dyn CompactionPlanner>>,
    indexes: Mutex<IndexCache>,
}

impl MemoryService {
    /// Service over the default `data/` layout.
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let embeddings = EmbeddingProvider::new(&store);
        Self::with_parts(store, embeddings)
    }

    /// Service over explicit store and embedding provider.
    pub fn with_parts(store: MemoryStore, embeddings: EmbeddingProvider) -> Self {
        Self {
            store,
            embeddings,
            planner: None,
            indexes: Mutex::new(IndexCache {
                npc: HashMap::new(),
                npc_loaded: HashSet::new(),
                world: VectorIndex::new(),
                world_loaded: false,
            }),
        }
    }

    /// Register an AI compaction planner.
    #[must_use]
    pub fn with_planner(mut self, planner: Arc<dyn CompactionPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Backing store.
    pub const fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Embedding provider.
    pub const fn embeddings(&self) -> &EmbeddingProvider {
        &self.embeddings
    }

    // -----------------------------------------------------------------------
    // Scoping
    // -----------------------------------------------------------------------

    /// Composite per-profile NPC key: `safe(profile)__safe(npc)`.
    pub fn scoped_npc_id(&self, profile_key: &str, npc_id: &str) -> String {
        let scope = safe_id(profile_key, "default");
        let npc = safe_id(npc_id, "unknown");
        format!("{scope}__{npc}")
    }

    /// Strip the profile scope off a scoped NPC id.
    pub fn base_npc_id(&self, scoped_npc_id: &str) -> String {
        let text = scoped_npc_id.trim();
        text.split_once("__")
            .map_or_else(|| text.to_owned(), |(_, rest)| rest.to_owned())
    }

    // -----------------------------------------------------------------------
    // Document access
    // -----------------------------------------------------------------------

    /// Load the scoped NPC memory, creating it on first access.
    pub fn load_npc_memory(&self, profile_key: &str, npc_id: &str) -> Result<NpcMemory, MemoryError> {
        let scoped = self.scoped_npc_id(profile_key, npc_id);
        let mut memory = self.store.load_npc_memory(&scoped)?;
        if memory.npc_id.is_empty() {
            memory.npc_id = scoped;
        }
        Ok(memory)
    }

    /// Persist an NPC memory.
    pub fn save_npc_memory(&self, memory: &NpcMemory) -> Result<(), MemoryError> {
        self.store.save_npc_memory(memory)
    }

    /// Load the world memory.
    pub fn load_world_memory(&self) -> Result<WorldMemory, MemoryError> {
        self.store.load_world_memory()
    }

    /// Persist the world memory.
    pub fn save_world_memory(&self, memory: &WorldMemory) -> Result<(), MemoryError> {
        self.store.save_world_memory(memory)
    }

    // -----------------------------------------------------------------------
    // Appends
    // -----------------------------------------------------------------------

    fn memory_turn(
        &self,
        role: Role,
        text: &str,
        tags: &[String],
        importance: f64,
        turn_id: Option<&str>,
    ) -> ShortTurn {
        let mut clean_tags: Vec<String> = tags
            .iter()
            .map(|tag| clean_tag(tag, 48))
            .filter(|tag| !tag.is_empty())
            .collect();
        let role_slug = role_tag(role).to_owned();
        if !clean_tags.contains(&role_slug) {
            clean_tags.push(role_slug);
        }
        for tag in extract_kind_tags(text) {
            let clean = clean_tag(&tag, 48);
            if !clean.is_empty() && !clean_tags.contains(&clean) {
                clean_tags.push(clean);
            }
        }
        clean_tags.truncate(24);
        ShortTurn::new(
            role,
            text,
            clean_tags,
            importance,
            turn_id.unwrap_or(""),
        )
    }

    /// Append a short turn to a scoped NPC memory.
    ///
    /// Returns `false` (and does nothing) when the cleaned text is empty.
    /// Compaction runs inline; when it changed the memory, the NPC index
    /// is rebuilt before returning.
    pub async fn append_short(
        &self,
        profile_key: &str,
        npc_id: &str,
        role: Role,
        text: &str,
        tags: &[String],
        importance: f64,
        turn_id: Option<&str>,
    ) -> Result<bool, MemoryError> {
        let clean = clean_text(text, ShortTurn::TEXT_MAX);
        if clean.is_empty() {
            return Ok(false);
        }
        let mut memory = self.load_npc_memory(profile_key, npc_id)?;
        memory.short.push(self.memory_turn(
            role,
            &clean,
            tags,
            to_importance_01(importance, 0.45),
            turn_id,
        ));
        let compacted = compact_npc_memory(&mut memory, self.planner.as_deref());
        log_compaction_result(&format!("npc={}", memory.npc_id), &compacted);
        self.save_npc_memory(&memory)?;
        if compacted.changed {
            self.rebuild_npc_index(profile_key, npc_id).await?;
        }
        Ok(true)
    }

    /// Append a short turn to the world memory.
    pub async fn append_world_short(
        &self,
        role: Role,
        text: &str,
        tags: &[String],
        importance: f64,
        turn_id: Option<&str>,
    ) -> Result<bool, MemoryError> {
        let clean = clean_text(text, ShortTurn::TEXT_MAX);
        if clean.is_empty() {
            return Ok(false);
        }
        let mut memory = self.load_world_memory()?;
        memory.short.push(self.memory_turn(
            role,
            &clean,
            tags,
            to_importance_01(importance, 0.4),
            turn_id,
        ));
        let compacted = compact_world_memory(&mut memory, self.planner.as_deref());
        log_compaction_result("world", &compacted);
        self.save_world_memory(&memory)?;
        if compacted.changed {
            self.rebuild_world_index().await?;
        }
        Ok(true)
    }

    /// Record both halves of a dialogue turn under one shared turn id
    /// (player first, then NPC).
    pub async fn remember_dialogue_turn(
        &self,
        profile_key: &str,
        npc_id: &str,
        player_text: &str,
        npc_reply: &str,
        scene_title: &str,
    ) -> Result<(), MemoryError> {
        let shared_turn_id = Uuid::new_v4().to_string();
        let context_tags: Vec<String> = {
            let tag = clean_tag(scene_title, 48);
            if tag.is_empty() { Vec::new() } else { vec![tag] }
        };
        if !player_text.is_empty() {
            self.append_short(
                profile_key,
                npc_id,
                Role::Player,
                player_text,
                &context_tags,
                0.5,
                Some(&shared_turn_id),
            )
            .await?;
        }
        if !npc_reply.is_empty() {
            self.append_short(
                profile_key,
                npc_id,
                Role::Npc,
                npc_reply,
                &context_tags,
                0.48,
                Some(&shared_turn_id),
            )
            .await?;
        }
        Ok(())
    }

    /// Record a system event into long memory, dispatching on `kind` and
    /// extracted keyword tags (promise / debt / event / fact), with a
    /// medium-impact mirror into the world events. Duplicates are
    /// suppressed by content hash.
    pub async fn remember_system_event(
        &self,
        profile_key: &str,
        npc_id: &str,
        fact_text: &str,
        kind: &str,
        importance: f64,
        world_only: bool,
    ) -> Result<(), MemoryError> {
        let clean = clean_text(fact_text, 420);
        if clean.is_empty() {
            return Ok(());
        }
        let mut tags: Vec<String> = Vec::new();
        let kind_tag = clean_tag(kind, 48);
        if !kind_tag.is_empty() {
            tags.push(kind_tag);
        }
        for tag in extract_kind_tags(&clean) {
            let slug = clean_tag(&tag, 48);
            if !slug.is_empty() && !tags.contains(&slug) {
                tags.push(slug);
            }
        }

        if !world_only {
            let mut memory = self.load_npc_memory(profile_key, npc_id)?;
            let hash = content_hash(&clean);
            let has_tag = |t: &str| tags.iter().any(|tag| tag == t);
            let mut added = false;
            if kind == "promise" || has_tag("promise") {
                if !memory.long.promises.iter().any(|row| row.text_hash == hash) {
                    memory.long.promises.push(MemoryPromise {
                        text: clean.clone(),
                        tags: tags.clone(),
                        importance: to_importance_01(importance, 0.7),
                        text_hash: hash,
                        ..MemoryPromise::default()
                    });
                    added = true;
                }
            } else if kind == "debt" || has_tag("debt") {
                if !memory.long.debts.iter().any(|row| row.text_hash == hash) {
                    memory.long.debts.push(MemoryDebt {
                        text: clean.clone(),
                        tags: tags.clone(),
                        importance: to_importance_01(importance, 0.7),
                        text_hash: hash,
                        ..MemoryDebt::default()
                    });
                    added = true;
                }
            } else if kind == "event" || has_tag("quest") || has_tag("combat") {
                let lowered = clean.to_lowercase();
                let impact = if HIGH_IMPACT_WORDS.iter().any(|w| lowered.contains(w)) {
                    ImpactLevel::High
                } else {
                    ImpactLevel::Med
                };
                if !memory.long.events.iter().any(|row| row.text_hash == hash) {
                    memory.long.events.push(MemoryEvent {
                        text: clean.clone(),
                        impact,
                        tags: tags.clone(),
                        importance: to_importance_01(importance, 0.62),
                        text_hash: hash,
                        ..MemoryEvent::default()
                    });
                    added = true;
                }
            } else if !memory.long.facts.iter().any(|row| row.text_hash == hash) {
                memory.long.facts.push(MemoryFact {
                    text: clean.clone(),
                    confidence: 0.72,
                    tags: tags.clone(),
                    importance: to_importance_01(importance, 0.55),
                    text_hash: hash,
                    ..MemoryFact::default()
                });
                added = true;
            }
            if added {
                memory.long.summary.ts = utc_now_iso();
                memory.long.summary.text = clean_text(&clean, 900);
                memory.long.sanitize();
                self.save_npc_memory(&memory)?;
            }
        }

        let mut world = self.load_world_memory()?;
        let world_hash = content_hash(&clean);
        if !world.long.events.iter().any(|row| row.text_hash == world_hash) {
            world.long.events.push(MemoryEvent {
                text: clean.clone(),
                impact: ImpactLevel::Med,
                tags: if tags.is_empty() {
                    vec![String::from("system")]
                } else {
                    tags
                },
                importance: to_importance_01(importance, 0.55),
                text_hash: world_hash,
                ..MemoryEvent::default()
            });
        }
        world.long.summary.ts = utc_now_iso();
        world.long.summary.text = clean_text(&clean, 900);
        world.long.sanitize();
        self.save_world_memory(&world)
    }

    // -----------------------------------------------------------------------
    // Index records
    // -----------------------------------------------------------------------

    fn meta_object(entries: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect()
    }

    fn records_from_npc_memory(&self, memory: &NpcMemory) -> Vec<IndexRecord> {
        let base_id = self.base_npc_id(&memory.npc_id);
        let mut rows: Vec<IndexRecord> = Vec::new();
        for chunk in &memory.chunks {
            let text = clean_text(&chunk.summary, 1000);
            if text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("chunk:{}", chunk.chunk_id),
                text,
                meta: Self::meta_object(&[
                    ("kind", Value::from("chunk")),
                    ("npc_id", Value::from(base_id.clone())),
                    ("scope_npc_id", Value::from(memory.npc_id.clone())),
                    ("ts", Value::from(chunk.ts_end())),
                    ("tags", Value::from(chunk.tags.clone())),
                    ("importance", Value::from(chunk.importance)),
                ]),
            });
        }
        for item in &memory.long.facts {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("fact:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from("fact")),
                    ("npc_id", Value::from(base_id.clone())),
                    ("scope_npc_id", Value::from(memory.npc_id.clone())),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        for item in &memory.long.events {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("event:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from(format!("event:{}", item.impact.as_str()))),
                    ("npc_id", Value::from(base_id.clone())),
                    ("scope_npc_id", Value::from(memory.npc_id.clone())),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        for item in &memory.long.promises {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("promise:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from(format!("promise:{}", item.status.as_str()))),
                    ("npc_id", Value::from(base_id.clone())),
                    ("scope_npc_id", Value::from(memory.npc_id.clone())),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        for item in &memory.long.debts {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("debt:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from(format!("debt:{}", item.status.as_str()))),
                    ("npc_id", Value::from(base_id.clone())),
                    ("scope_npc_id", Value::from(memory.npc_id.clone())),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        rows
    }

    fn records_from_world_memory(memory: &WorldMemory) -> Vec<IndexRecord> {
        let mut rows: Vec<IndexRecord> = Vec::new();
        for chunk in &memory.chunks {
            let text = clean_text(&chunk.summary, 1000);
            if text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("world_chunk:{}", chunk.chunk_id),
                text,
                meta: Self::meta_object(&[
                    ("kind", Value::from("world_chunk")),
                    ("ts", Value::from(chunk.ts_end())),
                    ("tags", Value::from(chunk.tags.clone())),
                    ("importance", Value::from(chunk.importance)),
                ]),
            });
        }
        for item in &memory.long.facts {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("world_fact:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from("world_fact")),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        for item in &memory.long.events {
            if item.text.is_empty() {
                continue;
            }
            rows.push(IndexRecord {
                record_id: format!("world_event:{}", item.id),
                text: item.text.clone(),
                meta: Self::meta_object(&[
                    ("kind", Value::from(format!("world_event:{}", item.impact.as_str()))),
                    ("ts", Value::from(item.ts.clone())),
                    ("tags", Value::from(item.tags.clone())),
                    ("importance", Value::from(item.importance)),
                ]),
            });
        }
        rows
    }

    // -----------------------------------------------------------------------
    // Index lifecycle
    // -----------------------------------------------------------------------

    /// Rebuild and persist the vector index for a scoped NPC. Returns the
    /// number of admitted records.
    pub async fn rebuild_npc_index(
        &self,
        profile_key: &str,
        npc_id: &str,
    ) -> Result<usize, MemoryError> {
        let scoped = self.scoped_npc_id(profile_key, npc_id);
        let memory = self.load_npc_memory(profile_key, npc_id)?;
        let records = self.records_from_npc_memory(&memory);
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embeddings.embed_texts(&texts).await?;

        let key = safe_id(&scoped, "unknown");
        let index_path = self.store.npc_index_path(&key);
        let mapping_path = self.store.npc_mapping_path(&key);
        let mut cache = self.indexes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let index = cache.npc.entry(key.clone()).or_insert_with(VectorIndex::new);
        let added = index.rebuild_from_records(&records, &embeddings);
        index.persist(&self.store, &index_path, &mapping_path)?;
        cache.npc_loaded.insert(key);
        Ok(added)
    }

    /// Rebuild and persist the world index. Returns the number of
    /// admitted records.
    pub async fn rebuild_world_index(&self) -> Result<usize, MemoryError> {
        let memory = self.load_world_memory()?;
        let records = Self::records_from_world_memory(&memory);
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embeddings.embed_texts(&texts).await?;

        let index_path = self.store.world_index_path();
        let mapping_path = self.store.world_mapping_path();
        let mut cache = self.indexes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let added = cache.world.rebuild_from_records(&records, &embeddings);
        cache.world.persist(&self.store, &index_path, &mapping_path)?;
        cache.world_loaded = true;
        Ok(added)
    }

    fn search_npc_index(&self, scoped: &str, query: &[f32], top_k: usize) -> Vec<VectorHit> {
        let key = safe_id(scoped, "unknown");
        let index_path = self.store.npc_index_path(&key);
        let mapping_path = self.store.npc_mapping_path(&key);
        let mut cache = self.indexes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !cache.npc_loaded.contains(&key) {
            let index = cache.npc.entry(key.clone()).or_insert_with(VectorIndex::new);
            index.load(&index_path, &mapping_path);
            cache.npc_loaded.insert(key.clone());
        }
        cache
            .npc
            .get(&key)
            .map(|index| index.search(query, top_k, None))
            .unwrap_or_default()
    }

    fn search_world_index(&self, query: &[f32], top_k: usize) -> Vec<VectorHit> {
        let index_path = self.store.world_index_path();
        let mapping_path = self.store.world_mapping_path();
        let mut cache = self.indexes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !cache.world_loaded {
            cache.world.load(&index_path, &mapping_path);
            cache.world_loaded = true;
        }
        cache.world.search(query, top_k, None)
    }

    async fn vector_hits(
        &self,
        profile_key: &str,
        npc_id: &str,
        query: &str,
        mode: RetrievalMode,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        if !self.embeddings.enabled().await {
            return Ok(Vec::new());
        }
        let query_vec = self.embeddings.embed_text(query).await?;
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<VectorHit> = Vec::new();
        if mode.includes_npc() {
            let scoped = self.scoped_npc_id(profile_key, npc_id);
            hits.extend(self.search_npc_index(&scoped, &query_vec, top_k.max(1)));
        }
        if mode.includes_world() {
            hits.extend(self.search_world_index(&query_vec, top_k.max(1)));
        }
        Ok(hits)
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    /// Retrieve the four-stream context envelope for a query.
    ///
    /// Memories with no chunks get an opportunistic index rebuild first
    /// (errors swallowed). When embeddings are disabled the retrieved
    /// stream falls back to lexical chunk overlap.
    pub async fn retrieve_context(
        &self,
        profile_key: &str,
        npc_id: &str,
        query: &str,
        mode: RetrievalMode,
        short_limit: usize,
        long_limit: usize,
        retrieved_limit: usize,
    ) -> Result<PromptMemoryContext, MemoryError> {
        let npc_memory = if mode.includes_npc() {
            Some(self.load_npc_memory(profile_key, npc_id)?)
        } else {
            None
        };
        let world_memory = if mode.includes_world() {
            Some(self.load_world_memory()?)
        } else {
            None
        };

        if let Some(memory) = npc_memory.as_ref() {
            if memory.chunks.is_empty() {
                if let Err(error) = self.rebuild_npc_index(profile_key, npc_id).await {
                    tracing::debug!(%error, "opportunistic NPC index rebuild failed");
                }
            }
        }
        if let Some(memory) = world_memory.as_ref() {
            if memory.chunks.is_empty() {
                if let Err(error) = self.rebuild_world_index().await {
                    tracing::debug!(%error, "opportunistic world index rebuild failed");
                }
            }
        }

        let hits = self
            .vector_hits(profile_key, npc_id, query, mode, retrieved_limit.max(1))
            .await?;
        let retrieved = retrieve_context(
            npc_memory.as_ref(),
            world_memory.as_ref(),
            query,
            mode,
            &hits,
            short_limit.max(1),
            long_limit.max(1),
            retrieved_limit.max(1),
        );

        let world_lines = if mode.includes_world() {
            retrieved
                .combined
                .iter()
                .take(long_limit.max(1))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Ok(PromptMemoryContext {
            short_lines: retrieved.short,
            long_lines: retrieved.long,
            world_lines,
            retrieved_lines: retrieved.retrieved,
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// List persisted scoped NPC ids, optionally filtered by profile.
    pub fn list_scoped_npc_ids(&self, profile_key: Option<&str>) -> Vec<String> {
        let all = self.store.list_npc_ids();
        let Some(profile) = profile_key else {
            return all;
        };
        let scope = safe_id(profile, "");
        if scope.is_empty() {
            return all;
        }
        let prefix = format!("{scope}__");
        all.into_iter()
            .filter(|id| id.starts_with(&prefix))
            .collect()
    }

    /// Drop the short buffer of a scoped NPC memory. Returns whether
    /// anything was removed.
    pub fn purge_short(&self, profile_key: &str, npc_id: &str) -> Result<bool, MemoryError> {
        let mut memory = self.load_npc_memory(profile_key, npc_id)?;
        if memory.short.is_empty() {
            return Ok(false);
        }
        memory.short.clear();
        self.save_npc_memory(&memory)?;
        Ok(true)
    }
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Process-wide singleton
// ---------------------------------------------------------------------------

static MEMORY_SERVICE: LazyLock<RwLock<Option<Arc<MemoryService>>>> =
    LazyLock::new(|| RwLock::new(None));

/// The process-wide memory service, lazily constructed on first access.
pub fn get_memory_service() -> Arc<MemoryService> {
    {
        let guard = MEMORY_SERVICE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(service) = guard.as_ref() {
            return Arc::clone(service);
        }
    }
    let mut guard = MEMORY_SERVICE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(service) = guard.as_ref() {
        return Arc::clone(service);
    }
    let service = Arc::new(MemoryService::new());
    *guard = Some(Arc::clone(&service));
    service
}

/// Replace (or clear) the process-wide service. Intended for tests.
pub fn set_memory_service(service: Option<Arc<MemoryService>>) {
    let mut guard = MEMORY_SERVICE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *guard = service;
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::embed::EmbedMode;

    fn temp_service() -> (tempfile::TempDir, MemoryService) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_roots(
            &dir.path().join("memory"),
            &dir.path().join("memory_index"),
        );
        let embeddings = EmbeddingProvider::with_mode(&store, EmbedMode::LocalModel);
        (dir, MemoryService::with_parts(store, embeddings))
    }

    // -----------------------------------------------------------------------
    // Scoping
    // -----------------------------------------------------------------------

    #[test]
    fn scoped_id_combines_profile_and_npc() {
        let (_dir, service) = temp_service();
        assert_eq!(service.scoped_npc_id("alice", "marchande"), "alice__marchande");
        assert_eq!(service.scoped_npc_id("", ""), "default__unknown");
        assert_eq!(service.base_npc_id("alice__marchande"), "marchande");
        assert_eq!(service.base_npc_id("sans_scope"), "sans_scope");
    }

    // -----------------------------------------------------------------------
    // Appends
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn append_short_rejects_empty_text() {
        let (_dir, service) = temp_service();
        let added = service
            .append_short("alice", "garde", Role::Player, "   ", &[], 0.5, None)
            .await
            .unwrap();
        assert!(!added);
    }

    #[tokio::test]
    async fn append_short_mixes_role_and_kind_tags() {
        let (_dir, service) = temp_service();
        service
            .append_short(
                "alice",
                "marchande",
                Role::Player,
                "Je veux acheter une potion au marchand",
                &[String::from("boutique")],
                0.5,
                None,
            )
            .await
            .unwrap();
        let memory = service.load_npc_memory("alice", "marchande").unwrap();
        let turn = memory.short.last().unwrap();
        assert!(turn.tags.iter().any(|t| t == "boutique"));
        assert!(turn.tags.iter().any(|t| t == "player"));
        assert!(turn.tags.iter().any(|t| t == "trade"));
    }

    #[tokio::test]
    async fn append_short_triggers_compaction_and_index() {
        let (_dir, service) = temp_service();
        {
            // Pre-seed a memory already at the compaction threshold.
            let mut memory = service.load_npc_memory("alice", "garde").unwrap();
            memory.stats.short_max = 20;
            memory.stats.chunk_target_turns = 10;
            for i in 0..25 {
                memory.short.push(ShortTurn::new(
                    Role::Player,
                    &format!("Ligne {i} promets mission {i}"),
                    Vec::new(),
                    0.5,
                    &format!("t{i}"),
                ));
            }
            service.save_npc_memory(&memory).unwrap();
        }
        service
            .append_short("alice", "garde", Role::Npc, "Tres bien.", &[], 0.5, None)
            .await
            .unwrap();
        let memory = service.load_npc_memory("alice", "garde").unwrap();
        assert!(memory.short.len() <= 20);
        assert!(!memory.chunks.is_empty());
        assert!(service.store().npc_mapping_path("alice__garde").exists());
    }

    #[tokio::test]
    async fn remember_dialogue_turn_shares_turn_id() {
        let (_dir, service) = temp_service();
        service
            .remember_dialogue_turn("alice", "garde", "Bonjour", "Salut voyageur", "Porte Nord")
            .await
            .unwrap();
        let memory = service.load_npc_memory("alice", "garde").unwrap();
        assert_eq!(memory.short.len(), 2);
        let first = memory.short.first().unwrap();
        let second = memory.short.last().unwrap();
        assert_eq!(first.turn_id, second.turn_id);
        assert_eq!(first.role, Role::Player);
        assert_eq!(second.role, Role::Npc);
    }

    // -----------------------------------------------------------------------
    // System events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn system_event_routes_promises_and_mirrors_world() {
        let (_dir, service) = temp_service();
        service
            .remember_system_event(
                "alice",
                "garde",
                "Le joueur promets de revenir avant l'aube",
                "promise",
                0.7,
                false,
            )
            .await
            .unwrap();
        let memory = service.load_npc_memory("alice", "garde").unwrap();
        assert_eq!(memory.long.promises.len(), 1);
        let world = service.load_world_memory().unwrap();
        assert_eq!(world.long.events.len(), 1);
    }

    #[tokio::test]
    async fn system_event_deduplicates_by_hash() {
        let (_dir, service) = temp_service();
        for _ in 0..2 {
            service
                .remember_system_event("alice", "garde", "Une dette de 10 pieces", "debt", 0.7, false)
                .await
                .unwrap();
        }
        let memory = service.load_npc_memory("alice", "garde").unwrap();
        assert_eq!(memory.long.debts.len(), 1);
        let world = service.load_world_memory().unwrap();
        assert_eq!(world.long.events.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Index + retrieval
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rebuild_and_retrieve_round_trip() {
        let (_dir, service) = temp_service();
        service
            .remember_system_event(
                "alice",
                "marchande",
                "Le joueur a promis de livrer des potions au marche",
                "promise",
                0.7,
                false,
            )
            .await
            .unwrap();
        let added = service.rebuild_npc_index("alice", "marchande").await.unwrap();
        assert!(added >= 1);

        let context = service
            .retrieve_context(
                "alice",
                "marchande",
                "potions marche",
                RetrievalMode::Npc,
                8,
                12,
                10,
            )
            .await
            .unwrap();
        assert!(context.long_lines.len() <= 12);
        assert!(context.retrieved_lines.len() <= 10);
        assert!(
            context
                .retrieved_lines
                .iter()
                .chain(context.long_lines.iter())
                .any(|line| line.contains("potions"))
        );
    }

    #[tokio::test]
    async fn retrieval_without_embeddings_still_answers() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_roots(
            &dir.path().join("memory"),
            &dir.path().join("memory_index"),
        );
        let embeddings = EmbeddingProvider::with_mode(&store, EmbedMode::Disabled);
        let service = MemoryService::with_parts(store, embeddings);
        service
            .remember_system_event("alice", "garde", "Combat contre le monstre du pont", "event", 0.6, false)
            .await
            .unwrap();
        let context = service
            .retrieve_context("alice", "garde", "monstre pont", RetrievalMode::Npc, 8, 12, 10)
            .await
            .unwrap();
        assert!(context.long_lines.iter().any(|line| line.contains("monstre")));
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn list_scoped_ids_filters_by_profile() {
        let (_dir, service) = temp_service();
        let _ = service.load_npc_memory("alice", "garde").unwrap();
        let _ = service.load_npc_memory("bob", "garde").unwrap();
        let all = service.list_scoped_npc_ids(None);
        assert_eq!(all.len(), 2);
        let alice = service.list_scoped_npc_ids(Some("alice"));
        assert_eq!(alice, vec![String::from("alice__garde")]);
    }

    #[tokio::test]
    async fn purge_short_clears_buffer() {
        let (_dir, service) = temp_service();
        service
            .append_short("alice", "garde", Role::Player, "Bonjour", &[], 0.5, None)
            .await
            .unwrap();
        assert!(service.purge_short("alice", "garde").unwrap());
        assert!(!service.purge_short("alice", "garde").unwrap());
        let memory = service.load_npc_memory("alice", "garde").unwrap();
        assert!(memory.short.is_empty());
    }

    #[test]
    fn singleton_set_and_get() {
        let (_dir, service) = temp_service();
        let injected = Arc::new(service);
        set_memory_service(Some(Arc::clone(&injected)));
        let fetched = get_memory_service();
        assert!(Arc::ptr_eq(&injected, &fetched));
        set_memory_service(None);
    }
}
