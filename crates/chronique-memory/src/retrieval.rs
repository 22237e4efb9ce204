//! Hybrid retrieval: vector similarity, tag overlap, recency, importance.
//!
//! Builds four context streams from an NPC memory, the world memory, or
//! both:
//!
//! - **short** -- the last N cleaned short-turn texts, dated.
//! - **long** -- every fact/event/promise/debt in scope, scored and
//!   top-k'd.
//! - **retrieved** -- vector hits when supplied, else chunk summaries
//!   with positive lexical overlap against the query.
//! - **combined** -- long then retrieved, line-deduplicated.
//!
//! Scoring is `0.6·vector_sim + 0.2·tags + 0.1·recency + 0.1·importance`
//! over length-3+ lowercase tokens. Engines that return signed cosine in
//! `[-1, 1]` are remapped through [`remap_cosine`]; a backend already
//! emitting `[0, 1]` scores can bypass the remap at the call site.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use chronique_types::{LongMemory, MemoryChunk, NpcMemory, WorldMemory, clean_text};
use serde_json::Value;

use crate::index::VectorHit;

// ---------------------------------------------------------------------------
// Modes and limits
// ---------------------------------------------------------------------------

/// Which memory scopes participate in retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMode {
    /// NPC memory only.
    #[default]
    Npc,
    /// World memory only.
    World,
    /// Both scopes.
    Both,
}

impl RetrievalMode {
    /// Parse a wire string, falling back to [`RetrievalMode::Npc`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "world" => Self::World,
            "both" => Self::Both,
            _ => Self::Npc,
        }
    }

    /// Whether the NPC scope participates.
    pub const fn includes_npc(self) -> bool {
        matches!(self, Self::Npc | Self::Both)
    }

    /// Whether the world scope participates.
    pub const fn includes_world(self) -> bool {
        matches!(self, Self::World | Self::Both)
    }
}

/// The four context streams handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetrievedContext {
    /// Dated short-turn lines, oldest first.
    pub short: Vec<String>,
    /// Scored long-memory lines, best first.
    pub long: Vec<String>,
    /// Scored retrieved lines (vector hits or chunk fallback).
    pub retrieved: Vec<String>,
    /// Long then retrieved, deduplicated.
    pub combined: Vec<String>,
}

// ---------------------------------------------------------------------------
// Scoring primitives
// ---------------------------------------------------------------------------

/// Remap a signed cosine score from `[-1, 1]` into `[0, 1]`.
pub fn remap_cosine(score: f64) -> f64 {
    ((score + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Tokenize into lowercase runs of `[a-z0-9_:-]` at least 3 chars long.
fn tokenize(text: &str) -> BTreeSet<String> {
    let mut out: BTreeSet<String> = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | ':' | '-') {
            current.push(ch);
        } else if !current.is_empty() {
            if current.len() >= 3 {
                out.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 {
        out.insert(current);
    }
    out
}

/// Jaccard overlap of two token sets.
fn overlap_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    let union = a.union(b).count().max(1);
    #[allow(clippy::cast_precision_loss)]
    {
        inter as f64 / union as f64
    }
}

fn ts_to_epoch(ts: &str) -> f64 {
    let raw = ts.trim();
    if raw.is_empty() {
        return 0.0;
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(0.0)
}

/// Exponential recency decay with a 240-hour time constant; unparseable
/// timestamps score a flat 0.25.
fn recency_score(ts: &str, now_epoch: f64) -> f64 {
    let epoch = ts_to_epoch(ts);
    if epoch <= 0.0 || now_epoch <= 0.0 {
        return 0.25;
    }
    let age_hours = ((now_epoch - epoch) / 3600.0).max(0.0);
    (-age_hours / 240.0).exp().clamp(0.0, 1.0)
}

fn source_date(ts: &str) -> String {
    let raw = ts.trim();
    if raw.is_empty() {
        return String::from("unknown");
    }
    raw.chars().take(10).collect()
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    source: String,
    text: String,
    ts: String,
    tags: Vec<String>,
    importance: f64,
    vector_sim: f64,
}

impl Candidate {
    fn score(&self, query_tokens: &BTreeSet<String>, now_epoch: f64) -> f64 {
        let tag_set: BTreeSet<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
        let tags_score = overlap_score(&tag_set, query_tokens);
        let recency = recency_score(&self.ts, now_epoch);
        let importance = self.importance.clamp(0.0, 1.0);
        let vector_sim = self.vector_sim.clamp(0.0, 1.0);
        vector_sim.mul_add(0.6, tags_score.mul_add(0.2, recency.mul_add(0.1, importance * 0.1)))
    }

    fn line(&self) -> String {
        format!("- {} {}", self.source, self.text)
    }
}

fn long_candidates(long: &LongMemory, prefix: &str) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    for row in &long.facts {
        out.push(Candidate {
            source: format!("[{prefix}fact]"),
            text: clean_text(&row.text, 220),
            ts: row.ts.clone(),
            tags: row.tags.clone(),
            importance: row.importance,
            vector_sim: 0.0,
        });
    }
    for row in &long.events {
        out.push(Candidate {
            source: format!("[{prefix}event {}]", row.impact.as_str()),
            text: clean_text(&row.text, 220),
            ts: row.ts.clone(),
            tags: row.tags.clone(),
            importance: row.importance,
            vector_sim: 0.0,
        });
    }
    for row in &long.promises {
        out.push(Candidate {
            source: format!("[{prefix}promise {}]", row.status.as_str()),
            text: clean_text(&row.text, 220),
            ts: row.ts.clone(),
            tags: row.tags.clone(),
            importance: row.importance,
            vector_sim: 0.0,
        });
    }
    for row in &long.debts {
        out.push(Candidate {
            source: format!("[{prefix}debt {}]", row.status.as_str()),
            text: clean_text(&row.text, 220),
            ts: row.ts.clone(),
            tags: row.tags.clone(),
            importance: row.importance,
            vector_sim: 0.0,
        });
    }
    out
}

fn chunk_candidates(
    chunks: &[MemoryChunk],
    prefix: &str,
    query_tokens: &BTreeSet<String>,
) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    for chunk in chunks {
        let text = clean_text(&chunk.summary, 220);
        if text.is_empty() {
            continue;
        }
        let overlap = overlap_score(query_tokens, &tokenize(&text));
        if overlap <= 0.0 && !query_tokens.is_empty() {
            continue;
        }
        out.push(Candidate {
            source: format!("[{prefix}chunk {}]", source_date(chunk.ts_end())),
            text,
            ts: chunk.ts_end().to_owned(),
            tags: chunk.tags.clone(),
            importance: chunk.importance,
            vector_sim: overlap,
        });
    }
    out
}

fn hit_candidate(hit: &VectorHit) -> Option<Candidate> {
    let text = clean_text(&hit.text, 220);
    if text.is_empty() {
        return None;
    }
    let kind = hit
        .meta
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("chunk")
        .to_owned();
    let ts = hit
        .meta
        .get("ts")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    let tags: Vec<String> = hit
        .meta
        .get("tags")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let importance = hit
        .meta
        .get("importance")
        .and_then(Value::as_f64)
        .unwrap_or(0.5);
    Some(Candidate {
        source: format!("[{kind} {}]", source_date(&ts)),
        text,
        ts,
        tags,
        importance,
        vector_sim: remap_cosine(f64::from(hit.score)),
    })
}

fn short_lines(memory: Option<&NpcMemory>, short_limit: usize) -> Vec<String> {
    let Some(memory) = memory else {
        return Vec::new();
    };
    let take = short_limit.max(1);
    let start = memory.short.len().saturating_sub(take);
    memory
        .short
        .iter()
        .skip(start)
        .filter_map(|turn| {
            let text = clean_text(&turn.text, 180);
            if text.is_empty() {
                None
            } else {
                Some(format!("- [short {}] {}", source_date(&turn.ts), text))
            }
        })
        .collect()
}

fn score_and_rank(
    candidates: Vec<Candidate>,
    query_tokens: &BTreeSet<String>,
    now_epoch: f64,
    limit: usize,
) -> Vec<String> {
    let mut scored: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .map(|candidate| (candidate.score(query_tokens, now_epoch), candidate))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .take(limit.max(1))
        .filter(|(_, candidate)| !candidate.text.is_empty())
        .map(|(_, candidate)| candidate.line())
        .collect()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Build the four context streams.
///
/// When `vector_hits` is non-empty each hit becomes a retrieved candidate
/// with its score remapped into `[0, 1]`; otherwise chunk summaries with
/// positive lexical overlap stand in. All candidates are ranked by the
/// hybrid score and truncated to their respective limits.
pub fn retrieve_context(
    npc_memory: Option<&NpcMemory>,
    world_memory: Option<&WorldMemory>,
    query: &str,
    mode: RetrievalMode,
    vector_hits: &[VectorHit],
    short_limit: usize,
    long_limit: usize,
    retrieved_limit: usize,
) -> RetrievedContext {
    let now_epoch = Utc::now().timestamp() as f64;
    let query_tokens = tokenize(query);

    let short = short_lines(
        if mode.includes_npc() { npc_memory } else { None },
        short_limit,
    );

    let mut long_pool: Vec<Candidate> = Vec::new();
    if mode.includes_npc() {
        if let Some(memory) = npc_memory {
            long_pool.extend(long_candidates(&memory.long, ""));
        }
    }
    if mode.includes_world() {
        if let Some(memory) = world_memory {
            long_pool.extend(long_candidates(&memory.long, "world/"));
        }
    }
    for candidate in &mut long_pool {
        candidate.vector_sim = overlap_score(&query_tokens, &tokenize(&candidate.text));
    }
    let long = score_and_rank(long_pool, &query_tokens, now_epoch, long_limit);

    let retrieved_pool: Vec<Candidate> = if vector_hits.is_empty() {
        let mut pool: Vec<Candidate> = Vec::new();
        if mode.includes_npc() {
            if let Some(memory) = npc_memory {
                pool.extend(chunk_candidates(&memory.chunks, "", &query_tokens));
            }
        }
        if mode.includes_world() {
            if let Some(memory) = world_memory {
                pool.extend(chunk_candidates(&memory.chunks, "world/", &query_tokens));
            }
        }
        pool
    } else {
        vector_hits.iter().filter_map(hit_candidate).collect()
    };
    let retrieved = score_and_rank(retrieved_pool, &query_tokens, now_epoch, retrieved_limit);

    let mut combined: Vec<String> = Vec::new();
    for line in long.iter().chain(retrieved.iter()) {
        if !combined.contains(line) {
            combined.push(line.clone());
        }
    }
    combined.truncate(long_limit.saturating_add(retrieved_limit).max(1));

    RetrievedContext {
        short: short.into_iter().take(short_limit.max(1)).collect(),
        long,
        retrieved,
        combined,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chronique_types::{MemoryFact, Role, ShortTurn, content_hash, utc_now_iso};

    fn memory_with_content() -> NpcMemory {
        let mut memory = NpcMemory::new("npc");
        for i in 0..30 {
            memory.short.push(ShortTurn::new(
                Role::Player,
                &format!("Message {i} mission commerce"),
                Vec::new(),
                0.5,
                &format!("t{i}"),
            ));
        }
        for i in 0..20 {
            memory.long.facts.push(MemoryFact {
                id: format!("f{i}"),
                ts: utc_now_iso(),
                text: format!("Fait {i} sur la mission"),
                confidence: 0.7,
                tags: vec![String::from("quest")],
                importance: 0.6,
                text_hash: content_hash(&format!("Fait {i} sur la mission")),
            });
        }
        memory
    }

    // -----------------------------------------------------------------------
    // Primitives
    // -----------------------------------------------------------------------

    #[test]
    fn tokenize_keeps_long_tokens_only() {
        let tokens = tokenize("La quete du marche: go!");
        assert!(tokens.contains("quete"));
        assert!(tokens.contains("marche"));
        assert!(!tokens.contains("la"));
        assert!(!tokens.contains("go"));
    }

    #[test]
    fn overlap_is_jaccard() {
        let a = tokenize("mission commerce route");
        let b = tokenize("mission commerce taverne");
        let score = overlap_score(&a, &b);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn recency_flat_for_unparseable_ts() {
        let now = Utc::now().timestamp() as f64;
        assert!((recency_score("", now) - 0.25).abs() < 1e-9);
        assert!((recency_score("pas une date", now) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn recency_decays_with_age() {
        let now = Utc::now().timestamp() as f64;
        let fresh = recency_score(&utc_now_iso(), now);
        assert!(fresh > 0.99);
    }

    #[test]
    fn remap_cosine_covers_signed_range() {
        assert!((remap_cosine(-1.0)).abs() < 1e-9);
        assert!((remap_cosine(1.0) - 1.0).abs() < 1e-9);
        assert!((remap_cosine(0.0) - 0.5).abs() < 1e-9);
        assert!((remap_cosine(5.0) - 1.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Stream limits
    // -----------------------------------------------------------------------

    #[test]
    fn streams_respect_limits() {
        let memory = memory_with_content();
        let out = retrieve_context(
            Some(&memory),
            Some(&WorldMemory::default()),
            "mission commerce",
            RetrievalMode::Npc,
            &[],
            8,
            12,
            10,
        );
        assert!(out.short.len() <= 8);
        assert!(out.long.len() <= 12);
        assert!(out.retrieved.len() <= 10);
        assert!(out.combined.len() <= 22);
    }

    #[test]
    fn short_lines_are_dated_and_suffixed() {
        let memory = memory_with_content();
        let out = retrieve_context(Some(&memory), None, "mission", RetrievalMode::Npc, &[], 3, 5, 5);
        assert_eq!(out.short.len(), 3);
        assert!(out.short.iter().all(|line| line.starts_with("- [short ")));
        // The newest turns are kept.
        assert!(out.short.last().unwrap().contains("Message 29"));
    }

    #[test]
    fn world_mode_prefixes_sources() {
        let mut world = WorldMemory::default();
        world.long.facts.push(MemoryFact {
            text: String::from("Emeute au marche central"),
            tags: vec![String::from("event")],
            ..MemoryFact::default()
        });
        let out = retrieve_context(None, Some(&world), "marche", RetrievalMode::World, &[], 4, 6, 6);
        assert!(out.long.iter().any(|line| line.contains("[world/fact]")));
        assert!(out.short.is_empty());
    }

    #[test]
    fn vector_hits_outrank_lexical_fallback() {
        let memory = memory_with_content();
        let mut meta = serde_json::Map::new();
        meta.insert(String::from("kind"), Value::String(String::from("chunk")));
        meta.insert(String::from("ts"), Value::String(utc_now_iso()));
        meta.insert(
            String::from("importance"),
            Value::from(0.9),
        );
        let hits = vec![VectorHit {
            vector_id: 0,
            record_id: String::from("chunk:1"),
            text: String::from("Souvenir exact de la mission"),
            meta,
            score: 0.8,
        }];
        let out = retrieve_context(
            Some(&memory),
            None,
            "mission",
            RetrievalMode::Npc,
            &hits,
            4,
            6,
            6,
        );
        assert_eq!(out.retrieved.len(), 1);
        assert!(out.retrieved.first().unwrap().contains("Souvenir exact"));
    }

    #[test]
    fn combined_deduplicates_lines() {
        let memory = memory_with_content();
        let out = retrieve_context(
            Some(&memory),
            None,
            "mission commerce",
            RetrievalMode::Npc,
            &[],
            4,
            6,
            6,
        );
        let mut seen = out.combined.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), out.combined.len());
    }
}
