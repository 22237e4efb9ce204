//! Short-buffer compaction into chunks and structured long memory.
//!
//! Compaction triggers whenever the short buffer outgrows
//! `stats.short_max`. Each iteration takes the leading
//! `stats.chunk_target_turns` slice and reduces it:
//!
//! 1. **Patch extraction** -- an injected [`CompactionPlanner`] gets the
//!    first shot; its payload is validated into a [`CompactionPatch`] and
//!    any failure (error, non-object, empty summary) falls through
//!    silently to the deterministic extractor.
//! 2. **Fallback extractor** -- rule-based: role-prefixed line digest,
//!    keyword tagging, phrase families routing lines into promises /
//!    debts / events / facts, a numeric chunk importance, and a sentiment
//!    word count over player lines yielding an affinity delta in
//!    `[-5, 5]`.
//! 3. **Chunk emission** -- hash-deduplicated against the existing chunk
//!    list, capped at [`CHUNK_LIMIT`] keeping the newest.
//! 4. **Long-memory merge** -- every patch item is cleaned, clamped,
//!    hashed, and appended only when no existing entry shares its hash.
//! 5. **Relationship update** and **rolling summary** overwrite.
//! 6. **Short trim** -- the processed slice is removed; after the loop
//!    the buffer is cut to `max(20, short_max - chunk_target)`.
//!
//! Compaction is monotone: a second call with no new turns is a no-op.

use chronique_types::{
    CHUNK_LIMIT, DEBT_LIMIT, DebtStatus, EVENT_LIMIT, FACT_LIMIT, ImpactLevel, LongMemory,
    LongSummary, MemoryChunk, MemoryDebt, MemoryEvent, MemoryFact, MemoryPromise, NpcMemory,
    PROMISE_LIMIT, PromiseStatus, RELATIONSHIP_NOTE_LIMIT, RelationshipNote, Role, ShortTurn,
    WorldMemory, clean_tag, clean_text, content_hash, utc_now_iso,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Planner capability
// ---------------------------------------------------------------------------

/// One turn in a planner request payload.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerTurn {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Speaker role wire name.
    pub role: String,
    /// Turn text.
    pub text: String,
    /// Slug tags.
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Opaque turn id.
    pub turn_id: String,
}

/// Request handed to a compaction planner: the turns under reduction and
/// the response schema the planner is expected to produce.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerRequest {
    /// Turns of the slice being compacted.
    pub turns: Vec<PlannerTurn>,
    /// Schema description of the expected response payload.
    pub expected_format: Value,
}

/// Injected AI compaction capability.
///
/// The planner receives the slice under reduction and returns a payload
/// matching [`CompactionPatch`]. Implementations own their transport; the
/// compactor treats any error or non-conforming payload as a signal to
/// use the deterministic extractor instead.
pub trait CompactionPlanner: Send + Sync {
    /// Produce a compaction patch payload for the given request.
    fn plan(&self, request: &PlannerRequest) -> anyhow::Result<Value>;
}

fn expected_format() -> Value {
    serde_json::json!({
        "chunk_summary": "string",
        "chunk_tags": ["tag"],
        "chunk_importance": 0.0,
        "facts": [{"text": "string", "confidence": 0.7, "tags": ["tag"], "importance": 0.5}],
        "events": [{"text": "string", "impact": "low|med|high", "tags": ["tag"], "importance": 0.5}],
        "promises": [{"text": "string", "status": "open|kept|broken", "tags": ["tag"], "importance": 0.7}],
        "debts": [{"text": "string", "status": "open|paid", "tags": ["tag"], "importance": 0.7}],
        "relationship_delta": {"affinity_delta": 0, "notes": ["string"]},
        "summary": "string",
    })
}

// ---------------------------------------------------------------------------
// Patch model
// ---------------------------------------------------------------------------

/// One extracted fact/event/promise/debt candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchItem {
    /// Candidate text.
    #[serde(default)]
    pub text: String,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confidence (facts only).
    #[serde(default = "PatchItem::default_confidence")]
    pub confidence: f64,
    /// Impact wire name (events only).
    #[serde(default = "PatchItem::default_impact")]
    pub impact: String,
    /// Status wire name (promises and debts).
    #[serde(default = "PatchItem::default_status")]
    pub status: String,
    /// Importance in `[0, 1]`.
    #[serde(default = "PatchItem::default_importance")]
    pub importance: f64,
}

impl Default for PatchItem {
    fn default() -> Self {
        Self {
            text: String::new(),
            tags: Vec::new(),
            confidence: Self::default_confidence(),
            impact: Self::default_impact(),
            status: Self::default_status(),
            importance: Self::default_importance(),
        }
    }
}

impl PatchItem {
    const fn default_confidence() -> f64 {
        0.6
    }

    fn default_impact() -> String {
        String::from("low")
    }

    fn default_status() -> String {
        String::from("open")
    }

    const fn default_importance() -> f64 {
        0.5
    }
}

/// Relationship movement extracted from a slice.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelationshipDelta {
    /// Affinity movement, clamped to `[-5, 5]` on application.
    #[serde(default)]
    pub affinity_delta: i32,
    /// Up to four notes appended to the relationship trail.
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Full reduction of one slice of short turns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompactionPatch {
    /// Chunk summary text.
    #[serde(default)]
    pub chunk_summary: String,
    /// Chunk tags (capped at 8 on emission).
    #[serde(default)]
    pub chunk_tags: Vec<String>,
    /// Chunk importance in `[0, 1]`.
    #[serde(default = "PatchItem::default_importance")]
    pub chunk_importance: f64,
    /// Fact candidates.
    #[serde(default)]
    pub facts: Vec<PatchItem>,
    /// Event candidates.
    #[serde(default)]
    pub events: Vec<PatchItem>,
    /// Promise candidates.
    #[serde(default)]
    pub promises: Vec<PatchItem>,
    /// Debt candidates.
    #[serde(default)]
    pub debts: Vec<PatchItem>,
    /// Relationship movement.
    #[serde(default)]
    pub relationship_delta: RelationshipDelta,
    /// Rolling summary replacement.
    #[serde(default)]
    pub summary: String,
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactResult {
    /// Whether any slice was reduced.
    pub changed: bool,
    /// Number of chunks emitted (one per iteration).
    pub compacted_chunks: u32,
    /// Terse audit trail (`chunk+`, `fact+`, `summary~`, ...).
    pub logs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Keyword families (deterministic extractor)
// ---------------------------------------------------------------------------

/// Tagging rules: tag name paired with its trigger substrings.
const TAG_RULES: &[(&str, &[&str])] = &[
    ("trade", &["acheter", "vendre", "prix", "or", "echange", "marchand"]),
    ("quest", &["quete", "mission", "objectif", "contrat"]),
    ("combat", &["combat", "attaque", "frappe", "monstre", "donjon"]),
    ("training", &["entrain", "competence", "sort", "apprendre", "niveau"]),
    ("travel", &["route", "voyage", "ville", "deplacement", "aller"]),
    ("promise", &["promis", "promets", "je vais", "je ferai"]),
    ("debt", &["dette", "dois", "rembourse", "payer"]),
    ("relationship", &["aime", "deteste", "confiance", "trahis", "respecte"]),
];

/// Phrases routing a line into the promise list.
const PROMISE_PHRASES: &[&str] =
    &["promis", "promets", "je vais", "je ferai", "on se retrouve", "je m'engage"];

/// Phrases routing a line into the debt list.
const DEBT_PHRASES: &[&str] =
    &["dette", "je te dois", "rembours", "payer", "paiement", "creance"];

/// Phrases routing a line into the event list.
const EVENT_PHRASES: &[&str] = &[
    "quete", "mission", "combat", "victoire", "defaite", "incident", "attaque", "trouve", "perdu",
];

/// Phrases routing a line into the fact list.
const FACT_PHRASES: &[&str] =
    &["je suis", "mon nom", "j'habite", "je viens", "je possede", "j'ai"];

/// Words marking a high-impact event line.
const HIGH_IMPACT_WORDS: &[&str] = &["defaite", "mort", "boss", "rupture", "incident"];

/// Words marking a medium-impact event line.
const MED_IMPACT_WORDS: &[&str] = &["combat", "quete", "victoire", "attaque"];

/// Positive sentiment markers counted on player lines.
const POSITIVE_WORDS: &[&str] = &["merci", "ok", "parfait", "oui", "super"];

/// Negative sentiment markers counted on player lines.
const NEGATIVE_WORDS: &[&str] = &["non", "jamais", "colere", "deteste", "mensonge", "nul"];

fn matches_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Tags triggered by a line of text (case-insensitive substring rules).
fn collect_tags(text: &str) -> Vec<String> {
    let hay = text.to_lowercase();
    TAG_RULES
        .iter()
        .filter(|(_, words)| matches_any(&hay, words))
        .map(|(tag, _)| (*tag).to_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// Deterministic fallback extractor
// ---------------------------------------------------------------------------

/// Rule-based reduction of a slice when no planner patch is available.
pub fn extract_patch_fallback(turns: &[ShortTurn]) -> CompactionPatch {
    let mut lines: Vec<String> = Vec::new();
    let mut all_text: Vec<String> = Vec::new();
    let mut player_text: Vec<String> = Vec::new();
    let mut system_text: Vec<String> = Vec::new();
    let mut tags: Vec<String> = Vec::new();

    for turn in turns {
        let text = clean_text(&turn.text, 260);
        if text.is_empty() {
            continue;
        }
        lines.push(format!("{}: {}", turn.role.as_str().to_uppercase(), text));
        match turn.role {
            Role::Player => player_text.push(text.clone()),
            Role::Npc => {}
            Role::System | Role::Narration => system_text.push(text.clone()),
        }
        for tag in collect_tags(&text) {
            let clean = clean_tag(&tag, 48);
            if !clean.is_empty() && !tags.contains(&clean) {
                tags.push(clean);
            }
        }
        all_text.push(text);
    }

    if lines.is_empty() {
        return CompactionPatch {
            chunk_summary: String::from("(aucun contenu)"),
            summary: String::from("(aucun resume)"),
            ..CompactionPatch::default()
        };
    }

    let head = lines.iter().take(2);
    let tail = if lines.len() > 3 {
        lines.iter().skip(lines.len().saturating_sub(3))
    } else {
        lines.iter().skip(lines.len())
    };
    let digest: Vec<String> = head.chain(tail).cloned().collect();
    let summary = clean_text(&digest.join(" | "), 600);

    let mut chunk_importance: f64 = 0.35;
    if ["promise", "debt", "quest"].iter().any(|t| tags.iter().any(|tag| tag == t)) {
        chunk_importance += 0.22;
    }
    if ["combat", "relationship"].iter().any(|t| tags.iter().any(|tag| tag == t)) {
        chunk_importance += 0.12;
    }
    if all_text.len() >= 24 {
        chunk_importance += 0.10;
    }
    let chunk_importance = chunk_importance.clamp(0.15, 1.0);

    let mut facts: Vec<PatchItem> = Vec::new();
    let mut events: Vec<PatchItem> = Vec::new();
    let mut promises: Vec<PatchItem> = Vec::new();
    let mut debts: Vec<PatchItem> = Vec::new();

    let recent_start = all_text.len().saturating_sub(24);
    for text in all_text.iter().skip(recent_start) {
        let hay = text.to_lowercase();
        let local_tags: Vec<String> = collect_tags(text)
            .into_iter()
            .map(|tag| clean_tag(&tag, 48))
            .filter(|tag| !tag.is_empty())
            .collect();
        if matches_any(&hay, PROMISE_PHRASES) {
            promises.push(PatchItem {
                text: text.clone(),
                tags: or_default_tags(&local_tags, "promise"),
                importance: 0.72,
                ..PatchItem::default()
            });
        }
        if matches_any(&hay, DEBT_PHRASES) {
            debts.push(PatchItem {
                text: text.clone(),
                tags: or_default_tags(&local_tags, "debt"),
                importance: 0.72,
                ..PatchItem::default()
            });
        }
        if matches_any(&hay, EVENT_PHRASES) || system_text.contains(text) {
            let impact = if matches_any(&hay, HIGH_IMPACT_WORDS) {
                "high"
            } else if matches_any(&hay, MED_IMPACT_WORDS) {
                "med"
            } else {
                "low"
            };
            events.push(PatchItem {
                text: text.clone(),
                tags: or_default_tags(&local_tags, "event"),
                impact: impact.to_owned(),
                importance: if impact == "high" { 0.62 } else { 0.54 },
                ..PatchItem::default()
            });
        }
        if matches_any(&hay, FACT_PHRASES) {
            facts.push(PatchItem {
                text: text.clone(),
                tags: or_default_tags(&local_tags, "fact"),
                confidence: 0.62,
                importance: 0.5,
                ..PatchItem::default()
            });
        }
    }

    if facts.is_empty() {
        facts.push(PatchItem {
            text: clean_text(&format!("Contexte resume: {summary}"), 360),
            tags: if tags.is_empty() {
                vec![String::from("general")]
            } else {
                tags.iter().take(4).cloned().collect()
            },
            confidence: 0.55,
            importance: 0.45,
            ..PatchItem::default()
        });
    }

    let positive = player_text
        .iter()
        .filter(|t| matches_any(&t.to_lowercase(), POSITIVE_WORDS))
        .count();
    let negative = player_text
        .iter()
        .filter(|t| matches_any(&t.to_lowercase(), NEGATIVE_WORDS))
        .count();
    let affinity_delta = i32::try_from(positive)
        .unwrap_or(i32::MAX)
        .saturating_sub(i32::try_from(negative).unwrap_or(i32::MAX))
        .clamp(-5, 5);

    let mut rel_notes: Vec<String> = Vec::new();
    if affinity_delta > 0 {
        rel_notes.push(String::from(
            "Le joueur montre davantage de confiance ou d'ouverture.",
        ));
    } else if affinity_delta < 0 {
        rel_notes.push(String::from(
            "Le joueur exprime une tension ou une mefiance.",
        ));
    } else if tags.iter().any(|tag| tag == "relationship") {
        rel_notes.push(String::from(
            "La relation reste active, sans bascule claire.",
        ));
    }

    let brief = clean_text(&format!("Points saillants: {summary}"), 760);

    facts.truncate(10);
    events.truncate(10);
    promises.truncate(10);
    debts.truncate(10);
    rel_notes.truncate(4);

    CompactionPatch {
        chunk_summary: summary,
        chunk_tags: if tags.is_empty() {
            vec![String::from("general")]
        } else {
            tags.iter().take(8).cloned().collect()
        },
        chunk_importance,
        facts,
        events,
        promises,
        debts,
        relationship_delta: RelationshipDelta {
            affinity_delta,
            notes: rel_notes,
        },
        summary: brief,
    }
}

fn or_default_tags(tags: &[String], fallback: &str) -> Vec<String> {
    if tags.is_empty() {
        vec![fallback.to_owned()]
    } else {
        tags.to_vec()
    }
}

// ---------------------------------------------------------------------------
// Planner invocation
// ---------------------------------------------------------------------------

/// Validate a planner payload; `None` on any mismatch or empty summary.
fn validate_patch_payload(payload: &Value) -> Option<CompactionPatch> {
    let patch: CompactionPatch = serde_json::from_value(payload.clone()).ok()?;
    if clean_text(&patch.chunk_summary, 1000).is_empty() {
        return None;
    }
    Some(patch)
}

/// Ask the planner for a patch; `None` on error or non-conforming
/// payload (the caller falls back to the deterministic extractor).
fn extract_patch_with_ai(
    turns: &[ShortTurn],
    planner: Option<&dyn CompactionPlanner>,
) -> Option<CompactionPatch> {
    let planner = planner?;
    let request = PlannerRequest {
        turns: turns
            .iter()
            .map(|turn| PlannerTurn {
                ts: turn.ts.clone(),
                role: turn.role.as_str().to_owned(),
                text: turn.text.clone(),
                tags: turn.tags.clone(),
                importance: turn.importance,
                turn_id: turn.turn_id.clone(),
            })
            .collect(),
        expected_format: expected_format(),
    };
    let payload = planner.plan(&request).ok()?;
    if !payload.is_object() {
        return None;
    }
    validate_patch_payload(&payload)
}

// ---------------------------------------------------------------------------
// Merge helpers
// ---------------------------------------------------------------------------

/// Append `item` unless an existing entry shares its hash; truncate to
/// `limit` keeping the newest. Returns whether the item was admitted.
fn append_unique_by_hash<T>(
    target: &mut Vec<T>,
    item: T,
    limit: usize,
    hash_of: impl Fn(&T) -> &str,
) -> bool {
    let item_hash = hash_of(&item).trim().to_lowercase();
    if item_hash.is_empty() {
        return false;
    }
    let duplicate = target.iter().any(|row| {
        let row_hash = hash_of(row).trim().to_lowercase();
        !row_hash.is_empty() && row_hash == item_hash
    });
    if duplicate {
        return false;
    }
    target.push(item);
    if target.len() > limit {
        let drop = target.len().saturating_sub(limit);
        target.drain(..drop);
    }
    true
}

/// Build a chunk from the slice and its patch.
fn chunk_from_patch(turns: &[ShortTurn], patch: &CompactionPatch, now_iso: &str) -> MemoryChunk {
    let ts_start = turns.first().map_or_else(|| now_iso.to_owned(), |t| t.ts.clone());
    let ts_end = turns.last().map_or_else(|| now_iso.to_owned(), |t| t.ts.clone());
    let mut turn_ids: Vec<String> = Vec::new();
    for turn in turns {
        let id = turn.turn_id.trim();
        if !id.is_empty() && !turn_ids.iter().any(|x| x == id) {
            turn_ids.push(id.to_owned());
        }
    }
    let summary = clean_text(&patch.chunk_summary, 1000);
    let mut chunk = MemoryChunk {
        ts_range: vec![ts_start, ts_end],
        turn_ids,
        text_hash: content_hash(&summary),
        summary,
        tags: patch
            .chunk_tags
            .iter()
            .map(|tag| clean_tag(tag, 48))
            .filter(|tag| !tag.is_empty())
            .collect(),
        importance: patch.chunk_importance.clamp(0.0, 1.0),
        ..MemoryChunk::default()
    };
    chunk.sanitize();
    chunk
}

/// Merge a patch into the long memory; returns the audit log fragments.
pub fn apply_patch_to_long(long: &mut LongMemory, patch: &CompactionPatch, now_iso: &str) -> Vec<String> {
    let mut logs: Vec<String> = Vec::new();

    for row in &patch.facts {
        let text = clean_text(&row.text, 420);
        if text.is_empty() {
            continue;
        }
        let item = MemoryFact {
            ts: now_iso.to_owned(),
            text_hash: content_hash(&text),
            text,
            confidence: row.confidence.clamp(0.0, 1.0),
            tags: clean_tags(&row.tags),
            importance: row.importance.clamp(0.0, 1.0),
            ..MemoryFact::default()
        };
        if append_unique_by_hash(&mut long.facts, item, FACT_LIMIT, |f| &f.text_hash) {
            logs.push(String::from("fact+"));
        }
    }

    for row in &patch.events {
        let text = clean_text(&row.text, 420);
        if text.is_empty() {
            continue;
        }
        let item = MemoryEvent {
            ts: now_iso.to_owned(),
            text_hash: content_hash(&text),
            text,
            impact: ImpactLevel::parse(&row.impact),
            tags: clean_tags(&row.tags),
            importance: row.importance.clamp(0.0, 1.0),
            ..MemoryEvent::default()
        };
        if append_unique_by_hash(&mut long.events, item, EVENT_LIMIT, |e| &e.text_hash) {
            logs.push(String::from("event+"));
        }
    }

    for row in &patch.promises {
        let text = clean_text(&row.text, 420);
        if text.is_empty() {
            continue;
        }
        let item = MemoryPromise {
            ts: now_iso.to_owned(),
            text_hash: content_hash(&text),
            text,
            status: PromiseStatus::parse(&row.status),
            tags: clean_tags(&row.tags),
            importance: row.importance.clamp(0.0, 1.0),
            ..MemoryPromise::default()
        };
        if append_unique_by_hash(&mut long.promises, item, PROMISE_LIMIT, |p| &p.text_hash) {
            logs.push(String::from("promise+"));
        }
    }

    for row in &patch.debts {
        let text = clean_text(&row.text, 420);
        if text.is_empty() {
            continue;
        }
        let item = MemoryDebt {
            ts: now_iso.to_owned(),
            text_hash: content_hash(&text),
            text,
            status: DebtStatus::parse(&row.status),
            tags: clean_tags(&row.tags),
            importance: row.importance.clamp(0.0, 1.0),
            ..MemoryDebt::default()
        };
        if append_unique_by_hash(&mut long.debts, item, DEBT_LIMIT, |d| &d.text_hash) {
            logs.push(String::from("debt+"));
        }
    }

    let delta = patch.relationship_delta.affinity_delta.clamp(-5, 5);
    let player = &mut long.relationships.player;
    player.affinity = player.affinity.saturating_add(delta).clamp(-100, 100);
    for note in patch.relationship_delta.notes.iter().take(4) {
        let text = clean_text(note, 280);
        if text.is_empty() {
            continue;
        }
        player.notes.push(RelationshipNote {
            ts: now_iso.to_owned(),
            text,
        });
    }
    if player.notes.len() > RELATIONSHIP_NOTE_LIMIT {
        let drop = player.notes.len().saturating_sub(RELATIONSHIP_NOTE_LIMIT);
        player.notes.drain(..drop);
    }

    let long_summary = clean_text(&patch.summary, 1200);
    if !long_summary.is_empty() {
        long.summary = LongSummary {
            ts: now_iso.to_owned(),
            text: long_summary,
        };
        logs.push(String::from("summary~"));
    }
    logs
}

fn clean_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| clean_tag(tag, 48))
        .filter(|tag| !tag.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Compaction loops
// ---------------------------------------------------------------------------

fn compact_buffers(
    short: &mut Vec<ShortTurn>,
    long: &mut LongMemory,
    chunks: &mut Vec<MemoryChunk>,
    stats: &mut chronique_types::MemoryStats,
    planner: Option<&dyn CompactionPlanner>,
) -> CompactResult {
    let mut logs: Vec<String> = Vec::new();
    let mut compacted: u32 = 0;
    let mut changed = false;
    let short_max = (stats.short_max.max(20)) as usize;
    let chunk_target = (stats.chunk_target_turns.max(10)) as usize;
    let retain_target = short_max.saturating_sub(chunk_target).max(20);

    while short.len() > short_max {
        let slice: Vec<ShortTurn> = short.iter().take(chunk_target).cloned().collect();
        let now_iso = utc_now_iso();
        let ai_patch = extract_patch_with_ai(&slice, planner);
        let used_ai = ai_patch.is_some();
        let patch = ai_patch.unwrap_or_else(|| extract_patch_fallback(&slice));
        let chunk = chunk_from_patch(&slice, &patch, &now_iso);
        if !chunk.summary.is_empty()
            && append_unique_by_hash(chunks, chunk, CHUNK_LIMIT, |c| &c.text_hash)
        {
            logs.push(String::from("chunk+"));
        }
        logs.extend(apply_patch_to_long(long, &patch, &now_iso));
        short.drain(..chunk_target.min(short.len()));
        stats.last_compact_ts = now_iso;
        compacted = compacted.saturating_add(1);
        changed = true;
        logs.push(String::from(if used_ai {
            "compaction:ai"
        } else {
            "compaction:fallback"
        }));
    }

    if chunks.len() > CHUNK_LIMIT {
        let drop = chunks.len().saturating_sub(CHUNK_LIMIT);
        chunks.drain(..drop);
    }
    if changed && short.len() > retain_target {
        let drop = short.len().saturating_sub(retain_target);
        short.drain(..drop);
    }
    CompactResult {
        changed,
        compacted_chunks: compacted,
        logs,
    }
}

/// Compact an NPC memory in place.
pub fn compact_npc_memory(
    memory: &mut NpcMemory,
    planner: Option<&dyn CompactionPlanner>,
) -> CompactResult {
    compact_buffers(
        &mut memory.short,
        &mut memory.long,
        &mut memory.chunks,
        &mut memory.stats,
        planner,
    )
}

/// Compact the world memory in place (identical algorithm against the
/// world's analogous lists).
pub fn compact_world_memory(
    memory: &mut WorldMemory,
    planner: Option<&dyn CompactionPlanner>,
) -> CompactResult {
    compact_buffers(
        &mut memory.short,
        &mut memory.long,
        &mut memory.chunks,
        &mut memory.stats,
        planner,
    )
}

/// Trace a compaction run; silent when nothing changed.
pub fn log_compaction_result(scope: &str, result: &CompactResult) {
    if !result.changed {
        return;
    }
    let trail = result
        .logs
        .iter()
        .take(12)
        .cloned()
        .collect::<Vec<String>>()
        .join(",");
    tracing::info!(
        scope,
        chunks = result.compacted_chunks,
        trail = %trail,
        "memory compaction triggered"
    );
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FixedPlanner(Value);

    impl CompactionPlanner for FixedPlanner {
        fn plan(&self, _request: &PlannerRequest) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    struct FailingPlanner;

    impl CompactionPlanner for FailingPlanner {
        fn plan(&self, _request: &PlannerRequest) -> anyhow::Result<Value> {
            anyhow::bail!("planner offline")
        }
    }

    fn busy_memory(total: usize) -> NpcMemory {
        let mut memory = NpcMemory::new("tester");
        memory.stats.short_max = 20;
        memory.stats.chunk_target_turns = 10;
        for i in 0..total {
            memory.short.push(ShortTurn::new(
                if i % 2 == 0 { Role::Player } else { Role::Npc },
                &format!("Ligne {i} promets mission {i}"),
                Vec::new(),
                0.45,
                &format!("turn_{i}"),
            ));
        }
        memory
    }

    // -----------------------------------------------------------------------
    // Fallback extractor
    // -----------------------------------------------------------------------

    #[test]
    fn fallback_tags_and_routes_commitments() {
        let turns = vec![
            ShortTurn::new(Role::Player, "Je te promets de payer ma dette", Vec::new(), 0.5, "a"),
            ShortTurn::new(Role::Npc, "La quete commence au donjon", Vec::new(), 0.5, "b"),
        ];
        let patch = extract_patch_fallback(&turns);
        assert!(!patch.chunk_summary.is_empty());
        assert!(patch.chunk_tags.iter().any(|t| t == "promise"));
        assert!(!patch.promises.is_empty());
        assert!(!patch.debts.is_empty());
        assert!(!patch.events.is_empty());
    }

    #[test]
    fn fallback_emits_context_fact_when_nothing_matches() {
        let turns = vec![ShortTurn::new(Role::Npc, "Bonne brise ce matin", Vec::new(), 0.5, "a")];
        let patch = extract_patch_fallback(&turns);
        assert_eq!(patch.facts.len(), 1);
        assert!(patch.facts.first().unwrap().text.starts_with("Contexte resume:"));
    }

    #[test]
    fn fallback_sentiment_drives_affinity_delta() {
        let turns = vec![
            ShortTurn::new(Role::Player, "merci c'est parfait", Vec::new(), 0.5, "a"),
            ShortTurn::new(Role::Player, "oui super", Vec::new(), 0.5, "b"),
        ];
        let patch = extract_patch_fallback(&turns);
        assert!(patch.relationship_delta.affinity_delta > 0);
    }

    #[test]
    fn fallback_empty_slice_yields_placeholder() {
        let patch = extract_patch_fallback(&[]);
        assert_eq!(patch.chunk_summary, "(aucun contenu)");
    }

    #[test]
    fn fallback_importance_clamped_to_documented_floor() {
        let turns = vec![ShortTurn::new(Role::Npc, "rien de notable", Vec::new(), 0.5, "a")];
        let patch = extract_patch_fallback(&turns);
        assert!(patch.chunk_importance >= 0.15);
        assert!(patch.chunk_importance <= 1.0);
    }

    // -----------------------------------------------------------------------
    // Compaction loop
    // -----------------------------------------------------------------------

    #[test]
    fn compaction_trims_short_and_emits_chunks() {
        let mut memory = busy_memory(42);
        let result = compact_npc_memory(&mut memory, None);
        assert!(result.changed);
        assert!(result.compacted_chunks >= 1);
        assert!(memory.short.len() <= 20);
        assert!(!memory.chunks.is_empty());
        assert!(
            !memory.long.facts.is_empty()
                || !memory.long.events.is_empty()
                || !memory.long.promises.is_empty()
        );
    }

    #[test]
    fn compaction_is_monotone() {
        let mut memory = busy_memory(42);
        compact_npc_memory(&mut memory, None);
        let snapshot = memory.clone();
        let second = compact_npc_memory(&mut memory, None);
        assert!(!second.changed);
        assert_eq!(memory, snapshot);
    }

    #[test]
    fn compaction_below_threshold_is_noop() {
        let mut memory = busy_memory(10);
        let result = compact_npc_memory(&mut memory, None);
        assert!(!result.changed);
        assert_eq!(memory.short.len(), 10);
    }

    #[test]
    fn planner_patch_wins_when_valid() {
        let payload = serde_json::json!({
            "chunk_summary": "Le joueur a jure fidelite au forgeron.",
            "chunk_tags": ["promise"],
            "chunk_importance": 0.8,
            "facts": [],
            "events": [],
            "promises": [{"text": "Fidelite juree", "status": "open", "tags": ["promise"], "importance": 0.8}],
            "debts": [],
            "relationship_delta": {"affinity_delta": 2, "notes": ["Confiance en hausse."]},
            "summary": "Serment au forgeron.",
        });
        let planner = FixedPlanner(payload);
        let mut memory = busy_memory(42);
        let result = compact_npc_memory(&mut memory, Some(&planner));
        assert!(result.logs.iter().any(|l| l == "compaction:ai"));
        assert!(memory.long.promises.iter().any(|p| p.text.contains("Fidelite")));
        assert_eq!(memory.long.summary.text, "Serment au forgeron.");
    }

    #[test]
    fn failing_planner_falls_back_silently() {
        let mut memory = busy_memory(42);
        let result = compact_npc_memory(&mut memory, Some(&FailingPlanner));
        assert!(result.changed);
        assert!(result.logs.iter().any(|l| l == "compaction:fallback"));
        assert!(!result.logs.iter().any(|l| l == "compaction:ai"));
    }

    #[test]
    fn non_conforming_planner_payload_falls_back() {
        let planner = FixedPlanner(serde_json::json!({"chunk_summary": ""}));
        let mut memory = busy_memory(42);
        let result = compact_npc_memory(&mut memory, Some(&planner));
        assert!(result.logs.iter().any(|l| l == "compaction:fallback"));
    }

    // -----------------------------------------------------------------------
    // Dedup and merge
    // -----------------------------------------------------------------------

    #[test]
    fn apply_patch_deduplicates_by_hash() {
        let mut long = LongMemory::default();
        let patch = CompactionPatch {
            chunk_summary: String::from("Resume"),
            facts: vec![PatchItem {
                text: String::from("Le joueur a jure fidelite."),
                importance: 0.7,
                ..PatchItem::default()
            }],
            ..CompactionPatch::default()
        };
        apply_patch_to_long(&mut long, &patch, "2026-02-24T10:00:00+00:00");
        apply_patch_to_long(&mut long, &patch, "2026-02-24T10:01:00+00:00");
        assert_eq!(long.facts.len(), 1);
    }

    #[test]
    fn apply_patch_clamps_affinity() {
        let mut long = LongMemory::default();
        long.relationships.player.affinity = 99;
        let patch = CompactionPatch {
            chunk_summary: String::from("Resume"),
            relationship_delta: RelationshipDelta {
                affinity_delta: 50,
                notes: Vec::new(),
            },
            ..CompactionPatch::default()
        };
        apply_patch_to_long(&mut long, &patch, "2026-02-24T10:00:00+00:00");
        assert_eq!(long.relationships.player.affinity, 100);
    }

    #[test]
    fn world_compaction_mirrors_npc_algorithm() {
        let mut world = WorldMemory::default();
        world.stats.short_max = 20;
        world.stats.chunk_target_turns = 10;
        for i in 0..30 {
            world.short.push(ShortTurn::new(
                Role::Narration,
                &format!("Rumeur {i} sur la route"),
                Vec::new(),
                0.4,
                &format!("w{i}"),
            ));
        }
        let result = compact_world_memory(&mut world, None);
        assert!(result.changed);
        assert!(world.short.len() <= 20);
        assert!(!world.chunks.is_empty());
    }
}
