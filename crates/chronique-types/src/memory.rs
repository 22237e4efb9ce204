//! Persistent memory data model.
//!
//! An NPC memory holds a short-turn dialogue buffer, a structured long
//! memory (facts, events, promises, debts, the player relationship, and a
//! rolling summary), the compacted chunk list, and a stats block driving
//! compaction. The world memory mirrors the same shape and adds world
//! flags plus the ordered list of discovered locations.
//!
//! All types derive serde and carry a `sanitize` pass that re-establishes
//! the documented bounds after deserialization: text fields are cleaned,
//! numeric fields clamped, tag lists deduplicated and truncated, bounded
//! lists cut back keeping the newest entries. Enum-valued fields are
//! parsed leniently and fall back to their first declared variant.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::enums::{DebtStatus, ImpactLevel, PromiseStatus, Role};
use crate::text::{clean_tag, clean_text};

// ---------------------------------------------------------------------------
// Schema and capacity constants
// ---------------------------------------------------------------------------

/// Current on-disk schema version for memory documents.
pub const SCHEMA_VERSION: u32 = 2;

/// Maximum number of retained facts per long memory (newest kept).
pub const FACT_LIMIT: usize = 500;

/// Maximum number of retained events per long memory (newest kept).
pub const EVENT_LIMIT: usize = 500;

/// Maximum number of retained promises per long memory (newest kept).
pub const PROMISE_LIMIT: usize = 100;

/// Maximum number of retained debts per long memory (newest kept).
pub const DEBT_LIMIT: usize = 100;

/// Maximum number of compacted chunks per memory (newest kept).
pub const CHUNK_LIMIT: usize = 2000;

/// Maximum number of dated relationship notes (newest kept).
pub const RELATIONSHIP_NOTE_LIMIT: usize = 300;

/// Maximum number of discovered locations in the world memory.
pub const DISCOVERED_LOCATION_LIMIT: usize = 1200;

/// Maximum number of tags on any memory entity.
pub const TAG_LIMIT: usize = 24;

/// Current UTC timestamp in RFC 3339 form, the wire format for all
/// memory timestamps.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Fresh opaque identifier (UUID v4) for turns, facts, events, and chunks.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Lenient field deserializers
// ---------------------------------------------------------------------------

// Enum-valued fields tolerate unknown wire values instead of failing the
// whole document: the raw JSON value is inspected and anything that is not
// a known string collapses to the first declared variant.

fn lenient_role<'de, D: Deserializer<'de>>(de: D) -> Result<Role, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(value.as_str().map(Role::parse).unwrap_or_default())
}

fn lenient_impact<'de, D: Deserializer<'de>>(de: D) -> Result<ImpactLevel, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(value.as_str().map(ImpactLevel::parse).unwrap_or_default())
}

fn lenient_promise_status<'de, D: Deserializer<'de>>(de: D) -> Result<PromiseStatus, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(value.as_str().map(PromiseStatus::parse).unwrap_or_default())
}

fn lenient_debt_status<'de, D: Deserializer<'de>>(de: D) -> Result<DebtStatus, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(value.as_str().map(DebtStatus::parse).unwrap_or_default())
}

/// Deduplicate tags preserving first occurrence, slugify, cap at
/// [`TAG_LIMIT`].
pub fn sanitize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in tags {
        let tag = clean_tag(raw, 48);
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out.truncate(TAG_LIMIT);
    out
}

fn sanitize_hash(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Truncate a list keeping the newest (trailing) entries.
fn keep_newest<T>(items: &mut Vec<T>, limit: usize) {
    if items.len() > limit {
        let drop = items.len().saturating_sub(limit);
        items.drain(..drop);
    }
}

// ---------------------------------------------------------------------------
// Short turns
// ---------------------------------------------------------------------------

/// One dialogue turn in the short-term buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTurn {
    /// RFC 3339 timestamp of the turn.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Speaker role.
    #[serde(default, deserialize_with = "lenient_role")]
    pub role: Role,
    /// Normalized turn text (at most 460 characters).
    #[serde(default)]
    pub text: String,
    /// Slug tags (at most 24, unique).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default)]
    pub importance: f64,
    /// Opaque turn identifier; shared by the two halves of a dialogue turn.
    #[serde(default = "new_id")]
    pub turn_id: String,
}

impl Default for ShortTurn {
    fn default() -> Self {
        Self {
            ts: utc_now_iso(),
            role: Role::Npc,
            text: String::new(),
            tags: Vec::new(),
            importance: 0.0,
            turn_id: new_id(),
        }
    }
}

impl ShortTurn {
    /// Maximum text length for a short turn.
    pub const TEXT_MAX: usize = 460;

    /// Build a sanitized turn.
    pub fn new(role: Role, text: &str, tags: Vec<String>, importance: f64, turn_id: &str) -> Self {
        let mut turn = Self {
            role,
            text: text.to_owned(),
            tags,
            importance,
            turn_id: if turn_id.trim().is_empty() {
                new_id()
            } else {
                turn_id.trim().to_owned()
            },
            ..Self::default()
        };
        turn.sanitize();
        turn
    }

    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, Self::TEXT_MAX);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        if self.turn_id.trim().is_empty() {
            self.turn_id = new_id();
        }
    }
}

// ---------------------------------------------------------------------------
// Long-memory items
// ---------------------------------------------------------------------------

/// A remembered fact about the player or the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    /// Opaque identifier.
    #[serde(default = "new_id")]
    pub id: String,
    /// RFC 3339 timestamp.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Normalized text (at most 420 characters).
    #[serde(default)]
    pub text: String,
    /// Confidence in `[0, 1]`.
    #[serde(default = "MemoryFact::default_confidence")]
    pub confidence: f64,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default = "default_importance_mid")]
    pub importance: f64,
    /// Deduplication key: content hash of the text.
    #[serde(default)]
    pub text_hash: String,
}

impl Default for MemoryFact {
    fn default() -> Self {
        Self {
            id: new_id(),
            ts: utc_now_iso(),
            text: String::new(),
            confidence: Self::default_confidence(),
            tags: Vec::new(),
            importance: default_importance_mid(),
            text_hash: String::new(),
        }
    }
}

impl MemoryFact {
    const fn default_confidence() -> f64 {
        0.65
    }

    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, 420);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        self.text_hash = sanitize_hash(&self.text_hash);
    }
}

fn default_importance_mid() -> f64 {
    0.5
}

fn default_importance_commitment() -> f64 {
    0.6
}

/// A remembered event with an impact magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Opaque identifier.
    #[serde(default = "new_id")]
    pub id: String,
    /// RFC 3339 timestamp.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Normalized text (at most 420 characters).
    #[serde(default)]
    pub text: String,
    /// Impact magnitude.
    #[serde(default, deserialize_with = "lenient_impact")]
    pub impact: ImpactLevel,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default = "default_importance_mid")]
    pub importance: f64,
    /// Deduplication key.
    #[serde(default)]
    pub text_hash: String,
}

impl Default for MemoryEvent {
    fn default() -> Self {
        Self {
            id: new_id(),
            ts: utc_now_iso(),
            text: String::new(),
            impact: ImpactLevel::Low,
            tags: Vec::new(),
            importance: default_importance_mid(),
            text_hash: String::new(),
        }
    }
}

impl MemoryEvent {
    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, 420);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        self.text_hash = sanitize_hash(&self.text_hash);
    }
}

/// A remembered promise with a lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPromise {
    /// Opaque identifier.
    #[serde(default = "new_id")]
    pub id: String,
    /// RFC 3339 timestamp.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Normalized text (at most 420 characters).
    #[serde(default)]
    pub text: String,
    /// Lifecycle status.
    #[serde(default, deserialize_with = "lenient_promise_status")]
    pub status: PromiseStatus,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default = "default_importance_commitment")]
    pub importance: f64,
    /// Deduplication key.
    #[serde(default)]
    pub text_hash: String,
}

impl Default for MemoryPromise {
    fn default() -> Self {
        Self {
            id: new_id(),
            ts: utc_now_iso(),
            text: String::new(),
            status: PromiseStatus::Open,
            tags: Vec::new(),
            importance: default_importance_commitment(),
            text_hash: String::new(),
        }
    }
}

impl MemoryPromise {
    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, 420);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        self.text_hash = sanitize_hash(&self.text_hash);
    }
}

/// A remembered debt with a lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDebt {
    /// Opaque identifier.
    #[serde(default = "new_id")]
    pub id: String,
    /// RFC 3339 timestamp.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Normalized text (at most 420 characters).
    #[serde(default)]
    pub text: String,
    /// Lifecycle status.
    #[serde(default, deserialize_with = "lenient_debt_status")]
    pub status: DebtStatus,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default = "default_importance_commitment")]
    pub importance: f64,
    /// Deduplication key.
    #[serde(default)]
    pub text_hash: String,
}

impl Default for MemoryDebt {
    fn default() -> Self {
        Self {
            id: new_id(),
            ts: utc_now_iso(),
            text: String::new(),
            status: DebtStatus::Open,
            tags: Vec::new(),
            importance: default_importance_commitment(),
            text_hash: String::new(),
        }
    }
}

impl MemoryDebt {
    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, 420);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        self.text_hash = sanitize_hash(&self.text_hash);
    }
}

// ---------------------------------------------------------------------------
// Relationships and rolling summary
// ---------------------------------------------------------------------------

/// A dated free-text note about the player relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipNote {
    /// RFC 3339 timestamp.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Note text (at most 280 characters).
    #[serde(default)]
    pub text: String,
}

impl Default for RelationshipNote {
    fn default() -> Self {
        Self {
            ts: utc_now_iso(),
            text: String::new(),
        }
    }
}

impl RelationshipNote {
    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.text = clean_text(&self.text, 280);
    }
}

/// Affinity score and note trail for the player relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlayerRelationship {
    /// Affinity in `[-100, 100]`.
    #[serde(default)]
    pub affinity: i32,
    /// Dated notes, newest last (at most 300 kept).
    #[serde(default)]
    pub notes: Vec<RelationshipNote>,
}

impl PlayerRelationship {
    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.affinity = self.affinity.clamp(-100, 100);
        for note in &mut self.notes {
            note.sanitize();
        }
        keep_newest(&mut self.notes, RELATIONSHIP_NOTE_LIMIT);
    }
}

/// Relationship container (a single tracked player today).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Relationships {
    /// The player relationship.
    #[serde(default)]
    pub player: PlayerRelationship,
}

/// Rolling textual summary of the long memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongSummary {
    /// RFC 3339 timestamp of the last overwrite.
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    /// Summary text (at most 1200 characters).
    #[serde(default = "LongSummary::placeholder")]
    pub text: String,
}

impl Default for LongSummary {
    fn default() -> Self {
        Self {
            ts: utc_now_iso(),
            text: Self::placeholder(),
        }
    }
}

impl LongSummary {
    /// Placeholder shown before any compaction has produced a summary.
    pub fn placeholder() -> String {
        String::from("(aucun resume)")
    }

    /// Re-establish field bounds in place; an empty summary falls back to
    /// the placeholder.
    pub fn sanitize(&mut self) {
        let cleaned = clean_text(&self.text, 1200);
        self.text = if cleaned.is_empty() {
            Self::placeholder()
        } else {
            cleaned
        };
    }
}

/// Structured long-term record: capped lists plus relationship and summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LongMemory {
    /// Remembered facts (at most 500).
    #[serde(default)]
    pub facts: Vec<MemoryFact>,
    /// Remembered events (at most 500).
    #[serde(default)]
    pub events: Vec<MemoryEvent>,
    /// Remembered promises (at most 100).
    #[serde(default)]
    pub promises: Vec<MemoryPromise>,
    /// Remembered debts (at most 100).
    #[serde(default)]
    pub debts: Vec<MemoryDebt>,
    /// Player relationship.
    #[serde(default)]
    pub relationships: Relationships,
    /// Rolling summary.
    #[serde(default)]
    pub summary: LongSummary,
}

impl LongMemory {
    /// Re-establish bounds on every contained entity and list.
    pub fn sanitize(&mut self) {
        for fact in &mut self.facts {
            fact.sanitize();
        }
        for event in &mut self.events {
            event.sanitize();
        }
        for promise in &mut self.promises {
            promise.sanitize();
        }
        for debt in &mut self.debts {
            debt.sanitize();
        }
        keep_newest(&mut self.facts, FACT_LIMIT);
        keep_newest(&mut self.events, EVENT_LIMIT);
        keep_newest(&mut self.promises, PROMISE_LIMIT);
        keep_newest(&mut self.debts, DEBT_LIMIT);
        self.relationships.player.sanitize();
        self.summary.sanitize();
    }
}

// ---------------------------------------------------------------------------
// Chunks and stats
// ---------------------------------------------------------------------------

/// Compacted summary of a contiguous slice of short turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    /// Opaque chunk identifier.
    #[serde(default = "new_id")]
    pub chunk_id: String,
    /// `[start, end]` RFC 3339 range of the contributing turns.
    #[serde(default = "MemoryChunk::default_range")]
    pub ts_range: Vec<String>,
    /// Contributing turn identifiers (unique, order preserved).
    #[serde(default)]
    pub turn_ids: Vec<String>,
    /// Summary text (at most 1000 characters).
    #[serde(default)]
    pub summary: String,
    /// Slug tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`.
    #[serde(default = "default_importance_mid")]
    pub importance: f64,
    /// Deduplication key: content hash of the summary.
    #[serde(default)]
    pub text_hash: String,
}

impl Default for MemoryChunk {
    fn default() -> Self {
        Self {
            chunk_id: new_id(),
            ts_range: Self::default_range(),
            turn_ids: Vec::new(),
            summary: String::new(),
            tags: Vec::new(),
            importance: default_importance_mid(),
            text_hash: String::new(),
        }
    }
}

impl MemoryChunk {
    fn default_range() -> Vec<String> {
        let now = utc_now_iso();
        vec![now.clone(), now]
    }

    /// End timestamp of the chunk's range, empty when absent.
    pub fn ts_end(&self) -> &str {
        self.ts_range.last().map_or("", String::as_str)
    }

    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.summary = clean_text(&self.summary, 1000);
        self.tags = sanitize_tags(&self.tags);
        self.importance = self.importance.clamp(0.0, 1.0);
        self.text_hash = sanitize_hash(&self.text_hash);
        if self.ts_range.is_empty() {
            self.ts_range = Self::default_range();
        }
    }
}

/// Tunables and bookkeeping for the compaction schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Compaction trigger: short buffer length above which compaction
    /// runs. Clamped to `[20, 240]`.
    #[serde(default = "MemoryStats::default_short_max")]
    pub short_max: u32,
    /// Leading-slice size per compaction iteration. Clamped to
    /// `[10, 120]`.
    #[serde(default = "MemoryStats::default_chunk_target")]
    pub chunk_target_turns: u32,
    /// RFC 3339 timestamp of the last compaction, empty before the first.
    #[serde(default)]
    pub last_compact_ts: String,
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self {
            short_max: Self::default_short_max(),
            chunk_target_turns: Self::default_chunk_target(),
            last_compact_ts: String::new(),
        }
    }
}

impl MemoryStats {
    const fn default_short_max() -> u32 {
        60
    }

    const fn default_chunk_target() -> u32 {
        40
    }

    /// Re-establish field bounds in place.
    pub fn sanitize(&mut self) {
        self.short_max = self.short_max.clamp(20, 240);
        self.chunk_target_turns = self.chunk_target_turns.clamp(10, 120);
    }
}

// ---------------------------------------------------------------------------
// Top-level documents
// ---------------------------------------------------------------------------

/// Full persisted memory for one scoped NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcMemory {
    /// On-disk schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Scoped NPC identifier (`profile__npc`).
    #[serde(default)]
    pub npc_id: String,
    /// Short-term dialogue buffer, oldest first.
    #[serde(default)]
    pub short: Vec<ShortTurn>,
    /// Structured long memory.
    #[serde(default)]
    pub long: LongMemory,
    /// Compacted chunks, oldest first (at most 2000).
    #[serde(default)]
    pub chunks: Vec<MemoryChunk>,
    /// Compaction tunables.
    #[serde(default)]
    pub stats: MemoryStats,
}

impl Default for NpcMemory {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            npc_id: String::new(),
            short: Vec::new(),
            long: LongMemory::default(),
            chunks: Vec::new(),
            stats: MemoryStats::default(),
        }
    }
}

impl NpcMemory {
    /// Fresh memory for a scoped NPC id.
    pub fn new(npc_id: &str) -> Self {
        Self {
            npc_id: npc_id.to_owned(),
            ..Self::default()
        }
    }

    /// Re-establish bounds on every contained entity and list.
    pub fn sanitize(&mut self) {
        self.schema_version = self.schema_version.max(1);
        for turn in &mut self.short {
            turn.sanitize();
        }
        self.long.sanitize();
        for chunk in &mut self.chunks {
            chunk.sanitize();
        }
        keep_newest(&mut self.chunks, CHUNK_LIMIT);
        self.stats.sanitize();
    }
}

/// Singleton world-scoped memory: same shape as an NPC memory plus world
/// flags and discovered locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMemory {
    /// On-disk schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Short-term buffer of world-level narration and system lines.
    #[serde(default)]
    pub short: Vec<ShortTurn>,
    /// Structured long memory.
    #[serde(default)]
    pub long: LongMemory,
    /// Compacted chunks (at most 2000).
    #[serde(default)]
    pub chunks: Vec<MemoryChunk>,
    /// Open-shape world flags owned by the orchestrator.
    #[serde(default)]
    pub world_flags: BTreeMap<String, Value>,
    /// Ordered unique discovered-location names (at most 1200, newest
    /// kept).
    #[serde(default)]
    pub discovered_locations: Vec<String>,
    /// Compaction tunables.
    #[serde(default)]
    pub stats: MemoryStats,
}

impl Default for WorldMemory {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            short: Vec::new(),
            long: LongMemory::default(),
            chunks: Vec::new(),
            world_flags: BTreeMap::new(),
            discovered_locations: Vec::new(),
            stats: MemoryStats::default(),
        }
    }
}

impl WorldMemory {
    /// Re-establish bounds on every contained entity and list.
    pub fn sanitize(&mut self) {
        self.schema_version = self.schema_version.max(1);
        for turn in &mut self.short {
            turn.sanitize();
        }
        self.long.sanitize();
        for chunk in &mut self.chunks {
            chunk.sanitize();
        }
        keep_newest(&mut self.chunks, CHUNK_LIMIT);

        let mut seen: Vec<String> = Vec::new();
        for raw in &self.discovered_locations {
            let name = clean_text(raw, 120);
            if !name.is_empty() && !seen.contains(&name) {
                seen.push(name);
            }
        }
        keep_newest(&mut seen, DISCOVERED_LOCATION_LIMIT);
        self.discovered_locations = seen;
        self.stats.sanitize();
    }
}

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn turn(text: &str) -> ShortTurn {
        ShortTurn::new(Role::Player, text, Vec::new(), 0.5, "t1")
    }

    // -----------------------------------------------------------------------
    // Sanitize passes
    // -----------------------------------------------------------------------

    #[test]
    fn short_turn_clamps_and_cleans() {
        let long_text = "mot ".repeat(300);
        let t = ShortTurn::new(Role::Player, &long_text, vec![String::from("  Quest!  ")], 4.0, "");
        assert!(t.text.chars().count() <= ShortTurn::TEXT_MAX);
        assert_eq!(t.tags, vec![String::from("quest")]);
        assert!((t.importance - 1.0).abs() < f64::EPSILON);
        assert!(!t.turn_id.is_empty());
    }

    #[test]
    fn tags_dedupe_preserving_first_and_cap() {
        let raw: Vec<String> = (0..40).map(|i| format!("tag{i}")).chain([String::from("tag0")]).collect();
        let tags = sanitize_tags(&raw);
        assert_eq!(tags.len(), TAG_LIMIT);
        assert_eq!(tags.first().map(String::as_str), Some("tag0"));
    }

    #[test]
    fn long_memory_caps_keep_newest() {
        let mut long = LongMemory::default();
        for i in 0..(FACT_LIMIT + 20) {
            long.facts.push(MemoryFact {
                text: format!("fait {i}"),
                ..MemoryFact::default()
            });
        }
        long.sanitize();
        assert_eq!(long.facts.len(), FACT_LIMIT);
        assert!(long.facts.last().is_some_and(|f| f.text.contains("519")));
    }

    #[test]
    fn relationship_affinity_clamped() {
        let mut rel = PlayerRelationship {
            affinity: 500,
            notes: Vec::new(),
        };
        rel.sanitize();
        assert_eq!(rel.affinity, 100);
    }

    #[test]
    fn summary_falls_back_to_placeholder() {
        let mut summary = LongSummary {
            ts: utc_now_iso(),
            text: String::from("   "),
        };
        summary.sanitize();
        assert_eq!(summary.text, LongSummary::placeholder());
    }

    #[test]
    fn stats_clamped_to_documented_ranges() {
        let mut stats = MemoryStats {
            short_max: 5,
            chunk_target_turns: 900,
            last_compact_ts: String::new(),
        };
        stats.sanitize();
        assert_eq!(stats.short_max, 20);
        assert_eq!(stats.chunk_target_turns, 120);
    }

    #[test]
    fn world_memory_dedupes_discovered_locations() {
        let mut world = WorldMemory::default();
        world.discovered_locations = vec![
            String::from("Lumeria"),
            String::from("  Lumeria "),
            String::from("Dun'Khar"),
        ];
        world.sanitize();
        assert_eq!(world.discovered_locations.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Lenient deserialization
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_role_falls_back_to_npc() {
        let json = r#"{"role": "dragon", "text": "bonjour"}"#;
        let parsed: ShortTurn = serde_json::from_str(json).unwrap_or_default();
        assert_eq!(parsed.role, Role::Npc);
        assert_eq!(parsed.text, "bonjour");
    }

    #[test]
    fn unknown_impact_falls_back_to_low() {
        let json = r#"{"text": "incident", "impact": 42}"#;
        let parsed: MemoryEvent = serde_json::from_str(json).unwrap_or_default();
        assert_eq!(parsed.impact, ImpactLevel::Low);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: NpcMemory = serde_json::from_str("{}").unwrap_or_default();
        assert_eq!(parsed.schema_version, SCHEMA_VERSION);
        assert!(parsed.short.is_empty());
        assert_eq!(parsed.stats.short_max, 60);
    }

    #[test]
    fn npc_memory_round_trips_through_json() {
        let mut mem = NpcMemory::new("alice__marchande");
        mem.short.push(turn("Je vends une potion"));
        mem.sanitize();
        let json = serde_json::to_string(&mem).unwrap_or_default();
        let back: NpcMemory = serde_json::from_str(&json).unwrap_or_default();
        assert_eq!(back, mem);
    }
}
