//! Shared type definitions for the Chronique narrative engine.
//!
//! This crate holds the leaves of the dependency graph:
//!
//! - [`text`] -- whitespace-collapsing normalization, tag slugs, and the
//!   content hash used as the deduplication key across the memory system.
//! - [`enums`] -- closed vocabularies (dialogue roles, event impact,
//!   promise/debt status) with lenient parsing that falls back to the
//!   first declared variant.
//! - [`memory`] -- the persistent memory data model: short turns, long
//!   memory (facts, events, promises, debts, relationships, rolling
//!   summary), compacted chunks, and the per-memory stats block.
//! - [`items`] -- item definitions, stack/slot inventory grids, and the
//!   player purse consumed by the trade engine.
//!
//! Every structured type validates on construction or after
//! deserialization through its `sanitize` pass: numeric fields are clamped
//! to their stated ranges, text fields are cleaned, tag lists are
//! deduplicated and truncated. A persisted payload that fails structural
//! parsing is replaced by a fresh default at the store layer.

pub mod enums;
pub mod items;
pub mod memory;
pub mod text;

pub use enums::{DebtStatus, ImpactLevel, PromiseStatus, Role};
pub use items::{InventoryGrid, ItemDef, ItemDefs, ItemStack, PlayerState};
pub use memory::{
    CHUNK_LIMIT, DEBT_LIMIT, EVENT_LIMIT, FACT_LIMIT, LongMemory, LongSummary, MemoryChunk,
    MemoryDebt, MemoryEvent, MemoryFact, MemoryPromise, MemoryStats, NpcMemory,
    PROMISE_LIMIT, PlayerRelationship, RELATIONSHIP_NOTE_LIMIT, RelationshipNote, Relationships,
    SCHEMA_VERSION, ShortTurn, WorldMemory, new_id, utc_now_iso,
};
pub use text::{clean_tag, clean_text, content_hash, normalize_for_hash};
