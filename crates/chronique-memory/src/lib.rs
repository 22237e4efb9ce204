//! Persistent memory and retrieval core for the Chronique narrative
//! engine.
//!
//! The subsystem ingests an unbounded stream of dialogue turns, compacts
//! them into a structured long-term record (facts, events, promises,
//! debts, relationship movement, a rolling summary), maintains per-NPC
//! and world vector indices, and answers hybrid retrieval queries that
//! combine vector similarity, tag overlap, recency decay, and
//! importance. Durability comes from atomic file replacement: every
//! persisted document is staged to a sibling temp file and renamed into
//! place.
//!
//! Module map:
//!
//! - [`store`] -- atomic JSON persistence and path layout.
//! - [`embed`] -- mode-detected embedding provider with an on-disk
//!   vector cache.
//! - [`index`] -- dense unit-vector index with cosine search.
//! - [`compactor`] -- short-buffer reduction (planner capability plus
//!   deterministic fallback).
//! - [`retrieval`] -- hybrid scoring into four context streams.
//! - [`service`] -- orchestration, scoping, and the process singleton.
//! - [`migration`] -- legacy save-slot bootstrap.
//! - [`admin`] -- operational facade.

pub mod admin;
pub mod compactor;
pub mod embed;
pub mod error;
pub mod index;
pub mod migration;
pub mod retrieval;
pub mod service;
pub mod store;

pub use admin::{CompactNowReport, MemoryAdmin};
pub use compactor::{
    CompactResult, CompactionPatch, CompactionPlanner, PatchItem, PlannerRequest, PlannerTurn,
    RelationshipDelta, compact_npc_memory, compact_world_memory,
};
pub use embed::{EmbedMode, EmbeddingProvider, LOCAL_EMBED_DIM, embed_local, normalize_vector};
pub use error::MemoryError;
pub use index::{IndexRecord, MappingRow, VectorHit, VectorIndex};
pub use migration::{BootstrapReport, bootstrap_from_existing_history};
pub use retrieval::{RetrievalMode, RetrievedContext, remap_cosine, retrieve_context};
pub use service::{
    MemoryService, PromptMemoryContext, get_memory_service, set_memory_service,
};
pub use store::{MemoryStore, safe_id};
