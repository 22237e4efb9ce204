//! Operational facade over the memory service.
//!
//! Thin wrappers for inspection and maintenance tooling: list scoped
//! NPCs, dump documents, force a compaction, rebuild indexes, purge
//! short buffers. Nothing here adds behavior; it exists so operational
//! code never reaches into service internals.

use std::sync::Arc;

use chronique_types::{NpcMemory, WorldMemory};

use crate::compactor::compact_npc_memory;
use crate::error::MemoryError;
use crate::service::{MemoryService, get_memory_service};

/// Outcome of a forced compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactNowReport {
    /// Whether the memory changed.
    pub changed: bool,
    /// Chunks emitted.
    pub compacted_chunks: u32,
    /// Short-buffer length before.
    pub short_before: usize,
    /// Short-buffer length after.
    pub short_after: usize,
    /// Records admitted into the rebuilt index.
    pub index_records: usize,
}

/// Maintenance operations over a memory service.
#[derive(Clone)]
pub struct MemoryAdmin {
    service: Arc<MemoryService>,
}

impl MemoryAdmin {
    /// Admin over an explicit service.
    pub const fn new(service: Arc<MemoryService>) -> Self {
        Self { service }
    }

    /// Admin over the process-wide singleton.
    pub fn from_default() -> Self {
        Self::new(get_memory_service())
    }

    /// List scoped NPC ids, optionally restricted to one profile.
    pub fn list_npcs(&self, profile_key: Option<&str>) -> Vec<String> {
        self.service.list_scoped_npc_ids(profile_key)
    }

    /// Dump an NPC memory document.
    pub fn read_npc(&self, profile_key: &str, npc_id: &str) -> Result<NpcMemory, MemoryError> {
        self.service.load_npc_memory(profile_key, npc_id)
    }

    /// Dump the world memory document.
    pub fn read_world(&self) -> Result<WorldMemory, MemoryError> {
        self.service.load_world_memory()
    }

    /// Force a deterministic compaction pass and rebuild the index.
    pub async fn compact_npc_now(
        &self,
        profile_key: &str,
        npc_id: &str,
    ) -> Result<CompactNowReport, MemoryError> {
        let mut memory = self.service.load_npc_memory(profile_key, npc_id)?;
        let short_before = memory.short.len();
        let result = compact_npc_memory(&mut memory, None);
        self.service.save_npc_memory(&memory)?;
        let index_records = self.service.rebuild_npc_index(profile_key, npc_id).await?;
        Ok(CompactNowReport {
            changed: result.changed,
            compacted_chunks: result.compacted_chunks,
            short_before,
            short_after: memory.short.len(),
            index_records,
        })
    }

    /// Rebuild one NPC index; returns admitted record count.
    pub async fn rebuild_npc_index(
        &self,
        profile_key: &str,
        npc_id: &str,
    ) -> Result<usize, MemoryError> {
        self.service.rebuild_npc_index(profile_key, npc_id).await
    }

    /// Rebuild the world index; returns admitted record count.
    pub async fn rebuild_world_index(&self) -> Result<usize, MemoryError> {
        self.service.rebuild_world_index().await
    }

    /// Drop the short buffer of one NPC memory.
    pub fn purge_short(&self, profile_key: &str, npc_id: &str) -> Result<bool, MemoryError> {
        self.service.purge_short(profile_key, npc_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::embed::{EmbedMode, EmbeddingProvider};
    use crate::store::MemoryStore;
    use chronique_types::{Role, ShortTurn};

    fn temp_admin() -> (tempfile::TempDir, MemoryAdmin, Arc<MemoryService>) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_roots(
            &dir.path().join("memory"),
            &dir.path().join("memory_index"),
        );
        let embeddings = EmbeddingProvider::with_mode(&store, EmbedMode::LocalModel);
        let service = Arc::new(MemoryService::with_parts(store, embeddings));
        (dir, MemoryAdmin::new(Arc::clone(&service)), service)
    }

    #[tokio::test]
    async fn compact_now_reports_shrink() {
        let (_dir, admin, service) = temp_admin();
        let mut memory = service.load_npc_memory("alice", "garde").unwrap();
        memory.stats.short_max = 20;
        memory.stats.chunk_target_turns = 10;
        for i in 0..42 {
            memory.short.push(ShortTurn::new(
                Role::Player,
                &format!("Ligne {i} promets mission {i}"),
                Vec::new(),
                0.5,
                &format!("t{i}"),
            ));
        }
        service.save_npc_memory(&memory).unwrap();

        let report = admin.compact_npc_now("alice", "garde").await.unwrap();
        assert!(report.changed);
        assert_eq!(report.short_before, 42);
        assert!(report.short_after <= 20);
        assert!(report.index_records >= 1);
    }

    #[tokio::test]
    async fn list_and_purge_round_trip() {
        let (_dir, admin, service) = temp_admin();
        service
            .append_short("alice", "garde", Role::Player, "Bonjour", &[], 0.5, None)
            .await
            .unwrap();
        assert_eq!(admin.list_npcs(Some("alice")), vec![String::from("alice__garde")]);
        assert!(admin.purge_short("alice", "garde").unwrap());
        assert!(admin.read_npc("alice", "garde").unwrap().short.is_empty());
    }
}
