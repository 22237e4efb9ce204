//! Atomic JSON persistence for memory documents and index sidecars.
//!
//! Two roots: `memory_root` holds the JSON documents
//! (`npcs/<scoped_id>.json`, `world.json`), `index_root` holds the vector
//! payloads and line-delimited mappings (`npcs/<scoped_id>.vec` /
//! `.jsonl`, `world.vec` / `world.jsonl`, `emb_cache.jsonl`).
//!
//! Writers never truncate in place: content is staged to a sibling
//! temporary file in the same directory, fsynced, then renamed over the
//! destination. A reader in the same filesystem therefore sees either the
//! old document or the new one, never a torn write. Write failures are
//! fatal ([`MemoryError::Io`]); read failures are not -- a corrupted or
//! missing document yields a fresh default that is immediately written
//! through.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chronique_types::{NpcMemory, WorldMemory};
use serde_json::Value;

use crate::error::MemoryError;

/// Sanitize an identifier for use as a file stem.
///
/// Keeps `[A-Za-z0-9._:-]`, collapses every other run to `_`, strips
/// terminal `.`/`_`/`-`, caps at 180 characters. An identifier reduced to
/// nothing becomes `fallback`.
pub fn safe_id(value: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(value.len().min(180));
    let mut last_was_sep = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-') {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    let capped: String = trimmed.chars().take(180).collect();
    if capped.is_empty() {
        fallback.to_owned()
    } else {
        capped
    }
}

/// File-backed store for NPC and world memories plus index sidecars.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    /// Root for JSON memory documents.
    pub memory_root: PathBuf,
    /// Root for vector payloads and mappings.
    pub index_root: PathBuf,
}

impl MemoryStore {
    /// Store rooted at the default `data/` layout.
    pub fn new() -> Self {
        Self::with_roots(Path::new("data/memory"), Path::new("data/memory_index"))
    }

    /// Store rooted at explicit directories.
    pub fn with_roots(memory_root: &Path, index_root: &Path) -> Self {
        Self {
            memory_root: memory_root.to_owned(),
            index_root: index_root.to_owned(),
        }
    }

    fn npc_memory_dir(&self) -> PathBuf {
        self.memory_root.join("npcs")
    }

    fn npc_index_dir(&self) -> PathBuf {
        self.index_root.join("npcs")
    }

    /// Path of the JSON document for a scoped NPC id.
    pub fn npc_memory_path(&self, npc_id: &str) -> PathBuf {
        self.npc_memory_dir()
            .join(format!("{}.json", safe_id(npc_id, "unknown")))
    }

    /// Path of the vector payload for a scoped NPC id.
    pub fn npc_index_path(&self, npc_id: &str) -> PathBuf {
        self.npc_index_dir()
            .join(format!("{}.vec", safe_id(npc_id, "unknown")))
    }

    /// Path of the mapping sidecar for a scoped NPC id.
    pub fn npc_mapping_path(&self, npc_id: &str) -> PathBuf {
        self.npc_index_dir()
            .join(format!("{}.jsonl", safe_id(npc_id, "unknown")))
    }

    /// Path of the world memory document.
    pub fn world_memory_path(&self) -> PathBuf {
        self.memory_root.join("world.json")
    }

    /// Path of the world vector payload.
    pub fn world_index_path(&self) -> PathBuf {
        self.index_root.join("world.vec")
    }

    /// Path of the world mapping sidecar.
    pub fn world_mapping_path(&self) -> PathBuf {
        self.index_root.join("world.jsonl")
    }

    /// Path of the embedding cache.
    pub fn emb_cache_path(&self) -> PathBuf {
        self.index_root.join("emb_cache.jsonl")
    }

    /// Sorted stems of persisted NPC memory documents.
    pub fn list_npc_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let Ok(entries) = fs::read_dir(self.npc_memory_dir()) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let trimmed = stem.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_owned());
                }
            }
        }
        out.sort();
        out
    }

    // -----------------------------------------------------------------------
    // Atomic write primitive
    // -----------------------------------------------------------------------

    /// Stage `content` to a sibling temp file, fsync, rename over `path`.
    pub fn atomic_write_text(&self, path: &Path, content: &str) -> Result<(), MemoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MemoryError::io(parent, e))?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document");
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| MemoryError::io(&tmp_path, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| MemoryError::io(&tmp_path, e))?;
            file.sync_all().map_err(|e| MemoryError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| MemoryError::io(path, e))
    }

    /// Atomic counterpart for binary payloads (vector files).
    pub fn atomic_write_bytes(&self, path: &Path, content: &[u8]) -> Result<(), MemoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MemoryError::io(parent, e))?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("payload");
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| MemoryError::io(&tmp_path, e))?;
            file.write_all(content).map_err(|e| MemoryError::io(&tmp_path, e))?;
            file.sync_all().map_err(|e| MemoryError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| MemoryError::io(path, e))
    }

    // -----------------------------------------------------------------------
    // Memory documents
    // -----------------------------------------------------------------------

    /// Load an NPC memory, resetting to a fresh default on any read or
    /// parse failure. The fresh default is written through so the next
    /// load sees a well-formed document.
    pub fn load_npc_memory(&self, npc_id: &str) -> Result<NpcMemory, MemoryError> {
        let clean_id = safe_id(npc_id, "unknown");
        let path = self.npc_memory_path(&clean_id);
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(mut memory) = serde_json::from_str::<NpcMemory>(&raw) {
                memory.npc_id = clean_id;
                memory.sanitize();
                return Ok(memory);
            }
            tracing::warn!(npc_id = %clean_id, "corrupted NPC memory document, resetting");
        }
        let memory = NpcMemory::new(&clean_id);
        self.save_npc_memory(&memory)?;
        Ok(memory)
    }

    /// Persist an NPC memory atomically under its sanitized id.
    pub fn save_npc_memory(&self, memory: &NpcMemory) -> Result<(), MemoryError> {
        let clean_id = safe_id(&memory.npc_id, "unknown");
        let mut doc = memory.clone();
        doc.npc_id = clean_id.clone();
        let json = serde_json::to_string_pretty(&doc)?;
        self.atomic_write_text(&self.npc_memory_path(&clean_id), &json)
    }

    /// Load the world memory, resetting to a fresh default on any read or
    /// parse failure.
    pub fn load_world_memory(&self) -> Result<WorldMemory, MemoryError> {
        let path = self.world_memory_path();
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(mut memory) = serde_json::from_str::<WorldMemory>(&raw) {
                memory.sanitize();
                return Ok(memory);
            }
            tracing::warn!("corrupted world memory document, resetting");
        }
        let memory = WorldMemory::default();
        self.save_world_memory(&memory)?;
        Ok(memory)
    }

    /// Persist the world memory atomically.
    pub fn save_world_memory(&self, memory: &WorldMemory) -> Result<(), MemoryError> {
        let json = serde_json::to_string_pretty(memory)?;
        self.atomic_write_text(&self.world_memory_path(), &json)
    }

    // -----------------------------------------------------------------------
    // JSONL sidecars
    // -----------------------------------------------------------------------

    /// Read a line-delimited JSON file; invalid or blank lines are
    /// skipped, a missing or unreadable file yields an empty list.
    pub fn read_jsonl(&self, path: &Path) -> Vec<Value> {
        let Ok(raw) = fs::read_to_string(path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str::<Value>(trimmed)
                    .ok()
                    .filter(Value::is_object)
            })
            .collect()
    }

    /// Rewrite a line-delimited JSON file atomically (whole-file, no
    /// appends).
    pub fn write_jsonl(&self, path: &Path, rows: &[Value]) -> Result<(), MemoryError> {
        let mut lines: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_object() {
                lines.push(serde_json::to_string(row)?);
            }
        }
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        self.atomic_write_text(path, &content)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chronique_types::{Role, ShortTurn};

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_roots(
            &dir.path().join("memory"),
            &dir.path().join("memory_index"),
        );
        (dir, store)
    }

    // -----------------------------------------------------------------------
    // safe_id
    // -----------------------------------------------------------------------

    #[test]
    fn safe_id_keeps_allowed_chars() {
        assert_eq!(safe_id("alice__marchande", "unknown"), "alice__marchande");
        assert_eq!(safe_id("  grand marché!!", "unknown"), "grand_march");
        assert_eq!(safe_id("", "unknown"), "unknown");
        assert_eq!(safe_id("...", "unknown"), "unknown");
    }

    #[test]
    fn safe_id_caps_length() {
        let long = "a".repeat(400);
        assert_eq!(safe_id(&long, "unknown").len(), 180);
    }

    // -----------------------------------------------------------------------
    // Load / save round trips
    // -----------------------------------------------------------------------

    #[test]
    fn missing_npc_document_yields_written_default() {
        let (_dir, store) = temp_store();
        let memory = store.load_npc_memory("alice__forgeron").unwrap_or_default();
        assert_eq!(memory.npc_id, "alice__forgeron");
        assert!(store.npc_memory_path("alice__forgeron").exists());
    }

    #[test]
    fn corrupted_npc_document_resets_to_default() {
        let (_dir, store) = temp_store();
        let path = store.npc_memory_path("alice__garde");
        store
            .atomic_write_text(&path, "{not json at all")
            .unwrap();
        let memory = store.load_npc_memory("alice__garde").unwrap_or_default();
        assert!(memory.short.is_empty());
        // The reset was written through.
        let reloaded = store.load_npc_memory("alice__garde").unwrap_or_default();
        assert_eq!(reloaded, memory);
    }

    #[test]
    fn save_load_save_is_stable() {
        let (_dir, store) = temp_store();
        let mut memory = store.load_npc_memory("p__npc").unwrap_or_default();
        memory
            .short
            .push(ShortTurn::new(Role::Player, "Salut", Vec::new(), 0.5, "t1"));
        store.save_npc_memory(&memory).unwrap();
        let first = std::fs::read_to_string(store.npc_memory_path("p__npc")).unwrap_or_default();
        let loaded = store.load_npc_memory("p__npc").unwrap_or_default();
        store.save_npc_memory(&loaded).unwrap();
        let second = std::fs::read_to_string(store.npc_memory_path("p__npc")).unwrap_or_default();
        assert_eq!(first, second);
    }

    #[test]
    fn world_memory_round_trips() {
        let (_dir, store) = temp_store();
        let mut world = store.load_world_memory().unwrap_or_default();
        world.discovered_locations.push(String::from("Lumeria"));
        store.save_world_memory(&world).unwrap();
        let loaded = store.load_world_memory().unwrap_or_default();
        assert_eq!(loaded.discovered_locations, vec![String::from("Lumeria")]);
    }

    #[test]
    fn list_npc_ids_sorted() {
        let (_dir, store) = temp_store();
        let _ = store.load_npc_memory("b__npc");
        let _ = store.load_npc_memory("a__npc");
        assert_eq!(store.list_npc_ids(), vec!["a__npc", "b__npc"]);
    }

    // -----------------------------------------------------------------------
    // JSONL helpers
    // -----------------------------------------------------------------------

    #[test]
    fn jsonl_round_trip_skips_invalid_lines() {
        let (_dir, store) = temp_store();
        let path = store.index_root.join("rows.jsonl");
        let rows = vec![
            serde_json::json!({"a": 1}),
            serde_json::json!({"b": 2}),
        ];
        store.write_jsonl(&path, &rows).unwrap();
        // Corrupt one line in place through the same atomic path.
        let raw = std::fs::read_to_string(&path).unwrap_or_default();
        let tampered = format!("{raw}garbage line\n");
        store
            .atomic_write_text(&path, &tampered)
            .unwrap();
        let back = store.read_jsonl(&path);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (_dir, store) = temp_store();
        let path = store.memory_root.join("probe.json");
        store
            .atomic_write_text(&path, "{}")
            .unwrap();
        let mut names: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&store.memory_root) {
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }
}
