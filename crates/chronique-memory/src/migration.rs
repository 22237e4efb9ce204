//! Bootstrap migration from legacy save-slot payloads.
//!
//! Older saves carried dialogue history inside the slot file
//! (`saves/profiles/<profile>/slot_N.json`, or `saves/slot_N.json` for
//! the scope-free layout) under three keys:
//!
//! - `conversation_short_term` -- per-NPC lists of dated turns,
//! - `conversation_long_term` -- per-NPC summaries with a `kind`,
//! - `conversation_global_long_term` -- world-level summaries.
//!
//! The bootstrap walks every slot, routes entries into the memory
//! documents (kind-dispatched, hash-deduplicated), runs a fallback
//! compaction, persists, and rebuilds indexes. Entries with no turn id
//! substitute the content hash of their text, which keeps deduplication
//! stable across reruns. Unreadable slots and per-NPC index failures are
//! skipped, never fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chronique_types::{
    DebtStatus, ImpactLevel, MemoryDebt, MemoryEvent, MemoryFact, MemoryPromise, NpcMemory,
    PromiseStatus, Role, ShortTurn, clean_tag, clean_text, content_hash, utc_now_iso,
};
use serde_json::Value;

use crate::compactor::{compact_npc_memory, compact_world_memory};
use crate::error::MemoryError;
use crate::service::MemoryService;
use crate::store::safe_id;

/// Counters reported by a bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootstrapReport {
    /// Slots successfully parsed.
    pub slots: u32,
    /// Distinct NPC memories touched.
    pub npcs_touched: u32,
    /// Short turns ingested.
    pub short_added: u32,
    /// Long-memory entries ingested.
    pub long_added: u32,
    /// World events ingested.
    pub world_added: u32,
    /// Indexes rebuilt.
    pub indexes_rebuilt: u32,
}

fn slot_state(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    let payload: Value = serde_json::from_str(&raw).ok()?;
    let state = payload.get("state")?;
    state.is_object().then(|| state.clone())
}

fn sorted_slot_paths(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("slot_") && name.ends_with(".json") {
            out.push(path);
        }
    }
    out.sort();
    out
}

/// Every `(profile, state)` pair found under the saves root: the
/// per-profile layout first, then scope-free slots under `default`.
fn iter_save_states(saves_root: &Path) -> Vec<(String, Value)> {
    let mut out: Vec<(String, Value)> = Vec::new();
    let profile_root = saves_root.join("profiles");
    if let Ok(entries) = fs::read_dir(&profile_root) {
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let profile = dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| safe_id(n, "default"))
                .unwrap_or_else(|| String::from("default"));
            for slot in sorted_slot_paths(&dir) {
                if let Some(state) = slot_state(&slot) {
                    out.push((profile.clone(), state));
                }
            }
        }
    }
    for slot in sorted_slot_paths(saves_root) {
        if let Some(state) = slot_state(&slot) {
            out.push((String::from("default"), state));
        }
    }
    out
}

fn entry_ts(row: &Value) -> String {
    let ts = row
        .get("at")
        .and_then(Value::as_str)
        .or_else(|| row.get("ts").and_then(Value::as_str))
        .unwrap_or("")
        .trim();
    if ts.is_empty() {
        utc_now_iso()
    } else {
        ts.to_owned()
    }
}

fn entry_tags(row: &Value) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for key in ["kind", "role"] {
        if let Some(raw) = row.get(key).and_then(Value::as_str) {
            let tag = clean_tag(raw, 48);
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    if let Some(raw) = row.get("scene_title").and_then(Value::as_str) {
        let tag = clean_tag(raw, 48);
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(12);
    tags
}

fn ingest_short(memory: &mut NpcMemory, row: &Value) -> bool {
    let text = clean_text(row.get("text").and_then(Value::as_str).unwrap_or(""), 460);
    if text.is_empty() {
        return false;
    }
    let role = Role::parse(row.get("role").and_then(Value::as_str).unwrap_or("npc"));
    let fallback_id = content_hash(&text);
    let turn_id: String = row
        .get("turn_id")
        .and_then(Value::as_str)
        .or_else(|| row.get("at").and_then(Value::as_str))
        .unwrap_or(fallback_id.as_str())
        .chars()
        .take(80)
        .collect();
    memory.short.push(ShortTurn {
        ts: entry_ts(row),
        role,
        text,
        tags: entry_tags(row),
        importance: 0.45,
        turn_id,
    });
    true
}

fn ingest_long(memory: &mut NpcMemory, row: &Value) -> bool {
    let text = clean_text(row.get("summary").and_then(Value::as_str).unwrap_or(""), 420);
    if text.is_empty() {
        return false;
    }
    let ts = entry_ts(row);
    let tags = entry_tags(row);
    let kind = row
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("general")
        .trim()
        .to_lowercase();
    let hash = content_hash(&text);
    match kind.as_str() {
        "promise" => {
            if memory.long.promises.iter().any(|x| x.text_hash == hash) {
                return false;
            }
            memory.long.promises.push(MemoryPromise {
                ts,
                text,
                status: PromiseStatus::Open,
                tags,
                importance: 0.7,
                text_hash: hash,
                ..MemoryPromise::default()
            });
        }
        "debt" => {
            if memory.long.debts.iter().any(|x| x.text_hash == hash) {
                return false;
            }
            memory.long.debts.push(MemoryDebt {
                ts,
                text,
                status: DebtStatus::Open,
                tags,
                importance: 0.7,
                text_hash: hash,
                ..MemoryDebt::default()
            });
        }
        "event" | "quest" | "combat" | "trade" | "travel" | "training" => {
            if memory.long.events.iter().any(|x| x.text_hash == hash) {
                return false;
            }
            let impact = if matches!(kind.as_str(), "quest" | "combat" | "event") {
                ImpactLevel::Med
            } else {
                ImpactLevel::Low
            };
            memory.long.events.push(MemoryEvent {
                ts,
                text,
                impact,
                tags,
                importance: 0.62,
                text_hash: hash,
                ..MemoryEvent::default()
            });
        }
        _ => {
            if memory.long.facts.iter().any(|x| x.text_hash == hash) {
                return false;
            }
            memory.long.facts.push(MemoryFact {
                ts,
                text,
                confidence: 0.65,
                tags,
                importance: 0.52,
                text_hash: hash,
                ..MemoryFact::default()
            });
        }
    }
    true
}

/// Walk the saves tree and seed the memory system from legacy history.
pub async fn bootstrap_from_existing_history(
    service: &MemoryService,
    saves_root: &Path,
) -> Result<BootstrapReport, MemoryError> {
    let states = iter_save_states(saves_root);
    let mut report = BootstrapReport::default();
    let mut npc_cache: BTreeMap<String, NpcMemory> = BTreeMap::new();
    let mut world = service.load_world_memory()?;

    for (profile_key, state) in states {
        report.slots = report.slots.saturating_add(1);

        if let Some(short) = state.get("conversation_short_term").and_then(Value::as_object) {
            for (raw_npc_key, entries) in short {
                let Some(rows) = entries.as_array() else {
                    continue;
                };
                let npc_key = safe_id(raw_npc_key, "unknown");
                let scoped = service.scoped_npc_id(&profile_key, &npc_key);
                if !npc_cache.contains_key(&scoped) {
                    npc_cache.insert(scoped.clone(), service.load_npc_memory(&profile_key, &npc_key)?);
                }
                let Some(memory) = npc_cache.get_mut(&scoped) else {
                    continue;
                };
                for row in rows {
                    if ingest_short(memory, row) {
                        report.short_added = report.short_added.saturating_add(1);
                    }
                }
            }
        }

        if let Some(long) = state.get("conversation_long_term").and_then(Value::as_object) {
            for (raw_npc_key, entries) in long {
                let Some(rows) = entries.as_array() else {
                    continue;
                };
                let npc_key = safe_id(raw_npc_key, "unknown");
                let scoped = service.scoped_npc_id(&profile_key, &npc_key);
                if !npc_cache.contains_key(&scoped) {
                    npc_cache.insert(scoped.clone(), service.load_npc_memory(&profile_key, &npc_key)?);
                }
                let Some(memory) = npc_cache.get_mut(&scoped) else {
                    continue;
                };
                for row in rows {
                    if ingest_long(memory, row) {
                        report.long_added = report.long_added.saturating_add(1);
                    }
                }
            }
        }

        if let Some(rows) = state
            .get("conversation_global_long_term")
            .and_then(Value::as_array)
        {
            for row in rows {
                let text = clean_text(row.get("summary").and_then(Value::as_str).unwrap_or(""), 420);
                if text.is_empty() {
                    continue;
                }
                let hash = content_hash(&text);
                if world.long.events.iter().any(|x| x.text_hash == hash) {
                    continue;
                }
                world.long.events.push(MemoryEvent {
                    ts: entry_ts(row),
                    text,
                    impact: ImpactLevel::Med,
                    tags: entry_tags(row),
                    importance: 0.55,
                    text_hash: hash,
                    ..MemoryEvent::default()
                });
                report.world_added = report.world_added.saturating_add(1);
            }
        }
    }

    for (scoped_id, mut memory) in npc_cache {
        memory.long.sanitize();
        memory.long.summary.ts = utc_now_iso();
        if memory.long.summary.text.is_empty()
            || memory.long.summary.text == "(aucun resume)"
        {
            let digest: Vec<String> = memory
                .long
                .events
                .iter()
                .rev()
                .take(3)
                .map(|row| row.text.clone())
                .chain(memory.long.facts.iter().rev().take(3).map(|row| row.text.clone()))
                .collect();
            let summary = clean_text(&digest.join(" "), 900);
            if !summary.is_empty() {
                memory.long.summary.text = summary;
            }
        }
        compact_npc_memory(&mut memory, None);
        service.save_npc_memory(&memory)?;
        report.npcs_touched = report.npcs_touched.saturating_add(1);

        let profile_key = scoped_id
            .split_once("__")
            .map_or("default", |(scope, _)| scope)
            .to_owned();
        let npc_key = service.base_npc_id(&scoped_id);
        match service.rebuild_npc_index(&profile_key, &npc_key).await {
            Ok(_) => report.indexes_rebuilt = report.indexes_rebuilt.saturating_add(1),
            Err(error) => {
                tracing::warn!(%error, scoped_id, "bootstrap index rebuild failed, skipping");
            }
        }
    }

    compact_world_memory(&mut world, None);
    service.save_world_memory(&world)?;
    if let Err(error) = service.rebuild_world_index().await {
        tracing::warn!(%error, "bootstrap world index rebuild failed");
    } else {
        report.indexes_rebuilt = report.indexes_rebuilt.saturating_add(1);
    }
    Ok(report)
}

// ===========================================================================
// Tests
// ===========================================================================
