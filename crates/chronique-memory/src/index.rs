//! In-memory vector index with cosine search and framed persistence.
//!
//! The index keeps a dense row-major matrix of unit-norm `f32` vectors and
//! an ordered mapping list. Because every stored vector and every query is
//! L2-normalized, cosine similarity reduces to a plain inner product and
//! all scores land in `[-1, 1]`.
//!
//! The dimension is fixed by the first successful insert and immutable for
//! the life of the index; adding a vector of a different dimension fails
//! silently (returns `None`). Searching oversamples to `max(4k, 20)`
//! candidates before applying the optional metadata filter so that a
//! selective filter still fills `k` results.
//!
//! On disk the matrix is a little-endian framed dump
//! (`[u32 rows][u32 dim]` header followed by `rows * dim` `f32` values);
//! an empty index persists an empty file. The mapping sidecar is one JSON
//! object per line. The dense matrix is the one shipped engine; the
//! operations are engine-shaped so an accelerated backend can slot in
//! behind the same interface without changing observable results.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MemoryError;
use crate::store::MemoryStore;

// ---------------------------------------------------------------------------
// Rows and hits
// ---------------------------------------------------------------------------

/// Mapping entry tying a matrix row to its external record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MappingRow {
    /// Dense row position, stable per rebuild.
    #[serde(default)]
    pub vector_id: usize,
    /// External record id (`kind:uuid`).
    #[serde(default)]
    pub record_id: String,
    /// Indexed text.
    #[serde(default)]
    pub text: String,
    /// Metadata map (`kind`, `ts`, `tags`, `importance`, optional NPC
    /// scope).
    #[serde(default)]
    pub meta: serde_json::Map<String, Value>,
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Dense row position of the match.
    pub vector_id: usize,
    /// External record id.
    pub record_id: String,
    /// Indexed text.
    pub text: String,
    /// Metadata map.
    pub meta: serde_json::Map<String, Value>,
    /// Inner-product score in `[-1, 1]`.
    pub score: f32,
}

/// A record queued for indexing by [`VectorIndex::rebuild_from_records`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// External record id (`kind:uuid`).
    pub record_id: String,
    /// Text to embed.
    pub text: String,
    /// Metadata carried into the mapping.
    pub meta: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Dense unit-vector table with inner-product search.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dim: usize,
    vectors: Vec<f32>,
    mapping: Vec<MappingRow>,
}

impl VectorIndex {
    /// Empty index; the dimension locks on the first insert.
    pub const fn new() -> Self {
        Self {
            dim: 0,
            vectors: Vec::new(),
            mapping: Vec::new(),
        }
    }

    /// Locked dimension, 0 while the index is empty.
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Number of indexed records.
    pub const fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether the index holds no records.
    pub const fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Copy of the mapping list (callers must not mutate index state
    /// through a read accessor, so this is copy-on-read).
    pub fn mapping(&self) -> Vec<MappingRow> {
        self.mapping.clone()
    }

    /// Drop all rows and mappings; the dimension unlocks.
    pub fn clear(&mut self) {
        self.dim = 0;
        self.vectors.clear();
        self.mapping.clear();
    }

    /// Normalize a vector to unit length; a zero or empty vector yields
    /// an empty result.
    fn normalize(vector: &[f32]) -> Vec<f32> {
        let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
        if norm_sq <= 0.0 {
            return Vec::new();
        }
        let norm = norm_sq.sqrt();
        vector.iter().map(|v| v / norm).collect()
    }

    /// Add a record. Returns the assigned vector id, or `None` when the
    /// vector is empty, zero, or of a different dimension than the index.
    pub fn add(
        &mut self,
        record_id: &str,
        text: &str,
        meta: serde_json::Map<String, Value>,
        vector: &[f32],
    ) -> Option<usize> {
        let unit = Self::normalize(vector);
        if unit.is_empty() {
            return None;
        }
        if self.dim == 0 {
            self.dim = unit.len();
        }
        if unit.len() != self.dim {
            return None;
        }
        let vector_id = self.mapping.len();
        self.mapping.push(MappingRow {
            vector_id,
            record_id: record_id.trim().to_owned(),
            text: text.trim().to_owned(),
            meta,
        });
        self.vectors.extend_from_slice(&unit);
        Some(vector_id)
    }

    /// Inner product of the query against row `row`.
    fn row_score(&self, row: usize, query: &[f32]) -> f32 {
        let start = row.saturating_mul(self.dim);
        let end = start.saturating_add(self.dim);
        let Some(slice) = self.vectors.get(start..end) else {
            return -1.0;
        };
        slice.iter().zip(query).map(|(a, b)| a * b).sum()
    }

    /// Search the index.
    ///
    /// The query is normalized; a query that is empty, zero, or of the
    /// wrong dimension yields no hits. `filter_meta` entries are matched
    /// by case-insensitive string comparison against the stored metadata.
    pub fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter_meta: Option<&serde_json::Map<String, Value>>,
    ) -> Vec<VectorHit> {
        if self.dim == 0 || self.mapping.is_empty() {
            return Vec::new();
        }
        let query = Self::normalize(query_vector);
        if query.len() != self.dim {
            return Vec::new();
        }

        let limit = top_k.max(1);
        let oversample = limit
            .saturating_mul(4)
            .max(20)
            .min(self.mapping.len().max(20));

        let mut scored: Vec<(usize, f32)> = (0..self.mapping.len())
            .map(|row| (row, self.row_score(row, &query)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(oversample);

        let mut hits: Vec<VectorHit> = Vec::with_capacity(limit);
        for (row, score) in scored {
            let Some(entry) = self.mapping.get(row) else {
                continue;
            };
            if let Some(filters) = filter_meta {
                if !meta_matches(&entry.meta, filters) {
                    continue;
                }
            }
            hits.push(VectorHit {
                vector_id: entry.vector_id,
                record_id: entry.record_id.clone(),
                text: entry.text.clone(),
                meta: entry.meta.clone(),
                score,
            });
            if hits.len() >= limit {
                break;
            }
        }
        hits
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write the mapping JSONL and the framed vector payload atomically
    /// through the store's write primitives.
    pub fn persist(
        &self,
        store: &MemoryStore,
        index_path: &Path,
        mapping_path: &Path,
    ) -> Result<(), MemoryError> {
        let rows: Vec<Value> = self
            .mapping
            .iter()
            .filter_map(|row| serde_json::to_value(row).ok())
            .collect();
        store.write_jsonl(mapping_path, &rows)?;

        if self.dim == 0 {
            return store.atomic_write_bytes(index_path, &[]);
        }

        let row_count = self.mapping.len();
        let mut payload: Vec<u8> =
            Vec::with_capacity(8_usize.saturating_add(self.vectors.len().saturating_mul(4)));
        write_u32(&mut payload, u32::try_from(row_count).unwrap_or(u32::MAX));
        write_u32(&mut payload, u32::try_from(self.dim).unwrap_or(u32::MAX));
        for value in &self.vectors {
            let mut buf = [0_u8; 4];
            let mut cursor = Cursor::new(buf.as_mut_slice());
            if cursor.write_f32::<LittleEndian>(*value).is_ok() {
                payload.extend_from_slice(&buf);
            }
        }
        store.atomic_write_bytes(index_path, &payload)
    }

    /// Load mapping then vectors from disk. A missing or unreadable
    /// vector file leaves the index cleared but keeps the mapping, same
    /// as the empty-index persist shape.
    pub fn load(&mut self, index_path: &Path, mapping_path: &Path) {
        self.clear();
        if let Ok(raw) = std::fs::read_to_string(mapping_path) {
            for line in raw.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(row) = serde_json::from_str::<MappingRow>(trimmed) {
                    self.mapping.push(row);
                }
            }
        }

        let Ok(bytes) = std::fs::read(index_path) else {
            return;
        };
        if bytes.len() < 8 {
            return;
        }
        let mut cursor = Cursor::new(bytes.as_slice());
        let Ok(rows) = cursor.read_u32::<LittleEndian>() else {
            return;
        };
        let Ok(dim) = cursor.read_u32::<LittleEndian>() else {
            return;
        };
        let rows = rows as usize;
        let dim = dim as usize;
        if rows == 0 || dim == 0 {
            return;
        }
        let expected = rows.saturating_mul(dim);
        let mut vectors: Vec<f32> = Vec::with_capacity(expected);
        for _ in 0..expected {
            match cursor.read_f32::<LittleEndian>() {
                Ok(value) => vectors.push(value),
                Err(_) => {
                    // Truncated payload: treat as corrupt and clear.
                    self.vectors.clear();
                    return;
                }
            }
        }
        self.dim = dim;
        self.vectors = vectors;
    }

    /// Clear then index every record whose embedding is non-empty.
    /// Returns the number of admitted records.
    pub fn rebuild_from_records(
        &mut self,
        records: &[IndexRecord],
        embeddings: &[Vec<f32>],
    ) -> usize {
        self.clear();
        let mut total: usize = 0;
        for (idx, record) in records.iter().enumerate() {
            let Some(vector) = embeddings.get(idx) else {
                continue;
            };
            if vector.is_empty() {
                continue;
            }
            if self
                .add(&record.record_id, &record.text, record.meta.clone(), vector)
                .is_some()
            {
                total = total.saturating_add(1);
            }
        }
        total
    }
}

/// Case-insensitive exact-match comparison of filter entries against
/// stored metadata.
fn meta_matches(meta: &serde_json::Map<String, Value>, filters: &serde_json::Map<String, Value>) -> bool {
    filters.iter().all(|(key, expected)| {
        let actual = meta.get(key).map(value_as_string).unwrap_or_default();
        actual.to_lowercase() == value_as_string(expected).to_lowercase()
    })
}

/// Render a JSON value as its bare string form for filter comparison.
fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0_u8; 4];
    let mut cursor = Cursor::new(buf.as_mut_slice());
    if cursor.write_u32::<LittleEndian>(value).is_ok() {
        out.extend_from_slice(&buf);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
