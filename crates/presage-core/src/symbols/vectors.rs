//! Vector namer: translate 768-dim dense vectors to stable `VCTR|` symbols and
//! maintain a per-KB ANN collection for nearest-neighbor lookup.
//!
//! Naming is digest-first: the symbol is derived from the SHA-1 of the
//! vector's little-endian f32 bytes, so the same vector always maps to the
//! same symbol, in this process and after a restart. Vectors are persisted in
//! sled; the in-memory HNSW index per KB (cosine distance, as the collection
//! contract requires) is rebuilt lazily from that tree.

use crate::error::{EngineError, Result};
use crate::patterns::sha1_hex;
use dashmap::DashMap;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use sled::Tree;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The engine receives embeddings of exactly this width.
pub const VECTOR_DIM: usize = 768;
/// Prefix for vector-derived symbols.
pub const VECTOR_SYMBOL_PREFIX: &str = "VCTR|";

/// One KB's vector collection plus its (lazily rebuilt) HNSW index.
struct KbCollection {
    symbols: Vec<String>,
    vectors: Vec<Vec<f32>>,
    by_symbol: HashMap<String, usize>,
    /// None = stale; rebuilt on the next nearest-neighbor query.
    index: Option<HNSWIndex<f32, usize>>,
}

impl KbCollection {
    fn empty() -> Self {
        Self {
            symbols: Vec::new(),
            vectors: Vec::new(),
            by_symbol: HashMap::new(),
            index: None,
        }
    }

    fn upsert(&mut self, symbol: &str, vector: Vec<f32>) {
        if self.by_symbol.contains_key(symbol) {
            return;
        }
        let id = self.symbols.len();
        self.symbols.push(symbol.to_string());
        self.vectors.push(vector);
        self.by_symbol.insert(symbol.to_string(), id);
        self.index = None;
    }

    fn ensure_index(&mut self) -> Result<()> {
        if self.index.is_some() {
            return Ok(());
        }
        let mut index = HNSWIndex::<f32, usize>::new(VECTOR_DIM, &HNSWParams::<f32>::default());
        for (id, vector) in self.vectors.iter().enumerate() {
            index
                .add(vector, id)
                .map_err(|e| EngineError::StorageUnavailable(format!("vector index add: {e}")))?;
        }
        index
            .build(Metric::CosineSimilarity)
            .map_err(|e| EngineError::StorageUnavailable(format!("vector index build: {e}")))?;
        self.index = Some(index);
        Ok(())
    }
}

pub struct VectorNamer {
    vectors: Tree,
    collections: DashMap<String, Arc<RwLock<KbCollection>>>,
}

fn encode_f32s(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine distance `1 - dot(a,b) / (|a||b|)`: 0 for identical directions
/// regardless of magnitude. Zero-norm inputs have no direction and get the
/// maximum distance.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl VectorNamer {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            vectors: db.open_tree("vectors")?,
            collections: DashMap::new(),
        })
    }

    /// The collection cell for a KB. Publication through the DashMap entry is
    /// set-once: two simultaneous first-use requests converge on one cell.
    fn collection(&self, kb_id: &str) -> Result<Arc<RwLock<KbCollection>>> {
        if let Some(cell) = self.collections.get(kb_id) {
            return Ok(cell.value().clone());
        }
        let loaded = self.load(kb_id)?;
        Ok(self
            .collections
            .entry(kb_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(loaded)))
            .value()
            .clone())
    }

    fn load(&self, kb_id: &str) -> Result<KbCollection> {
        let prefix = format!("{kb_id}:");
        let mut collection = KbCollection::empty();
        for item in self.vectors.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| {
                EngineError::StorageUnavailable(format!("non-utf8 vector key in kb '{kb_id}'"))
            })?;
            let symbol = &key[prefix.len()..];
            collection.upsert(symbol, decode_f32s(&value));
        }
        Ok(collection)
    }

    /// Names each input vector and upserts it into the KB's collection,
    /// preserving input order. Duplicate vectors yield the same symbol.
    pub fn name_vectors(&self, kb_id: &str, vectors: &[Vec<f64>]) -> Result<Vec<String>> {
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        for v in vectors {
            if v.len() != VECTOR_DIM {
                return Err(EngineError::InvalidVectorDim {
                    expected: VECTOR_DIM,
                    got: v.len(),
                });
            }
        }
        let cell = self.collection(kb_id)?;
        let mut collection = cell
            .write()
            .map_err(|_| EngineError::StorageUnavailable("vector collection poisoned".into()))?;
        let mut names = Vec::with_capacity(vectors.len());
        for v in vectors {
            let v32: Vec<f32> = v.iter().map(|&f| f as f32).collect();
            let bytes = encode_f32s(&v32);
            let symbol = format!("{VECTOR_SYMBOL_PREFIX}{}", sha1_hex(&bytes));
            self.vectors
                .insert(format!("{kb_id}:{symbol}").as_bytes(), bytes)?;
            collection.upsert(&symbol, v32);
            names.push(symbol);
        }
        tracing::debug!(
            target: "presage::vectors",
            kb_id,
            named = names.len(),
            collection_size = collection.symbols.len(),
            "vectors named"
        );
        Ok(names)
    }

    /// K-nearest symbols for a query vector, closest first, with cosine
    /// distances. Empty collection yields an empty list.
    pub fn nearest(&self, kb_id: &str, vector: &[f64], k: usize) -> Result<Vec<(String, f32)>> {
        if vector.len() != VECTOR_DIM {
            return Err(EngineError::InvalidVectorDim {
                expected: VECTOR_DIM,
                got: vector.len(),
            });
        }
        let cell = self.collection(kb_id)?;
        let mut collection = cell
            .write()
            .map_err(|_| EngineError::StorageUnavailable("vector collection poisoned".into()))?;
        if collection.symbols.is_empty() {
            return Ok(Vec::new());
        }
        collection.ensure_index()?;
        let query: Vec<f32> = vector.iter().map(|&f| f as f32).collect();
        let Some(index) = collection.index.as_ref() else {
            return Err(EngineError::StorageUnavailable(
                "vector index unavailable after build".into(),
            ));
        };
        let ids = index.search(&query, k);
        let mut hits: Vec<(String, f32)> = ids
            .into_iter()
            .map(|id| {
                (
                    collection.symbols[id].clone(),
                    cosine_distance(&query, &collection.vectors[id]),
                )
            })
            .collect();
        // Exact re-rank of the approximate candidate set.
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(hits)
    }

    /// Drops the KB's vectors and its in-memory index.
    pub fn clear_kb(&self, kb_id: &str) -> Result<()> {
        let prefix = format!("{kb_id}:");
        let keys: Vec<_> = self
            .vectors
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            self.vectors.remove(key)?;
        }
        self.collections.remove(kb_id);
        tracing::info!(target: "presage::vectors", kb_id, "vector collection cleared");
        Ok(())
    }
}
