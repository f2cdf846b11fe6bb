//! Version-gated fallback to the previous-generation search backend.
//!
//! Indexes written before the current graph backend existed are served by a
//! reduced legacy searcher. The branch is picked once, from the index
//! version given at construction, and holds for the node's entire lifetime.

use std::io::{Read, Write};
use std::path::Path;

use tracing::warn;

use crate::bitset::BitsetView;
use crate::config::{IndexConfig, IndexKind};
use crate::dataformat::DataFormat;
use crate::dataset::{Dataset, RangeSearchOutput, SearchResult};
use crate::error::{IndexError, Result};
use crate::iterator::AnnIterator;
use crate::node::IndexNode;

/// First index version served by the current graph backend.
pub const GRAPH_BACKEND_MIN_VERSION: i32 = 6;

/// Minimal legacy search node: single-partition flat HNSW only. Everything
/// it cannot express is reported as unimplemented rather than silently
/// approximated.
pub struct LegacyHnswNode {
    inner: IndexNode,
}

impl LegacyHnswNode {
    pub fn new(data_format: DataFormat) -> Self {
        Self {
            inner: IndexNode::new(IndexKind::Flat, data_format),
        }
    }

    pub fn train(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if dataset.scalar_info().is_some() {
            warn!("legacy index does not support scalar-partitioned builds");
            return Err(IndexError::NotImplemented(
                "partitioned build on legacy index".to_string(),
            ));
        }
        self.inner.train(dataset, cfg)
    }

    pub fn add(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        self.inner.add(dataset, cfg)
    }

    pub fn search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        self.inner.search(dataset, cfg, bitset)
    }

    pub fn range_search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchOutput> {
        self.inner.range_search(dataset, cfg, bitset)
    }

    pub fn get_vector_by_ids(&self, ids: &[i64]) -> Result<Dataset> {
        self.inner.get_vector_by_ids(ids)
    }

    pub fn serialize(&self, w: &mut dyn Write) -> Result<()> {
        self.inner.serialize(w)
    }

    pub fn deserialize(&mut self, r: &mut dyn Read) -> Result<()> {
        self.inner.deserialize(r)
    }

    pub fn deserialize_from_file(&mut self, path: &Path, cfg: &IndexConfig) -> Result<()> {
        self.inner.deserialize_from_file(path, cfg)
    }

    pub fn count(&self) -> i64 {
        self.inner.count()
    }

    pub fn dim(&self) -> i64 {
        self.inner.dim()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn has_raw_data(&self) -> bool {
        self.inner.has_raw_data()
    }
}

/// An index node that may route every call to a legacy backend, decided by
/// the on-disk index version at construction.
pub struct IndexNodeWithFallback {
    use_base_index: bool,
    base_index: IndexNode,
    fallback_search_index: LegacyHnswNode,
}

impl IndexNodeWithFallback {
    pub fn new(version: i32, kind: IndexKind, data_format: DataFormat) -> Self {
        Self {
            use_base_index: version >= GRAPH_BACKEND_MIN_VERSION,
            base_index: IndexNode::new(kind, data_format),
            fallback_search_index: LegacyHnswNode::new(data_format),
        }
    }

    #[must_use]
    pub fn uses_base_index(&self) -> bool {
        self.use_base_index
    }

    pub fn train(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if self.use_base_index {
            self.base_index.train(dataset, cfg)
        } else {
            self.fallback_search_index.train(dataset, cfg)
        }
    }

    pub fn add(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if self.use_base_index {
            self.base_index.add(dataset, cfg)
        } else {
            self.fallback_search_index.add(dataset, cfg)
        }
    }

    pub fn search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        if self.use_base_index {
            self.base_index.search(dataset, cfg, bitset)
        } else {
            self.fallback_search_index.search(dataset, cfg, bitset)
        }
    }

    pub fn range_search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchOutput> {
        if self.use_base_index {
            self.base_index.range_search(dataset, cfg, bitset)
        } else {
            self.fallback_search_index.range_search(dataset, cfg, bitset)
        }
    }

    pub fn ann_iterator<'a>(
        &'a self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'a>,
    ) -> Result<Vec<AnnIterator<'a>>> {
        if self.use_base_index {
            self.base_index.ann_iterator(dataset, cfg, bitset)
        } else {
            Err(IndexError::NotImplemented(
                "iterators on legacy index".to_string(),
            ))
        }
    }

    pub fn calc_dist_by_ids(
        &self,
        dataset: &Dataset,
        bitset: BitsetView<'_>,
        ids: &[i64],
    ) -> Result<Vec<f32>> {
        if self.use_base_index {
            self.base_index.calc_dist_by_ids(dataset, bitset, ids)
        } else {
            Err(IndexError::NotImplemented(
                "distance-by-id on legacy index".to_string(),
            ))
        }
    }

    pub fn get_vector_by_ids(&self, ids: &[i64]) -> Result<Dataset> {
        if self.use_base_index {
            self.base_index.get_vector_by_ids(ids)
        } else {
            self.fallback_search_index.get_vector_by_ids(ids)
        }
    }

    pub fn internal_id_to_external_id_map(&self) -> Vec<u32> {
        if self.use_base_index {
            self.base_index.internal_id_to_external_id_map()
        } else {
            (0..self.fallback_search_index.count().max(0) as u32).collect()
        }
    }

    pub fn set_internal_id_to_most_external_id_map(&mut self, map: Vec<u32>) {
        if self.use_base_index {
            self.base_index.set_internal_id_to_most_external_id_map(map);
        }
    }

    pub fn serialize(&self, w: &mut dyn Write) -> Result<()> {
        if self.use_base_index {
            self.base_index.serialize(w)
        } else {
            self.fallback_search_index.serialize(w)
        }
    }

    pub fn deserialize(&mut self, r: &mut dyn Read) -> Result<()> {
        if self.use_base_index {
            self.base_index.deserialize(r)
        } else {
            self.fallback_search_index.deserialize(r)
        }
    }

    pub fn deserialize_from_file(&mut self, path: &Path, cfg: &IndexConfig) -> Result<()> {
        if self.use_base_index {
            self.base_index.deserialize_from_file(path, cfg)
        } else {
            self.fallback_search_index.deserialize_from_file(path, cfg)
        }
    }

    pub fn count(&self) -> i64 {
        if self.use_base_index {
            self.base_index.count()
        } else {
            self.fallback_search_index.count()
        }
    }

    pub fn dim(&self) -> i64 {
        if self.use_base_index {
            self.base_index.dim()
        } else {
            self.fallback_search_index.dim()
        }
    }

    pub fn size(&self) -> u64 {
        if self.use_base_index {
            self.base_index.size()
        } else {
            self.fallback_search_index.size()
        }
    }

    pub fn has_raw_data(&self) -> bool {
        if self.use_base_index {
            self.base_index.has_raw_data()
        } else {
            self.fallback_search_index.has_raw_data()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_picks_the_branch_once() {
        let new = IndexNodeWithFallback::new(6, IndexKind::Flat, DataFormat::Fp32);
        assert!(new.uses_base_index());
        let old = IndexNodeWithFallback::new(5, IndexKind::Flat, DataFormat::Fp32);
        assert!(!old.uses_base_index());
    }

    #[test]
    fn legacy_branch_rejects_iterators() {
        let old = IndexNodeWithFallback::new(3, IndexKind::Flat, DataFormat::Fp32);
        let ds = Dataset::from_fp32(1, 2, vec![0.0, 0.0]).unwrap();
        let cfg = IndexConfig::default();
        let err = old
            .ann_iterator(&ds, &cfg, BitsetView::none())
            .err()
            .unwrap();
        assert!(matches!(err, IndexError::NotImplemented(_)));
    }
}
