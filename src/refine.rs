//! Refine-rerank wrapper.
//!
//! Oversamples the approximate base index by `refine_k`, then re-scores the
//! candidates with an exact distance computer over higher-precision storage
//! and keeps the best `k`. The base search already applied the filter, so
//! the rerank stage does not evaluate it again.
//!
//! Cosine note: the base storage of a cosine index exposes an inverse-norm
//! cache while the refine storage keeps original rows and computes plain dot
//! products. In that case the refine computer is wrapped so each score is
//! divided by the query norm and the cached row norm. The wrapper carries no
//! sign change.

use std::io::{Read, Write};

use crate::bitset::BitsetView;
use crate::error::{IndexError, Result};
use crate::hnsw::{HnswIndex, Neighbor};
use crate::search::{brute_force_knn, within_range};
use crate::simd;
use crate::storage::{read_storage, DistanceComputer, VectorStorage};

pub struct RefineIndex {
    pub base: HnswIndex,
    pub refine_storage: Box<dyn VectorStorage>,
}

/// Divides an unnormalized dot product by the query norm and the cached
/// per-row norm of the base cosine storage.
pub(crate) struct CosineNormComputer<'a> {
    pub inner: Box<dyn DistanceComputer + 'a>,
    pub inv_norms: &'a [f32],
    pub q_inv: f32,
}

impl DistanceComputer for CosineNormComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.inner.set_query(query);
        self.q_inv = simd::inverse_norm(query);
    }

    fn distance(&mut self, id: u32) -> f32 {
        self.inner.distance(id) * self.q_inv * self.inv_norms[id as usize]
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        self.inner.symmetric(i, j) * self.inv_norms[i as usize] * self.inv_norms[j as usize]
    }
}

impl RefineIndex {
    pub fn new(base: HnswIndex, refine_storage: Box<dyn VectorStorage>) -> Self {
        Self {
            base,
            refine_storage,
        }
    }

    #[must_use]
    pub fn ntotal(&self) -> usize {
        self.base.ntotal()
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.base.dim()
    }

    /// Append rows to both the base index and the refine storage.
    pub fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        self.base.add(rows, n)?;
        self.refine_storage.add(rows, n)
    }

    /// The exact computer used for reranking, cosine-wrapped when the base
    /// storage carries inverse norms.
    pub(crate) fn refine_computer(&self) -> Box<dyn DistanceComputer + '_> {
        match self.base.storage.inverse_norms() {
            Some(inv_norms) => Box::new(CosineNormComputer {
                inner: self.refine_storage.distance_computer(),
                inv_norms,
                q_inv: 0.0,
            }),
            None => self.refine_storage.distance_computer(),
        }
    }

    /// Rerank internally-oriented base candidates, returning the external
    /// k-slot layout.
    fn rerank(&self, query: &[f32], candidates: &[Neighbor], k: usize) -> (Vec<i64>, Vec<f32>) {
        let similarity = self.base.metric().is_similarity();
        let mut rc = self.refine_computer();
        rc.set_query(query);

        let mut scored: Vec<(i64, f32)> = candidates
            .iter()
            .map(|n| (n.id as i64, rc.distance(n.id)))
            .collect();
        if similarity {
            scored.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        } else {
            scored.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        }

        let mut ids = vec![-1i64; k];
        let mut dists = vec![
            if similarity {
                f32::NEG_INFINITY
            } else {
                f32::INFINITY
            };
            k
        ];
        for (slot, (id, d)) in scored.into_iter().take(k).enumerate() {
            ids[slot] = id;
            dists[slot] = d;
        }
        (ids, dists)
    }

    /// Graph search for `k * refine_k` candidates, then exact rerank.
    #[allow(clippy::too_many_arguments)]
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        refine_k: usize,
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        let oversample = k * refine_k.max(1);
        let found =
            self.base
                .search_level0(query, ef.max(oversample), bitset, k_alpha, initial_alpha)?;
        let keep = oversample.min(found.len());
        Ok(self.rerank(query, &found[..keep], k))
    }

    /// Brute-force fallback with the same oversample-then-rerank shape.
    pub fn search_knn_bruteforce(
        &self,
        query: &[f32],
        k: usize,
        refine_k: usize,
        bitset: &BitsetView<'_>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        let oversample = k * refine_k.max(1);
        let found = brute_force_knn(self.base.storage.as_ref(), query, oversample, bitset);
        Ok(self.rerank(query, &found, k))
    }

    /// Range search over the base graph with every survivor re-scored
    /// exactly and the window re-applied.
    #[allow(clippy::too_many_arguments)]
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        range_filter: Option<f32>,
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        let similarity = self.base.metric().is_similarity();
        let found = self
            .base
            .search_level0(query, ef, bitset, k_alpha, initial_alpha)?;

        let mut rc = self.refine_computer();
        rc.set_query(query);
        let mut hits: Vec<(i64, f32)> = Vec::new();
        for n in found {
            let d = rc.distance(n.id);
            if within_range(d, radius, range_filter, similarity) {
                hits.push((n.id as i64, d));
            }
        }
        if similarity {
            hits.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        } else {
            hits.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        }
        Ok(hits.into_iter().unzip())
    }

    pub(crate) fn write_body(&self, w: &mut dyn Write) -> std::io::Result<()> {
        self.base.write_body(w)?;
        self.refine_storage.write(w)
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let base = HnswIndex::read_body(r)?;
        let refine_storage = read_storage(r)?;
        if refine_storage.ntotal() != base.ntotal() {
            return Err(IndexError::InvalidIndexError(
                "refine storage row count does not match base index".to_string(),
            ));
        }
        Ok(Self {
            base,
            refine_storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricType;
    use crate::storage::{FlatStorage, ScalarQuantStorage, SqType};

    fn build_refine(metric: MetricType) -> RefineIndex {
        // base over fp16-quantized storage, refine over exact fp32
        let base_storage = ScalarQuantStorage::new(2, metric, SqType::Fp16);
        let base = HnswIndex::new(Box::new(base_storage), 8, 40);
        let refine_metric = if metric == MetricType::Cosine {
            MetricType::Ip
        } else {
            metric
        };
        let refine_storage = FlatStorage::new(2, refine_metric);
        let mut index = RefineIndex::new(base, Box::new(refine_storage));
        let rows: Vec<f32> = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        index.add(&rows, 4).unwrap();
        index
    }

    #[test]
    fn refine_k_one_matches_base_topk() {
        let index = build_refine(MetricType::L2);
        let none = BitsetView::none();
        let (ids, dists) = index
            .search_knn(&[0.9, 0.1], 2, 1, 16, &none, 0.0, 1.0)
            .unwrap();
        assert_eq!(ids[0], 1);
        assert!(dists[0] >= 0.0);
    }

    #[test]
    fn cosine_refine_normalizes_scores() {
        let index = build_refine(MetricType::Cosine);
        let none = BitsetView::none();
        let (ids, dists) = index
            .search_knn(&[10.0, 0.0], 1, 4, 16, &none, 0.0, 1.0)
            .unwrap();
        assert_eq!(ids[0], 1);
        // similarity of the exact match must be 1 regardless of query scale
        assert!((dists[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn bruteforce_path_agrees_with_graph_path() {
        let index = build_refine(MetricType::L2);
        let none = BitsetView::none();
        let (a, _) = index.search_knn(&[0.1, 0.9], 2, 2, 16, &none, 0.0, 1.0).unwrap();
        let (b, _) = index.search_knn_bruteforce(&[0.1, 0.9], 2, 2, &none).unwrap();
        assert_eq!(a, b);
    }
}
