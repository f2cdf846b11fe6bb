//! Hierarchical Navigable Small World index.
//!
//! An [`HnswIndex`] owns its graph and a boxed [`VectorStorage`]; the two
//! reference each other only transiently through distance computers issued
//! on the fly, which is what makes the quantizer splice (train the graph
//! over flat storage, then swap compressed storage in) a plain field
//! assignment.

pub(crate) mod construction;
pub(crate) mod graph;
pub(crate) mod search;
pub(crate) mod visited;

use std::io::{Read, Write};

use crate::bitset::BitsetView;
use crate::error::{IndexError, Result};
use crate::metric::MetricType;
use crate::storage::{negative_computer, read_storage, VectorStorage};

pub use graph::HnswGraph;
pub use search::Neighbor;
use search::FilterState;
use visited::VisitedSet;

pub struct HnswIndex {
    pub graph: HnswGraph,
    pub storage: Box<dyn VectorStorage>,
}

impl HnswIndex {
    pub fn new(storage: Box<dyn VectorStorage>, m: usize, ef_construction: usize) -> Self {
        Self {
            graph: HnswGraph::new(m, ef_construction),
            storage,
        }
    }

    #[must_use]
    pub fn ntotal(&self) -> usize {
        self.storage.ntotal()
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.storage.dim()
    }

    #[must_use]
    pub fn metric(&self) -> MetricType {
        self.storage.metric()
    }

    /// Reserved for data-dependent tuning; a no-op for the plain graph.
    pub fn train(&mut self, _n: usize, _rows: &[f32]) -> Result<()> {
        Ok(())
    }

    /// Append `n` fp32 rows and link them into the graph one by one.
    pub fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        let start = self.storage.ntotal();
        self.storage.add(rows, n)?;

        let dim = self.storage.dim();
        let mut dc = negative_computer(self.storage.as_ref());
        let mut visited = VisitedSet::new(start + n);
        let mut buf = vec![0.0f32; dim];
        for i in 0..n {
            let id = (start + i) as u32;
            self.storage.reconstruct(id, &mut buf)?;
            dc.set_query(&buf);
            construction::insert(&mut self.graph, dc.as_mut(), id, &mut visited)?;
        }
        Ok(())
    }

    /// Swap the vector storage, keeping the graph. The replacement must
    /// describe exactly the same rows.
    pub fn replace_storage(&mut self, storage: Box<dyn VectorStorage>) -> Result<()> {
        if storage.ntotal() != self.storage.ntotal() || storage.dim() != self.storage.dim() {
            return Err(IndexError::InvalidIndexError(format!(
                "replacement storage shape {}x{} does not match {}x{}",
                storage.ntotal(),
                storage.dim(),
                self.storage.ntotal(),
                self.storage.dim()
            )));
        }
        self.storage = storage;
        Ok(())
    }

    /// Top-k graph search. Returned distances are externally oriented:
    /// positive squared L2, or similarity (higher is better) for IP/cosine.
    /// Missing slots hold id -1.
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        let found = self.search_level0(query, ef.max(k), bitset, k_alpha, initial_alpha)?;
        Ok(self.externalize(found, k))
    }

    /// Level-0 beam search returning internally-oriented results.
    pub(crate) fn search_level0(
        &self,
        query: &[f32],
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
    ) -> Result<Vec<Neighbor>> {
        Ok(self
            .search_level0_traced(query, ef, bitset, k_alpha, initial_alpha, false)?
            .0)
    }

    /// As [`Self::search_level0`], optionally collecting every node whose
    /// distance was evaluated (visualization traces).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn search_level0_traced(
        &self,
        query: &[f32],
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
        collect_trace: bool,
    ) -> Result<(Vec<Neighbor>, Vec<Neighbor>)> {
        if self.graph.entry_point < 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut dc = negative_computer(self.storage.as_ref());
        dc.set_query(query);

        let entry = self.graph.entry_point as u32;
        let mut nearest = Neighbor {
            id: entry,
            distance: dc.distance(entry),
        };
        if self.graph.max_level > 0 {
            nearest = search::greedy_descent(&self.graph, dc.as_mut(), nearest, self.graph.max_level, 1);
        }

        let mut visited = VisitedSet::new(self.graph.len());
        visited.insert(nearest.id);

        let mut filter_state;
        let filter = if bitset.is_empty() {
            None
        } else {
            filter_state = FilterState {
                bitset,
                k_alpha,
                accumulated_alpha: initial_alpha,
            };
            Some(&mut filter_state)
        };

        let out = search::search_level(
            &self.graph,
            dc.as_mut(),
            0,
            nearest,
            ef,
            filter,
            &mut visited,
            collect_trace,
        );
        Ok((out.results, out.examined))
    }

    /// Convert internal results to the external layout: k slots, sign
    /// restored for similarity metrics, -1 ids marking absent entries.
    pub(crate) fn externalize(&self, found: Vec<Neighbor>, k: usize) -> (Vec<i64>, Vec<f32>) {
        let similarity = self.metric().is_similarity();
        let mut ids = vec![-1i64; k];
        let mut dists = vec![
            if similarity {
                f32::NEG_INFINITY
            } else {
                f32::INFINITY
            };
            k
        ];
        for (slot, n) in found.into_iter().take(k).enumerate() {
            ids[slot] = n.id as i64;
            dists[slot] = if similarity { -n.distance } else { n.distance };
        }
        (ids, dists)
    }

    /// Graph range search: beam of width `ef`, then the radius window is
    /// applied. Distances are externally oriented.
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
        let similarity = self.metric().is_similarity();
        let found = self.search_level0(query, ef, bitset, k_alpha, initial_alpha)?;
        let mut ids = Vec::new();
        let mut dists = Vec::new();
        for n in found {
            let d = if similarity { -n.distance } else { n.distance };
            if crate::search::within_range(d, radius, range_filter, similarity) {
                ids.push(n.id as i64);
                dists.push(d);
            }
        }
        Ok((ids, dists))
    }

    pub(crate) fn write_body(&self, w: &mut dyn Write) -> std::io::Result<()> {
        self.graph.write_body(w)?;
        self.storage.write(w)
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let graph = HnswGraph::read_body(r)?;
        let storage = read_storage(r)?;
        if graph.len() != storage.ntotal() {
            return Err(IndexError::InvalidIndexError(format!(
                "graph has {} nodes but storage has {} rows",
                graph.len(),
                storage.ntotal()
            )));
        }
        Ok(Self { graph, storage })
    }
}
