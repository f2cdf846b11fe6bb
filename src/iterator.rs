//! Stateful, resumable graph iteration.
//!
//! The first `next()` runs the usual top-layer descent plus one level-0 beam
//! pass of width `ef`, yields the filter-passing results of that pass as the
//! initial batch, and seeds a persistent frontier heap with every examined
//! node that was not yielded. Subsequent calls pop the closest frontier
//! node, expand its neighbors, and yield it when it passes the filter.
//!
//! Internally distances are negated for similarity metrics like everywhere
//! else in the traversal code; the sign is restored on each yielded batch
//! before ids are remapped through the partition label table. With a refine
//! ratio above zero every yielded id is re-scored through the exact
//! computer, which for partitioned indexes means mapping the label back to
//! a partition-local offset first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::bitset::BitsetView;
use crate::hnsw::{search, HnswIndex, Neighbor};
use crate::hnsw::visited::Bitmap;
use crate::search::initial_accumulated_alpha;
use crate::storage::{negative_computer, DistanceComputer};

/// One pending yield, ordered so the min-heap pops the best first.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Hit {
    /// Minimization key: the external distance, negated for similarity.
    key: f32,
    id: i64,
    distance: f32,
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct AnnIterator<'a> {
    hnsw: &'a HnswIndex,
    labels: Option<&'a [u32]>,
    label_to_internal_offset: &'a [u32],
    mv_base_offset: u32,
    bitset: BitsetView<'a>,
    larger_is_closer: bool,

    query: Vec<f32>,
    qdis: Box<dyn DistanceComputer + 'a>,
    qdis_refine: Option<Box<dyn DistanceComputer + 'a>>,

    ef: usize,
    k_alpha: f32,
    accumulated_alpha: f32,
    visited: Bitmap,
    to_visit: BinaryHeap<Reverse<Neighbor>>,
    initial_search_done: bool,

    buffer: BinaryHeap<Reverse<Hit>>,
    exhausted: bool,
}

impl<'a> AnnIterator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hnsw: &'a HnswIndex,
        labels: Option<&'a [u32]>,
        query: Vec<f32>,
        bitset: BitsetView<'a>,
        ef: usize,
        larger_is_closer: bool,
        qdis_refine: Option<Box<dyn DistanceComputer + 'a>>,
        label_to_internal_offset: &'a [u32],
        mv_base_offset: u32,
    ) -> Self {
        let ntotal = hnsw.ntotal();
        let accumulated_alpha = initial_accumulated_alpha(&bitset, ntotal);
        let k_alpha = bitset.filter_ratio() * 0.7;

        let mut qdis = negative_computer(hnsw.storage.as_ref());
        qdis.set_query(&query);
        let mut qdis_refine = qdis_refine;
        if let Some(rc) = qdis_refine.as_mut() {
            rc.set_query(&query);
        }

        Self {
            hnsw,
            labels,
            label_to_internal_offset,
            mv_base_offset,
            bitset,
            larger_is_closer,
            query,
            qdis,
            qdis_refine,
            ef: ef.max(1),
            k_alpha,
            accumulated_alpha,
            visited: Bitmap::new(ntotal),
            to_visit: BinaryHeap::new(),
            initial_search_done: false,
            buffer: BinaryHeap::new(),
            exhausted: false,
        }
    }

    /// Yield the next filter-passing candidate, or `None` when the frontier
    /// is exhausted.
    pub fn next(&mut self) -> Option<(i64, f32)> {
        loop {
            if let Some(Reverse(hit)) = self.buffer.pop() {
                return Some((hit.id, hit.distance));
            }
            if self.exhausted {
                return None;
            }
            if !self.initial_search_done {
                self.initial_batch();
            } else {
                self.incremental_batch();
            }
        }
    }

    /// Push one internally-scored node into the yield buffer, applying sign
    /// restore, label remap and optional refine re-scoring. Re-scoring goes
    /// through the raw distance of the external id, which for partitioned
    /// indexes means mapping the label back to a partition-local offset.
    fn push_hit(&mut self, n: Neighbor) {
        let external = if self.larger_is_closer {
            -n.distance
        } else {
            n.distance
        };
        let id = match self.labels {
            Some(labels) => labels[n.id as usize] as i64,
            None => n.id as i64,
        };
        let distance = match self.qdis_refine.as_mut() {
            Some(rc) => {
                let local = if self.label_to_internal_offset.is_empty() {
                    id as u32
                } else {
                    self.label_to_internal_offset[id as usize] - self.mv_base_offset
                };
                rc.distance(local)
            }
            None => external,
        };
        let key = if self.larger_is_closer {
            -distance
        } else {
            distance
        };
        self.buffer.push(Reverse(Hit { key, id, distance }));
    }

    fn initial_batch(&mut self) {
        self.initial_search_done = true;
        if self.hnsw.graph.entry_point < 0 {
            self.exhausted = true;
            return;
        }

        let entry = self.hnsw.graph.entry_point as u32;
        let mut nearest = Neighbor {
            id: entry,
            distance: self.qdis.distance(entry),
        };
        if self.hnsw.graph.max_level > 0 {
            nearest = search::greedy_descent(
                &self.hnsw.graph,
                self.qdis.as_mut(),
                nearest,
                self.hnsw.graph.max_level,
                1,
            );
        }
        self.visited.set(nearest.id as usize);

        let out = if self.bitset.is_empty() {
            search::search_level(
                &self.hnsw.graph,
                self.qdis.as_mut(),
                0,
                nearest,
                self.ef,
                None,
                &mut self.visited,
                true,
            )
        } else {
            let mut filter_state = search::FilterState {
                bitset: &self.bitset,
                k_alpha: self.k_alpha,
                accumulated_alpha: self.accumulated_alpha,
            };
            let out = search::search_level(
                &self.hnsw.graph,
                self.qdis.as_mut(),
                0,
                nearest,
                self.ef,
                Some(&mut filter_state),
                &mut self.visited,
                true,
            );
            // keep whatever admission budget the initial pass left over
            self.accumulated_alpha = filter_state.accumulated_alpha;
            out
        };

        let batch: HashSet<u32> = out.results.iter().map(|n| n.id).collect();
        for n in out.examined {
            if !batch.contains(&n.id) {
                self.to_visit.push(Reverse(n));
            }
        }
        for n in out.results {
            self.push_hit(n);
        }
        if self.buffer.is_empty() && self.to_visit.is_empty() {
            self.exhausted = true;
        }
    }

    fn incremental_batch(&mut self) {
        while let Some(Reverse(top)) = self.to_visit.pop() {
            // expand the frontier around the popped node
            let neighbors = self.hnsw.graph.neighbors(top.id, 0);
            for &nb in neighbors {
                if !self.visited.set(nb as usize) {
                    continue;
                }
                let d = self.qdis.distance(nb);
                let neighbor = Neighbor {
                    id: nb,
                    distance: d,
                };
                if self.bitset.is_empty() || self.bitset.is_member(nb as usize) {
                    self.to_visit.push(Reverse(neighbor));
                } else if self.accumulated_alpha >= 0.0 {
                    self.accumulated_alpha -= 1.0 - self.k_alpha;
                    self.to_visit.push(Reverse(neighbor));
                }
            }
            if self.bitset.is_empty() || self.bitset.is_member(top.id as usize) {
                self.push_hit(top);
                return;
            }
        }
        self.exhausted = true;
    }
}
