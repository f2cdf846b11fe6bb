//! Graph search: greedy upper-layer descent and the level-0 beam.
//!
//! All distances here are already oriented so that smaller is better (the
//! caller wraps similarity metrics with a sign change). Ordering ties break
//! on the lower id.
//!
//! Filtered search follows the adaptive-admission rule: a neighbor that
//! fails the filter may still be admitted to the frontier for navigation,
//! paying `1 - k_alpha` out of an accumulated alpha budget; once the budget
//! goes negative such admissions stop. Nodes that pass the filter are always
//! available for navigation.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::bitset::BitsetView;
use crate::hnsw::graph::HnswGraph;
use crate::hnsw::visited::Visited;
use crate::storage::DistanceComputer;

/// A scored node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u32,
    pub distance: f32,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        // by distance, then lower id first
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Filter state for level-0 search.
pub(crate) struct FilterState<'a, 'b> {
    pub bitset: &'b BitsetView<'a>,
    pub k_alpha: f32,
    pub accumulated_alpha: f32,
}

/// Output of one level search.
pub(crate) struct LevelSearchResult {
    /// Filter-passing results, ascending by (distance, id), at most `ef`.
    pub results: Vec<Neighbor>,
    /// Every node whose distance was evaluated, in evaluation order.
    /// Populated only when requested.
    pub examined: Vec<Neighbor>,
}

/// Walk levels `from_level..=to_level` (descending) greedily, starting from
/// `nearest`, and return the closest point found.
pub(crate) fn greedy_descent(
    graph: &HnswGraph,
    dc: &mut dyn DistanceComputer,
    mut nearest: Neighbor,
    from_level: usize,
    to_level: usize,
) -> Neighbor {
    let mut level = from_level;
    loop {
        let mut improved = true;
        while improved {
            improved = false;
            for &nb in graph.neighbors(nearest.id, level) {
                let d = dc.distance(nb);
                if d < nearest.distance {
                    nearest = Neighbor {
                        id: nb,
                        distance: d,
                    };
                    improved = true;
                }
            }
        }
        if level == to_level {
            break;
        }
        level -= 1;
    }
    nearest
}

/// Beam search on one level.
///
/// `entry` must already be scored and marked in `visited` by the caller.
/// When `filter` is `None` every node counts as passing (construction and
/// unfiltered search).
pub(crate) fn search_level(
    graph: &HnswGraph,
    dc: &mut dyn DistanceComputer,
    level: usize,
    entry: Neighbor,
    ef: usize,
    mut filter: Option<&mut FilterState<'_, '_>>,
    visited: &mut dyn Visited,
    collect_examined: bool,
) -> LevelSearchResult {
    let mut candidates: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(ef + 1);
    let mut examined = Vec::new();

    let entry_passes = match filter.as_deref() {
        Some(f) => f.bitset.is_member(entry.id as usize),
        None => true,
    };
    candidates.push(Reverse(entry));
    if entry_passes {
        results.push(entry);
    }
    if collect_examined {
        examined.push(entry);
    }

    while let Some(Reverse(cand)) = candidates.pop() {
        let worst = results.peek().map(|r| r.distance).unwrap_or(f32::INFINITY);
        if results.len() >= ef && cand.distance > worst {
            break;
        }

        for &nb in graph.neighbors(cand.id, level) {
            if !visited.check_and_set(nb) {
                continue;
            }
            let d = dc.distance(nb);
            let neighbor = Neighbor {
                id: nb,
                distance: d,
            };
            if collect_examined {
                examined.push(neighbor);
            }

            let worst = results.peek().map(|r| r.distance).unwrap_or(f32::INFINITY);
            let useful = results.len() < ef || d < worst;
            if !useful {
                continue;
            }

            match filter.as_deref_mut() {
                None => {
                    candidates.push(Reverse(neighbor));
                    results.push(neighbor);
                    if results.len() > ef {
                        results.pop();
                    }
                }
                Some(f) => {
                    if f.bitset.is_member(nb as usize) {
                        candidates.push(Reverse(neighbor));
                        results.push(neighbor);
                        if results.len() > ef {
                            results.pop();
                        }
                    } else if f.accumulated_alpha >= 0.0 {
                        // filtered-out node kept for navigation only
                        f.accumulated_alpha -= 1.0 - f.k_alpha;
                        candidates.push(Reverse(neighbor));
                    }
                }
            }
        }
    }

    let mut sorted: Vec<Neighbor> = results.into_vec();
    sorted.sort_unstable();
    LevelSearchResult {
        results: sorted,
        examined,
    }
}
