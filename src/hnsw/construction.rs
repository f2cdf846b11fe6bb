//! HNSW insertion.
//!
//! Standard descending insertion: greedy-walk from the entry point down to
//! the node's assigned layer, then beam-search each layer at width
//! `ef_construction` and connect to a pruned neighbor set. Pruning uses the
//! relative-neighborhood rule: a candidate is kept only if no already-kept
//! neighbor is strictly closer to it than the inserted point is. The same
//! rule re-prunes reverse lists that exceed the per-layer degree cap.

use crate::error::Result;
use crate::hnsw::graph::{HnswGraph, NeighborList};
use crate::hnsw::search::{greedy_descent, search_level, Neighbor};
use crate::hnsw::visited::VisitedSet;
use crate::storage::DistanceComputer;

/// Relative-neighborhood pruning over candidates sorted ascending by
/// distance-to-query. Falls back to closest-first fill when the rule keeps
/// fewer than `cap`.
pub(crate) fn select_neighbors(
    dc: &mut dyn DistanceComputer,
    candidates: &[Neighbor],
    cap: usize,
) -> NeighborList {
    let mut selected = NeighborList::new();
    for cand in candidates {
        if selected.len() >= cap {
            break;
        }
        let mut keep = true;
        for &kept in &selected {
            if dc.symmetric(kept, cand.id) < cand.distance {
                keep = false;
                break;
            }
        }
        if keep {
            selected.push(cand.id);
        }
    }
    // fill up with the closest remaining candidates
    for cand in candidates {
        if selected.len() >= cap {
            break;
        }
        if !selected.contains(&cand.id) {
            selected.push(cand.id);
        }
    }
    selected
}

/// Re-prune an over-full adjacency list of `node` with the same rule.
///
/// Distances are relative to `node` itself, so only symmetric distances are
/// used and the bound computer's query binding is irrelevant here.
fn shrink_list(graph: &mut HnswGraph, dc: &mut dyn DistanceComputer, node: u32, level: usize) {
    let cap = graph.max_degree(level);
    if graph.neighbors(node, level).len() <= cap {
        return;
    }
    let mut scored: Vec<Neighbor> = graph
        .neighbors(node, level)
        .iter()
        .map(|&nb| Neighbor {
            id: nb,
            distance: dc.symmetric(node, nb),
        })
        .collect();
    scored.sort_unstable();

    let mut kept = NeighborList::new();
    for cand in &scored {
        if kept.len() >= cap {
            break;
        }
        let mut keep = true;
        for &k in &kept {
            if dc.symmetric(k, cand.id) < cand.distance {
                keep = false;
                break;
            }
        }
        if keep {
            kept.push(cand.id);
        }
    }
    for cand in &scored {
        if kept.len() >= cap {
            break;
        }
        if !kept.contains(&cand.id) {
            kept.push(cand.id);
        }
    }
    *graph.neighbors_mut(node, level) = kept;
}

/// Insert node `id` into the graph. The computer must already be bound to
/// the node's own vector, and `id` must equal the current graph size.
pub(crate) fn insert(
    graph: &mut HnswGraph,
    dc: &mut dyn DistanceComputer,
    id: u32,
    visited: &mut VisitedSet,
) -> Result<()> {
    debug_assert_eq!(id as usize, graph.len());
    let level = graph.random_level();
    graph.push_node(level);

    if graph.entry_point < 0 {
        graph.entry_point = id as i64;
        graph.max_level = level;
        return Ok(());
    }

    let entry = graph.entry_point as u32;
    let mut nearest = Neighbor {
        id: entry,
        distance: dc.distance(entry),
    };

    // refine the entry point down to just above the node's top layer
    if graph.max_level > level {
        nearest = greedy_descent(graph, dc, nearest, graph.max_level, level + 1);
    }

    let top = level.min(graph.max_level);
    for l in (0..=top).rev() {
        visited.ensure_capacity(graph.len());
        visited.clear();
        visited.insert(id);
        visited.insert(nearest.id);
        let found = search_level(
            graph,
            dc,
            l,
            nearest,
            graph.ef_construction,
            None,
            visited,
            false,
        );
        if let Some(best) = found.results.first() {
            nearest = *best;
        }

        let selected = select_neighbors(dc, &found.results, graph.m);
        for &nb in &selected {
            let fwd = graph.neighbors_mut(id, l);
            if !fwd.contains(&nb) {
                fwd.push(nb);
            }
            let rev = graph.neighbors_mut(nb, l);
            if !rev.contains(&id) {
                rev.push(id);
            }
        }
        shrink_list(graph, dc, id, l);
        for &nb in &selected {
            shrink_list(graph, dc, nb, l);
        }
    }

    if level > graph.max_level {
        graph.max_level = level;
        graph.entry_point = id as i64;
    }
    Ok(())
}
