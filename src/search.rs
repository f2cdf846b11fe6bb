//! Brute-force search and the graph/brute-force dispatcher.
//!
//! Very selective filters make graph traversal pointless: almost every edge
//! leads to a filtered-out node. The dispatcher routes such queries to a
//! linear scan up front; a second, per-query fallback kicks in after graph
//! search when it produced fewer than `k` survivors even though enough rows
//! pass the filter.

use crate::bitset::BitsetView;
use crate::hnsw::Neighbor;
use crate::storage::{negative_computer, VectorStorage};

/// Filtered-out fraction above which top-k search goes brute-force.
pub const KNN_BF_FILTER_THRESHOLD: f32 = 0.93;
/// Filtered-out fraction above which range search goes brute-force.
pub const RANGE_BF_FILTER_THRESHOLD: f32 = 0.97;
/// Beam width used to seed iterators when the config does not set `ef`.
pub const ITERATOR_SEED_EF: usize = 40;

/// Decide whether a top-k query should bypass the graph.
///
/// `None` when `k` is missing; `Some(true)` when so few rows pass the filter
/// that a scan is cheaper (or is required to fill `k` at all).
pub(crate) fn should_brute_force_knn(
    k: Option<usize>,
    bitset: &BitsetView<'_>,
    ntotal: usize,
) -> Option<bool> {
    let k = k?;
    if bitset.is_empty() {
        return Some(false);
    }
    let passing = bitset.size().saturating_sub(bitset.count());
    if passing <= k {
        return Some(true);
    }
    if bitset.filter_ratio() >= KNN_BF_FILTER_THRESHOLD {
        return Some(true);
    }
    Some(false)
}

/// Range-search analogue of [`should_brute_force_knn`], keyed on `ef`.
pub(crate) fn should_brute_force_range(
    ef: Option<usize>,
    bitset: &BitsetView<'_>,
    _ntotal: usize,
) -> Option<bool> {
    ef?;
    if bitset.is_empty() {
        return Some(false);
    }
    Some(bitset.filter_ratio() >= RANGE_BF_FILTER_THRESHOLD)
}

/// Initial alpha budget for adaptive-filter traversal: unrestricted when the
/// filter is restrictive enough that filtered-out nodes are the only viable
/// navigation medium, tight otherwise.
pub(crate) fn initial_accumulated_alpha(bitset: &BitsetView<'_>, ntotal: usize) -> f32 {
    if bitset.count() as f32 >= ntotal as f32 * KNN_BF_FILTER_THRESHOLD {
        f32::INFINITY
    } else {
        1.0
    }
}

/// Is an externally-oriented distance inside the (radius, range_filter]
/// window?
pub(crate) fn within_range(
    d: f32,
    radius: f32,
    range_filter: Option<f32>,
    similarity: bool,
) -> bool {
    if similarity {
        d > radius && range_filter.is_none_or(|rf| d <= rf)
    } else {
        d < radius && range_filter.is_none_or(|rf| d >= rf)
    }
}

/// Linear top-k scan. Results are internally oriented (smaller is better),
/// ascending, at most `k` entries.
pub(crate) fn brute_force_knn(
    storage: &dyn VectorStorage,
    query: &[f32],
    k: usize,
    bitset: &BitsetView<'_>,
) -> Vec<Neighbor> {
    let mut dc = negative_computer(storage);
    dc.set_query(query);

    let mut heap: std::collections::BinaryHeap<Neighbor> =
        std::collections::BinaryHeap::with_capacity(k + 1);
    for id in 0..storage.ntotal() as u32 {
        if !bitset.is_member(id as usize) {
            continue;
        }
        let d = dc.distance(id);
        let n = Neighbor { id, distance: d };
        if heap.len() < k {
            heap.push(n);
        } else if let Some(worst) = heap.peek() {
            if n < *worst {
                heap.pop();
                heap.push(n);
            }
        }
    }
    let mut out = heap.into_vec();
    out.sort_unstable();
    out
}

/// Linear range scan. Results are externally oriented and sorted better
/// first.
pub(crate) fn brute_force_range(
    storage: &dyn VectorStorage,
    query: &[f32],
    radius: f32,
    range_filter: Option<f32>,
    bitset: &BitsetView<'_>,
) -> (Vec<i64>, Vec<f32>) {
    let similarity = storage.metric().is_similarity();
    let mut dc = storage.distance_computer();
    dc.set_query(query);

    let mut hits: Vec<(i64, f32)> = Vec::new();
    for id in 0..storage.ntotal() as u32 {
        if !bitset.is_member(id as usize) {
            continue;
        }
        let d = dc.distance(id);
        if within_range(d, radius, range_filter, similarity) {
            hits.push((id as i64, d));
        }
    }
    if similarity {
        hits.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    } else {
        hits.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    }
    hits.into_iter().unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset;
    use crate::metric::MetricType;
    use crate::storage::FlatStorage;

    fn line_storage(n: usize) -> FlatStorage {
        let mut s = FlatStorage::new(1, MetricType::L2);
        let rows: Vec<f32> = (0..n).map(|i| i as f32).collect();
        s.add(&rows, n).unwrap();
        s
    }

    #[test]
    fn dispatcher_requires_k() {
        let bits = Bitset::with_all_clear(10);
        assert_eq!(should_brute_force_knn(None, &bits.view(), 10), None);
        assert_eq!(should_brute_force_knn(Some(3), &bits.view(), 10), Some(false));
    }

    #[test]
    fn dispatcher_goes_brute_force_when_few_rows_pass() {
        let mut bits = Bitset::with_all_clear(10);
        for i in 0..8 {
            bits.set(i);
        }
        // 2 passing rows <= k
        assert_eq!(should_brute_force_knn(Some(3), &bits.view(), 10), Some(true));
        // plenty pass, ratio low
        let loose = Bitset::with_all_clear(10);
        assert_eq!(should_brute_force_knn(Some(3), &loose.view(), 10), Some(false));
    }

    #[test]
    fn dispatcher_goes_brute_force_on_high_ratio() {
        let mut bits = Bitset::with_all_clear(100);
        for i in 0..95 {
            bits.set(i);
        }
        assert_eq!(should_brute_force_knn(Some(2), &bits.view(), 100), Some(true));
        assert_eq!(should_brute_force_range(Some(16), &bits.view(), 100), Some(false));
        for i in 95..98 {
            bits.set(i);
        }
        assert_eq!(should_brute_force_range(Some(16), &bits.view(), 100), Some(true));
        assert_eq!(should_brute_force_range(None, &bits.view(), 100), None);
    }

    #[test]
    fn brute_force_knn_respects_filter_and_order() {
        let storage = line_storage(10);
        let mut bits = Bitset::with_all_clear(10);
        bits.set(0);
        bits.set(1);
        let found = brute_force_knn(&storage, &[0.0], 3, &bits.view());
        let ids: Vec<u32> = found.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(found[0].distance <= found[1].distance);
    }

    #[test]
    fn brute_force_range_window() {
        let storage = line_storage(10);
        let none = BitsetView::none();
        // squared distances from 2.5: keep < 9.0 (|x - 2.5| < 3)
        let (ids, dists) = brute_force_range(&storage, &[2.5], 9.0, None, &none);
        assert_eq!(ids.len(), 6); // 0..=5 at squared dists 6.25,2.25,0.25,0.25,2.25,6.25
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        // two-sided window drops the closest ones
        let (ids2, _) = brute_force_range(&storage, &[2.5], 9.0, Some(1.0), &none);
        assert!(ids2.len() < ids.len());
    }
}
