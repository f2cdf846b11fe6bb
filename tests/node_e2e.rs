//! End-to-end tests of the index node facade.
//!
//! These validate actual search behavior on small hand-checked datasets,
//! not just that the plumbing holds together.

use nearfield::dataformat::DataFormat;
use nearfield::{Bitset, BitsetView, Dataset, IndexConfig, IndexKind, IndexNode};

fn axis_dataset() -> Dataset {
    // the origin plus one unit vector per axis
    Dataset::from_fp32(
        5,
        4,
        vec![
            0.0, 0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
    )
    .unwrap()
}

fn build_flat(metric: &str) -> (IndexNode, IndexConfig) {
    let cfg = IndexConfig {
        metric_type: Some(metric.to_string()),
        k: Some(2),
        m: Some(16),
        ef_construction: Some(40),
        ef: Some(16),
        ..Default::default()
    };
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    let data = axis_dataset();
    node.train(&data, &cfg).unwrap();
    node.add(&data, &cfg).unwrap();
    (node, cfg)
}

#[test]
fn l2_topk_returns_exact_neighbors() {
    let (node, cfg) = build_flat("L2");
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let res = node.search(&query, &cfg, BitsetView::none()).unwrap();
    assert_eq!(res.ids_for(0), &[0, 1]);
    assert!((res.distances_for(0)[0] - 0.01).abs() < 1e-6);
    assert!((res.distances_for(0)[1] - 0.81).abs() < 1e-6);
}

#[test]
fn cosine_ranks_zero_vector_behind_matches() {
    let (node, mut cfg) = build_flat("COSINE");
    cfg.k = Some(5);
    let query = Dataset::from_fp32(1, 4, vec![2.0, 0.0, 0.0, 0.0]).unwrap();
    let res = node.search(&query, &cfg, BitsetView::none()).unwrap();
    let ids = res.ids_for(0);
    let dists = res.distances_for(0);
    // id 1 is the exact direction; the zero vector cannot outrank it
    assert_eq!(ids[0], 1);
    assert!((dists[0] - 1.0).abs() < 1e-6);
    let zero_pos = ids.iter().position(|&i| i == 0).unwrap();
    assert!(zero_pos > 0);
    assert_eq!(dists[zero_pos], 0.0);
}

#[test]
fn search_results_are_sorted_and_unique() {
    let (node, mut cfg) = build_flat("L2");
    cfg.k = Some(5);
    let query = Dataset::from_fp32(1, 4, vec![0.3, 0.2, 0.1, 0.0]).unwrap();
    let res = node.search(&query, &cfg, BitsetView::none()).unwrap();
    let ids = res.ids_for(0);
    let dists = res.distances_for(0);
    let mut seen = std::collections::HashSet::new();
    for &id in ids {
        assert!(id >= 0);
        assert!(seen.insert(id));
    }
    for w in dists.windows(2) {
        assert!(w[0] <= w[1]);
    }
    // L2 distances are non-negative
    assert!(dists.iter().all(|&d| d >= 0.0));
}

#[test]
fn similarity_results_are_descending() {
    let (node, mut cfg) = build_flat("IP");
    cfg.k = Some(4);
    let query = Dataset::from_fp32(1, 4, vec![0.5, 0.4, 0.3, 0.2]).unwrap();
    let res = node.search(&query, &cfg, BitsetView::none()).unwrap();
    for w in res.distances_for(0).windows(2) {
        assert!(w[0] >= w[1]);
    }
}

#[test]
fn train_is_rejected_twice_and_add_requires_train() {
    let cfg = IndexConfig {
        k: Some(1),
        ..Default::default()
    };
    let data = axis_dataset();

    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    assert!(node.add(&data, &cfg).is_err());

    node.train(&data, &cfg).unwrap();
    assert!(node.train(&data, &cfg).is_err());
}

#[test]
fn search_requires_populated_index() {
    let cfg = IndexConfig {
        k: Some(1),
        ..Default::default()
    };
    let node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    let query = Dataset::from_fp32(1, 4, vec![0.0; 4]).unwrap();
    assert!(node.search(&query, &cfg, BitsetView::none()).is_err());
}

#[test]
fn missing_k_is_reported() {
    let (node, mut cfg) = build_flat("L2");
    cfg.k = None;
    let query = Dataset::from_fp32(1, 4, vec![0.0; 4]).unwrap();
    let err = node.search(&query, &cfg, BitsetView::none()).unwrap_err();
    assert!(err.to_string().contains("k parameter"));
}

#[test]
fn get_vector_by_ids_is_exact_for_flat() {
    let (node, _) = build_flat("L2");
    let out = node.get_vector_by_ids(&[3, 1]).unwrap();
    assert_eq!(out.rows(), 2);
    match out.tensor() {
        nearfield::dataformat::VectorData::Fp32(v) => {
            assert_eq!(&v[0..4], &[0.0, 0.0, 1.0, 0.0]);
            assert_eq!(&v[4..8], &[1.0, 0.0, 0.0, 0.0]);
        }
        other => panic!("unexpected format {:?}", other.format()),
    }
}

#[test]
fn get_vector_by_ids_is_exact_for_cosine_storage() {
    // cosine storage must hand back unnormalized rows
    let cfg = IndexConfig {
        metric_type: Some("COSINE".to_string()),
        k: Some(1),
        ..Default::default()
    };
    let data = Dataset::from_fp32(2, 2, vec![3.0, 4.0, 0.5, 0.5]).unwrap();
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    node.train(&data, &cfg).unwrap();
    node.add(&data, &cfg).unwrap();
    let out = node.get_vector_by_ids(&[0]).unwrap();
    match out.tensor() {
        nearfield::dataformat::VectorData::Fp32(v) => assert_eq!(&v[..], &[3.0, 4.0]),
        other => panic!("unexpected format {:?}", other.format()),
    }
}

#[test]
fn iterator_yields_all_ids_then_exhausts() {
    let (node, cfg) = build_flat("L2");
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let mut iterators = node.ann_iterator(&query, &cfg, BitsetView::none()).unwrap();
    assert_eq!(iterators.len(), 1);
    let it = &mut iterators[0];

    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        let (id, _) = it.next().expect("iterator ended early");
        assert!(seen.insert(id));
    }
    assert!(it.next().is_none());
    assert_eq!(seen.len(), 5);
}

#[test]
fn iterator_prefix_matches_topk() {
    let (node, mut cfg) = build_flat("L2");
    cfg.k = Some(3);
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.05, 0.0, 0.0]).unwrap();

    let res = node.search(&query, &cfg, BitsetView::none()).unwrap();
    let mut iterators = node.ann_iterator(&query, &cfg, BitsetView::none()).unwrap();
    let it = &mut iterators[0];
    for slot in 0..3 {
        let (id, _) = it.next().unwrap();
        assert_eq!(id, res.ids_for(0)[slot]);
    }
}

#[test]
fn iterator_honors_filter() {
    let (node, cfg) = build_flat("L2");
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let mut bits = Bitset::with_all_clear(5);
    bits.set(0);
    bits.set(4);
    let view = bits.view();
    let mut iterators = node.ann_iterator(&query, &cfg, view).unwrap();
    let it = &mut iterators[0];
    let mut yielded = Vec::new();
    while let Some((id, _)) = it.next() {
        yielded.push(id);
    }
    assert!(!yielded.contains(&0));
    assert!(!yielded.contains(&4));
}

#[test]
fn range_search_returns_window() {
    let (node, mut cfg) = build_flat("L2");
    cfg.radius = Some(0.5);
    cfg.ef = Some(16);
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let out = node.range_search(&query, &cfg, BitsetView::none()).unwrap();
    // only the origin is within squared distance 0.5
    assert_eq!(out.ids_for(0), &[0]);
    assert!(out.distances_for(0)[0] < 0.5);
}

#[test]
fn calc_dist_by_ids_computes_exact_distances() {
    let (node, _) = build_flat("L2");
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let dists = node
        .calc_dist_by_ids(&query, BitsetView::none(), &[0, 1])
        .unwrap();
    assert!((dists[0] - 0.01).abs() < 1e-6);
    assert!((dists[1] - 0.81).abs() < 1e-6);
}

#[test]
fn id_map_is_identity_for_single_partition() {
    let (node, _) = build_flat("L2");
    assert_eq!(node.internal_id_to_external_id_map(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn most_external_id_map_redirects_filter_evaluation() {
    let (mut node, cfg) = build_flat("L2");
    // the filter bitmap is indexed by a higher-level id space: internal
    // offset i corresponds to external id 10 + i there
    node.set_internal_id_to_most_external_id_map(vec![10, 11, 12, 13, 14]);

    let mut bits = Bitset::with_all_clear(15);
    bits.set(10); // filters out offset 0
    bits.set(11); // filters out offset 1
    let query = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let res = node.search(&query, &cfg, bits.view()).unwrap();
    let ids = res.ids_for(0);
    assert!(!ids.contains(&0));
    assert!(!ids.contains(&1));
    assert!(ids.iter().all(|&i| i >= 2));
}

#[test]
fn trace_visit_requires_single_query() {
    let (node, mut cfg) = build_flat("L2");
    cfg.trace_visit = Some(true);
    let two = Dataset::from_fp32(2, 4, vec![0.0; 8]).unwrap();
    assert!(node.search(&two, &cfg, BitsetView::none()).is_err());

    let one = Dataset::from_fp32(1, 4, vec![0.1, 0.0, 0.0, 0.0]).unwrap();
    let res = node.search(&one, &cfg, BitsetView::none()).unwrap();
    let trace = res.trace.expect("trace requested");
    assert!(!trace.is_empty());
}
