//! Filtered search: selective bitsets, the brute-force dispatch, and the
//! too-few-survivors fallback.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nearfield::dataformat::DataFormat;
use nearfield::{Bitset, BitsetView, Dataset, IndexConfig, IndexKind, IndexNode};

fn random_dataset(rows: usize, dim: usize, seed: u64) -> (Dataset, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * dim)
        .map(|_| rng.random::<f32>() * 2.0 - 1.0)
        .collect();
    (
        Dataset::from_fp32(rows, dim, data.clone()).unwrap(),
        data,
    )
}

fn build(rows: usize, dim: usize, seed: u64) -> (IndexNode, Vec<f32>, IndexConfig) {
    let (ds, data) = random_dataset(rows, dim, seed);
    let cfg = IndexConfig {
        metric_type: Some("L2".to_string()),
        k: Some(5),
        m: Some(16),
        ef_construction: Some(100),
        ef: Some(64),
        ..Default::default()
    };
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    node.train(&ds, &cfg).unwrap();
    node.add(&ds, &cfg).unwrap();
    (node, data, cfg)
}

fn exact_filtered_topk(
    data: &[f32],
    dim: usize,
    query: &[f32],
    k: usize,
    passes: impl Fn(usize) -> bool,
) -> Vec<i64> {
    let n = data.len() / dim;
    let mut scored: Vec<(i64, f32)> = (0..n)
        .filter(|&i| passes(i))
        .map(|i| {
            let row = &data[i * dim..(i + 1) * dim];
            let d: f32 = row.iter().zip(query).map(|(x, y)| (x - y) * (x - y)).sum();
            (i as i64, d)
        })
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(k).map(|(i, _)| i).collect()
}

#[test]
fn very_selective_filter_returns_exactly_the_survivors() {
    let (node, data, cfg) = build(500, 8, 1);
    // only 5 rows pass: passing <= k forces the brute-force path
    let survivors = [7usize, 99, 250, 384, 499];
    let mut bits = Bitset::with_all_clear(500);
    for i in 0..500 {
        if !survivors.contains(&i) {
            bits.set(i);
        }
    }

    let query = Dataset::from_fp32(1, 8, data[..8].to_vec()).unwrap();
    let res = node.search(&query, &cfg, bits.view()).unwrap();
    let expected = exact_filtered_topk(&data, 8, &data[..8], 5, |i| survivors.contains(&i));
    assert_eq!(res.ids_for(0), expected.as_slice());
}

#[test]
fn fallback_fills_k_when_enough_rows_pass() {
    let (node, data, mut cfg) = build(500, 8, 2);
    cfg.k = Some(10);
    // 40 passing rows: above k, below the brute-force ratio would be
    // 460/500 = 0.92, just under the dispatch threshold, so graph search
    // runs first and the fallback must guarantee k results
    let mut bits = Bitset::with_all_clear(500);
    for i in 0..460 {
        bits.set(i);
    }

    let query = Dataset::from_fp32(1, 8, data[..8].to_vec()).unwrap();
    let res = node.search(&query, &cfg, bits.view()).unwrap();
    let ids = res.ids_for(0);
    let dists = res.distances_for(0);

    // exactly k filter-passing survivors, with correct distances, sorted
    assert_eq!(ids.iter().filter(|&&i| i >= 0).count(), 10);
    assert!(ids.iter().all(|&i| i >= 460), "ids {ids:?}");
    for (slot, &id) in ids.iter().enumerate() {
        let row = &data[id as usize * 8..(id as usize + 1) * 8];
        let expected: f32 = row
            .iter()
            .zip(&data[..8])
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        assert!((dists[slot] - expected).abs() < 1e-4);
    }
    for w in dists.windows(2) {
        assert!(w[0] <= w[1]);
    }
}

#[test]
fn filtered_results_match_exact_filtered_scan() {
    let (node, data, cfg) = build(500, 8, 3);
    // every third row passes
    let mut bits = Bitset::with_all_clear(500);
    for i in 0..500 {
        if i % 3 != 0 {
            bits.set(i);
        }
    }

    let mut agree = 0;
    let n_queries = 20;
    for q in 0..n_queries {
        let query: Vec<f32> = data[q * 8..(q + 1) * 8].to_vec();
        let qds = Dataset::from_fp32(1, 8, query.clone()).unwrap();
        let res = node.search(&qds, &cfg, bits.view()).unwrap();
        let expected = exact_filtered_topk(&data, 8, &query, 5, |i| i % 3 == 0);
        if res.ids_for(0) == expected.as_slice() {
            agree += 1;
        }
        // every returned id must pass the filter regardless
        for &id in res.ids_for(0) {
            assert!(id >= 0 && id % 3 == 0);
        }
    }
    assert!(agree >= 18, "only {agree}/{n_queries} exact matches");
}

#[test]
fn range_search_respects_filter() {
    let (node, data, mut cfg) = build(300, 8, 4);
    cfg.radius = Some(4.0);
    cfg.ef = Some(128);
    let mut bits = Bitset::with_all_clear(300);
    for i in 150..300 {
        bits.set(i);
    }

    let query = Dataset::from_fp32(1, 8, data[..8].to_vec()).unwrap();
    let out = node.range_search(&query, &cfg, bits.view()).unwrap();
    for &id in out.ids_for(0) {
        assert!(id < 150, "filtered-out id {id} in range results");
    }
    for &d in out.distances_for(0) {
        assert!(d < 4.0);
    }
}
