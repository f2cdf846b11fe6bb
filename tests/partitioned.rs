//! Partitioned (scalar-key) builds: routing, label remap, serialization.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nearfield::dataformat::DataFormat;
use nearfield::{Bitset, BitsetView, Dataset, IndexConfig, IndexKind, IndexNode};

/// Two clearly separated clusters, one per scalar bucket. Bucket 0 owns the
/// even labels, bucket 1 the odd ones.
fn two_bucket_dataset(rows_per_bucket: usize, dim: usize, seed: u64) -> (Dataset, Vec<Vec<u32>>) {
    let total = rows_per_bucket * 2;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0.0f32; total * dim];
    let mut buckets = vec![Vec::new(), Vec::new()];
    for label in 0..total {
        let bucket = label % 2;
        buckets[bucket].push(label as u32);
        let center = if bucket == 0 { 0.0 } else { 10.0 };
        for d in 0..dim {
            data[label * dim + d] = center + rng.random::<f32>();
        }
    }
    let mut scalar_info = HashMap::new();
    scalar_info.insert(0i64, buckets.clone());
    let ds = Dataset::from_fp32(total, dim, data)
        .unwrap()
        .with_scalar_info(scalar_info);
    (ds, buckets)
}

fn config() -> IndexConfig {
    IndexConfig {
        metric_type: Some("L2".to_string()),
        k: Some(3),
        m: Some(16),
        ef_construction: Some(100),
        ef: Some(64),
        ..Default::default()
    }
}

fn build_partitioned(rows_per_bucket: usize, seed: u64) -> (IndexNode, Dataset, Vec<Vec<u32>>) {
    let (ds, buckets) = two_bucket_dataset(rows_per_bucket, 4, seed);
    let cfg = config();
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    node.train(&ds, &cfg).unwrap();
    node.add(&ds, &cfg).unwrap();
    (node, ds, buckets)
}

/// A bitset that passes only the given labels.
fn only_labels(total: usize, labels: &[u32]) -> Bitset {
    let keep: std::collections::HashSet<u32> = labels.iter().copied().collect();
    let mut bits = Bitset::with_all_clear(total);
    for i in 0..total {
        if !keep.contains(&(i as u32)) {
            bits.set(i);
        }
    }
    bits
}

#[test]
fn search_returns_only_selected_partition_labels() {
    let (node, _, buckets) = build_partitioned(150, 1);
    let total = 300;

    // select a single odd label
    let bits = only_labels(total, &[3]);
    let query = Dataset::from_fp32(1, 4, vec![10.5; 4]).unwrap();
    let mut cfg = config();
    cfg.k = Some(1);
    let res = node.search(&query, &cfg, bits.view()).unwrap();
    assert_eq!(res.ids_for(0), &[3]);

    // select all odd labels: results stay in bucket 1
    let bits = only_labels(total, &buckets[1]);
    let res = node.search(&query, &config(), bits.view()).unwrap();
    for &id in res.ids_for(0) {
        assert!(id >= 0 && id % 2 == 1, "id {id} not in the odd bucket");
    }
}

#[test]
fn partition_search_matches_single_index_of_same_rows() {
    let (node, ds, buckets) = build_partitioned(150, 2);
    let total = ds.rows();
    let dim = ds.dim();

    // standalone index over bucket 0's rows only, in label order
    let mut rows = Vec::new();
    match ds.tensor() {
        nearfield::dataformat::VectorData::Fp32(v) => {
            for &label in &buckets[0] {
                rows.extend_from_slice(&v[label as usize * dim..(label as usize + 1) * dim]);
            }
        }
        _ => unreachable!(),
    }
    let single_ds = Dataset::from_fp32(buckets[0].len(), dim, rows).unwrap();
    let cfg = config();
    let mut single = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    single.train(&single_ds, &cfg).unwrap();
    single.add(&single_ds, &cfg).unwrap();

    let query = Dataset::from_fp32(1, dim, vec![0.5; 4]).unwrap();
    let bits = only_labels(total, &buckets[0]);
    let partitioned = node.search(&query, &cfg, bits.view()).unwrap();
    let standalone = single.search(&query, &cfg, BitsetView::none()).unwrap();

    // same result set modulo the label remap
    let remapped: Vec<i64> = standalone
        .ids_for(0)
        .iter()
        .map(|&i| buckets[0][i as usize] as i64)
        .collect();
    assert_eq!(partitioned.ids_for(0), remapped.as_slice());
    assert_eq!(partitioned.distances_for(0), standalone.distances_for(0));
}

#[test]
fn partitioned_round_trip_preserves_layout_and_results() {
    let (node, _, buckets) = build_partitioned(150, 3);
    let total = 300;

    let mut buf = Vec::new();
    node.serialize(&mut buf).unwrap();

    let mut reloaded = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    reloaded
        .deserialize(&mut std::io::Cursor::new(buf.as_slice()))
        .unwrap();
    assert_eq!(reloaded.count(), total as i64);
    assert_eq!(
        reloaded.internal_id_to_external_id_map(),
        node.internal_id_to_external_id_map()
    );

    let bits = only_labels(total, &buckets[1]);
    let query = Dataset::from_fp32(1, 4, vec![10.2; 4]).unwrap();
    let cfg = config();
    let a = node.search(&query, &cfg, bits.view()).unwrap();
    let b = reloaded.search(&query, &cfg, bits.view()).unwrap();
    assert_eq!(a.ids, b.ids);
    assert_eq!(a.distances, b.distances);
}

#[test]
fn mv_requires_a_partition_key_filter() {
    let (node, _, _) = build_partitioned(150, 4);
    let query = Dataset::from_fp32(1, 4, vec![0.0; 4]).unwrap();
    let err = node
        .search(&query, &config(), BitsetView::none())
        .unwrap_err();
    assert!(matches!(err, nearfield::IndexError::InvalidArgs(_)));
}

#[test]
fn multiple_scalar_fields_are_rejected() {
    let (ds, buckets) = two_bucket_dataset(150, 4, 5);
    let mut info = HashMap::new();
    info.insert(0i64, buckets.clone());
    info.insert(1i64, buckets);
    let ds = ds.with_scalar_info(info);

    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    let err = node.train(&ds, &config()).unwrap_err();
    assert!(matches!(err, nearfield::IndexError::InvalidArgs(_)));
}

#[test]
fn get_vector_by_ids_resolves_partitions() {
    let (node, ds, _) = build_partitioned(150, 6);
    let out = node.get_vector_by_ids(&[0, 1, 299]).unwrap();
    let (nearfield::dataformat::VectorData::Fp32(got), nearfield::dataformat::VectorData::Fp32(src)) =
        (out.tensor(), ds.tensor())
    else {
        panic!("expected fp32 tensors");
    };
    assert_eq!(&got[0..4], &src[0..4]);
    assert_eq!(&got[4..8], &src[4..8]);
    assert_eq!(&got[8..12], &src[299 * 4..300 * 4]);
}

#[test]
fn calc_dist_by_ids_uses_partition_mapping() {
    let (node, ds, buckets) = build_partitioned(150, 7);
    let total = ds.rows();
    let bits = only_labels(total, &buckets[1]);
    let query = Dataset::from_fp32(1, 4, vec![10.0; 4]).unwrap();
    let dists = node
        .calc_dist_by_ids(&query, bits.view(), &[1, 3])
        .unwrap();

    // exact squared distances against the raw rows
    let nearfield::dataformat::VectorData::Fp32(v) = ds.tensor() else {
        panic!()
    };
    for (slot, label) in [1usize, 3].iter().enumerate() {
        let row = &v[label * 4..(label + 1) * 4];
        let expected: f32 = row.iter().map(|x| (x - 10.0) * (x - 10.0)).sum();
        assert!((dists[slot] - expected).abs() < 1e-4);
    }
}

#[test]
fn iterator_on_partition_yields_partition_labels() {
    let (node, _, buckets) = build_partitioned(150, 8);
    let total = 300;
    let bits = only_labels(total, &buckets[1]);
    let query = Dataset::from_fp32(1, 4, vec![10.0; 4]).unwrap();
    let mut iterators = node.ann_iterator(&query, &config(), bits.view()).unwrap();
    let it = &mut iterators[0];
    for _ in 0..10 {
        let Some((id, _)) = it.next() else { break };
        assert!(id % 2 == 1, "id {id} not an odd label");
    }
}
