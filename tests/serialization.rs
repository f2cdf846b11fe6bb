//! Serialize -> deserialize round trips.
//!
//! A reloaded index must return bit-identical results for the same query,
//! filter, k and ef, across index kinds and metrics.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nearfield::dataformat::DataFormat;
use nearfield::{BitsetView, Dataset, IndexConfig, IndexKind, IndexNode};

fn random_dataset(rows: usize, dim: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * dim)
        .map(|_| rng.random::<f32>() * 2.0 - 1.0)
        .collect();
    Dataset::from_fp32(rows, dim, data).unwrap()
}

fn config(metric: &str, kind: IndexKind) -> IndexConfig {
    let mut cfg = IndexConfig {
        metric_type: Some(metric.to_string()),
        k: Some(5),
        m: Some(16),
        ef_construction: Some(100),
        ef: Some(64),
        ..Default::default()
    };
    match kind {
        IndexKind::Sq => cfg.sq_type = Some("FP16".to_string()),
        IndexKind::Pq => {
            cfg.pq_m = Some(4);
            cfg.nbits = Some(8);
        }
        IndexKind::Prq => {
            cfg.pq_m = Some(2);
            cfg.nrq = Some(2);
            cfg.nbits = Some(8);
        }
        IndexKind::Flat => {}
    }
    cfg
}

fn round_trip_case(metric: &str, kind: IndexKind, seed: u64) {
    let rows = 300;
    let dim = 8;
    let data = random_dataset(rows, dim, seed);
    let cfg = config(metric, kind);

    let mut node = IndexNode::new(kind, DataFormat::Fp32);
    node.train(&data, &cfg).unwrap();
    node.add(&data, &cfg).unwrap();

    let mut buf = Vec::new();
    node.serialize(&mut buf).unwrap();

    let mut reloaded = IndexNode::new(kind, DataFormat::Fp32);
    reloaded
        .deserialize(&mut std::io::Cursor::new(buf.as_slice()))
        .unwrap();
    assert_eq!(reloaded.count(), rows as i64);
    assert_eq!(reloaded.dim(), dim as i64);

    let queries = random_dataset(5, dim, seed ^ 0xFFFF);
    let a = node.search(&queries, &cfg, BitsetView::none()).unwrap();
    let b = reloaded.search(&queries, &cfg, BitsetView::none()).unwrap();
    assert_eq!(a.ids, b.ids, "{metric} {kind:?}");
    assert_eq!(a.distances, b.distances, "{metric} {kind:?}");
}

#[test]
fn round_trip_flat_all_metrics() {
    for metric in ["L2", "IP", "COSINE"] {
        round_trip_case(metric, IndexKind::Flat, 10);
    }
}

#[test]
fn round_trip_sq_all_metrics() {
    for metric in ["L2", "IP", "COSINE"] {
        round_trip_case(metric, IndexKind::Sq, 20);
    }
}

#[test]
fn round_trip_pq_all_metrics() {
    for metric in ["L2", "IP", "COSINE"] {
        round_trip_case(metric, IndexKind::Pq, 30);
    }
}

#[test]
fn round_trip_prq_all_metrics() {
    for metric in ["L2", "IP", "COSINE"] {
        round_trip_case(metric, IndexKind::Prq, 40);
    }
}

#[test]
fn round_trip_fp16_data_format() {
    use half::f16;
    let rows = 150;
    let dim = 4;
    let mut rng = StdRng::seed_from_u64(7);
    let raw: Vec<f16> = (0..rows * dim)
        .map(|_| f16::from_f32(rng.random::<f32>()))
        .collect();
    let data = Dataset::new(
        rows,
        dim,
        nearfield::dataformat::VectorData::Fp16(raw),
    )
    .unwrap();
    let cfg = config("L2", IndexKind::Flat);

    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp16);
    node.train(&data, &cfg).unwrap();
    node.add(&data, &cfg).unwrap();
    assert!(node.has_raw_data());

    let mut buf = Vec::new();
    node.serialize(&mut buf).unwrap();
    let mut reloaded = IndexNode::new(IndexKind::Flat, DataFormat::Fp16);
    reloaded
        .deserialize(&mut std::io::Cursor::new(buf.as_slice()))
        .unwrap();

    // fp16 storage is lossless for fp16 input
    let original = node.get_vector_by_ids(&[0, 10, 149]).unwrap();
    let restored = reloaded.get_vector_by_ids(&[0, 10, 149]).unwrap();
    match (original.tensor(), restored.tensor()) {
        (
            nearfield::dataformat::VectorData::Fp16(a),
            nearfield::dataformat::VectorData::Fp16(b),
        ) => assert_eq!(a, b),
        _ => panic!("expected fp16 tensors"),
    }
}

#[test]
fn file_round_trip_plain_and_mmap() {
    let data = random_dataset(200, 8, 99);
    let cfg = config("L2", IndexKind::Flat);
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    node.train(&data, &cfg).unwrap();
    node.add(&data, &cfg).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    node.serialize(&mut file).unwrap();
    drop(file);

    let queries = random_dataset(3, 8, 100);
    let expected = node.search(&queries, &cfg, BitsetView::none()).unwrap();

    for mmap in [false, true] {
        let load_cfg = IndexConfig {
            enable_mmap: Some(mmap),
            ..cfg.clone()
        };
        let mut reloaded = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
        reloaded.deserialize_from_file(&path, &load_cfg).unwrap();
        let got = reloaded.search(&queries, &cfg, BitsetView::none()).unwrap();
        assert_eq!(got.ids, expected.ids);
        assert_eq!(got.distances, expected.distances);
    }
}

#[test]
fn unknown_stream_is_rejected_as_unrecognized() {
    let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    let garbage = b"XXXXsome bytes that are not an index".to_vec();
    let err = node
        .deserialize(&mut std::io::Cursor::new(garbage.as_slice()))
        .unwrap_err();
    assert!(matches!(
        err,
        nearfield::IndexError::InvalidSerializedIndexType(_)
    ));
}

#[test]
fn serialize_empty_index_fails() {
    let node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
    let mut buf = Vec::new();
    assert!(matches!(
        node.serialize(&mut buf),
        Err(nearfield::IndexError::EmptyIndex)
    ));
}
