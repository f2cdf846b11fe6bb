//! The index node facade.
//!
//! Owns one sub-index per partition (a single one in the common case), the
//! partition id bookkeeping, and the build/query orchestration: train and
//! add run as one task on the build pool, search fans out one task per
//! query row on the search pool.
//!
//! PQ and PRQ nodes build in two stages: train constructs an HNSW index
//! over flat storage and separately trains the quantizer; add feeds the
//! same rows to both; once a partition is fully populated the flat storage
//! is dropped and the quantizer storage spliced into the graph. Training
//! the graph on raw vectors first is what keeps its quality — building a
//! graph directly over quantized codes loses recall.

use std::io::{Read, Write};
use std::path::Path;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::bitset::BitsetView;
use crate::config::{IndexConfig, IndexKind, DEFAULT_ITERATOR_REFINE_RATIO};
use crate::dataformat::{
    convert_rows_from_fp32, convert_rows_to_fp32, gather_rows_to_fp32, DataFormat, VectorData,
};
use crate::dataset::{Dataset, RangeSearchOutput, SearchResult};
use crate::error::{IndexError, Result};
use crate::hnsw::HnswIndex;
use crate::io::{self, IndexSource};
use crate::iterator::AnnIterator;
use crate::metric::MetricType;
use crate::partition::{combine_partitions, PartitionLayout};
use crate::pool;
use crate::quantizer::{PqStorage, PrqStorage};
use crate::refine::RefineIndex;
use crate::search::{
    brute_force_knn, brute_force_range, initial_accumulated_alpha, should_brute_force_knn,
    should_brute_force_range, within_range, ITERATOR_SEED_EF,
};
use crate::storage::{FlatStorage, ScalarQuantStorage, SqType, VectorStorage};

/// Rows are converted to fp32 and fed to sub-indexes in chunks of this size.
const ADD_CHUNK_ROWS: usize = 4096;

/// One partition's index: either a bare graph or a refine wrapper around it.
pub enum SubIndex {
    Hnsw(HnswIndex),
    Refine(RefineIndex),
}

impl SubIndex {
    pub(crate) fn hnsw(&self) -> &HnswIndex {
        match self {
            SubIndex::Hnsw(h) => h,
            SubIndex::Refine(r) => &r.base,
        }
    }

    fn hnsw_mut(&mut self) -> &mut HnswIndex {
        match self {
            SubIndex::Hnsw(h) => h,
            SubIndex::Refine(r) => &mut r.base,
        }
    }

    fn ntotal(&self) -> usize {
        self.hnsw().ntotal()
    }

    fn metric(&self) -> MetricType {
        self.hnsw().metric()
    }

    fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        match self {
            SubIndex::Hnsw(h) => h.add(rows, n),
            SubIndex::Refine(r) => r.add(rows, n),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn knn(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        bitset: &BitsetView<'_>,
        k_alpha: f32,
        initial_alpha: f32,
        refine_k: Option<usize>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        match self {
            SubIndex::Hnsw(h) => h.search_knn(query, k, ef, bitset, k_alpha, initial_alpha),
            SubIndex::Refine(r) => match refine_k {
                Some(rk) => r.search_knn(query, k, rk, ef, bitset, k_alpha, initial_alpha),
                None => r.base.search_knn(query, k, ef, bitset, k_alpha, initial_alpha),
            },
        }
    }

    fn knn_bruteforce(
        &self,
        query: &[f32],
        k: usize,
        bitset: &BitsetView<'_>,
        refine_k: Option<usize>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        match self {
            SubIndex::Hnsw(h) => {
                let found = brute_force_knn(h.storage.as_ref(), query, k, bitset);
                Ok(h.externalize(found, k))
            }
            SubIndex::Refine(r) => match refine_k {
                Some(rk) => r.search_knn_bruteforce(query, k, rk, bitset),
                None => {
                    let found = brute_force_knn(r.base.storage.as_ref(), query, k, bitset);
                    Ok(r.base.externalize(found, k))
                }
            },
        }
    }

    fn write(&self, w: &mut dyn Write, kind: IndexKind) -> std::io::Result<()> {
        match self {
            SubIndex::Hnsw(h) => {
                w.write_all(&fourcc_for_kind(kind))?;
                h.write_body(w)
            }
            SubIndex::Refine(r) => {
                w.write_all(&io::FOURCC_REFINE)?;
                w.write_all(&fourcc_for_kind(kind))?;
                r.write_body(w)
            }
        }
    }

    fn read(r: &mut dyn Read, fourcc: [u8; 4]) -> Result<(Self, IndexKind)> {
        if fourcc == io::FOURCC_REFINE {
            let base_fourcc = io::read_fourcc(r)?;
            let kind = kind_for_fourcc(base_fourcc)?;
            Ok((SubIndex::Refine(RefineIndex::read_body(r)?), kind))
        } else {
            let kind = kind_for_fourcc(fourcc)?;
            Ok((SubIndex::Hnsw(HnswIndex::read_body(r)?), kind))
        }
    }
}

fn fourcc_for_kind(kind: IndexKind) -> [u8; 4] {
    match kind {
        IndexKind::Flat => io::FOURCC_HNSW_FLAT,
        IndexKind::Sq => io::FOURCC_HNSW_SQ,
        IndexKind::Pq => io::FOURCC_HNSW_PQ,
        IndexKind::Prq => io::FOURCC_HNSW_PRQ,
    }
}

fn kind_for_fourcc(fourcc: [u8; 4]) -> Result<IndexKind> {
    match fourcc {
        f if f == io::FOURCC_HNSW_FLAT => Ok(IndexKind::Flat),
        f if f == io::FOURCC_HNSW_SQ => Ok(IndexKind::Sq),
        f if f == io::FOURCC_HNSW_PQ => Ok(IndexKind::Pq),
        f if f == io::FOURCC_HNSW_PRQ => Ok(IndexKind::Prq),
        other => Err(IndexError::InvalidSerializedIndexType(format!(
            "index type {:?} not recognized",
            String::from_utf8_lossy(&other)
        ))),
    }
}

/// Counts bytes instead of storing them; used for size estimation.
struct CountingWriter(u64);

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct IndexNode {
    kind: IndexKind,
    data_format: DataFormat,
    indexes: Vec<SubIndex>,
    layout: Option<PartitionLayout>,
    internal_offset_to_most_external_id: Vec<u32>,
    // train-to-add carryover
    combined_groups: Vec<Vec<usize>>,
    tmp_quant: Vec<Option<Box<dyn VectorStorage>>>,
}

impl IndexNode {
    pub fn new(kind: IndexKind, data_format: DataFormat) -> Self {
        Self {
            kind,
            data_format,
            indexes: Vec::new(),
            layout: None,
            internal_offset_to_most_external_id: Vec::new(),
            combined_groups: Vec::new(),
            tmp_quant: Vec::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    #[must_use]
    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    /// Total indexed rows, or -1 when no index is loaded.
    #[must_use]
    pub fn count(&self) -> i64 {
        if self.indexes.is_empty() {
            -1
        } else {
            self.indexes.iter().map(|s| s.ntotal() as i64).sum()
        }
    }

    /// Vector dimensionality, or -1 when no index is loaded.
    #[must_use]
    pub fn dim(&self) -> i64 {
        match self.indexes.first() {
            Some(s) => s.hnsw().dim() as i64,
            None => -1,
        }
    }

    /// Serialized size estimate in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        let mut counter = CountingWriter(0);
        for sub in &self.indexes {
            let _ = sub.write(&mut counter, self.kind);
        }
        counter.0
    }

    fn check_populated(&self) -> Result<()> {
        if self.indexes.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        for sub in &self.indexes {
            if sub.ntotal() == 0 {
                return Err(IndexError::IndexNotTrained);
            }
        }
        Ok(())
    }

    /// True when the original-format rows can be reconstructed exactly.
    #[must_use]
    pub fn has_raw_data(&self) -> bool {
        !self.indexes.is_empty() && self.reconstruct_source(0).is_some()
    }

    fn reconstruct_source(&self, i: usize) -> Option<&dyn VectorStorage> {
        let sub = self.indexes.get(i)?;
        let storage: &dyn VectorStorage = match sub {
            SubIndex::Hnsw(h) => h.storage.as_ref(),
            SubIndex::Refine(r) => r.refine_storage.as_ref(),
        };
        (storage.raw_format() == Some(self.data_format)).then_some(storage)
    }

    /// Iterators decode through an fp32 working buffer; int8 rows are not
    /// supported there.
    #[must_use]
    pub fn is_ann_iterator_supported(&self) -> bool {
        self.data_format != DataFormat::Int8
    }

    // ------------------------------------------------------------------
    // build
    // ------------------------------------------------------------------

    pub fn train(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if !self.indexes.is_empty() {
            return Err(IndexError::IndexAlreadyTrained);
        }
        pool::run_build(cfg.num_build_thread, || self.train_internal(dataset, cfg))?
    }

    fn train_internal(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if dataset.format() != self.data_format {
            return Err(IndexError::InvalidArgs(
                "dataset format does not match the node's data format".to_string(),
            ));
        }
        let metric = cfg.metric()?;
        let rows = dataset.rows();
        let dim = dataset.dim();

        if matches!(self.kind, IndexKind::Pq | IndexKind::Prq) {
            let need = 1usize << cfg.nbits();
            if rows < need {
                return Err(IndexError::Inner(format!(
                    "{rows} rows not enough, needs at least {need} rows"
                )));
            }
        }

        let scalar_info = match dataset.scalar_info() {
            Some(map) if map.len() > 1 => {
                warn!("vector index build with multiple scalar info is not supported");
                return Err(IndexError::InvalidArgs(
                    "vector index build with multiple scalar info is not supported".to_string(),
                ));
            }
            Some(map) => map.values().next(),
            None => None,
        };

        let base_rows = match self.kind {
            IndexKind::Flat | IndexKind::Sq => 128,
            IndexKind::Pq | IndexKind::Prq => 1usize << cfg.nbits(),
        };
        let groups = match scalar_info {
            Some(info) if info.len() > 1 => combine_partitions(info, base_rows),
            _ => Vec::new(),
        };

        let info = match scalar_info {
            Some(info) if groups.len() > 1 => info,
            _ => {
                // single partition over the whole dataset
                info!("training index on {rows} rows");
                let mut train_data = vec![0.0f32; rows * dim];
                convert_rows_to_fp32(dataset.tensor(), &mut train_data, 0, rows, dim)?;
                let sub = self.make_sub_index(metric, dim, cfg, &train_data, rows)?;
                self.indexes.push(sub);
                self.combined_groups = Vec::new();
                return Ok(());
            }
        };

        info!("training index with scalar info, {} partitions", groups.len());
        let layout = PartitionLayout::from_groups(&groups, info);
        for (p, group) in groups.iter().enumerate() {
            let partition_rows: usize = group.iter().map(|&b| info[b].len()).sum();
            let mut train_data = vec![0.0f32; partition_rows * dim];
            let mut filled = 0usize;
            for &bucket in group {
                let span = info[bucket].len() * dim;
                gather_rows_to_fp32(
                    dataset.tensor(),
                    &mut train_data[filled..filled + span],
                    &info[bucket],
                    dim,
                )?;
                filled += span;
            }
            info!("training partition {p} on {partition_rows} rows");
            let sub = self.make_sub_index(metric, dim, cfg, &train_data, partition_rows)?;
            self.indexes.push(sub);
        }
        self.layout = Some(layout);
        self.combined_groups = groups;
        Ok(())
    }

    /// Create one sub-index; for PQ/PRQ also train the quantizer that will
    /// be spliced in after add.
    fn make_sub_index(
        &mut self,
        metric: MetricType,
        dim: usize,
        cfg: &IndexConfig,
        train_data: &[f32],
        train_rows: usize,
    ) -> Result<SubIndex> {
        let m = cfg.graph_m();
        let efc = cfg.graph_ef_construction();

        let storage: Box<dyn VectorStorage> = match self.kind {
            IndexKind::Flat => match self.data_format {
                DataFormat::Fp32 => Box::new(FlatStorage::new(dim, metric)),
                DataFormat::Fp16 => {
                    Box::new(ScalarQuantStorage::new(dim, metric, SqType::Fp16))
                }
                DataFormat::Bf16 => {
                    Box::new(ScalarQuantStorage::new(dim, metric, SqType::Bf16))
                }
                DataFormat::Int8 => Box::new(ScalarQuantStorage::new(
                    dim,
                    metric,
                    SqType::Int8DirectSigned,
                )),
            },
            IndexKind::Sq => {
                let qtype = SqType::parse(cfg.sq_type.as_deref().ok_or_else(|| {
                    IndexError::InvalidArgs("sq_type parameter is missing".to_string())
                })?)?;
                Box::new(ScalarQuantStorage::new(dim, metric, qtype))
            }
            // graph trains over flat rows; the quantizer storage is
            // trained on the side and spliced in at the end of add
            IndexKind::Pq | IndexKind::Prq => Box::new(FlatStorage::new(dim, metric)),
        };

        match self.kind {
            IndexKind::Pq => {
                let pq_m = cfg.pq_m.ok_or_else(|| {
                    IndexError::InvalidArgs("m parameter is missing for pq".to_string())
                })?;
                let mut quant = PqStorage::new(dim, metric, pq_m, cfg.nbits())?;
                info!("training product quantizer");
                quant.train(train_data, train_rows)?;
                self.tmp_quant.push(Some(Box::new(quant)));
            }
            IndexKind::Prq => {
                let pq_m = cfg.pq_m.ok_or_else(|| {
                    IndexError::InvalidArgs("m parameter is missing for prq".to_string())
                })?;
                let nrq = cfg.nrq.ok_or_else(|| {
                    IndexError::InvalidArgs("nrq parameter is missing for prq".to_string())
                })?;
                let mut quant = PrqStorage::new(dim, metric, pq_m, nrq, cfg.nbits())?;
                info!("training product residual quantizer");
                quant.train(train_data, train_rows)?;
                self.tmp_quant.push(Some(Box::new(quant)));
            }
            IndexKind::Flat | IndexKind::Sq => {}
        }

        let mut hnsw = HnswIndex::new(storage, m, efc);
        hnsw.train(train_rows, train_data)?;

        if cfg.refine_enabled() {
            let refine_storage = make_refine_storage(
                cfg.refine_type.as_deref().unwrap_or_default(),
                dim,
                metric,
            )?;
            Ok(SubIndex::Refine(RefineIndex::new(hnsw, refine_storage)))
        } else {
            Ok(SubIndex::Hnsw(hnsw))
        }
    }

    pub fn add(&mut self, dataset: &Dataset, cfg: &IndexConfig) -> Result<()> {
        if self.indexes.is_empty() {
            warn!("can not add data to an empty index");
            return Err(IndexError::EmptyIndex);
        }
        pool::run_build(cfg.num_build_thread, || self.add_internal(dataset))?
    }

    fn add_internal(&mut self, dataset: &Dataset) -> Result<()> {
        let rows = dataset.rows();
        let dim = dataset.dim();

        let scalar_info = match dataset.scalar_info() {
            Some(map) if map.len() > 1 => {
                warn!("vector index build with multiple scalar info is not supported");
                return Err(IndexError::InvalidArgs(
                    "vector index build with multiple scalar info is not supported".to_string(),
                ));
            }
            Some(map) => map.values().next(),
            None => None,
        };

        let info = match scalar_info {
            Some(info) if self.combined_groups.len() > 1 => info,
            _ => {
                info!("adding {rows} rows");
                let mut chunk = vec![0.0f32; ADD_CHUNK_ROWS.min(rows.max(1)) * dim];
                let mut row = 0;
                while row < rows {
                    let n = ADD_CHUNK_ROWS.min(rows - row);
                    convert_rows_to_fp32(dataset.tensor(), &mut chunk[..n * dim], row, n, dim)?;
                    self.indexes[0].add(&chunk[..n * dim], n)?;
                    if let Some(q) = self.tmp_quant.get_mut(0).and_then(Option::as_mut) {
                        q.add(&chunk[..n * dim], n)?;
                    }
                    row += n;
                }
                self.finalize_partition(0)?;
                return Ok(());
            }
        };
        let groups = self.combined_groups.clone();
        for (p, group) in groups.iter().enumerate() {
            for &bucket in group {
                let ids = &info[bucket];
                info!("adding {} rows to partition {p}", ids.len());
                let mut buf = vec![0.0f32; ids.len() * dim];
                gather_rows_to_fp32(dataset.tensor(), &mut buf, ids, dim)?;
                self.indexes[p].add(&buf, ids.len())?;
                if let Some(q) = self.tmp_quant.get_mut(p).and_then(Option::as_mut) {
                    q.add(&buf, ids.len())?;
                }
            }
            self.finalize_partition(p)?;
        }

        if let Some(layout) = &self.layout {
            for (p, sub) in self.indexes.iter().enumerate() {
                debug_assert_eq!(sub.ntotal(), layout.labels[p].len());
            }
        }
        Ok(())
    }

    /// Splice the trained quantizer storage into partition `p`'s graph,
    /// dropping the flat rows the graph was built on.
    fn finalize_partition(&mut self, p: usize) -> Result<()> {
        if let Some(slot) = self.tmp_quant.get_mut(p) {
            if let Some(quant) = slot.take() {
                self.indexes[p].hnsw_mut().replace_storage(quant)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // query
    // ------------------------------------------------------------------

    /// Attach the most-external id map if one was published.
    fn effective_bitset<'a>(&'a self, bitset: BitsetView<'a>) -> BitsetView<'a> {
        if self.internal_offset_to_most_external_id.is_empty() || bitset.is_empty() {
            bitset
        } else {
            let map = &self.internal_offset_to_most_external_id;
            bitset.with_out_ids(map, map.len(), bitset.count())
        }
    }

    fn select_partition(&self, bitset: &BitsetView<'_>) -> Result<usize> {
        if self.indexes.len() == 1 {
            return Ok(0);
        }
        let layout = self
            .layout
            .as_ref()
            .ok_or_else(|| IndexError::InvalidIndexError("partition layout missing".to_string()))?;
        layout.select_partition(bitset)
    }

    /// Narrow a full-index bitset to one partition's local offsets.
    fn narrow_bitset<'a>(&'a self, bitset: BitsetView<'a>, index_id: usize) -> BitsetView<'a> {
        if self.indexes.len() <= 1 || bitset.is_empty() {
            return bitset;
        }
        let Some(layout) = self.layout.as_ref() else {
            return bitset;
        };
        let labels = &layout.labels[index_id];
        let num_mv = labels.len();
        let passing = bitset.size().saturating_sub(bitset.count());
        let filtered_out = num_mv.saturating_sub(passing);
        if bitset.has_out_ids() {
            let map = &self.internal_offset_to_most_external_id;
            bitset
                .with_out_ids(map, num_mv, filtered_out)
                .with_id_offset(layout.index_rows_sum[index_id] as usize)
        } else {
            bitset.with_out_ids(labels, num_mv, filtered_out)
        }
    }

    fn remap_labels(&self, index_id: usize, ids: &mut [i64]) {
        if let Some(layout) = &self.layout {
            for id in ids {
                if *id >= 0 {
                    *id = layout.labels[index_id][*id as usize] as i64;
                }
            }
        }
    }

    pub fn search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        self.check_populated()?;
        let rows = dataset.rows();
        let dim = dataset.dim();

        let bitset = self.effective_bitset(bitset);
        let index_id = self.select_partition(&bitset)?;
        let bitset = self.narrow_bitset(bitset, index_id);
        let sub = &self.indexes[index_id];

        let trace_visit = cfg.trace_visit.unwrap_or(false);
        if trace_visit && rows != 1 {
            return Err(IndexError::InvalidArgs(
                "a single query vector is required".to_string(),
            ));
        }

        let Some(whether_bf) = should_brute_force_knn(cfg.k, &bitset, sub.ntotal()) else {
            return Err(IndexError::InvalidArgs("k parameter is missing".to_string()));
        };
        let k = cfg.k.unwrap_or_default();
        let ef = cfg.search_ef(k);
        let k_alpha = bitset.filter_ratio() * 0.7;
        let initial_alpha = initial_accumulated_alpha(&bitset, sub.ntotal());
        let refine_k = match sub {
            SubIndex::Refine(_) => cfg.refine_k,
            SubIndex::Hnsw(_) => None,
        };
        let passing = if bitset.is_empty() {
            sub.ntotal()
        } else {
            bitset.size().saturating_sub(bitset.count())
        };

        let per_query = |qi: usize| -> Result<(Vec<i64>, Vec<f32>)> {
            let mut query = vec![0.0f32; dim];
            convert_rows_to_fp32(dataset.tensor(), &mut query, qi, 1, dim)?;

            let (mut ids, dists) = if whether_bf {
                sub.knn_bruteforce(&query, k, &bitset, refine_k)?
            } else {
                let found = sub.knn(&query, k, ef, &bitset, k_alpha, initial_alpha, refine_k)?;
                let real_topk = found.0.iter().filter(|&&i| i >= 0).count();
                if real_topk < k && real_topk < passing {
                    sub.knn_bruteforce(&query, k, &bitset, refine_k)?
                } else {
                    found
                }
            };
            self.remap_labels(index_id, &mut ids);
            Ok((ids, dists))
        };

        let per_query_results: Result<Vec<(Vec<i64>, Vec<f32>)>> =
            pool::search_pool()?.install(|| (0..rows).into_par_iter().map(per_query).collect());
        let per_query_results = per_query_results?;

        let mut ids = Vec::with_capacity(rows * k);
        let mut distances = Vec::with_capacity(rows * k);
        for (q_ids, q_dists) in per_query_results {
            ids.extend(q_ids);
            distances.extend(q_dists);
        }

        let trace = if trace_visit {
            let mut query = vec![0.0f32; dim];
            convert_rows_to_fp32(dataset.tensor(), &mut query, 0, 1, dim)?;
            let (_, examined) = sub.hnsw().search_level0_traced(
                &query,
                ef,
                &bitset,
                k_alpha,
                initial_alpha,
                true,
            )?;
            let mut visited: Vec<i64> = examined.iter().map(|n| n.id as i64).collect();
            self.remap_labels(index_id, &mut visited);
            Some(visited)
        } else {
            None
        };

        Ok(SearchResult {
            nq: rows,
            k,
            ids,
            distances,
            trace,
        })
    }

    pub fn range_search(
        &self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchOutput> {
        self.check_populated()?;
        let rows = dataset.rows();
        let dim = dataset.dim();

        let radius = cfg
            .radius
            .ok_or_else(|| IndexError::InvalidArgs("radius parameter is missing".to_string()))?;
        let range_filter = cfg.range_filter;

        let bitset = self.effective_bitset(bitset);
        let index_id = self.select_partition(&bitset)?;
        let bitset = self.narrow_bitset(bitset, index_id);
        let sub = &self.indexes[index_id];

        let Some(whether_bf) = should_brute_force_range(cfg.ef, &bitset, sub.ntotal()) else {
            return Err(IndexError::InvalidArgs("ef parameter is missing".to_string()));
        };
        let ef = cfg.ef.unwrap_or_default();
        let k_alpha = bitset.filter_ratio() * 0.7;
        let initial_alpha = initial_accumulated_alpha(&bitset, sub.ntotal());
        let similarity = sub.metric().is_similarity();
        let use_iterator = self.is_ann_iterator_supported();

        let per_query = |qi: usize| -> Result<(Vec<i64>, Vec<f32>)> {
            let mut query = vec![0.0f32; dim];
            convert_rows_to_fp32(dataset.tensor(), &mut query, qi, 1, dim)?;

            if whether_bf {
                let storage = sub.hnsw().storage.as_ref();
                let (mut ids, dists) =
                    brute_force_range(storage, &query, radius, range_filter, &bitset);
                self.remap_labels(index_id, &mut ids);
                return Ok((ids, dists));
            }

            if use_iterator {
                // iterator-based range: drain in best-first order until the
                // radius boundary is crossed
                let mut it = self.make_iterator(index_id, query, bitset, ef, cfg)?;
                let mut ids = Vec::new();
                let mut dists = Vec::new();
                let cap = sub.ntotal();
                while let Some((id, d)) = it.next() {
                    if !within_range(d, radius, None, similarity) {
                        break;
                    }
                    if within_range(d, radius, range_filter, similarity) {
                        ids.push(id);
                        dists.push(d);
                    }
                    if ids.len() >= cap {
                        break;
                    }
                }
                return Ok((ids, dists));
            }

            let (mut ids, dists) = match sub {
                SubIndex::Hnsw(h) => h.range_search(
                    &query,
                    radius,
                    range_filter,
                    ef,
                    &bitset,
                    k_alpha,
                    initial_alpha,
                )?,
                SubIndex::Refine(r) => r.range_search(
                    &query,
                    radius,
                    range_filter,
                    ef,
                    &bitset,
                    k_alpha,
                    initial_alpha,
                )?,
            };
            self.remap_labels(index_id, &mut ids);
            Ok((ids, dists))
        };

        let per_query_results: Result<Vec<(Vec<i64>, Vec<f32>)>> =
            pool::search_pool()?.install(|| (0..rows).into_par_iter().map(per_query).collect());
        Ok(RangeSearchOutput::from_per_query(per_query_results?))
    }

    /// One iterator per query row.
    pub fn ann_iterator<'a>(
        &'a self,
        dataset: &Dataset,
        cfg: &IndexConfig,
        bitset: BitsetView<'a>,
    ) -> Result<Vec<AnnIterator<'a>>> {
        if self.indexes.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if !self.is_ann_iterator_supported() {
            return Err(IndexError::InvalidArgs(
                "unsupported data format".to_string(),
            ));
        }
        let rows = dataset.rows();
        let dim = dataset.dim();

        let bitset = self.effective_bitset(bitset);
        let index_id = self.select_partition(&bitset)?;
        let bitset = self.narrow_bitset(bitset, index_id);
        let ef = cfg.ef.unwrap_or(ITERATOR_SEED_EF);

        let mut iterators = Vec::with_capacity(rows);
        for qi in 0..rows {
            let mut query = vec![0.0f32; dim];
            convert_rows_to_fp32(dataset.tensor(), &mut query, qi, 1, dim)?;
            iterators.push(self.make_iterator(index_id, query, bitset, ef, cfg)?);
        }
        Ok(iterators)
    }

    fn make_iterator<'a>(
        &'a self,
        index_id: usize,
        query: Vec<f32>,
        bitset: BitsetView<'a>,
        ef: usize,
        cfg: &IndexConfig,
    ) -> Result<AnnIterator<'a>> {
        let sub = &self.indexes[index_id];
        let larger_is_closer = sub.metric().is_similarity();

        let refine_ratio = match sub {
            SubIndex::Refine(_) => cfg
                .iterator_refine_ratio
                .unwrap_or(DEFAULT_ITERATOR_REFINE_RATIO),
            SubIndex::Hnsw(_) => 0.0,
        };
        let qdis_refine = match sub {
            SubIndex::Refine(r) if refine_ratio > 0.0 => Some(r.refine_computer()),
            _ => None,
        };

        let (labels, l2io, base) = match &self.layout {
            Some(layout) => (
                Some(layout.labels[index_id].as_slice()),
                layout.label_to_internal_offset.as_slice(),
                layout.index_rows_sum[index_id],
            ),
            None => (None, &[] as &[u32], 0),
        };

        Ok(AnnIterator::new(
            sub.hnsw(),
            labels,
            query,
            bitset,
            ef,
            larger_is_closer,
            qdis_refine,
            l2io,
            base,
        ))
    }

    /// Exact distances from each query row to the listed external ids,
    /// within the partition the bitset selects.
    pub fn calc_dist_by_ids(
        &self,
        dataset: &Dataset,
        bitset: BitsetView<'_>,
        ids: &[i64],
    ) -> Result<Vec<f32>> {
        self.check_populated()?;
        let rows = dataset.rows();
        let dim = dataset.dim();

        let bitset = self.effective_bitset(bitset);
        let index_id = self.select_partition(&bitset)?;
        let sub = &self.indexes[index_id];

        let per_query = |qi: usize| -> Result<Vec<f32>> {
            let mut query = vec![0.0f32; dim];
            convert_rows_to_fp32(dataset.tensor(), &mut query, qi, 1, dim)?;
            let mut dc = match sub {
                SubIndex::Hnsw(h) => h.storage.distance_computer(),
                SubIndex::Refine(r) => r.refine_computer(),
            };
            dc.set_query(&query);
            let mut out = Vec::with_capacity(ids.len());
            for &label in ids {
                let local = match &self.layout {
                    Some(layout) if self.indexes.len() > 1 => {
                        let global = *layout
                            .label_to_internal_offset
                            .get(label as usize)
                            .ok_or_else(|| {
                                IndexError::InvalidArgs(format!("label {label} outside the index"))
                            })?;
                        global - layout.index_rows_sum[index_id]
                    }
                    _ => label as u32,
                };
                out.push(dc.distance(local));
            }
            Ok(out)
        };

        let per_query_results: Result<Vec<Vec<f32>>> =
            pool::search_pool()?.install(|| (0..rows).into_par_iter().map(per_query).collect());
        Ok(per_query_results?.into_iter().flatten().collect())
    }

    /// Reconstruct original-format rows by external id.
    pub fn get_vector_by_ids(&self, ids: &[i64]) -> Result<Dataset> {
        if self.indexes.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        let mut sources = Vec::with_capacity(self.indexes.len());
        for i in 0..self.indexes.len() {
            sources.push(self.reconstruct_source(i).ok_or_else(|| {
                IndexError::InvalidIndexError(
                    "the index does not contain raw data, cannot reconstruct vectors".to_string(),
                )
            })?);
        }

        let dim = self.dim() as usize;
        let count = self.count();
        let mut out = VectorData::zeros(self.data_format, ids.len() * dim);
        let mut tmp = vec![0.0f32; dim];
        for (i, &id) in ids.iter().enumerate() {
            if id < 0 || id >= count {
                return Err(IndexError::InvalidArgs(format!(
                    "id {id} outside the index"
                )));
            }
            let (source, local) = match &self.layout {
                Some(layout) if self.indexes.len() > 1 => {
                    let global = layout.label_to_internal_offset[id as usize];
                    let p = layout.partition_of_offset(global).ok_or_else(|| {
                        IndexError::InvalidIndexError(format!(
                            "no partition contains offset {global}"
                        ))
                    })?;
                    (sources[p], global - layout.index_rows_sum[p])
                }
                _ => (sources[0], id as u32),
            };
            source.reconstruct(local, &mut tmp)?;
            convert_rows_from_fp32(&tmp, &mut out, i, 1, dim)?;
        }
        Dataset::new(ids.len(), dim, out)
    }

    // ------------------------------------------------------------------
    // id maps
    // ------------------------------------------------------------------

    /// Global internal offset -> external label. Identity for a single
    /// partition; the concatenated label tables otherwise.
    #[must_use]
    pub fn internal_id_to_external_id_map(&self) -> Vec<u32> {
        match &self.layout {
            Some(layout) if self.indexes.len() > 1 => {
                let mut map = Vec::with_capacity(layout.total_rows());
                for labels in &layout.labels {
                    map.extend_from_slice(labels);
                }
                map
            }
            _ => (0..self.count().max(0) as u32).collect(),
        }
    }

    /// Install the offset -> most-external-id map used when the filter
    /// bitmap is built over a higher-level id space than labels.
    pub fn set_internal_id_to_most_external_id_map(&mut self, map: Vec<u32>) {
        self.internal_offset_to_most_external_id = map;
    }

    // ------------------------------------------------------------------
    // serialization
    // ------------------------------------------------------------------

    pub fn serialize(&self, w: &mut dyn Write) -> Result<()> {
        if self.indexes.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if self.indexes.len() > 1 {
            let layout = self
                .layout
                .as_ref()
                .ok_or_else(|| IndexError::InvalidIndexError("partition layout missing".to_string()))?;
            io::write_mv(w)?;
            layout.write_header(w, self.indexes.len() as u32)?;
            for sub in &self.indexes {
                sub.write(w, self.kind)?;
            }
        } else {
            self.indexes[0].write(w, self.kind)?;
        }
        Ok(())
    }

    pub fn deserialize(&mut self, r: &mut dyn Read) -> Result<()> {
        let fourcc = io::read_fourcc(r)?;
        if fourcc == io::FOURCC_MV {
            info!("loading partitioned index");
            let (size, layout) = PartitionLayout::read_header(r)?;
            info!("read {size} partitions");
            let mut indexes = Vec::with_capacity(size as usize);
            let mut kind = self.kind;
            for _ in 0..size {
                let sub_fourcc = io::read_fourcc(r)?;
                let (sub, k) = SubIndex::read(r, sub_fourcc)?;
                kind = k;
                indexes.push(sub);
            }
            self.indexes = indexes;
            self.layout = Some(layout);
            self.kind = kind;
        } else {
            let (sub, kind) = SubIndex::read(r, fourcc)?;
            self.indexes = vec![sub];
            self.layout = None;
            self.kind = kind;
        }
        self.combined_groups = Vec::new();
        self.tmp_quant = Vec::new();
        Ok(())
    }

    /// Load from a file, memory-mapping it when the config asks for that.
    pub fn deserialize_from_file(&mut self, path: &Path, cfg: &IndexConfig) -> Result<()> {
        let source = if cfg.enable_mmap.unwrap_or(false) {
            IndexSource::from_file_mmap(path)?
        } else {
            IndexSource::from_file(path)?
        };
        let mut reader = source.reader();
        self.deserialize(&mut reader)
    }
}

/// Refine storage for a given refine type. Cosine nodes keep raw rows and
/// score with plain dot products; the rerank stage re-applies the norms.
fn make_refine_storage(
    refine_type: &str,
    dim: usize,
    metric: MetricType,
) -> Result<Box<dyn VectorStorage>> {
    let storage_metric = if metric == MetricType::Cosine {
        MetricType::Ip
    } else {
        metric
    };
    match refine_type.to_ascii_uppercase().as_str() {
        "FP32" | "FLAT" => Ok(Box::new(FlatStorage::new(dim, storage_metric))),
        "FP16" => Ok(Box::new(ScalarQuantStorage::new(
            dim,
            storage_metric,
            SqType::Fp16,
        ))),
        "BF16" => Ok(Box::new(ScalarQuantStorage::new(
            dim,
            storage_metric,
            SqType::Bf16,
        ))),
        other => Err(IndexError::InvalidArgs(format!(
            "invalid refine type: {other}"
        ))),
    }
}
