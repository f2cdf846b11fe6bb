//! Build and query containers.
//!
//! A [`Dataset`] carries raw rows plus optional scalar-bucket info used for
//! partitioned builds. Result containers mirror the flat row-major layout the
//! callers expect: `k` ids and distances per query for top-k search, and
//! variable-length per-query lists with an offset table for range search.

use std::collections::HashMap;

use crate::dataformat::{DataFormat, VectorData};
use crate::error::{IndexError, Result};

/// Scalar bucket info: field id -> one row-id list per bucket value.
pub type ScalarInfo = HashMap<i64, Vec<Vec<u32>>>;

/// A dense dataset: `rows` vectors of `dim` elements in one raw format.
#[derive(Debug, Clone)]
pub struct Dataset {
    rows: usize,
    dim: usize,
    tensor: VectorData,
    scalar_info: Option<ScalarInfo>,
}

impl Dataset {
    /// Build a dataset from raw rows. Fails if the buffer length does not
    /// match `rows * dim`.
    pub fn new(rows: usize, dim: usize, tensor: VectorData) -> Result<Self> {
        if tensor.len() != rows * dim {
            return Err(IndexError::InvalidArgs(format!(
                "tensor holds {} elements, expected {} rows x {} dim",
                tensor.len(),
                rows,
                dim
            )));
        }
        Ok(Self {
            rows,
            dim,
            tensor,
            scalar_info: None,
        })
    }

    /// Convenience constructor for fp32 data.
    pub fn from_fp32(rows: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        Self::new(rows, dim, VectorData::Fp32(data))
    }

    /// Attach scalar bucket info for a partitioned build.
    #[must_use]
    pub fn with_scalar_info(mut self, info: ScalarInfo) -> Self {
        self.scalar_info = Some(info);
        self
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn tensor(&self) -> &VectorData {
        &self.tensor
    }

    #[must_use]
    pub fn format(&self) -> DataFormat {
        self.tensor.format()
    }

    #[must_use]
    pub fn scalar_info(&self) -> Option<&ScalarInfo> {
        self.scalar_info.as_ref()
    }
}

/// Top-k search output: row-major `k` ids and distances per query.
///
/// Missing slots (fewer than `k` survivors) hold id `-1`.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub nq: usize,
    pub k: usize,
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
    /// Visited-node trace of a single-query search, present only when the
    /// config asked for one.
    pub trace: Option<Vec<i64>>,
}

impl SearchResult {
    /// Ids of one query row.
    #[must_use]
    pub fn ids_for(&self, q: usize) -> &[i64] {
        &self.ids[q * self.k..(q + 1) * self.k]
    }

    /// Distances of one query row.
    #[must_use]
    pub fn distances_for(&self, q: usize) -> &[f32] {
        &self.distances[q * self.k..(q + 1) * self.k]
    }
}

/// Range search output: per-query variable-length lists.
///
/// `lims` has `nq + 1` entries; query `q` owns `ids[lims[q]..lims[q+1]]`.
#[derive(Debug, Clone)]
pub struct RangeSearchOutput {
    pub lims: Vec<usize>,
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
}

impl RangeSearchOutput {
    pub(crate) fn from_per_query(per_query: Vec<(Vec<i64>, Vec<f32>)>) -> Self {
        let mut lims = Vec::with_capacity(per_query.len() + 1);
        lims.push(0);
        let mut ids = Vec::new();
        let mut distances = Vec::new();
        for (q_ids, q_dists) in per_query {
            ids.extend(q_ids);
            distances.extend(q_dists);
            lims.push(ids.len());
        }
        Self {
            lims,
            ids,
            distances,
        }
    }

    /// Ids of one query row.
    #[must_use]
    pub fn ids_for(&self, q: usize) -> &[i64] {
        &self.ids[self.lims[q]..self.lims[q + 1]]
    }

    /// Distances of one query row.
    #[must_use]
    pub fn distances_for(&self, q: usize) -> &[f32] {
        &self.distances[self.lims[q]..self.lims[q + 1]]
    }
}
