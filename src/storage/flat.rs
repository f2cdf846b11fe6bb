//! Flat fp32 storage.
//!
//! Rows are kept verbatim, so reconstruction is exact. Under cosine the
//! stored rows are NOT renormalized; instead a per-row inverse L2 norm is
//! cached at add time and applied at distance time. Zero rows get an inverse
//! norm of 0.0 and therefore score zero similarity, sorting last.

use std::io::{Read, Write};

use crate::dataformat::DataFormat;
use crate::error::{IndexError, Result};
use crate::io;
use crate::metric::MetricType;
use crate::simd;
use crate::storage::{DistanceComputer, VectorStorage, STORAGE_KIND_FLAT};

#[derive(Debug, Clone)]
pub struct FlatStorage {
    dim: usize,
    metric: MetricType,
    data: Vec<f32>,
    inv_norms: Vec<f32>,
}

impl FlatStorage {
    pub fn new(dim: usize, metric: MetricType) -> Self {
        Self {
            dim,
            metric,
            data: Vec::new(),
            inv_norms: Vec::new(),
        }
    }

    #[inline]
    fn row(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dim;
        &self.data[start..start + self.dim]
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let metric = MetricType::read(r)?;
        let dim = io::read_u32(r)? as usize;
        let data = io::read_vec_f32(r)?;
        let inv_norms = io::read_vec_f32(r)?;
        Ok(Self {
            dim,
            metric,
            data,
            inv_norms,
        })
    }
}

impl VectorStorage for FlatStorage {
    fn ntotal(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        let take = n * self.dim;
        if rows.len() < take {
            return Err(IndexError::InvalidArgs(format!(
                "add of {n} rows needs {take} elements, got {}",
                rows.len()
            )));
        }
        self.data.extend_from_slice(&rows[..take]);
        if self.metric == MetricType::Cosine {
            for i in 0..n {
                self.inv_norms
                    .push(simd::inverse_norm(&rows[i * self.dim..(i + 1) * self.dim]));
            }
        }
        Ok(())
    }

    fn reconstruct(&self, id: u32, out: &mut [f32]) -> Result<()> {
        out[..self.dim].copy_from_slice(self.row(id));
        Ok(())
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + '_> {
        Box::new(FlatComputer {
            storage: self,
            query: Vec::new(),
            q_inv: 0.0,
        })
    }

    fn inverse_norms(&self) -> Option<&[f32]> {
        if self.metric == MetricType::Cosine {
            Some(&self.inv_norms)
        } else {
            None
        }
    }

    fn raw_format(&self) -> Option<DataFormat> {
        Some(DataFormat::Fp32)
    }

    fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(&[STORAGE_KIND_FLAT])?;
        self.metric.write(w)?;
        io::write_u32(w, self.dim as u32)?;
        io::write_vec_f32(w, &self.data)?;
        io::write_vec_f32(w, &self.inv_norms)
    }
}

struct FlatComputer<'a> {
    storage: &'a FlatStorage,
    query: Vec<f32>,
    q_inv: f32,
}

impl DistanceComputer for FlatComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
        if self.storage.metric == MetricType::Cosine {
            self.q_inv = simd::inverse_norm(query);
        }
    }

    fn distance(&mut self, id: u32) -> f32 {
        let row = self.storage.row(id);
        match self.storage.metric {
            MetricType::L2 => simd::l2_sqr(&self.query, row),
            MetricType::Ip => simd::dot(&self.query, row),
            MetricType::Cosine => {
                simd::dot(&self.query, row) * self.q_inv * self.storage.inv_norms[id as usize]
            }
        }
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        let a = self.storage.row(i);
        let b = self.storage.row(j);
        match self.storage.metric {
            MetricType::L2 => simd::l2_sqr(a, b),
            MetricType::Ip => simd::dot(a, b),
            MetricType::Cosine => {
                simd::dot(a, b)
                    * self.storage.inv_norms[i as usize]
                    * self.storage.inv_norms[j as usize]
            }
        }
    }
}
