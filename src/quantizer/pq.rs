//! Product quantization.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::dataformat::DataFormat;
use crate::error::{IndexError, Result};
use crate::io;
use crate::metric::MetricType;
use crate::quantizer::kmeans::KMeans;
use crate::simd;
use crate::storage::{DistanceComputer, VectorStorage, STORAGE_KIND_PQ};

/// Product quantizer: `m` subspaces, `2^nbits` codewords each.
///
/// Codes are stored one byte per subspace, which caps `nbits` at 8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dim: usize,
    m: usize,
    nbits: usize,
    dsub: usize,
    // [subspace][codeword][dsub]
    codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    pub fn new(dim: usize, m: usize, nbits: usize) -> Result<Self> {
        if dim == 0 || m == 0 || nbits == 0 || nbits > 8 {
            return Err(IndexError::InvalidArgs(
                "pq requires dim > 0, m > 0 and 0 < nbits <= 8".to_string(),
            ));
        }
        if dim % m != 0 {
            return Err(IndexError::InvalidArgs(format!(
                "dimension {dim} must be divisible by m {m}"
            )));
        }
        Ok(Self {
            dim,
            m,
            nbits,
            dsub: dim / m,
            codebooks: Vec::new(),
        })
    }

    #[must_use]
    pub fn m(&self) -> usize {
        self.m
    }

    #[must_use]
    pub fn ksub(&self) -> usize {
        1 << self.nbits
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    /// Train one codebook per subspace.
    pub fn train(&mut self, vectors: &[f32], n: usize) -> Result<()> {
        let ksub = self.ksub();
        if n < ksub {
            return Err(IndexError::Inner(format!(
                "{n} rows not enough, needs at least {ksub} rows"
            )));
        }
        self.codebooks = Vec::with_capacity(self.m);
        let mut subvectors = vec![0.0f32; n * self.dsub];
        for s in 0..self.m {
            let start = s * self.dsub;
            for i in 0..n {
                subvectors[i * self.dsub..(i + 1) * self.dsub]
                    .copy_from_slice(&vectors[i * self.dim + start..i * self.dim + start + self.dsub]);
            }
            let mut km = KMeans::new(self.dsub, ksub)?.with_seed(0xC0DE_B00C ^ s as u64);
            km.fit(&subvectors, n)?;
            self.codebooks.push(km.centroids().to_vec());
        }
        Ok(())
    }

    /// Encode one vector into `m` codes.
    pub fn encode(&self, vector: &[f32], codes: &mut [u8]) {
        for s in 0..self.m {
            let sub = &vector[s * self.dsub..(s + 1) * self.dsub];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for (k, codeword) in self.codebooks[s].iter().enumerate() {
                let d = simd::l2_sqr(sub, codeword);
                if d < best_dist {
                    best_dist = d;
                    best = k;
                }
            }
            codes[s] = best as u8;
        }
    }

    /// Decode `m` codes back into a vector.
    pub fn decode(&self, codes: &[u8], out: &mut [f32]) {
        for s in 0..self.m {
            out[s * self.dsub..(s + 1) * self.dsub]
                .copy_from_slice(&self.codebooks[s][codes[s] as usize]);
        }
    }

    /// Per-subspace squared-L2 lookup table for a query, flattened as
    /// `[subspace * ksub + codeword]`.
    pub fn l2_table(&self, query: &[f32]) -> Vec<f32> {
        let ksub = self.ksub();
        let mut table = Vec::with_capacity(self.m * ksub);
        for s in 0..self.m {
            let sub = &query[s * self.dsub..(s + 1) * self.dsub];
            for codeword in &self.codebooks[s] {
                table.push(simd::l2_sqr(sub, codeword));
            }
        }
        table
    }

    /// Per-subspace dot-product lookup table for a query.
    pub fn dot_table(&self, query: &[f32]) -> Vec<f32> {
        let ksub = self.ksub();
        let mut table = Vec::with_capacity(self.m * ksub);
        for s in 0..self.m {
            let sub = &query[s * self.dsub..(s + 1) * self.dsub];
            for codeword in &self.codebooks[s] {
                table.push(simd::dot(sub, codeword));
            }
        }
        table
    }

    /// Sum a lookup table over one code row.
    #[inline]
    pub fn lookup(&self, table: &[f32], codes: &[u8]) -> f32 {
        let ksub = self.ksub();
        codes
            .iter()
            .enumerate()
            .map(|(s, &c)| table[s * ksub + c as usize])
            .sum()
    }

    fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        io::write_u32(w, self.dim as u32)?;
        io::write_u32(w, self.m as u32)?;
        io::write_u32(w, self.nbits as u32)?;
        for s in &self.codebooks {
            for c in s {
                io::write_vec_f32(w, c)?;
            }
        }
        Ok(())
    }

    fn read(r: &mut dyn Read) -> Result<Self> {
        let dim = io::read_u32(r)? as usize;
        let m = io::read_u32(r)? as usize;
        let nbits = io::read_u32(r)? as usize;
        let mut pq = Self::new(dim, m, nbits)?;
        let ksub = pq.ksub();
        pq.codebooks = Vec::with_capacity(m);
        for _ in 0..m {
            let mut book = Vec::with_capacity(ksub);
            for _ in 0..ksub {
                book.push(io::read_vec_f32(r)?);
            }
            pq.codebooks.push(book);
        }
        Ok(pq)
    }
}

/// Vector storage over packed PQ codes.
pub struct PqStorage {
    pq: ProductQuantizer,
    metric: MetricType,
    codes: Vec<u8>,
    inv_norms: Vec<f32>,
    ntotal: usize,
}

impl PqStorage {
    pub fn new(dim: usize, metric: MetricType, m: usize, nbits: usize) -> Result<Self> {
        Ok(Self {
            pq: ProductQuantizer::new(dim, m, nbits)?,
            metric,
            codes: Vec::new(),
            inv_norms: Vec::new(),
            ntotal: 0,
        })
    }

    /// Train the codebooks. Must happen before any `add`.
    pub fn train(&mut self, vectors: &[f32], n: usize) -> Result<()> {
        self.pq.train(vectors, n)
    }

    pub fn is_trained(&self) -> bool {
        self.pq.is_trained()
    }

    fn code_row(&self, id: u32) -> &[u8] {
        let m = self.pq.m();
        &self.codes[id as usize * m..(id as usize + 1) * m]
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let metric = MetricType::read(r)?;
        let pq = ProductQuantizer::read(r)?;
        let codes = io::read_vec_u8(r)?;
        let inv_norms = io::read_vec_f32(r)?;
        let ntotal = io::read_u64(r)? as usize;
        Ok(Self {
            pq,
            metric,
            codes,
            inv_norms,
            ntotal,
        })
    }
}

impl VectorStorage for PqStorage {
    fn ntotal(&self) -> usize {
        self.ntotal
    }

    fn dim(&self) -> usize {
        self.pq.dim
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        if !self.pq.is_trained() {
            return Err(IndexError::IndexNotTrained);
        }
        let dim = self.pq.dim;
        let m = self.pq.m();
        let old_len = self.codes.len();
        self.codes.resize(old_len + n * m, 0);
        for i in 0..n {
            let row = &rows[i * dim..(i + 1) * dim];
            let codes = &mut self.codes[old_len + i * m..old_len + (i + 1) * m];
            self.pq.encode(row, codes);
            if self.metric == MetricType::Cosine {
                self.inv_norms.push(simd::inverse_norm(row));
            }
        }
        self.ntotal += n;
        Ok(())
    }

    fn reconstruct(&self, id: u32, out: &mut [f32]) -> Result<()> {
        self.pq.decode(self.code_row(id), out);
        Ok(())
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + '_> {
        Box::new(PqComputer {
            storage: self,
            table: Vec::new(),
            q_inv: 0.0,
            scratch: vec![0.0; self.pq.dim],
            scratch2: vec![0.0; self.pq.dim],
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
        None
    }

    fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(&[STORAGE_KIND_PQ])?;
        self.metric.write(w)?;
        self.pq.write(w)?;
        io::write_vec_u8(w, &self.codes)?;
        io::write_vec_f32(w, &self.inv_norms)?;
        io::write_u64(w, self.ntotal as u64)
    }
}

/// ADC distance computer: one table build per query, then a table-lookup sum
/// per candidate.
struct PqComputer<'a> {
    storage: &'a PqStorage,
    table: Vec<f32>,
    q_inv: f32,
    scratch: Vec<f32>,
    scratch2: Vec<f32>,
}

impl DistanceComputer for PqComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        match self.storage.metric {
            MetricType::L2 => self.table = self.storage.pq.l2_table(query),
            MetricType::Ip => self.table = self.storage.pq.dot_table(query),
            MetricType::Cosine => {
                self.table = self.storage.pq.dot_table(query);
                self.q_inv = simd::inverse_norm(query);
            }
        }
    }

    fn distance(&mut self, id: u32) -> f32 {
        let sum = self.storage.pq.lookup(&self.table, self.storage.code_row(id));
        match self.storage.metric {
            MetricType::L2 | MetricType::Ip => sum,
            MetricType::Cosine => sum * self.q_inv * self.storage.inv_norms[id as usize],
        }
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        self.storage.pq.decode(self.storage.code_row(i), &mut self.scratch);
        self.storage.pq.decode(self.storage.code_row(j), &mut self.scratch2);
        match self.storage.metric {
            MetricType::L2 => simd::l2_sqr(&self.scratch, &self.scratch2),
            MetricType::Ip => simd::dot(&self.scratch, &self.scratch2),
            MetricType::Cosine => {
                simd::dot(&self.scratch, &self.scratch2)
                    * self.storage.inv_norms[i as usize]
                    * self.storage.inv_norms[j as usize]
            }
        }
    }
}
