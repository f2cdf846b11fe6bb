//! Product-residual quantization.
//!
//! Each vector is split into `m` subvectors; each split is encoded by a chain
//! of `nrq` residual codebooks (2^nbits codewords each). Stage `s` encodes
//! the residual left after subtracting the codewords picked by stages
//! `0..s`, so reconstruction error shrinks with every stage.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::dataformat::DataFormat;
use crate::error::{IndexError, Result};
use crate::io;
use crate::metric::MetricType;
use crate::quantizer::kmeans::KMeans;
use crate::simd;
use crate::storage::{DistanceComputer, VectorStorage, STORAGE_KIND_PRQ};

/// How query-to-code distances are evaluated at search time.
///
/// Dot products are linear over the summed codewords, so IP works from
/// lookup tables alone; L2 additionally needs the stored reconstruction
/// norm per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrqSearchType {
    /// Lookup tables only (inner product).
    LutNoNorm,
    /// Lookup tables plus a stored per-row squared norm (L2, cosine).
    NormFloat,
}

impl PrqSearchType {
    /// The type the given metric calls for.
    #[must_use]
    pub fn for_metric(metric: MetricType) -> Self {
        match metric {
            MetricType::Ip => PrqSearchType::LutNoNorm,
            MetricType::L2 | MetricType::Cosine => PrqSearchType::NormFloat,
        }
    }
}

/// Product-residual quantizer: `m` splits x `nrq` residual stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductResidualQuantizer {
    dim: usize,
    m: usize,
    nrq: usize,
    nbits: usize,
    dsub: usize,
    // [split][stage][codeword][dsub]
    codebooks: Vec<Vec<Vec<Vec<f32>>>>,
}

impl ProductResidualQuantizer {
    pub fn new(dim: usize, m: usize, nrq: usize, nbits: usize) -> Result<Self> {
        if dim == 0 || m == 0 || nrq == 0 || nbits == 0 || nbits > 8 {
            return Err(IndexError::InvalidArgs(
                "prq requires dim > 0, m > 0, nrq > 0 and 0 < nbits <= 8".to_string(),
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
            nrq,
            nbits,
            dsub: dim / m,
            codebooks: Vec::new(),
        })
    }

    #[must_use]
    pub fn ksub(&self) -> usize {
        1 << self.nbits
    }

    /// Codes per row.
    #[must_use]
    pub fn code_len(&self) -> usize {
        self.m * self.nrq
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    /// Train stage-wise residual codebooks per split.
    pub fn train(&mut self, vectors: &[f32], n: usize) -> Result<()> {
        let ksub = self.ksub();
        if n < ksub {
            return Err(IndexError::Inner(format!(
                "{n} rows not enough, needs at least {ksub} rows"
            )));
        }
        self.codebooks = Vec::with_capacity(self.m);
        let mut residuals = vec![0.0f32; n * self.dsub];
        for s in 0..self.m {
            let start = s * self.dsub;
            for i in 0..n {
                residuals[i * self.dsub..(i + 1) * self.dsub]
                    .copy_from_slice(&vectors[i * self.dim + start..i * self.dim + start + self.dsub]);
            }
            let mut stages = Vec::with_capacity(self.nrq);
            for stage in 0..self.nrq {
                let seed = 0x5EED_0000 ^ ((s as u64) << 8) ^ stage as u64;
                let mut km = KMeans::new(self.dsub, ksub)?.with_seed(seed);
                km.fit(&residuals, n)?;
                let book = km.centroids().to_vec();
                // subtract the assigned codeword, leaving the next residual
                for i in 0..n {
                    let r = &mut residuals[i * self.dsub..(i + 1) * self.dsub];
                    let mut best = 0usize;
                    let mut best_dist = f32::INFINITY;
                    for (k, c) in book.iter().enumerate() {
                        let d = simd::l2_sqr(r, c);
                        if d < best_dist {
                            best_dist = d;
                            best = k;
                        }
                    }
                    for (x, c) in r.iter_mut().zip(&book[best]) {
                        *x -= c;
                    }
                }
                stages.push(book);
            }
            self.codebooks.push(stages);
        }
        Ok(())
    }

    /// Encode one vector into `m * nrq` codes, split-major.
    pub fn encode(&self, vector: &[f32], codes: &mut [u8]) {
        let mut residual = vec![0.0f32; self.dsub];
        for s in 0..self.m {
            residual.copy_from_slice(&vector[s * self.dsub..(s + 1) * self.dsub]);
            for stage in 0..self.nrq {
                let book = &self.codebooks[s][stage];
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for (k, c) in book.iter().enumerate() {
                    let d = simd::l2_sqr(&residual, c);
                    if d < best_dist {
                        best_dist = d;
                        best = k;
                    }
                }
                codes[s * self.nrq + stage] = best as u8;
                for (x, c) in residual.iter_mut().zip(&book[best]) {
                    *x -= c;
                }
            }
        }
    }

    /// Decode codes back into a vector (sum of codewords per split).
    pub fn decode(&self, codes: &[u8], out: &mut [f32]) {
        for s in 0..self.m {
            let sub = &mut out[s * self.dsub..(s + 1) * self.dsub];
            sub.fill(0.0);
            for stage in 0..self.nrq {
                let c = &self.codebooks[s][stage][codes[s * self.nrq + stage] as usize];
                for (x, y) in sub.iter_mut().zip(c) {
                    *x += y;
                }
            }
        }
    }

    /// Dot-product lookup table, `[split * nrq + stage][codeword]` flattened.
    pub fn dot_table(&self, query: &[f32]) -> Vec<f32> {
        let ksub = self.ksub();
        let mut table = Vec::with_capacity(self.m * self.nrq * ksub);
        for s in 0..self.m {
            let sub = &query[s * self.dsub..(s + 1) * self.dsub];
            for stage in 0..self.nrq {
                for codeword in &self.codebooks[s][stage] {
                    table.push(simd::dot(sub, codeword));
                }
            }
        }
        table
    }

    /// Sum the dot table over one code row: the dot product of the query and
    /// the reconstruction.
    #[inline]
    pub fn lookup_dot(&self, table: &[f32], codes: &[u8]) -> f32 {
        let ksub = self.ksub();
        codes
            .iter()
            .enumerate()
            .map(|(pos, &c)| table[pos * ksub + c as usize])
            .sum()
    }

    fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        io::write_u32(w, self.dim as u32)?;
        io::write_u32(w, self.m as u32)?;
        io::write_u32(w, self.nrq as u32)?;
        io::write_u32(w, self.nbits as u32)?;
        for split in &self.codebooks {
            for stage in split {
                for c in stage {
                    io::write_vec_f32(w, c)?;
                }
            }
        }
        Ok(())
    }

    fn read(r: &mut dyn Read) -> Result<Self> {
        let dim = io::read_u32(r)? as usize;
        let m = io::read_u32(r)? as usize;
        let nrq = io::read_u32(r)? as usize;
        let nbits = io::read_u32(r)? as usize;
        let mut prq = Self::new(dim, m, nrq, nbits)?;
        let ksub = prq.ksub();
        prq.codebooks = Vec::with_capacity(m);
        for _ in 0..m {
            let mut split = Vec::with_capacity(nrq);
            for _ in 0..nrq {
                let mut stage = Vec::with_capacity(ksub);
                for _ in 0..ksub {
                    stage.push(io::read_vec_f32(r)?);
                }
                split.push(stage);
            }
            prq.codebooks.push(split);
        }
        Ok(prq)
    }
}

/// Vector storage over product-residual codes.
pub struct PrqStorage {
    prq: ProductResidualQuantizer,
    metric: MetricType,
    search_type: PrqSearchType,
    codes: Vec<u8>,
    /// Squared norm of each row's reconstruction (NormFloat only).
    recon_norms_sqr: Vec<f32>,
    inv_norms: Vec<f32>,
    ntotal: usize,
}

impl PrqStorage {
    pub fn new(dim: usize, metric: MetricType, m: usize, nrq: usize, nbits: usize) -> Result<Self> {
        Ok(Self {
            prq: ProductResidualQuantizer::new(dim, m, nrq, nbits)?,
            metric,
            search_type: PrqSearchType::for_metric(metric),
            codes: Vec::new(),
            recon_norms_sqr: Vec::new(),
            inv_norms: Vec::new(),
            ntotal: 0,
        })
    }

    pub fn train(&mut self, vectors: &[f32], n: usize) -> Result<()> {
        self.prq.train(vectors, n)
    }

    pub fn is_trained(&self) -> bool {
        self.prq.is_trained()
    }

    fn code_row(&self, id: u32) -> &[u8] {
        let len = self.prq.code_len();
        &self.codes[id as usize * len..(id as usize + 1) * len]
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let metric = MetricType::read(r)?;
        let prq = ProductResidualQuantizer::read(r)?;
        let codes = io::read_vec_u8(r)?;
        let recon_norms_sqr = io::read_vec_f32(r)?;
        let inv_norms = io::read_vec_f32(r)?;
        let ntotal = io::read_u64(r)? as usize;
        Ok(Self {
            search_type: PrqSearchType::for_metric(metric),
            prq,
            metric,
            codes,
            recon_norms_sqr,
            inv_norms,
            ntotal,
        })
    }
}

impl VectorStorage for PrqStorage {
    fn ntotal(&self) -> usize {
        self.ntotal
    }

    fn dim(&self) -> usize {
        self.prq.dim
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        if !self.prq.is_trained() {
            return Err(IndexError::IndexNotTrained);
        }
        let dim = self.prq.dim;
        let code_len = self.prq.code_len();
        let old_len = self.codes.len();
        self.codes.resize(old_len + n * code_len, 0);
        let mut decoded = vec![0.0f32; dim];
        for i in 0..n {
            let row = &rows[i * dim..(i + 1) * dim];
            let codes = &mut self.codes[old_len + i * code_len..old_len + (i + 1) * code_len];
            self.prq.encode(row, codes);
            if self.search_type == PrqSearchType::NormFloat {
                let codes = &self.codes[old_len + i * code_len..old_len + (i + 1) * code_len];
                self.prq.decode(codes, &mut decoded);
                self.recon_norms_sqr.push(simd::dot(&decoded, &decoded));
            }
            if self.metric == MetricType::Cosine {
                self.inv_norms.push(simd::inverse_norm(row));
            }
        }
        self.ntotal += n;
        Ok(())
    }

    fn reconstruct(&self, id: u32, out: &mut [f32]) -> Result<()> {
        self.prq.decode(self.code_row(id), out);
        Ok(())
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + '_> {
        Box::new(PrqComputer {
            storage: self,
            table: Vec::new(),
            q_norm_sqr: 0.0,
            q_inv: 0.0,
            scratch: vec![0.0; self.prq.dim],
            scratch2: vec![0.0; self.prq.dim],
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
        w.write_all(&[STORAGE_KIND_PRQ])?;
        self.metric.write(w)?;
        self.prq.write(w)?;
        io::write_vec_u8(w, &self.codes)?;
        io::write_vec_f32(w, &self.recon_norms_sqr)?;
        io::write_vec_f32(w, &self.inv_norms)?;
        io::write_u64(w, self.ntotal as u64)
    }
}

struct PrqComputer<'a> {
    storage: &'a PrqStorage,
    table: Vec<f32>,
    q_norm_sqr: f32,
    q_inv: f32,
    scratch: Vec<f32>,
    scratch2: Vec<f32>,
}

impl DistanceComputer for PrqComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.table = self.storage.prq.dot_table(query);
        self.q_norm_sqr = simd::dot(query, query);
        if self.storage.metric == MetricType::Cosine {
            self.q_inv = simd::inverse_norm(query);
        }
    }

    fn distance(&mut self, id: u32) -> f32 {
        let dot = self.storage.prq.lookup_dot(&self.table, self.storage.code_row(id));
        match self.storage.metric {
            MetricType::Ip => dot,
            // ||q - x||^2 = ||q||^2 - 2<q,x> + ||x||^2 with the stored norm
            MetricType::L2 => {
                self.q_norm_sqr - 2.0 * dot + self.storage.recon_norms_sqr[id as usize]
            }
            MetricType::Cosine => dot * self.q_inv * self.storage.inv_norms[id as usize],
        }
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        self.storage
            .prq
            .decode(self.storage.code_row(i), &mut self.scratch);
        self.storage
            .prq
            .decode(self.storage.code_row(j), &mut self.scratch2);
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
    }

    #[test]
    fn residual_stages_shrink_error() {
        let dim = 8;
        let n = 300;
        let rows = random_rows(n, dim, 11);

        let mut one_stage = ProductResidualQuantizer::new(dim, 2, 1, 8).unwrap();
        let mut two_stage = ProductResidualQuantizer::new(dim, 2, 2, 8).unwrap();
        one_stage.train(&rows, n).unwrap();
        two_stage.train(&rows, n).unwrap();

        let err = |q: &ProductResidualQuantizer| {
            let mut codes = vec![0u8; q.code_len()];
            let mut decoded = vec![0.0f32; dim];
            let mut total = 0.0;
            for i in 0..n {
                let row = &rows[i * dim..(i + 1) * dim];
                q.encode(row, &mut codes);
                q.decode(&codes, &mut decoded);
                total += simd::l2_sqr(row, &decoded);
            }
            total
        };
        assert!(err(&two_stage) < err(&one_stage));
    }

    #[test]
    fn l2_distance_uses_stored_norms() {
        let dim = 8;
        let n = 256;
        let rows = random_rows(n, dim, 12);
        let mut storage = PrqStorage::new(dim, MetricType::L2, 2, 2, 8).unwrap();
        storage.train(&rows, n).unwrap();
        storage.add(&rows, n).unwrap();

        let query = random_rows(1, dim, 13);
        let mut dc = storage.distance_computer();
        dc.set_query(&query);

        let mut decoded = vec![0.0f32; dim];
        for id in [0u32, 100, 255] {
            storage.reconstruct(id, &mut decoded).unwrap();
            let expected = simd::l2_sqr(&query, &decoded);
            assert!((dc.distance(id) - expected).abs() < 1e-2);
        }
    }

    #[test]
    fn search_type_follows_metric() {
        assert_eq!(
            PrqSearchType::for_metric(MetricType::Ip),
            PrqSearchType::LutNoNorm
        );
        assert_eq!(
            PrqSearchType::for_metric(MetricType::L2),
            PrqSearchType::NormFloat
        );
        assert_eq!(
            PrqSearchType::for_metric(MetricType::Cosine),
            PrqSearchType::NormFloat
        );
    }
}
