//! Scalar-quantized storage.
//!
//! Rows are stored as fp16, bf16, or direct-signed int8 and decoded on the
//! fly for distance computation. When the quantizer type matches the node's
//! input data format the encoding is lossless and the storage can serve raw
//! data reconstruction.

use std::io::{Read, Write};

use crate::dataformat::{convert_rows_from_fp32, convert_rows_to_fp32, DataFormat, VectorData};
use crate::error::{IndexError, Result};
use crate::io;
use crate::metric::MetricType;
use crate::simd;
use crate::storage::{DistanceComputer, VectorStorage, STORAGE_KIND_SQ};

/// Scalar quantizer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqType {
    Fp16,
    Bf16,
    /// Stores int8 values directly; input must already be integral int8 range.
    Int8DirectSigned,
}

impl SqType {
    /// Parse a config-level quantizer string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FP16" => Ok(SqType::Fp16),
            "BF16" => Ok(SqType::Bf16),
            "INT8" => Ok(SqType::Int8DirectSigned),
            other => Err(IndexError::InvalidArgs(format!(
                "invalid scalar quantizer type: {other}"
            ))),
        }
    }

    /// The data format this quantizer stores losslessly.
    #[must_use]
    pub fn lossless_format(self) -> DataFormat {
        match self {
            SqType::Fp16 => DataFormat::Fp16,
            SqType::Bf16 => DataFormat::Bf16,
            SqType::Int8DirectSigned => DataFormat::Int8,
        }
    }

    fn tag(self) -> u8 {
        match self {
            SqType::Fp16 => 0,
            SqType::Bf16 => 1,
            SqType::Int8DirectSigned => 2,
        }
    }

    fn from_tag(t: u8) -> Result<Self> {
        match t {
            0 => Ok(SqType::Fp16),
            1 => Ok(SqType::Bf16),
            2 => Ok(SqType::Int8DirectSigned),
            other => Err(IndexError::InvalidSerializedIndexType(format!(
                "unknown sq type tag {other}"
            ))),
        }
    }
}

pub struct ScalarQuantStorage {
    dim: usize,
    metric: MetricType,
    qtype: SqType,
    codes: VectorData,
    inv_norms: Vec<f32>,
}

impl ScalarQuantStorage {
    pub fn new(dim: usize, metric: MetricType, qtype: SqType) -> Self {
        Self {
            dim,
            metric,
            qtype,
            codes: VectorData::zeros(qtype.lossless_format(), 0),
            inv_norms: Vec::new(),
        }
    }

    pub fn qtype(&self) -> SqType {
        self.qtype
    }

    fn decode_row(&self, id: u32, out: &mut [f32]) {
        // codes are always large enough; conversion cannot fail on decode
        let _ = convert_rows_to_fp32(&self.codes, out, id as usize, 1, self.dim);
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let metric = MetricType::read(r)?;
        let dim = io::read_u32(r)? as usize;
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let qtype = SqType::from_tag(tag[0])?;
        let codes = VectorData::read(r)?;
        let inv_norms = io::read_vec_f32(r)?;
        Ok(Self {
            dim,
            metric,
            qtype,
            codes,
            inv_norms,
        })
    }
}

impl VectorStorage for ScalarQuantStorage {
    fn ntotal(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.codes.len() / self.dim
        }
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn add(&mut self, rows: &[f32], n: usize) -> Result<()> {
        // encode into a fresh buffer first so a conversion failure leaves
        // the storage untouched
        let mut encoded = VectorData::zeros(self.qtype.lossless_format(), n * self.dim);
        convert_rows_from_fp32(&rows[..n * self.dim], &mut encoded, 0, n, self.dim)?;
        match (&mut self.codes, encoded) {
            (VectorData::Fp16(dst), VectorData::Fp16(src)) => dst.extend_from_slice(&src),
            (VectorData::Bf16(dst), VectorData::Bf16(src)) => dst.extend_from_slice(&src),
            (VectorData::Int8(dst), VectorData::Int8(src)) => dst.extend_from_slice(&src),
            (VectorData::Fp32(dst), VectorData::Fp32(src)) => dst.extend_from_slice(&src),
            _ => {
                return Err(IndexError::InvalidIndexError(
                    "scalar storage format mismatch".to_string(),
                ))
            }
        }
        if self.metric == MetricType::Cosine {
            for i in 0..n {
                self.inv_norms
                    .push(simd::inverse_norm(&rows[i * self.dim..(i + 1) * self.dim]));
            }
        }
        Ok(())
    }

    fn reconstruct(&self, id: u32, out: &mut [f32]) -> Result<()> {
        self.decode_row(id, out);
        Ok(())
    }

    fn distance_computer(&self) -> Box<dyn DistanceComputer + '_> {
        Box::new(SqComputer {
            storage: self,
            query: Vec::new(),
            q_inv: 0.0,
            scratch: vec![0.0; self.dim],
            scratch2: vec![0.0; self.dim],
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
        Some(self.qtype.lossless_format())
    }

    fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(&[STORAGE_KIND_SQ])?;
        self.metric.write(w)?;
        io::write_u32(w, self.dim as u32)?;
        w.write_all(&[self.qtype.tag()])?;
        self.codes.write(w)?;
        io::write_vec_f32(w, &self.inv_norms)
    }
}

struct SqComputer<'a> {
    storage: &'a ScalarQuantStorage,
    query: Vec<f32>,
    q_inv: f32,
    scratch: Vec<f32>,
    scratch2: Vec<f32>,
}

impl DistanceComputer for SqComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
        if self.storage.metric == MetricType::Cosine {
            self.q_inv = simd::inverse_norm(query);
        }
    }

    fn distance(&mut self, id: u32) -> f32 {
        self.storage.decode_row(id, &mut self.scratch);
        match self.storage.metric {
            MetricType::L2 => simd::l2_sqr(&self.query, &self.scratch),
            MetricType::Ip => simd::dot(&self.query, &self.scratch),
            MetricType::Cosine => {
                simd::dot(&self.query, &self.scratch)
                    * self.q_inv
                    * self.storage.inv_norms[id as usize]
            }
        }
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        self.storage.decode_row(i, &mut self.scratch);
        self.storage.decode_row(j, &mut self.scratch2);
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
