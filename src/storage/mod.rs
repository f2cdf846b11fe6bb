//! Vector storage and query-bound distance computers.
//!
//! A storage owns the raw (or encoded) rows of one sub-index and hands out
//! [`DistanceComputer`]s bound to a query. Computers return the metric's
//! natural value: squared L2 for L2, dot product for IP, normalized dot for
//! cosine. The graph layer wraps similarity metrics with a sign change so
//! its heaps always minimize; see [`negative_computer`].

pub mod flat;
pub mod scalar;

use std::io::{Read, Write};

use crate::dataformat::DataFormat;
use crate::error::{IndexError, Result};
use crate::metric::MetricType;

pub use flat::FlatStorage;
pub use scalar::{ScalarQuantStorage, SqType};

/// A distance function bound to one query.
///
/// Mutability allows implementations to keep per-query state (decoded query,
/// lookup tables, scratch buffers).
pub trait DistanceComputer {
    /// Bind the query vector. Must be called before `distance`.
    fn set_query(&mut self, query: &[f32]);

    /// Distance (natural orientation) between the query and row `id`.
    fn distance(&mut self, id: u32) -> f32;

    /// Distance between two stored rows, used by construction-time pruning.
    fn symmetric(&mut self, i: u32, j: u32) -> f32;
}

/// Sign-flipping wrapper so similarity metrics can share min-heap search code.
pub struct NegativeComputer<'a>(pub Box<dyn DistanceComputer + 'a>);

impl DistanceComputer for NegativeComputer<'_> {
    fn set_query(&mut self, query: &[f32]) {
        self.0.set_query(query);
    }

    fn distance(&mut self, id: u32) -> f32 {
        -self.0.distance(id)
    }

    fn symmetric(&mut self, i: u32, j: u32) -> f32 {
        -self.0.symmetric(i, j)
    }
}

/// Fixed-dimension vector storage of one sub-index.
pub trait VectorStorage: Send + Sync {
    fn ntotal(&self) -> usize;

    fn dim(&self) -> usize;

    fn metric(&self) -> MetricType;

    /// Append `n` fp32 rows.
    fn add(&mut self, rows: &[f32], n: usize) -> Result<()>;

    /// Decode row `id` into an fp32 buffer of `dim` elements.
    fn reconstruct(&self, id: u32, out: &mut [f32]) -> Result<()>;

    /// A computer over this storage, natural orientation.
    fn distance_computer(&self) -> Box<dyn DistanceComputer + '_>;

    /// Per-row inverse L2 norms when this is a cosine storage.
    fn inverse_norms(&self) -> Option<&[f32]> {
        None
    }

    /// The raw data format this storage preserves losslessly, if any.
    fn raw_format(&self) -> Option<DataFormat> {
        None
    }

    /// Serialize: one kind byte, then the body.
    fn write(&self, w: &mut dyn Write) -> std::io::Result<()>;
}

pub(crate) const STORAGE_KIND_FLAT: u8 = 0;
pub(crate) const STORAGE_KIND_SQ: u8 = 1;
pub(crate) const STORAGE_KIND_PQ: u8 = 2;
pub(crate) const STORAGE_KIND_PRQ: u8 = 3;

/// Deserialize any storage written by [`VectorStorage::write`].
pub fn read_storage(r: &mut dyn Read) -> Result<Box<dyn VectorStorage>> {
    let mut kind = [0u8; 1];
    r.read_exact(&mut kind)?;
    match kind[0] {
        STORAGE_KIND_FLAT => Ok(Box::new(FlatStorage::read_body(r)?)),
        STORAGE_KIND_SQ => Ok(Box::new(ScalarQuantStorage::read_body(r)?)),
        STORAGE_KIND_PQ => Ok(Box::new(crate::quantizer::pq::PqStorage::read_body(r)?)),
        STORAGE_KIND_PRQ => Ok(Box::new(crate::quantizer::prq::PrqStorage::read_body(r)?)),
        other => Err(IndexError::InvalidSerializedIndexType(format!(
            "unknown storage kind {other}"
        ))),
    }
}

/// Wrap the storage's computer with a sign change when the metric is a
/// similarity, so graph search can always minimize.
pub fn negative_computer(storage: &dyn VectorStorage) -> Box<dyn DistanceComputer + '_> {
    let inner = storage.distance_computer();
    if storage.metric().is_similarity() {
        Box::new(NegativeComputer(inner))
    } else {
        inner
    }
}
