//! Vector quantizers with trainable codebooks.
//!
//! Product quantization splits each vector into `m` subvectors and encodes
//! every subvector against its own codebook; the product-residual variant
//! chains `nrq` codebooks per split, each encoding the residual left by the
//! previous stage. Both expose a storage implementation so the graph can sit
//! directly on compressed codes.

pub mod kmeans;
pub mod pq;
pub mod prq;

pub use pq::{PqStorage, ProductQuantizer};
pub use prq::{PrqStorage, ProductResidualQuantizer};
