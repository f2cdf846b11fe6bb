//! nearfield: a vector-similarity search index node.
//!
//! The core is a Hierarchical Navigable Small World (HNSW) graph over
//! pluggable vector storage, with optional scalar, product, and
//! product-residual quantization, optional refine-rerank, and optional
//! partitioning of the dataset by a scalar key.
//!
//! - **Graph**: [`hnsw`] — multi-layer neighbor lists, insertion with
//!   relative-neighborhood pruning, level-0 beam search with bitset
//!   filtering and adaptive admission of filtered-out nodes.
//! - **Storage**: [`storage`] (flat fp32, lossless scalar quantization) and
//!   [`quantizer`] (PQ, PRQ) behind one trait, so a trained graph can have
//!   compressed storage spliced in.
//! - **Dispatch**: [`search`]-level heuristics route very selective filters
//!   to a linear scan, with a per-query fallback when graph search comes up
//!   short.
//! - **Rerank**: [`refine`] oversamples the base index and re-scores with
//!   an exact computer.
//! - **Iteration**: [`iterator`] drives graph expansion on demand, yielding
//!   one filter-passing candidate per call.
//! - **Partitioning**: [`partition`] shards the index by a scalar key and
//!   maintains the label/offset maps that survive serialization.
//! - **Facade**: [`node::IndexNode`] ties it together: train / add /
//!   search / range search / iterators / serialization; [`legacy`] keeps
//!   pre-graph-backend index versions readable.
//!
//! # Usage
//!
//! ```rust
//! use nearfield::{BitsetView, Dataset, IndexConfig, IndexKind, IndexNode};
//! use nearfield::dataformat::DataFormat;
//!
//! # fn main() -> nearfield::Result<()> {
//! let data = Dataset::from_fp32(4, 2, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?;
//! let cfg = IndexConfig {
//!     metric_type: Some("L2".into()),
//!     k: Some(2),
//!     ..Default::default()
//! };
//!
//! let mut node = IndexNode::new(IndexKind::Flat, DataFormat::Fp32);
//! node.train(&data, &cfg)?;
//! node.add(&data, &cfg)?;
//!
//! let query = Dataset::from_fp32(1, 2, vec![0.9, 0.1])?;
//! let hits = node.search(&query, &cfg, BitsetView::none())?;
//! assert_eq!(hits.ids_for(0)[0], 1);
//! # Ok(())
//! # }
//! ```

pub mod bitset;
pub mod config;
pub mod dataformat;
pub mod dataset;
pub mod error;
pub mod hnsw;
pub mod io;
pub mod iterator;
pub mod legacy;
pub mod metric;
pub mod node;
pub mod partition;
pub mod pool;
pub mod quantizer;
pub mod refine;
pub mod search;
pub mod simd;
pub mod storage;

pub use bitset::{Bitset, BitsetView};
pub use config::{IndexConfig, IndexKind};
pub use dataset::{Dataset, RangeSearchOutput, SearchResult};
pub use error::{IndexError, Result};
pub use iterator::AnnIterator;
pub use legacy::IndexNodeWithFallback;
pub use metric::MetricType;
pub use node::IndexNode;
