//! Typed index configuration.
//!
//! One option surface shared by every index kind; absent values fall back
//! to the defaults below. Quantizer-specific fields are ignored by kinds
//! that do not use them.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metric::MetricType;

/// Default graph degree.
pub const DEFAULT_M: usize = 30;
/// Default construction beam width.
pub const DEFAULT_EF_CONSTRUCTION: usize = 360;
/// Default search beam width when `ef` is not set.
pub const DEFAULT_EF: usize = 16;
/// Default fraction of iterator yields that get refined.
pub const DEFAULT_ITERATOR_REFINE_RATIO: f32 = 0.5;

/// Which index family a node builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// HNSW over flat (or losslessly scalar-quantized) storage.
    Flat,
    /// HNSW over scalar-quantized storage chosen by `sq_type`.
    Sq,
    /// HNSW over product-quantized storage.
    Pq,
    /// HNSW over product-residual-quantized storage.
    Prq,
}

/// Recognized options, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// "L2", "IP" or "COSINE"; defaults to L2.
    pub metric_type: Option<String>,
    pub k: Option<usize>,
    /// Search beam width.
    pub ef: Option<usize>,
    pub ef_construction: Option<usize>,
    /// Graph degree M.
    pub m: Option<usize>,
    pub num_build_thread: Option<usize>,
    /// Memory-map file-based deserialization.
    pub enable_mmap: Option<bool>,
    /// Record the visited level-0 nodes of a single-query search.
    pub trace_visit: Option<bool>,
    pub refine: Option<bool>,
    /// "FP32", "FP16" or "BF16".
    pub refine_type: Option<String>,
    pub refine_k: Option<usize>,
    pub iterator_refine_ratio: Option<f32>,
    pub radius: Option<f32>,
    pub range_filter: Option<f32>,
    /// "FP16", "BF16" or "INT8".
    pub sq_type: Option<String>,
    /// PQ/PRQ subquantizer count.
    pub pq_m: Option<usize>,
    pub nbits: Option<usize>,
    /// PRQ residual stage count.
    pub nrq: Option<usize>,
}

impl IndexConfig {
    pub fn metric(&self) -> Result<MetricType> {
        MetricType::parse(self.metric_type.as_deref().unwrap_or("L2"))
    }

    pub(crate) fn graph_m(&self) -> usize {
        self.m.unwrap_or(DEFAULT_M)
    }

    pub(crate) fn graph_ef_construction(&self) -> usize {
        self.ef_construction.unwrap_or(DEFAULT_EF_CONSTRUCTION)
    }

    /// Effective beam width for a top-k search.
    pub(crate) fn search_ef(&self, k: usize) -> usize {
        self.ef.unwrap_or(DEFAULT_EF).max(k)
    }

    /// Refine is enabled only when both the flag and the type are present.
    pub(crate) fn refine_enabled(&self) -> bool {
        self.refine.unwrap_or(false) && self.refine_type.is_some()
    }

    pub(crate) fn nbits(&self) -> usize {
        self.nbits.unwrap_or(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_defaults_to_l2() {
        let cfg = IndexConfig::default();
        assert_eq!(cfg.metric().unwrap(), MetricType::L2);
    }

    #[test]
    fn search_ef_never_below_k() {
        let cfg = IndexConfig {
            ef: Some(10),
            ..Default::default()
        };
        assert_eq!(cfg.search_ef(4), 10);
        assert_eq!(cfg.search_ef(50), 50);
    }

    #[test]
    fn refine_needs_flag_and_type() {
        let mut cfg = IndexConfig {
            refine: Some(true),
            ..Default::default()
        };
        assert!(!cfg.refine_enabled());
        cfg.refine_type = Some("FP32".to_string());
        assert!(cfg.refine_enabled());
    }
}
