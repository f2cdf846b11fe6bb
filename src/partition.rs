//! Scalar-key partitioning.
//!
//! When training data carries scalar bucket info, the index is built as one
//! sub-index per bucket group. Quantizer training needs a minimum row count
//! (2^nbits for PQ/PRQ), so undersized buckets are merged: bucket indices
//! are sorted ascending by size and greedily accumulated until a group
//! reaches `base_rows`; a leftover tail is appended to the last finished
//! group, or emitted alone when it is the only group.
//!
//! The layout keeps, per partition, the local-offset -> external-label table
//! plus a prefix-sum of partition sizes, and the inverse map from external
//! label to global internal offset.

use std::io::{Read, Write};

use tracing::warn;

use crate::error::{IndexError, Result};
use crate::io;

/// Current on-disk header version.
pub const PARTITION_HEADER_VERSION: u32 = 0;

/// Merge small scalar buckets into trainable groups.
///
/// Returns groups of bucket indices; ordering inside each group follows the
/// size-sorted traversal.
pub(crate) fn combine_partitions(scalar_info: &[Vec<u32>], base_rows: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..scalar_info.len()).collect();
    indices.sort_by_key(|&i| scalar_info[i].len());

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut cur: Vec<usize> = Vec::new();
    let mut cur_size = 0usize;
    for i in indices {
        cur_size += scalar_info[i].len();
        cur.push(i);
        if cur_size >= base_rows {
            groups.push(std::mem::take(&mut cur));
            cur_size = 0;
        }
    }
    if !cur.is_empty() {
        if let Some(last) = groups.last_mut() {
            last.append(&mut cur);
        } else {
            groups.push(cur);
        }
    }
    groups
}

/// Id bookkeeping of a partitioned index.
#[derive(Debug, Clone, Default)]
pub struct PartitionLayout {
    /// Per partition: local offset -> external label.
    pub labels: Vec<Vec<u32>>,
    /// Prefix sums of partition sizes; `len() == partitions + 1`.
    pub index_rows_sum: Vec<u32>,
    /// External label -> global internal offset.
    pub label_to_internal_offset: Vec<u32>,
}

impl PartitionLayout {
    /// Build the layout from combined groups over the raw buckets.
    pub(crate) fn from_groups(groups: &[Vec<usize>], scalar_info: &[Vec<u32>]) -> Self {
        let total: usize = scalar_info.iter().map(Vec::len).sum();
        let mut labels = Vec::with_capacity(groups.len());
        let mut index_rows_sum = vec![0u32; groups.len() + 1];
        let mut label_to_internal_offset = vec![0u32; total];

        for (p, group) in groups.iter().enumerate() {
            let mut partition_labels = Vec::new();
            for &bucket in group {
                partition_labels.extend_from_slice(&scalar_info[bucket]);
            }
            index_rows_sum[p + 1] = index_rows_sum[p] + partition_labels.len() as u32;
            for (local, &label) in partition_labels.iter().enumerate() {
                label_to_internal_offset[label as usize] = index_rows_sum[p] + local as u32;
            }
            labels.push(partition_labels);
        }
        Self {
            labels,
            index_rows_sum,
            label_to_internal_offset,
        }
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.index_rows_sum.last().copied().unwrap_or(0) as usize
    }

    /// Partition containing a global internal offset.
    #[must_use]
    pub fn partition_of_offset(&self, offset: u32) -> Option<usize> {
        // first element strictly greater than offset, minus one
        let upper = self.index_rows_sum.partition_point(|&s| s <= offset);
        if upper == 0 || upper > self.partitions() {
            None
        } else {
            Some(upper - 1)
        }
    }

    /// Resolve the partition a query must search, from the first valid bit
    /// of the filter.
    pub(crate) fn select_partition(&self, bitset: &crate::bitset::BitsetView<'_>) -> Result<usize> {
        if bitset.is_empty() {
            warn!("partition key value not correctly set");
            return Err(IndexError::InvalidArgs(
                "partition key value not correctly set".to_string(),
            ));
        }
        if bitset.count() >= bitset.size() && bitset.size() > 0 {
            // everything is filtered out, any partition will produce nothing
            return Ok(0);
        }
        let first_valid = bitset.first_valid_index().ok_or_else(|| {
            IndexError::InvalidArgs("partition key value not correctly set".to_string())
        })?;
        let offset = if bitset.has_out_ids() {
            first_valid as u32
        } else {
            *self
                .label_to_internal_offset
                .get(first_valid)
                .ok_or_else(|| {
                    IndexError::InvalidArgs(format!("label {first_valid} outside the index"))
                })?
        };
        self.partition_of_offset(offset).ok_or_else(|| {
            warn!("can not find vector of offset {offset}");
            IndexError::InvalidArgs(format!("no partition contains offset {offset}"))
        })
    }

    pub(crate) fn write_header(&self, w: &mut dyn Write, size: u32) -> std::io::Result<()> {
        io::write_u32(w, PARTITION_HEADER_VERSION)?;
        io::write_u32(w, size)?;
        io::write_u32(w, self.labels.len() as u32)?;
        for label in &self.labels {
            io::write_vec_u32(w, label)?;
        }
        io::write_vec_u32(w, &self.index_rows_sum)?;
        io::write_vec_u32(w, &self.label_to_internal_offset)
    }

    /// Read the header, returning the stored sub-index count and the layout.
    pub(crate) fn read_header(r: &mut dyn Read) -> Result<(u32, Self)> {
        let version = io::read_u32(r)?;
        if version != PARTITION_HEADER_VERSION {
            warn!("partition header version {version} differs from {PARTITION_HEADER_VERSION}");
        }
        let size = io::read_u32(r)?;
        let cluster_size = io::read_u32(r)? as usize;
        let mut labels = Vec::with_capacity(cluster_size);
        for _ in 0..cluster_size {
            labels.push(io::read_vec_u32(r)?);
        }
        let index_rows_sum = io::read_vec_u32(r)?;
        let label_to_internal_offset = io::read_vec_u32(r)?;
        Ok((
            size,
            Self {
                labels,
                index_rows_sum,
                label_to_internal_offset,
            },
        ))
    }
}
