// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Translation of a guest byte range into its on-disk location.

use std::sync::Arc;

use super::header::Geometry;
use super::l2_cache::{L2Cache, L2Table};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClusterKind {
    /// Data clusters are allocated.
    Found,
    /// The L2 table exists but the clusters are not allocated.
    L2Miss,
    /// No L2 table exists for the range.
    L1Miss,
}

#[derive(Clone, Debug)]
pub struct ClusterLookup {
    pub kind: ClusterKind,
    /// File offset of the first byte for `Found`, zero otherwise.
    pub offset: u64,
    /// Bytes from the lookup position covered by this result.
    pub len: u64,
    /// The L2 table the result came from, if there is one.
    pub l2_table: Option<Arc<L2Table>>,
}

#[derive(Debug)]
pub enum Resolution {
    Resolved(ClusterLookup),
    /// The L2 table at this offset has to be loaded first.
    LoadL2(u64),
}

/// Counts entries from `index` that are all unallocated, or all allocated
/// and contiguous on disk.
fn count_contiguous_clusters(entries: &[u64], index: usize, n: usize, cluster_size: u64) -> usize {
    let first = entries[index];
    let end = (index + n).min(entries.len());
    1 + entries[index + 1..end]
        .iter()
        .zip(1u64..)
        .take_while(|&(&entry, i)| {
            if first == 0 {
                entry == 0
            } else {
                entry == first + i * cluster_size
            }
        })
        .count()
}

/// Shortens `len` so that the range at `pos` stays within one L2 table.
pub fn clamp_to_l2_span(geometry: &Geometry, pos: u64, len: u64) -> u64 {
    let span_end = (pos | (geometry.l2_span() - 1)) + 1;
    len.min(span_end - pos)
}

/// Looks up `len` bytes at `pos`. The range is clamped to the span of a
/// single L2 table. Returns `LoadL2` if the table is not cached.
pub fn find_cluster(
    geometry: &Geometry,
    l1_table: &[u64],
    cache: &L2Cache,
    pos: u64,
    len: u64,
) -> Resolution {
    let len = clamp_to_l2_span(geometry, pos, len);

    let l2_offset = l1_table[geometry.l1_index(pos)];
    if l2_offset == 0 {
        return Resolution::Resolved(ClusterLookup {
            kind: ClusterKind::L1Miss,
            offset: 0,
            len,
            l2_table: None,
        });
    }

    match cache.find(l2_offset) {
        Some(table) => Resolution::Resolved(scan_l2(geometry, table, pos, len)),
        None => Resolution::LoadL2(l2_offset),
    }
}

/// Classifies the range using an already loaded L2 table.
pub fn scan_l2(geometry: &Geometry, table: Arc<L2Table>, pos: u64, len: u64) -> ClusterLookup {
    let index = geometry.l2_index(pos);
    let intra = geometry.offset_into_cluster(pos);
    let n = geometry.bytes_to_clusters(intra + len) as usize;
    let count = count_contiguous_clusters(table.entries(), index, n, geometry.cluster_size());
    let first = table[index];

    let len = len.min(count as u64 * geometry.cluster_size() - intra);
    let (kind, offset) = if first == 0 {
        (ClusterKind::L2Miss, 0)
    } else {
        (ClusterKind::Found, first + intra)
    };

    ClusterLookup {
        kind,
        offset,
        len,
        l2_table: Some(table),
    }
}
