// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Consistency check of the table structure.
//!
//! Walks the on-disk L1 and L2 tables and records every cluster they
//! reference. Entries that do not name a cluster inside the file are
//! corruptions; with `repair` they are zeroed on disk. Clusters referenced
//! twice are reported but left alone. Clusters referenced by nothing are
//! leaks; the append-only allocator never reuses them, so they cost space
//! only.

use serde::Serialize;

use super::header::Features;
use super::table::{decode_raw, encode_entries, TableKind};
use super::{Error, QedImage, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub corruptions: u64,
    pub corruptions_fixed: u64,
    pub duplicates: u64,
    pub leaks: u64,
    pub l2_tables: u64,
    pub data_clusters: u64,
}

impl CheckResult {
    /// No problem is left apart from leaked clusters.
    pub fn is_clean(&self) -> bool {
        self.corruptions == self.corruptions_fixed && self.duplicates == 0
    }
}

/// One bit per cluster of the file.
struct ClusterMap {
    cluster_shift: u32,
    nclusters: u64,
    words: Vec<u64>,
}

impl ClusterMap {
    fn new(cluster_size: u64, file_size: u64) -> Self {
        let cluster_shift = cluster_size.trailing_zeros();
        let nclusters = file_size >> cluster_shift;
        ClusterMap {
            cluster_shift,
            nclusters,
            words: vec![0; nclusters.div_ceil(64) as usize],
        }
    }

    /// Marks `n` clusters at `offset`, ignoring any part past the end of the
    /// file. Returns false if any was already in use.
    fn mark(&mut self, offset: u64, n: u64) -> bool {
        let first = (offset >> self.cluster_shift).min(self.nclusters);
        let end = first.saturating_add(n).min(self.nclusters);
        let mut fresh = true;
        for cluster in first..end {
            let word = &mut self.words[(cluster / 64) as usize];
            let bit = 1u64 << (cluster % 64);
            fresh &= *word & bit == 0;
            *word |= bit;
        }
        fresh
    }

    fn unused(&self) -> u64 {
        let used: u64 = self.words.iter().map(|w| u64::from(w.count_ones())).sum();
        self.nclusters - used
    }
}

impl QedImage {
    /// Checks the image's table structure. With `repair` on a writable
    /// image, corrupt entries are zeroed and the needs-check flag is cleared
    /// once nothing but leaks remains.
    pub fn check(&mut self, repair: bool) -> Result<CheckResult> {
        if !self.requests.is_empty() {
            return Err(Error::Busy);
        }
        let repair = repair && !self.read_only;

        let geometry = self.geometry;
        let cluster_size = geometry.cluster_size();
        let file_size = self.allocator.file_size();
        let mut map = ClusterMap::new(cluster_size, file_size);
        let mut result = CheckResult::default();

        map.mark(0, u64::from(self.header.header_size));
        map.mark(self.header.l1_table_offset, geometry.table_size());

        let mut l1_table = self.read_table(self.header.l1_table_offset)?;
        let mut l1_dirty = false;
        for index in 0..l1_table.len() {
            let l2_offset = l1_table[index];
            if l2_offset == 0 {
                continue;
            }
            if !TableKind::L1.is_valid_entry(&geometry, l2_offset, file_size) {
                warn!("L1 entry {index} points outside the image: {l2_offset:#x}");
                result.corruptions += 1;
                if repair {
                    l1_table[index] = 0;
                    l1_dirty = true;
                    result.corruptions_fixed += 1;
                }
                continue;
            }
            if !map.mark(l2_offset, geometry.table_size()) {
                warn!("L2 table at {l2_offset:#x} is referenced more than once");
                result.duplicates += 1;
                continue;
            }
            result.l2_tables += 1;

            let mut l2_table = self.read_table(l2_offset)?;
            let mut l2_dirty = false;
            for entry in l2_table.iter_mut() {
                if *entry == 0 {
                    continue;
                }
                if !TableKind::L2.is_valid_entry(&geometry, *entry, file_size) {
                    warn!("L2 table at {l2_offset:#x} has invalid entry {:#x}", *entry);
                    result.corruptions += 1;
                    if repair {
                        *entry = 0;
                        l2_dirty = true;
                        result.corruptions_fixed += 1;
                    }
                    continue;
                }
                if !map.mark(*entry, 1) {
                    warn!("Cluster at {:#x} is referenced more than once", *entry);
                    result.duplicates += 1;
                    continue;
                }
                result.data_clusters += 1;
            }

            if l2_dirty {
                self.write_table(l2_offset, &l2_table)?;
            }
        }

        if l1_dirty {
            self.write_table(self.header.l1_table_offset, &l1_table)?;
            for (entry, &fixed) in self.l1_table.iter_mut().zip(l1_table.iter()) {
                if fixed == 0 {
                    *entry = 0;
                }
            }
        }
        if repair {
            self.l2_cache.clear();
            self.l2_generation += 1;
        }

        result.leaks = map.unused();
        if result.leaks > 0 {
            info!("{} leaked clusters", result.leaks);
        }

        if repair && result.is_clean() && self.header.needs_check() {
            self.disk.fsync().map_err(Error::Flushing)?;
            self.header.set_feature(Features::NEED_CHECK, false);
            self.write_header()?;
        }

        Ok(result)
    }

    fn read_table(&mut self, offset: u64) -> Result<Vec<u64>> {
        let mut bytes = vec![0u8; self.geometry.table_bytes() as usize];
        self.disk
            .read_exact_at(&mut bytes, offset)
            .map_err(Error::ReadingTable)?;
        Ok(decode_raw(&bytes))
    }

    fn write_table(&mut self, offset: u64, entries: &[u64]) -> Result<()> {
        self.disk
            .write_all_at(&encode_entries(entries), offset)
            .map_err(Error::WritingTable)
    }
}
