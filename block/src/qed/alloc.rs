// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use super::{Error, Result};

// Offsets travel through off_t.
const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Hands out clusters by growing the file. Space is never reused.
///
/// Callers that allocate must hold the table lock for the table they are
/// going to link the clusters into; the allocator does no locking of its own.
#[derive(Debug)]
pub struct ClusterAllocator {
    cluster_size: u64,
    file_size: u64,
}

impl ClusterAllocator {
    /// `file_size` must be cluster aligned.
    pub fn new(cluster_size: u64, file_size: u64) -> Self {
        ClusterAllocator {
            cluster_size,
            file_size,
        }
    }

    /// Returns the offset of `n` contiguous new clusters.
    pub fn allocate(&mut self, n: u64) -> Result<u64> {
        let offset = self.file_size;
        let end = n
            .checked_mul(self.cluster_size)
            .and_then(|len| offset.checked_add(len))
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(Error::NoSpace)?;
        self.file_size = end;
        debug!("Allocated {n} clusters at {offset:#x}");
        Ok(offset)
    }

    /// Current end of the allocated area.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}
