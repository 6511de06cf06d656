// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// In-memory copy of one L2 table and the file offset it lives at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2Table {
    offset: u64,
    entries: Box<[u64]>,
}

impl L2Table {
    /// Creates a zeroed table that is not yet placed in the file.
    pub fn new(nelems: usize) -> Self {
        L2Table {
            offset: 0,
            entries: vec![0; nelems].into_boxed_slice(),
        }
    }

    pub fn from_vec(offset: u64, entries: Vec<u64>) -> Self {
        L2Table {
            offset,
            entries: entries.into_boxed_slice(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Index<usize> for L2Table {
    type Output = u64;

    fn index(&self, index: usize) -> &u64 {
        self.entries.index(index)
    }
}

impl IndexMut<usize> for L2Table {
    fn index_mut(&mut self, index: usize) -> &mut u64 {
        self.entries.index_mut(index)
    }
}

/// Bounded write-through cache of L2 tables keyed by file offset.
///
/// Entries are shared with in-flight requests through `Arc`; a request that
/// keeps using a table after it has been evicted still holds a valid copy.
/// Published tables are never mutated. An update builds a new table and
/// replaces the cached one only once the new contents are on disk.
#[derive(Debug)]
pub struct L2Cache {
    capacity: usize,
    // Oldest first.
    entries: VecDeque<Arc<L2Table>>,
}

impl L2Cache {
    pub fn new(capacity: usize) -> Self {
        L2Cache {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Returns a fresh table owned by the caller.
    pub fn alloc_entry(&self, nelems: usize) -> L2Table {
        L2Table::new(nelems)
    }

    pub fn find(&self, offset: u64) -> Option<Arc<L2Table>> {
        self.entries
            .iter()
            .find(|entry| entry.offset() == offset)
            .cloned()
    }

    /// Inserts a table loaded from disk. If another load of the same table
    /// won the race, the cached copy is kept and returned instead.
    pub fn commit(&mut self, table: Arc<L2Table>) -> Arc<L2Table> {
        if let Some(existing) = self.find(table.offset()) {
            return existing;
        }

        self.insert(table.clone());
        table
    }

    /// Publishes a new version of a table after it has been written out.
    pub fn update(&mut self, table: Arc<L2Table>) {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.offset() == table.offset())
        {
            Some(entry) => *entry = table,
            None => self.insert(table),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, table: Arc<L2Table>) {
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                debug!("Evicting L2 table at {:#x}", evicted.offset());
            }
        }
        self.entries.push_back(table);
    }
}
