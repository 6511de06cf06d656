// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Serialization of L1/L2 tables.
//!
//! A table is `table_nelems` little-endian u64 cluster offsets. Tables are
//! read whole and written either whole or as an aligned sub-range.

use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use super::header::{Geometry, TABLE_ENTRY_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Entries point to L2 tables.
    L1,
    /// Entries point to data clusters.
    L2,
}

impl TableKind {
    /// Whether a nonzero entry names something that fits inside the file:
    /// a whole L2 table for L1 entries, one cluster for L2 entries.
    pub fn is_valid_entry(self, geometry: &Geometry, entry: u64, file_size: u64) -> bool {
        match self {
            TableKind::L1 => geometry.is_valid_table_offset(entry, file_size),
            TableKind::L2 => geometry.is_valid_offset(entry, file_size),
        }
    }
}

/// Decode a table read from disk.
///
/// Entries that are not zero and do not name something inside the file are
/// what an interrupted update leaves behind; they are cleared so the
/// cluster reads as unallocated. Returns the table and the number of
/// entries cleared.
pub fn decode_table(
    bytes: &[u8],
    kind: TableKind,
    geometry: &Geometry,
    file_size: u64,
) -> (Vec<u64>, usize) {
    let mut entries = vec![0u64; bytes.len() / TABLE_ENTRY_SIZE as usize];
    LittleEndian::read_u64_into(&bytes[..entries.len() * TABLE_ENTRY_SIZE as usize], &mut entries);

    let mut cleared = 0;
    for entry in entries.iter_mut() {
        if *entry != 0 && !kind.is_valid_entry(geometry, *entry, file_size) {
            *entry = 0;
            cleared += 1;
        }
    }
    (entries, cleared)
}

/// Decode without validation, for the consistency checker.
pub fn decode_raw(bytes: &[u8]) -> Vec<u64> {
    let mut entries = vec![0u64; bytes.len() / TABLE_ENTRY_SIZE as usize];
    LittleEndian::read_u64_into(&bytes[..entries.len() * TABLE_ENTRY_SIZE as usize], &mut entries);
    entries
}

pub fn encode_entries(entries: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0u8; entries.len() * TABLE_ENTRY_SIZE as usize];
    LittleEndian::write_u64_into(entries, &mut bytes);
    bytes
}

/// Entry range to write so that `index..index + n` is covered and the write
/// starts and ends on a multiple of `granularity` bytes, clamped to the
/// table.
pub fn write_range(index: usize, n: usize, table_nelems: usize, granularity: u64) -> Range<usize> {
    let per_unit = (granularity / TABLE_ENTRY_SIZE).max(1) as usize;
    let start = index - index % per_unit;
    let end = (index + n).div_ceil(per_unit) * per_unit;
    start..end.min(table_nelems)
}

/// File offset of entry `index` in a table stored at `table_offset`.
pub fn entry_offset(table_offset: u64, index: usize) -> u64 {
    table_offset + index as u64 * TABLE_ENTRY_SIZE
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(4096, 1).unwrap()
    }

    #[test]
    fn decode_little_endian_entries() {
        let mut bytes = vec![0u8; 4096];
        bytes[8..16].copy_from_slice(&0x3000u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0x4000u64.to_le_bytes());

        let (entries, cleared) = decode_table(&bytes, TableKind::L2, &geometry(), 0x1_0000);
        assert_eq!(entries.len(), 512);
        assert_eq!(cleared, 0);
        assert_eq!(entries[0], 0);
        assert_eq!(entries[1], 0x3000);
        assert_eq!(entries[2], 0x4000);
    }

    #[test]
    fn invalid_entries_read_as_unallocated() {
        let mut bytes = vec![0u8; 4096];
        // unaligned
        bytes[0..8].copy_from_slice(&0x3001u64.to_le_bytes());
        // at end of file
        bytes[8..16].copy_from_slice(&0x1_0000u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0xf000u64.to_le_bytes());

        let (entries, cleared) = decode_table(&bytes, TableKind::L2, &geometry(), 0x1_0000);
        assert_eq!(cleared, 2);
        assert_eq!(entries[0], 0);
        assert_eq!(entries[1], 0);
        assert_eq!(entries[2], 0xf000);

        let raw = decode_raw(&bytes);
        assert_eq!(raw[0], 0x3001);
        assert_eq!(raw[1], 0x1_0000);
    }

    #[test]
    fn l1_entries_need_room_for_a_whole_table() {
        // Two-cluster tables.
        let geometry = Geometry::new(4096, 2).unwrap();
        let mut bytes = vec![0u8; 8192];
        bytes[0..8].copy_from_slice(&0xe000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&0xf000u64.to_le_bytes());

        let (l1, cleared) = decode_table(&bytes, TableKind::L1, &geometry, 0x1_0000);
        assert_eq!(cleared, 1);
        assert_eq!(&l1[..2], &[0xe000, 0]);

        let (l2, cleared) = decode_table(&bytes, TableKind::L2, &geometry, 0x1_0000);
        assert_eq!(cleared, 0);
        assert_eq!(&l2[..2], &[0xe000, 0xf000]);
    }

    #[test]
    fn encode_is_little_endian() {
        let bytes = encode_entries(&[0x0102_0304_0506_0708, 0]);
        assert_eq!(
            bytes,
            vec![8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn partial_writes_are_aligned() {
        // 512 byte sectors hold 64 entries.
        assert_eq!(write_range(3, 1, 512, 512), 0..64);
        assert_eq!(write_range(63, 2, 512, 512), 0..128);
        assert_eq!(write_range(500, 12, 512, 512), 448..512);
        assert_eq!(write_range(64, 64, 512, 512), 64..128);
        // 4k granularity covers the whole of a 4k table.
        assert_eq!(write_range(10, 1, 512, 4096), 0..512);
        // Granularity smaller than one entry degrades to exact writes.
        assert_eq!(write_range(10, 3, 512, 1), 10..13);
        assert_eq!(entry_offset(0x1_0000, 64), 0x1_0200);
    }
}
