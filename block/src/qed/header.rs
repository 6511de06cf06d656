// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QED header layout, geometry derivation and validation.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use super::{Error, Result};
use crate::SECTOR_SIZE;

/// "QED\0" read as a little-endian u32.
pub const QED_MAGIC: u32 = 0x0044_4551;
/// Backing file names are paths, so they are held to the same limit.
pub const MAX_BACKING_FILE_NAME: usize = libc::PATH_MAX as usize - 1;
/// Size of the fixed part of the header on disk.
pub const HEADER_LEN: usize = 56;

pub const MIN_CLUSTER_SIZE: u32 = 4 * 1024;
pub const MAX_CLUSTER_SIZE: u32 = 64 * 1024 * 1024;
pub const DEFAULT_CLUSTER_SIZE: u32 = 64 * 1024;

// In clusters.
pub const MIN_TABLE_SIZE: u32 = 1;
pub const MAX_TABLE_SIZE: u32 = 16;
pub const DEFAULT_TABLE_SIZE: u32 = 4;

pub(crate) const TABLE_ENTRY_SIZE: u64 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        const BACKING_FILE = 1 << 0;
        const NEED_CHECK = 1 << 1;
        const BACKING_FORMAT_NO_PROBE = 1 << 2;
    }
}

impl Features {
    /// Features understood by this implementation.
    pub const SUPPORTED: Features = Features::all();
}

/// No compat features are defined yet.
pub const COMPAT_FEATURE_MASK: u64 = 0;

/// Format of the parent image a QED file refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackingFormat {
    Raw,
    Qed,
}

impl Display for BackingFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BackingFormat::Raw => write!(f, "raw"),
            BackingFormat::Qed => write!(f, "qed"),
        }
    }
}

impl FromStr for BackingFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(BackingFormat::Raw),
            "qed" => Ok(BackingFormat::Qed),
            _ => Err(Error::UnsupportedBackingFileFormat(s.to_string())),
        }
    }
}

pub fn is_cluster_size_valid(cluster_size: u32) -> bool {
    cluster_size.is_power_of_two() && (MIN_CLUSTER_SIZE..=MAX_CLUSTER_SIZE).contains(&cluster_size)
}

pub fn is_table_size_valid(table_size: u32) -> bool {
    table_size.is_power_of_two() && (MIN_TABLE_SIZE..=MAX_TABLE_SIZE).contains(&table_size)
}

/// Largest virtual size addressable through two table levels.
pub fn max_image_size(cluster_size: u32, table_size: u32) -> u64 {
    let table_nelems = u64::from(cluster_size) * u64::from(table_size) / TABLE_ENTRY_SIZE;
    table_nelems
        .saturating_mul(table_nelems)
        .saturating_mul(u64::from(cluster_size))
}

pub fn is_image_size_valid(image_size: u64, cluster_size: u32, table_size: u32) -> bool {
    image_size != 0
        && image_size % SECTOR_SIZE == 0
        && image_size <= max_image_size(cluster_size, table_size)
}

/// Address arithmetic derived from the cluster and table sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    cluster_size: u64,
    table_size: u64,
    table_nelems: u64,
    l1_shift: u32,
    l2_shift: u32,
    l2_mask: u64,
}

impl Geometry {
    pub fn new(cluster_size: u32, table_size: u32) -> Result<Self> {
        if !is_cluster_size_valid(cluster_size) {
            return Err(Error::InvalidClusterSize(cluster_size));
        }
        if !is_table_size_valid(table_size) {
            return Err(Error::InvalidTableSize(table_size));
        }

        let cluster_size = u64::from(cluster_size);
        let table_size = u64::from(table_size);
        let table_nelems = cluster_size * table_size / TABLE_ENTRY_SIZE;
        let l2_shift = cluster_size.trailing_zeros();
        Ok(Geometry {
            cluster_size,
            table_size,
            table_nelems,
            l1_shift: l2_shift + table_nelems.trailing_zeros(),
            l2_shift,
            l2_mask: table_nelems - 1,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Table size in clusters.
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    pub fn table_nelems(&self) -> u64 {
        self.table_nelems
    }

    pub fn table_bytes(&self) -> u64 {
        self.table_nelems * TABLE_ENTRY_SIZE
    }

    pub fn l1_shift(&self) -> u32 {
        self.l1_shift
    }

    pub fn l2_shift(&self) -> u32 {
        self.l2_shift
    }

    /// Bytes of virtual address space mapped by one L2 table.
    pub fn l2_span(&self) -> u64 {
        1 << self.l1_shift
    }

    pub fn max_image_size(&self) -> u64 {
        self.table_nelems
            .saturating_mul(self.table_nelems)
            .saturating_mul(self.cluster_size)
    }

    pub fn l1_index(&self, pos: u64) -> usize {
        (pos >> self.l1_shift) as usize
    }

    pub fn l2_index(&self, pos: u64) -> usize {
        ((pos >> self.l2_shift) & self.l2_mask) as usize
    }

    pub fn start_of_cluster(&self, pos: u64) -> u64 {
        pos & !(self.cluster_size - 1)
    }

    pub fn offset_into_cluster(&self, pos: u64) -> u64 {
        pos & (self.cluster_size - 1)
    }

    pub fn bytes_to_clusters(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.cluster_size)
    }

    pub fn is_cluster_aligned(&self, offset: u64) -> bool {
        self.offset_into_cluster(offset) == 0
    }

    /// Round a file length up to the next cluster boundary.
    pub fn round_up_to_cluster(&self, len: u64) -> u64 {
        len.div_ceil(self.cluster_size) * self.cluster_size
    }

    /// A table entry is usable when it names a cluster inside the file.
    pub fn is_valid_offset(&self, offset: u64, file_size: u64) -> bool {
        offset != 0 && self.is_cluster_aligned(offset) && offset < file_size
    }

    /// Whether a whole table can live at `offset` in a file of `file_size`.
    pub fn is_valid_table_offset(&self, offset: u64, file_size: u64) -> bool {
        self.is_valid_offset(offset, file_size)
            && offset
                .checked_add(self.table_bytes())
                .is_some_and(|end| end <= file_size)
    }
}

/// The fixed-size QED header, in host byte order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QedHeader {
    pub magic: u32,
    pub cluster_size: u32,
    pub table_size: u32,
    /// In clusters.
    pub header_size: u32,
    pub features: u64,
    pub compat_features: u64,
    pub l1_table_offset: u64,
    pub image_size: u64,
    pub backing_filename_offset: u32,
    pub backing_filename_size: u32,
}

impl QedHeader {
    /// Header for a fresh image, with the L1 table right after the header
    /// cluster.
    pub fn new(image_size: u64, cluster_size: u32, table_size: u32) -> Self {
        QedHeader {
            magic: QED_MAGIC,
            cluster_size,
            table_size,
            header_size: 1,
            features: 0,
            compat_features: 0,
            l1_table_offset: u64::from(cluster_size),
            image_size,
            backing_filename_offset: 0,
            backing_filename_size: 0,
        }
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        QedHeader {
            magic: LittleEndian::read_u32(&buf[0..4]),
            cluster_size: LittleEndian::read_u32(&buf[4..8]),
            table_size: LittleEndian::read_u32(&buf[8..12]),
            header_size: LittleEndian::read_u32(&buf[12..16]),
            features: LittleEndian::read_u64(&buf[16..24]),
            compat_features: LittleEndian::read_u64(&buf[24..32]),
            l1_table_offset: LittleEndian::read_u64(&buf[32..40]),
            image_size: LittleEndian::read_u64(&buf[40..48]),
            backing_filename_offset: LittleEndian::read_u32(&buf[48..52]),
            backing_filename_size: LittleEndian::read_u32(&buf[52..56]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.cluster_size);
        LittleEndian::write_u32(&mut buf[8..12], self.table_size);
        LittleEndian::write_u32(&mut buf[12..16], self.header_size);
        LittleEndian::write_u64(&mut buf[16..24], self.features);
        LittleEndian::write_u64(&mut buf[24..32], self.compat_features);
        LittleEndian::write_u64(&mut buf[32..40], self.l1_table_offset);
        LittleEndian::write_u64(&mut buf[40..48], self.image_size);
        LittleEndian::write_u32(&mut buf[48..52], self.backing_filename_offset);
        LittleEndian::write_u32(&mut buf[52..56], self.backing_filename_size);
        buf
    }

    pub fn features(&self) -> Features {
        Features::from_bits_retain(self.features)
    }

    pub fn set_feature(&mut self, feature: Features, enabled: bool) {
        let mut features = self.features();
        features.set(feature, enabled);
        self.features = features.bits();
    }

    pub fn needs_check(&self) -> bool {
        self.features().contains(Features::NEED_CHECK)
    }

    pub fn has_backing_file(&self) -> bool {
        self.features().contains(Features::BACKING_FILE)
    }

    /// Bytes reserved for the header and the strings stored behind it.
    pub fn header_bytes(&self) -> u64 {
        u64::from(self.header_size) * u64::from(self.cluster_size)
    }

    /// Checks everything that can be checked without reading the tables and
    /// returns the derived geometry. `file_size` is the cluster-rounded
    /// length of the image file.
    pub fn validate(&self, file_size: u64) -> Result<Geometry> {
        if self.magic != QED_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let unsupported = self.features & !Features::SUPPORTED.bits();
        if unsupported != 0 {
            return Err(Error::UnsupportedFeatures(unsupported));
        }

        let geometry = Geometry::new(self.cluster_size, self.table_size)?;

        if !is_image_size_valid(self.image_size, self.cluster_size, self.table_size) {
            return Err(Error::InvalidImageSize(self.image_size));
        }

        if self.header_size == 0 {
            return Err(Error::InvalidHeaderSize(self.header_size));
        }

        if !geometry.is_valid_table_offset(self.l1_table_offset, file_size) {
            return Err(Error::InvalidL1TableOffset(self.l1_table_offset));
        }

        if self.has_backing_file() {
            let end = u64::from(self.backing_filename_offset)
                + u64::from(self.backing_filename_size);
            if end > self.header_bytes()
                || self.backing_filename_size as usize > MAX_BACKING_FILE_NAME
            {
                return Err(Error::BackingFileNameOutOfRange);
            }
        }

        Ok(geometry)
    }
}
