// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QED ("QEMU Enhanced Disk") images.
//!
//! A QED file maps a virtual disk onto clusters through two levels of
//! tables. The L1 table is kept in memory; L2 tables are loaded on demand
//! into a bounded cache. Clusters are allocated by appending to the file.
//! Unallocated clusters read as zero, or from the backing image if there is
//! one.
//!
//! Requests run as explicit state machines driven by [`QedImage::process_completions`].
//! Allocating writes are serialized per table through [`lock::TableLocks`].

mod alloc;
mod backing;
mod check;
mod cluster;
pub mod header;
mod l2_cache;
mod lock;
mod request;
mod table;

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::str;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use libc::ENOSPC;
use remain::sorted;
use serde::Serialize;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{AsyncIo, AsyncIoError, DiskFile, DiskFileError};
use crate::qed::alloc::ClusterAllocator;
pub use crate::qed::backing::{BackingRead, RawBacking};
pub use crate::qed::check::CheckResult;
pub use crate::qed::cluster::ClusterKind;
use crate::qed::cluster::{find_cluster, scan_l2, Resolution};
use crate::qed::header::{
    is_cluster_size_valid, is_image_size_valid, BackingFormat, Features, Geometry, QedHeader,
    COMPAT_FEATURE_MASK, DEFAULT_CLUSTER_SIZE, DEFAULT_TABLE_SIZE, HEADER_LEN, MAX_BACKING_FILE_NAME,
    QED_MAGIC,
};
use crate::qed::l2_cache::{L2Cache, L2Table};
use crate::qed::lock::TableLocks;
use crate::qed::request::Request;
use crate::qed::table::{decode_table, TableKind};
use crate::raw_sync::RawFileDiskSync;

/// Nesting depth limit for backing chains.
const MAX_NESTING_DEPTH: u32 = 10;
/// Number of L2 tables kept in memory.
pub const DEFAULT_L2_CACHE_SIZE: usize = 50;
const DEFAULT_RING_DEPTH: u32 = 128;

pub type RequestId = u64;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Backing file io error")]
    BackingFileIo(#[source] io::Error),
    #[error("Backing file name lies outside the header")]
    BackingFileNameOutOfRange,
    #[error("Backing file open error")]
    BackingFileOpen(#[source] Box<Error>),
    #[error("Backing file name is too long: {0} bytes over")]
    BackingFileTooLong(usize),
    #[error("Requests are still in flight")]
    Busy,
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Failed to flush image file")]
    Flushing(#[source] io::Error),
    #[error("Failed to get file size")]
    GettingFileSize(#[source] DiskFileError),
    #[error("Image is opened read-only")]
    ImageReadOnly,
    #[error("Failed to parse backing file name")]
    InvalidBackingFileName(#[source] str::Utf8Error),
    #[error("Invalid cluster size: {0}")]
    InvalidClusterSize(u32),
    #[error("Invalid header size: {0} clusters")]
    InvalidHeaderSize(u32),
    #[error("Invalid image size: {0}")]
    InvalidImageSize(u64),
    #[error("Invalid L1 table offset: {0:#x}")]
    InvalidL1TableOffset(u64),
    #[error("Invalid magic")]
    InvalidMagic,
    #[error("Request of {len} bytes at {offset:#x} is outside the image")]
    InvalidRange { offset: u64, len: u64 },
    #[error("Invalid table size: {0} clusters")]
    InvalidTableSize(u32),
    #[error("Maximum disk nesting depth exceeded")]
    MaxNestingDepthExceeded,
    #[error("Failed creating the asynchronous interface")]
    NewAsyncIo(#[source] DiskFileError),
    #[error("No space left for new clusters")]
    NoSpace,
    #[error("Failed to open file")]
    OpeningFile(#[source] io::Error),
    #[error("Failed to read data")]
    ReadingData(#[source] io::Error),
    #[error("Failed to read header")]
    ReadingHeader(#[source] io::Error),
    #[error("Failed to read table")]
    ReadingTable(#[source] io::Error),
    #[error("Failed to set file size")]
    SettingFileSize(#[source] io::Error),
    #[error("Request {0} can make no progress")]
    Stalled(RequestId),
    #[error("Failed to submit I/O")]
    SubmittingIo(#[source] AsyncIoError),
    #[error("Completion for request {0} arrived without I/O in flight")]
    UnexpectedCompletion(RequestId),
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),
    #[error("Unsupported backing file format: {0}")]
    UnsupportedBackingFileFormat(String),
    #[error("Unsupported compat feature bits: {0:#x}")]
    UnsupportedCompatFeatures(u64),
    #[error("Unsupported feature bits: {0:#x}")]
    UnsupportedFeatures(u64),
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(&'static str),
    #[error("Failed waiting for completions")]
    WaitingForCompletion(#[source] io::Error),
    #[error("Failed to write data")]
    WritingData(#[source] io::Error),
    #[error("Failed to write header")]
    WritingHeader(#[source] io::Error),
    #[error("Failed to write table")]
    WritingTable(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`] for callers that only need to know
/// what kind of failure happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Format,
    Io,
    Unsupported,
    OutOfSpace,
    InvalidArgument,
    Cancelled,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::BackingFileNameOutOfRange
            | Error::InvalidBackingFileName(_)
            | Error::InvalidClusterSize(_)
            | Error::InvalidHeaderSize(_)
            | Error::InvalidImageSize(_)
            | Error::InvalidL1TableOffset(_)
            | Error::InvalidMagic
            | Error::InvalidTableSize(_) => ErrorClass::Format,
            Error::MaxNestingDepthExceeded
            | Error::UnsupportedBackingFileFormat(_)
            | Error::UnsupportedCompatFeatures(_)
            | Error::UnsupportedFeatures(_)
            | Error::UnsupportedOperation(_) => ErrorClass::Unsupported,
            Error::BackingFileTooLong(_)
            | Error::Busy
            | Error::ImageReadOnly
            | Error::InvalidRange { .. }
            | Error::UnknownRequest(_) => ErrorClass::InvalidArgument,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::NoSpace => ErrorClass::OutOfSpace,
            Error::BackingFileOpen(e) => e.class(),
            Error::BackingFileIo(e)
            | Error::Flushing(e)
            | Error::OpeningFile(e)
            | Error::ReadingData(e)
            | Error::ReadingHeader(e)
            | Error::ReadingTable(e)
            | Error::SettingFileSize(e)
            | Error::WaitingForCompletion(e)
            | Error::WritingData(e)
            | Error::WritingHeader(e)
            | Error::WritingTable(e) => {
                if e.raw_os_error() == Some(ENOSPC) {
                    ErrorClass::OutOfSpace
                } else {
                    ErrorClass::Io
                }
            }
            Error::GettingFileSize(_)
            | Error::NewAsyncIo(_)
            | Error::Stalled(_)
            | Error::SubmittingIo(_)
            | Error::UnexpectedCompletion(_) => ErrorClass::Io,
        }
    }
}

/// Whether `buf` starts with the QED magic.
pub fn probe(buf: &[u8]) -> bool {
    buf.len() >= 4 && LittleEndian::read_u32(&buf[..4]) == QED_MAGIC
}

/// Parameters applied when opening an image.
#[derive(Clone, Debug)]
pub struct QedConfig {
    pub read_only: bool,
    /// Maximum number of L2 tables cached in memory.
    pub l2_cache_size: usize,
    pub max_nesting_depth: u32,
    pub ring_depth: u32,
}

impl Default for QedConfig {
    fn default() -> Self {
        QedConfig {
            read_only: false,
            l2_cache_size: DEFAULT_L2_CACHE_SIZE,
            max_nesting_depth: MAX_NESTING_DEPTH,
            ring_depth: DEFAULT_RING_DEPTH,
        }
    }
}

/// Parameters for a new image.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Virtual disk size in bytes.
    pub size: u64,
    pub cluster_size: u32,
    /// L1 and L2 table size in clusters.
    pub table_size: u32,
    pub backing_file: Option<String>,
    pub backing_format: Option<BackingFormat>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            size: 0,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            table_size: DEFAULT_TABLE_SIZE,
            backing_file: None,
            backing_format: None,
        }
    }
}

/// Summary of an open image.
#[derive(Clone, Debug, Serialize)]
pub struct ImageInfo {
    pub cluster_size: u64,
    pub table_size: u64,
    pub image_size: u64,
    pub file_size: u64,
    pub backing_file: Option<String>,
    pub backing_format: Option<String>,
    pub needs_check: bool,
}

/// A finished request. `buf` is the buffer given at submission; for reads
/// it holds the data.
#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub result: Result<usize>,
    pub buf: Vec<u8>,
}

/// An open QED image.
///
/// # Example
///
/// ```no_run
/// # use block::qed::{QedConfig, QedImage};
/// # fn test() -> block::qed::Result<()> {
/// let mut image = QedImage::open_path("disk.qed".as_ref(), &QedConfig::default())?;
/// image.write_at(70000, b"hello")?;
/// let mut buf = [0u8; 5];
/// image.read_at(70000, &mut buf)?;
/// image.close()?;
/// # Ok(())
/// # }
/// ```
pub struct QedImage {
    disk: Box<dyn DiskFile>,
    async_io: Box<dyn AsyncIo>,
    header: QedHeader,
    geometry: Geometry,
    backing_file: Option<String>,
    backing_format: Option<BackingFormat>,
    backing: Option<Box<dyn BackingRead>>,
    l1_table: Vec<u64>,
    l2_cache: L2Cache,
    // Bumped whenever a table update is published.
    l2_generation: u64,
    locks: TableLocks,
    allocator: ClusterAllocator,
    write_granularity: u64,
    read_only: bool,
    next_id: RequestId,
    requests: HashMap<RequestId, Request>,
    // Requests woken from a lock wait, to be resumed.
    ready: VecDeque<RequestId>,
    completed: VecDeque<Completion>,
    in_flight: usize,
}

impl QedImage {
    /// Writes a new, empty image to `disk`, replacing its contents.
    pub fn create(disk: &mut dyn DiskFile, options: &CreateOptions) -> Result<()> {
        let geometry = Geometry::new(options.cluster_size, options.table_size)?;
        if !is_image_size_valid(options.size, options.cluster_size, options.table_size) {
            return Err(Error::InvalidImageSize(options.size));
        }

        let mut header = QedHeader::new(options.size, options.cluster_size, options.table_size);
        let mut header_buf = vec![0u8; header.header_bytes() as usize];
        if let Some(name) = options.backing_file.as_deref() {
            let max_length = (header_buf.len() - HEADER_LEN).min(MAX_BACKING_FILE_NAME);
            if name.len() > max_length {
                return Err(Error::BackingFileTooLong(name.len() - max_length));
            }
            header.set_feature(Features::BACKING_FILE, true);
            header.set_feature(
                Features::BACKING_FORMAT_NO_PROBE,
                options.backing_format == Some(BackingFormat::Raw),
            );
            header.backing_filename_offset = HEADER_LEN as u32;
            header.backing_filename_size = name.len() as u32;
            header_buf[HEADER_LEN..HEADER_LEN + name.len()].copy_from_slice(name.as_bytes());
        }
        header_buf[..HEADER_LEN].copy_from_slice(&header.encode());

        disk.set_len(0).map_err(Error::SettingFileSize)?;
        disk.write_all_at(&header_buf, 0)
            .map_err(Error::WritingHeader)?;
        disk.write_all_at(
            &vec![0u8; geometry.table_bytes() as usize],
            header.l1_table_offset,
        )
        .map_err(Error::WritingTable)?;
        disk.fsync().map_err(Error::Flushing)?;

        info!(
            "Created QED image: size={} cluster_size={} table_size={}",
            options.size, options.cluster_size, options.table_size
        );
        Ok(())
    }

    /// Creates a new image file at `path`.
    pub fn create_path(path: &Path, options: &CreateOptions) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::OpeningFile)?;
        let mut disk = RawFileDiskSync::new(file, true);
        Self::create(&mut disk, options)
    }

    /// Opens the image stored in `disk`. The backing image, if the header
    /// names one, is not opened; see [`QedImage::set_backing`] and
    /// [`QedImage::open_path`].
    pub fn open(mut disk: Box<dyn DiskFile>, config: &QedConfig) -> Result<QedImage> {
        let read_only = config.read_only || !disk.is_writable();

        let mut buf = [0u8; HEADER_LEN];
        disk.read_exact_at(&mut buf, 0)
            .map_err(Error::ReadingHeader)?;
        let header = QedHeader::decode(&buf);
        if header.magic != QED_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let file_len = disk.size().map_err(Error::GettingFileSize)?;
        let file_size = if is_cluster_size_valid(header.cluster_size) {
            file_len.div_ceil(u64::from(header.cluster_size)) * u64::from(header.cluster_size)
        } else {
            file_len
        };
        let geometry = header.validate(file_size)?;

        let backing_file = if header.has_backing_file() {
            let mut name = vec![0u8; header.backing_filename_size as usize];
            disk.read_exact_at(&mut name, u64::from(header.backing_filename_offset))
                .map_err(Error::ReadingHeader)?;
            Some(
                str::from_utf8(&name)
                    .map_err(Error::InvalidBackingFileName)?
                    .to_string(),
            )
        } else {
            None
        };
        let backing_format = if header.features().contains(Features::BACKING_FORMAT_NO_PROBE) {
            Some(BackingFormat::Raw)
        } else {
            None
        };

        let mut l1_bytes = vec![0u8; geometry.table_bytes() as usize];
        disk.read_exact_at(&mut l1_bytes, header.l1_table_offset)
            .map_err(Error::ReadingTable)?;
        let (l1_table, cleared) = decode_table(&l1_bytes, TableKind::L1, &geometry, file_size);
        if cleared > 0 {
            warn!("Ignoring {cleared} invalid L1 table entries");
        }

        let async_io = disk
            .new_async_io(config.ring_depth)
            .map_err(Error::NewAsyncIo)?;
        let write_granularity = disk.topology().write_granularity();

        let mut image = QedImage {
            disk,
            async_io,
            header,
            geometry,
            backing_file,
            backing_format,
            backing: None,
            l1_table,
            l2_cache: L2Cache::new(config.l2_cache_size),
            l2_generation: 0,
            locks: TableLocks::new(),
            allocator: ClusterAllocator::new(geometry.cluster_size(), file_size),
            write_granularity,
            read_only,
            next_id: 0,
            requests: HashMap::new(),
            ready: VecDeque::new(),
            completed: VecDeque::new(),
            in_flight: 0,
        };

        if image.header.needs_check() {
            if read_only {
                warn!("QED image was not closed cleanly, skipping check on read-only image");
            } else {
                warn!("QED image was not closed cleanly, checking");
                let result = image.check(true)?;
                if !result.is_clean() {
                    warn!("QED image check left problems unrepaired: {result:?}");
                }
            }
        }

        info!(
            "Opened QED image: size={} cluster_size={} read_only={}",
            image.header.image_size,
            image.geometry.cluster_size(),
            read_only
        );
        Ok(image)
    }

    /// Opens the image at `path` together with its backing chain. Backing
    /// file names are resolved relative to the directory of the image.
    pub fn open_path(path: &Path, config: &QedConfig) -> Result<QedImage> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path)
            .map_err(Error::OpeningFile)?;
        Self::open_file(file, path, config)
    }

    fn open_file(file: File, path: &Path, config: &QedConfig) -> Result<QedImage> {
        let disk = RawFileDiskSync::new(file, !config.read_only);
        let mut image = Self::open(Box::new(disk), config)?;
        if let Some(name) = image.backing_file.clone() {
            let backing =
                backing::open_backing(path, &name, image.backing_format, config)?;
            image.set_backing(Some(backing));
        }
        Ok(image)
    }

    pub fn set_backing(&mut self, backing: Option<Box<dyn BackingRead>>) {
        self.backing = backing;
    }

    /// Waits for outstanding requests, syncs the file and marks the image
    /// clean. Dropping an image without closing it leaves the
    /// needs-check flag set if the image was written to.
    pub fn close(mut self) -> Result<()> {
        self.drain()?;
        if self.read_only {
            return Ok(());
        }

        self.disk.fsync().map_err(Error::Flushing)?;
        if self.header.needs_check() {
            self.header.set_feature(Features::NEED_CHECK, false);
            self.write_header()?;
        }
        info!("Closed QED image");
        Ok(())
    }

    pub fn header(&self) -> &QedHeader {
        &self.header
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Virtual disk size in bytes.
    pub fn image_size(&self) -> u64 {
        self.header.image_size
    }

    pub fn backing_file(&self) -> Option<&str> {
        self.backing_file.as_deref()
    }

    pub fn backing_format(&self) -> Option<BackingFormat> {
        self.backing_format
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            cluster_size: self.geometry.cluster_size(),
            table_size: self.geometry.table_size(),
            image_size: self.header.image_size,
            file_size: self.allocator.file_size(),
            backing_file: self.backing_file.clone(),
            backing_format: self.backing_format.map(|f| f.to_string()),
            needs_check: self.header.needs_check(),
        }
    }

    /// Resizing is not supported by this format implementation.
    pub fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(Error::UnsupportedOperation("truncate"))
    }

    /// Reports whether the clusters at `pos` are allocated in this image,
    /// and for how many bytes that answer holds.
    pub fn is_allocated(&mut self, pos: u64, len: u64) -> Result<(bool, u64)> {
        let len = len.min(self.header.image_size.saturating_sub(pos));
        if len == 0 {
            return Ok((false, 0));
        }

        let lookup = match find_cluster(&self.geometry, &self.l1_table, &self.l2_cache, pos, len)
        {
            Resolution::Resolved(lookup) => lookup,
            Resolution::LoadL2(offset) => {
                let table = self.load_l2_sync(offset)?;
                let len = cluster::clamp_to_l2_span(&self.geometry, pos, len);
                scan_l2(&self.geometry, table, pos, len)
            }
        };
        Ok((lookup.kind == ClusterKind::Found, lookup.len))
    }

    /// Points the image at a different backing file, or at none. The new
    /// backing image is used the next time the image is opened.
    pub fn change_backing_file(
        &mut self,
        name: Option<&str>,
        format: Option<BackingFormat>,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::ImageReadOnly);
        }
        let unknown_compat = self.header.compat_features & !COMPAT_FEATURE_MASK;
        if name.is_some() && unknown_compat != 0 {
            return Err(Error::UnsupportedCompatFeatures(unknown_compat));
        }

        let mut header = self.header.clone();
        header.set_feature(Features::BACKING_FILE, name.is_some());
        header.set_feature(
            Features::BACKING_FORMAT_NO_PROBE,
            name.is_some() && format == Some(BackingFormat::Raw),
        );
        let name_bytes = name.map(str::as_bytes).unwrap_or_default();
        header.backing_filename_offset = if name.is_some() { HEADER_LEN as u32 } else { 0 };
        header.backing_filename_size = name_bytes.len() as u32;

        if (HEADER_LEN + name_bytes.len()) as u64 > header.header_bytes() {
            return Err(Error::NoSpace);
        }
        if name_bytes.len() > MAX_BACKING_FILE_NAME {
            return Err(Error::BackingFileTooLong(
                name_bytes.len() - MAX_BACKING_FILE_NAME,
            ));
        }

        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(name_bytes);
        self.disk
            .write_all_at(&buf, 0)
            .map_err(Error::WritingHeader)?;
        self.disk.fsync().map_err(Error::WritingHeader)?;

        self.header = header;
        self.backing_file = name.map(str::to_string);
        self.backing_format = if self.header.features().contains(Features::BACKING_FORMAT_NO_PROBE) {
            Some(BackingFormat::Raw)
        } else {
            None
        };
        info!("Changed backing file to {:?}", self.backing_file);
        Ok(())
    }

    /// The event signalled when completions are ready to be processed.
    pub fn notifier(&self) -> &EventFd {
        self.async_io.notifier()
    }

    pub fn next_completed_request(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    /// Reads `buf.len()` bytes at `pos`, waiting for the result.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let id = self.submit_read(pos, vec![0u8; buf.len()])?;
        let completion = self.wait_for(id)?;
        completion.result?;
        buf.copy_from_slice(&completion.buf);
        Ok(())
    }

    /// Writes `buf` at `pos`, waiting for the result.
    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let id = self.submit_write(pos, buf.to_vec())?;
        self.wait_for(id)?.result.map(|_| ())
    }

    pub fn flush(&mut self) -> Result<()> {
        let id = self.submit_flush()?;
        self.wait_for(id)?.result.map(|_| ())
    }

    /// Drives requests until `id` completes and returns its completion.
    fn wait_for(&mut self, id: RequestId) -> Result<Completion> {
        loop {
            self.process_completions();
            if let Some(index) = self.completed.iter().position(|c| c.id == id) {
                if let Some(completion) = self.completed.remove(index) {
                    return Ok(completion);
                }
            }
            if self.in_flight == 0 && self.ready.is_empty() {
                return Err(Error::Stalled(id));
            }
            self.wait_notifier()?;
        }
    }

    /// Drives requests until none is left.
    fn drain(&mut self) -> Result<()> {
        loop {
            self.process_completions();
            if self.requests.is_empty() {
                debug_assert!(self.locks.is_empty());
                return Ok(());
            }
            if self.in_flight == 0 && self.ready.is_empty() {
                let id = self.requests.keys().next().copied().unwrap_or_default();
                return Err(Error::Stalled(id));
            }
            self.wait_notifier()?;
        }
    }

    fn wait_notifier(&self) -> Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.async_io.notifier().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: FFI call with a valid pollfd array of length 1
        let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(Error::WaitingForCompletion(e));
            }
        }
        Ok(())
    }

    /// Writes the fixed header fields and makes them durable.
    fn write_header(&mut self) -> Result<()> {
        self.disk
            .write_all_at(&self.header.encode(), 0)
            .map_err(Error::WritingHeader)?;
        self.disk.fsync().map_err(Error::WritingHeader)
    }

    /// Persists the needs-check flag before the first allocation.
    fn mark_dirty(&mut self) -> Result<()> {
        if self.header.needs_check() {
            return Ok(());
        }

        self.header.set_feature(Features::NEED_CHECK, true);
        if let Err(e) = self.write_header() {
            self.header.set_feature(Features::NEED_CHECK, false);
            return Err(e);
        }
        debug!("Marked QED image as needing a check");
        Ok(())
    }

    /// Loads an L2 table outside the request pipeline.
    fn load_l2_sync(&mut self, offset: u64) -> Result<Arc<L2Table>> {
        let mut bytes = vec![0u8; self.geometry.table_bytes() as usize];
        self.disk
            .read_exact_at(&mut bytes, offset)
            .map_err(Error::ReadingTable)?;
        let (entries, cleared) = decode_table(
            &bytes,
            TableKind::L2,
            &self.geometry,
            self.allocator.file_size(),
        );
        if cleared > 0 {
            warn!("Ignoring {cleared} invalid entries in L2 table at {offset:#x}");
        }
        Ok(self
            .l2_cache
            .commit(Arc::new(L2Table::from_vec(offset, entries))))
    }
}

#[cfg(test)]
mod unit_tests {
    use std::ops::Range;
    use std::os::unix::fs::FileExt;

    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::async_io::{AsyncIoResult, DiskFileResult, IoCompletion};
    use crate::qed::header::TABLE_ENTRY_SIZE;
    use crate::DiskTopology;

    const MIB: u64 = 1024 * 1024;

    fn options(size: u64, cluster_size: u32, table_size: u32) -> CreateOptions {
        CreateOptions {
            size,
            cluster_size,
            table_size,
            ..Default::default()
        }
    }

    fn create_file(options: &CreateOptions) -> File {
        let file = TempFile::new().unwrap().into_file();
        let mut disk = RawFileDiskSync::new(file.try_clone().unwrap(), true);
        QedImage::create(&mut disk, options).unwrap();
        file
    }

    fn open_file(file: &File, config: &QedConfig) -> QedImage {
        let disk = RawFileDiskSync::new(file.try_clone().unwrap(), !config.read_only);
        QedImage::open(Box::new(disk), config).unwrap()
    }

    fn with_image<F>(options: &CreateOptions, mut testfn: F)
    where
        F: FnMut(QedImage, &File),
    {
        let file = create_file(options);
        testfn(open_file(&file, &QedConfig::default()), &file);
    }

    fn header_on_disk(file: &File) -> QedHeader {
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact_at(&mut buf, 0).unwrap();
        QedHeader::decode(&buf)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn create_then_open_unallocated() {
        let file = create_file(&options(MIB, 65536, 4));
        let mut image = open_file(&file, &QedConfig::default());

        assert_eq!(image.image_size(), MIB);
        assert_eq!(image.geometry().cluster_size(), 65536);
        assert_eq!(image.is_allocated(0, MIB).unwrap(), (false, MIB));
        assert!(!image.header().needs_check());
        // Header cluster plus a four cluster L1 table.
        assert_eq!(image.info().file_size, 5 * 65536);
        image.close().unwrap();
    }

    #[test]
    fn create_rejects_invalid_parameters() {
        let mut disk = RawFileDiskSync::new(TempFile::new().unwrap().into_file(), true);
        let err = QedImage::create(&mut disk, &options(MIB, 1000, 4)).unwrap_err();
        assert!(matches!(err, Error::InvalidClusterSize(1000)));
        assert_eq!(err.class(), ErrorClass::Format);

        let err = QedImage::create(&mut disk, &options(MIB, 65536, 3)).unwrap_err();
        assert!(matches!(err, Error::InvalidTableSize(3)));

        let err = QedImage::create(&mut disk, &options(MIB + 1, 65536, 4)).unwrap_err();
        assert!(matches!(err, Error::InvalidImageSize(_)));

        let mut opts = options(MIB, 4096, 1);
        opts.backing_file = Some("x".repeat(4096));
        let err = QedImage::create(&mut disk, &opts).unwrap_err();
        assert!(matches!(err, Error::BackingFileTooLong(56)));
    }

    #[test]
    fn open_rejects_garbage() {
        let file = TempFile::new().unwrap().into_file();
        file.write_all_at(&[0x55u8; 4096], 0).unwrap();
        let disk = RawFileDiskSync::new(file, true);
        let err = QedImage::open(Box::new(disk), &QedConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidMagic));
        assert_eq!(err.class(), ErrorClass::Format);
    }

    #[test]
    fn open_rejects_unknown_features() {
        let file = create_file(&options(MIB, 65536, 4));
        let mut header = header_on_disk(&file);
        header.features |= 0x100;
        file.write_all_at(&header.encode(), 0).unwrap();

        let disk = RawFileDiskSync::new(file, true);
        let err = QedImage::open(Box::new(disk), &QedConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedFeatures(0x100)));
        assert_eq!(err.class(), ErrorClass::Unsupported);
    }

    #[test]
    fn write_read_across_cluster_boundary() {
        with_image(&options(MIB, 65536, 4), |mut image, _| {
            let data = pattern(100, 7);
            image.write_at(70000, &data).unwrap();

            let mut buf = vec![0u8; 100];
            image.read_at(70000, &mut buf).unwrap();
            assert_eq!(buf, data);

            assert_eq!(image.is_allocated(65536, 65536).unwrap(), (true, 65536));
            assert_eq!(image.is_allocated(0, 65536).unwrap(), (false, 65536));

            // The rest of the allocated cluster reads as zero.
            let mut buf = vec![0xffu8; 65536];
            image.read_at(65536, &mut buf).unwrap();
            assert!(buf[..70000 - 65536].iter().all(|&b| b == 0));
            assert_eq!(&buf[70000 - 65536..70100 - 65536], &data[..]);
            assert!(buf[70100 - 65536..].iter().all(|&b| b == 0));
            image.close().unwrap();
        });
    }

    #[test]
    fn write_read_across_l2_tables() {
        // 512 entries of 4k clusters: each L2 table maps 2 MiB.
        with_image(&options(8 * MIB, 4096, 1), |mut image, file| {
            let data = pattern(3 * 4096 + 123, 3);
            let pos = 2 * MIB - 5000;
            image.write_at(pos, &data).unwrap();

            let mut buf = vec![0u8; data.len()];
            image.read_at(pos, &mut buf).unwrap();
            assert_eq!(buf, data);

            assert_ne!(image.l1_table[0], 0);
            assert_ne!(image.l1_table[1], 0);
            image.close().unwrap();

            // Everything survives a reopen.
            let mut image = open_file(file, &QedConfig::default());
            let mut buf = vec![0u8; data.len()];
            image.read_at(pos, &mut buf).unwrap();
            assert_eq!(buf, data);
        });
    }

    #[test]
    fn overwrite_in_place_does_not_allocate() {
        with_image(&options(MIB, 4096, 1), |mut image, _| {
            image.write_at(8192, &pattern(4096, 1)).unwrap();
            let file_size = image.allocator.file_size();

            let data = pattern(1000, 9);
            image.write_at(8192 + 100, &data).unwrap();
            assert_eq!(image.allocator.file_size(), file_size);

            let mut buf = vec![0u8; 1000];
            image.read_at(8192 + 100, &mut buf).unwrap();
            assert_eq!(buf, data);
        });
    }

    #[test]
    fn unallocated_reads_are_idempotent() {
        with_image(&options(MIB, 65536, 4), |mut image, _| {
            let file_size = image.allocator.file_size();
            let mut first = vec![0xaau8; 200_000];
            let mut second = vec![0x55u8; 200_000];
            image.read_at(1000, &mut first).unwrap();
            image.read_at(1000, &mut second).unwrap();

            assert_eq!(first, second);
            assert!(first.iter().all(|&b| b == 0));
            assert_eq!(image.allocator.file_size(), file_size);
            assert!(!image.header().needs_check());
        });
    }

    #[test]
    fn dirty_flag_set_on_first_allocation_and_cleared_on_close() {
        let file = create_file(&options(MIB, 65536, 4));
        let mut image = open_file(&file, &QedConfig::default());
        assert!(!header_on_disk(&file).needs_check());

        image.write_at(0, b"abc").unwrap();
        assert!(header_on_disk(&file).needs_check());

        image.close().unwrap();
        assert!(!header_on_disk(&file).needs_check());
    }

    #[test]
    fn concurrent_allocations_in_one_table_keep_both_entries() {
        with_image(&options(MIB, 4096, 1), |mut image, file| {
            let a = image.submit_write(0, pattern(4096, 1)).unwrap();
            let b = image.submit_write(3 * 4096, pattern(4096, 2)).unwrap();
            // The second write queues on the L1 table lock.
            assert!(image.locks.is_waiting(b));

            image.process_completions();
            let mut done = Vec::new();
            while let Some(completion) = image.next_completed_request() {
                assert_eq!(completion.result.unwrap(), 4096);
                done.push(completion.id);
            }
            done.sort_unstable();
            assert_eq!(done, vec![a, b]);
            assert!(image.locks.is_empty());
            image.close().unwrap();

            let image = open_file(file, &QedConfig::default());
            let l2_offset = image.l1_table[0];
            let mut bytes = vec![0u8; 4096];
            file.read_exact_at(&mut bytes, l2_offset).unwrap();
            let entries = table::decode_raw(&bytes);
            assert_ne!(entries[0], 0);
            assert_ne!(entries[3], 0);
        });
    }

    #[test]
    fn concurrent_writes_to_same_cluster() {
        with_image(&options(MIB, 4096, 1), |mut image, _| {
            image.write_at(0, &pattern(4096, 1)).unwrap();

            let a = image.submit_write(8192, vec![1u8; 100]).unwrap();
            let b = image.submit_write(8192 + 200, vec![2u8; 100]).unwrap();
            assert!(image.locks.is_waiting(b));
            image.process_completions();

            let mut ids = Vec::new();
            while let Some(completion) = image.next_completed_request() {
                completion.result.unwrap();
                ids.push(completion.id);
            }
            ids.sort_unstable();
            assert_eq!(ids, vec![a, b]);

            // The second writer found the cluster allocated after waking.
            let mut buf = vec![0u8; 300];
            image.read_at(8192, &mut buf).unwrap();
            assert!(buf[..100].iter().all(|&b| b == 1));
            assert!(buf[100..200].iter().all(|&b| b == 0));
            assert!(buf[200..].iter().all(|&b| b == 2));
        });
    }

    #[test]
    fn l2_cache_stays_bounded() {
        let file = create_file(&options(64 * MIB, 4096, 1));
        let config = QedConfig {
            l2_cache_size: 2,
            ..Default::default()
        };
        let mut image = open_file(&file, &config);
        for i in 0..8 {
            image.write_at(i * 2 * MIB, &[i as u8 + 1; 16]).unwrap();
            assert!(image.l2_cache.len() <= 2);
        }
        for i in 0..8 {
            let mut buf = [0u8; 16];
            image.read_at(i * 2 * MIB, &mut buf).unwrap();
            assert_eq!(buf, [i as u8 + 1; 16]);
            assert!(image.l2_cache.len() <= 2);
        }
    }

    #[test]
    fn corrupt_l2_entry_reads_as_unallocated() {
        let file = create_file(&options(MIB, 4096, 1));
        let mut image = open_file(&file, &QedConfig::default());
        image.write_at(0, &[0xaa; 4096]).unwrap();
        image.write_at(4096, &[0xbb; 4096]).unwrap();
        let l2_offset = image.l1_table[0];
        image.close().unwrap();

        // Point the second cluster at an unaligned offset.
        file.write_all_at(&(0x1234u64).to_le_bytes(), l2_offset + TABLE_ENTRY_SIZE)
            .unwrap();

        let config = QedConfig {
            read_only: true,
            ..Default::default()
        };
        let mut image = open_file(&file, &config);
        let mut buf = [0u8; 4096];
        image.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4096]);
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 4096]);
        assert_eq!(image.is_allocated(4096, 4096).unwrap(), (false, 4096));
    }

    #[test]
    fn requests_outside_image_are_rejected() {
        with_image(&options(MIB, 65536, 4), |mut image, _| {
            let err = image.submit_read(MIB - 10, vec![0; 20]).unwrap_err();
            assert!(matches!(err, Error::InvalidRange { .. }));
            assert_eq!(err.class(), ErrorClass::InvalidArgument);

            assert!(image.submit_write(u64::MAX, vec![0; 2]).is_err());

            let id = image.submit_read(MIB, Vec::new()).unwrap();
            let completion = image.wait_for(id).unwrap();
            assert_eq!(completion.result.unwrap(), 0);
        });
    }

    #[test]
    fn read_only_image_rejects_writes() {
        let file = create_file(&options(MIB, 65536, 4));
        let config = QedConfig {
            read_only: true,
            ..Default::default()
        };
        let mut image = open_file(&file, &config);
        assert!(image.is_read_only());
        assert!(matches!(
            image.write_at(0, b"x"),
            Err(Error::ImageReadOnly)
        ));
        assert!(matches!(
            image.change_backing_file(Some("base"), None),
            Err(Error::ImageReadOnly)
        ));
    }

    #[test]
    fn truncate_is_unsupported() {
        with_image(&options(MIB, 65536, 4), |mut image, _| {
            let err = image.truncate(2 * MIB).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Unsupported);
        });
    }

    #[test]
    fn flush_completes() {
        with_image(&options(MIB, 65536, 4), |mut image, _| {
            image.write_at(0, b"data").unwrap();
            image.flush().unwrap();
        });
    }

    #[test]
    fn cancel_waiting_request() {
        with_image(&options(MIB, 4096, 1), |mut image, _| {
            let a = image.submit_write(0, vec![1u8; 512]).unwrap();
            let b = image.submit_write(4096, vec![2u8; 512]).unwrap();
            assert!(image.cancel(b));

            let completion = image.next_completed_request().unwrap();
            assert_eq!(completion.id, b);
            assert_eq!(
                completion.result.unwrap_err().class(),
                ErrorClass::Cancelled
            );

            image.process_completions();
            let completion = image.next_completed_request().unwrap();
            assert_eq!(completion.id, a);
            completion.result.unwrap();
            assert!(!image.cancel(b));
            assert_eq!(image.is_allocated(4096, 4096).unwrap(), (false, 4096));
        });
    }

    #[test]
    fn cancel_request_with_io_in_flight() {
        with_image(&options(MIB, 4096, 1), |mut image, _| {
            let a = image.submit_write(0, vec![1u8; 512]).unwrap();
            assert!(image.cancel(a));
            // Nothing completes until the outstanding write has finished.
            assert!(image.next_completed_request().is_none());

            image.process_completions();
            let completion = image.next_completed_request().unwrap();
            assert_eq!(completion.id, a);
            assert!(matches!(completion.result, Err(Error::Cancelled)));
            assert!(image.locks.is_empty());
            assert!(image.requests.is_empty());
        });
    }

    #[test]
    fn backing_image_supplies_unallocated_data() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.as_path().join("base.raw");
        let base: Vec<u8> = pattern(2 * 65536, 11);
        std::fs::write(&base_path, &base).unwrap();

        let child_path = dir.as_path().join("child.qed");
        let opts = CreateOptions {
            size: MIB,
            backing_file: Some("base.raw".to_string()),
            backing_format: Some(BackingFormat::Raw),
            ..Default::default()
        };
        QedImage::create_path(&child_path, &opts).unwrap();

        let mut image = QedImage::open_path(&child_path, &QedConfig::default()).unwrap();
        assert_eq!(image.backing_file(), Some("base.raw"));
        assert_eq!(image.backing_format(), Some(BackingFormat::Raw));

        let mut buf = [0u8; 10];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, &base[..10]);

        // Copy-on-write keeps the untouched parts of the cluster.
        image.write_at(100, b"child").unwrap();
        let mut cluster = vec![0u8; 65536];
        image.read_at(0, &mut cluster).unwrap();
        assert_eq!(&cluster[..100], &base[..100]);
        assert_eq!(&cluster[100..105], b"child");
        assert_eq!(&cluster[105..], &base[105..65536]);

        // Past the end of the backing file reads return zeros.
        let mut tail = [0xffu8; 16];
        image.read_at(3 * 65536, &mut tail).unwrap();
        assert_eq!(tail, [0u8; 16]);
        image.close().unwrap();

        // The parent is untouched.
        assert_eq!(std::fs::read(&base_path).unwrap(), base);
    }

    #[test]
    fn write_across_clusters_copies_head_and_tail_from_backing() {
        let dir = TempDir::new().unwrap();
        let base: Vec<u8> = pattern(4 * 4096, 23);
        std::fs::write(dir.as_path().join("base.raw"), &base).unwrap();

        let child_path = dir.as_path().join("child.qed");
        let opts = CreateOptions {
            backing_file: Some("base.raw".to_string()),
            backing_format: Some(BackingFormat::Raw),
            ..options(MIB, 4096, 1)
        };
        QedImage::create_path(&child_path, &opts).unwrap();

        // Clusters 0 to 2 are written partly: head in 0, tail in 2.
        let data = pattern(5000, 99);
        let mut expected = base.clone();
        expected[4000..9000].copy_from_slice(&data);

        let mut image = QedImage::open_path(&child_path, &QedConfig::default()).unwrap();
        image.write_at(4000, &data).unwrap();
        for pos in [0, 4096, 8192] {
            assert!(image.is_allocated(pos, 4096).unwrap().0);
        }
        assert!(!image.is_allocated(3 * 4096, 4096).unwrap().0);

        let mut buf = vec![0u8; base.len()];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..4000], &base[..4000]);
        assert_eq!(&buf[9000..3 * 4096], &base[9000..3 * 4096]);
        assert_eq!(buf, expected);
        image.close().unwrap();

        let mut image = QedImage::open_path(&child_path, &QedConfig::default()).unwrap();
        let mut buf = vec![0u8; base.len()];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn nested_qed_backing_chain() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.as_path().join("base.qed");
        QedImage::create_path(&base_path, &options(MIB, 4096, 1)).unwrap();
        let mut base = QedImage::open_path(&base_path, &QedConfig::default()).unwrap();
        base.write_at(5000, b"from base").unwrap();
        base.close().unwrap();

        let child_path = dir.as_path().join("child.qed");
        let opts = CreateOptions {
            size: MIB,
            cluster_size: 4096,
            table_size: 1,
            backing_file: Some("base.qed".to_string()),
            backing_format: None,
        };
        QedImage::create_path(&child_path, &opts).unwrap();

        let mut child = QedImage::open_path(&child_path, &QedConfig::default()).unwrap();
        assert_eq!(child.backing_format(), None);
        let mut buf = [0u8; 9];
        child.read_at(5000, &mut buf).unwrap();
        assert_eq!(&buf, b"from base");

        let config = QedConfig {
            max_nesting_depth: 0,
            ..Default::default()
        };
        let err = QedImage::open_path(&child_path, &config).err().unwrap();
        assert!(matches!(err, Error::MaxNestingDepthExceeded));
    }

    #[test]
    fn change_backing_file_rewrites_header() {
        let file = create_file(&options(MIB, 4096, 1));
        let mut image = open_file(&file, &QedConfig::default());
        image
            .change_backing_file(Some("parent.img"), Some(BackingFormat::Raw))
            .unwrap();
        assert_eq!(image.backing_file(), Some("parent.img"));
        image.close().unwrap();

        let mut image = open_file(&file, &QedConfig::default());
        assert_eq!(image.backing_file(), Some("parent.img"));
        assert_eq!(image.backing_format(), Some(BackingFormat::Raw));
        assert!(image.header().has_backing_file());

        let long_name = "p".repeat(4096);
        let err = image
            .change_backing_file(Some(&long_name), None)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::OutOfSpace);

        image.change_backing_file(None, None).unwrap();
        image.close().unwrap();
        let image = open_file(&file, &QedConfig::default());
        assert_eq!(image.backing_file(), None);
        assert!(!image.header().has_backing_file());
    }

    #[test]
    fn backing_file_name_is_capped() {
        // A 64 KiB header has room for names no path can have.
        let long_name = "p".repeat(MAX_BACKING_FILE_NAME + 1);
        let opts = CreateOptions {
            backing_file: Some(long_name.clone()),
            ..options(MIB, 65536, 1)
        };
        let file = TempFile::new().unwrap().into_file();
        let mut disk = RawFileDiskSync::new(file.try_clone().unwrap(), true);
        assert!(matches!(
            QedImage::create(&mut disk, &opts),
            Err(Error::BackingFileTooLong(1))
        ));

        let file = create_file(&options(MIB, 65536, 1));
        let mut image = open_file(&file, &QedConfig::default());
        assert!(matches!(
            image.change_backing_file(Some(&long_name), None),
            Err(Error::BackingFileTooLong(1))
        ));
        image.close().unwrap();

        // A header naming an oversized string is refused before it is read.
        let mut header = header_on_disk(&file);
        header.set_feature(Features::BACKING_FILE, true);
        header.backing_filename_offset = HEADER_LEN as u32;
        header.backing_filename_size = 60000;
        file.write_all_at(&header.encode(), 0).unwrap();
        let disk = RawFileDiskSync::new(file.try_clone().unwrap(), false);
        let config = QedConfig {
            read_only: true,
            ..Default::default()
        };
        assert!(matches!(
            QedImage::open(Box::new(disk), &config),
            Err(Error::BackingFileNameOutOfRange)
        ));
    }

    #[test]
    fn change_backing_file_refuses_unknown_compat_features() {
        let file = create_file(&options(MIB, 4096, 1));
        let mut header = header_on_disk(&file);
        header.compat_features = 0x4;
        file.write_all_at(&header.encode(), 0).unwrap();

        let mut image = open_file(&file, &QedConfig::default());
        assert!(matches!(
            image.change_backing_file(Some("parent"), None),
            Err(Error::UnsupportedCompatFeatures(0x4))
        ));
    }

    #[test]
    fn probe_magic() {
        assert!(probe(b"QED\0rest"));
        assert!(!probe(b"QFI\xfb"));
        assert!(!probe(b"QE"));
    }

    // Fails every write touching `range`, for crash simulation.
    struct FailingDisk {
        inner: RawFileDiskSync,
        range: Range<u64>,
    }

    struct FailingIo {
        inner: Box<dyn AsyncIo>,
        range: Range<u64>,
        failed: VecDeque<IoCompletion>,
    }

    impl DiskFile for FailingDisk {
        fn size(&mut self) -> DiskFileResult<u64> {
            self.inner.size()
        }

        fn new_async_io(&self, ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>> {
            Ok(Box::new(FailingIo {
                inner: self.inner.new_async_io(ring_depth)?,
                range: self.range.clone(),
                failed: VecDeque::new(),
            }))
        }

        fn topology(&mut self) -> DiskTopology {
            self.inner.topology()
        }

        fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
            self.inner.read_exact_at(buf, offset)
        }

        fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
            self.inner.write_all_at(buf, offset)
        }

        fn set_len(&mut self, len: u64) -> io::Result<()> {
            self.inner.set_len(len)
        }

        fn fsync(&mut self) -> io::Result<()> {
            self.inner.fsync()
        }

        fn is_writable(&self) -> bool {
            self.inner.is_writable()
        }
    }

    impl AsyncIo for FailingIo {
        fn notifier(&self) -> &EventFd {
            self.inner.notifier()
        }

        fn read_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
            self.inner.read_at(offset, buf, user_data)
        }

        fn write_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
            let end = offset + buf.len() as u64;
            if offset < self.range.end && end > self.range.start {
                self.failed.push_back(IoCompletion {
                    user_data,
                    result: Err(io::Error::from_raw_os_error(libc::EIO)),
                    buf,
                });
                self.inner.notifier().write(1).unwrap();
                return Ok(());
            }
            self.inner.write_at(offset, buf, user_data)
        }

        fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()> {
            self.inner.fsync(user_data)
        }

        fn next_completed_request(&mut self) -> Option<IoCompletion> {
            self.failed
                .pop_front()
                .or_else(|| self.inner.next_completed_request())
        }
    }

    #[test]
    fn interrupted_allocation_leaves_image_flagged() {
        let opts = options(MIB, 4096, 1);
        let file = create_file(&opts);
        let header = header_on_disk(&file);
        let l1_start = header.l1_table_offset;

        let disk = FailingDisk {
            inner: RawFileDiskSync::new(file.try_clone().unwrap(), true),
            range: l1_start..l1_start + 4096,
        };
        let mut image = QedImage::open(Box::new(disk), &QedConfig::default()).unwrap();
        let err = image.write_at(0, &[0xcc; 4096]).unwrap_err();
        assert!(matches!(err, Error::WritingTable(_)));
        assert_eq!(err.class(), ErrorClass::Io);
        // Simulated crash: the image is never closed.
        drop(image);

        assert!(header_on_disk(&file).needs_check());
        let config = QedConfig {
            read_only: true,
            ..Default::default()
        };
        let mut image = open_file(&file, &config);
        assert!(image.header().needs_check());
        // The write never became visible.
        let mut buf = [0xffu8; 4096];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4096]);

        // A writable open checks the image and clears the flag.
        let image = open_file(&file, &QedConfig::default());
        assert!(!image.header().needs_check());
        assert!(!header_on_disk(&file).needs_check());
    }

    #[test]
    fn failed_request_does_not_affect_others() {
        let file = create_file(&options(4 * MIB, 4096, 1));
        let l1_start = header_on_disk(&file).l1_table_offset;

        let mut image = open_file(&file, &QedConfig::default());
        image.write_at(0, &[1u8; 4096]).unwrap();
        image.close().unwrap();

        // L1 updates fail; the L2 table for the first 2 MiB already exists.
        let disk = FailingDisk {
            inner: RawFileDiskSync::new(file.try_clone().unwrap(), true),
            range: l1_start..l1_start + 4096,
        };
        let mut image = QedImage::open(Box::new(disk), &QedConfig::default()).unwrap();
        let failing = image.submit_write(2 * MIB, vec![3u8; 4096]).unwrap();
        let ok = image.submit_write(4096, vec![2u8; 4096]).unwrap();
        image.process_completions();

        let mut results = HashMap::new();
        while let Some(completion) = image.next_completed_request() {
            results.insert(completion.id, completion.result);
        }
        assert!(matches!(results.remove(&failing), Some(Err(Error::WritingTable(_)))));
        assert_eq!(results.remove(&ok).unwrap().unwrap(), 4096);
        assert!(image.locks.is_empty());

        let mut buf = [0u8; 4096];
        image.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 4096]);
        image.read_at(2 * MIB, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4096]);
    }
}
