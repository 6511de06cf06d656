// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::DiskTopology;

#[derive(Error, Debug)]
pub enum DiskFileError {
    /// Failed getting disk file size.
    #[error("Failed getting disk file size")]
    Size(#[source] io::Error),
    /// Failed creating a new AsyncIo.
    #[error("Failed creating a new AsyncIo")]
    NewAsyncIo(#[source] io::Error),
}

pub type DiskFileResult<T> = std::result::Result<T, DiskFileError>;

/// Abstraction over the byte-addressable object an image lives in, with
/// support for synchronous positional I/O and for handing out an
/// asynchronous interface.
///
/// The synchronous half is used for metadata that has to be durable before
/// anything else happens (header rewrites, table bootstrap at open).
pub trait DiskFile: Send {
    fn size(&mut self) -> DiskFileResult<u64>;
    fn new_async_io(&self, ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>>;
    fn topology(&mut self) -> DiskTopology {
        DiskTopology::default()
    }
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn fsync(&mut self) -> io::Result<()>;
    /// Whether writes to the underlying object are permitted.
    fn is_writable(&self) -> bool;
}

#[derive(Error, Debug)]
pub enum AsyncIoError {
    /// Failed reading from file.
    #[error("Failed reading from file")]
    Read(#[source] io::Error),
    /// Failed writing to file.
    #[error("Failed writing to file")]
    Write(#[source] io::Error),
    /// Failed synchronizing file.
    #[error("Failed synchronizing file")]
    Fsync(#[source] io::Error),
    /// Failed signalling the completion notifier.
    #[error("Failed signalling the completion notifier")]
    Notify(#[source] io::Error),
}

pub type AsyncIoResult<T> = std::result::Result<T, AsyncIoError>;

/// A finished asynchronous operation.
///
/// `buf` is the buffer that was handed over at submission time. For reads it
/// holds the data; for writes and fsync it is returned untouched so the
/// owner can reuse it.
#[derive(Debug)]
pub struct IoCompletion {
    pub user_data: u64,
    pub result: io::Result<usize>,
    pub buf: Vec<u8>,
}

/// Positional asynchronous I/O.
///
/// Submissions take ownership of their buffer until the matching
/// [`IoCompletion`] is handed back by [`AsyncIo::next_completed_request`].
/// The [`EventFd`] returned by [`AsyncIo::notifier`] is signalled whenever a
/// completion becomes available.
pub trait AsyncIo: Send {
    fn notifier(&self) -> &EventFd;
    fn read_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()>;
    fn write_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()>;
    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()>;
    fn next_completed_request(&mut self) -> Option<IoCompletion>;
}
