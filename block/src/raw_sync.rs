// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, ErrorKind, Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{
    AsyncIo, AsyncIoError, AsyncIoResult, DiskFile, DiskFileError, DiskFileResult, IoCompletion,
};
use crate::DiskTopology;

/// Read as much of `buf` as the file holds at `offset`, zero-filling the
/// part that lies past the end of the file.
pub(crate) fn read_at_zero_filled(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                buf[done..].fill(0);
                break;
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(buf.len())
}

pub struct RawFileDiskSync {
    file: File,
    writable: bool,
}

impl RawFileDiskSync {
    pub fn new(file: File, writable: bool) -> Self {
        RawFileDiskSync { file, writable }
    }
}

impl DiskFile for RawFileDiskSync {
    fn size(&mut self) -> DiskFileResult<u64> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(DiskFileError::Size)
    }

    fn new_async_io(&self, _ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>> {
        let file = self.file.try_clone().map_err(DiskFileError::NewAsyncIo)?;
        Ok(Box::new(RawFileSync::new(file).map_err(DiskFileError::NewAsyncIo)?) as Box<dyn AsyncIo>)
    }

    fn topology(&mut self) -> DiskTopology {
        if let Ok(topology) = DiskTopology::probe(&self.file) {
            topology
        } else {
            warn!("Unable to get device topology. Using default topology");
            DiskTopology::default()
        }
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        FileExt::read_exact_at(&self.file, buf, offset)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        FileExt::write_all_at(&self.file, buf, offset)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        self.file.set_len(len)
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Executes every submission on the spot and queues its completion.
pub struct RawFileSync {
    file: File,
    eventfd: EventFd,
    completion_list: VecDeque<IoCompletion>,
}

impl RawFileSync {
    pub fn new(file: File) -> io::Result<Self> {
        Ok(RawFileSync {
            file,
            eventfd: EventFd::new(libc::EFD_NONBLOCK)?,
            completion_list: VecDeque::new(),
        })
    }

    fn complete(&mut self, user_data: u64, result: io::Result<usize>, buf: Vec<u8>) -> AsyncIoResult<()> {
        self.completion_list.push_back(IoCompletion {
            user_data,
            result,
            buf,
        });
        self.eventfd.write(1).map_err(AsyncIoError::Notify)
    }
}

impl AsyncIo for RawFileSync {
    fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    fn read_at(&mut self, offset: u64, mut buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
        let result = read_at_zero_filled(&self.file, &mut buf, offset);
        self.complete(user_data, result, buf)
    }

    fn write_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
        let result = self.file.write_all_at(&buf, offset).map(|_| buf.len());
        self.complete(user_data, result, buf)
    }

    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()> {
        let result = self.file.sync_all();
        match user_data {
            Some(user_data) => self.complete(user_data, result.map(|_| 0), Vec::new()),
            None => result.map_err(AsyncIoError::Fsync),
        }
    }

    fn next_completed_request(&mut self) -> Option<IoCompletion> {
        self.completion_list.pop_front()
    }
}
