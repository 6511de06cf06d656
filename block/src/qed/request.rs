// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Request pipeline.
//!
//! Every request walks its byte range one segment at a time. A segment is
//! whatever [`find_cluster`] returns: a run of clusters that are all
//! allocated and contiguous, or all unallocated. Each step that needs I/O
//! submits it and parks the request in a [`Stage`]; the completion picks it
//! up again.
//!
//! Allocating writes go through copy-on-write of the partial head and tail
//! clusters, the data write, the L2 update and, for a new L2 table, the L1
//! update. Only after the tables are on disk is the new L2 table published
//! to the cache and the table lock released.

use std::io;
use std::ops::Range;
use std::sync::Arc;

use super::cluster::{clamp_to_l2_span, find_cluster, scan_l2, ClusterKind, ClusterLookup, Resolution};
use super::l2_cache::L2Table;
use super::table::{decode_table, encode_entries, entry_offset, write_range, TableKind};
use super::{Completion, Error, QedImage, RequestId, Result};
use crate::async_io::IoCompletion;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Flush,
}

/// Clusters claimed by an allocating write and the L2 table they go into.
#[derive(Debug)]
pub struct Allocation {
    kind: ClusterKind,
    // Offset of the first new cluster.
    cluster: u64,
    nclusters: u64,
    table: L2Table,
}

#[derive(Debug)]
pub enum Stage {
    Resolve,
    WaitLock,
    LoadL2 { l2_offset: u64, generation: u64 },
    ReadData,
    WriteData,
    CowHead(Allocation),
    CowTail(Allocation),
    WriteNewData(Allocation),
    WriteL2(Allocation),
    WriteL1(Allocation),
    Flush,
}

impl Stage {
    fn io_error(&self, e: io::Error) -> Error {
        match self {
            Stage::LoadL2 { .. } => Error::ReadingTable(e),
            Stage::ReadData => Error::ReadingData(e),
            Stage::WriteL2(_) | Stage::WriteL1(_) => Error::WritingTable(e),
            Stage::Flush => Error::Flushing(e),
            _ => Error::WritingData(e),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    kind: RequestKind,
    buf: Vec<u8>,
    start: u64,
    pos: u64,
    end: u64,
    // Length of the segment being worked on.
    seg_len: u64,
    stage: Stage,
    cancelled: bool,
}

impl Request {
    pub fn new(kind: RequestKind, pos: u64, buf: Vec<u8>) -> Self {
        let end = pos + buf.len() as u64;
        Request {
            kind,
            buf,
            start: pos,
            pos,
            end,
            seg_len: 0,
            stage: if kind == RequestKind::Flush {
                Stage::Flush
            } else {
                Stage::Resolve
            },
            cancelled: false,
        }
    }

    pub fn has_io_in_flight(&self) -> bool {
        !matches!(self.stage, Stage::Resolve | Stage::WaitLock)
    }

    fn seg_range(&self) -> Range<usize> {
        let start = (self.pos - self.start) as usize;
        start..start + self.seg_len as usize
    }

    fn advance(&mut self) {
        self.pos += self.seg_len;
        self.seg_len = 0;
        self.stage = Stage::Resolve;
    }
}

/// What a request does after a step.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// Segment finished without I/O, look at the next one.
    Next,
    /// Parked until an I/O completion or a lock wake-up.
    Suspend,
    Done,
}

impl QedImage {
    pub fn submit_read(&mut self, pos: u64, buf: Vec<u8>) -> Result<RequestId> {
        self.check_range(pos, buf.len() as u64)?;
        Ok(self.start_request(Request::new(RequestKind::Read, pos, buf)))
    }

    /// Writes are not durable until a flush has completed.
    pub fn submit_write(&mut self, pos: u64, buf: Vec<u8>) -> Result<RequestId> {
        if self.read_only {
            return Err(Error::ImageReadOnly);
        }
        self.check_range(pos, buf.len() as u64)?;
        Ok(self.start_request(Request::new(RequestKind::Write, pos, buf)))
    }

    pub fn submit_flush(&mut self) -> Result<RequestId> {
        let id = self.next_request_id();
        self.async_io
            .fsync(Some(id))
            .map_err(Error::SubmittingIo)?;
        self.in_flight += 1;
        self.requests
            .insert(id, Request::new(RequestKind::Flush, 0, Vec::new()));
        Ok(id)
    }

    /// Processes finished I/O and resumes woken requests until nothing more
    /// can be done without waiting. Finished requests are then available
    /// from [`QedImage::next_completed_request`].
    pub fn process_completions(&mut self) {
        if let Err(e) = self.async_io.notifier().read() {
            if e.kind() != io::ErrorKind::WouldBlock {
                warn!("Failed to read completion notifier: {e}");
            }
        }

        loop {
            if let Some(completion) = self.async_io.next_completed_request() {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.complete_io(completion);
            } else if let Some(id) = self.ready.pop_front() {
                self.resume(id);
            } else {
                break;
            }
        }
    }

    /// Cancels a request. A request waiting for a table lock completes with
    /// [`Error::Cancelled`] right away; one with I/O in flight does once
    /// that I/O has finished. Returns false for unknown requests.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        if self.locks.cancel_waiter(id) {
            if let Some(req) = self.requests.remove(&id) {
                self.finish(id, req, Err(Error::Cancelled));
            }
            return true;
        }

        match self.requests.get_mut(&id) {
            Some(req) => {
                req.cancelled = true;
                if !req.has_io_in_flight() {
                    self.ready.push_back(id);
                }
                true
            }
            None => false,
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.header.image_size => Ok(()),
            _ => Err(Error::InvalidRange { offset, len }),
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn start_request(&mut self, req: Request) -> RequestId {
        let id = self.next_request_id();
        self.drive(id, req, None);
        id
    }

    fn complete_io(&mut self, completion: IoCompletion) {
        let id = completion.user_data;
        match self.requests.remove(&id) {
            Some(req) => self.drive(id, req, Some(completion)),
            None => warn!("Completion for unknown request {id}"),
        }
    }

    fn resume(&mut self, id: RequestId) {
        let Some(mut req) = self.requests.remove(&id) else {
            return;
        };
        if matches!(req.stage, Stage::WaitLock) {
            req.stage = Stage::Resolve;
        }
        self.drive(id, req, None);
    }

    /// Runs `req` until it parks or finishes. The request is kept out of the
    /// request map while it runs.
    fn drive(&mut self, id: RequestId, mut req: Request, completion: Option<IoCompletion>) {
        let flow = match completion {
            Some(completion) if req.cancelled => {
                self.commit_landed_tables(&mut req, completion);
                Err(Error::Cancelled)
            }
            None if req.cancelled => Err(Error::Cancelled),
            Some(completion) => self.io_done(id, &mut req, completion),
            None => self.step(id, &mut req),
        };

        match flow {
            Ok(Flow::Suspend) => {
                self.requests.insert(id, req);
            }
            Ok(_) => self.finish(id, req, Ok(())),
            Err(e) => self.finish(id, req, Err(e)),
        }
        self.ready.extend(self.locks.take_woken());
    }

    fn finish(&mut self, id: RequestId, req: Request, result: Result<()>) {
        self.locks.unlock(id);
        self.ready.extend(self.locks.take_woken());

        let result = result.map(|()| (req.end - req.start) as usize);
        match &result {
            Ok(_) | Err(Error::Cancelled) => {}
            Err(e) => error!("QED {:?} request {id} failed: {e}", req.kind),
        }
        self.completed.push_back(Completion {
            id,
            result,
            buf: req.buf,
        });
        if let Err(e) = self.async_io.notifier().write(1) {
            warn!("Failed to signal completion: {e}");
        }
    }

    fn step(&mut self, id: RequestId, req: &mut Request) -> Result<Flow> {
        match req.stage {
            Stage::Resolve => self.resolve(id, req),
            _ => Ok(Flow::Suspend),
        }
    }

    fn io_done(&mut self, id: RequestId, req: &mut Request, completion: IoCompletion) -> Result<Flow> {
        let stage = std::mem::replace(&mut req.stage, Stage::Resolve);
        if let Err(e) = completion.result {
            return Err(stage.io_error(e));
        }

        match stage {
            Stage::LoadL2 {
                l2_offset,
                generation,
            } => self.l2_loaded(id, req, l2_offset, generation, &completion.buf),
            Stage::ReadData => {
                let range = req.seg_range();
                req.buf[range].copy_from_slice(&completion.buf);
                req.advance();
                self.resolve(id, req)
            }
            Stage::WriteData => {
                req.advance();
                self.resolve(id, req)
            }
            Stage::CowHead(alloc) => self.cow_tail(id, req, alloc),
            Stage::CowTail(alloc) => self.write_new_data(id, req, alloc),
            Stage::WriteNewData(alloc) => self.update_l2(id, req, alloc),
            Stage::WriteL2(alloc) => {
                if alloc.kind == ClusterKind::L1Miss {
                    self.update_l1(id, req, alloc)
                } else {
                    self.publish(id, req, alloc)
                }
            }
            Stage::WriteL1(alloc) => {
                self.set_l1_entry(req.pos, &alloc);
                self.publish(id, req, alloc)
            }
            Stage::Flush => Ok(Flow::Done),
            Stage::Resolve | Stage::WaitLock => Err(Error::UnexpectedCompletion(id)),
        }
    }

    /// A cancelled request stops at its next completion. A table write that
    /// has already landed must still reach the in-memory tables, or they
    /// would disagree with the file.
    fn commit_landed_tables(&mut self, req: &mut Request, completion: IoCompletion) {
        if completion.result.is_err() {
            return;
        }
        match std::mem::replace(&mut req.stage, Stage::Resolve) {
            Stage::WriteL2(alloc) if alloc.kind == ClusterKind::L2Miss => {
                self.publish_table(alloc);
            }
            Stage::WriteL1(alloc) => {
                self.set_l1_entry(req.pos, &alloc);
                self.publish_table(alloc);
            }
            // Clusters nothing points to yet are leaked.
            _ => {}
        }
    }

    fn set_l1_entry(&mut self, pos: u64, alloc: &Allocation) {
        let index = self.geometry.l1_index(pos);
        self.l1_table[index] = alloc.table.offset();
    }

    fn resolve(&mut self, id: RequestId, req: &mut Request) -> Result<Flow> {
        loop {
            if req.pos >= req.end {
                return Ok(Flow::Done);
            }

            let lookup = match find_cluster(
                &self.geometry,
                &self.l1_table,
                &self.l2_cache,
                req.pos,
                req.end - req.pos,
            ) {
                Resolution::Resolved(lookup) => lookup,
                Resolution::LoadL2(l2_offset) => {
                    req.stage = Stage::LoadL2 {
                        l2_offset,
                        generation: self.l2_generation,
                    };
                    self.queue_read(id, l2_offset, self.geometry.table_bytes())?;
                    return Ok(Flow::Suspend);
                }
            };

            match self.dispatch(id, req, lookup)? {
                Flow::Next => continue,
                flow => return Ok(flow),
            }
        }
    }

    fn l2_loaded(
        &mut self,
        id: RequestId,
        req: &mut Request,
        l2_offset: u64,
        generation: u64,
        bytes: &[u8],
    ) -> Result<Flow> {
        let table = match self.l2_cache.find(l2_offset) {
            Some(table) => table,
            // A table update was published while this load was in flight, so
            // the bytes read may predate it.
            None if generation != self.l2_generation => {
                debug!("Reloading L2 table at {l2_offset:#x}");
                return self.resolve(id, req);
            }
            None => {
                let (entries, cleared) =
                    decode_table(bytes, TableKind::L2, &self.geometry, self.allocator.file_size());
                if cleared > 0 {
                    warn!("Ignoring {cleared} invalid entries in L2 table at {l2_offset:#x}");
                }
                self.l2_cache
                    .commit(Arc::new(L2Table::from_vec(l2_offset, entries)))
            }
        };

        let len = clamp_to_l2_span(&self.geometry, req.pos, req.end - req.pos);
        let lookup = scan_l2(&self.geometry, table, req.pos, len);
        match self.dispatch(id, req, lookup)? {
            Flow::Next => self.resolve(id, req),
            flow => Ok(flow),
        }
    }

    fn dispatch(&mut self, id: RequestId, req: &mut Request, lookup: ClusterLookup) -> Result<Flow> {
        req.seg_len = lookup.len;
        match req.kind {
            RequestKind::Read => self.read_segment(id, req, lookup),
            RequestKind::Write => self.write_segment(id, req, lookup),
            RequestKind::Flush => Ok(Flow::Done),
        }
    }

    fn read_segment(&mut self, id: RequestId, req: &mut Request, lookup: ClusterLookup) -> Result<Flow> {
        if lookup.kind == ClusterKind::Found {
            req.stage = Stage::ReadData;
            self.queue_read(id, lookup.offset, req.seg_len)?;
            return Ok(Flow::Suspend);
        }

        let range = req.seg_range();
        match self.backing.as_mut() {
            Some(backing) => backing
                .read_at(req.pos, &mut req.buf[range])
                .map_err(Error::BackingFileIo)?,
            None => req.buf[range].fill(0),
        }
        req.advance();
        Ok(Flow::Next)
    }

    fn write_segment(&mut self, id: RequestId, req: &mut Request, lookup: ClusterLookup) -> Result<Flow> {
        if lookup.kind == ClusterKind::Found {
            // Overwriting allocated clusters touches no table.
            self.locks.unlock(id);
            req.stage = Stage::WriteData;
            let data = req.buf[req.seg_range()].to_vec();
            self.queue_write(id, lookup.offset, data)?;
            return Ok(Flow::Suspend);
        }

        let key = match (&lookup.kind, &lookup.l2_table) {
            (ClusterKind::L2Miss, Some(table)) => table.offset(),
            _ => self.header.l1_table_offset,
        };
        if !self.locks.lock(key, id) {
            req.stage = Stage::WaitLock;
            return Ok(Flow::Suspend);
        }

        self.mark_dirty()?;
        let intra = self.geometry.offset_into_cluster(req.pos);
        let nclusters = self.geometry.bytes_to_clusters(intra + req.seg_len);
        let cluster = self.allocator.allocate(nclusters)?;
        let table = match lookup.l2_table {
            Some(table) if lookup.kind == ClusterKind::L2Miss => L2Table::clone(&table),
            _ => self
                .l2_cache
                .alloc_entry(self.geometry.table_nelems() as usize),
        };

        self.cow_head(
            id,
            req,
            Allocation {
                kind: lookup.kind,
                cluster,
                nclusters,
                table,
            },
        )
    }

    /// Fills `len` bytes of a new cluster from the backing image, or with
    /// zeros, starting at guest offset `pos`.
    fn copy_on_write(&mut self, id: RequestId, pos: u64, len: u64, dest: u64) -> Result<()> {
        let mut data = vec![0u8; len as usize];
        if let Some(backing) = self.backing.as_mut() {
            backing
                .read_at(pos, &mut data)
                .map_err(Error::BackingFileIo)?;
        }
        self.queue_write(id, dest, data)
    }

    fn cow_head(&mut self, id: RequestId, req: &mut Request, alloc: Allocation) -> Result<Flow> {
        let start = self.geometry.start_of_cluster(req.pos);
        let len = req.pos - start;
        if len == 0 {
            return self.cow_tail(id, req, alloc);
        }

        let dest = alloc.cluster;
        req.stage = Stage::CowHead(alloc);
        self.copy_on_write(id, start, len, dest)?;
        Ok(Flow::Suspend)
    }

    fn cow_tail(&mut self, id: RequestId, req: &mut Request, alloc: Allocation) -> Result<Flow> {
        let start = self.geometry.start_of_cluster(req.pos);
        let pos = req.pos + req.seg_len;
        // Nothing past the end of the image is ever read.
        let end = (start + alloc.nclusters * self.geometry.cluster_size())
            .min(self.header.image_size);
        if pos >= end {
            return self.write_new_data(id, req, alloc);
        }

        let dest = alloc.cluster + (pos - start);
        req.stage = Stage::CowTail(alloc);
        self.copy_on_write(id, pos, end - pos, dest)?;
        Ok(Flow::Suspend)
    }

    fn write_new_data(&mut self, id: RequestId, req: &mut Request, alloc: Allocation) -> Result<Flow> {
        let dest = alloc.cluster + self.geometry.offset_into_cluster(req.pos);
        let data = req.buf[req.seg_range()].to_vec();
        req.stage = Stage::WriteNewData(alloc);
        self.queue_write(id, dest, data)?;
        Ok(Flow::Suspend)
    }

    fn update_l2(&mut self, id: RequestId, req: &mut Request, mut alloc: Allocation) -> Result<Flow> {
        let index = self.geometry.l2_index(req.pos);
        let cluster_size = self.geometry.cluster_size();
        for i in 0..alloc.nclusters {
            alloc.table[index + i as usize] = alloc.cluster + i * cluster_size;
        }

        let (offset, bytes) = if alloc.kind == ClusterKind::L1Miss {
            let offset = self.allocator.allocate(self.geometry.table_size())?;
            alloc.table.set_offset(offset);
            (offset, encode_entries(alloc.table.entries()))
        } else {
            let range = write_range(
                index,
                alloc.nclusters as usize,
                alloc.table.len(),
                self.write_granularity,
            );
            (
                entry_offset(alloc.table.offset(), range.start),
                encode_entries(&alloc.table.entries()[range]),
            )
        };

        req.stage = Stage::WriteL2(alloc);
        self.queue_write(id, offset, bytes)?;
        Ok(Flow::Suspend)
    }

    fn update_l1(&mut self, id: RequestId, req: &mut Request, alloc: Allocation) -> Result<Flow> {
        let index = self.geometry.l1_index(req.pos);
        let range = write_range(index, 1, self.l1_table.len(), self.write_granularity);
        // The in-memory L1 table changes only once the write has landed.
        let mut entries = self.l1_table[range.clone()].to_vec();
        entries[index - range.start] = alloc.table.offset();

        req.stage = Stage::WriteL1(alloc);
        self.queue_write(
            id,
            entry_offset(self.header.l1_table_offset, range.start),
            encode_entries(&entries),
        )?;
        Ok(Flow::Suspend)
    }

    /// Makes the updated L2 table visible and moves on to the next segment.
    fn publish(&mut self, id: RequestId, req: &mut Request, alloc: Allocation) -> Result<Flow> {
        self.publish_table(alloc);
        self.locks.unlock(id);
        req.advance();
        self.resolve(id, req)
    }

    fn publish_table(&mut self, alloc: Allocation) {
        self.l2_cache.update(Arc::new(alloc.table));
        self.l2_generation += 1;
    }

    fn queue_read(&mut self, id: RequestId, offset: u64, len: u64) -> Result<()> {
        self.async_io
            .read_at(offset, vec![0u8; len as usize], id)
            .map_err(Error::SubmittingIo)?;
        self.in_flight += 1;
        Ok(())
    }

    fn queue_write(&mut self, id: RequestId, offset: u64, data: Vec<u8>) -> Result<()> {
        self.async_io
            .write_at(offset, data, id)
            .map_err(Error::SubmittingIo)?;
        self.in_flight += 1;
        Ok(())
    }
}
