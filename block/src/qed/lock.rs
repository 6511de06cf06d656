// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Serialization of table updates.
//!
//! A request that needs to allocate locks the table it is going to modify:
//! the L1 table when a new L2 table has to be linked in, or the L2 table it
//! extends otherwise. The key is the table's file offset. Waiters are queued
//! per key in arrival order and the head of the queue is the holder.

use std::collections::{HashMap, VecDeque};

use super::RequestId;

#[derive(Debug, Default)]
pub struct TableLocks {
    queues: HashMap<u64, VecDeque<RequestId>>,
    // Key each queued request sits on.
    members: HashMap<RequestId, u64>,
    woken: VecDeque<RequestId>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock on `key` for `req`, or queues `req` behind the
    /// current holder. Returns whether `req` now holds the lock.
    ///
    /// A request holds at most one lock; asking for another key gives up
    /// the previous one first.
    pub fn lock(&mut self, key: u64, req: RequestId) -> bool {
        match self.members.get(&req).copied() {
            Some(held) if held == key => return self.holder(key) == Some(req),
            Some(_) => self.unlock(req),
            None => {}
        }

        self.members.insert(req, key);
        let queue = self.queues.entry(key).or_default();
        queue.push_back(req);
        if queue.len() == 1 {
            true
        } else {
            debug!("Request {req} waits for table {key:#x}");
            false
        }
    }

    /// Drops whatever `req` holds or waits for. When the holder leaves, the
    /// next waiter becomes holder and is queued for wake-up.
    pub fn unlock(&mut self, req: RequestId) {
        let Some(key) = self.members.remove(&req) else {
            return;
        };
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };

        let was_holder = queue.front() == Some(&req);
        queue.retain(|&r| r != req);
        match queue.front().copied() {
            None => {
                self.queues.remove(&key);
            }
            Some(next) if was_holder => self.woken.push_back(next),
            Some(_) => {}
        }
    }

    /// Removes a request that is queued but does not hold the lock.
    /// Returns false if `req` is not waiting.
    pub fn cancel_waiter(&mut self, req: RequestId) -> bool {
        match self.members.get(&req).copied() {
            Some(key) if self.holder(key) != Some(req) => {
                self.unlock(req);
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, key: u64) -> Option<RequestId> {
        self.queues.get(&key).and_then(|queue| queue.front().copied())
    }

    #[cfg(test)]
    pub fn is_waiting(&self, req: RequestId) -> bool {
        self.members
            .get(&req)
            .is_some_and(|&key| self.holder(key) != Some(req))
    }

    /// Requests that became lock holders since the last call.
    pub fn take_woken(&mut self) -> VecDeque<RequestId> {
        std::mem::take(&mut self.woken)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
