// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Block bookkeeping for a mission
//!
//! A resource is cut into `BLOCK_SIZE` blocks. Workers do not get blocks
//! assigned: each one scans forward from its own cursor and claims the first
//! block nobody holds, which keeps workers in disjoint, mostly contiguous
//! regions without a dispatcher.
//!
//! # Block states
//! - absent: unclaimed
//! - `false`: claimed, transfer in flight
//! - `true`: streamed to completion, never claimed again

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed block size in bytes
pub const BLOCK_SIZE: u64 = 512 * 1024;

/// Number of blocks needed to cover `length` bytes
pub fn block_count_for(length: u64) -> u64 {
    length.div_ceil(BLOCK_SIZE)
}

/// Inclusive byte range `[start, end]` of `block` in a resource of `length` bytes
pub fn block_range(block: u64, length: u64) -> (u64, u64) {
    let start = block * BLOCK_SIZE;
    let end = (start + BLOCK_SIZE - 1).min(length.saturating_sub(1));
    (start, end)
}

/// Claimed-block map plus the scan cursor of every worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTracker {
    claimed: BTreeMap<u64, bool>,
    cursors: Vec<u64>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give every worker a fresh cursor, spread evenly over the blocks
    pub fn seed_cursors(&mut self, thread_count: usize, block_count: u64) {
        let threads = thread_count.max(1) as u64;
        self.cursors = (0..threads)
            .map(|id| id * block_count / threads)
            .collect();
    }

    /// Keep existing cursors, adding zeroed ones for workers that have none
    pub fn ensure_cursors(&mut self, thread_count: usize) {
        if self.cursors.len() < thread_count {
            self.cursors.resize(thread_count, 0);
        }
    }

    /// Send every cursor back to block 0
    pub fn reset_cursors(&mut self) {
        self.cursors.iter_mut().for_each(|cursor| *cursor = 0);
    }

    pub fn cursor(&self, worker: usize) -> u64 {
        self.cursors.get(worker).copied().unwrap_or(0)
    }

    /// Scan forward from the worker's cursor and claim the first free block
    ///
    /// Check and claim happen under the same borrow, so two workers can never
    /// claim the same block. Returns `None` once the cursor passes the end.
    pub fn claim_next(&mut self, worker: usize, block_count: u64) -> Option<u64> {
        self.ensure_cursors(worker + 1);

        let mut block = self.cursors[worker];
        while block < block_count && self.claimed.contains_key(&block) {
            block += 1;
        }

        self.cursors[worker] = block.min(block_count);
        if block >= block_count {
            return None;
        }

        self.claimed.insert(block, false);
        Some(block)
    }

    /// Mark a claimed block as fully written
    pub fn complete(&mut self, block: u64) {
        self.claimed.insert(block, true);
    }

    pub fn is_claimed(&self, block: u64) -> bool {
        self.claimed.contains_key(&block)
    }

    pub fn is_complete(&self, block: u64) -> bool {
        self.claimed.get(&block).copied().unwrap_or(false)
    }

    /// Drop claims whose transfer never finished; returns how many were dropped
    pub fn release_in_flight(&mut self) -> usize {
        let before = self.claimed.len();
        self.claimed.retain(|_, complete| *complete);
        before - self.claimed.len()
    }

    pub fn completed_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.claimed
            .iter()
            .filter(|(_, complete)| **complete)
            .map(|(block, _)| *block)
    }

    /// Bytes covered by completed blocks
    pub fn completed_bytes(&self, length: u64) -> u64 {
        self.completed_blocks()
            .map(|block| {
                let (start, end) = block_range(block, length);
                end + 1 - start
            })
            .sum()
    }

    pub fn clear(&mut self) {
        self.claimed.clear();
        self.cursors.clear();
    }
}
