// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The free-space allocator consumed by the mapping engine, plus a reference
//! implementation that appends clusters at the container's tail.

use std::collections::HashMap;
use std::io;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Allocator metadata io error")]
    Io(#[source] io::Error),
    #[error("No free space in the image")]
    OutOfSpace,
}

pub type Result<T> = std::result::Result<T, AllocError>;

/// Physical free-space management, supplied by the embedder.
///
/// Reservations hand out cluster-aligned runs of zero-initialized space.
/// Releases are share-count decrements; a cluster is only reusable once
/// every holder has released it. Implementations may defer their own
/// persistent bookkeeping until `flush`.
pub trait ClusterAllocator {
    /// Reserves a contiguous cluster-aligned run covering `bytes`.
    ///
    /// Without a `preferred` offset the full run is reserved or the call
    /// fails. With `preferred` set the run must start exactly there; the
    /// returned cluster count may fall short, including zero, when the space
    /// at that offset is taken.
    fn reserve(&mut self, bytes: u64, preferred: Option<u64>) -> Result<(u64, u64)>;

    /// Reserves `len` bytes for a compressed cluster. Consecutive calls may
    /// pack extents into the same physical cluster; every extent holds one
    /// share of each cluster it touches.
    fn reserve_bytes(&mut self, len: u64) -> Result<u64>;

    /// Drops one share of each of `clusters` clusters starting at `offset`.
    fn release(&mut self, offset: u64, clusters: u64);

    /// Persists the allocator's own metadata. Called before table pages that
    /// reference freshly reserved clusters are written out.
    fn flush(&mut self) -> Result<()>;
}

/// Reference allocator: hands out clusters from a high-water mark at the end
/// of the container and keeps share counts in memory. Exists to exercise the
/// engine and back its tests; it never reuses released space.
#[derive(Debug)]
pub struct TailAllocator {
    cluster_size: u64,
    tail: u64,
    limit: Option<u64>,
    shares: HashMap<u64, u64>,
    released: u64,
    // Current partially filled cluster for byte-granular reservations.
    byte_offset: u64,
    byte_free: u64,
}

impl TailAllocator {
    /// `first_free` is the lowest offset the allocator may hand out; it is
    /// rounded up to a cluster boundary. Returns `None` if `cluster_size` is
    /// not a power of two.
    pub fn new(cluster_size: u64, first_free: u64) -> Option<TailAllocator> {
        if !cluster_size.is_power_of_two() {
            return None;
        }
        Some(TailAllocator {
            cluster_size,
            tail: first_free.next_multiple_of(cluster_size),
            limit: None,
            shares: HashMap::new(),
            released: 0,
            byte_offset: 0,
            byte_free: 0,
        })
    }

    /// Like `new`, but refuses to hand out space at or beyond `limit`.
    pub fn with_limit(cluster_size: u64, first_free: u64, limit: u64) -> Option<TailAllocator> {
        let mut alloc = TailAllocator::new(cluster_size, first_free)?;
        alloc.limit = Some(limit);
        Some(alloc)
    }

    /// Share count currently held on the cluster containing `offset`.
    pub fn shares(&self, offset: u64) -> u64 {
        let cluster = offset & !(self.cluster_size - 1);
        self.shares.get(&cluster).copied().unwrap_or(0)
    }

    /// Number of clusters with at least one outstanding share.
    pub fn live_clusters(&self) -> usize {
        self.shares.len()
    }

    /// Number of clusters whose last share has been dropped.
    pub fn released_clusters(&self) -> u64 {
        self.released
    }

    fn take_tail(&mut self, clusters: u64) -> Result<u64> {
        let bytes = clusters * self.cluster_size;
        if let Some(limit) = self.limit {
            if self.tail + bytes > limit {
                return Err(AllocError::OutOfSpace);
            }
        }
        let offset = self.tail;
        self.tail += bytes;
        for i in 0..clusters {
            self.shares.insert(offset + i * self.cluster_size, 1);
        }
        Ok(offset)
    }
}

impl ClusterAllocator for TailAllocator {
    fn reserve(&mut self, bytes: u64, preferred: Option<u64>) -> Result<(u64, u64)> {
        let clusters = bytes.div_ceil(self.cluster_size).max(1);
        match preferred {
            None => Ok((self.take_tail(clusters)?, clusters)),
            // Extension is only possible at the high-water mark; anything
            // below it is already spoken for.
            Some(p) if p == self.tail => {
                let mut avail = clusters;
                if let Some(limit) = self.limit {
                    avail = avail.min((limit.saturating_sub(self.tail)) / self.cluster_size);
                }
                if avail == 0 {
                    return Ok((p, 0));
                }
                Ok((self.take_tail(avail)?, avail))
            }
            Some(p) => Ok((p, 0)),
        }
    }

    fn reserve_bytes(&mut self, len: u64) -> Result<u64> {
        debug_assert!(len > 0 && len <= self.cluster_size);
        if self.byte_free >= len {
            let offset = self.byte_offset;
            self.byte_offset += len;
            self.byte_free -= len;
            let cluster = offset & !(self.cluster_size - 1);
            *self.shares.entry(cluster).or_insert(0) += 1;
            return Ok(offset);
        }
        let offset = self.take_tail(1)?;
        self.byte_offset = offset + len;
        self.byte_free = self.cluster_size - len;
        Ok(offset)
    }

    fn release(&mut self, offset: u64, clusters: u64) {
        let base = offset & !(self.cluster_size - 1);
        for i in 0..clusters {
            let cluster = base + i * self.cluster_size;
            match self.shares.get_mut(&cluster) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.shares.remove(&cluster);
                    self.released += 1;
                }
                None => log::warn!("release of untracked cluster {cluster:#x}"),
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        // All bookkeeping is in memory.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_SIZE: u64 = 4096;

    fn allocator() -> TailAllocator {
        TailAllocator::new(CLUSTER_SIZE, CLUSTER_SIZE).unwrap()
    }

    #[test]
    fn sequential_reservations() {
        let mut alloc = allocator();
        let (a, n) = alloc.reserve(2 * CLUSTER_SIZE, None).unwrap();
        assert_eq!((a, n), (CLUSTER_SIZE, 2));
        let (b, n) = alloc.reserve(1, None).unwrap();
        assert_eq!((b, n), (3 * CLUSTER_SIZE, 1));
        assert_eq!(alloc.live_clusters(), 3);
    }

    #[test]
    fn preferred_extends_at_tail_only() {
        let mut alloc = allocator();
        let (a, _) = alloc.reserve(CLUSTER_SIZE, None).unwrap();
        let (b, n) = alloc.reserve(CLUSTER_SIZE, Some(a + CLUSTER_SIZE)).unwrap();
        assert_eq!(b, a + CLUSTER_SIZE);
        assert_eq!(n, 1);
        // Offsets below the high-water mark cannot be extended into.
        let (_, n) = alloc.reserve(CLUSTER_SIZE, Some(a)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn limit_enforced() {
        let mut alloc = TailAllocator::with_limit(CLUSTER_SIZE, 0, 2 * CLUSTER_SIZE).unwrap();
        alloc.reserve(CLUSTER_SIZE, None).unwrap();
        assert!(matches!(
            alloc.reserve(2 * CLUSTER_SIZE, None),
            Err(AllocError::OutOfSpace)
        ));
        // Preferred-mode reservations report a short run instead of failing.
        let (_, n) = alloc.reserve(2 * CLUSTER_SIZE, Some(CLUSTER_SIZE)).unwrap();
        assert_eq!(n, 1);
        let (_, n) = alloc.reserve(CLUSTER_SIZE, Some(2 * CLUSTER_SIZE)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn shares_govern_release() {
        let mut alloc = allocator();
        let (a, _) = alloc.reserve(CLUSTER_SIZE, None).unwrap();
        assert_eq!(alloc.shares(a), 1);
        alloc.release(a, 1);
        assert_eq!(alloc.shares(a), 0);
        assert_eq!(alloc.released_clusters(), 1);
        assert_eq!(alloc.live_clusters(), 0);
    }

    #[test]
    fn byte_reservations_pack() {
        let mut alloc = allocator();
        let a = alloc.reserve_bytes(1000).unwrap();
        let b = alloc.reserve_bytes(1000).unwrap();
        assert_eq!(b, a + 1000);
        assert_eq!(alloc.shares(a), 2);
        // Both extents share the cluster; dropping one keeps it live.
        alloc.release(b, 1);
        assert_eq!(alloc.shares(a), 1);
        alloc.release(a, 1);
        assert_eq!(alloc.live_clusters(), 0);
    }

    #[test]
    fn byte_reservation_spills_to_new_cluster() {
        let mut alloc = allocator();
        let a = alloc.reserve_bytes(4000).unwrap();
        let b = alloc.reserve_bytes(200).unwrap();
        assert_eq!(b & !(CLUSTER_SIZE - 1), a + CLUSTER_SIZE);
    }
}
