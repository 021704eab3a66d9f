// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The cluster mapping engine: resolution, copy-on-write allocation,
//! finalization, compressed allocation, discard and top-table growth.

use std::io::{Read, Seek, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};
use tokio::sync::{Mutex, Notify};

use crate::allocator::ClusterAllocator;
use crate::cache::{Page, PageCache};
use crate::entry::{Entry, OWNED_FLAG, PLAIN_OFFSET_MASK};
use crate::inflight::{InFlight, InFlightList, Scan};
use crate::raw::TableIo;
use crate::{Error, Result};

/// Cap on the top-level table, matching a 32 MiB pointer array.
const MAX_TOP_ENTRIES: u64 = 4 * 1024 * 1024;
const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;

/// Geometry and location parameters, validated by [`MappingEngine::open`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// log2 of the cluster size.
    pub cluster_bits: u32,
    /// Entries per second-level table; must be a power of two.
    pub table_entries: u64,
    /// Where the 12-byte top-table location field lives in the container.
    pub top_field_offset: u64,
    /// Current top-level table offset; zero when the image has none yet.
    pub top_table_offset: u64,
    /// Current top-level table length in entries.
    pub top_entries: u64,
    /// Number of second-level tables the cache may hold in memory.
    pub cache_pages: usize,
}

/// Where a virtual range currently lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// Nothing allocated; reads see zeroes for `bytes`.
    Unallocated { bytes: u64 },
    /// `bytes` of data starting at `host_offset` in the container.
    Mapped { host_offset: u64, bytes: u64 },
    /// One compressed cluster: read `length` bytes at `host_offset` and
    /// decompress. `bytes` is the part of the request this cluster covers.
    Compressed {
        host_offset: u64,
        length: usize,
        bytes: u64,
    },
}

/// A staged copy of untouched bytes from a superseded cluster. The caller
/// writes `data` at `host_offset` before finalizing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CowRegion {
    pub host_offset: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunKind {
    /// The clusters are already owned; write in place.
    Kept,
    /// Freshly reserved clusters. `wholesale` marks the replacement of a
    /// compressed cluster: the run covers the whole cluster and the caller
    /// must supply its full content (no staged copies are possible).
    Allocated {
        cow_head: Option<CowRegion>,
        cow_tail: Option<CowRegion>,
        wholesale: bool,
    },
}

/// One physically contiguous piece of an allocation plan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Run {
    pub guest_offset: u64,
    pub host_offset: u64,
    pub bytes: u64,
    pub kind: RunKind,
}

/// Handle over the reservations a plan made; drive it through
/// [`MappingEngine::finalize`] once the data is durable, or
/// [`MappingEngine::abort`] to roll the reservations back.
#[derive(Debug)]
#[must_use = "reserved clusters leak unless finalized or aborted"]
pub struct FinalizeToken {
    records: Vec<Arc<InFlight>>,
}

/// Result of [`MappingEngine::allocate_for_write`]: the placement of the
/// first `bytes` bytes of the request. A short plan is not an error; the
/// caller loops.
#[derive(Debug)]
pub struct AllocationPlan {
    pub runs: Vec<Run>,
    pub bytes: u64,
    token: Option<FinalizeToken>,
}

impl AllocationPlan {
    /// Takes the finalize token, if any clusters were reserved.
    pub fn take_token(&mut self) -> Option<FinalizeToken> {
        self.token.take()
    }
}

enum TryAlloc {
    Ready(AllocationPlan),
    Wait(Arc<InFlight>),
}

/// Translates virtual disk offsets to physical cluster runs and hands out
/// copy-on-write allocations. All methods serialize on one internal lock;
/// data I/O happens outside it, between planning and finalization.
pub struct MappingEngine<A, F> {
    inner: Mutex<Inner<A, F>>,
}

struct Inner<A, F> {
    cluster_bits: u32,
    table_entries: u64,
    top_field_offset: u64,
    /// Physical offset of the current top-level table; zero before the
    /// first growth.
    top_offset: u64,
    /// Raw top-level entries, flags included.
    top: Vec<u64>,
    raw: TableIo<F>,
    cache: PageCache,
    alloc: A,
    inflight: InFlightList,
    /// The allocator's metadata must reach the container before the next
    /// table page write.
    pending_alloc_flush: bool,
}

impl<A: ClusterAllocator, F: Read + Write + Seek> MappingEngine<A, F> {
    /// Opens the mapping engine over `file`, reading the current top-level
    /// table if the image has one.
    pub fn open(file: F, alloc: A, config: Config) -> Result<MappingEngine<A, F>> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&config.cluster_bits) {
            return Err(Error::InvalidClusterSize(config.cluster_bits as u64));
        }
        let cluster_size = 1u64 << config.cluster_bits;
        if config.table_entries == 0 || !config.table_entries.is_power_of_two() {
            return Err(Error::InvalidTableSize(config.table_entries));
        }
        if config.top_entries > MAX_TOP_ENTRIES {
            return Err(Error::TooManyTopEntries(config.top_entries));
        }
        let mut raw = TableIo::new(file, cluster_size)
            .ok_or(Error::InvalidClusterSize(cluster_size))?;
        let top = if config.top_entries > 0 {
            if config.top_table_offset == 0 || raw.cluster_offset(config.top_table_offset) != 0 {
                return Err(Error::UnalignedTable(config.top_table_offset));
            }
            raw.read_entries(config.top_table_offset, config.top_entries)
                .map_err(Error::ReadingTable)?
        } else {
            Vec::new()
        };
        Ok(MappingEngine {
            inner: Mutex::new(Inner {
                cluster_bits: config.cluster_bits,
                table_entries: config.table_entries,
                top_field_offset: config.top_field_offset,
                top_offset: config.top_table_offset,
                top,
                raw,
                cache: PageCache::new(config.cache_pages),
                alloc,
                inflight: InFlightList::default(),
                pending_alloc_flush: false,
            }),
        })
    }

    /// Looks up where `[offset, offset + bytes)` lives, coalescing
    /// physically consecutive clusters with identical flag state. The result
    /// never crosses a second-level table boundary; short results are the
    /// caller's cue to loop.
    pub async fn resolve(&self, offset: u64, bytes: u64) -> Result<Resolution> {
        self.inner.lock().await.resolve(offset, bytes)
    }

    /// Plans a write: keeps owned clusters, reserves fresh ones for
    /// everything else, staging copies of the untouched head and tail of
    /// partially overwritten clusters. Suspends while a conflicting
    /// allocation is in flight and retries once it settles.
    pub async fn allocate_for_write(&self, offset: u64, bytes: u64) -> Result<AllocationPlan> {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.try_allocate(offset, bytes)? {
                TryAlloc::Ready(plan) => return Ok(plan),
                TryAlloc::Wait(dep) => {
                    let notified = dep.waiters.notified();
                    tokio::pin!(notified);
                    // Arm the permit before unlocking so a finalize landing
                    // in between cannot be missed.
                    notified.as_mut().enable();
                    drop(inner);
                    notified.await;
                }
            }
        }
    }

    /// Links the reservations behind `token` into the tables, now that the
    /// caller has written the data. Per cluster, an entry some competing
    /// write linked first stays in place and this reservation's cluster is
    /// returned to the allocator; superseded mappings are released.
    pub async fn finalize(&self, token: FinalizeToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut result = Ok(());
        for record in &token.records {
            if result.is_ok() {
                if let Err(e) = inner.link_record(record) {
                    inner.abort_record(record);
                    result = Err(e);
                }
            } else {
                inner.abort_record(record);
            }
        }
        result
    }

    /// Rolls back every reservation behind `token`, releasing the clusters
    /// and waking any writer queued on them.
    pub async fn abort(&self, token: FinalizeToken) {
        let mut inner = self.inner.lock().await;
        for record in &token.records {
            inner.abort_record(record);
        }
    }

    /// Maps one cluster to a freshly reserved compressed extent of `length`
    /// bytes, returning its byte-granular host offset. Fails if the cluster
    /// already has a writable mapping; a previous compressed mapping is
    /// released.
    pub async fn allocate_compressed(&self, offset: u64, length: usize) -> Result<u64> {
        self.inner.lock().await.allocate_compressed(offset, length)
    }

    /// Unmaps whole clusters in `[offset, offset + bytes)`, releasing their
    /// space. Covers at most one second-level table per call and returns the
    /// number of clusters dealt with (mapped or not); the caller loops.
    pub async fn discard(&self, offset: u64, bytes: u64) -> Result<u64> {
        self.inner.lock().await.discard(offset, bytes)
    }

    /// Writes all dirty table pages back to the container.
    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush()
    }

    /// Current length of the top-level table in entries.
    pub async fn top_entry_count(&self) -> u64 {
        self.inner.lock().await.top.len() as u64
    }
}

impl<A: ClusterAllocator, F: Read + Write + Seek> Inner<A, F> {
    fn top_index(&self, guest: u64) -> usize {
        ((guest >> self.cluster_bits) / self.table_entries) as usize
    }

    fn table_index(&self, guest: u64) -> usize {
        ((guest >> self.cluster_bits) % self.table_entries) as usize
    }

    fn table_bytes(&self) -> u64 {
        self.table_entries * 8
    }

    fn clusters_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.raw.cluster_size())
    }

    /// Returns the page holding the table at `table_offset`, reading it from
    /// the container if it is not resident.
    fn table_page(&mut self, table_offset: u64) -> Result<&Page> {
        self.load_page(table_offset)?;
        // Resident after load_page.
        Ok(self.cache.get(table_offset).unwrap())
    }

    fn table_page_mut(&mut self, table_offset: u64) -> Result<&mut Page> {
        self.load_page(table_offset)?;
        Ok(self.cache.get_mut(table_offset).unwrap())
    }

    /// Installs a zero-filled dirty page for a table that was just allocated,
    /// without reading the container.
    fn empty_table_page(&mut self, table_offset: u64) -> Result<&mut Page> {
        if !self.cache.contains(table_offset) {
            let page = Page::zeroed(self.table_entries as usize);
            self.insert_page(table_offset, page)?;
        }
        Ok(self.cache.get_mut(table_offset).unwrap())
    }

    fn load_page(&mut self, table_offset: u64) -> Result<()> {
        if self.cache.contains(table_offset) {
            return Ok(());
        }
        let entries = self
            .raw
            .read_entries(table_offset, self.table_entries)
            .map_err(Error::ReadingTable)?;
        self.insert_page(table_offset, Page::from_vec(entries))
    }

    /// Makes `page` resident. An evicted dirty page is written back with the
    /// pending allocator flush honored first, so free-space metadata always
    /// precedes the table entries that reference it.
    fn insert_page(&mut self, table_offset: u64, page: Page) -> Result<()> {
        let Inner {
            raw,
            cache,
            alloc,
            pending_alloc_flush,
            ..
        } = self;
        cache.insert(table_offset, page, |offset, evicted| {
            if *pending_alloc_flush {
                alloc.flush().map_err(Error::AllocatingClusters)?;
                *pending_alloc_flush = false;
            }
            raw.write_entries(offset, evicted.entries())
                .map_err(Error::WritingTable)
        })
    }

    fn resolve(&mut self, offset: u64, bytes: u64) -> Result<Resolution> {
        if bytes == 0 {
            return Ok(Resolution::Unallocated { bytes: 0 });
        }
        let cluster_size = self.raw.cluster_size();
        let in_cluster = self.raw.cluster_offset(offset);
        let table_index = self.table_index(offset);
        let index_space = self.table_entries - table_index as u64;
        let bytes = bytes.min(index_space * cluster_size - in_cluster);
        let table_offset = match self.top.get(self.top_index(offset)) {
            Some(&raw_top) if raw_top & PLAIN_OFFSET_MASK != 0 => raw_top & PLAIN_OFFSET_MASK,
            _ => return Ok(Resolution::Unallocated { bytes }),
        };
        if self.raw.cluster_offset(table_offset) != 0 {
            error!("second-level table at {table_offset:#x} is not cluster aligned");
            return Err(Error::UnalignedTable(table_offset));
        }
        let max_clusters = (in_cluster + bytes).div_ceil(cluster_size);
        let cluster_bits = self.cluster_bits;
        let page = self.table_page(table_offset)?;
        match Entry::decode(page[table_index], cluster_bits) {
            Entry::Unallocated => {
                let nb = count_unallocated(page.entries(), table_index, max_clusters);
                Ok(Resolution::Unallocated {
                    bytes: bytes.min(nb * cluster_size - in_cluster),
                })
            }
            Entry::Compressed {
                offset: host,
                length,
            } => Ok(Resolution::Compressed {
                host_offset: host,
                length,
                bytes: bytes.min(cluster_size - in_cluster),
            }),
            Entry::Plain {
                offset: cluster,
                owned,
            } => {
                if cluster & (cluster_size - 1) != 0 {
                    error!("data cluster at {cluster:#x} is not cluster aligned");
                    return Err(Error::UnalignedCluster(cluster));
                }
                let nb = count_contiguous_plain(
                    page.entries(),
                    table_index,
                    max_clusters,
                    cluster,
                    owned,
                    cluster_size,
                    cluster_bits,
                );
                Ok(Resolution::Mapped {
                    host_offset: cluster + in_cluster,
                    bytes: bytes.min(nb * cluster_size - in_cluster),
                })
            }
        }
    }

    fn try_allocate(&mut self, offset: u64, bytes: u64) -> Result<TryAlloc> {
        let mut runs = Vec::new();
        let mut records = Vec::new();
        match self.gather(offset, bytes, &mut runs, &mut records) {
            Ok(Some(dep)) => Ok(TryAlloc::Wait(dep)),
            Ok(None) => {
                let end = runs
                    .last()
                    .map(|run: &Run| run.guest_offset + run.bytes)
                    .unwrap_or(offset);
                let token = if records.is_empty() {
                    None
                } else {
                    Some(FinalizeToken { records })
                };
                Ok(TryAlloc::Ready(AllocationPlan {
                    runs,
                    bytes: end.saturating_sub(offset).min(bytes),
                    token,
                }))
            }
            Err(e) => {
                // Failed mid-gather: the reservations made so far must not
                // outlive the error.
                for record in &records {
                    self.abort_record(record);
                }
                Err(e)
            }
        }
    }

    /// The gather loop behind `allocate_for_write`. On success, runs and
    /// reservation records have been appended; `Some(dep)` means nothing was
    /// gathered because a running allocation covers the range start.
    fn gather(
        &mut self,
        offset: u64,
        bytes: u64,
        runs: &mut Vec<Run>,
        records: &mut Vec<Arc<InFlight>>,
    ) -> Result<Option<Arc<InFlight>>> {
        let cluster_size = self.raw.cluster_size();
        let cluster_bits = self.cluster_bits;
        let mut pos = offset;
        let mut remaining = bytes;
        // Cluster-aligned offset the next reservation must start at for the
        // plan to stay physically contiguous.
        let mut required_host: Option<u64> = None;
        while remaining > 0 {
            let mut chunk = remaining;
            match self.inflight.scan(pos, chunk) {
                Scan::Conflict(dep) => {
                    if runs.is_empty() {
                        return Ok(Some(dep));
                    }
                    // Something was gathered already; hand that back and let
                    // the caller come around again.
                    break;
                }
                Scan::Clear(allowed) => chunk = allowed,
            }
            let (table_offset, table_index) = self.cluster_table(pos)?;
            let in_cluster = self.raw.cluster_offset(pos);
            let index_space = self.table_entries - table_index as u64;
            let max_clusters = (in_cluster + chunk).div_ceil(cluster_size).min(index_space);
            let (first, want, old_raws) = {
                let page = self.table_page(table_offset)?;
                let first = Entry::decode(page[table_index], cluster_bits);
                let want = match first {
                    Entry::Plain {
                        offset,
                        owned: true,
                    } => count_contiguous_plain(
                        page.entries(),
                        table_index,
                        max_clusters,
                        offset,
                        true,
                        cluster_size,
                        cluster_bits,
                    ),
                    Entry::Compressed { .. } => 1,
                    _ => count_allocatable(page.entries(), table_index, max_clusters, cluster_bits),
                };
                let old_raws =
                    page.entries()[table_index..table_index + want as usize].to_vec();
                (first, want, old_raws)
            };
            if let Entry::Plain {
                offset: cluster,
                owned: true,
            } = first
            {
                if self.raw.cluster_offset(cluster) != 0 {
                    error!("data cluster at {cluster:#x} is not cluster aligned");
                    return Err(Error::UnalignedCluster(cluster));
                }
                let host = cluster + in_cluster;
                if let Some(required) = required_host {
                    if required != host {
                        break;
                    }
                }
                let run_bytes = chunk.min(want * cluster_size - in_cluster);
                runs.push(Run {
                    guest_offset: pos,
                    host_offset: host,
                    bytes: run_bytes,
                    kind: RunKind::Kept,
                });
                pos += run_bytes;
                remaining -= run_bytes;
                required_host = Some(host + run_bytes);
                continue;
            }
            let wholesale = matches!(first, Entry::Compressed { .. });
            let (host, got) = self
                .alloc
                .reserve(want * cluster_size, required_host)
                .map_err(Error::AllocatingClusters)?;
            if got == 0 {
                // The allocator cannot extend contiguously; the plan stays
                // short and the caller loops.
                break;
            }
            let cluster_start = self.raw.cluster_address(pos);
            let (run_guest, run_host, run_bytes) = if wholesale {
                (cluster_start, host, cluster_size)
            } else {
                (
                    pos,
                    host + in_cluster,
                    chunk.min(got * cluster_size - in_cluster),
                )
            };
            let mut cow_head = None;
            let mut cow_tail = None;
            if !wholesale {
                if in_cluster != 0 {
                    cow_head = stage_copy(
                        &mut self.raw,
                        cluster_bits,
                        old_raws[0],
                        host,
                        0,
                        in_cluster,
                    )?;
                }
                let end_in_cluster = self.raw.cluster_offset(in_cluster + run_bytes);
                if end_in_cluster != 0 {
                    let last = (in_cluster + run_bytes) >> cluster_bits;
                    cow_tail = stage_copy(
                        &mut self.raw,
                        cluster_bits,
                        old_raws[last as usize],
                        host + last * cluster_size,
                        end_in_cluster,
                        cluster_size,
                    )?;
                }
            }
            let record = Arc::new(InFlight {
                guest_start: cluster_start,
                guest_end: cluster_start + got * cluster_size,
                host_offset: host,
                nb_clusters: got,
                waiters: Notify::new(),
                done: AtomicBool::new(false),
            });
            self.inflight.insert(Arc::clone(&record));
            records.push(record);
            runs.push(Run {
                guest_offset: run_guest,
                host_offset: run_host,
                bytes: run_bytes,
                kind: RunKind::Allocated {
                    cow_head,
                    cow_tail,
                    wholesale,
                },
            });
            let advance = if wholesale {
                cluster_start + cluster_size - pos
            } else {
                run_bytes
            };
            remaining = remaining.saturating_sub(advance);
            pos += advance;
            required_host = Some(host + got * cluster_size);
        }
        Ok(None)
    }

    /// Links one reservation into its table. The record stays untouched on
    /// error so the caller can roll it back.
    fn link_record(&mut self, record: &Arc<InFlight>) -> Result<()> {
        if record.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let cluster_size = self.raw.cluster_size();
        let cluster_bits = self.cluster_bits;
        let (table_offset, first_index) = self.cluster_table(record.guest_start)?;
        // Free-space metadata precedes the table page it backs.
        self.pending_alloc_flush = true;
        let mut released: Vec<(u64, u64)> = Vec::new();
        let mut snapshot = Vec::with_capacity(record.nb_clusters as usize);
        {
            let page = self.table_page_mut(table_offset)?;
            for i in 0..record.nb_clusters as usize {
                snapshot.push(page[first_index + i]);
            }
            for i in 0..record.nb_clusters as usize {
                let index = first_index + i;
                let mine = record.host_offset + i as u64 * cluster_size;
                let linked = Entry::Plain {
                    offset: mine,
                    owned: true,
                }
                .encode(cluster_bits);
                match Entry::decode(page[index], cluster_bits) {
                    Entry::Plain { owned: true, .. } => {
                        // A competing write linked this cluster first; its
                        // mapping stays and this reservation is surplus. The
                        // page is still rewritten with the kept entry.
                        warn!(
                            "cluster at virtual {:#x} was linked by a competing write",
                            record.guest_start + i as u64 * cluster_size
                        );
                        page.mark_dirty();
                        released.push((mine, 1));
                    }
                    Entry::Plain {
                        offset,
                        owned: false,
                    } => {
                        page[index] = linked;
                        released.push((offset, 1));
                    }
                    Entry::Compressed {
                        offset: host,
                        length,
                    } => {
                        page[index] = linked;
                        released.push(compressed_span(host, length, cluster_size));
                    }
                    Entry::Unallocated => {
                        page[index] = linked;
                    }
                }
            }
        }
        if let Err(e) = self.flush_table_page(table_offset) {
            // Nothing was persisted; put the in-memory entries back.
            if let Ok(page) = self.table_page_mut(table_offset) {
                for (i, &raw_entry) in snapshot.iter().enumerate() {
                    page[first_index + i] = raw_entry;
                }
            }
            return Err(e);
        }
        for &(host, clusters) in &released {
            self.alloc.release(host, clusters);
        }
        record.done.store(true, Ordering::Release);
        self.inflight.remove(record);
        record.waiters.notify_waiters();
        Ok(())
    }

    /// Returns a reservation's clusters to the allocator without linking.
    fn abort_record(&mut self, record: &Arc<InFlight>) {
        if record.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alloc.release(record.host_offset, record.nb_clusters);
        self.inflight.remove(record);
        record.waiters.notify_waiters();
    }

    fn allocate_compressed(&mut self, offset: u64, length: usize) -> Result<u64> {
        let cluster_size = self.raw.cluster_size();
        let cluster_bits = self.cluster_bits;
        if length == 0 || length as u64 > cluster_size {
            return Err(Error::CompressedTooLarge(length));
        }
        let (table_offset, table_index) = self.cluster_table(offset)?;
        let old = {
            let page = self.table_page(table_offset)?;
            Entry::decode(page[table_index], cluster_bits)
        };
        let released = match old {
            Entry::Plain { .. } => return Err(Error::CompressingAllocatedCluster(offset)),
            Entry::Compressed {
                offset: host,
                length,
            } => Some(compressed_span(host, length, cluster_size)),
            Entry::Unallocated => None,
        };
        let host = self
            .alloc
            .reserve_bytes(length as u64)
            .map_err(Error::AllocatingClusters)?;
        let raw_entry = Entry::Compressed {
            offset: host,
            length,
        }
        .encode(cluster_bits);
        {
            let page = self.table_page_mut(table_offset)?;
            page[table_index] = raw_entry;
        }
        // The extent's cluster must be accounted for before the dirty page
        // reaches the container.
        self.pending_alloc_flush = true;
        if let Some((span_host, clusters)) = released {
            self.alloc.release(span_host, clusters);
        }
        Ok(host)
    }

    fn discard(&mut self, offset: u64, bytes: u64) -> Result<u64> {
        let cluster_size = self.raw.cluster_size();
        if self.raw.cluster_offset(offset) != 0 {
            return Err(Error::InvalidOffset(offset));
        }
        if self.raw.cluster_offset(bytes) != 0 {
            return Err(Error::InvalidOffset(bytes));
        }
        let total = bytes / cluster_size;
        if total == 0 {
            return Ok(0);
        }
        let table_index = self.table_index(offset);
        let span = (self.table_entries - table_index as u64).min(total);
        match self.top.get(self.top_index(offset)) {
            Some(&raw_top) if raw_top & PLAIN_OFFSET_MASK != 0 => {}
            // No table, nothing mapped; the whole span is already sparse.
            _ => return Ok(span),
        }
        // A shared table gets its own copy before being edited.
        let cluster_bits = self.cluster_bits;
        let (table_offset, first_index) = self.cluster_table(offset)?;
        let mut released: Vec<(u64, u64)> = Vec::new();
        {
            let page = self.table_page_mut(table_offset)?;
            for i in 0..span as usize {
                let index = first_index + i;
                match Entry::decode(page[index], cluster_bits) {
                    Entry::Unallocated => {}
                    Entry::Plain {
                        offset: cluster, ..
                    } => {
                        page[index] = 0;
                        released.push((cluster, 1));
                    }
                    Entry::Compressed {
                        offset: host,
                        length,
                    } => {
                        page[index] = 0;
                        released.push(compressed_span(host, length, cluster_size));
                    }
                }
            }
        }
        for &(host, clusters) in &released {
            self.alloc.release(host, clusters);
        }
        Ok(span)
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_alloc_metadata()?;
        self.cache.flush_all(&mut self.raw).map_err(Error::WritingTable)
    }

    /// Persists the allocator's bookkeeping if a table page depends on it.
    /// The flag stays set on failure.
    fn flush_alloc_metadata(&mut self) -> Result<()> {
        if self.pending_alloc_flush {
            self.alloc.flush().map_err(Error::AllocatingClusters)?;
            self.pending_alloc_flush = false;
        }
        Ok(())
    }

    /// Writes one table page back, flushing allocator metadata first when
    /// the dependency flag is set.
    fn flush_table_page(&mut self, table_offset: u64) -> Result<()> {
        self.flush_alloc_metadata()?;
        self.cache
            .flush_page(&mut self.raw, table_offset)
            .map_err(Error::WritingTable)
    }

    /// Returns the owned second-level table covering `guest` and the index
    /// of its cluster within it, growing the top-level table and copying a
    /// shared or absent table as needed.
    fn cluster_table(&mut self, guest: u64) -> Result<(u64, usize)> {
        let top_index = self.top_index(guest);
        if top_index >= self.top.len() {
            self.grow_top(top_index as u64 + 1)?;
        }
        if self.top[top_index] & OWNED_FLAG == 0 {
            self.allocate_table(top_index)?;
        }
        let table_offset = self.top[top_index] & PLAIN_OFFSET_MASK;
        if table_offset == 0 || self.raw.cluster_offset(table_offset) != 0 {
            error!("second-level table at {table_offset:#x} is not cluster aligned");
            return Err(Error::UnalignedTable(table_offset));
        }
        Ok((table_offset, self.table_index(guest)))
    }

    /// Gives the top-level slot at `top_index` its own second-level table,
    /// copying the shared table it pointed at, if any. The old pointer is
    /// restored and the new clusters are returned on failure.
    fn allocate_table(&mut self, top_index: usize) -> Result<()> {
        let old_raw = self.top[top_index];
        let old_offset = old_raw & PLAIN_OFFSET_MASK;
        if self.raw.cluster_offset(old_offset) != 0 {
            error!("second-level table at {old_offset:#x} is not cluster aligned");
            return Err(Error::UnalignedTable(old_offset));
        }
        let (new_offset, _) = self
            .alloc
            .reserve(self.table_bytes(), None)
            .map_err(Error::AllocatingClusters)?;
        if let Err(e) = self.install_table(top_index, old_offset, new_offset) {
            self.top[top_index] = old_raw;
            self.cache.drop_page(new_offset);
            self.alloc
                .release(new_offset, self.clusters_for(self.table_bytes()));
            return Err(e);
        }
        if old_offset != 0 {
            self.alloc
                .release(old_offset, self.clusters_for(self.table_bytes()));
        }
        Ok(())
    }

    fn install_table(&mut self, top_index: usize, old_offset: u64, new_offset: u64) -> Result<()> {
        // The new table's clusters must be accounted for before anything
        // points at them.
        self.alloc.flush().map_err(Error::AllocatingClusters)?;
        self.pending_alloc_flush = false;
        let old_entries = if old_offset != 0 {
            Some(self.table_page(old_offset)?.entries().to_vec())
        } else {
            None
        };
        {
            let page = self.empty_table_page(new_offset)?;
            if let Some(old) = old_entries {
                for (i, &raw_entry) in old.iter().enumerate() {
                    page[i] = raw_entry;
                }
            }
            page.mark_dirty();
        }
        self.cache
            .flush_page(&mut self.raw, new_offset)
            .map_err(Error::WritingTable)?;
        self.top[top_index] = new_offset | OWNED_FLAG;
        self.raw
            .write_entry(self.top_offset + top_index as u64 * 8, self.top[top_index])
            .map_err(Error::WritingTopPointer)?;
        Ok(())
    }

    /// Grows the top-level table to hold at least `min_entries`, writing the
    /// new array and repointing the header field before releasing the old
    /// array. The table never shrinks.
    fn grow_top(&mut self, min_entries: u64) -> Result<()> {
        if min_entries > MAX_TOP_ENTRIES {
            return Err(Error::TooManyTopEntries(min_entries));
        }
        let mut new_len = (self.top.len() as u64).max(1);
        while new_len < min_entries {
            new_len = (new_len * 3).div_ceil(2);
        }
        let new_len = new_len.min(MAX_TOP_ENTRIES);
        let (new_offset, _) = self
            .alloc
            .reserve(new_len * 8, None)
            .map_err(Error::AllocatingClusters)?;
        let mut table = self.top.clone();
        table.resize(new_len as usize, 0);
        if let Err(e) = self.install_top(new_offset, &table) {
            self.alloc.release(new_offset, self.clusters_for(new_len * 8));
            return Err(e);
        }
        let old_offset = self.top_offset;
        let old_len = self.top.len() as u64;
        self.top_offset = new_offset;
        self.top = table;
        if old_offset != 0 && old_len > 0 {
            self.alloc.release(old_offset, self.clusters_for(old_len * 8));
        }
        Ok(())
    }

    fn install_top(&mut self, new_offset: u64, table: &[u64]) -> Result<()> {
        self.alloc.flush().map_err(Error::AllocatingClusters)?;
        self.pending_alloc_flush = false;
        self.raw
            .write_entries(new_offset, table)
            .map_err(Error::WritingTable)?;
        self.raw
            .write_top_field(self.top_field_offset, table.len() as u32, new_offset)
            .map_err(Error::WritingTopPointer)?;
        Ok(())
    }
}

/// Reads the untouched part of a superseded cluster so the caller can lay
/// it into the replacement. Unallocated origins need no copy; fresh
/// clusters are zero-initialized.
fn stage_copy<F: Read + Write + Seek>(
    raw: &mut TableIo<F>,
    cluster_bits: u32,
    old_raw: u64,
    dest_cluster: u64,
    from: u64,
    to: u64,
) -> Result<Option<CowRegion>> {
    let old = match Entry::decode(old_raw, cluster_bits) {
        Entry::Plain { offset, .. } => offset,
        _ => return Ok(None),
    };
    if raw.cluster_offset(old) != 0 {
        error!("data cluster at {old:#x} is not cluster aligned");
        return Err(Error::UnalignedCluster(old));
    }
    let mut data = vec![0u8; (to - from) as usize];
    raw.read_data(old + from, &mut data)
        .map_err(Error::ReadingData)?;
    Ok(Some(CowRegion {
        host_offset: dest_cluster + from,
        data,
    }))
}

/// Physical clusters spanned by a compressed extent.
fn compressed_span(offset: u64, length: usize, cluster_size: u64) -> (u64, u64) {
    let first = offset & !(cluster_size - 1);
    let last = (offset + length as u64 - 1) & !(cluster_size - 1);
    (first, (last - first) / cluster_size + 1)
}

fn count_unallocated(entries: &[u64], from: usize, max: u64) -> u64 {
    let mut count = 0;
    while count < max && entries[from + count as usize] == 0 {
        count += 1;
    }
    count
}

fn count_contiguous_plain(
    entries: &[u64],
    from: usize,
    max: u64,
    base: u64,
    owned: bool,
    cluster_size: u64,
    cluster_bits: u32,
) -> u64 {
    let mut count = 0;
    while count < max {
        match Entry::decode(entries[from + count as usize], cluster_bits) {
            Entry::Plain { offset, owned: o }
                if o == owned && offset == base + count * cluster_size =>
            {
                count += 1;
            }
            _ => break,
        }
    }
    count
}

/// Length of a run of entries that can be replaced by one reservation. The
/// first entry is known to need allocation; compressed entries after it end
/// the run since they are replaced one whole cluster at a time.
fn count_allocatable(entries: &[u64], from: usize, max: u64, cluster_bits: u32) -> u64 {
    let mut count = 1;
    while count < max {
        match Entry::decode(entries[from + count as usize], cluster_bits) {
            Entry::Unallocated | Entry::Plain { owned: false, .. } => count += 1,
            _ => break,
        }
    }
    count
}
