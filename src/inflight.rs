// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::Notify;

/// A running cluster allocation: reserved physical space whose table entries
/// are not linked yet. Overlapping writers queue on `waiters`.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Cluster-aligned virtual range covered by the reservation.
    pub guest_start: u64,
    pub guest_end: u64,
    /// First reserved physical cluster.
    pub host_offset: u64,
    pub nb_clusters: u64,
    pub waiters: Notify,
    /// Set once the record has been linked or rolled back; guards against a
    /// token being driven twice.
    pub done: AtomicBool,
}

/// Outcome of scanning the list for a requested range.
pub(crate) enum Scan {
    /// No running allocation blocks the range start; the value is the number
    /// of bytes usable before the first overlap, at most the requested size.
    Clear(u64),
    /// A running allocation covers the range start; wait for it.
    Conflict(Arc<InFlight>),
}

/// Per-image list of running allocations.
#[derive(Debug, Default)]
pub(crate) struct InFlightList {
    records: Vec<Arc<InFlight>>,
}

impl InFlightList {
    /// Checks `[start, start + bytes)` against every running allocation.
    /// Overlaps past the range start shorten the usable size; an overlap at
    /// the start itself is a conflict.
    pub fn scan(&self, start: u64, mut bytes: u64) -> Scan {
        for record in &self.records {
            let end = start + bytes;
            if end <= record.guest_start || start >= record.guest_end {
                continue;
            }
            if start < record.guest_start {
                bytes = record.guest_start - start;
            } else {
                return Scan::Conflict(Arc::clone(record));
            }
        }
        Scan::Clear(bytes)
    }

    pub fn insert(&mut self, record: Arc<InFlight>) {
        self.records.push(record);
    }

    pub fn remove(&mut self, record: &Arc<InFlight>) {
        self.records.retain(|r| !Arc::ptr_eq(r, record));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}
