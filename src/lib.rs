// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Sparse copy-on-write cluster mapping for virtual disk images.
//!
//! The engine translates virtual disk offsets to physical cluster runs
//! through a two-level indirection table: a growable top-level table of
//! second-level table pointers, and fixed-size second-level tables of
//! per-cluster entries. Writes never touch shared clusters in place; they
//! reserve fresh space, carry staged copies of the untouched head and tail
//! of partially written clusters, and link the new mapping only once the
//! data is durable. Concurrent writers racing for the same cluster are
//! serialized through an in-flight allocation list.
//!
//! Physical free-space management is delegated to a [`ClusterAllocator`];
//! reading, writing and decompressing cluster payloads is the caller's
//! business. [`MappingEngine`] only decides where the bytes live.

pub mod allocator;
mod cache;
mod engine;
mod entry;
mod inflight;
mod raw;

use std::io;

use remain::sorted;
use thiserror::Error;

pub use crate::allocator::{AllocError, ClusterAllocator, TailAllocator};
pub use crate::engine::{
    AllocationPlan, Config, CowRegion, FinalizeToken, MappingEngine, Resolution, Run, RunKind,
};
pub use crate::entry::Entry;
pub use crate::raw::TableIo;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to reserve clusters")]
    AllocatingClusters(#[source] AllocError),
    #[error("Compressed payload of {0} bytes does not fit a cluster")]
    CompressedTooLarge(usize),
    #[error("Cluster at virtual offset {0:#x} is writable and cannot take a compressed mapping")]
    CompressingAllocatedCluster(u64),
    #[error("Invalid cluster size: {0}")]
    InvalidClusterSize(u64),
    #[error("Invalid offset: {0:#x}")]
    InvalidOffset(u64),
    #[error("Invalid second-level table size: {0}")]
    InvalidTableSize(u64),
    #[error("Failed to read cluster data")]
    ReadingData(#[source] io::Error),
    #[error("Failed to read table")]
    ReadingTable(#[source] io::Error),
    #[error("Top-level table too large: {0} entries")]
    TooManyTopEntries(u64),
    #[error("Cluster offset {0:#x} is not cluster aligned")]
    UnalignedCluster(u64),
    #[error("Table offset {0:#x} is not cluster aligned")]
    UnalignedTable(u64),
    #[error("Failed to write table")]
    WritingTable(#[source] io::Error),
    #[error("Failed to write top table location")]
    WritingTopPointer(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
