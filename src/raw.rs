// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Byte-level access to the image container. Pointer tables and header
/// fields are big-endian; all offsets are absolute.
#[derive(Debug)]
pub struct TableIo<F> {
    file: F,
    cluster_size: u64,
    cluster_mask: u64,
}

impl<F: Read + Write + Seek> TableIo<F> {
    /// Wraps `file` for cluster-granular access. Returns `None` if
    /// `cluster_size` is not a power of two.
    pub fn new(file: F, cluster_size: u64) -> Option<Self> {
        if !cluster_size.is_power_of_two() {
            return None;
        }
        Some(TableIo {
            file,
            cluster_size,
            cluster_mask: cluster_size - 1,
        })
    }

    /// Reads `count` 64 bit entries starting at `offset` and returns them as
    /// a vector, flags included.
    pub fn read_entries(&mut self, offset: u64, count: u64) -> io::Result<Vec<u64>> {
        let mut table = vec![0; count as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_u64_into::<BigEndian>(&mut table)?;
        Ok(table)
    }

    /// Writes a table of 64 bit entries to `offset`.
    pub fn write_entries(&mut self, offset: u64, entries: &[u64]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer =
            BufWriter::with_capacity(entries.len() * size_of::<u64>(), &mut self.file);
        for &entry in entries {
            buffer.write_u64::<BigEndian>(entry)?;
        }
        buffer.flush()?;
        drop(buffer);
        self.file.flush()
    }

    /// Writes a single 64 bit entry in place.
    pub fn write_entry(&mut self, offset: u64, entry: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_u64::<BigEndian>(entry)?;
        self.file.flush()
    }

    /// Writes the top-table header field: entry count then table offset.
    pub fn write_top_field(&mut self, offset: u64, count: u32, table_offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_u32::<BigEndian>(count)?;
        self.file.write_u64::<BigEndian>(table_offset)?;
        self.file.flush()
    }

    /// Fills `buf` from the data area at `offset`.
    pub fn read_data(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    /// Returns a mutable reference to the underlying file.
    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    /// Returns the size of the image's clusters.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Returns the offset of `address` within its cluster.
    pub fn cluster_offset(&self, address: u64) -> u64 {
        address & self.cluster_mask
    }

    /// Returns the base address of the cluster containing `address`.
    pub fn cluster_address(&self, address: u64) -> u64 {
        address & !self.cluster_mask
    }
}
