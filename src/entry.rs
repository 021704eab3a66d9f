// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Second-level table entries.
//!
//! An entry is 8 bytes, stored big-endian on disk. Bit 63 marks a cluster
//! owned by this image (safe to write in place), bit 62 marks a compressed
//! cluster. A raw value of zero means the cluster was never allocated.
//! Compressed entries pack a byte-granular host offset in the low bits and a
//! 512-byte-sector count above it; the split point depends on the cluster
//! size. All bit manipulation lives here.

/// Set on entries whose cluster belongs to this image and may be overwritten
/// in place.
pub const OWNED_FLAG: u64 = 1 << 63;
/// Set on entries holding a compressed cluster.
pub const COMPRESSED_FLAG: u64 = 1 << 62;
/// Bits of a plain entry that carry the cluster-aligned host offset.
pub const PLAIN_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
/// Sector granularity of the compressed size field.
pub const COMPRESSED_SECTOR_SIZE: u64 = 512;

/// A decoded second-level table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Entry {
    /// No cluster was ever allocated; reads see zeroes.
    Unallocated,
    /// An uncompressed cluster at a cluster-aligned host offset. `owned`
    /// clusters may be written in place; shared ones must be copied first.
    Plain { offset: u64, owned: bool },
    /// A compressed cluster at a byte-granular host offset. `length` is the
    /// number of bytes that must be read to cover the compressed stream (it
    /// is rounded up to the end of the last 512-byte sector).
    Compressed { offset: u64, length: usize },
}

/// Number of low bits holding the byte offset of a compressed cluster.
fn compressed_offset_bits(cluster_bits: u32) -> u32 {
    62 - (cluster_bits - 8)
}

impl Entry {
    /// Decodes a raw table value.
    pub fn decode(raw: u64, cluster_bits: u32) -> Entry {
        if raw == 0 {
            Entry::Unallocated
        } else if raw & COMPRESSED_FLAG != 0 {
            let shift = compressed_offset_bits(cluster_bits);
            let sector_mask = (1u64 << (cluster_bits - 8)) - 1;
            let offset = raw & ((1u64 << shift) - 1);
            let nb_sectors = ((raw >> shift) & sector_mask) + 1;
            let length =
                (nb_sectors * COMPRESSED_SECTOR_SIZE - (offset & (COMPRESSED_SECTOR_SIZE - 1)))
                    as usize;
            Entry::Compressed { offset, length }
        } else {
            Entry::Plain {
                offset: raw & PLAIN_OFFSET_MASK,
                owned: raw & OWNED_FLAG != 0,
            }
        }
    }

    /// Encodes the entry back into its raw table value.
    pub fn encode(self, cluster_bits: u32) -> u64 {
        match self {
            Entry::Unallocated => 0,
            Entry::Plain { offset, owned } => {
                let mut raw = offset & PLAIN_OFFSET_MASK;
                if owned {
                    raw |= OWNED_FLAG;
                }
                raw
            }
            Entry::Compressed { offset, length } => {
                let shift = compressed_offset_bits(cluster_bits);
                debug_assert!(offset < 1u64 << shift);
                // Sectors spanned beyond the first; the decoder adds one back.
                let end = offset + length as u64 - 1;
                let nb_csectors =
                    end / COMPRESSED_SECTOR_SIZE - offset / COMPRESSED_SECTOR_SIZE;
                COMPRESSED_FLAG | (nb_csectors << shift) | offset
            }
        }
    }

    /// True when a write to this cluster needs a freshly allocated one:
    /// anything but a plain owned mapping.
    pub fn needs_allocation(&self) -> bool {
        !matches!(self, Entry::Plain { owned: true, .. })
    }
}
