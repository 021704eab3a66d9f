// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::HashMap;
use std::io::{self, Read, Seek, Write};
use std::ops::{Index, IndexMut};

use crate::raw::TableIo;

/// A second-level table held in memory: raw 64 bit entries plus a dirty bit.
/// Mutable indexing marks the page dirty.
#[derive(Clone, Debug)]
pub struct Page {
    entries: Box<[u64]>,
    dirty: bool,
}

impl Page {
    /// Creates a zero-filled page that still needs to be written out.
    pub fn zeroed(count: usize) -> Page {
        Page {
            entries: vec![0; count].into_boxed_slice(),
            dirty: true,
        }
    }

    /// Wraps entries freshly read from the container.
    pub fn from_vec(entries: Vec<u64>) -> Page {
        Page {
            entries: entries.into_boxed_slice(),
            dirty: false,
        }
    }

    /// Gets a reference to the underlying entries.
    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Index<usize> for Page {
    type Output = u64;

    fn index(&self, index: usize) -> &u64 {
        self.entries.index(index)
    }
}

impl IndexMut<usize> for Page {
    fn index_mut(&mut self, index: usize) -> &mut u64 {
        self.dirty = true;
        self.entries.index_mut(index)
    }
}

/// Bounded write-back cache of table pages keyed by their physical offset.
///
/// Loading pages is the caller's business; eviction hands the displaced page
/// to a write-back callback so the caller controls what must reach the
/// container first.
#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    map: HashMap<u64, Page>,
}

impl PageCache {
    pub fn new(capacity: usize) -> PageCache {
        PageCache {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.map.contains_key(&offset)
    }

    /// Returns the page at physical `offset`, if resident.
    pub fn get(&self, offset: u64) -> Option<&Page> {
        self.map.get(&offset)
    }

    pub fn get_mut(&mut self, offset: u64) -> Option<&mut Page> {
        self.map.get_mut(&offset)
    }

    /// Makes `page` resident at `offset`. At capacity, one resident page is
    /// evicted first; a dirty evictee goes through `write_back` and stays
    /// resident when that fails.
    pub fn insert<E, W>(&mut self, offset: u64, page: Page, write_back: W) -> Result<(), E>
    where
        W: FnOnce(u64, &Page) -> Result<(), E>,
    {
        if !self.map.contains_key(&offset) && self.map.len() >= self.capacity {
            // TODO(cache): smarter eviction strategy than an arbitrary
            // resident. Non-empty here, capacity is at least one.
            let to_evict = *self.map.keys().next().unwrap();
            let evicted = self.map.remove(&to_evict).unwrap();
            if evicted.dirty() {
                if let Err(e) = write_back(to_evict, &evicted) {
                    self.map.insert(to_evict, evicted);
                    return Err(e);
                }
            }
        }
        self.map.insert(offset, page);
        Ok(())
    }

    /// Drops the page at `offset` without writing it back. Used when rolling
    /// back a failed table allocation.
    pub fn drop_page(&mut self, offset: u64) {
        self.map.remove(&offset);
    }

    /// Writes the page at `offset` back to the container if dirty.
    pub fn flush_page<F: Read + Write + Seek>(
        &mut self,
        raw: &mut TableIo<F>,
        offset: u64,
    ) -> io::Result<()> {
        if let Some(page) = self.map.get_mut(&offset) {
            if page.dirty() {
                raw.write_entries(offset, page.entries())?;
                page.mark_clean();
            }
        }
        Ok(())
    }

    /// Writes every dirty page back to the container.
    pub fn flush_all<F: Read + Write + Seek>(&mut self, raw: &mut TableIo<F>) -> io::Result<()> {
        for (&offset, page) in self.map.iter_mut() {
            if page.dirty() {
                raw.write_entries(offset, page.entries())?;
                page.mark_clean();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn table_io() -> TableIo<Cursor<Vec<u8>>> {
        TableIo::new(Cursor::new(vec![0u8; 0x10000]), 4096).unwrap()
    }

    fn keep<E>(_offset: u64, _page: &Page) -> Result<(), E> {
        Ok(())
    }

    #[test]
    fn mutation_marks_dirty() {
        let mut raw = table_io();
        let mut cache = PageCache::new(2);
        cache
            .insert(0x1000, Page::from_vec(vec![0; 4]), keep::<io::Error>)
            .unwrap();
        let page = cache.get_mut(0x1000).unwrap();
        assert!(!page.dirty());
        page[1] = 0xdead;
        assert!(page.dirty());
        cache.flush_page(&mut raw, 0x1000).unwrap();
        assert!(!cache.get(0x1000).unwrap().dirty());
        assert_eq!(raw.read_entries(0x1000, 4).unwrap(), vec![0, 0xdead, 0, 0]);
    }

    #[test]
    fn eviction_routes_dirty_pages_through_callback() {
        let mut cache = PageCache::new(1);
        cache
            .insert(0x1000, Page::zeroed(4), keep::<io::Error>)
            .unwrap();
        let mut written = Vec::new();
        cache
            .insert(0x2000, Page::from_vec(vec![7; 4]), |offset, page| {
                written.push((offset, page.entries()[0]));
                Ok::<(), io::Error>(())
            })
            .unwrap();
        assert_eq!(written, vec![(0x1000, 0)]);
        assert!(!cache.contains(0x1000));
        assert!(cache.contains(0x2000));
    }

    #[test]
    fn clean_pages_evict_silently() {
        let mut cache = PageCache::new(1);
        cache
            .insert(0x1000, Page::from_vec(vec![0; 4]), keep::<io::Error>)
            .unwrap();
        let mut called = false;
        cache
            .insert(0x2000, Page::zeroed(4), |_, _| {
                called = true;
                Ok::<(), io::Error>(())
            })
            .unwrap();
        assert!(!called);
    }

    #[test]
    fn failed_write_back_keeps_evictee() {
        let mut cache = PageCache::new(1);
        cache
            .insert(0x1000, Page::zeroed(4), keep::<io::Error>)
            .unwrap();
        let result = cache.insert(0x2000, Page::zeroed(4), |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "no space"))
        });
        assert!(result.is_err());
        assert!(cache.contains(0x1000));
        assert!(!cache.contains(0x2000));
    }

    #[test]
    fn drop_page_discards_edits() {
        let mut raw = table_io();
        let mut cache = PageCache::new(2);
        cache
            .insert(0x1000, Page::from_vec(vec![0; 4]), keep::<io::Error>)
            .unwrap();
        cache.get_mut(0x1000).unwrap()[0] = 7;
        cache.drop_page(0x1000);
        cache.flush_all(&mut raw).unwrap();
        assert_eq!(raw.read_entries(0x1000, 1).unwrap(), vec![0]);
    }
}
