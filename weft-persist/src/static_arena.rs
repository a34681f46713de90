//! Static arena: uniform records on stream-sharded free lists
//!
//! After the three header words come the per-stream head words, then the
//! reserved lock slots, then the data region. Cells are laid out round-robin
//! over streams — cell `i` of stream `s` sits at
//! `data + i * item_size * streams + s * item_size` — so each stream's list
//! walks the file at a constant stride. A free cell's first word is its
//! forward link; a live cell is entirely the caller's.

use std::ptr::NonNull;

use log::debug;
use spin::Mutex;

use crate::map::{MapRegion, LOCK_SLOT, WORD};
use crate::stream::stream_for;

pub(crate) struct StaticMap {
    pub(crate) region: MapRegion,
    item_size: usize,
    streams: usize,
    /// Live per-stream locks (the on-disk slots are layout only)
    stream_locks: Box<[Mutex<()>]>,
    heads_off: usize,
    data_off: usize,
}

impl StaticMap {
    fn layout(region: &MapRegion, streams: usize) -> (usize, usize) {
        let heads_off = 3 * WORD;
        let data_off = heads_off + streams * WORD + streams * LOCK_SLOT;
        debug_assert!(data_off < region.len);
        (heads_off, data_off)
    }

    /// Initialize a fresh file: write the header, thread every stream's
    /// free list, and flush the result to disk.
    pub(crate) fn create(region: MapRegion, item_size: usize, streams: usize) -> Self {
        // records are at least one link word, aligned to 4 bytes
        let item_size = item_size.max(WORD).div_ceil(4) * 4;
        region.set_word(0, region.addr);
        region.set_word(1, item_size);
        region.set_word(2, streams);
        let (heads_off, data_off) = Self::layout(&region, streams);

        let arena = Self {
            region,
            item_size,
            streams,
            stream_locks: (0..streams).map(|_| Mutex::new(())).collect(),
            heads_off,
            data_off,
        };

        let data = arena.region.addr + arena.data_off;
        let end = arena.region.addr + arena.region.len;
        let row = item_size * streams;
        for s in 0..streams {
            let mut cell = data + s * item_size;
            if cell + item_size > end {
                // degenerate geometry: stream has no cells at all
                // SAFETY: the head word lies inside the mapping.
                unsafe { *arena.head_ptr(s) = 0 };
                continue;
            }
            // SAFETY: as above.
            unsafe { *arena.head_ptr(s) = cell };
            loop {
                let next = cell + row;
                // SAFETY: `cell` is a free cell inside the data region; its
                // first word is the list link.
                unsafe {
                    *(cell as *mut usize) = if next + item_size <= end { next } else { 0 };
                }
                if next + item_size > end {
                    break;
                }
                cell = next;
            }
        }
        debug!(
            "static arena: {} streams, {}-byte records, {} cells",
            streams,
            item_size,
            arena.capacity()
        );
        arena.region.sync();
        arena
    }

    /// Re-attach to an already initialized file, reading the geometry from
    /// the header words.
    pub(crate) fn attach(region: MapRegion) -> Self {
        let item_size = region.word(1);
        let streams = region.word(2);
        let (heads_off, data_off) = Self::layout(&region, streams);
        Self {
            region,
            item_size,
            streams,
            stream_locks: (0..streams).map(|_| Mutex::new(())).collect(),
            heads_off,
            data_off,
        }
    }

    fn head_ptr(&self, stream: usize) -> *mut usize {
        (self.region.addr + self.heads_off + stream * WORD) as *mut usize
    }

    /// Total cells the data region holds.
    pub(crate) fn capacity(&self) -> usize {
        (self.region.len - self.data_off) / self.item_size
    }

    /// Pop a record from the caller's stream, stealing from the next stream
    /// over when the local one is exhausted. `None` once every stream is
    /// empty.
    pub(crate) fn malloc(&self) -> Option<NonNull<u8>> {
        let first = stream_for(self.streams);
        let mut stream = first;
        loop {
            {
                let _guard = self.stream_locks[stream].lock();
                // SAFETY: head word is inside the mapping; a listed cell's
                // first word is its link. Both only touched under the
                // stream lock.
                unsafe {
                    let head = *self.head_ptr(stream);
                    if head != 0 {
                        *self.head_ptr(stream) = *(head as *const usize);
                        return NonNull::new(head as *mut u8);
                    }
                }
            }
            stream = (stream + 1) % self.streams;
            if stream == first {
                return None;
            }
        }
    }

    /// Push a record onto the caller's current stream.
    ///
    /// # Safety
    ///
    /// `p` must be a cell previously returned by [`StaticMap::malloc`] on
    /// this map and not currently on any free list.
    pub(crate) unsafe fn free(&self, p: NonNull<u8>) {
        let stream = stream_for(self.streams);
        let _guard = self.stream_locks[stream].lock();
        // SAFETY: per the contract `p` is a retired cell of this arena; its
        // first word becomes the link.
        unsafe {
            let cell = p.as_ptr() as *mut usize;
            *cell = *self.head_ptr(stream);
            *self.head_ptr(stream) = cell as usize;
        }
    }

    /// Count the cells currently on every stream's free list.
    pub(crate) fn free_cells(&self) -> usize {
        let mut total = 0;
        for s in 0..self.streams {
            let _guard = self.stream_locks[s].lock();
            // SAFETY: list links are only touched under the stream lock.
            unsafe {
                let mut cell = *self.head_ptr(s);
                while cell != 0 {
                    total += 1;
                    cell = *(cell as *const usize);
                }
            }
        }
        total
    }
}
