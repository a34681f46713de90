//! Dynamic arena: 2 KiB blocks with 64 B small-slice carving
//!
//! The data region is a run of 2 KiB blocks tracked by one occupancy bitmap
//! (one bit per block, guarded by a single global lock). Three kinds of
//! blocks exist: *small blocks* carve themselves into 30 slices of 64 bytes
//! for requests up to a slice; *big-block headers* hold `{pointer, block
//! count}` entries describing multi-block allocations; and the data blocks
//! those entries point at. Small blocks and headers chain into per-stream
//! lists walked hand-over-hand: the next block's lock is taken before the
//! previous one is released, so the list cannot shift underfoot.
//!
//! A freed pointer is classified by alignment: offsets that are not a
//! multiple of 2 KiB can only be small-block slices; aligned offsets are
//! whole-block allocations recorded in some header.
//!
//! Small blocks and headers are never reclaimed once created; an emptied
//! slice or entry is reused, but the block itself stays with its stream.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::bitmap;
use crate::map::{MapRegion, BLOCK_SIZE, LOCK_SLOT, WORD};
use crate::stream::stream_for;

/// Slice geometry of a small block.
pub(crate) const SMALL_SLICE_SIZE: usize = 64;
pub(crate) const SMALL_SLICE_COUNT: usize = 30;
/// Header prefix common to small blocks and big-block headers.
const BLOCK_HEADER: usize = 128;

/// Entries per big-block header; sized so entries stay naturally aligned
/// and the struct fills exactly one block.
pub(crate) const BIG_ENTRY_COUNT: usize = (BLOCK_SIZE - BLOCK_HEADER) / core::mem::size_of::<BigEntry>();
const BIG_BITMAP_LEN: usize = BIG_ENTRY_COUNT.div_ceil(8);

/// In-file spinlock word. Lives inside each block header, zeroed (unlocked)
/// whenever the block is initialized; only within-process exclusion is
/// intended.
#[repr(C)]
pub(crate) struct BlockLock(AtomicU32);

impl BlockLock {
    fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// A 2 KiB block sliced into 64 B cells.
#[repr(C)]
pub(crate) struct SmallBlock {
    /// Absolute address of the next small block on the stream, 0 at the end
    next: usize,
    lock: BlockLock,
    bitmap: [u8; 4],
    _pad: [u8; BLOCK_HEADER - WORD - 4 - 4],
    slices: [[u8; SMALL_SLICE_SIZE]; SMALL_SLICE_COUNT],
}

/// One recorded multi-block allocation.
#[repr(C)]
pub(crate) struct BigEntry {
    /// Absolute address of the allocation's first data block
    entry: usize,
    /// Whole 2 KiB blocks the allocation spans
    block_count: usize,
}

/// A 2 KiB block holding the ledger of big allocations for one stream.
#[repr(C)]
pub(crate) struct BigBlockHeader {
    next: usize,
    lock: BlockLock,
    bitmap: [u8; BIG_BITMAP_LEN],
    _pad: [u8; BLOCK_HEADER - WORD - 4 - BIG_BITMAP_LEN],
    entries: [BigEntry; BIG_ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<SmallBlock>() == BLOCK_SIZE);
const _: () = assert!(core::mem::size_of::<BigBlockHeader>() == BLOCK_SIZE);

/// Zero a block's 128-byte header: link cleared, lock open, bitmap empty.
unsafe fn init_block_header(addr: usize) {
    // SAFETY: the caller owns a freshly reserved block at `addr`.
    unsafe {
        std::ptr::write_bytes(addr as *mut u8, 0, BLOCK_HEADER);
    }
}

pub(crate) struct DynamicMap {
    pub(crate) region: MapRegion,
    streams: usize,
    /// Live per-stream locks (the on-disk slots are layout only)
    stream_locks: Box<[Mutex<()>]>,
    /// The single global bitmap lock
    bitmap_lock: Mutex<()>,
    small_heads_off: usize,
    big_heads_off: usize,
    bitmap_off: usize,
    bitmap_len: usize,
    data_off: usize,
    /// Blocks that actually fit in the data region (the bitmap's trailing
    /// bits beyond this are dead)
    block_count: usize,
}

impl DynamicMap {
    fn layout(region: &MapRegion, streams: usize) -> (usize, usize, usize, usize, usize, usize) {
        let small_heads_off = 3 * WORD;
        let big_heads_off = small_heads_off + streams * WORD;
        let locks_off = big_heads_off + streams * WORD;
        let bitmap_off = locks_off + streams * LOCK_SLOT + LOCK_SLOT;
        let bitmap_len = (region.len / BLOCK_SIZE).div_ceil(8);
        let data_off = bitmap_off + bitmap_len;
        debug_assert!(data_off < region.len);
        let block_count = (region.len - data_off) / BLOCK_SIZE;
        (
            small_heads_off,
            big_heads_off,
            bitmap_off,
            bitmap_len,
            data_off,
            block_count,
        )
    }

    fn build(region: MapRegion, streams: usize) -> Self {
        let (small_heads_off, big_heads_off, bitmap_off, bitmap_len, data_off, block_count) =
            Self::layout(&region, streams);
        Self {
            region,
            streams,
            stream_locks: (0..streams).map(|_| Mutex::new(())).collect(),
            bitmap_lock: Mutex::new(()),
            small_heads_off,
            big_heads_off,
            bitmap_off,
            bitmap_len,
            data_off,
            block_count,
        }
    }

    /// Initialize a fresh file: header words, empty stream heads, zeroed
    /// occupancy bitmap.
    pub(crate) fn create(region: MapRegion, streams: usize) -> Self {
        region.set_word(0, region.addr);
        region.set_word(1, 0); // dynamic
        region.set_word(2, streams);
        let arena = Self::build(region, streams);
        for s in 0..streams {
            // SAFETY: head words lie inside the mapping.
            unsafe {
                *arena.small_head_ptr(s) = 0;
                *arena.big_head_ptr(s) = 0;
            }
        }
        {
            let _guard = arena.bitmap_lock.lock();
            // SAFETY: guarded by the bitmap lock we just took.
            let bm = unsafe { arena.bitmap_mut() };
            bm.fill(0);
        }
        debug!(
            "dynamic arena: {} streams, {} blocks of {} bytes",
            streams, arena.block_count, BLOCK_SIZE
        );
        arena.region.sync();
        arena
    }

    /// Re-attach to an already initialized file.
    pub(crate) fn attach(region: MapRegion) -> Self {
        let streams = region.word(2);
        Self::build(region, streams)
    }

    fn small_head_ptr(&self, stream: usize) -> *mut usize {
        (self.region.addr + self.small_heads_off + stream * WORD) as *mut usize
    }

    fn big_head_ptr(&self, stream: usize) -> *mut usize {
        (self.region.addr + self.big_heads_off + stream * WORD) as *mut usize
    }

    /// Start of the block data region.
    fn base(&self) -> usize {
        self.region.addr + self.data_off
    }

    fn block_addr(&self, index: usize) -> usize {
        self.base() + index * BLOCK_SIZE
    }

    /// The occupancy bitmap.
    ///
    /// # Safety
    ///
    /// Caller must hold `bitmap_lock`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bitmap_mut(&self) -> &mut [u8] {
        // SAFETY: the bitmap region is inside the mapping; exclusivity per
        // the function contract.
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.region.addr + self.bitmap_off) as *mut u8,
                self.bitmap_len,
            )
        }
    }

    /// Reserve one block in the occupancy bitmap.
    fn reserve_block(&self) -> Option<usize> {
        let _guard = self.bitmap_lock.lock();
        // SAFETY: guarded by the bitmap lock.
        let bm = unsafe { self.bitmap_mut() };
        bitmap::find_and_set(bm, self.block_count)
    }

    /// Reserve a contiguous run of blocks in the occupancy bitmap.
    fn reserve_run(&self, blocks: usize) -> Option<usize> {
        let _guard = self.bitmap_lock.lock();
        // SAFETY: guarded by the bitmap lock.
        let bm = unsafe { self.bitmap_mut() };
        bitmap::find_and_set_run(bm, self.block_count, blocks)
    }

    /// Release a run of blocks in the occupancy bitmap.
    fn release_run(&self, start: usize, blocks: usize) {
        let _guard = self.bitmap_lock.lock();
        // SAFETY: guarded by the bitmap lock.
        let bm = unsafe { self.bitmap_mut() };
        bitmap::clear_range(bm, start, blocks);
    }

    pub(crate) fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size <= SMALL_SLICE_SIZE {
            self.small_malloc()
        } else {
            self.big_malloc(size)
        }
    }

    /// Small path: first free slice on the stream's small-block list, else
    /// carve a fresh block.
    fn small_malloc(&self) -> Option<NonNull<u8>> {
        let stream = stream_for(self.streams);
        let mut sb;
        {
            let _guard = self.stream_locks[stream].lock();
            // SAFETY: head word inside the mapping, read under stream lock.
            sb = unsafe { *self.small_head_ptr(stream) };
            if sb != 0 {
                // SAFETY: a listed block is a live SmallBlock.
                unsafe { (*(sb as *const SmallBlock)).lock.lock() };
            }
        }
        // hand-over-hand down the list, hunting a free slice
        while sb != 0 {
            // SAFETY: we hold this block's lock; the bitmap is ours.
            let bm = unsafe { &mut (*(sb as *mut SmallBlock)).bitmap };
            if let Some(slice) = bitmap::find_and_set(bm, SMALL_SLICE_COUNT) {
                // SAFETY: slice addresses derive from the block we hold.
                let p = unsafe { (*(sb as *const SmallBlock)).slices.as_ptr() as usize }
                    + slice * SMALL_SLICE_SIZE;
                // SAFETY: as above.
                unsafe { (*(sb as *const SmallBlock)).lock.unlock() };
                return NonNull::new(p as *mut u8);
            }
            // SAFETY: `next` is stable while we hold the block's lock.
            let next = unsafe { (*(sb as *const SmallBlock)).next };
            if next != 0 {
                // SAFETY: a linked block is a live SmallBlock.
                unsafe { (*(next as *const SmallBlock)).lock.lock() };
            }
            // SAFETY: as above.
            unsafe { (*(sb as *const SmallBlock)).lock.unlock() };
            sb = next;
        }
        // every listed block is full: claim a fresh one
        let index = self.reserve_block()?;
        let sb = self.block_addr(index);
        // SAFETY: the block was just reserved; nobody else can touch it.
        unsafe { init_block_header(sb) };
        {
            let _guard = self.stream_locks[stream].lock();
            // SAFETY: chaining the fresh block under the stream lock; the
            // block's own lock is taken before the stream unlocks so the
            // slice grab below cannot race a concurrent walker.
            unsafe {
                (*(sb as *mut SmallBlock)).next = *self.small_head_ptr(stream);
                *self.small_head_ptr(stream) = sb;
                (*(sb as *const SmallBlock)).lock.lock();
            }
        }
        // fresh block: slice 0 is ours by construction
        // SAFETY: we hold the block lock.
        let p = unsafe {
            (*(sb as *mut SmallBlock)).bitmap[0] = 0x80;
            let p = (*(sb as *const SmallBlock)).slices.as_ptr() as usize;
            (*(sb as *const SmallBlock)).lock.unlock();
            p
        };
        debug!("small block {index} added to stream {stream}");
        NonNull::new(p as *mut u8)
    }

    /// Big path: reserve the data run first, then record it in a header
    /// entry. Any failure after the reservation rolls every reserved bit
    /// back.
    fn big_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let blocks = size.div_ceil(BLOCK_SIZE);
        let stream = stream_for(self.streams);
        let offset = if blocks > 1 {
            self.reserve_run(blocks)?
        } else {
            self.reserve_block()?
        };
        let data = self.block_addr(offset);

        let mut bbh;
        {
            let _guard = self.stream_locks[stream].lock();
            // SAFETY: head word inside the mapping, read under stream lock.
            bbh = unsafe { *self.big_head_ptr(stream) };
            if bbh != 0 {
                // SAFETY: a listed block is a live BigBlockHeader.
                unsafe { (*(bbh as *const BigBlockHeader)).lock.lock() };
            }
        }
        // hand-over-hand, hunting a free entry; on success the header stays
        // locked
        let mut claimed = None;
        while bbh != 0 {
            // SAFETY: we hold this header's lock.
            let bm = unsafe { &mut (*(bbh as *mut BigBlockHeader)).bitmap };
            if let Some(slot) = bitmap::find_and_set(bm, BIG_ENTRY_COUNT) {
                claimed = Some((bbh, slot));
                break;
            }
            // SAFETY: as in small_malloc.
            let next = unsafe { (*(bbh as *const BigBlockHeader)).next };
            if next != 0 {
                // SAFETY: a linked block is a live BigBlockHeader.
                unsafe { (*(next as *const BigBlockHeader)).lock.lock() };
            }
            // SAFETY: as above.
            unsafe { (*(bbh as *const BigBlockHeader)).lock.unlock() };
            bbh = next;
        }
        let (bbh, slot) = match claimed {
            Some(found) => found,
            None => {
                // no header has room: claim one more block for a fresh one
                let Some(hindex) = self.reserve_block() else {
                    // strict rollback of the data reservation
                    self.release_run(offset, blocks);
                    return None;
                };
                let h = self.block_addr(hindex);
                // SAFETY: just reserved.
                unsafe { init_block_header(h) };
                {
                    let _guard = self.stream_locks[stream].lock();
                    // SAFETY: as in small_malloc's chaining.
                    unsafe {
                        (*(h as *mut BigBlockHeader)).next = *self.big_head_ptr(stream);
                        *self.big_head_ptr(stream) = h;
                        (*(h as *const BigBlockHeader)).lock.lock();
                    }
                }
                debug!("big-block header {hindex} added to stream {stream}");
                // SAFETY: we hold the fresh header's lock.
                let bm = unsafe { &mut (*(h as *mut BigBlockHeader)).bitmap };
                let slot = bitmap::find_and_set(bm, BIG_ENTRY_COUNT)
                    .expect("fresh header has a free entry");
                (h, slot)
            }
        };
        // SAFETY: we hold the header's lock; the slot bit is ours.
        unsafe {
            let e = &mut (*(bbh as *mut BigBlockHeader)).entries[slot];
            e.entry = data;
            e.block_count = blocks;
            (*(bbh as *const BigBlockHeader)).lock.unlock();
        }
        NonNull::new(data as *mut u8)
    }

    /// Return an allocation.
    ///
    /// # Safety
    ///
    /// `p` must have come from this map's `malloc` and not been freed since.
    /// A big allocation must be freed from a thread on the stream that made
    /// it (the header ledger is per-stream).
    pub(crate) unsafe fn free(&self, p: NonNull<u8>) {
        let addr = p.as_ptr() as usize;
        let off = addr - self.base();
        if off % BLOCK_SIZE != 0 {
            // unaligned: a small-block slice
            let sb = self.base() + (off & !(BLOCK_SIZE - 1));
            // SAFETY: `sb` is the live SmallBlock owning the slice.
            unsafe {
                let slices = (*(sb as *const SmallBlock)).slices.as_ptr() as usize;
                let slice = (addr - slices) / SMALL_SLICE_SIZE;
                (*(sb as *const SmallBlock)).lock.lock();
                bitmap::clear_bit(&mut (*(sb as *mut SmallBlock)).bitmap, slice);
                (*(sb as *const SmallBlock)).lock.unlock();
            }
        } else {
            // aligned: find the ledger entry on the caller's stream
            // SAFETY: contract forwarded.
            unsafe { self.big_free(addr) }
        }
    }

    unsafe fn big_free(&self, addr: usize) {
        let stream = stream_for(self.streams);
        let mut bbh;
        {
            let _guard = self.stream_locks[stream].lock();
            // SAFETY: head word inside the mapping, read under stream lock.
            bbh = unsafe { *self.big_head_ptr(stream) };
            if bbh != 0 {
                // SAFETY: a listed block is a live BigBlockHeader.
                unsafe { (*(bbh as *const BigBlockHeader)).lock.lock() };
            }
        }
        let mut blocks = 0;
        let mut found = false;
        while bbh != 0 {
            for slot in 0..BIG_ENTRY_COUNT {
                // SAFETY: we hold this header's lock.
                let e = unsafe { &mut (*(bbh as *mut BigBlockHeader)).entries[slot] };
                if e.entry == addr {
                    // SAFETY: as above.
                    bitmap::clear_bit(unsafe { &mut (*(bbh as *mut BigBlockHeader)).bitmap }, slot);
                    blocks = e.block_count;
                    e.entry = 0;
                    e.block_count = 0;
                    found = true;
                    break;
                }
            }
            if found {
                // SAFETY: as above.
                unsafe { (*(bbh as *const BigBlockHeader)).lock.unlock() };
                break;
            }
            // SAFETY: as in the malloc walks.
            let next = unsafe { (*(bbh as *const BigBlockHeader)).next };
            if next != 0 {
                // SAFETY: a linked block is a live BigBlockHeader.
                unsafe { (*(next as *const BigBlockHeader)).lock.lock() };
            }
            // SAFETY: as above.
            unsafe { (*(bbh as *const BigBlockHeader)).lock.unlock() };
            bbh = next;
        }
        if found && blocks > 0 {
            self.release_run((addr - self.base()) / BLOCK_SIZE, blocks);
        } else {
            warn!("free of unknown big pointer {addr:#x} on stream {stream}");
        }
    }

    /// Occupied blocks per the bitmap.
    pub(crate) fn occupied_blocks(&self) -> usize {
        let _guard = self.bitmap_lock.lock();
        // SAFETY: guarded by the bitmap lock.
        let bm = unsafe { self.bitmap_mut() };
        bitmap::count_set(bm, self.block_count)
    }
}
