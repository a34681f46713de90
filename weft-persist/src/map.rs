//! File mappings and the process-wide mapping registry
//!
//! A map is a fixed-size file mapped shared and read/write, preferably at
//! the virtual address recorded inside the file itself — the arenas persist
//! raw pointers, so a reloaded file that lands anywhere else is unusable and
//! treated as fatal. The first three machine words of every file are
//! `[base_address, item_size_or_zero, stream_count]`; a nonzero item size
//! marks a static arena, zero marks a dynamic arena.
//!
//! Violated mapping invariants (wrong file size, mmap failure, relocated
//! base) abort the process: there is nothing sensible to recover into when
//! the persisted heap cannot exist.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::{debug, error};

use crate::dynamic_arena::DynamicMap;
use crate::static_arena::StaticMap;

/// Machine word size; header fields and free-list links are one word each.
pub(crate) const WORD: usize = core::mem::size_of::<usize>();

/// Reserved on-disk footprint of one lock (the original layout stored a
/// pthread mutex here). Live locks are process-side; the slot keeps the
/// layout and offsets stable.
pub(crate) const LOCK_SLOT: usize = 64;

/// Granularity of the dynamic arena.
pub(crate) const BLOCK_SIZE: usize = 2048;

/// One live mmap'ed region. Unmapped on drop.
pub(crate) struct MapRegion {
    pub(crate) addr: usize,
    pub(crate) len: usize,
}

impl MapRegion {
    /// Read header word `index`.
    pub(crate) fn word(&self, index: usize) -> usize {
        // SAFETY: the region is at least three words long (checked at map
        // time) and mapped for the lifetime of self.
        unsafe { *((self.addr + index * WORD) as *const usize) }
    }

    /// Write header word `index`.
    pub(crate) fn set_word(&self, index: usize, value: usize) {
        // SAFETY: as for word().
        unsafe {
            *((self.addr + index * WORD) as *mut usize) = value;
        }
    }

    /// Synchronously flush the whole region to its backing file.
    pub(crate) fn sync(&self) {
        // SAFETY: addr/len describe a live mapping.
        let rc = unsafe {
            libc::msync(
                self.addr as *mut libc::c_void,
                self.len,
                libc::MS_SYNC | libc::MS_INVALIDATE,
            )
        };
        if rc != 0 {
            error!("msync failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl Drop for MapRegion {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a live mapping; nothing uses it after
        // the owning Map is gone.
        let rc = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
        if rc != 0 {
            error!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn fatal(msg: impl core::fmt::Display) -> ! {
    error!("persistent map invariant violated: {msg}");
    std::process::abort()
}

/// Open (creating and sizing if fresh) and map the backing file. Returns
/// the mapping and the base address persisted in the file's first word
/// (zero for a fresh file).
fn map_file(path: &Path, file_size: usize, addr: Option<usize>) -> (MapRegion, usize) {
    if file_size < 3 * WORD {
        fatal(format_args!("file size {file_size} cannot hold a header"));
    }
    let mut file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => fatal(format_args!("open {}: {e}", path.display())),
    };
    let len = match file.metadata() {
        Ok(m) => m.len() as usize,
        Err(e) => fatal(format_args!("stat {}: {e}", path.display())),
    };
    if len == 0 {
        if let Err(e) = file.set_len(file_size as u64) {
            fatal(format_args!("sizing {}: {e}", path.display()));
        }
    } else if len != file_size {
        fatal(format_args!(
            "{} is the wrong size: wanted {file_size}, got {len}",
            path.display()
        ));
    }
    let mut first = [0u8; WORD];
    if let Err(e) = file.read_exact(&mut first) {
        fatal(format_args!("reading base pointer: {e}"));
    }
    let persisted = usize::from_ne_bytes(first);
    let hint = addr.unwrap_or(0) as *mut libc::c_void;
    // SAFETY: mapping a regular file we just opened, with a length matching
    // the file size.
    let mapped = unsafe {
        libc::mmap(
            hint,
            file_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        fatal(format_args!("mmap: {}", std::io::Error::last_os_error()));
    }
    debug!(
        "mapped {} ({} bytes) at {:#x}",
        path.display(),
        file_size,
        mapped as usize
    );
    (
        MapRegion {
            addr: mapped as usize,
            len: file_size,
        },
        persisted,
    )
}

pub(crate) enum MapKind {
    Static(StaticMap),
    Dynamic(DynamicMap),
}

/// Handle to one live persistent arena.
pub struct Map {
    kind: MapKind,
}

impl Map {
    /// Allocate from the arena. The static arena ignores `size` (records
    /// are uniform); the dynamic arena slices a small block for requests up
    /// to 64 bytes and reserves whole 2 KiB blocks above that. Returns
    /// `None` when the arena is exhausted.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        match &self.kind {
            MapKind::Static(m) => m.malloc(),
            MapKind::Dynamic(m) => m.malloc(size),
        }
    }

    /// Return an allocation to the arena.
    ///
    /// # Safety
    ///
    /// `p` must have come from [`Map::malloc`] on this same map and not have
    /// been freed since.
    pub unsafe fn free(&self, p: NonNull<u8>) {
        match &self.kind {
            // SAFETY: contract forwarded to the caller.
            MapKind::Static(m) => unsafe { m.free(p) },
            // SAFETY: contract forwarded to the caller.
            MapKind::Dynamic(m) => unsafe { m.free(p) },
        }
    }

    /// Free cells currently on the static arena's lists, or `None` for a
    /// dynamic map. Debugging aid.
    pub fn free_cells(&self) -> Option<usize> {
        match &self.kind {
            MapKind::Static(m) => Some(m.free_cells()),
            MapKind::Dynamic(_) => None,
        }
    }

    /// Occupied 2 KiB blocks in the dynamic arena's bitmap (data blocks,
    /// small blocks, and headers alike), or `None` for a static map.
    /// Debugging aid.
    pub fn occupied_blocks(&self) -> Option<usize> {
        match &self.kind {
            MapKind::Static(_) => None,
            MapKind::Dynamic(m) => Some(m.occupied_blocks()),
        }
    }

    fn region(&self) -> &MapRegion {
        match &self.kind {
            MapKind::Static(m) => &m.region,
            MapKind::Dynamic(m) => &m.region,
        }
    }
}

lazy_static! {
    /// Every live mapping, keyed by canonical path.
    static ref MAPPINGS: Mutex<HashMap<PathBuf, Arc<Map>>> = Mutex::new(HashMap::new());
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn register(path: &Path, map: Map) -> Arc<Map> {
    let map = Arc::new(map);
    MAPPINGS
        .lock()
        .unwrap()
        .insert(canonical(path), Arc::clone(&map));
    map
}

fn lookup(path: &Path) -> Option<Arc<Map>> {
    MAPPINGS.lock().unwrap().get(&canonical(path)).cloned()
}

/// Create or re-open a static (uniform-record) arena backed by `path`.
///
/// A fresh file is sized to `file_size` and initialized with `item_size`
/// records sharded over `streams` free lists; an existing file must match
/// `file_size` and re-map at its recorded base. `addr` is the preferred
/// mapping address for fresh files.
pub fn make_static_map(
    path: impl AsRef<Path>,
    file_size: usize,
    addr: Option<usize>,
    item_size: usize,
    streams: usize,
) -> Arc<Map> {
    let path = path.as_ref();
    if streams == 0 || item_size == 0 {
        fatal("static map needs a nonzero item size and stream count");
    }
    if let Some(existing) = lookup(path) {
        return existing;
    }
    let (region, persisted) = map_file(path, file_size, addr);
    let arena = if persisted == 0 {
        StaticMap::create(region, item_size, streams)
    } else if persisted != region.addr {
        fatal(format_args!(
            "{} created at {persisted:#x} but mapped at {:#x}",
            path.display(),
            region.addr
        ));
    } else {
        StaticMap::attach(region)
    };
    register(path, Map {
        kind: MapKind::Static(arena),
    })
}

/// Create or re-open a dynamic (2 KiB-block) arena backed by `path`.
pub fn make_dynamic_map(
    path: impl AsRef<Path>,
    file_size: usize,
    addr: Option<usize>,
    streams: usize,
) -> Arc<Map> {
    let path = path.as_ref();
    if streams == 0 {
        fatal("dynamic map needs a nonzero stream count");
    }
    if let Some(existing) = lookup(path) {
        return existing;
    }
    let (region, persisted) = map_file(path, file_size, addr);
    let arena = if persisted == 0 {
        DynamicMap::create(region, streams)
    } else if persisted != region.addr {
        fatal(format_args!(
            "{} created at {persisted:#x} but mapped at {:#x}",
            path.display(),
            region.addr
        ));
    } else {
        DynamicMap::attach(region)
    };
    register(path, Map {
        kind: MapKind::Dynamic(arena),
    })
}

/// Re-open a previously created arena, reading its geometry (and required
/// base address) from the file header.
pub fn load_map(path: impl AsRef<Path>) -> Arc<Map> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => fatal(format_args!("open {}: {e}", path.display())),
    };
    let file_size = match file.metadata() {
        Ok(m) => m.len() as usize,
        Err(e) => fatal(format_args!("stat {}: {e}", path.display())),
    };
    let mut header = [0u8; 3 * WORD];
    if let Err(e) = file.read_exact(&mut header) {
        fatal(format_args!("reading header: {e}"));
    }
    let word_at = |i: usize| {
        let mut w = [0u8; WORD];
        w.copy_from_slice(&header[i * WORD..(i + 1) * WORD]);
        usize::from_ne_bytes(w)
    };
    let (base, item_size, streams) = (word_at(0), word_at(1), word_at(2));
    drop(file);
    if item_size != 0 {
        make_static_map(path, file_size, Some(base), item_size, streams)
    } else {
        make_dynamic_map(path, file_size, Some(base), streams)
    }
}

/// Synchronously flush every live mapping to disk. A durability hint, not a
/// crash-consistency barrier.
pub fn checkpoint() {
    for map in MAPPINGS.lock().unwrap().values() {
        map.region().sync();
    }
}

/// Flush and forget every live mapping. Each region is unmapped once its
/// last handle drops; callers must stop using allocations first.
pub fn cleanup() {
    checkpoint();
    MAPPINGS.lock().unwrap().clear();
}
