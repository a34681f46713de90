//! weft-persist — file-backed persistent arena allocation
//!
//! Two arena flavors over one mapping layer:
//!
//! - **static**: uniform records threaded onto per-stream free lists; built
//!   for huge counts of one fixed record type.
//! - **dynamic**: variable-size requests at 2 KiB block granularity, with
//!   requests up to 64 bytes carved out of shared small blocks.
//!
//! Files are mapped shared at a stable virtual address recorded in the file
//! itself, so the pointers handed out (and the intrusive structures inside
//! the file) survive process restarts: re-`load_map` the file and old
//! pointers are live again. [`checkpoint`] flushes every mapping as a
//! durability hint; there is no crash-consistent recovery.
//!
//! Streams shard every hot path by calling thread, so unrelated threads
//! allocate without touching the same locks.

mod bitmap;
mod dynamic_arena;
pub mod map;
mod static_arena;
mod stream;

pub use map::{checkpoint, cleanup, load_map, make_dynamic_map, make_static_map, Map};
