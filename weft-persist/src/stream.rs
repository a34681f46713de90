//! Stream selection
//!
//! A *stream* is an independent allocation shard; spreading threads across
//! streams keeps them off each other's locks. The shard is keyed by a
//! process-assigned numeric thread id, so the same thread keeps hitting the
//! same stream for the life of the mapping.

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// The calling thread's process-local numeric id.
pub(crate) fn thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

/// The calling thread's stream in a map with `streams` shards.
pub(crate) fn stream_for(streams: usize) -> usize {
    thread_id() % streams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_per_thread() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn stream_is_bounded() {
        for s in 1..8 {
            assert!(stream_for(s) < s);
        }
    }
}
