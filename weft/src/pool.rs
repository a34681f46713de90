//! Freelist pools for scheduler records
//!
//! Every shepherd owns a set of pools for the records the runtime churns
//! through (task records, stacks, FEB wait records, FEB status records, lock
//! records); a process-global set serves callers that are not tasks. A freed
//! record always returns to the pool of the shepherd that minted it, never
//! the freeing shepherd's, so pool contents stay balanced under producer/
//! consumer patterns. Pooled records keep their embedded mutexes initialized
//! across reuse; nothing is destroyed until process teardown.

use spin::Mutex;

use crate::feb::{AddrRes, AddrStat};
use crate::lock::LockRecord;
use crate::task::{Task, TaskStack};

/// A freelist of reusable records.
pub(crate) struct Pool<T> {
    free: Mutex<Vec<T>>,
}

impl<T> Pool<T> {
    pub(crate) const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pop a pooled record, if any. The caller reinitializes it.
    pub(crate) fn take(&self) -> Option<T> {
        self.free.lock().pop()
    }

    /// Return a record to the pool.
    pub(crate) fn put(&self, item: T) {
        self.free.lock().push(item);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.lock().len()
    }
}

/// The pool set each shepherd (and the generic fallback) carries.
pub(crate) struct RecordPools {
    pub(crate) tasks: Pool<Box<Task>>,
    pub(crate) stacks: Pool<TaskStack>,
    pub(crate) addrres: Pool<Box<AddrRes>>,
    pub(crate) addrstats: Pool<Box<AddrStat>>,
    pub(crate) locks: Pool<Box<LockRecord>>,
}

impl RecordPools {
    pub(crate) const fn new() -> Self {
        Self {
            tasks: Pool::new(),
            stacks: Pool::new(),
            addrres: Pool::new(),
            addrstats: Pool::new(),
            locks: Pool::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_put_roundtrip() {
        let pool: Pool<Box<u64>> = Pool::new();
        assert!(pool.take().is_none());
        pool.put(Box::new(7));
        pool.put(Box::new(9));
        assert_eq!(pool.len(), 2);
        assert_eq!(*pool.take().unwrap(), 9);
        assert_eq!(*pool.take().unwrap(), 7);
        assert!(pool.take().is_none());
    }
}
