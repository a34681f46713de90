//! Address-keyed mutual exclusion
//!
//! A lock is named by an address-sized key; the key is never dereferenced.
//! Records spring into existence on first acquisition and are retired on the
//! unlock that finds no waiters, so an uncontended lock costs one record
//! round-trip. Lock ordering is strict: stripe write lock, then the record
//! mutex, then the record's waiting queue. No other order is permitted.

use std::ptr::NonNull;

use log::{debug, warn};
use spin::Mutex;

use crate::error::{Result, WeftError};
use crate::queue::TaskQueue;
use crate::runtime::runtime;
use crate::shepherd::{self, wake_task};
use crate::task::{BlockedOn, Parker, ShepherdId, Task, TaskId, TaskState};

/// One address lock: a FIFO of blocked waiters plus bookkeeping.
pub struct LockRecord {
    /// Tasks blocked on this lock, in arrival order
    pub(crate) waiting: TaskQueue,
    /// Hand-off mutex; the inner value is debug bookkeeping only
    pub(crate) lock: Mutex<LockOwner>,
    pub(crate) creator: Option<ShepherdId>,
}

/// Debug owner bookkeeping for a [`LockRecord`].
pub(crate) struct LockOwner {
    pub(crate) owner: TaskId,
}

impl LockRecord {
    pub(crate) fn bare() -> Self {
        Self {
            waiting: TaskQueue::new(),
            lock: Mutex::new(LockOwner { owner: 0 }),
            creator: None,
        }
    }
}

/// Acquire the lock named by `addr`, blocking until it is free.
///
/// A task suspends cooperatively; a plain OS thread parks on a MCCOY proxy.
/// Ownership is handed off FIFO by [`unlock`].
pub fn lock(addr: usize) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let stripe = rt.locks.stripe(addr);
    let mut map = stripe.write();
    match map.get(&addr).copied() {
        None => {
            let m = rt.alloc_lock_record();
            map.insert(addr, m);
            // SAFETY: the record is alive while mapped and we hold the
            // stripe write lock.
            let rec = unsafe { &*m.as_ptr() };
            // Lock the record before releasing the stripe, otherwise an
            // unlock could retire the record before we attach to it.
            let mut owner = rec.lock.lock();
            drop(map);
            owner.owner = shepherd::current_task_id();
            drop(owner);
            debug!("lock({addr:#x}): acquired, was unlocked");
            Ok(())
        }
        Some(m) => {
            // Someone owns it: attach to the record and wait for hand-off.
            // SAFETY: as above.
            let rec = unsafe { &*m.as_ptr() };
            let guard = rec.lock.lock();
            drop(map);
            if let Some(t) = shepherd::current_task_ptr() {
                // SAFETY: we *are* this task.
                let task = unsafe { &mut *t.as_ptr() };
                task.state = TaskState::Blocked;
                task.blocked_on = BlockedOn::Lock(m);
                // The shepherd moves us onto the waiting queue and releases
                // the record mutex once our context is saved.
                core::mem::forget(guard);
                // SAFETY: task context; resumes when the lock is ours.
                unsafe { shepherd::back_to_master(task) };
                debug!("lock({addr:#x}): acquired, was locked");
                Ok(())
            } else {
                let parker = Parker::new();
                let mut proxy = Task::mccoy(parker.clone());
                proxy.blocked_on = BlockedOn::Lock(m);
                rec.waiting.enqueue(NonNull::from(&mut *proxy));
                drop(guard);
                parker.park();
                // the waker only unparks a MCCOY proxy; the box is ours
                drop(proxy);
                debug!("lock({addr:#x}): acquired, was locked (proxy)");
                Ok(())
            }
        }
    }
}

/// Release the lock named by `addr`.
///
/// Hands ownership to the oldest waiter, or retires the record when nobody
/// is waiting. Unlocking an address that is not locked reports
/// [`WeftError::Redundant`]; that is a status, not a failure.
pub fn unlock(addr: usize) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let stripe = rt.locks.stripe(addr);
    let mut map = stripe.write();
    let Some(&m) = map.get(&addr) else {
        warn!("unlock({addr:#x}): address is not locked");
        return Err(WeftError::Redundant);
    };
    // SAFETY: the record is alive while mapped; stripe write lock held.
    let rec = unsafe { &*m.as_ptr() };
    let mut owner = rec.lock.lock();
    match rec.waiting.dequeue_nonblocking() {
        None => {
            debug!("unlock({addr:#x}): no waiters, retiring record");
            map.remove(&addr);
            drop(map);
            drop(owner);
            // SAFETY: removed from the table while holding both the stripe
            // lock and the record mutex, so no other reference can exist.
            unsafe { rt.free_lock_record(m) };
            Ok(())
        }
        Some(u) => {
            drop(map);
            // SAFETY: a dequeued waiter is exclusively ours until woken.
            let id = unsafe { (*u.as_ptr()).id() };
            owner.owner = id;
            debug!("unlock({addr:#x}): handing lock to task {id}");
            // SAFETY: as above; wake_task re-queues or unparks it.
            unsafe { wake_task(rt, u) };
            drop(owner);
            Ok(())
        }
    }
}
