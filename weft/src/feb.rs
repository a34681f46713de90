//! Full/empty-bit word synchronization
//!
//! Every aligned machine word conceptually carries a `full` bit. A word with
//! no status record in the stripe table is full with no waiters; a record
//! (`AddrStat`) springs into existence the first time an operation needs to
//! track emptiness or park a waiter, and is torn down again the moment it is
//! full with all three waiter lists empty.
//!
//! The lock ordering in these functions is very particular: stripe write
//! lock, then the record mutex, then (never here) a waiter's queue. The
//! record mutex is acquired *before* the stripe lock is released, otherwise
//! the record could be removed out from under the operation. A blocking
//! operation parks itself on one of the three lists and suspends with the
//! record mutex still held; its shepherd releases the mutex once the task's
//! context is safely saved.

use std::ptr::NonNull;

use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::error::{Result, WeftError};
use crate::runtime::{runtime, Runtime};
use crate::shepherd::{self, wake_task};
use crate::task::{Aligned, BlockedOn, Parker, ShepherdId, Task, TaskState};

/// FEB status record for one aligned word.
pub struct AddrStat {
    pub(crate) lock: Mutex<AddrStatInner>,
    pub(crate) creator: Option<ShepherdId>,
}

// SAFETY: records travel between threads inside pools and stripe maps; all
// shared state sits behind the record mutex.
unsafe impl Send for AddrStat {}
// SAFETY: as above.
unsafe impl Sync for AddrStat {}

impl AddrStat {
    pub(crate) fn bare() -> Self {
        Self {
            lock: Mutex::new(AddrStatInner::new(true)),
            creator: None,
        }
    }
}

/// The mutex-protected half of an [`AddrStat`].
pub(crate) struct AddrStatInner {
    pub(crate) full: bool,
    /// Writers waiting for empty (pending `write_ef`)
    pub(crate) efq: WaiterList,
    /// Readers waiting for full who will re-empty (pending `read_fe`)
    pub(crate) feq: WaiterList,
    /// Readers waiting for full (pending `read_ff`)
    pub(crate) ffq: WaiterList,
}

impl AddrStatInner {
    pub(crate) fn new(full: bool) -> Self {
        Self {
            full,
            efq: WaiterList::new(),
            feq: WaiterList::new(),
            ffq: WaiterList::new(),
        }
    }

    /// The record may leave the stripe table iff the word is full and no
    /// waiter remains on any list.
    fn removable(&self) -> bool {
        self.full && self.efq.is_empty() && self.feq.is_empty() && self.ffq.is_empty()
    }
}

/// One parked FEB operation: the waiter and its operand address (the copy
/// source for a pending write, the copy destination for a pending read).
pub struct AddrRes {
    pub(crate) addr: *mut Aligned,
    pub(crate) waiter: Option<NonNull<Task>>,
    pub(crate) creator: Option<ShepherdId>,
    pub(crate) next: Option<NonNull<AddrRes>>,
}

// SAFETY: an AddrRes is owned by exactly one waiter list (or pool) at a
// time, and only ever touched under the owning record's mutex.
unsafe impl Send for AddrRes {}

impl AddrRes {
    pub(crate) fn bare() -> Self {
        Self {
            addr: std::ptr::null_mut(),
            waiter: None,
            creator: None,
            next: None,
        }
    }
}

/// Intrusive FIFO of [`AddrRes`] records.
pub(crate) struct WaiterList {
    head: Option<NonNull<AddrRes>>,
    tail: Option<NonNull<AddrRes>>,
}

impl WaiterList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn push_back(&mut self, res: NonNull<AddrRes>) {
        // SAFETY: ownership of `res` transfers to this list; links are only
        // touched under the record mutex.
        unsafe {
            (*res.as_ptr()).next = None;
        }
        match self.tail {
            None => {
                self.head = Some(res);
                self.tail = Some(res);
            }
            Some(tail) => {
                // SAFETY: the tail record is owned by this list.
                unsafe {
                    (*tail.as_ptr()).next = Some(res);
                }
                self.tail = Some(res);
            }
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<NonNull<AddrRes>> {
        let res = self.head?;
        // SAFETY: the head record is owned by this list.
        unsafe {
            self.head = (*res.as_ptr()).next;
            (*res.as_ptr()).next = None;
        }
        if self.head.is_none() {
            self.tail = None;
        }
        Some(res)
    }
}

/// Round a word address down to native alignment, warning when that changed
/// anything. Misalignment is a diagnostic, not an error.
fn aligned(addr: usize, op: &str) -> usize {
    let a = addr & !(core::mem::size_of::<Aligned>() - 1);
    if a != addr {
        warn!("{op}: unaligned address {addr:#x} ... assuming {a:#x}");
    }
    a
}

/// Copy one aligned word, tolerating a null or self destination.
unsafe fn word_copy(dst: *mut Aligned, src: *const Aligned) {
    if !dst.is_null() && !src.is_null() && dst as *const Aligned != src {
        // SAFETY: both pointers were supplied by a caller contract-bound to
        // keep them valid for the duration of the operation.
        unsafe {
            *dst = *src;
        }
    }
}

#[derive(Clone, Copy)]
enum FebList {
    Ef,
    Fe,
    Ff,
}

/// Transition the word to empty; complete at most one pending `write_ef`.
/// Runs (and recurses) entirely under the record mutex.
fn gotlock_empty(rt: &Runtime, inner: &mut AddrStatInner, maddr: usize) {
    inner.full = false;
    if let Some(x) = inner.efq.pop_front() {
        // SAFETY: the record is owned by this list until freed below; the
        // waiter pointer stays valid until we wake it.
        let (src, waiter) = unsafe { ((*x.as_ptr()).addr, (*x.as_ptr()).waiter) };
        // the parked writer's source becomes the new word
        // SAFETY: word and operand validity per the operation contracts.
        unsafe {
            word_copy(maddr as *mut Aligned, src);
        }
        if let Some(w) = waiter {
            // SAFETY: the waiter left its list; we are its only owner.
            unsafe { wake_task(rt, w) };
        }
        rt.free_addrres(x);
        gotlock_fill(rt, inner, maddr);
    }
}

/// Transition the word to full; complete every pending `read_ff`, then at
/// most one pending `read_fe` (which re-empties the word). Runs (and
/// recurses) entirely under the record mutex.
fn gotlock_fill(rt: &Runtime, inner: &mut AddrStatInner, maddr: usize) {
    inner.full = true;
    while let Some(x) = inner.ffq.pop_front() {
        // SAFETY: as in gotlock_empty.
        let (dst, waiter) = unsafe { ((*x.as_ptr()).addr, (*x.as_ptr()).waiter) };
        // SAFETY: word and operand validity per the operation contracts.
        unsafe {
            word_copy(dst, maddr as *const Aligned);
        }
        if let Some(w) = waiter {
            // SAFETY: the waiter left its list; we are its only owner.
            unsafe { wake_task(rt, w) };
        }
        rt.free_addrres(x);
    }
    if let Some(x) = inner.feq.pop_front() {
        // SAFETY: as above.
        let (dst, waiter) = unsafe { ((*x.as_ptr()).addr, (*x.as_ptr()).waiter) };
        // SAFETY: as above.
        unsafe {
            word_copy(dst, maddr as *const Aligned);
        }
        if let Some(w) = waiter {
            // SAFETY: as above.
            unsafe { wake_task(rt, w) };
        }
        rt.free_addrres(x);
        gotlock_empty(rt, inner, maddr);
    }
}

/// Outermost exit path of a synchronous FEB transition: release the record
/// mutex and, if the removal predicate held at release time, try to retire
/// the record. Another thread may win the race and remove it first; that is
/// tolerated.
fn release_and_maybe_remove(rt: &Runtime, guard: MutexGuard<'_, AddrStatInner>, maddr: usize) {
    let removable = guard.removable();
    drop(guard);
    if removable {
        feb_remove(rt, maddr);
    }
}

/// Retire the status record for `maddr` if it is still removable.
fn feb_remove(rt: &Runtime, maddr: usize) {
    let stripe = rt.febs.stripe(maddr);
    let mut map = stripe.write();
    if let Some(&m) = map.get(&maddr) {
        // SAFETY: the record is alive while present in the map, and we hold
        // the stripe write lock.
        let rec = unsafe { &*m.as_ptr() };
        let guard = rec.lock.lock();
        if guard.removable() {
            debug!("feb_remove({maddr:#x}): all lists empty and full, removing");
            map.remove(&maddr);
            drop(map);
            drop(guard);
            // SAFETY: removed from the table while holding both the stripe
            // lock and the record mutex, so no other reference can exist.
            unsafe { rt.free_addrstat(m) };
        } else {
            debug!("feb_remove({maddr:#x}): record back in use, leaving it");
        }
    }
}

/// Park the caller on one of the record's waiter lists and suspend until a
/// peer operation completes the exchange.
///
/// Entered holding the record mutex. A task forgets the guard and lets its
/// shepherd release the mutex after the context switch; a non-task thread
/// parks a MCCOY proxy and releases the mutex itself before sleeping.
fn block_on(
    rt: &Runtime,
    m: NonNull<AddrStat>,
    mut guard: MutexGuard<'_, AddrStatInner>,
    which: FebList,
    operand: *mut Aligned,
) -> Result<()> {
    let res = rt.alloc_addrres(operand);
    let list = match which {
        FebList::Ef => &mut guard.efq,
        FebList::Fe => &mut guard.feq,
        FebList::Ff => &mut guard.ffq,
    };
    if let Some(t) = shepherd::current_task_ptr() {
        // SAFETY: we *are* this task; nothing else touches it while it runs.
        let task = unsafe { &mut *t.as_ptr() };
        // SAFETY: `res` is exclusively ours until pushed.
        unsafe {
            (*res.as_ptr()).waiter = Some(t);
        }
        list.push_back(res);
        task.state = TaskState::FebBlocked;
        task.blocked_on = BlockedOn::Feb(m);
        // The shepherd releases the record mutex on our behalf once our
        // context is saved; dropping the guard here would open a window
        // where a peer could wake us before we finished suspending.
        core::mem::forget(guard);
        // SAFETY: called from task context; resumes when a peer wakes us.
        unsafe { shepherd::back_to_master(task) };
        Ok(())
    } else {
        // Not a task: park this OS thread on a proxy record instead.
        let parker = Parker::new();
        let mut proxy = Task::mccoy(parker.clone());
        proxy.blocked_on = BlockedOn::Feb(m);
        let proxy_ptr = NonNull::from(&mut *proxy);
        // SAFETY: `res` is exclusively ours until pushed.
        unsafe {
            (*res.as_ptr()).waiter = Some(proxy_ptr);
        }
        list.push_back(res);
        drop(guard);
        parker.park();
        // the waker only unparks a MCCOY proxy; we still own the box
        drop(proxy);
        Ok(())
    }
}

/// Set the word at `dest` empty. Wakes one pending writer, if any.
///
/// # Safety
///
/// `dest` must point to a live aligned word that remains valid for as long
/// as any FEB operation may reference it.
pub unsafe fn empty(dest: *const Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(dest as usize, "empty");
    let stripe = rt.febs.stripe(a);
    let mut map = stripe.write();
    match map.get(&a).copied() {
        None => {
            // currently full; a fresh record tracks the emptiness
            let m = rt.alloc_addrstat(false);
            map.insert(a, m);
            Ok(())
        }
        Some(m) => {
            // SAFETY: alive while mapped; stripe lock held.
            let rec = unsafe { &*m.as_ptr() };
            let mut guard = rec.lock.lock();
            drop(map);
            gotlock_empty(rt, &mut guard, a);
            release_and_maybe_remove(rt, guard, a);
            Ok(())
        }
    }
}

/// Set the word at `dest` full, waking every FF reader and at most one FE
/// reader.
///
/// # Safety
///
/// As [`empty`].
pub unsafe fn fill(dest: *const Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(dest as usize, "fill");
    let stripe = rt.febs.stripe(a);
    let mut map = stripe.write();
    match map.get(&a).copied() {
        // absent from the table means the word was already full
        None => Ok(()),
        Some(m) => {
            // SAFETY: alive while mapped; stripe lock held.
            let rec = unsafe { &*m.as_ptr() };
            let mut guard = rec.lock.lock();
            drop(map);
            gotlock_fill(rt, &mut guard, a);
            release_and_maybe_remove(rt, guard, a);
            Ok(())
        }
    }
}

/// Store `*src` into the word at `dest` and fill it, regardless of its
/// previous state. Never blocks.
///
/// # Safety
///
/// `dest` and `src` must point to live aligned words; `dest` as in
/// [`empty`].
pub unsafe fn write_f(dest: *mut Aligned, src: *const Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(dest as usize, "write_f");
    let (_m, mut guard) = find_or_insert(rt, a);
    // SAFETY: caller contract.
    unsafe {
        word_copy(a as *mut Aligned, src);
    }
    gotlock_fill(rt, &mut guard, a);
    release_and_maybe_remove(rt, guard, a);
    Ok(())
}

/// [`write_f`] with an immediate value.
///
/// # Safety
///
/// `dest` as in [`empty`].
pub unsafe fn write_f_const(dest: *mut Aligned, value: Aligned) -> Result<()> {
    let src = value;
    // SAFETY: `src` lives across the (non-blocking) call.
    unsafe { write_f(dest, &src) }
}

/// Wait for the word at `dest` to be empty, then store `*src` and fill it.
///
/// # Safety
///
/// `dest` and `src` must point to live aligned words and stay valid while
/// the operation may be parked.
pub unsafe fn write_ef(dest: *mut Aligned, src: *const Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(dest as usize, "write_ef");
    let (m, mut guard) = find_or_insert(rt, a);
    if guard.full {
        debug!("write_ef({a:#x}): word full, blocking");
        block_on(rt, m, guard, FebList::Ef, src as *mut Aligned)
    } else {
        // SAFETY: caller contract.
        unsafe {
            word_copy(a as *mut Aligned, src);
        }
        gotlock_fill(rt, &mut guard, a);
        release_and_maybe_remove(rt, guard, a);
        Ok(())
    }
}

/// [`write_ef`] with an immediate value.
///
/// # Safety
///
/// `dest` as in [`write_ef`].
pub unsafe fn write_ef_const(dest: *mut Aligned, value: Aligned) -> Result<()> {
    let src = value;
    // SAFETY: `src` lives in this suspended frame while parked.
    unsafe { write_ef(dest, &src) }
}

/// Wait for the word at `src` to be full, then copy it to `dest` (which may
/// be null to merely wait). Leaves the word full.
///
/// # Safety
///
/// `src` must point to a live aligned word; `dest` must be null or valid
/// for writes; both stay valid while the operation may be parked.
pub unsafe fn read_ff(dest: *mut Aligned, src: *const Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(src as usize, "read_ff");
    let stripe = rt.febs.stripe(a);
    let mut map = stripe.write();
    match map.get(&a).copied() {
        None => {
            // no record: the word is full by definition, no need to make one
            drop(map);
            // SAFETY: caller contract.
            unsafe {
                word_copy(dest, a as *const Aligned);
            }
            Ok(())
        }
        Some(m) => {
            // SAFETY: alive while mapped; stripe lock held.
            let rec = unsafe { &*m.as_ptr() };
            let guard = rec.lock.lock();
            drop(map);
            if guard.full {
                // SAFETY: caller contract.
                unsafe {
                    word_copy(dest, a as *const Aligned);
                }
                drop(guard);
                Ok(())
            } else {
                debug!("read_ff({a:#x}): word empty, blocking");
                block_on(rt, m, guard, FebList::Ff, dest)
            }
        }
    }
}

/// Wait for the word at `src` to be full, copy it to `dest`, and leave the
/// word empty (waking one pending writer, if any).
///
/// # Safety
///
/// As [`read_ff`].
pub unsafe fn read_fe(dest: *mut Aligned, src: *mut Aligned) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let a = aligned(src as usize, "read_fe");
    let (m, mut guard) = find_or_insert(rt, a);
    if !guard.full {
        debug!("read_fe({a:#x}): word empty, blocking");
        block_on(rt, m, guard, FebList::Fe, dest)
    } else {
        // SAFETY: caller contract.
        unsafe {
            word_copy(dest, a as *const Aligned);
        }
        gotlock_empty(rt, &mut guard, a);
        release_and_maybe_remove(rt, guard, a);
        Ok(())
    }
}

/// Whether the word at `addr` is currently full. Purely a debugging aid;
/// the answer may be stale by the time the caller sees it.
pub fn feb_status(addr: *const Aligned) -> bool {
    let Some(rt) = runtime() else {
        return true;
    };
    let a = aligned(addr as usize, "feb_status");
    let stripe = rt.febs.stripe(a);
    let map = stripe.read();
    match map.get(&a) {
        None => true,
        Some(&m) => {
            // SAFETY: alive while mapped; stripe lock held.
            let rec = unsafe { &*m.as_ptr() };
            let full = rec.lock.lock().full;
            full
        }
    }
}

/// Shared entry protocol: find or insert the status record for `a`, lock it
/// while still holding the stripe write lock, then release the stripe.
fn find_or_insert(rt: &Runtime, a: usize) -> (NonNull<AddrStat>, MutexGuard<'static, AddrStatInner>) {
    let stripe = rt.febs.stripe(a);
    let mut map = stripe.write();
    let m = match map.get(&a).copied() {
        Some(m) => m,
        None => {
            let m = rt.alloc_addrstat(true);
            map.insert(a, m);
            m
        }
    };
    // SAFETY: the record is alive while mapped and we hold the stripe lock;
    // the guard's lifetime is bounded in practice by the removal protocol
    // (a record is only freed by a thread holding both the stripe lock and
    // this mutex).
    let rec: &'static AddrStat = unsafe { &*m.as_ptr() };
    let guard = rec.lock.lock();
    drop(map);
    (m, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_res() -> NonNull<AddrRes> {
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(AddrRes::bare()))) }
    }

    #[test]
    fn waiter_list_is_fifo() {
        let mut list = WaiterList::new();
        assert!(list.is_empty());
        let (a, b, c) = (raw_res(), raw_res(), raw_res());
        list.push_back(a);
        list.push_back(b);
        list.push_back(c);
        assert_eq!(list.pop_front(), Some(a));
        assert_eq!(list.pop_front(), Some(b));
        assert_eq!(list.pop_front(), Some(c));
        assert!(list.pop_front().is_none());
        for r in [a, b, c] {
            // SAFETY: allocated above, no longer linked.
            drop(unsafe { Box::from_raw(r.as_ptr()) });
        }
    }

    #[test]
    fn removable_predicate() {
        let mut inner = AddrStatInner::new(true);
        assert!(inner.removable());
        inner.full = false;
        assert!(!inner.removable());
        inner.full = true;
        let r = raw_res();
        inner.ffq.push_back(r);
        assert!(!inner.removable());
        inner.ffq.pop_front();
        assert!(inner.removable());
        // SAFETY: allocated above, no longer linked.
        drop(unsafe { Box::from_raw(r.as_ptr()) });
    }

    #[test]
    fn alignment_rounds_down() {
        assert_eq!(aligned(0x1008, "test"), 0x1008);
        assert_eq!(aligned(0x100b, "test"), 0x1008);
    }
}
