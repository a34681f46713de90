//! Process-wide runtime state and the task API
//!
//! One `Runtime` exists between `init` and `finalize`: the ordered shepherd
//! sequence, the striped FEB and lock namespaces, the I/O job queue, and the
//! generic record pools for callers that are not tasks. The pointer is
//! published through a global so that every API entry point (and the task
//! wrapper deep inside a switched context) can reach it.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::error::{Result, WeftError};
use crate::feb::{self, AddrRes, AddrStat, AddrStatInner};
use crate::io::IoQueue;
use crate::lock::LockRecord;
use crate::pool::RecordPools;
use crate::shepherd::{self, current_shepherd, shepherd_loop, Shepherd};
use crate::stripe::StripeSet;
use crate::task::{
    alloc_task_id, Aligned, ShepherdId, Task, TaskFlags, TaskFn, TaskStack, TaskState,
};

/// Default task stack allocation, guard pads included.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// The process-wide runtime.
pub(crate) struct Runtime {
    shepherds: Box<[Shepherd]>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    stack_size: usize,
    /// Global round-robin placement counter for non-task forkers
    sched_shepherd: AtomicU32,
    pub(crate) febs: StripeSet<AddrStat>,
    pub(crate) locks: StripeSet<LockRecord>,
    pub(crate) io: IoQueue,
    /// Pools serving callers that are not tasks
    generic: RecordPools,
}

static QLIB: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());
static FINALIZING: AtomicBool = AtomicBool::new(false);

/// The live runtime, if initialized.
pub(crate) fn runtime() -> Option<&'static Runtime> {
    let p = QLIB.load(Ordering::Acquire);
    // SAFETY: the pointer is leaked at init and reclaimed at finalize only
    // after every shepherd thread has been joined.
    unsafe { p.as_ref() }
}

impl Runtime {
    pub(crate) fn shepherd(&self, id: ShepherdId) -> &Shepherd {
        &self.shepherds[id as usize]
    }

    pub(crate) fn nshepherds(&self) -> u32 {
        self.shepherds.len() as u32
    }

    fn pools_for(&self, creator: Option<ShepherdId>) -> &RecordPools {
        match creator {
            Some(id) => &self.shepherds[id as usize].pools,
            None => &self.generic,
        }
    }

    /// Pools of the calling shepherd, or the generic set for plain threads.
    fn local_pools(&self) -> (&RecordPools, Option<ShepherdId>) {
        match current_shepherd() {
            Some(s) => (&s.pools, Some(s.id)),
            None => (&self.generic, None),
        }
    }

    /// Mint a bare task record (no stack yet) from the target shepherd's
    /// pools; the record remembers its creator for the eventual free.
    pub(crate) fn alloc_task(
        &self,
        func: Option<TaskFn>,
        ret: *mut Aligned,
        shepherd: ShepherdId,
    ) -> NonNull<Task> {
        let pools = &self.shepherds[shepherd as usize].pools;
        let mut t = pools.tasks.take().unwrap_or_else(|| Box::new(Task::bare()));
        t.reinit(alloc_task_id(), func, ret, shepherd);
        t.creator = Some(shepherd);
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(t)) }
    }

    /// Attach a stack to a bare task ("plush"), drawing from the calling
    /// shepherd's stack pool when there is one.
    pub(crate) fn plush_task(&self, t: NonNull<Task>) {
        let (pools, _) = self.local_pools();
        let mut stack = pools
            .stacks
            .take()
            .unwrap_or_else(|| TaskStack::new(self.stack_size));
        stack.paint_guards();
        // SAFETY: the caller owns the not-yet-scheduled task.
        unsafe {
            (*t.as_ptr()).stack = Some(stack);
        }
    }

    /// Mint a fully equipped task: record plus stack, both from the target
    /// shepherd's pools.
    pub(crate) fn new_task(
        &self,
        func: TaskFn,
        ret: *mut Aligned,
        shepherd: ShepherdId,
    ) -> NonNull<Task> {
        let t = self.alloc_task(Some(func), ret, shepherd);
        let pools = &self.shepherds[shepherd as usize].pools;
        let mut stack = pools
            .stacks
            .take()
            .unwrap_or_else(|| TaskStack::new(self.stack_size));
        stack.paint_guards();
        // SAFETY: the task is ours until enqueued.
        unsafe {
            (*t.as_ptr()).stack = Some(stack);
        }
        t
    }

    /// Retire a task record, returning the stack and the record to the
    /// pools of the shepherd that minted them.
    pub(crate) fn free_task(&self, t: NonNull<Task>) {
        // SAFETY: the caller owns the task (terminated, sentinel, or never
        // scheduled); nothing else references it.
        let mut task = unsafe { Box::from_raw(t.as_ptr()) };
        let creator = task.creator;
        if let Some(stack) = task.stack.take() {
            if !stack.guards_intact() {
                warn!("task {}: stack guard clobbered", task.id());
            }
            self.pools_for(creator).stacks.put(stack);
        }
        task.func = None;
        task.parker = None;
        self.pools_for(creator).tasks.put(task);
    }

    /// Mint an FEB status record with the given initial full bit.
    pub(crate) fn alloc_addrstat(&self, full: bool) -> NonNull<AddrStat> {
        let (pools, creator) = self.local_pools();
        let mut m = pools
            .addrstats
            .take()
            .unwrap_or_else(|| Box::new(AddrStat::bare()));
        // A pooled record's mutex is always free; only its payload resets.
        *m.lock.lock() = AddrStatInner::new(full);
        m.creator = creator;
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(m)) }
    }

    /// Retire an FEB status record.
    ///
    /// # Safety
    ///
    /// The record must have been removed from its stripe table while holding
    /// both the stripe write lock and the record mutex, so that no other
    /// reference can exist.
    pub(crate) unsafe fn free_addrstat(&self, m: NonNull<AddrStat>) {
        // SAFETY: per the function contract we are the sole owner.
        let rec = unsafe { Box::from_raw(m.as_ptr()) };
        let creator = rec.creator;
        self.pools_for(creator).addrstats.put(rec);
    }

    /// Mint a wait record for a blocking FEB operation.
    pub(crate) fn alloc_addrres(&self, operand: *mut Aligned) -> NonNull<AddrRes> {
        let (pools, creator) = self.local_pools();
        let mut res = pools
            .addrres
            .take()
            .unwrap_or_else(|| Box::new(AddrRes::bare()));
        res.addr = operand;
        res.waiter = None;
        res.next = None;
        res.creator = creator;
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(res)) }
    }

    /// Retire a wait record popped from a waiter list.
    pub(crate) fn free_addrres(&self, x: NonNull<AddrRes>) {
        // SAFETY: a popped wait record has exactly one owner: the popper.
        let res = unsafe { Box::from_raw(x.as_ptr()) };
        let creator = res.creator;
        self.pools_for(creator).addrres.put(res);
    }

    /// Mint an address-lock record.
    pub(crate) fn alloc_lock_record(&self) -> NonNull<LockRecord> {
        let (pools, creator) = self.local_pools();
        let mut rec = pools
            .locks
            .take()
            .unwrap_or_else(|| Box::new(LockRecord::bare()));
        rec.creator = creator;
        rec.lock.lock().owner = 0;
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(rec)) }
    }

    /// Retire an address-lock record.
    ///
    /// # Safety
    ///
    /// As [`Runtime::free_addrstat`]: removed from its stripe table under
    /// both locks, waiting queue empty.
    pub(crate) unsafe fn free_lock_record(&self, m: NonNull<LockRecord>) {
        // SAFETY: per the function contract we are the sole owner.
        let rec = unsafe { Box::from_raw(m.as_ptr()) };
        let creator = rec.creator;
        self.pools_for(creator).locks.put(rec);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Shepherds are gone; reclaim whatever the workload left behind.
        for m in self.febs.drain() {
            // SAFETY: teardown owns every record.
            let rec = unsafe { Box::from_raw(m.as_ptr()) };
            let mut inner = rec.lock.into_inner();
            for list in [&mut inner.efq, &mut inner.feq, &mut inner.ffq] {
                while let Some(x) = list.pop_front() {
                    // SAFETY: as above.
                    let res = unsafe { Box::from_raw(x.as_ptr()) };
                    if let Some(w) = res.waiter {
                        // SAFETY: an abandoned waiter is owned by its list;
                        // MCCOY proxies belong to their parked thread.
                        let flags = unsafe { (*w.as_ptr()).flags() };
                        if !flags.contains(TaskFlags::MCCOY) {
                            // SAFETY: as above.
                            drop(unsafe { Box::from_raw(w.as_ptr()) });
                        }
                    }
                }
            }
        }
        for m in self.locks.drain() {
            // SAFETY: teardown owns every record.
            let rec = unsafe { Box::from_raw(m.as_ptr()) };
            for t in rec.waiting.drain() {
                // SAFETY: as for FEB waiters above.
                let flags = unsafe { (*t.as_ptr()).flags() };
                if !flags.contains(TaskFlags::MCCOY) {
                    // SAFETY: as above.
                    drop(unsafe { Box::from_raw(t.as_ptr()) });
                }
            }
        }
        for shep in self.shepherds.iter() {
            for t in shep.ready.drain() {
                // SAFETY: nothing will ever dequeue these again.
                drop(unsafe { Box::from_raw(t.as_ptr()) });
            }
        }
    }
}

/// Initialize the runtime with `nshepherds` worker threads.
///
/// Fails with `BadArgs` for zero shepherds or when already initialized, and
/// with `PthreadError` when a worker cannot be spawned (the library is then
/// unusable; call [`finalize`]).
pub fn init(nshepherds: u32) -> Result<()> {
    if nshepherds == 0 {
        return Err(WeftError::BadArgs);
    }
    let rt = Box::new(Runtime {
        shepherds: (0..nshepherds).map(Shepherd::new).collect(),
        handles: StdMutex::new(Vec::with_capacity(nshepherds as usize)),
        stack_size: DEFAULT_STACK_SIZE,
        sched_shepherd: AtomicU32::new(0),
        febs: StripeSet::new(),
        locks: StripeSet::new(),
        io: IoQueue::new(),
        generic: RecordPools::new(),
    });
    let ptr = Box::into_raw(rt);
    if QLIB
        .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // SAFETY: never published; still exclusively ours.
        drop(unsafe { Box::from_raw(ptr) });
        error!("init: runtime already initialized");
        return Err(WeftError::BadArgs);
    }
    // SAFETY: just published; stays alive until finalize.
    let rt: &'static Runtime = unsafe { &*ptr };
    for i in 0..nshepherds {
        let shep: &'static Shepherd = &rt.shepherds[i as usize];
        let spawned = std::thread::Builder::new()
            .name(format!("weft-shepherd-{i}"))
            .spawn(move || shepherd_loop(rt, shep));
        match spawned {
            Ok(handle) => rt.handles.lock().unwrap().push(handle),
            Err(e) => {
                error!("init: spawning shepherd {i} failed: {e}");
                return Err(WeftError::PthreadError);
            }
        }
    }
    debug!("init: {nshepherds} shepherds running");
    Ok(())
}

/// Tear the runtime down: inject a termination sentinel per shepherd, let
/// each drain its remaining ready work, join the workers, free everything.
///
/// Tasks still blocked on FEB words or address locks never resume; their
/// records are reclaimed wholesale.
pub fn finalize() {
    if FINALIZING.swap(true, Ordering::AcqRel) {
        return;
    }
    let ptr = QLIB.load(Ordering::Acquire);
    // SAFETY: see runtime().
    let Some(rt) = (unsafe { ptr.as_ref() }) else {
        FINALIZING.store(false, Ordering::Release);
        return;
    };
    debug!("finalize: draining {} shepherds", rt.nshepherds());
    for shep in rt.shepherds.iter() {
        let t = rt.alloc_task(None, ptr::null_mut(), shep.id);
        // SAFETY: the sentinel is ours until enqueued.
        unsafe {
            (*t.as_ptr()).state = TaskState::TermShep;
        }
        shep.ready.enqueue(t);
    }
    let handles: Vec<_> = rt.handles.lock().unwrap().drain(..).collect();
    for handle in handles {
        if handle.join().is_err() {
            error!("finalize: a shepherd thread panicked");
        }
    }
    QLIB.store(ptr::null_mut(), Ordering::Release);
    // SAFETY: all shepherds have exited and the global no longer points
    // here; this is the last reference.
    drop(unsafe { Box::from_raw(ptr) });
    FINALIZING.store(false, Ordering::Release);
    debug!("finalize: done");
}

/// Compare-and-swap modulo increment: returns the previous value, storing
/// `(prev + 1) mod max`.
fn incr_mod(counter: &AtomicU32, max: u32) -> u32 {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(if v + 1 >= max { 0 } else { v + 1 })
        })
        .unwrap_or_else(|v| v)
}

/// Choose the shepherd for a new task: the per-shepherd counter when forking
/// from a task (single writer, no locks), the global atomic otherwise.
fn placement(rt: &Runtime) -> ShepherdId {
    match current_shepherd() {
        Some(s) => {
            let n = rt.nshepherds();
            let v = s.sched_shepherd.get();
            s.sched_shepherd.set(if v + 1 >= n { 0 } else { v + 1 });
            v
        }
        None => incr_mod(&rt.sched_shepherd, rt.nshepherds()),
    }
}

fn fork_inner(
    rt: &Runtime,
    func: TaskFn,
    ret: *mut Aligned,
    shepherd: ShepherdId,
    flags: TaskFlags,
) -> Result<()> {
    let t = rt.new_task(func, ret, shepherd);
    // SAFETY: the task is ours until enqueued.
    unsafe {
        (*t.as_ptr()).flags = flags;
    }
    if !ret.is_null() {
        // Empty the rendezvous word only now that the task exists; a failed
        // fork must leave the word untouched.
        // SAFETY: the fork caller's contract covers the result slot.
        if let Err(e) = unsafe { feb::empty(ret) } {
            rt.free_task(t);
            return Err(e);
        }
    }
    // SAFETY: reading our own just-built record.
    let id = unsafe { (*t.as_ptr()).id() };
    debug!("fork: task {id} -> shepherd {shepherd}");
    rt.shepherd(shepherd).ready.enqueue(t);
    Ok(())
}

/// Fork a task onto a round-robin-chosen shepherd.
///
/// When `ret` is non-null, the word it names is emptied now and filled with
/// the task's return value on completion, so `read_ff(ret)` rendezvouses
/// with the result.
///
/// # Safety
///
/// `ret` must be null or point to a live aligned word that outlives the
/// task.
pub unsafe fn fork<F>(f: F, ret: *mut Aligned) -> Result<()>
where
    F: FnOnce() -> Aligned + Send + 'static,
{
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let shep = placement(rt);
    fork_inner(rt, Box::new(f), ret, shep, TaskFlags::empty())
}

/// Fork a task onto a specific shepherd.
///
/// # Safety
///
/// As [`fork`].
pub unsafe fn fork_to<F>(f: F, ret: *mut Aligned, shepherd: ShepherdId) -> Result<()>
where
    F: FnOnce() -> Aligned + Send + 'static,
{
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    if shepherd >= rt.nshepherds() {
        return Err(WeftError::BadArgs);
    }
    fork_inner(rt, Box::new(f), ret, shepherd, TaskFlags::empty())
}

/// Fork a FUTURE-flagged task onto a specific shepherd. The registered
/// future-exit hook runs when it completes.
///
/// # Safety
///
/// As [`fork`].
pub unsafe fn fork_future_to<F>(f: F, ret: *mut Aligned, shepherd: ShepherdId) -> Result<()>
where
    F: FnOnce() -> Aligned + Send + 'static,
{
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    if shepherd >= rt.nshepherds() {
        return Err(WeftError::BadArgs);
    }
    fork_inner(rt, Box::new(f), ret, shepherd, TaskFlags::FUTURE)
}

/// Fork a task with no result slot. The safe entry point for the common
/// fire-and-forget case.
pub fn spawn<F>(f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: a null result slot is never dereferenced.
    unsafe {
        fork(
            move || {
                f();
                0
            },
            ptr::null_mut(),
        )
    }
}

/// A task created by [`prepare`] but not yet scheduled. Stack and context
/// are deferred until [`schedule`]/[`schedule_on`] commits it.
pub struct Prepared {
    t: Option<NonNull<Task>>,
}

// SAFETY: the prepared task is exclusively owned by this handle.
unsafe impl Send for Prepared {}

impl Drop for Prepared {
    fn drop(&mut self) {
        if let Some(t) = self.t.take() {
            match runtime() {
                Some(rt) => rt.free_task(t),
                // SAFETY: unscheduled and unpublished; plain box teardown.
                None => drop(unsafe { Box::from_raw(t.as_ptr()) }),
            }
        }
    }
}

/// Allocate a bare task bound to a round-robin-chosen shepherd, deferring
/// stack and context until it is scheduled.
///
/// # Safety
///
/// As [`fork`].
pub unsafe fn prepare<F>(f: F, ret: *mut Aligned) -> Result<Prepared>
where
    F: FnOnce() -> Aligned + Send + 'static,
{
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let shep = placement(rt);
    // SAFETY: forwarded caller contract.
    unsafe { prepare_for(f, ret, shep) }
}

/// Allocate a bare task bound to a specific shepherd.
///
/// # Safety
///
/// As [`fork`].
pub unsafe fn prepare_for<F>(f: F, ret: *mut Aligned, shepherd: ShepherdId) -> Result<Prepared>
where
    F: FnOnce() -> Aligned + Send + 'static,
{
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    if shepherd >= rt.nshepherds() {
        return Err(WeftError::BadArgs);
    }
    let t = rt.alloc_task(Some(Box::new(f)), ret, shepherd);
    if !ret.is_null() {
        // SAFETY: prepare caller's contract covers the result slot.
        if let Err(e) = unsafe { feb::empty(ret) } {
            rt.free_task(t);
            return Err(e);
        }
    }
    Ok(Prepared { t: Some(t) })
}

/// Equip a prepared task with a stack and enqueue it on the shepherd it was
/// bound to at prepare time.
pub fn schedule(mut p: Prepared) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    let t = p.t.take().ok_or(WeftError::BadArgs)?;
    rt.plush_task(t);
    // SAFETY: the task is ours until enqueued.
    let shep = unsafe { (*t.as_ptr()).shepherd() };
    rt.shepherd(shep).ready.enqueue(t);
    Ok(())
}

/// Re-bind a prepared task to `shepherd`, equip it, and enqueue it there.
pub fn schedule_on(mut p: Prepared, shepherd: ShepherdId) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    if shepherd >= rt.nshepherds() {
        return Err(WeftError::BadArgs);
    }
    let t = p.t.take().ok_or(WeftError::BadArgs)?;
    rt.plush_task(t);
    // SAFETY: the task is ours until enqueued; binding must change before
    // the target shepherd can observe it.
    unsafe {
        (*t.as_ptr()).shepherd = shepherd;
    }
    rt.shepherd(shepherd).ready.enqueue(t);
    Ok(())
}

/// Voluntarily hand the shepherd back to its ready queue. A no-op outside
/// task context.
pub fn yield_now() {
    if let Some(t) = shepherd::current_task_ptr() {
        // SAFETY: we *are* this task.
        let task = unsafe { &mut *t.as_ptr() };
        task.state = TaskState::Yielded;
        // SAFETY: task context; the shepherd re-queues us.
        unsafe { shepherd::back_to_master(task) };
    }
}

/// The currently executing task, if the caller is one.
pub fn current() -> Option<NonNull<Task>> {
    shepherd::current_task_ptr()
}

/// The calling shepherd's id, when invoked from a shepherd's thread (that
/// includes any task).
pub fn shep() -> Option<ShepherdId> {
    current_shepherd().map(|s| s.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_mod_wraps_and_returns_previous() {
        let c = AtomicU32::new(0);
        assert_eq!(incr_mod(&c, 3), 0);
        assert_eq!(incr_mod(&c, 3), 1);
        assert_eq!(incr_mod(&c, 3), 2);
        assert_eq!(incr_mod(&c, 3), 0);
    }
}
