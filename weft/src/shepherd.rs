//! Shepherds: the OS worker threads that execute tasks
//!
//! Each shepherd runs one loop: block on its ready queue, switch into the
//! dequeued task, and dispatch on the state the task came back in. The
//! dispatch step is where suspended critical sections are finished on the
//! task's behalf: a task that blocked in a FEB or lock operation still holds
//! the record mutex when it switches out, and only the shepherd — once the
//! task's context is safely saved — releases it. That closes the window in
//! which a waker could resume the task before it finished suspending.

use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use log::{debug, error};

use crate::arch::{self, Context};
use crate::feb;
use crate::pool::RecordPools;
use crate::queue::TaskQueue;
use crate::runtime::Runtime;
use crate::task::{BlockedOn, ShepherdId, Task, TaskFlags, TaskId, TaskState};

/// Worker identity and per-worker state.
pub(crate) struct Shepherd {
    pub(crate) id: ShepherdId,
    /// Runnable tasks bound to this shepherd, FIFO
    pub(crate) ready: TaskQueue,
    /// The task currently executing here (own thread only)
    current: Cell<*mut Task>,
    /// Round-robin placement counter; single writer (fork from a task
    /// running on this shepherd), so no atomicity is needed
    pub(crate) sched_shepherd: Cell<u32>,
    /// Pools for the records this shepherd mints
    pub(crate) pools: RecordPools,
}

// SAFETY: `current` and `sched_shepherd` are only touched from the
// shepherd's own OS thread (the loop below registers itself in TLS and the
// fast placement path goes through that registration); every other field is
// synchronized internally.
unsafe impl Sync for Shepherd {}
// SAFETY: the raw `current` pointer is only dereferenced by the owning
// thread; moving the record between threads at init/teardown is harmless.
unsafe impl Send for Shepherd {}

impl Shepherd {
    pub(crate) fn new(id: ShepherdId) -> Self {
        Self {
            id,
            ready: TaskQueue::new(),
            current: Cell::new(ptr::null_mut()),
            sched_shepherd: Cell::new(0),
            pools: RecordPools::new(),
        }
    }
}

thread_local! {
    static CURRENT_SHEPHERD: Cell<*const Shepherd> = const { Cell::new(ptr::null()) };
}

/// The shepherd whose OS thread we are on, if any.
pub(crate) fn current_shepherd() -> Option<&'static Shepherd> {
    let p = CURRENT_SHEPHERD.with(|c| c.get());
    // SAFETY: the pointer is set only by shepherd_loop with a reference into
    // the leaked runtime, and cleared before the loop exits; the runtime is
    // freed only after every shepherd thread has been joined.
    unsafe { p.as_ref() }
}

/// The task currently executing on this OS thread, if any.
pub(crate) fn current_task_ptr() -> Option<NonNull<Task>> {
    current_shepherd().and_then(|s| NonNull::new(s.current.get()))
}

/// Id of the current task, or 0 when not called from a task.
pub(crate) fn current_task_id() -> TaskId {
    // SAFETY: we *are* that task; reading our own id is always fine.
    current_task_ptr().map_or(0, |t| unsafe { (*t.as_ptr()).id() })
}

/// Suspend the current task and resume its shepherd's loop context.
///
/// # Safety
///
/// Must be called from the task itself, with `return_context` pointing at
/// the live shepherd context that entered it.
pub(crate) unsafe fn back_to_master(task: &mut Task) {
    // SAFETY: exec() set return_context before switching into the task, and
    // the shepherd context lives on the shepherd's own OS stack.
    unsafe { arch::switch(&mut task.context, task.return_context) }
}

/// Wake a parked waiter: re-queue a task on its own shepherd, or unpark the
/// OS thread behind a MCCOY proxy.
///
/// # Safety
///
/// The caller must own `t` (just dequeued from a waiter list) and hold the
/// record mutex that orders the wake against the suspension.
pub(crate) unsafe fn wake_task(rt: &Runtime, t: NonNull<Task>) {
    // SAFETY: per the function contract we are the sole owner right now.
    let task = unsafe { &mut *t.as_ptr() };
    task.state = TaskState::Running;
    if task.flags.contains(TaskFlags::MCCOY) {
        let parker = task.parker.clone();
        // The proxy may be freed the moment unpark returns; the clone keeps
        // the parker itself alive and nothing may touch the task after this.
        if let Some(p) = parker {
            p.unpark();
        }
    } else {
        rt.shepherd(task.shepherd).ready.enqueue(t);
    }
}

/// Entry point of every task context: run the user function, publish the
/// result, and hand control back to the shepherd for good.
extern "C" fn task_wrapper(arg: *mut c_void) -> ! {
    let t = arg as *mut Task;
    // SAFETY: the shepherd that switched into us holds no other reference
    // for the duration of our run.
    let task = unsafe { &mut *t };
    debug!("task {}: executing", task.id());
    let value = match task.func.take() {
        Some(f) => match catch_unwind(AssertUnwindSafe(f)) {
            Ok(v) => v,
            Err(_) => {
                error!("task {}: panicked, completing with 0", task.id());
                0
            }
        },
        None => 0,
    };
    if !task.ret.is_null() {
        // SAFETY: the fork contract keeps the result slot alive until the
        // task completes; write_f never blocks.
        if let Err(e) = unsafe { feb::write_f_const(task.ret, value) } {
            error!("task {}: could not publish result: {e}", task.id());
        }
    }
    task.state = TaskState::Terminated;
    if task.flags.contains(TaskFlags::FUTURE) {
        crate::future::run_exit_hook(task);
    }
    debug!("task {}: completed", task.id());
    // No native return-on-exit link in the portable switch: go back by hand.
    // SAFETY: the shepherd context that entered us is still parked in exec.
    unsafe { back_to_master(task) };
    unreachable!("terminated task was resumed")
}

/// Run task `t` until it suspends or terminates. `here` is the shepherd
/// context the task will switch back into.
fn exec(t: NonNull<Task>, here: &mut Context) {
    // SAFETY: the shepherd loop owns the dequeued task.
    let task = unsafe { &mut *t.as_ptr() };
    if task.state == TaskState::New {
        task.state = TaskState::Running;
        let (base, len) = task
            .stack
            .as_ref()
            .expect("scheduled task has no stack")
            .usable();
        // SAFETY: the stack region belongs to this task alone and the task
        // record outlives its own execution.
        unsafe {
            arch::prepare(
                &mut task.context,
                base,
                len,
                task_wrapper,
                t.as_ptr() as *mut c_void,
            );
        }
    }
    task.return_context = here as *mut Context;
    // SAFETY: `here` is this frame's live context slot and task.context was
    // captured by a previous switch or prepared above.
    unsafe { arch::switch(here, &task.context) }
}

/// The workhorse loop.
pub(crate) fn shepherd_loop(rt: &'static Runtime, shep: &'static Shepherd) {
    CURRENT_SHEPHERD.with(|c| c.set(shep as *const Shepherd));
    debug!("shepherd {}: running", shep.id);
    let mut here = Context::new();
    loop {
        let t = shep.ready.dequeue();
        // SAFETY: a dequeued task is exclusively ours.
        let task = unsafe { &mut *t.as_ptr() };
        debug!(
            "shepherd {}: dequeued task {} (state {:?})",
            shep.id,
            task.id(),
            task.state
        );
        if task.state == TaskState::TermShep {
            rt.free_task(t);
            break;
        }
        debug_assert!(matches!(task.state, TaskState::New | TaskState::Running));
        debug_assert_eq!(task.shepherd, shep.id);
        shep.current.set(t.as_ptr());
        exec(t, &mut here);
        shep.current.set(ptr::null_mut());
        match task.state {
            TaskState::Yielded => {
                task.state = TaskState::Running;
                shep.ready.enqueue(t);
            }
            TaskState::FebBlocked => {
                task.state = TaskState::Blocked;
                match task.blocked_on {
                    BlockedOn::Feb(m) => {
                        // SAFETY: the task acquired this mutex before
                        // suspending and handed it to us; its context is
                        // saved, so wakers may now run.
                        unsafe { (*m.as_ptr()).lock.force_unlock() };
                    }
                    _ => error!(
                        "shepherd {}: FEB-blocked task {} lost its record",
                        shep.id,
                        task.id()
                    ),
                }
            }
            TaskState::Blocked => match task.blocked_on {
                BlockedOn::Lock(m) => {
                    // SAFETY: the record stays alive while its mutex is
                    // held, and the task handed that mutex to us.
                    let rec = unsafe { &*m.as_ptr() };
                    rec.waiting.enqueue(t);
                    // SAFETY: as for the FEB case above.
                    unsafe { rec.lock.force_unlock() };
                }
                _ => error!(
                    "shepherd {}: blocked task {} lost its record",
                    shep.id,
                    task.id()
                ),
            },
            TaskState::Syscall => match task.blocked_on {
                BlockedOn::Job(job) => {
                    // Publish the job only now: the I/O pool may complete it
                    // and re-queue the task the instant it is visible.
                    rt.io.enqueue(job);
                }
                _ => error!(
                    "shepherd {}: syscall task {} lost its job",
                    shep.id,
                    task.id()
                ),
            },
            TaskState::Terminated => {
                task.state = TaskState::Done;
                rt.free_task(t);
            }
            other => error!(
                "shepherd {}: task {} returned in unexpected state {:?}",
                shep.id,
                task.id(),
                other
            ),
        }
    }
    CURRENT_SHEPHERD.with(|c| c.set(ptr::null()));
    debug!("shepherd {}: finished", shep.id);
}
