//! Task records and task lifecycle state
//!
//! A task is a user-level cooperative thread: a record carrying the user
//! function, a dedicated guarded stack, the saved execution context, and the
//! bookkeeping the scheduler needs (state, flags, queue link, what the task
//! is blocked on). Tasks never migrate: the shepherd chosen at fork time
//! executes the task for its whole life.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;

use crate::arch::Context;
use crate::feb::AddrStat;
use crate::io::IoJob;
use crate::lock::LockRecord;

/// The native aligned machine word all FEB operations act on.
pub type Aligned = usize;

/// Monotonically assigned task id
pub type TaskId = u64;

/// Index of a shepherd in the process-wide shepherd sequence
pub type ShepherdId = u32;

/// Boxed user function; invoked exactly once by the task wrapper.
pub(crate) type TaskFn = Box<dyn FnOnce() -> Aligned + Send + 'static>;

bitflags! {
    /// Task flag bitset
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// Task was forked as a future; the wrapper invokes the registered
        /// future-exit hook when it completes.
        const FUTURE = 1 << 0;
        /// Proxy record standing in for a real OS thread blocked in a FEB or
        /// lock operation. Carries a parker instead of a stack and context;
        /// waking it unparks the thread instead of scheduling anything.
        const MCCOY = 1 << 1;
    }
}

/// Task state machine
///
/// New -> Running (shepherd exec); Running -> {Yielded, Blocked, FebBlocked,
/// Syscall, Terminated}; Yielded/Blocked/FebBlocked/Syscall -> Running on
/// requeue/wake; Terminated -> Done (terminal). TermShep is the finalize
/// sentinel that drains a shepherd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    New,
    Running,
    Yielded,
    Blocked,
    FebBlocked,
    Syscall,
    Terminated,
    Done,
    TermShep,
}

/// What a suspended task is blocked on; handed to the shepherd so it can
/// finish the hand-off (release the record mutex, enqueue the waiter or the
/// I/O job) after the task's context has been saved.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BlockedOn {
    Nothing,
    /// An address-lock record whose mutex the task still holds
    Lock(NonNull<LockRecord>),
    /// An FEB record whose mutex the task still holds
    Feb(NonNull<AddrStat>),
    /// A blocking-syscall job to push onto the I/O queue
    Job(NonNull<IoJob>),
}

/// Task record
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    pub(crate) flags: TaskFlags,
    /// User function; taken by the wrapper on first execution
    pub(crate) func: Option<TaskFn>,
    /// Optional result slot; its FEB word is the rendezvous with waiters
    pub(crate) ret: *mut Aligned,
    /// The shepherd that executes this task
    pub(crate) shepherd: ShepherdId,
    /// The shepherd whose pools minted this record (`None` = generic pools)
    pub(crate) creator: Option<ShepherdId>,
    pub(crate) blocked_on: BlockedOn,
    pub(crate) stack: Option<TaskStack>,
    /// Saved execution context of the task itself
    pub(crate) context: Context,
    /// The shepherd context to resume when the task suspends
    pub(crate) return_context: *mut Context,
    /// Parker for MCCOY proxies
    pub(crate) parker: Option<Arc<Parker>>,
    /// Intrusive single link; owned by whichever queue the task sits on
    pub(crate) next: Option<NonNull<Task>>,
}

// SAFETY: a task is owned by exactly one party at a time (a queue, a waiter
// list, or the shepherd executing it); the raw pointers it carries reference
// runtime-global records whose access is mediated by their own mutexes.
unsafe impl Send for Task {}

impl Task {
    /// Fresh bare record, no stack or context yet.
    pub(crate) fn bare() -> Self {
        Self {
            id: 0,
            state: TaskState::New,
            flags: TaskFlags::empty(),
            func: None,
            ret: std::ptr::null_mut(),
            shepherd: 0,
            creator: None,
            blocked_on: BlockedOn::Nothing,
            stack: None,
            context: Context::new(),
            return_context: std::ptr::null_mut(),
            parker: None,
            next: None,
        }
    }

    /// Reset a pooled record for reuse as a bare task.
    pub(crate) fn reinit(
        &mut self,
        id: TaskId,
        func: Option<TaskFn>,
        ret: *mut Aligned,
        shepherd: ShepherdId,
    ) {
        self.id = id;
        self.state = TaskState::New;
        self.flags = TaskFlags::empty();
        self.func = func;
        self.ret = ret;
        self.shepherd = shepherd;
        self.blocked_on = BlockedOn::Nothing;
        self.return_context = std::ptr::null_mut();
        self.parker = None;
        self.next = None;
        // creator and any pooled stack are left as the pool set them
    }

    /// Proxy record for an OS thread about to block in a FEB or lock
    /// operation from outside any task.
    pub(crate) fn mccoy(parker: Arc<Parker>) -> Box<Self> {
        let mut t = Box::new(Self::bare());
        t.id = alloc_task_id();
        t.state = TaskState::Blocked;
        t.flags = TaskFlags::MCCOY;
        t.parker = Some(parker);
        t
    }

    /// Monotonically assigned task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The shepherd this task runs on.
    pub fn shepherd(&self) -> ShepherdId {
        self.shepherd
    }

    /// Flag bitset (future / mccoy).
    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    /// Bytes of stack remaining below the current stack pointer.
    ///
    /// Only meaningful when called by the task itself; for any other task
    /// (or a stackless record) this returns 0.
    pub fn stack_left(&self) -> usize {
        let marker = 0u8;
        let here = core::ptr::addr_of!(marker) as usize;
        match &self.stack {
            Some(stack) => {
                let (base, len) = stack.usable();
                let base = base as usize;
                if here >= base && here < base + len {
                    here - base
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

/// Task id mint
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new task id.
pub(crate) fn alloc_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Guard pad at each end of a task stack. The advertised usable size is the
/// allocation size minus both pads.
pub(crate) const STACK_GUARD: usize = 64;

const GUARD_PATTERN: u8 = 0xa5;

/// A task stack with a painted guard band at each end.
pub struct TaskStack {
    buf: Box<[u8]>,
}

impl TaskStack {
    pub(crate) fn new(size: usize) -> Self {
        let mut stack = Self {
            buf: vec![0u8; size].into_boxed_slice(),
        };
        stack.paint_guards();
        stack
    }

    /// Repaint the guard bands (when handing a pooled stack to a new task).
    pub(crate) fn paint_guards(&mut self) {
        let len = self.buf.len();
        self.buf[..STACK_GUARD].fill(GUARD_PATTERN);
        self.buf[len - STACK_GUARD..].fill(GUARD_PATTERN);
    }

    /// Usable region: base pointer and length with the guards carved off.
    pub(crate) fn usable(&self) -> (*mut u8, usize) {
        let base = self.buf.as_ptr() as *mut u8;
        // SAFETY: STACK_GUARD is far smaller than any stack allocation.
        let usable = unsafe { base.add(STACK_GUARD) };
        (usable, self.buf.len() - 2 * STACK_GUARD)
    }

    /// Whether both guard bands still hold their pattern.
    pub(crate) fn guards_intact(&self) -> bool {
        let len = self.buf.len();
        self.buf[..STACK_GUARD].iter().all(|&b| b == GUARD_PATTERN)
            && self.buf[len - STACK_GUARD..]
                .iter()
                .all(|&b| b == GUARD_PATTERN)
    }
}

/// One-shot parker for MCCOY proxies: the blocked OS thread waits here until
/// a waker hands it the result (or the lock).
pub struct Parker {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Block the calling OS thread until [`Parker::unpark`].
    pub(crate) fn park(&self) {
        let mut woken = self.woken.lock().unwrap();
        while !*woken {
            woken = self.cv.wait(woken).unwrap();
        }
    }

    /// Release a parked thread. Safe to call before `park`.
    pub(crate) fn unpark(&self) {
        let mut woken = self.woken.lock().unwrap();
        *woken = true;
        self.cv.notify_one();
    }
}
