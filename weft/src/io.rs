//! Blocking-syscall hand-off
//!
//! The runtime side of the syscall-wrapper contract. A wrapped syscall
//! invoked from a task fills in an [`IoJob`], submits it, and suspends; an
//! external I/O worker pool pulls jobs off the queue, performs the real
//! syscall, and completes the job, which re-queues the task on its shepherd.
//! The wrappers themselves (and the worker pool) are external collaborators;
//! this module only carries the rendezvous.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use crate::error::{Result, WeftError};
use crate::runtime::runtime;
use crate::shepherd::{self, wake_task};
use crate::task::{BlockedOn, Task, TaskState};

/// One pending blocking syscall.
pub struct IoJob {
    /// Operation selector, meaningful only to the external wrapper layer
    pub op: usize,
    /// Raw argument words
    pub args: [usize; 6],
    /// Result of the real syscall, valid once the job completes
    pub ret: isize,
    pub(crate) task: Option<NonNull<Task>>,
    pub(crate) next: Option<NonNull<IoJob>>,
}

// SAFETY: a job is owned by its submitting task until published, then by the
// job queue, then by the worker that dequeued it.
unsafe impl Send for IoJob {}

impl IoJob {
    pub fn new(op: usize, args: [usize; 6]) -> Self {
        Self {
            op,
            args,
            ret: 0,
            task: None,
            next: None,
        }
    }
}

struct JobList {
    head: Option<NonNull<IoJob>>,
    tail: Option<NonNull<IoJob>>,
}

/// FIFO of pending jobs, blocking on the consumer side.
pub(crate) struct IoQueue {
    inner: Mutex<JobList>,
    notempty: Condvar,
}

// SAFETY: all link manipulation happens under the internal mutex.
unsafe impl Send for IoQueue {}
// SAFETY: as above.
unsafe impl Sync for IoQueue {}

impl IoQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(JobList {
                head: None,
                tail: None,
            }),
            notempty: Condvar::new(),
        }
    }

    pub(crate) fn enqueue(&self, job: NonNull<IoJob>) {
        let mut list = self.inner.lock().unwrap();
        // SAFETY: ownership of the job transfers to the queue here.
        unsafe {
            (*job.as_ptr()).next = None;
        }
        match list.tail {
            None => {
                list.head = Some(job);
                list.tail = Some(job);
            }
            Some(tail) => {
                // SAFETY: the tail job is owned by this queue.
                unsafe {
                    (*tail.as_ptr()).next = Some(job);
                }
                list.tail = Some(job);
            }
        }
        // unlike a ready queue, this queue may have several consumers, so
        // every enqueue signals
        self.notempty.notify_one();
    }

    pub(crate) fn try_dequeue(&self) -> Option<NonNull<IoJob>> {
        let mut list = self.inner.lock().unwrap();
        Self::pop(&mut list)
    }

    pub(crate) fn dequeue(&self) -> NonNull<IoJob> {
        let mut list = self.inner.lock().unwrap();
        loop {
            if let Some(job) = Self::pop(&mut list) {
                return job;
            }
            list = self.notempty.wait(list).unwrap();
        }
    }

    fn pop(list: &mut JobList) -> Option<NonNull<IoJob>> {
        let job = list.head?;
        // SAFETY: the head job is owned by this queue.
        unsafe {
            list.head = (*job.as_ptr()).next;
            (*job.as_ptr()).next = None;
        }
        if list.head.is_none() {
            list.tail = None;
        }
        Some(job)
    }
}

/// Submit a blocking syscall job and suspend the calling task until an I/O
/// worker completes it. Returns the syscall result.
///
/// Callers that are not tasks get [`WeftError::BadArgs`]; the wrapper layer
/// is expected to forward straight to the raw syscall in that case.
///
/// # Safety
///
/// `job` must stay alive and unmoved until this function returns (it is
/// linked into the job queue by address).
pub unsafe fn submit(job: &mut IoJob) -> Result<isize> {
    runtime().ok_or(WeftError::BadArgs)?;
    let Some(t) = shepherd::current_task_ptr() else {
        return Err(WeftError::BadArgs);
    };
    // SAFETY: we *are* this task.
    let task = unsafe { &mut *t.as_ptr() };
    job.task = Some(t);
    task.state = TaskState::Syscall;
    task.blocked_on = BlockedOn::Job(NonNull::from(&mut *job));
    // The shepherd publishes the job once our context is saved; an I/O
    // worker may complete it (and re-queue us) the instant it is visible.
    // SAFETY: task context; resumes when the job has completed.
    unsafe { shepherd::back_to_master(task) };
    Ok(job.ret)
}

/// Dequeue the next pending job, if any. For the external I/O worker pool.
pub fn take_job() -> Option<NonNull<IoJob>> {
    runtime().and_then(|rt| rt.io.try_dequeue())
}

/// Block until a job is pending and dequeue it. For the external I/O worker
/// pool; workers must stop calling this before the runtime is finalized.
pub fn wait_job() -> Option<NonNull<IoJob>> {
    runtime().map(|rt| rt.io.dequeue())
}

/// Mark a job complete with the real syscall's result and re-queue the
/// submitting task on its shepherd. For the external I/O worker pool.
///
/// # Safety
///
/// `job` must have been obtained from [`take_job`] and not yet completed.
pub unsafe fn complete(job: NonNull<IoJob>, ret: isize) -> Result<()> {
    let rt = runtime().ok_or(WeftError::BadArgs)?;
    // SAFETY: the worker owns a dequeued job.
    let j = unsafe { &mut *job.as_ptr() };
    j.ret = ret;
    if let Some(t) = j.task.take() {
        // SAFETY: the submitting task is parked until this wake; after it
        // resumes, `job` belongs to it again.
        unsafe { wake_task(rt, t) };
    }
    Ok(())
}
