//! Intrusive task FIFO with blocking dequeue
//!
//! Tasks link through their own `next` field, so the queue allocates
//! nothing. A mutex guards head/tail and a condition variable carries the
//! not-empty signal; the blocking dequeue is what idles a shepherd between
//! tasks. While a task is linked here the queue owns it outright.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use crate::task::Task;

struct TaskList {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
}

impl TaskList {
    fn pop(&mut self) -> Option<NonNull<Task>> {
        let t = self.head?;
        // SAFETY: tasks linked into this list are owned by it; nobody else
        // touches `next` until the task is popped.
        unsafe {
            self.head = (*t.as_ptr()).next;
            (*t.as_ptr()).next = None;
        }
        if self.head.is_none() {
            self.tail = None;
        }
        Some(t)
    }
}

/// FIFO queue of runnable (or waiting) tasks.
pub(crate) struct TaskQueue {
    inner: Mutex<TaskList>,
    notempty: Condvar,
}

// SAFETY: the queue is the sole owner of every linked task; all head/tail
// and link manipulation happens under the internal mutex.
unsafe impl Send for TaskQueue {}
// SAFETY: as above.
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TaskList {
                head: None,
                tail: None,
            }),
            notempty: Condvar::new(),
        }
    }

    /// Append a task. Signals a blocked dequeuer when the queue was empty.
    pub(crate) fn enqueue(&self, t: NonNull<Task>) {
        let mut list = self.inner.lock().unwrap();
        // SAFETY: ownership of `t` transfers to the queue right here; no
        // other party holds a link to it.
        unsafe {
            (*t.as_ptr()).next = None;
        }
        match list.tail {
            None => {
                list.head = Some(t);
                list.tail = Some(t);
                self.notempty.notify_one();
            }
            Some(tail) => {
                // SAFETY: the tail task is owned by this queue.
                unsafe {
                    (*tail.as_ptr()).next = Some(t);
                }
                list.tail = Some(t);
            }
        }
    }

    /// Remove and return the head task, blocking until one is available.
    pub(crate) fn dequeue(&self) -> NonNull<Task> {
        let mut list = self.inner.lock().unwrap();
        loop {
            if let Some(t) = list.pop() {
                return t;
            }
            list = self.notempty.wait(list).unwrap();
        }
    }

    /// Remove and return the head task if there is one.
    pub(crate) fn dequeue_nonblocking(&self) -> Option<NonNull<Task>> {
        self.inner.lock().unwrap().pop()
    }

    /// Drain every queued task (teardown only).
    pub(crate) fn drain(&self) -> Vec<NonNull<Task>> {
        let mut list = self.inner.lock().unwrap();
        let mut out = Vec::new();
        while let Some(t) = list.pop() {
            out.push(t);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_task() -> NonNull<Task> {
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Task::bare()))) }
    }

    fn free_task(t: NonNull<Task>) {
        // SAFETY: `t` came from Box::into_raw above and left every queue.
        drop(unsafe { Box::from_raw(t.as_ptr()) });
    }

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        let (a, b, c) = (raw_task(), raw_task(), raw_task());
        q.enqueue(a);
        q.enqueue(b);
        q.enqueue(c);
        assert_eq!(q.dequeue_nonblocking(), Some(a));
        assert_eq!(q.dequeue_nonblocking(), Some(b));
        assert_eq!(q.dequeue(), c);
        assert_eq!(q.dequeue_nonblocking(), None);
        for t in [a, b, c] {
            free_task(t);
        }
    }

    #[test]
    fn blocking_dequeue_wakes_on_enqueue() {
        use std::sync::Arc;
        let q = Arc::new(TaskQueue::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.dequeue().as_ptr() as usize);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let t = raw_task();
        q.enqueue(t);
        assert_eq!(handle.join().unwrap(), t.as_ptr() as usize);
        free_task(t);
    }
}
