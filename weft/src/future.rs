//! Future-flag helpers
//!
//! Futures themselves live in an external module; the runtime only tracks
//! the flag and invokes the registered exit hook when a future-flagged task
//! completes (that is how the external module learns a future slot freed up).

use spin::RwLock;

use crate::task::{Task, TaskFlags};

/// Callback invoked by the task wrapper when a FUTURE-flagged task finishes.
pub type FutureExitHook = fn(&Task);

static EXIT_HOOK: RwLock<Option<FutureExitHook>> = RwLock::new(None);

/// Register (or clear) the future-exit hook.
pub fn set_future_exit_hook(hook: Option<FutureExitHook>) {
    *EXIT_HOOK.write() = hook;
}

pub(crate) fn run_exit_hook(t: &Task) {
    if let Some(hook) = *EXIT_HOOK.read() {
        hook(t);
    }
}

/// Whether the task carries the FUTURE flag.
pub fn is_future(t: &Task) -> bool {
    t.flags.contains(TaskFlags::FUTURE)
}

/// Set the FUTURE flag on a task.
pub fn assert_future(t: &mut Task) {
    t.flags.insert(TaskFlags::FUTURE);
}

/// Clear the FUTURE flag on a task.
pub fn assert_not_future(t: &mut Task) {
    t.flags.remove(TaskFlags::FUTURE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_roundtrip() {
        let mut t = Task::bare();
        assert!(!is_future(&t));
        assert_future(&mut t);
        assert!(is_future(&t));
        assert_not_future(&mut t);
        assert!(!is_future(&t));
    }
}
