//! Runtime lifecycle, placement, deferred scheduling, and the blocking
//! syscall hand-off.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::Aligned;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn init_rejects_zero_and_double_initialization() {
    let _g = serial();
    assert_eq!(weft::init(0), Err(weft::WeftError::BadArgs));
    weft::init(1).unwrap();
    assert_eq!(weft::init(1), Err(weft::WeftError::BadArgs));
    weft::finalize();
    // after finalize a fresh init works again
    weft::init(1).unwrap();
    weft::finalize();
}

#[test]
fn spawn_and_yield_run_to_completion() {
    let _g = serial();
    weft::init(2).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let mut done = [0 as Aligned; 20];
    for slot in done.iter_mut() {
        let count = Arc::clone(&count);
        // SAFETY: each slot outlives its task.
        unsafe {
            weft::fork(
                move || {
                    weft::yield_now();
                    count.fetch_add(1, Ordering::SeqCst);
                    1
                },
                slot,
            )
            .unwrap();
        }
    }
    for slot in &done {
        let mut out: Aligned = 0;
        // SAFETY: rendezvous with each task's result word.
        unsafe { weft::read_ff(&mut out, slot).unwrap() };
        assert_eq!(out, 1);
    }
    assert_eq!(count.load(Ordering::SeqCst), 20);
    weft::finalize();

    // fire-and-forget spawns complete before finalize returns when nothing
    // re-queues behind the sentinel
    weft::init(1).unwrap();
    let flag = Arc::new(AtomicUsize::new(0));
    let flag2 = Arc::clone(&flag);
    weft::spawn(move || {
        flag2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    weft::finalize();
    assert_eq!(flag.load(Ordering::SeqCst), 1);
}

#[test]
fn fork_to_validates_shepherd_id() {
    let _g = serial();
    weft::init(2).unwrap();
    // SAFETY: null result slot.
    let err = unsafe { weft::fork_to(|| 0, ptr::null_mut(), 7) };
    assert_eq!(err, Err(weft::WeftError::BadArgs));
    weft::finalize();
}

#[test]
fn ops_on_uninitialized_runtime_report_bad_args() {
    let _g = serial();
    let mut word: Aligned = 0;
    // SAFETY: local word; the runtime is down, so nothing blocks.
    unsafe {
        assert_eq!(weft::empty(&word), Err(weft::WeftError::BadArgs));
        assert_eq!(weft::write_f(&mut word, &0), Err(weft::WeftError::BadArgs));
    }
    assert_eq!(weft::lock(0x10), Err(weft::WeftError::BadArgs));
    assert_eq!(weft::spawn(|| ()), Err(weft::WeftError::BadArgs));
}

#[test]
fn prepared_tasks_bind_late_to_a_shepherd() {
    let _g = serial();
    weft::init(2).unwrap();

    let mut out: Aligned = 0;
    // SAFETY: `out` outlives the scheduled task.
    unsafe {
        let p = weft::prepare_for(|| weft::shep().unwrap() as Aligned + 10, &mut out, 0).unwrap();
        // re-bind to shepherd 1 at schedule time
        weft::schedule_on(p, 1).unwrap();
        let mut got: Aligned = 0;
        weft::read_ff(&mut got, &out).unwrap();
        assert_eq!(got, 11);
    }

    // a prepared task that is dropped unscheduled leaks nothing
    // SAFETY: result slot is null.
    let abandoned = unsafe { weft::prepare(|| 0, ptr::null_mut()).unwrap() };
    drop(abandoned);

    weft::finalize();
}

#[test]
fn tasks_report_identity_and_stack_headroom() {
    let _g = serial();
    weft::init(1).unwrap();

    let mut out: Aligned = 0;
    // SAFETY: `out` outlives the task.
    unsafe {
        weft::fork(
            || {
                let me = weft::current().expect("running inside a task");
                // SAFETY: we are this task.
                let me = unsafe { me.as_ref() };
                assert!(me.id() > 0);
                assert_eq!(me.shepherd(), 0);
                me.stack_left() as Aligned
            },
            &mut out,
        )
        .unwrap();
        let mut left: Aligned = 0;
        weft::read_ff(&mut left, &out).unwrap();
        assert!(left > 0, "a running task has stack headroom");
    }

    // outside any task there is no current task and no shepherd
    assert!(weft::current().is_none());
    assert!(weft::shep().is_none());

    weft::finalize();
}

#[test]
fn future_exit_hook_fires_for_future_tasks() {
    let _g = serial();
    weft::init(1).unwrap();

    static FUTURES_RETIRED: AtomicUsize = AtomicUsize::new(0);
    fn on_future_exit(t: &weft::Task) {
        assert!(weft::is_future(t));
        FUTURES_RETIRED.fetch_add(1, Ordering::SeqCst);
    }
    FUTURES_RETIRED.store(0, Ordering::SeqCst);
    weft::set_future_exit_hook(Some(on_future_exit));

    let mut out: Aligned = 0;
    // SAFETY: `out` outlives the task.
    unsafe {
        weft::fork_future_to(|| 5, &mut out, 0).unwrap();
        let mut got: Aligned = 0;
        weft::read_ff(&mut got, &out).unwrap();
        assert_eq!(got, 5);
    }
    assert_eq!(FUTURES_RETIRED.load(Ordering::SeqCst), 1);
    weft::set_future_exit_hook(None);

    weft::finalize();
}

#[test]
fn blocking_syscall_jobs_roundtrip_through_workers() {
    let _g = serial();
    weft::init(2).unwrap();

    // a minimal external I/O worker: add the first two argument words
    let worker = std::thread::spawn(|| {
        for _ in 0..500 {
            if let Some(job) = weft::io::take_job() {
                // SAFETY: a dequeued job is the worker's until completed.
                let (a, b) = unsafe { ((*job.as_ptr()).args[0], (*job.as_ptr()).args[1]) };
                // SAFETY: as above.
                unsafe { weft::io::complete(job, (a + b) as isize).unwrap() };
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    });

    let mut out: Aligned = 0;
    // SAFETY: `out` outlives the task.
    unsafe {
        weft::fork(
            || {
                let mut job = weft::io::IoJob::new(1, [20, 22, 0, 0, 0, 0]);
                // SAFETY: the job lives in this suspended frame until the
                // submit returns.
                let ret = unsafe { weft::io::submit(&mut job).unwrap() };
                ret as Aligned
            },
            &mut out,
        )
        .unwrap();
        let mut got: Aligned = 0;
        weft::read_ff(&mut got, &out).unwrap();
        assert_eq!(got, 42);
    }
    assert!(worker.join().unwrap(), "worker saw the job");

    // submitting from a plain thread is refused
    let mut job = weft::io::IoJob::new(1, [0; 6]);
    // SAFETY: refused before anything is linked.
    let err = unsafe { weft::io::submit(&mut job) };
    assert_eq!(err, Err(weft::WeftError::BadArgs));

    weft::finalize();
}
