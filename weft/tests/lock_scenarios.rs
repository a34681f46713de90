//! End-to-end address-lock scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::Aligned;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn lock_unlock_roundtrip_and_redundant_unlock() {
    let _g = serial();
    weft::init(1).unwrap();

    let addr = 0x1000usize;
    weft::lock(addr).unwrap();
    weft::unlock(addr).unwrap();
    // second unlock is redundant, not a failure
    assert_eq!(weft::unlock(addr), Err(weft::WeftError::Redundant));

    weft::finalize();
}

#[test]
fn wake_order_is_fifo() {
    let _g = serial();
    weft::init(2).unwrap();

    let addr = 0x2000usize;
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    // main (not a task) holds the lock while A, B, C pile up behind it
    weft::lock(addr).unwrap();

    let mut done = [0 as Aligned; 3];
    for (tag, slot) in done.iter_mut().enumerate() {
        let order = Arc::clone(&order);
        // SAFETY: each slot outlives its task (we rendezvous below).
        unsafe {
            weft::fork_to(
                move || {
                    weft::lock(addr).unwrap();
                    order.lock().unwrap().push(tag as u32);
                    weft::unlock(addr).unwrap();
                    1
                },
                slot,
                0,
            )
            .unwrap();
        }
    }

    // all three are parked on the same shepherd in arrival order
    std::thread::sleep(Duration::from_millis(100));
    weft::unlock(addr).unwrap();

    for slot in &done {
        let mut out: Aligned = 0;
        // SAFETY: reading the rendezvous words written by the tasks.
        unsafe { weft::read_ff(&mut out, slot).unwrap() };
        assert_eq!(out, 1);
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    weft::finalize();
}

#[test]
fn dining_philosophers_all_eat() {
    let _g = serial();
    weft::init(3).unwrap();

    const PHILOSOPHERS: usize = 5;
    const MEALS: usize = 25;
    let fork_addr = |i: usize| 0x9000usize + 8 * (i % PHILOSOPHERS);

    let mut eaten = [0 as Aligned; PHILOSOPHERS];
    for (i, slot) in eaten.iter_mut().enumerate() {
        // SAFETY: each slot outlives its task.
        unsafe {
            weft::fork(
                move || {
                    let left = fork_addr(i);
                    let right = fork_addr(i + 1);
                    // resource ordering: lower address first
                    let (first, second) = (left.min(right), left.max(right));
                    let mut meals = 0;
                    for _ in 0..MEALS {
                        weft::lock(first).unwrap();
                        weft::lock(second).unwrap();
                        meals += 1;
                        weft::unlock(second).unwrap();
                        weft::unlock(first).unwrap();
                        weft::yield_now();
                    }
                    meals
                },
                slot,
            )
            .unwrap();
        }
    }

    for slot in &eaten {
        let mut out: Aligned = 0;
        // SAFETY: reading the rendezvous words written by the tasks.
        unsafe { weft::read_ff(&mut out, slot).unwrap() };
        assert_eq!(out, MEALS);
    }

    weft::finalize();
}

#[test]
fn plain_threads_contend_via_proxies() {
    let _g = serial();
    weft::init(1).unwrap();

    let addr = 0x3000usize;
    weft::lock(addr).unwrap();

    let waiter = std::thread::spawn(move || {
        // not a task: blocks on a MCCOY proxy until main unlocks
        weft::lock(addr).unwrap();
        weft::unlock(addr).unwrap();
        true
    });

    std::thread::sleep(Duration::from_millis(50));
    weft::unlock(addr).unwrap();
    assert!(waiter.join().unwrap());

    weft::finalize();
}

#[test]
fn tasks_and_threads_share_one_lock_namespace() {
    let _g = serial();
    weft::init(2).unwrap();

    let addr = 0x4000usize;
    let hits: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));

    let mut done = [0 as Aligned; 4];
    for slot in done.iter_mut() {
        let hits = Arc::clone(&hits);
        // SAFETY: each slot outlives its task.
        unsafe {
            weft::fork(
                move || {
                    for _ in 0..50 {
                        weft::lock(addr).unwrap();
                        *hits.lock().unwrap() += 1;
                        weft::unlock(addr).unwrap();
                    }
                    1
                },
                slot,
            )
            .unwrap();
        }
    }
    for slot in &done {
        let mut out: Aligned = 0;
        // SAFETY: reading the rendezvous words written by the tasks.
        unsafe { weft::read_ff(&mut out, slot).unwrap() };
        assert_eq!(out, 1);
    }
    assert_eq!(*hits.lock().unwrap(), 200);

    weft::finalize();
}
