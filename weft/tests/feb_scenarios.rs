//! End-to-end full/empty-bit scenarios.
//!
//! The runtime is a process-wide singleton, so every test takes the serial
//! guard and runs its own init/finalize pair.

use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use weft::Aligned;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn leak_word() -> usize {
    Box::leak(Box::new(0 as Aligned)) as *mut Aligned as usize
}

#[test]
fn producer_consumer_sums_to_5050() {
    let _g = serial();
    weft::init(2).unwrap();

    let slot = leak_word();
    let mut total: Aligned = 0;
    // SAFETY: `slot` is leaked and `total` outlives the rendezvous below.
    unsafe {
        weft::empty(slot as *const Aligned).unwrap();
        weft::fork_to(
            move || {
                let p = slot as *mut Aligned;
                for i in 1..=100 {
                    // SAFETY: `p` is the leaked word.
                    unsafe { weft::write_ef_const(p, i).unwrap() };
                }
                0
            },
            ptr::null_mut(),
            0,
        )
        .unwrap();
        weft::fork_to(
            move || {
                let p = slot as *mut Aligned;
                let mut sum = 0;
                for _ in 0..100 {
                    let mut v: Aligned = 0;
                    // SAFETY: `v` is ours, `p` is the leaked word.
                    unsafe { weft::read_fe(&mut v, p).unwrap() };
                    sum += v;
                }
                sum
            },
            &mut total,
            1,
        )
        .unwrap();

        let mut result: Aligned = 0;
        weft::read_ff(&mut result, &total).unwrap();
        assert_eq!(result, 5050);
    }

    weft::finalize();
}

#[test]
fn triple_queue_release() {
    let _g = serial();
    weft::init(2).unwrap();

    let word = leak_word();
    let (mut r1, mut r2, mut r3): (Aligned, Aligned, Aligned) = (0, 0, 0);
    // SAFETY: the word is leaked; the result slots outlive their tasks.
    unsafe {
        weft::empty(word as *const Aligned).unwrap();

        let ff_reader = move || {
            let mut v: Aligned = 0;
            // SAFETY: reads the leaked word.
            unsafe { weft::read_ff(&mut v, word as *const Aligned).unwrap() };
            v
        };
        weft::fork(ff_reader, &mut r1).unwrap();
        weft::fork(ff_reader, &mut r2).unwrap();
        weft::fork(
            move || {
                let mut v: Aligned = 0;
                // SAFETY: reads (and re-empties) the leaked word.
                unsafe { weft::read_fe(&mut v, word as *mut Aligned).unwrap() };
                v
            },
            &mut r3,
        )
        .unwrap();

        // let all three readers park on the word's waiter lists
        std::thread::sleep(Duration::from_millis(100));

        weft::fork(
            move || {
                // SAFETY: writes the leaked word.
                unsafe { weft::write_ef_const(word as *mut Aligned, 42).unwrap() };
                0
            },
            ptr::null_mut(),
        )
        .unwrap();

        let mut out: Aligned = 0;
        weft::read_ff(&mut out, &r1).unwrap();
        assert_eq!(out, 42);
        weft::read_ff(&mut out, &r2).unwrap();
        assert_eq!(out, 42);
        weft::read_ff(&mut out, &r3).unwrap();
        assert_eq!(out, 42);
    }
    // the FE reader drained the word back to empty
    assert!(!weft::feb_status(word as *const Aligned));

    weft::finalize();
}

#[test]
fn write_ef_read_fe_roundtrip_leaves_empty() {
    let _g = serial();
    weft::init(1).unwrap();

    let a = leak_word();
    let mut b: Aligned = 0;
    // SAFETY: `a` is leaked, `b` is ours.
    unsafe {
        weft::empty(a as *const Aligned).unwrap();
        weft::write_ef_const(a as *mut Aligned, 1234).unwrap();
        assert!(weft::feb_status(a as *const Aligned));
        weft::read_fe(&mut b, a as *mut Aligned).unwrap();
    }
    assert_eq!(b, 1234);
    assert!(!weft::feb_status(a as *const Aligned));

    weft::finalize();
}

#[test]
fn empty_then_fill_wakes_ff_waiter_with_current_value() {
    let _g = serial();
    weft::init(2).unwrap();

    let word = leak_word();
    let mut seen: Aligned = 0;
    // SAFETY: the word is leaked; `seen` outlives its task.
    unsafe {
        weft::empty(word as *const Aligned).unwrap();
        weft::fork(
            move || {
                let mut v: Aligned = 0;
                // SAFETY: reads the leaked word.
                unsafe { weft::read_ff(&mut v, word as *const Aligned).unwrap() };
                v
            },
            &mut seen,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // store the payload directly, then flip the bit
        *(word as *mut Aligned) = 99;
        weft::fill(word as *const Aligned).unwrap();

        let mut out: Aligned = 0;
        weft::read_ff(&mut out, &seen).unwrap();
        assert_eq!(out, 99);
    }
    assert!(weft::feb_status(word as *const Aligned));

    weft::finalize();
}

#[test]
fn unaligned_addresses_are_rounded_down() {
    let _g = serial();
    weft::init(1).unwrap();

    let word = leak_word();
    let misaligned = (word + 1) as *mut Aligned;
    // SAFETY: rounding down lands back on the leaked word.
    unsafe {
        weft::write_f_const(misaligned, 7).unwrap();
        assert_eq!(*(word as *const Aligned), 7);
    }
    assert!(weft::feb_status(word as *const Aligned));

    weft::finalize();
}

#[test]
fn feb_status_defaults_to_full() {
    let _g = serial();
    weft::init(1).unwrap();

    let word = leak_word();
    assert!(weft::feb_status(word as *const Aligned));
    // SAFETY: the word is leaked.
    unsafe {
        weft::empty(word as *const Aligned).unwrap();
        assert!(!weft::feb_status(word as *const Aligned));
        weft::fill(word as *const Aligned).unwrap();
    }
    assert!(weft::feb_status(word as *const Aligned));

    weft::finalize();
}
