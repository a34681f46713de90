//! End-to-end arena scenarios against real backing files.
//!
//! The mapping registry is process-wide, so every test takes the serial
//! guard, uses its own backing file, and cleans up after itself.

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn scratch_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "weft-persist-{}-{}.arena",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&path);
    path
}

const MIB: usize = 1 << 20;

#[test]
fn static_allocate_free_reallocate_balances() {
    let _g = serial();
    let path = scratch_file("static-balance");
    let map = weft_persist::make_static_map(&path, MIB, None, 17, 4);

    // drain the whole arena
    let mut cells = Vec::new();
    while let Some(p) = map.malloc(17) {
        cells.push(p);
    }
    let total = cells.len();
    // 17-byte records round to 20; overhead is three header words, four
    // head words, and four lock slots
    assert!(total > 50_000, "1 MiB of 20-byte records, got {total}");
    assert_eq!(map.free_cells(), Some(0));

    // free every other cell, interleaved
    let mut freed = 0;
    for p in cells.iter().step_by(2) {
        // SAFETY: each cell came from this map and is freed once.
        unsafe { map.free(*p) };
        freed += 1;
    }
    assert_eq!(map.free_cells(), Some(freed));

    // reallocation finds exactly the freed cells again
    let mut again = 0;
    while map.malloc(17).is_some() {
        again += 1;
    }
    assert_eq!(again, freed);
    assert_eq!(map.free_cells(), Some(0));

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn static_allocations_are_distinct_and_writable() {
    let _g = serial();
    let path = scratch_file("static-distinct");
    let map = weft_persist::make_static_map(&path, 64 * 1024, None, 32, 2);

    let mut seen = std::collections::HashSet::new();
    let mut held = Vec::new();
    for i in 0..200u8 {
        let p = map.malloc(32).expect("arena has room");
        assert!(seen.insert(p.as_ptr() as usize), "no duplicate hand-outs");
        // SAFETY: a live 32-byte record is ours to fill.
        unsafe { p.as_ptr().write_bytes(i, 32) };
        held.push((p, i));
    }
    for (p, i) in &held {
        // SAFETY: reading back our own record.
        let got = unsafe { *p.as_ptr() };
        assert_eq!(got, *i, "records do not overlap");
    }
    for (p, _) in held {
        // SAFETY: freed exactly once.
        unsafe { map.free(p) };
    }

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn static_map_reloads_with_state_intact() {
    let _g = serial();
    let path = scratch_file("static-reload");
    let (keep_addr, keep_val) = {
        let map = weft_persist::make_static_map(&path, 64 * 1024, None, 24, 2);
        let p = map.malloc(24).unwrap();
        // SAFETY: a live record is ours.
        unsafe { p.as_ptr().write_bytes(0xab, 24) };
        weft_persist::checkpoint();
        (p.as_ptr() as usize, 0xabu8)
    };
    weft_persist::cleanup();

    // reload: the file dictates the base address, so the old pointer is
    // live again and still allocated
    let map = weft_persist::load_map(&path);
    // SAFETY: the mapping is back at its recorded base.
    let got = unsafe { *(keep_addr as *const u8) };
    assert_eq!(got, keep_val);

    // the persisted free lists must not hand the live record out again
    let mut fresh = Vec::new();
    for _ in 0..50 {
        let p = map.malloc(24).unwrap();
        assert_ne!(p.as_ptr() as usize, keep_addr);
        fresh.push(p);
    }
    for p in fresh {
        // SAFETY: freed exactly once.
        unsafe { map.free(p) };
    }
    // SAFETY: the pre-reload record, freed exactly once.
    unsafe { map.free(NonNull::new(keep_addr as *mut u8).unwrap()) };

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn dynamic_block_accounting_matches_live_set() {
    let _g = serial();
    let path = scratch_file("dyn-accounting");
    let map = weft_persist::make_dynamic_map(&path, MIB, None, 2);
    assert_eq!(map.occupied_blocks(), Some(0));

    // 45 slices need two small blocks
    let smalls: Vec<_> = (0..45).map(|_| map.malloc(48).unwrap()).collect();
    assert_eq!(map.occupied_blocks(), Some(2));

    // first big allocation also creates the stream's header block
    let b1 = map.malloc(1024).unwrap(); // 1 block
    assert_eq!(map.occupied_blocks(), Some(4));
    let b5 = map.malloc(5 * 1024).unwrap(); // 3 blocks
    assert_eq!(map.occupied_blocks(), Some(7));
    let b33 = map.malloc(33 * 1024).unwrap(); // 17 blocks
    assert_eq!(map.occupied_blocks(), Some(24));

    // big frees release their block runs
    // SAFETY: every pointer below came from this map, freed exactly once.
    unsafe {
        map.free(b5);
        assert_eq!(map.occupied_blocks(), Some(21));
        map.free(b1);
        map.free(b33);
        assert_eq!(map.occupied_blocks(), Some(3)); // 2 small blocks + header

        // small blocks and headers stay with their stream once created
        for p in smalls {
            map.free(p);
        }
        assert_eq!(map.occupied_blocks(), Some(3));

        // emptied slices are reused, not re-reserved
        let again = map.malloc(48).unwrap();
        assert_eq!(map.occupied_blocks(), Some(3));
        map.free(again);
    }

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn dynamic_mixed_churn_keeps_bitmap_consistent() {
    let _g = serial();
    let path = scratch_file("dyn-churn");
    let map = weft_persist::make_dynamic_map(&path, MIB, None, 2);

    // warm up: two small blocks and one big header exist afterwards
    let warm_smalls: Vec<_> = (0..45).map(|_| map.malloc(48).unwrap()).collect();
    let warm_big = map.malloc(1024).unwrap();
    // SAFETY: warm-up allocations, freed exactly once.
    unsafe {
        for p in warm_smalls {
            map.free(p);
        }
        map.free(warm_big);
    }
    let overhead = map.occupied_blocks().unwrap();
    assert_eq!(overhead, 3);

    // deterministic mixed churn: 48 B slices plus 1 KiB / 5 KiB / 33 KiB
    // block runs, bounded so no new small block or header is ever needed
    let mut lcg: u64 = 0x2545_f491_4f6c_dd1d;
    let mut rand = move || {
        lcg = lcg
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (lcg >> 33) as usize
    };
    let big_sizes = [1024usize, 5 * 1024, 33 * 1024];
    let mut live_smalls: Vec<NonNull<u8>> = Vec::new();
    let mut live_bigs: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut live_blocks = 0usize;

    for _ in 0..10_000 {
        match rand() % 4 {
            0 => {
                if live_smalls.len() < 30 {
                    live_smalls.push(map.malloc(48).unwrap());
                } else if let Some(p) = live_smalls.pop() {
                    // SAFETY: live allocation, freed exactly once.
                    unsafe { map.free(p) };
                }
            }
            n => {
                let size = big_sizes[n - 1];
                let blocks = size.div_ceil(2048);
                let roomy = live_blocks + blocks <= 350 && live_bigs.len() < 100;
                if roomy && rand() % 2 == 0 {
                    // fragmentation can defeat a long run even with blocks
                    // to spare; skipping is fine, the ledger stays exact
                    if let Some(p) = map.malloc(size) {
                        live_bigs.push((p, size));
                        live_blocks += blocks;
                    }
                } else if !live_bigs.is_empty() {
                    let idx = rand() % live_bigs.len();
                    let (p, size) = live_bigs.swap_remove(idx);
                    // SAFETY: live allocation, freed exactly once.
                    unsafe { map.free(p) };
                    live_blocks -= size.div_ceil(2048);
                }
            }
        }
    }

    let expected: usize = overhead
        + live_bigs
            .iter()
            .map(|(_, size)| size.div_ceil(2048))
            .sum::<usize>();
    assert_eq!(map.occupied_blocks(), Some(expected));

    // SAFETY: draining every remaining live allocation exactly once.
    unsafe {
        for p in live_smalls {
            map.free(p);
        }
        for (p, _) in live_bigs {
            map.free(p);
        }
    }
    assert_eq!(map.occupied_blocks(), Some(overhead));

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn dynamic_exhaustion_rolls_back_cleanly() {
    let _g = serial();
    let path = scratch_file("dyn-exhaust");
    // a tiny file: 16 KiB of data blocks at most
    let map = weft_persist::make_dynamic_map(&path, 32 * 1024, None, 1);

    let before = map.occupied_blocks().unwrap();
    assert_eq!(before, 0);
    // far larger than the whole file: the run reservation itself fails
    assert!(map.malloc(MIB).is_none());
    assert_eq!(map.occupied_blocks(), Some(0));

    // fill the arena with singles until it runs dry, then verify a failed
    // attempt did not strand any bitmap bits
    let mut held = Vec::new();
    while let Some(p) = map.malloc(1024) {
        held.push(p);
    }
    let full = map.occupied_blocks().unwrap();
    assert!(map.malloc(1024).is_none());
    assert_eq!(map.occupied_blocks(), Some(full));

    // SAFETY: every held pointer is freed exactly once.
    unsafe {
        for p in held {
            map.free(p);
        }
    }
    // only the big-block header remains
    assert_eq!(map.occupied_blocks(), Some(1));

    drop(map);
    weft_persist::cleanup();
    let _ = std::fs::remove_file(&path);
}
