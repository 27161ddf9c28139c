//! Subprocess-driven tests for the allocator's abort-on-corruption
//! properties (double free, cross-zone free, misaligned free, neighbor
//! canary corruption, calloc overflow).
//!
//! `std::process::abort()` raises `SIGABRT` and cannot be caught from
//! inside the corrupted process — there is nothing to catch, by design
//! (§7). Each scenario is its own `#[test]` that performs the corrupting
//! action directly when run with a marker env var set; the driver tests
//! re-exec this same test binary filtered down to one scenario and assert
//! the child died from `SIGABRT` rather than exiting normally.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use wardalloc_core::Allocator;

const SUBPROCESS_ENV: &str = "WARDALLOC_RUN_SCENARIO";

fn in_subprocess() -> bool {
    std::env::var_os(SUBPROCESS_ENV).is_some()
}

fn assert_child_aborts(scenario: &str) {
    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args(["--exact", scenario, "--nocapture"])
        .env(SUBPROCESS_ENV, "1")
        .output()
        .expect("failed to spawn child test process");

    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "scenario `{scenario}` should abort with SIGABRT; status={:?} stdout={} stderr={}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
}

/// Property 4 / S4: freeing the same pointer twice aborts.
#[test]
fn double_free_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let p = a.alloc(128);
        a.free(p);
        a.free(p);
        return;
    }
    assert_child_aborts("double_free_aborts");
}

/// Property 5: freeing a pointer this allocator never handed out aborts.
#[test]
fn free_of_unknown_pointer_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let mut not_ours = 0u8;
        a.free(std::ptr::addr_of_mut!(not_ours));
        return;
    }
    assert_child_aborts("free_of_unknown_pointer_aborts");
}

/// Property 6: freeing `p + 1` for an allocated `p` aborts.
#[test]
fn misaligned_free_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let p = a.alloc(64);
        // SAFETY: still inside the chunk's mapping, just not chunk-aligned.
        let misaligned = unsafe { p.add(1) };
        a.free(misaligned);
        return;
    }
    assert_child_aborts("misaligned_free_aborts");
}

/// Property 7 / S3: corrupting a freed chunk's canary is caught by the
/// neighbor audit the next time an adjacent chunk is freed.
///
/// Cache/scan randomization means the order two `alloc(64)` calls return
/// addresses in isn't guaranteed to be chunk-adjacent, so this allocates a
/// batch and finds a real adjacent pair by address rather than assuming the
/// first two calls neighbor each other — a more robust drive of the same
/// property S3 describes.
#[test]
fn neighbor_canary_corruption_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let mut ptrs: Vec<*mut u8> = (0..512).map(|_| a.alloc(64)).collect();
        ptrs.sort_unstable_by_key(|p| *p as usize);
        let (lo, mid) = ptrs
            .windows(2)
            .find_map(|w| {
                if (w[1] as usize) - (w[0] as usize) == 64 {
                    Some((w[0], w[1]))
                } else {
                    None
                }
            })
            .expect("expected at least one chunk-adjacent pair among 512 allocations");

        a.free(lo);
        // SAFETY: `lo`'s mapping is still live (freed, not unmapped);
        // stomping its canary simulates a use-after-free write.
        unsafe { std::ptr::write_bytes(lo, 0, 8) };
        a.free(mid);
        return;
    }
    assert_child_aborts("neighbor_canary_corruption_aborts");
}

/// Property 12: `calloc(SIZE_MAX, 2)` aborts on multiplication overflow.
#[test]
fn calloc_overflow_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let _ = a.calloc(usize::MAX, 2);
        return;
    }
    assert_child_aborts("calloc_overflow_aborts");
}

/// S2: writing into a freed chunk then reallocating it is caught on reuse,
/// not on the write itself — the canary is checked when the slot comes
/// back out of the cache, which this drives via a dedicated zone so the
/// reused slot is deterministic.
#[test]
fn use_after_free_write_caught_on_reuse_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let handle = a.new_zone(64, true).expect("zone creation should succeed");
        let p = a.alloc_in_zone(handle, 64);
        a.free(p);
        // SAFETY: `p`'s mapping is still live.
        unsafe { *(p as *mut u64) = 0xAAAA_AAAA_AAAA_AAAA };
        // A tiny zone with a tiny cache reliably hands the same slot back.
        for _ in 0..256 {
            let _ = a.alloc_in_zone(handle, 64);
        }
        return;
    }
    assert_child_aborts("use_after_free_write_caught_on_reuse_aborts");
}

/// §4.F teardown: any allocator call issued after `shutdown()` aborts
/// instead of touching the now-unmapped zones, regardless of which entry
/// point is used.
#[test]
fn alloc_after_shutdown_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let p = a.alloc(64);
        a.free(p);
        a.shutdown();
        // `shutdown` consumes its handle; a fresh one still resolves to the
        // same (now torn-down) process-wide root.
        let b = Allocator::get();
        let _ = b.alloc(64);
        return;
    }
    assert_child_aborts("alloc_after_shutdown_aborts");
}

/// Same as `alloc_after_shutdown_aborts`, but through `free` — the zone
/// resolving `p` has already been unmapped by `shutdown`, so this must not
/// silently run `find_zone_range` against it.
#[test]
fn free_after_shutdown_aborts() {
    if in_subprocess() {
        let a = Allocator::get();
        let p = a.alloc(64);
        a.shutdown();
        let b = Allocator::get();
        b.free(p);
        return;
    }
    assert_child_aborts("free_after_shutdown_aborts");
}
