//! Per-chunk canaries: an 8-byte value bound to the chunk's own address.
//!
//! XOR-binding the canary to the address (`secret XOR address`) defeats
//! canary reuse across chunks — a value that verifies at one chunk's
//! offsets is wrong everywhere else.

use crate::config::CANARY_SIZE;

/// Computes the canary value expected at address `p` for a zone whose
/// secret is `secret`.
pub fn expected_canary(secret: u64, p: usize) -> u64 {
    secret ^ (p as u64)
}

/// Which end of the chunk a canary mismatch was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryEnd {
    Head,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanaryMismatch {
    pub end: CanaryEnd,
    pub expected: u64,
    pub observed: u64,
}

/// Writes the chunk's canary at both ends. `chunk_size` must be at least
/// `2 * CANARY_SIZE` (the reference requires `chunk_size >= 16`).
///
/// # Safety
/// `p` must point at a writable chunk of at least `chunk_size` bytes.
pub unsafe fn write_canary(secret: u64, chunk_size: usize, p: *mut u8) {
    debug_assert!(chunk_size >= 2 * CANARY_SIZE);
    let c = expected_canary(secret, p as usize).to_ne_bytes();
    // SAFETY: caller guarantees `p` maps at least `chunk_size` writable bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(c.as_ptr(), p, CANARY_SIZE);
        std::ptr::copy_nonoverlapping(c.as_ptr(), p.add(chunk_size - CANARY_SIZE), CANARY_SIZE);
    }
}

/// Verifies the chunk's canary at both ends without aborting.
///
/// # Safety
/// `p` must point at a readable chunk of at least `chunk_size` bytes.
pub unsafe fn check_canary_no_abort(
    secret: u64,
    chunk_size: usize,
    p: *mut u8,
) -> Result<(), CanaryMismatch> {
    let expected = expected_canary(secret, p as usize);
    // SAFETY: caller guarantees `p` maps at least `chunk_size` readable bytes.
    let head = unsafe { read_u64(p) };
    if head != expected {
        return Err(CanaryMismatch {
            end: CanaryEnd::Head,
            expected,
            observed: head,
        });
    }
    // SAFETY: same as above; `chunk_size - CANARY_SIZE` is in-bounds.
    let tail = unsafe { read_u64(p.add(chunk_size - CANARY_SIZE)) };
    if tail != expected {
        return Err(CanaryMismatch {
            end: CanaryEnd::Tail,
            expected,
            observed: tail,
        });
    }
    Ok(())
}

/// Verifies the chunk's canary at both ends, aborting the process on any
/// mismatch. Used where the caller has no log ring to attach a diagnostic
/// to; the engine prefers [`check_canary_no_abort`] so it can log first.
///
/// # Safety
/// `p` must point at a readable chunk of at least `chunk_size` bytes.
pub unsafe fn check_canary(secret: u64, chunk_size: usize, p: *mut u8) {
    // SAFETY: forwarded to `check_canary_no_abort`.
    if unsafe { check_canary_no_abort(secret, chunk_size, p) }.is_err() {
        std::process::abort();
    }
}

unsafe fn read_u64(p: *const u8) -> u64 {
    let mut bytes = [0u8; 8];
    // SAFETY: caller guarantees 8 readable bytes at `p`.
    unsafe { std::ptr::copy_nonoverlapping(p, bytes.as_mut_ptr(), 8) };
    u64::from_ne_bytes(bytes)
}
