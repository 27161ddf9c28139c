//! `mmap`/`mprotect`/`madvise` wrappers.
//!
//! A mapping failure here is never recoverable for a hardened allocator: if
//! the kernel won't give us anonymous pages there is no smaller fallback
//! that preserves the guard-page layout the rest of the allocator depends
//! on, so we abort rather than propagate an error callers would have to
//! guess how to handle.

use std::ffi::c_void;

use crate::cached_page_size;

/// Requested access mode for a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    NoAccess,
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::NoAccess => libc::PROT_NONE,
        }
    }
}

/// Access-pattern hints passed to `madvise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    WillNeed,
    Sequential,
    Random,
    DontNeed,
}

impl Advice {
    fn to_madv(self) -> libc::c_int {
        match self {
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::DontNeed => libc::MADV_DONTNEED,
        }
    }
}

/// Returns the process page size, queried once and cached.
pub fn page_size() -> usize {
    *cached_page_size()
}

/// Maps `size` bytes (rounded up to a page boundary) of anonymous,
/// private, read-write memory. Aborts the process on failure; there is no
/// recoverable path for "the kernel refused to hand back pages".
pub fn map_rw(size: usize) -> *mut u8 {
    let rounded = crate::round_up_to_page(size.max(1));
    // SAFETY: a fixed, well-formed argument list to an anonymous mapping
    // request; the kernel either returns a fresh mapping or MAP_FAILED.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            rounded,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        std::process::abort();
    }
    ptr.cast()
}

/// Unmaps `size` bytes (rounded up to a page boundary) starting at `p`.
///
/// # Safety
/// `p` must be the base of a live mapping of at least `size` bytes
/// previously returned by [`map_rw`].
pub unsafe fn unmap(p: *mut u8, size: usize) {
    let rounded = crate::round_up_to_page(size.max(1));
    // SAFETY: caller guarantees `p` is the base of a live mapping this size.
    unsafe {
        libc::munmap(p.cast::<c_void>(), rounded);
    }
}

/// Changes protection on `size` bytes (rounded up) starting at `p`.
/// Aborts on failure: a protection change we asked for and didn't get means
/// the guard-page or root-freeze invariants can no longer be trusted.
///
/// # Safety
/// `p` must be page-aligned and point at a live mapping of at least `size`
/// bytes.
pub unsafe fn protect(p: *mut u8, size: usize, mode: Protection) {
    let rounded = crate::round_up_to_page(size.max(1));
    // SAFETY: caller guarantees `p` is page-aligned and maps `rounded` bytes.
    let rc = unsafe { libc::mprotect(p.cast::<c_void>(), rounded, mode.to_prot()) };
    if rc != 0 {
        std::process::abort();
    }
}

/// Advises the kernel about the access pattern of `size` bytes (rounded up)
/// starting at `p`. `madvise` is an optimization hint; a failure here is
/// logged by the caller and otherwise ignored, never fatal.
///
/// # Safety
/// `p` must be page-aligned and point at a live mapping of at least `size`
/// bytes.
pub unsafe fn advise(p: *mut u8, size: usize, pattern: Advice) -> bool {
    let rounded = crate::round_up_to_page(size.max(1));
    // SAFETY: caller guarantees `p` is page-aligned and maps `rounded` bytes.
    let rc = unsafe { libc::madvise(p.cast::<c_void>(), rounded, pattern.to_madv()) };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_unmap_roundtrips() {
        let size = page_size() * 3;
        let p = map_rw(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % page_size(), 0);
        unsafe {
            std::ptr::write_bytes(p, 0xAB, size);
            unmap(p, size);
        }
    }

    #[test]
    fn protect_none_then_rw() {
        let size = page_size();
        let p = map_rw(size);
        unsafe {
            protect(p, size, Protection::NoAccess);
            protect(p, size, Protection::ReadWrite);
            std::ptr::write_bytes(p, 0, size);
            unmap(p, size);
        }
    }

    #[test]
    fn advise_does_not_panic() {
        let size = page_size();
        let p = map_rw(size);
        unsafe {
            advise(p, size, Advice::Random);
            advise(p, size, Advice::Sequential);
            advise(p, size, Advice::WillNeed);
            advise(p, size, Advice::DontNeed);
            unmap(p, size);
        }
    }
}
