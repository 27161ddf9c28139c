//! The crate's public-facing surface: a safe handle over the process-wide
//! root, and a [`std::alloc::GlobalAlloc`] adapter for callers that want
//! this allocator wired in as `#[global_allocator]`.

use std::alloc::{GlobalAlloc, Layout};

use crate::config::ALIGNMENT;
use crate::engine;
use crate::root::global_root;

pub use crate::engine::ZoneHandle;
pub use crate::errors::AllocatorError;

/// A handle to the process-wide allocator root.
///
/// There is exactly one root per process (§9 "process-wide state"); this
/// type exists to give that singleton a conventional Rust entry point
/// rather than a bag of free functions, and to make teardown an explicit,
/// consuming operation instead of something that could be called twice by
/// accident. `Allocator` deliberately does not implement `Copy`/`Clone`:
/// every operation except [`shutdown`](Allocator::shutdown) only needs
/// `&self`, but `shutdown` takes `self` by value so the one handle a caller
/// holds is actually consumed by it, rather than silently surviving the
/// call for a second, unsound invocation. Every engine entry point also
/// aborts on its own if issued after teardown (§4.F), so this is
/// defense-in-depth, not the only thing standing between a caller and a
/// double-teardown.
#[derive(Debug)]
pub struct Allocator {
    _private: (),
}

impl Allocator {
    /// Returns a handle to the process-wide allocator, initializing it on
    /// first call.
    pub fn get() -> Allocator {
        // Touch the lazy singleton so construction happens here rather
        // than on the first real allocation.
        let _ = global_root();
        Allocator { _private: () }
    }

    /// Allocates `size` bytes of indeterminate content, aligned to at least
    /// [`ALIGNMENT`]. Returns `NULL` only on ordinary zone-table exhaustion
    /// while creating a new zone for a hint-free request; any detected
    /// corruption aborts the process instead of returning `NULL` (§7).
    pub fn alloc(&self, size: usize) -> *mut u8 {
        engine::alloc(size)
    }

    /// Allocates `nmemb * size` zero-filled bytes. Aborts on overflow.
    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        engine::calloc(nmemb, size)
    }

    /// Releases `p`. A `NULL` pointer is a no-op.
    pub fn free(&self, p: *mut u8) {
        engine::free(p)
    }

    /// Releases `p`, marking its chunk permanently unreclaimable.
    pub fn free_permanently(&self, p: *mut u8) {
        engine::free_permanently(p)
    }

    /// Returns the size class backing a live pointer, or `0` for `NULL`.
    pub fn chunk_size(&self, p: *mut u8) -> usize {
        engine::chunk_size(p)
    }

    /// Creates a dedicated zone for `size`-byte chunks, returning a handle
    /// that later `alloc`-family calls can target directly.
    pub fn new_zone(&self, size: usize, internal: bool) -> Result<ZoneHandle, AllocatorError> {
        engine::new_zone(size, internal)
    }

    /// Allocates from a specific zone, honoring `handle` as a hint rather
    /// than falling back to the general search if that zone can't serve
    /// the request (§4.G.2 point 3).
    pub fn alloc_in_zone(&self, handle: ZoneHandle, size: usize) -> *mut u8 {
        engine::alloc_in_zone(Some(handle), size)
    }

    /// Verifies every chunk marked "was used" still carries a valid canary.
    /// Aborts on the first mismatch found.
    pub fn verify_all_zones(&self) {
        engine::verify_all_zones()
    }

    /// Freezes the allocator: further reads/writes to its internal root
    /// state fault until [`Allocator::unprotect_root`] is called.
    pub fn protect_root(&self) {
        engine::protect_root()
    }

    /// Thaws the allocator after [`Allocator::protect_root`].
    pub fn unprotect_root(&self) {
        engine::unprotect_root()
    }

    /// Verifies every zone, destroys every zone's mappings, and marks the
    /// root permanently shut down. Consumes `self` — there is no handle to
    /// call this twice with. Any allocator call issued after this point
    /// aborts (§4.F teardown) rather than touching unmapped memory, since
    /// every engine entry point checks the root's `shutdown` flag before
    /// doing anything else.
    ///
    /// The reference runs this from a destructor attribute at process exit;
    /// Rust has no equivalent hook for a process-wide singleton with no
    /// single owning scope, so this crate exposes teardown as an explicit
    /// consuming call instead (documented open-question resolution).
    pub fn shutdown(self) {
        global_root().lock().teardown();
    }
}

/// A [`GlobalAlloc`] adapter over the process-wide allocator.
///
/// Only alignments `<= ALIGNMENT` (8 bytes) are honored — stronger
/// alignment is out of scope for this allocator (§1 Non-goals), so
/// `alloc`/`alloc_zeroed` return null for a `Layout` that asks for more.
/// `dealloc` ignores `layout` beyond that same check, since every chunk
/// already knows its own size class. The default trait-provided `realloc`
/// (alloc new, copy, dealloc old) is used as-is; a dedicated realloc code
/// path is out of scope (§1).
#[derive(Debug, Default, Clone, Copy)]
pub struct WardAlloc;

unsafe impl GlobalAlloc for WardAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return std::ptr::null_mut();
        }
        engine::alloc(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return std::ptr::null_mut();
        }
        engine::calloc(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        engine::free(ptr)
    }
}
