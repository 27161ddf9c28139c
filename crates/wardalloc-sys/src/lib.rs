//! Page-level primitives for a zoned, hardened allocator.
//!
//! Everything here is a thin, abort-on-failure wrapper over the platform's
//! anonymous-mapping syscalls. Nothing in this crate tracks allocator state;
//! it only hands out and revokes raw pages.

use std::sync::OnceLock;

pub mod pages;

pub use pages::{Advice, Protection, advise, map_rw, page_size, protect, unmap};

/// Rounds `size` up to the next multiple of `page_size()`.
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

fn cached_page_size() -> &'static usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf with _SC_PAGESIZE takes no pointers and cannot fail
        // in a way that leaves memory in an inconsistent state.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw <= 0 {
            // A platform that can't report its own page size can't be
            // reasoned about; there is no recoverable fallback.
            std::process::abort();
        }
        raw as usize
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two_and_nonzero() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn round_up_to_page_is_idempotent() {
        let ps = page_size();
        assert_eq!(round_up_to_page(1), ps);
        assert_eq!(round_up_to_page(ps), ps);
        assert_eq!(round_up_to_page(ps + 1), ps * 2);
    }
}
