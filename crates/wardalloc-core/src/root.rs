//! The process-wide root: the zone table, its coarse lock, and the
//! sentinel mapping that backs `protect_root`/`unprotect_root`.
//!
//! The reference implementation mmaps the root struct itself flanked by two
//! guard pages and mprotects that mapping to freeze/thaw the allocator. A
//! `Vec`/`Mutex`-backed Rust struct can't be relocated into a raw mapping
//! without unsafe manual placement that would give up the ownership
//! guarantees the rest of this crate relies on, so the root's actual data
//! lives in ordinary process memory; a dedicated guard-bracketed sentinel
//! mapping stands in for "the root struct page" so protect/unprotect still
//! has real page-level teeth (an access after `protect_root` genuinely
//! faults) instead of being a bookkeeping-only flag. This substitution is
//! recorded as a resolved open question in the design ledger.

use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};
use wardalloc_sys::Protection;

use crate::config::AllocatorConfig;
use crate::diagnostics::{AllocatorLogLevel, LifecycleLog};
use crate::rng::Rng;
use crate::zone::Zone;

/// Everything the coarse mutex protects.
pub struct RootInner {
    pub config: AllocatorConfig,
    pub zones: Vec<Zone>,
    pub zone_handle_mask: u64,
    pub rng: Rng,
    pub log: LifecycleLog,
    pub protected: bool,
    pub shutdown: bool,
    sentinel_base: usize,
    sentinel_size: usize,
}

impl RootInner {
    fn new() -> RootInner {
        let config = AllocatorConfig::from_env();
        let page = wardalloc_sys::page_size();
        let sentinel_total = page * 3;
        let sentinel_base = wardalloc_sys::map_rw(sentinel_total) as usize;
        // SAFETY: freshly mapped, page-aligned guard pages flanking the
        // middle sentinel page.
        unsafe {
            wardalloc_sys::protect(sentinel_base as *mut u8, page, Protection::NoAccess);
            wardalloc_sys::protect(
                (sentinel_base + 2 * page) as *mut u8,
                page,
                Protection::NoAccess,
            );
        }

        let mut rng = Rng::from_os();
        let log = LifecycleLog::new(config.log_capacity);
        let mut inner = RootInner {
            zones: Vec::with_capacity(config.default_zones.len()),
            zone_handle_mask: 0,
            rng,
            log,
            protected: false,
            shutdown: false,
            sentinel_base,
            sentinel_size: sentinel_total,
            config,
        };

        let default_zones = inner.config.default_zones.clone();
        for size in default_zones {
            let index = inner.zones.len() as u32;
            let zone = Zone::new(index, size, true, &inner.config, &mut inner.rng);
            inner.zones.push(zone);
            inner.log.record(
                AllocatorLogLevel::Info,
                "zone.create",
                Some(index),
                None,
                Some(size),
                format!("default zone for size class {size}"),
            );
        }

        inner.zone_handle_mask = inner
            .rng
            .next_u64()
            .wrapping_mul(inner.rng.next_u64());

        inner
    }

    fn sentinel_ptr(&self) -> *mut u8 {
        let page = wardalloc_sys::page_size();
        (self.sentinel_base + page) as *mut u8
    }

    pub fn protect_root(&mut self) {
        let page = wardalloc_sys::page_size();
        // SAFETY: the sentinel page is a live mapping owned by this root.
        unsafe { wardalloc_sys::protect(self.sentinel_ptr(), page, Protection::NoAccess) };
        self.protected = true;
        self.log.record(
            AllocatorLogLevel::Info,
            "root.protect",
            None,
            None,
            None,
            String::new(),
        );
    }

    pub fn unprotect_root(&mut self) {
        let page = wardalloc_sys::page_size();
        // SAFETY: the sentinel page is a live mapping owned by this root.
        unsafe { wardalloc_sys::protect(self.sentinel_ptr(), page, Protection::ReadWrite) };
        self.protected = false;
        self.log.record(
            AllocatorLogLevel::Info,
            "root.unprotect",
            None,
            None,
            None,
            String::new(),
        );
    }

    /// Verifies and destroys every zone, then unmaps the sentinel region.
    /// Terminal: no further operations should be issued against this root
    /// afterward (`shutdown` is set so they abort instead of touching
    /// freed mappings).
    pub fn teardown(&mut self) {
        for zone in &mut self.zones {
            if let Err((slot, mismatch)) = zone.with_unmasked(|z| z.verify()) {
                self.log.record(
                    AllocatorLogLevel::Fatal,
                    "abort.teardown_canary_mismatch",
                    Some(zone.index),
                    Some(slot as usize),
                    None,
                    format!("{mismatch:?}"),
                );
                std::process::abort();
            }
        }
        for zone in &mut self.zones {
            zone.destroy();
        }
        // SAFETY: `sentinel_base` is this root's own live mapping, unmapped
        // exactly once here.
        unsafe { wardalloc_sys::unmap(self.sentinel_base as *mut u8, self.sentinel_size) };
        self.shutdown = true;
    }
}

/// The process-wide singleton. Lazily constructed on first touch and never
/// reconstructed — reinitialization would violate the idempotence
/// invariant (§9).
pub struct Root {
    inner: Mutex<RootInner>,
}

impl Root {
    fn new() -> Root {
        Root {
            inner: Mutex::new(RootInner::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RootInner> {
        self.inner.lock()
    }
}

/// Returns the lazily-constructed process-wide root.
pub fn global_root() -> &'static Root {
    static ROOT: OnceLock<Root> = OnceLock::new();
    ROOT.get_or_init(Root::new)
}
