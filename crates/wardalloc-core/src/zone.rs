//! A zone: one size class's worth of guarded bitmap + guarded user memory.

use wardalloc_sys::{Advice, Protection};

use crate::bitmap;
use crate::canary;
use crate::config::{ALIGNMENT, BAD_BIT_SLOT, BITS_PER_CHUNK, CHUNKS_PER_DWORD, MAX_DEFAULT_ZONE_SZ};
use crate::config::AllocatorConfig;
use crate::free_cache::FreeBitSlotCache;
use crate::rng::Rng;

fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

/// A self-contained arena serving one size class.
///
/// `bitmap_start`/`bitmap_end`/`user_pages_start`/`user_pages_end` are the
/// only fields masked "at rest" — XORed with `pointer_mask` whenever the
/// zone isn't actively being read from or written to, so that a leaked copy
/// of this struct doesn't hand an attacker live addresses (§9 design note).
/// Every other field (`chunk_size`, `is_full`, `internally_managed`, the
/// free-slot cache state) stays in the clear.
pub struct Zone {
    pub index: u32,
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub internally_managed: bool,
    pub is_full: bool,
    pub canary_secret: u64,
    pointer_mask: u64,
    ptrs_masked: bool,

    bitmap_start: usize,
    bitmap_end: usize,
    user_pages_start: usize,
    user_pages_end: usize,

    free_cache: FreeBitSlotCache,
    next_free_bit_slot: u32,
}

impl Zone {
    /// Constructs a new zone serving `chunk_size_requested`-byte chunks
    /// (rounded up to [`ALIGNMENT`]). Primes its free-slot cache and, for
    /// size classes small enough to host them, its canary chunks, before
    /// masking its pointers at rest.
    pub fn new(
        index: u32,
        chunk_size_requested: usize,
        internally_managed: bool,
        config: &AllocatorConfig,
        rng: &mut Rng,
    ) -> Zone {
        let chunk_size = round_up(chunk_size_requested.max(ALIGNMENT), ALIGNMENT);
        let chunk_count = (config.zone_user_size / chunk_size).max(1);
        let bitmap_size = (chunk_count * BITS_PER_CHUNK as usize).div_ceil(8);

        let page = wardalloc_sys::page_size();

        let bitmap_region_size = wardalloc_sys::round_up_to_page(bitmap_size);
        let bitmap_map_base = wardalloc_sys::map_rw(bitmap_region_size + 2 * page) as usize;
        let bitmap_start = bitmap_map_base + page;
        let bitmap_guard_above = bitmap_start + bitmap_region_size;
        // SAFETY: `bitmap_map_base` and `bitmap_guard_above` are freshly
        // mapped, page-aligned addresses within the mapping just created.
        unsafe {
            wardalloc_sys::protect(bitmap_map_base as *mut u8, page, Protection::NoAccess);
            wardalloc_sys::advise(bitmap_map_base as *mut u8, page, Advice::DontNeed);
            wardalloc_sys::protect(bitmap_guard_above as *mut u8, page, Protection::NoAccess);
            wardalloc_sys::advise(bitmap_guard_above as *mut u8, page, Advice::DontNeed);
            wardalloc_sys::advise(bitmap_start as *mut u8, bitmap_region_size, Advice::Sequential);
            wardalloc_sys::advise(bitmap_start as *mut u8, bitmap_region_size, Advice::WillNeed);
        }

        let user_region_size = wardalloc_sys::round_up_to_page(config.zone_user_size);
        let user_map_base = wardalloc_sys::map_rw(user_region_size + 2 * page) as usize;
        let user_pages_start = user_map_base + page;
        let user_guard_above = user_pages_start + user_region_size;
        // SAFETY: same reasoning as the bitmap mapping above.
        unsafe {
            wardalloc_sys::protect(user_map_base as *mut u8, page, Protection::NoAccess);
            wardalloc_sys::advise(user_map_base as *mut u8, page, Advice::DontNeed);
            wardalloc_sys::protect(user_guard_above as *mut u8, page, Protection::NoAccess);
            wardalloc_sys::advise(user_guard_above as *mut u8, page, Advice::DontNeed);
            wardalloc_sys::advise(user_pages_start as *mut u8, user_region_size, Advice::Random);
        }

        let canary_secret = rng.next_u64();
        let pointer_mask = rng.next_u64();

        let mut zone = Zone {
            index,
            chunk_size,
            chunk_count,
            internally_managed,
            is_full: false,
            canary_secret,
            pointer_mask,
            ptrs_masked: false,
            bitmap_start,
            bitmap_end: bitmap_guard_above,
            user_pages_start,
            user_pages_end: user_guard_above,
            free_cache: FreeBitSlotCache::new(config.bit_slot_cache_sz),
            next_free_bit_slot: BAD_BIT_SLOT,
        };

        if chunk_size <= MAX_DEFAULT_ZONE_SZ {
            zone.create_canary_chunks(config, rng);
        }
        zone.refill_free_cache(rng);
        zone.next_free_bit_slot = zone.free_cache.pop();

        zone.mask();
        zone
    }

    pub(crate) fn mask(&mut self) {
        debug_assert!(!self.ptrs_masked);
        self.bitmap_start ^= self.pointer_mask as usize;
        self.bitmap_end ^= self.pointer_mask as usize;
        self.user_pages_start ^= self.pointer_mask as usize;
        self.user_pages_end ^= self.pointer_mask as usize;
        self.ptrs_masked = true;
    }

    pub(crate) fn unmask(&mut self) {
        debug_assert!(self.ptrs_masked);
        self.bitmap_start ^= self.pointer_mask as usize;
        self.bitmap_end ^= self.pointer_mask as usize;
        self.user_pages_start ^= self.pointer_mask as usize;
        self.user_pages_end ^= self.pointer_mask as usize;
        self.ptrs_masked = false;
    }

    /// Runs `f` with this zone's pointers unmasked, re-masking afterward
    /// even if `f` returns early. Every operation that touches bitmap or
    /// user memory goes through this.
    pub fn with_unmasked<R>(&mut self, f: impl FnOnce(&mut Zone) -> R) -> R {
        self.unmask();
        let r = f(self);
        self.mask();
        r
    }

    pub fn bitmap_ptr(&self) -> *mut u8 {
        debug_assert!(!self.ptrs_masked);
        self.bitmap_start as *mut u8
    }

    pub fn user_pages_start(&self) -> usize {
        debug_assert!(!self.ptrs_masked);
        self.user_pages_start
    }

    pub fn user_pages_end(&self) -> usize {
        debug_assert!(!self.ptrs_masked);
        self.user_pages_end
    }

    pub fn contains(&self, p: usize) -> bool {
        debug_assert!(!self.ptrs_masked);
        p >= self.user_pages_start && p < self.user_pages_end
    }

    pub fn next_free_bit_slot(&self) -> u32 {
        self.next_free_bit_slot
    }

    pub fn clear_next_free_bit_slot(&mut self) {
        self.next_free_bit_slot = BAD_BIT_SLOT;
    }

    pub fn set_next_free_bit_slot(&mut self, slot: u32) {
        self.next_free_bit_slot = slot;
    }

    pub fn cache_is_drained(&self) -> bool {
        self.free_cache.is_drained()
    }

    /// Inserts a freed bit-slot into this zone's cache. Returns `true` if the
    /// slot was already present in the live window — the caller must treat
    /// that as fatal corruption (double free or a corrupted bitmap).
    #[must_use]
    pub fn free_cache_insert(&mut self, slot: u32) -> bool {
        self.free_cache.insert(slot)
    }

    fn bitmap_words(&self) -> usize {
        self.chunk_count.div_ceil(CHUNKS_PER_DWORD as usize)
    }

    fn create_canary_chunks(&mut self, config: &AllocatorConfig, rng: &mut Rng) {
        let count = self.chunk_count / config.canary_count_div.max(1);
        let bitmap_ptr = self.bitmap_start as *mut u8;
        for _ in 0..count {
            // Collisions (re-marking the same chunk) are tolerated, not
            // de-duplicated, matching the reference exactly (§9).
            let chunk_index = rng.next_usize_below(self.chunk_count);
            let slot = (chunk_index * BITS_PER_CHUNK as usize) as u32;
            // SAFETY: `bitmap_ptr` is this zone's live bitmap mapping;
            // `chunk_index < self.chunk_count` bounds the word read/write.
            unsafe { bitmap::set_canary_chunk(bitmap_ptr, slot) };
            let p = bitmap::pointer_from_bitslot(self.user_pages_start, self.chunk_size, slot);
            // SAFETY: `p` lies within `[user_pages_start, user_pages_end)`
            // by construction of `chunk_index`.
            unsafe { canary::write_canary(self.canary_secret, self.chunk_size, p as *mut u8) };
        }
    }

    /// Resets the cache, then scans forward from a randomized starting
    /// word, appending any slot whose in-use bit is clear until the cache
    /// is full or the bitmap is exhausted. No wraparound — a drained tail
    /// is expected to be picked up by the fast/slow scans in
    /// `crate::engine`.
    pub fn refill_free_cache(&mut self, rng: &mut Rng) {
        self.free_cache.reset();
        let bitmap_ptr = self.bitmap_start as *const u8;
        let num_words = self.bitmap_words();
        let start_word = rng.next_usize_below((num_words / 4).max(1));
        'outer: for word_idx in start_word..num_words {
            for chunk_in_word in 0..CHUNKS_PER_DWORD as usize {
                let chunk_index = word_idx * CHUNKS_PER_DWORD as usize + chunk_in_word;
                if chunk_index >= self.chunk_count {
                    break 'outer;
                }
                let slot = (chunk_index * BITS_PER_CHUNK as usize) as u32;
                // SAFETY: `chunk_index < self.chunk_count` bounds the read.
                let free = unsafe { !bitmap::is_in_use(bitmap_ptr, slot) };
                if free && !self.free_cache.push_during_refill(slot) {
                    break 'outer;
                }
            }
        }
    }

    pub fn pop_free_bit_slot(&mut self) -> u32 {
        let slot = self.free_cache.pop();
        self.next_free_bit_slot = slot;
        slot
    }

    /// First word that is entirely `(0,0)` — a fast win when many
    /// contiguous never-touched chunks remain.
    pub fn scan_fast(&self) -> Option<u32> {
        let bitmap_ptr = self.bitmap_start as *const u8;
        for word_idx in 0..self.bitmap_words() {
            // SAFETY: `word_idx < bitmap_words()` is in-bounds.
            let w = unsafe { bitmap::word_at(bitmap_ptr, word_idx) };
            if w == 0 {
                return Some((word_idx * crate::config::BITS_PER_DWORD as usize) as u32);
            }
        }
        None
    }

    /// First chunk (in any state) whose in-use bit is clear.
    pub fn scan_slow(&self) -> Option<u32> {
        let bitmap_ptr = self.bitmap_start as *const u8;
        for chunk_index in 0..self.chunk_count {
            let slot = (chunk_index * BITS_PER_CHUNK as usize) as u32;
            // SAFETY: `chunk_index < self.chunk_count` bounds the read.
            if unsafe { !bitmap::is_in_use(bitmap_ptr, slot) } {
                return Some(slot);
            }
        }
        None
    }

    /// Fraction of chunks in the permanent canary state `(1,1)`; test/
    /// diagnostic use only.
    pub fn canary_chunk_count(&self) -> usize {
        let bitmap_ptr = self.bitmap_start as *const u8;
        (0..self.chunk_count)
            .filter(|&chunk_index| {
                let slot = (chunk_index * BITS_PER_CHUNK as usize) as u32;
                // SAFETY: `chunk_index < self.chunk_count` bounds the read.
                unsafe { bitmap::is_in_use(bitmap_ptr, slot) && bitmap::was_used(bitmap_ptr, slot) }
            })
            .count()
    }

    /// Verifies the canary of every chunk whose "was used" bit is set.
    /// Returns the first mismatch found, if any; does not abort itself so
    /// the caller can log before terminating.
    pub fn verify(&self) -> Result<(), (u32, canary::CanaryMismatch)> {
        let bitmap_ptr = self.bitmap_start as *const u8;
        for chunk_index in 0..self.chunk_count {
            let slot = (chunk_index * BITS_PER_CHUNK as usize) as u32;
            // SAFETY: `chunk_index < self.chunk_count` bounds the read.
            if unsafe { bitmap::was_used(bitmap_ptr, slot) } {
                let p = bitmap::pointer_from_bitslot(self.user_pages_start, self.chunk_size, slot);
                // SAFETY: `p` lies within the user region by construction.
                let result =
                    unsafe { canary::check_canary_no_abort(self.canary_secret, self.chunk_size, p as *mut u8) };
                if let Err(mismatch) = result {
                    return Err((slot, mismatch));
                }
            }
        }
        Ok(())
    }

    /// Unmaps (if internally managed) or revokes access to (otherwise) this
    /// zone's mappings. Idempotent is not guaranteed — call exactly once.
    pub fn destroy(&mut self) {
        if self.ptrs_masked {
            self.unmask();
        }
        let page = wardalloc_sys::page_size();
        if self.internally_managed {
            let bitmap_guard_below = self.bitmap_start - page;
            let bitmap_total = (self.bitmap_end - bitmap_guard_below) + page;
            let user_guard_below = self.user_pages_start - page;
            let user_total = (self.user_pages_end - user_guard_below) + page;
            // SAFETY: these are exactly the mappings created in `Zone::new`.
            unsafe {
                wardalloc_sys::unmap(bitmap_guard_below as *mut u8, bitmap_total);
                wardalloc_sys::unmap(user_guard_below as *mut u8, user_total);
            }
            self.scrub();
        } else {
            // SAFETY: revoking access to our own live mappings.
            unsafe {
                wardalloc_sys::protect(
                    self.bitmap_start as *mut u8,
                    self.bitmap_end - self.bitmap_start,
                    Protection::NoAccess,
                );
                wardalloc_sys::protect(
                    self.user_pages_start as *mut u8,
                    self.user_pages_end - self.user_pages_start,
                    Protection::NoAccess,
                );
            }
        }
    }

    /// Zeroes the fields that would otherwise leak security-relevant state
    /// once this zone's mappings are gone — `canary_secret` and
    /// `pointer_mask` would sit in the zone table for the rest of the
    /// process, and `bitmap_*`/`user_pages_*` would still read as live
    /// addresses after their mappings were unmapped out from under them.
    /// Only called from the internally-managed `destroy` path, right after
    /// unmapping; a `memset`-the-whole-struct equivalent is unsound here
    /// because `Zone` owns a `Vec` (the free-slot cache), so fields are
    /// scrubbed individually instead.
    fn scrub(&mut self) {
        self.canary_secret = 0;
        self.pointer_mask = 0;
        self.bitmap_start = 0;
        self.bitmap_end = 0;
        self.user_pages_start = 0;
        self.user_pages_end = 0;
        self.ptrs_masked = false;
        self.free_cache.reset();
        self.next_free_bit_slot = BAD_BIT_SLOT;
        self.is_full = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AllocatorConfig {
        AllocatorConfig {
            zone_user_size: 256 * 1024,
            ..AllocatorConfig::default()
        }
    }

    #[test]
    fn new_zone_primes_a_free_slot() {
        let config = test_config();
        let mut rng = Rng::from_seed(1);
        let zone = Zone::new(0, 64, true, &config, &mut rng);
        assert_ne!(zone.next_free_bit_slot(), BAD_BIT_SLOT);
        assert_eq!(zone.chunk_size, 64);
    }

    #[test]
    fn canary_density_is_near_one_percent() {
        let config = test_config();
        let mut rng = Rng::from_seed(2);
        let mut zone = Zone::new(0, 64, true, &config, &mut rng);
        let expected = zone.chunk_count / config.canary_count_div;
        let observed = zone.with_unmasked(|z| z.canary_chunk_count());
        assert!(
            observed.abs_diff(expected) <= 1,
            "expected ~{expected} canary chunks, observed {observed}"
        );
    }

    #[test]
    fn destroy_scrubs_secrets_for_an_internally_managed_zone() {
        let config = test_config();
        let mut rng = Rng::from_seed(4);
        let mut zone = Zone::new(0, 64, true, &config, &mut rng);
        assert_ne!(zone.canary_secret, 0);
        zone.destroy();
        assert_eq!(zone.canary_secret, 0);
        assert_eq!(zone.pointer_mask, 0);
        assert_eq!(zone.bitmap_start, 0);
        assert_eq!(zone.bitmap_end, 0);
        assert_eq!(zone.user_pages_start, 0);
        assert_eq!(zone.user_pages_end, 0);
        assert_eq!(zone.next_free_bit_slot(), BAD_BIT_SLOT);
    }

    #[test]
    fn verify_passes_on_a_freshly_constructed_zone() {
        let config = test_config();
        let mut rng = Rng::from_seed(3);
        let mut zone = Zone::new(0, 64, true, &config, &mut rng);
        zone.with_unmasked(|z| assert!(z.verify().is_ok()));
    }
}
