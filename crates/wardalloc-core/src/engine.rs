//! The allocator engine: find-fit, create-on-demand, alloc, free, and
//! pointer-to-zone resolution.
//!
//! Every function here either runs under the root's single coarse mutex
//! (the `*_locked` helpers borrow `&mut RootInner` directly instead of
//! re-entering the lock) or acquires it itself for the duration of one
//! public operation (§5). None of these functions return an error for a
//! detected corruption, invariant violation, or overflow — they log a
//! `Fatal` record and abort (§7, §9 "aborts vs. returns").

use crate::bitmap;
use crate::canary;
use crate::config::{ALIGNMENT, BAD_BIT_SLOT, BITS_PER_CHUNK, CANARY_SIZE, POISON_BYTE, ZONE_1024};
use crate::diagnostics::{AllocatorLogLevel, LifecycleLog};
use crate::errors::AllocatorError;
use crate::root::{RootInner, global_root};

/// An opaque, masked reference to a zone created with [`new_zone`].
///
/// The raw table index is XORed with the root's `zone_handle_mask`, so a
/// copy of this handle does not by itself reveal which zone-table slot it
/// names — the Rust analogue of the reference's pointer-masking-at-rest
/// design applied to the one "pointer" this crate hands callers instead of
/// a raw zone address (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneHandle(u64);

impl ZoneHandle {
    fn encode(index: u32, mask: u64) -> ZoneHandle {
        ZoneHandle(index as u64 ^ mask)
    }

    fn decode(self, mask: u64) -> u32 {
        (self.0 ^ mask) as u32
    }
}

/// Logs a `Fatal` record and aborts the process. Never returns.
fn record_fatal(
    log: &mut LifecycleLog,
    event: &'static str,
    zone_index: Option<u32>,
    address: Option<usize>,
    size: Option<usize>,
    detail: String,
) -> ! {
    log.record(AllocatorLogLevel::Fatal, event, zone_index, address, size, detail);
    std::process::abort();
}

/// Aborts if the root has already been torn down by [`Allocator::shutdown`](crate::api::Allocator::shutdown).
/// Every mutating entry point calls this before touching any zone, since a
/// destroyed zone's mappings are unmapped out from under it (§4.F) — reading
/// or writing through one after teardown is not corruption the allocator
/// detects on its own, it's a plain use-after-unmap, so the check has to run
/// first.
fn abort_if_shutdown(inner: &mut RootInner, op: &'static str, address: Option<usize>, size: Option<usize>) {
    if inner.shutdown {
        record_fatal(
            &mut inner.log,
            "abort.use_after_shutdown",
            None,
            address,
            size,
            format!("{op} called after root teardown"),
        );
    }
}

/// `is_zone_usable`: decides whether `zone_idx` can serve a `size`-byte
/// request right now, priming `next_free_bit_slot` as a side effect when it
/// can. Mirrors the reference's tiered search: primed slot, waste check,
/// cache refill, fast scan, slow scan (§4.G.1).
fn is_zone_usable(inner: &mut RootInner, zone_idx: usize, size: usize) -> bool {
    if inner.zones[zone_idx].next_free_bit_slot() != BAD_BIT_SLOT {
        return true;
    }

    let wasted_sz_multiplier = inner.config.wasted_sz_multiplier;
    let RootInner { zones, rng, .. } = inner;
    let zone = &mut zones[zone_idx];

    zone.with_unmasked(|z| {
        if z.chunk_size >= size.saturating_mul(wasted_sz_multiplier) && size > ZONE_1024 {
            return false;
        }

        if z.cache_is_drained() {
            z.refill_free_cache(rng);
        }

        if z.pop_free_bit_slot() != BAD_BIT_SLOT {
            return true;
        }

        if let Some(slot) = z.scan_fast() {
            z.set_next_free_bit_slot(slot);
            return true;
        }

        // Slow scan: `is_full` is set ONLY on exhaustion, never on the
        // success branch (§9 ambiguity, preserved exactly).
        match z.scan_slow() {
            Some(slot) => {
                z.set_next_free_bit_slot(slot);
                true
            }
            None => {
                z.is_full = true;
                false
            }
        }
    })
}

/// `iso_find_zone_fit`: the first zone (in table order) whose chunk size
/// fits `size` and that `is_zone_usable` accepts. Unlike a single first-fit
/// check, a rejected candidate does not stop the scan — the next candidate
/// is tried (§4.G.1, matching the reference's `continue` on rejection).
fn find_zone_fit(inner: &mut RootInner, size: usize) -> Option<usize> {
    let zone_count = inner.zones.len();
    for idx in 0..zone_count {
        let candidate = {
            let z = &inner.zones[idx];
            z.chunk_size >= size && z.internally_managed && !z.is_full
        };
        if !candidate {
            continue;
        }
        if is_zone_usable(inner, idx, size) {
            return Some(idx);
        }
    }
    None
}

fn new_zone_locked(
    inner: &mut RootInner,
    size: usize,
    internal: bool,
) -> Result<ZoneHandle, AllocatorError> {
    abort_if_shutdown(inner, "new_zone", None, Some(size));

    if size > usize::MAX - ALIGNMENT {
        return Err(AllocatorError::SizeClassOverflow);
    }

    if inner.zones.len() >= inner.config.max_zones {
        inner.log.record(
            AllocatorLogLevel::Warn,
            "zone.table_exhausted",
            None,
            None,
            Some(size),
            format!("max_zones={} already in use", inner.config.max_zones),
        );
        return Err(AllocatorError::ZoneTableExhausted {
            max_zones: inner.config.max_zones,
        });
    }

    let index = inner.zones.len() as u32;
    let config = inner.config.clone();
    let zone = crate::zone::Zone::new(index, size, internal, &config, &mut inner.rng);
    inner.zones.push(zone);
    inner.log.record(
        AllocatorLogLevel::Info,
        "zone.create",
        Some(index),
        None,
        Some(size),
        format!("internal={internal}"),
    );
    Ok(ZoneHandle::encode(index, inner.zone_handle_mask))
}

/// Creates whatever zone a fresh allocation of `requested` bytes needs:
/// the smallest default size class `>= requested`, or — if `requested`
/// exceeds every default class — a dedicated zone sized to `requested`
/// (§4.G.2 point 2). Zone-table exhaustion here is unrecoverable resource
/// exhaustion on the allocation path, not the caller-facing `new_zone`
/// Result path, so it aborts.
fn create_zone_for_size(inner: &mut RootInner, requested: usize) -> usize {
    let default_zones = inner.config.default_zones.clone();
    for class in default_zones {
        if requested <= class {
            return match new_zone_locked(inner, class, true) {
                Ok(handle) => handle.decode(inner.zone_handle_mask) as usize,
                Err(_) => record_fatal(
                    &mut inner.log,
                    "abort.zone_creation_failed",
                    None,
                    None,
                    Some(class),
                    format!("failed to create a default zone for size class {class}"),
                ),
            };
        }
    }
    match new_zone_locked(inner, requested, true) {
        Ok(handle) => handle.decode(inner.zone_handle_mask) as usize,
        Err(_) => record_fatal(
            &mut inner.log,
            "abort.zone_creation_failed",
            None,
            None,
            Some(requested),
            format!("failed to create a dedicated zone for {requested} bytes"),
        ),
    }
}

fn alloc_locked(inner: &mut RootInner, zone_hint: Option<ZoneHandle>, size: usize) -> *mut u8 {
    abort_if_shutdown(inner, "alloc", None, Some(size));

    let zone_idx = match zone_hint {
        Some(handle) => {
            let idx = handle.decode(inner.zone_handle_mask) as usize;
            if idx >= inner.zones.len() {
                record_fatal(
                    &mut inner.log,
                    "abort.invalid_zone_handle",
                    None,
                    None,
                    Some(size),
                    format!("handle decodes to out-of-range index {idx}"),
                );
            }
            if !is_zone_usable(inner, idx, size) {
                // "give up" per §4.G.2 point 3 — no fallthrough to other zones.
                return std::ptr::null_mut();
            }
            idx
        }
        None => match find_zone_fit(inner, size) {
            Some(idx) => idx,
            None => create_zone_for_size(inner, size),
        },
    };

    let RootInner { zones, log, .. } = inner;
    let zone = &mut zones[zone_idx];

    let free_bit_slot = zone.next_free_bit_slot();
    if free_bit_slot == BAD_BIT_SLOT {
        return std::ptr::null_mut();
    }

    zone.unmask();
    zone.clear_next_free_bit_slot();

    let bitmap_ptr = zone.bitmap_ptr();
    let p = bitmap::pointer_from_bitslot(zone.user_pages_start(), zone.chunk_size, free_bit_slot);

    if p > zone.user_pages_end() {
        record_fatal(
            log,
            "abort.alloc_out_of_range",
            Some(zone.index),
            Some(p),
            Some(size),
            format!("bit slot {free_bit_slot} resolves beyond this zone's user pages"),
        );
    }

    // SAFETY: `free_bit_slot` was primed by this zone's own cache/scan logic
    // above, so it names a chunk-pair inside this zone's live bitmap mapping.
    let already_in_use = unsafe { bitmap::is_in_use(bitmap_ptr, free_bit_slot) };
    if already_in_use {
        record_fatal(
            log,
            "abort.alloc_bit_already_set",
            Some(zone.index),
            Some(p),
            Some(size),
            "in-use bit already set for a slot the cache/scan reported free".to_string(),
        );
    }

    // SAFETY: same bound as above.
    let reused = unsafe { bitmap::was_used(bitmap_ptr, free_bit_slot) };
    if reused {
        // SAFETY: `p` names a live chunk of `zone.chunk_size` bytes.
        let check =
            unsafe { canary::check_canary_no_abort(zone.canary_secret, zone.chunk_size, p as *mut u8) };
        if let Err(mismatch) = check {
            record_fatal(
                log,
                "abort.canary_mismatch_on_reuse",
                Some(zone.index),
                Some(p),
                Some(size),
                format!("{mismatch:?}"),
            );
        }
        // Erase the canary before handing the chunk back to the caller.
        // SAFETY: `p` is writable for at least `CANARY_SIZE` bytes.
        unsafe { std::ptr::write_bytes(p as *mut u8, 0, CANARY_SIZE) };
    }

    // SAFETY: bounds established above; `bitmap_ptr` is this zone's live
    // bitmap mapping.
    unsafe {
        bitmap::set_in_use(bitmap_ptr, free_bit_slot);
        bitmap::unset_was_used(bitmap_ptr, free_bit_slot);
    }

    log.record(
        AllocatorLogLevel::Trace,
        "alloc",
        Some(zone.index),
        Some(p),
        Some(size),
        format!("chunk_size={} reused={reused}", zone.chunk_size),
    );

    zone.mask();
    p as *mut u8
}

/// `iso_find_zone_range`: resolves `p` to the unique zone whose user region
/// contains it. The scan runs one iteration past the last valid zone and
/// aborts there if reached, matching the reference's defensive redundancy
/// (§9 ambiguity, preserved as stated).
fn find_zone_range(inner: &mut RootInner, p: usize) -> usize {
    let zone_count = inner.zones.len();
    for idx in 0..=zone_count {
        if idx == zone_count {
            record_fatal(
                &mut inner.log,
                "abort.free_unknown_pointer",
                None,
                Some(p),
                None,
                format!("pointer {p:#x} was not allocated by this allocator"),
            );
        }
        let zone = &mut inner.zones[idx];
        zone.unmask();
        let contains = zone.contains(p);
        zone.mask();
        if contains {
            return idx;
        }
    }
    unreachable!("loop above always returns or aborts")
}

fn free_locked(inner: &mut RootInner, p: usize, permanent: bool) {
    abort_if_shutdown(inner, "free", Some(p), None);

    let zone_idx = find_zone_range(inner, p);

    let RootInner { zones, log, .. } = inner;
    let zone = &mut zones[zone_idx];
    zone.unmask();

    if p % ALIGNMENT != 0 {
        record_fatal(
            log,
            "abort.misaligned_free",
            Some(zone.index),
            Some(p),
            None,
            format!("pointer is not {ALIGNMENT}-byte aligned"),
        );
    }

    let chunk_offset = p - zone.user_pages_start();
    if chunk_offset % zone.chunk_size != 0 {
        record_fatal(
            log,
            "abort.unaligned_chunk_free",
            Some(zone.index),
            Some(p),
            None,
            format!(
                "offset {chunk_offset} is not a multiple of chunk size {}",
                zone.chunk_size
            ),
        );
    }

    let chunk_number = chunk_offset / zone.chunk_size;
    if chunk_number >= zone.chunk_count {
        record_fatal(
            log,
            "abort.free_bit_slot_out_of_range",
            Some(zone.index),
            Some(p),
            None,
            format!("chunk {chunk_number} is outside this zone's {} chunks", zone.chunk_count),
        );
    }
    let bit_slot = (chunk_number * BITS_PER_CHUNK as usize) as u32;

    let bitmap_ptr = zone.bitmap_ptr();

    // SAFETY: `chunk_number < zone.chunk_count` bounds the bitmap access.
    let in_use = unsafe { bitmap::is_in_use(bitmap_ptr, bit_slot) };
    if !in_use {
        record_fatal(
            log,
            "abort.double_free",
            Some(zone.index),
            Some(p),
            None,
            "in-use bit already clear — double free".to_string(),
        );
    }

    // SAFETY: same bound as above.
    unsafe {
        bitmap::set_was_used(bitmap_ptr, bit_slot);
        if !permanent {
            bitmap::unset_in_use(bitmap_ptr, bit_slot);
        }
    }

    // SAFETY: `p` names a live chunk of `zone.chunk_size` writable bytes.
    unsafe { std::ptr::write_bytes(p as *mut u8, POISON_BYTE, zone.chunk_size) };
    // SAFETY: same.
    unsafe { canary::write_canary(zone.canary_secret, zone.chunk_size, p as *mut u8) };

    // Opportunistic neighbor audit: every free is a partial integrity check.
    if chunk_number + 1 < zone.chunk_count {
        let over_slot = ((chunk_number + 1) * BITS_PER_CHUNK as usize) as u32;
        // SAFETY: `chunk_number + 1 < chunk_count` bounds this access.
        if unsafe { bitmap::was_used(bitmap_ptr, over_slot) } {
            let p_over =
                bitmap::pointer_from_bitslot(zone.user_pages_start(), zone.chunk_size, over_slot);
            // SAFETY: `p_over` is a live chunk inside this zone's user region.
            let check = unsafe {
                canary::check_canary_no_abort(zone.canary_secret, zone.chunk_size, p_over as *mut u8)
            };
            if let Err(mismatch) = check {
                record_fatal(
                    log,
                    "abort.neighbor_canary_mismatch",
                    Some(zone.index),
                    Some(p_over),
                    None,
                    format!("{mismatch:?}"),
                );
            }
        }
    }
    if chunk_number > 0 {
        let under_slot = ((chunk_number - 1) * BITS_PER_CHUNK as usize) as u32;
        // SAFETY: `chunk_number > 0` bounds this access.
        if unsafe { bitmap::was_used(bitmap_ptr, under_slot) } {
            let p_under =
                bitmap::pointer_from_bitslot(zone.user_pages_start(), zone.chunk_size, under_slot);
            // SAFETY: `p_under` is a live chunk inside this zone's user region.
            let check = unsafe {
                canary::check_canary_no_abort(zone.canary_secret, zone.chunk_size, p_under as *mut u8)
            };
            if let Err(mismatch) = check {
                record_fatal(
                    log,
                    "abort.neighbor_canary_mismatch",
                    Some(zone.index),
                    Some(p_under),
                    None,
                    format!("{mismatch:?}"),
                );
            }
        }
    }

    if zone.free_cache_insert(bit_slot) {
        record_fatal(
            log,
            "abort.free_cache_duplicate",
            Some(zone.index),
            Some(p),
            None,
            "bit slot already present in the free cache — corruption or double free".to_string(),
        );
    }

    zone.is_full = false;
    log.record(
        AllocatorLogLevel::Trace,
        "free",
        Some(zone.index),
        Some(p),
        None,
        format!("permanent={permanent}"),
    );
    zone.mask();
}

fn verify_all_zones_locked(inner: &mut RootInner) {
    abort_if_shutdown(inner, "verify_all_zones", None, None);

    let zone_count = inner.zones.len();
    for idx in 0..zone_count {
        let RootInner { zones, log, .. } = inner;
        let zone = &mut zones[idx];
        let result = zone.with_unmasked(|z| z.verify());
        if let Err((slot, mismatch)) = result {
            record_fatal(
                log,
                "abort.verify_canary_mismatch",
                Some(zone.index),
                Some(slot as usize),
                None,
                format!("{mismatch:?}"),
            );
        }
    }
}

// --- Public engine surface (component G + the §4.L safe shim) ---

/// Allocates `size` bytes with a `next_free_bit_slot` hint from a specific
/// zone. `None` behaves like a hint-free request. Exposed so callers (and
/// tests) that already hold a [`ZoneHandle`] can target it directly, the way
/// the reference's `_iso_alloc(zone, size)` accepts an optional zone.
pub fn alloc_in_zone(zone_hint: Option<ZoneHandle>, size: usize) -> *mut u8 {
    let root = global_root();
    let mut inner = root.lock();
    alloc_locked(&mut inner, zone_hint, size)
}

/// Allocates `size` bytes, alignment `>= ALIGNMENT`, contents indeterminate.
pub fn alloc(size: usize) -> *mut u8 {
    alloc_in_zone(None, size)
}

/// Allocates `nmemb * size` zero-filled bytes. Aborts on multiplication
/// overflow (§7 Overflow row).
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            let root = global_root();
            let mut inner = root.lock();
            record_fatal(
                &mut inner.log,
                "abort.calloc_overflow",
                None,
                None,
                None,
                format!("nmemb={nmemb} size={size} overflows"),
            );
        }
    };
    let p = alloc(total);
    if !p.is_null() {
        // SAFETY: `alloc` returns a chunk of at least `total` writable bytes.
        unsafe { std::ptr::write_bytes(p, 0, total) };
    }
    p
}

/// Releases `p`. A `NULL` pointer is a no-op. Aborts on any detected
/// corruption (double free, cross-zone pointer, misalignment, bad stride).
pub fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let root = global_root();
    let mut inner = root.lock();
    free_locked(&mut inner, p as usize, false);
}

/// Releases `p`, marking its slot permanently unreclaimable — it is never
/// handed back by a future allocation; an attacker who later walks the
/// bitmap sees only a canary chunk.
pub fn free_permanently(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let root = global_root();
    let mut inner = root.lock();
    free_locked(&mut inner, p as usize, true);
}

/// Returns the size class backing `p`, or `0` for `NULL`. Aborts if `p`
/// wasn't allocated by this allocator.
pub fn chunk_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }
    let root = global_root();
    let mut inner = root.lock();
    abort_if_shutdown(&mut inner, "chunk_size", Some(p as usize), None);
    let idx = find_zone_range(&mut inner, p as usize);
    inner.zones[idx].chunk_size
}

/// Explicit integrity check: verifies every chunk whose "was used" bit is
/// set still carries a valid canary. Aborts on the first mismatch found.
pub fn verify_all_zones() {
    let root = global_root();
    let mut inner = root.lock();
    verify_all_zones_locked(&mut inner);
}

/// Freezes the allocator: subsequent access to the root's sentinel region
/// faults until [`unprotect_root`] is called.
pub fn protect_root() {
    let root = global_root();
    let mut inner = root.lock();
    abort_if_shutdown(&mut inner, "protect_root", None, None);
    inner.protect_root();
}

/// Thaws the allocator after [`protect_root`].
pub fn unprotect_root() {
    let root = global_root();
    let mut inner = root.lock();
    abort_if_shutdown(&mut inner, "unprotect_root", None, None);
    inner.unprotect_root();
}

/// Creates a dedicated zone for `size`-byte chunks. `internal == false`
/// marks the zone as externally managed: the engine will never destroy it
/// by unmapping, only revoke access to it (§4.E).
///
/// This is the one operation in the public surface that returns a
/// [`Result`] instead of aborting — ordinary `MAX_ZONES` exhaustion here is
/// resource exhaustion, not corruption (§4.K).
pub fn new_zone(size: usize, internal: bool) -> Result<ZoneHandle, AllocatorError> {
    let root = global_root();
    let mut inner = root.lock();
    new_zone_locked(&mut inner, size, internal)
}
