//! Property-based uniqueness check: drive a long seeded sequence of
//! alloc/free/calloc operations against a `HashSet<usize>` model of "which
//! addresses are currently live", and assert the allocator never hands out
//! an address already in that set (§8 Uniqueness).

use std::collections::HashSet;

use wardalloc_core::Allocator;

/// A small linear-congruential generator, deterministic from a fixed seed,
/// used only to pick operations and sizes for this trace — not the
/// allocator's own randomness source.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }

    fn next_below(&mut self, bound: usize) -> usize {
        (self.next_u64() as usize) % bound
    }
}

#[test]
fn alloc_free_trace_never_hands_out_a_live_address() {
    let allocator = Allocator::get();
    let mut rng = Lcg(0xC0FF_EE15_5EED_u64);
    let sizes: &[usize] = &[8, 16, 24, 40, 64, 100, 200, 513, 1200];

    let mut live: HashSet<usize> = HashSet::new();
    let mut handles: Vec<*mut u8> = Vec::new();

    for _ in 0..20_000 {
        // Roughly balance allocation and freeing so the live set stays
        // bounded instead of growing without end.
        let should_alloc = handles.is_empty() || rng.next_below(3) != 0;

        if should_alloc {
            let size = sizes[rng.next_below(sizes.len())];
            let p = if rng.next_below(4) == 0 {
                allocator.calloc(1, size)
            } else {
                allocator.alloc(size)
            };
            assert!(!p.is_null(), "allocator should not fail on an ordinary request");
            let addr = p as usize;
            assert!(
                live.insert(addr),
                "address {addr:#x} returned by alloc is already live — uniqueness violated"
            );
            handles.push(p);
        } else {
            let idx = rng.next_below(handles.len());
            let p = handles.swap_remove(idx);
            let addr = p as usize;
            assert!(live.remove(&addr), "freed address {addr:#x} was not tracked as live");
            allocator.free(p);
        }
    }

    for p in handles {
        live.remove(&(p as usize));
        allocator.free(p);
    }
    assert!(live.is_empty());
}

#[test]
fn alloc_free_trace_respects_alignment_and_size_class_monotonicity() {
    let allocator = Allocator::get();
    let mut rng = Lcg(0x1234_5678_9abc_def0);
    let sizes: &[usize] = &[8, 33, 65, 129, 257, 1025, 4097];

    for _ in 0..2_000 {
        let size = sizes[rng.next_below(sizes.len())];
        let p = allocator.alloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0, "every pointer must be 8-byte aligned");
        let class = allocator.chunk_size(p);
        assert!(class >= size, "chunk_size {class} must be >= requested {size}");
        allocator.free(p);
    }
}
