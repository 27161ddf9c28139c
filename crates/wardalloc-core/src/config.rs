//! Runtime-tunable knobs, read once at root construction.
//!
//! None of these are mutable after the root exists — varying them mid-life
//! would change the address-space layout a caller may already have reasoned
//! about, so [`AllocatorConfig`] is consumed, not held, by [`crate::root::Root`].

/// Minimum alignment guaranteed for every returned pointer.
pub const ALIGNMENT: usize = 8;
/// State bits stored per chunk in the bitmap.
pub const BITS_PER_CHUNK: u32 = 2;
/// Bits per bitmap word.
pub const BITS_PER_DWORD: u32 = 32;
/// Chunk-pairs per bitmap word.
pub const CHUNKS_PER_DWORD: u32 = BITS_PER_DWORD / BITS_PER_CHUNK;
/// Sentinel bit-slot meaning "no free slot known".
pub const BAD_BIT_SLOT: u32 = u32::MAX;
/// Width of a canary, in bytes.
pub const CANARY_SIZE: usize = 8;
/// Byte value written over a chunk's body on free.
pub const POISON_BYTE: u8 = 0xDE;
/// Chunk-size cutoff below which the waste-avoidance check never rejects a zone.
pub const ZONE_1024: usize = 1024;
/// Chunk size above which a zone is too coarse to host canary chunks.
pub const MAX_DEFAULT_ZONE_SZ: usize = 1024 * 1024;

/// Environment-tunable allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// User-region size per zone, in bytes.
    pub zone_user_size: usize,
    /// Capacity of the root's zone table.
    pub max_zones: usize,
    /// Per-zone free bit-slot cache capacity.
    pub bit_slot_cache_sz: usize,
    /// Reciprocal of the canary-chunk density (1/N of chunks become canaries).
    pub canary_count_div: usize,
    /// Multiplier past which a zone is judged "too wasteful" for a request.
    pub wasted_sz_multiplier: usize,
    /// Default size classes created at initialization.
    pub default_zones: Vec<usize>,
    /// Bound on the in-process lifecycle log ring (component I).
    pub log_capacity: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            zone_user_size: 4 * 1024 * 1024,
            max_zones: 2048,
            bit_slot_cache_sz: 255,
            canary_count_div: 100,
            wasted_sz_multiplier: 8,
            default_zones: vec![16, 32, 64, 128, 256, 512, 1024, 2048, 4096],
            log_capacity: 4096,
        }
    }
}

impl AllocatorConfig {
    /// Builds a configuration from `WARDALLOC_*` environment variables,
    /// falling back field-by-field to [`AllocatorConfig::default`] on any
    /// parse failure. A malformed knob is a configuration mistake, not
    /// corruption, so it never aborts — it is silently ignored.
    pub fn from_env() -> Self {
        let defaults = AllocatorConfig::default();
        AllocatorConfig {
            zone_user_size: env_usize("WARDALLOC_ZONE_USER_SIZE").unwrap_or(defaults.zone_user_size),
            max_zones: env_usize("WARDALLOC_MAX_ZONES").unwrap_or(defaults.max_zones),
            bit_slot_cache_sz: env_usize("WARDALLOC_BIT_SLOT_CACHE_SZ")
                .unwrap_or(defaults.bit_slot_cache_sz),
            canary_count_div: env_usize("WARDALLOC_CANARY_COUNT_DIV")
                .unwrap_or(defaults.canary_count_div),
            wasted_sz_multiplier: env_usize("WARDALLOC_WASTED_SZ_MULTIPLIER")
                .unwrap_or(defaults.wasted_sz_multiplier),
            ..defaults
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_zones_are_sorted_and_nonempty() {
        let cfg = AllocatorConfig::default();
        assert!(!cfg.default_zones.is_empty());
        for w in cfg.default_zones.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn malformed_env_falls_back_to_default() {
        unsafe {
            std::env::set_var("WARDALLOC_MAX_ZONES", "not-a-number");
        }
        let cfg = AllocatorConfig::from_env();
        assert_eq!(cfg.max_zones, AllocatorConfig::default().max_zones);
        unsafe {
            std::env::remove_var("WARDALLOC_MAX_ZONES");
        }
    }
}
