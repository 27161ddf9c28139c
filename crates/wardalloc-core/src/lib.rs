//! Core of a hardened, zone-based, bitmap-managed memory allocator.
//!
//! Fixed-size-class zones bracketed by guard pages, a 2-bit-per-chunk state
//! bitmap, XOR-bound per-chunk canaries, and poison-on-free combine to
//! catch linear heap overflow, use-after-free, double-free, and bitmap
//! corruption as early as possible — and to abort rather than limp on once
//! one is caught. See `api` for the safe entry points.

pub mod api;
pub mod bitmap;
pub mod canary;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod free_cache;
pub mod rng;
pub mod root;
pub mod zone;

pub use api::{Allocator, WardAlloc};
pub use config::AllocatorConfig;
pub use diagnostics::{AllocatorLogLevel, AllocatorLogRecord};
pub use engine::ZoneHandle;
pub use errors::AllocatorError;
