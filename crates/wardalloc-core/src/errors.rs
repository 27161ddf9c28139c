//! The one error surface this crate exposes that is not an abort.
//!
//! Every corruption, invariant violation, or overflow is fatal by design
//! (§ design stance: an observed anomaly is treated as active exploitation).
//! The sole exception is ordinary resource exhaustion while constructing a
//! new zone, which a caller can reasonably be expected to handle.

use thiserror::Error;

/// Recoverable failure surfaced by [`crate::engine::new_zone`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("zone table exhausted ({max_zones} zones already in use)")]
    ZoneTableExhausted { max_zones: usize },
    #[error("requested size class overflows a usize")]
    SizeClassOverflow,
}
