//! The IPAM allocation engine.
//!
//! Three layers, leaves first:
//!
//! - **`cidr`** — CIDR parsing and address arithmetic, including the
//!   per-family host-range reservation rules.
//! - **`bitmap`** — the per-network free pool: a word-packed bit array
//!   with first-fit single and contiguous-run scans.
//! - **`allocator`** — the engine itself: request validation, first-fit
//!   policy, TTL stamping, release, cascade, and utilization reporting
//!   over any [`ipam_store::Store`] backend.

pub mod allocator;
pub mod bitmap;
pub mod cidr;

pub use allocator::Ipam;
pub use bitmap::FreePool;
pub use cidr::{Cidr, MAX_POOL_SLOTS};
