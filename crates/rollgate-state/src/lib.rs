//! rollgate-state: embedded audit store for Rollgate.
//!
//! Backed by [redb](https://docs.rs/redb). Finished pipeline runs are kept
//! as the audit trail; leases keep a second run from starting against an
//! environment while one is in flight.
//!
//! Values are JSON in redb's `&[u8]` columns. Run keys embed the zero-padded
//! start time so a prefix scan over a family returns runs in start order.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{Lease, StateStore};
