//! rollgate-platform: the external systems a pipeline talks to.
//!
//! Every stage executor reaches the outside world through one of three
//! object-safe traits:
//!
//! ```text
//! InfrastructurePlatform   apply_stack / describe_stack
//! ClusterPlatform          update_service / describe_service / list_tasks
//!                          register_revision / describe_revision
//! GateSuite                execute(suite_id, base_url)
//! ```
//!
//! # Implementations
//!
//! - **`SandboxPlatform`**: in-process infrastructure + cluster platform.
//!   It keeps an append-only revision store per family, applies stacks
//!   idempotently, and simulates rolling updates that converge (or trip a
//!   circuit breaker) over successive `describe_service` polls.
//! - **`CommandSuite`**: runs a configured test command against a base URL.
//! - **`ScriptedSuite`**: returns pre-recorded outcomes per suite id.

pub mod api;
pub mod error;
pub mod sandbox;
pub mod suite;

pub use api::*;
pub use error::{PlatformError, PlatformResult};
pub use sandbox::{RolloutBehavior, SandboxPlatform, StackBinding};
pub use suite::{CommandSuite, ScriptedSuite};
