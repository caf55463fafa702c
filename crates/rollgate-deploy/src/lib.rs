//! rollgate-deploy: the stage executors a pipeline sequences.
//!
//! # Components
//!
//! - **`stack`** (`StackDeployer`): idempotent stack apply, resolves the
//!   environment endpoint and declared revision from stack outputs
//! - **`updater`** (`ServiceUpdater`): triggers a rolling update and polls
//!   until stable, timed out, or rejected by the circuit breaker
//! - **`gate`** (`GateRunner`): settle delay, then one suite execution
//! - **`rollback`** (`RollbackResolver`): re-registers the previous
//!   revision's definition as a new revision
//!
//! Executors mutate the `Environment` they are handed; the caller owns it
//! and must not run two executors against the same environment at once.

pub mod error;
pub mod gate;
pub mod rollback;
pub mod stack;
pub mod updater;

#[cfg(test)]
mod testing;

pub use error::{DeployError, DeployResult};
pub use gate::{GateResult, GateRunner};
pub use rollback::RollbackResolver;
pub use stack::{StackApplied, StackDeployer};
pub use updater::{ServiceState, ServiceUpdater};
