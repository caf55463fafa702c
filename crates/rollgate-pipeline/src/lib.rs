//! Rollgate pipeline: promotes one artifact through staging and production.
//!
//! # Components
//!
//! - **`state`**: the pipeline states and the pure transition function
//! - **`controller`**: `PipelineController`, which walks the states and
//!   invokes one stage executor per state

pub mod controller;
pub mod state;

pub use controller::{ControllerSettings, PipelineController, Platforms, TriggerEvent};
pub use state::{PipelineState, RollbackIntent, StepOutcome, Transition, transition, transition_table};
