pub mod config;
pub mod duration;
pub mod run;
pub mod types;

pub use config::{Config, ConfigError};
pub use run::{PipelineRun, PipelineRunBuilder};
pub use types::*;
