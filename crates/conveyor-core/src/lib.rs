pub mod artifacts;
pub mod config;
pub mod handoff;
pub mod task;
pub mod types;

pub use config::Config;
pub use handoff::{Handoff, HandoffUpdate, NextStep};
pub use types::*;
