pub mod contract;
pub mod controller;
pub mod error;
pub mod plan;
pub mod planner;
pub mod progress;
pub mod validate;

pub use controller::{RunEngine, RunRequest};
pub use error::EngineError;
