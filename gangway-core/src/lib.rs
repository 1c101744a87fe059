#[macro_use]
mod error;
pub use error::{AnyError, AnyResult, ControlError};

pub mod config;
pub mod http;
pub mod listener;
pub mod orchestrator;
pub mod util;
