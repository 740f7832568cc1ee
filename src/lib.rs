pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod github;
pub mod guide;
pub mod log;
pub mod orchestration;
pub mod ports;
pub mod util;

pub use error::{Error, Result};
