//! Core building blocks shared by every detector: configuration and errors.

pub mod config;
pub mod errors;

pub use config::DetectionConfig;
pub use errors::{DetectionError, Result};
