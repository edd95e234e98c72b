#![allow(clippy::needless_return)]
#![allow(clippy::len_zero)]
// src/lib.rs

pub mod core;
pub mod detection;
pub mod events;
pub mod logging;
pub mod storage;

pub use crate::core::{DetectionConfig, DetectionError, Result};
pub use crate::detection::{register_all, GeneratedSignal, SignalType};
pub use crate::events::{Consumer, Dispatcher, DomainEvent, EventType};
