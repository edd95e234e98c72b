//! Domain events and the consumer registration contract.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{Consumer, ConsumerReport, Dispatcher};
pub use types::{DomainEvent, EventType};
