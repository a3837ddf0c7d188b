//! Adapters for the outbound ports.

pub mod processor;
pub mod store;

pub use processor::LoggingProcessor;
pub use store::{FileEventStore, InMemoryEventStore};
