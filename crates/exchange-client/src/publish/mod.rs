//! Outbound publish: one event, one correlated reply, bounded retries.

pub mod machine;
pub mod workflow;

pub use machine::{PublishFailure, PublishMachine, PublishState};
pub use workflow::{PublishOptions, PublishReceipt, PublishWorkflow, UndeliverableLogger};
