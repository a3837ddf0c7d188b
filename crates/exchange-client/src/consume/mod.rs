//! Inbound consume: deduplicating, explicitly acknowledged slot loop.

pub mod machine;
pub mod workflow;

pub use machine::{classify, Disposition, SlotEvent, SlotMachine, SlotOutcome, SlotState};
pub use workflow::{ConsumeReport, ConsumeWorkflow, StopReason};
