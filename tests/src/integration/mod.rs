//! Cross-crate scenarios.

pub mod consume_flows;
pub mod publish_flows;
pub mod support;
