//! # Consume Flows
//!
//! End-to-end consume runs against the in-memory broker: mailbox delivery,
//! duplicate suppression through the processed message ledger and explicit
//! acknowledgement.
//!
//! ## Scenarios
//!
//! 1. Same business id delivered twice
//! 2. Ledger shared between runs
//! 3. Processing failure, then a healed rerun
//! 4. Delivery without business id
//! 5. Mailbox runs dry before the requested count

#[cfg(test)]
mod tests {
    use super::super::support::*;
    use exchange_client::{
        ConsumeError, ConsumeWorkflow, PublishOptions, PublishWorkflow, SlotOutcome, StopReason,
    };
    use exchange_types::{Event, MessageProperties};
    use std::sync::Arc;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn workflow(harness: &Harness) -> ConsumeWorkflow {
        ConsumeWorkflow::new(
            harness.context.clone(),
            Arc::new(harness.broker.clone()),
            harness.inbound_store(),
            harness.processor.clone(),
        )
    }

    fn deliver(harness: &Harness, message_id: &str) {
        let properties = MessageProperties {
            message_id: Some(message_id.to_string()),
            ..Default::default()
        };
        harness
            .broker
            .enqueue(
                MAILBOX,
                Some(properties),
                format!("<Haendelsesbesked BeskedId=\"{}\"/>", message_id),
            )
            .unwrap();
    }

    // =============================================================================
    // SCENARIOS
    // =============================================================================

    /// The same id twice: processed once, acknowledged twice.
    #[tokio::test]
    async fn test_duplicate_delivery_processed_once() {
        let harness = Harness::new();
        deliver(&harness, "EVT-1");
        deliver(&harness, "EVT-1");

        let report = workflow(&harness).consume(2).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(
            report.slots,
            vec![
                SlotOutcome::Processed {
                    message_id: "EVT-1".into()
                },
                SlotOutcome::Duplicate {
                    message_id: "EVT-1".into()
                },
            ]
        );
        assert_eq!(harness.processor.processed(), vec!["EVT-1".to_string()]);
        assert_eq!(harness.inbound.len(), 1);
        assert_eq!(harness.broker.acks().len(), 2);
        assert!(harness.broker.nacks().is_empty());
        assert_eq!(harness.broker.queue_depth(MAILBOX), 0);
        assert_eq!(harness.broker.unacked_count(), 0);
        assert_eq!(harness.broker.open_channels(), 0);
    }

    /// A later run on the same context recognises ids from an earlier run.
    #[tokio::test]
    async fn test_ledger_survives_between_runs() {
        let harness = Harness::new();
        deliver(&harness, "EVT-2");
        let first = workflow(&harness).consume(1).await.unwrap();
        assert_eq!(first.processed, 1);

        deliver(&harness, "EVT-2");
        let second = workflow(&harness).consume(1).await.unwrap();

        assert_eq!(second.processed, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(harness.processor.processed().len(), 1);
        assert_eq!(harness.context.ledger().len(), 1);
        assert_eq!(harness.broker.acks().len(), 2);
        // both runs share the cached consume token
        assert_eq!(harness.issuer.calls(), 1);
    }

    /// A failed message stays in the mailbox and is processed by the next run.
    #[tokio::test]
    async fn test_processing_failure_then_rerun() {
        let harness = Harness::new();
        deliver(&harness, "EVT-3");
        harness.processor.fail_on("EVT-3");

        let err = workflow(&harness).consume(1).await.unwrap_err();
        assert!(matches!(
            err,
            ConsumeError::Processor { ref message_id, .. } if message_id == "EVT-3"
        ));
        assert!(err.is_recoverable());
        assert!(harness.broker.acks().is_empty());
        assert!(!harness.context.ledger().contains("EVT-3"));
        assert_eq!(harness.broker.queue_depth(MAILBOX), 1);

        harness.processor.heal();
        let report = workflow(&harness).consume(1).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(harness.processor.processed(), vec!["EVT-3".to_string()]);
        assert_eq!(harness.broker.acks().len(), 1);
        assert_eq!(harness.broker.queue_depth(MAILBOX), 0);
        // payload recorded by each run that reached processing
        assert_eq!(harness.inbound.len(), 2);
    }

    /// No business id: rejected without requeue and never processed.
    #[tokio::test]
    async fn test_missing_business_id_rejected() {
        let harness = Harness::new();
        harness
            .broker
            .enqueue(MAILBOX, Some(MessageProperties::default()), "<Haendelsesbesked/>")
            .unwrap();
        deliver(&harness, "EVT-4");

        let report = workflow(&harness).consume(2).await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.processed, 1);
        assert!(matches!(report.slots[0], SlotOutcome::Rejected { .. }));

        let nacks = harness.broker.nacks();
        assert_eq!(nacks.len(), 1);
        assert!(!nacks[0].requeue);
        assert_eq!(harness.broker.dead_letters().len(), 1);
        assert_eq!(harness.processor.processed(), vec!["EVT-4".to_string()]);
    }

    /// Fewer messages than requested: the idle slot spends its budget and the run stops.
    #[tokio::test]
    async fn test_mailbox_runs_dry() {
        let harness = Harness::new();
        deliver(&harness, "EVT-5");

        let report = workflow(&harness).consume(3).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.slots.len(), 1);
        assert_eq!(
            report.stop_reason,
            StopReason::SlotBudgetExhausted {
                slot: 2,
                attempts: 3
            }
        );
        assert_eq!(harness.broker.channels_opened(), 1);
        assert_eq!(harness.broker.open_channels(), 0);
    }

    /// Configured message count drives `run`.
    #[tokio::test]
    async fn test_run_uses_configured_count() {
        let mut config = config();
        config.consume.messages = 2;
        let harness = Harness::with_config(config);
        for id in ["EVT-6", "EVT-7", "EVT-8"] {
            deliver(&harness, id);
        }

        let report = workflow(&harness).run().await.unwrap();

        assert_eq!(report.requested, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(
            harness.processor.processed(),
            vec!["EVT-6".to_string(), "EVT-7".to_string()]
        );
        assert_eq!(harness.broker.queue_depth(MAILBOX), 1);
    }

    /// One context serves both directions with a token per resource.
    #[tokio::test]
    async fn test_publish_and_consume_share_context() {
        let harness = Harness::new();
        harness.script(Vec::new(), vec![answer(20)]);
        deliver(&harness, "EVT-9");

        let publisher = PublishWorkflow::new(
            harness.context.clone(),
            Arc::new(harness.broker.clone()),
            harness.outbound_store(),
        );
        publisher
            .publish(
                Event::new("EVT-10", b"<Haendelsesbesked/>".to_vec()),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        workflow(&harness).consume(1).await.unwrap();

        let resources: Vec<_> = harness
            .issuer
            .requests()
            .into_iter()
            .map(|r| r.resource)
            .collect();
        assert_eq!(resources, vec![PUBLISH_RESOURCE, CONSUME_RESOURCE]);
        assert_eq!(harness.outbound.len(), 1);
        assert_eq!(harness.inbound.len(), 1);
    }
}
