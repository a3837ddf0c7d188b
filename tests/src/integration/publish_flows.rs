//! # Publish Flows
//!
//! End-to-end publish runs: token cache, connection manager and publish
//! workflow against the in-memory broker with a scripted exchange.
//!
//! ## Scenarios
//!
//! 1. Reply 20 on the first attempt
//! 2. Two timeouts, then 20
//! 3. Token expired (41), renewal, then 20
//! 4. Budget exhausted by timeouts
//! 5. Token expiry between publishes

#[cfg(test)]
mod tests {
    use super::super::support::*;
    use chrono::Duration;
    use exchange_bus::{Reply, ScriptedResponder};
    use exchange_client::{
        reply, FileEventStore, PublishError, PublishOptions, PublishWorkflow,
    };
    use exchange_types::{Event, TOKEN_HEADER, TRANSACTION_HEADER};
    use std::collections::HashSet;
    use std::sync::Arc;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn workflow(harness: &Harness) -> PublishWorkflow {
        PublishWorkflow::new(
            harness.context.clone(),
            Arc::new(harness.broker.clone()),
            harness.outbound_store(),
        )
    }

    fn event(id: &str) -> Event {
        Event::new(id, format!("<Haendelsesbesked BeskedId=\"{}\"/>", id).into_bytes())
    }

    // =============================================================================
    // SCENARIOS
    // =============================================================================

    /// Reply 20 on the first attempt persists once, with no renewals.
    #[tokio::test]
    async fn test_first_attempt_success() {
        let harness = Harness::new();
        harness.script(Vec::new(), vec![answer(20)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haendelsesbesked-afsend.xml");
        let workflow = PublishWorkflow::new(
            harness.context.clone(),
            Arc::new(harness.broker.clone()),
            Arc::new(FileEventStore::new(&path)),
        );

        let receipt = workflow
            .publish(event("MSG-1"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.message_id, "MSG-1");
        assert_eq!(receipt.attempts, 1);
        assert_eq!(receipt.renewals, 0);
        assert_eq!(receipt.reconnects, 0);
        assert_eq!(harness.issuer.calls(), 1);

        let stored = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(stored, "<Haendelsesbesked BeskedId=\"MSG-1\"/>\n");
        assert_eq!(harness.broker.open_channels(), 0);
    }

    /// Two timeouts then 20: two reconnects, three attempts, one transaction.
    #[tokio::test]
    async fn test_timeouts_then_success() {
        let harness = Harness::new();
        harness.script(vec![Vec::new(), Vec::new()], vec![answer(20)]);

        let receipt = workflow(&harness)
            .publish(event("MSG-2"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.reconnects, 2);
        assert_eq!(receipt.renewals, 0);
        assert_eq!(harness.outbound.len(), 1);

        let published = harness.broker.published();
        assert_eq!(published.len(), 3);

        let transactions: HashSet<_> = published
            .iter()
            .map(|m| m.properties.header(TRANSACTION_HEADER).map(str::to_string))
            .collect();
        assert_eq!(transactions.len(), 1);
        assert!(transactions.contains(&Some(receipt.transaction_id.to_string())));

        let correlations: HashSet<_> = published
            .iter()
            .map(|m| m.properties.correlation_id.clone())
            .collect();
        assert_eq!(correlations.len(), 3);

        assert_eq!(harness.broker.channels_opened(), 3);
        assert_eq!(harness.broker.open_channels(), 0);
    }

    /// Status 41 once, then 20: one renewal, one reconnect, new token presented.
    #[tokio::test]
    async fn test_token_expired_then_success() {
        let harness = Harness::new();
        harness.script(vec![vec![answer(41)]], vec![answer(20)]);

        let receipt = workflow(&harness)
            .publish(event("MSG-3"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.renewals, 1);
        assert_eq!(receipt.reconnects, 1);
        assert_eq!(receipt.attempts, 2);
        assert_eq!(harness.issuer.calls(), 2);
        assert_eq!(harness.outbound.len(), 1);

        let published = harness.broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(
            published[0].properties.header(TRANSACTION_HEADER),
            published[1].properties.header(TRANSACTION_HEADER)
        );
        assert_ne!(
            published[0].properties.header(TOKEN_HEADER),
            published[1].properties.header(TOKEN_HEADER)
        );

        // the reopened session authenticates with the renewed token
        let connects = harness.broker.connect_log();
        assert_eq!(connects.len(), 2);
        assert_eq!(
            Some(connects[1].sasl.response.as_str()),
            published[1].properties.header(TOKEN_HEADER)
        );
    }

    /// Three timeouts with budget 3: retry exhausted, nothing persisted, session closed.
    #[tokio::test]
    async fn test_budget_exhausted() {
        let harness = Harness::new();
        harness
            .broker
            .bind_exchange(EXCHANGE, Arc::new(ScriptedResponder::silent()));

        let err = workflow(&harness)
            .publish(event("MSG-4"), PublishOptions::default())
            .await
            .unwrap_err();

        match &err {
            PublishError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 3);
                assert!(last.contains("No reply"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_recoverable());
        assert!(harness.outbound.is_empty());
        assert_eq!(harness.broker.published().len(), 3);
        assert_eq!(harness.broker.open_channels(), 0);
        assert_eq!(
            harness.broker.channels_closed(),
            harness.broker.channels_opened()
        );
    }

    /// Repeated 41 spends the budget on renewals.
    #[tokio::test]
    async fn test_persistent_token_expiry_exhausts_budget() {
        let harness = Harness::new();
        harness.script(Vec::new(), vec![answer(41)]);

        let err = workflow(&harness)
            .publish(event("MSG-5"), PublishOptions::default())
            .await
            .unwrap_err();

        match &err {
            PublishError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last, "Token expired");
            }
            other => panic!("unexpected error: {other}"),
        }
        // one initial fetch plus a renewal for every 41, the last one included
        assert_eq!(harness.issuer.calls(), 4);
        // no session is opened for the renewal that follows the final 41
        assert_eq!(harness.broker.channels_opened(), 3);
        assert!(harness.outbound.is_empty());
    }

    /// Late replies from an earlier attempt never confirm a later one.
    #[tokio::test]
    async fn test_stale_reply_after_timeout() {
        let harness = Harness::new();
        harness.script(
            vec![Vec::new(), vec![Reply::Stale(reply::render(20, None)), answer(20)]],
            Vec::new(),
        );

        let receipt = workflow(&harness)
            .publish(event("MSG-6"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.attempts, 2);
        assert_eq!(harness.outbound.len(), 1);
    }

    /// Cached token is reused until it expires, then fetched once.
    #[tokio::test]
    async fn test_token_reused_until_expiry() {
        let harness = Harness::new();
        harness.script(Vec::new(), vec![answer(20)]);
        let workflow = workflow(&harness);

        workflow
            .publish(event("MSG-7"), PublishOptions::default())
            .await
            .unwrap();
        workflow
            .publish(event("MSG-8"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(harness.issuer.calls(), 1);

        harness.clock.advance(Duration::minutes(6));
        workflow
            .publish(event("MSG-9"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(harness.issuer.calls(), 2);

        let requests = harness.issuer.requests();
        assert!(requests
            .iter()
            .all(|r| r.principal == PRINCIPAL && r.resource == PUBLISH_RESOURCE));
        assert_eq!(harness.outbound.len(), 3);
    }

    /// A refused broker login is retried and exhausts the budget.
    #[tokio::test]
    async fn test_connect_refusal_exhausts_budget() {
        let harness = Harness::new();
        harness.script(Vec::new(), vec![answer(20)]);
        harness.broker.fail_next_connects(3);

        let err = workflow(&harness)
            .publish(event("MSG-10"), PublishOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::RetryExhausted { attempts: 3, .. }));
        assert!(harness.broker.published().is_empty());
        assert_eq!(harness.broker.connect_log().len(), 3);
    }
}
