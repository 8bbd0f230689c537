// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for overlapping exchanges.
//!
//! Multiple queries may be in flight at once, and responses may complete
//! out of order. Each response must finalize exactly its own placeholder,
//! routed by the id captured at dispatch time.

use std::sync::Arc;
use std::time::Duration;

use chatloop::auth::StaticTokens;
use chatloop::config::SyncConfig;
use chatloop::http::ApiClient;
use chatloop::query::QueryDispatcher;
use chatloop::store::MessageStore;
use chatloop_mockd::{MockBackend, QueryScript, canned_response};
use chatloop_proto::message::{MessageId, MessageStatus, Role};

// =============================================================================
// Helpers
// =============================================================================

fn engine(backend: &MockBackend) -> (Arc<MessageStore>, Arc<QueryDispatcher>) {
    let cfg = Arc::new(SyncConfig {
        api_url: backend.api_url(),
        channel_url: backend.channel_url(),
        ..SyncConfig::default()
    });
    let tokens = Arc::new(StaticTokens::new("tok", "refresh"));
    let store = Arc::new(MessageStore::new());
    let api = Arc::new(ApiClient::new(cfg, tokens));
    let dispatcher = Arc::new(QueryDispatcher::new(api, Arc::clone(&store)));
    (store, dispatcher)
}

// =============================================================================
// Tests
// =============================================================================

/// The first query is answered after the second; both placeholders are
/// finalized with their own response.
#[tokio::test]
async fn out_of_order_responses_route_by_placeholder() {
    let backend = MockBackend::spawn().await.unwrap();
    // Scripts are consumed in request-arrival order: the first (slow)
    // request gets the delayed script, the second the immediate one.
    backend
        .script_query(QueryScript::Delayed {
            delay: Duration::from_millis(500),
            response: canned_response("c1", "slow-1", "slow answer"),
        })
        .await;
    backend
        .script_query(QueryScript::Answer(canned_response(
            "c1",
            "fast-1",
            "fast answer",
        )))
        .await;

    let (store, dispatcher) = engine(&backend);

    let slow_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send("slow question", None, vec![]).await })
    };
    // Ensure the slow request arrives first and consumes the delayed script.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fast = dispatcher.send("fast question", None, vec![]).await.unwrap();
    assert_eq!(fast.answer, "fast answer");

    // The fast exchange is done while the slow one is still in flight.
    let snapshot = store.messages();
    assert_eq!(snapshot.len(), 4);
    assert_eq!(snapshot[1].status, MessageStatus::Processing, "slow still pending");
    assert_eq!(snapshot[3].status, MessageStatus::Completed);
    assert_eq!(snapshot[3].id, MessageId::new("fast-1"));

    let slow = slow_task.await.unwrap().unwrap();
    assert_eq!(slow.answer, "slow answer");

    // Each response landed on its own exchange, in creation order.
    let finished = store.messages();
    assert_eq!(finished[0].content, "slow question");
    assert_eq!(finished[0].role, Role::User);
    assert_eq!(finished[1].id, MessageId::new("slow-1"));
    assert_eq!(finished[1].content, "slow answer");
    assert_eq!(finished[2].content, "fast question");
    assert_eq!(finished[3].id, MessageId::new("fast-1"));
    assert_eq!(finished[3].content, "fast answer");
    for msg in &finished {
        assert_eq!(msg.status, MessageStatus::Completed);
    }
}

/// Two overlapping exchanges answered into the same conversation share one
/// summary with both counted.
#[tokio::test]
async fn overlapping_exchanges_share_one_conversation_summary() {
    let backend = MockBackend::spawn().await.unwrap();
    backend
        .script_query(QueryScript::Delayed {
            delay: Duration::from_millis(300),
            response: canned_response("c7", "a-1", "first"),
        })
        .await;
    backend
        .script_query(QueryScript::Answer(canned_response("c7", "b-1", "second")))
        .await;

    let (store, dispatcher) = engine(&backend);
    let first_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send("one", None, vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.send("two", None, vec![]).await.unwrap();
    first_task.await.unwrap().unwrap();

    let conversations = store.conversations();
    assert_eq!(conversations.len(), 1, "no duplicate summary");
    assert_eq!(conversations[0].message_count, 4);
}
