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

//! Integration tests for channel recovery.
//!
//! These tests validate:
//! - Automatic reconnection after a server-side drop
//! - The `Reconnecting` state while retries are pending, and that an
//!   intentional disconnect cancels the retry timer (no attempt fires
//!   after teardown)
//! - The configured attempt cap parks the manager `Disconnected`
//! - An intentional disconnect is not treated as a drop

use std::sync::Arc;
use std::time::Duration;

use chatloop::auth::StaticTokens;
use chatloop::config::{ReconnectConfig, SyncConfig};
use chatloop::connection::{ChannelEvents, ConnectionManager, ConnectionState};
use chatloop::store::MessageStore;
use chatloop_mockd::MockBackend;

// =============================================================================
// Helpers
// =============================================================================

/// Fast-retry config pointed at the given endpoints.
fn fast_config(api_url: String, channel_url: String, max_attempts: Option<u32>) -> SyncConfig {
    SyncConfig {
        api_url,
        channel_url,
        connect_timeout: Duration::from_secs(2),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts,
        },
        ..SyncConfig::default()
    }
}

fn manager_with(cfg: SyncConfig) -> (ConnectionManager, ChannelEvents) {
    let store = Arc::new(MessageStore::new());
    let tokens = Arc::new(StaticTokens::new("tok", "refresh"));
    ConnectionManager::new(Arc::new(cfg), store, tokens)
}

/// A `ws://` URL to a port nothing is listening on.
async fn dead_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    // Brief pause to let the OS release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Polls until the backend sees a live channel, or panics.
async fn wait_for_channel(backend: &MockBackend) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if backend.channel_connected(None).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for channel");
}

/// Polls until the manager reports the given state, or panics.
async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if manager.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for state {state:?}, got {:?}", manager.state());
}

// =============================================================================
// Tests
// =============================================================================

/// A server-side drop is followed by an automatic reconnect; the channel
/// comes back without any caller involvement.
#[tokio::test]
async fn reconnects_after_server_side_drop() {
    let backend = MockBackend::spawn().await.unwrap();
    let cfg = fast_config(backend.api_url(), backend.channel_url(), None);
    let (manager, _events) = manager_with(cfg);

    manager.connect(None).await;
    wait_for_channel(&backend).await;
    assert_eq!(backend.connection_count(), 1);

    backend.drop_channel(None).await;
    wait_for_channel(&backend).await;
    assert!(backend.connection_count() >= 2, "a fresh connection must be made");
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disconnect().await;
}

/// While connects keep failing, the manager reports `Reconnecting`; a
/// disconnect during the backoff wait cancels the pending retry.
#[tokio::test]
async fn disconnect_cancels_a_pending_retry() {
    let cfg = fast_config(
        "http://127.0.0.1:1".to_string(),
        dead_endpoint().await,
        None,
    );
    let (manager, _events) = manager_with(cfg);

    manager.connect(None).await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // No retry timer may fire after teardown.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// With a configured cap the retry loop gives up and parks `Disconnected`.
#[tokio::test]
async fn attempt_cap_parks_the_manager_disconnected() {
    let cfg = fast_config(
        "http://127.0.0.1:1".to_string(),
        dead_endpoint().await,
        Some(2),
    );
    let (manager, _events) = manager_with(cfg);

    manager.connect(None).await;
    // The loop passes through Connecting/Reconnecting first.
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    wait_for_state(&manager, ConnectionState::Disconnected).await;

    // Exhausted means exhausted: no further attempts revive the state.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// After a server-side drop the manager reports `Reconnecting` for the
/// whole backoff window, not just once the retry fires.
#[tokio::test]
async fn backoff_window_reports_reconnecting() {
    let backend = MockBackend::spawn().await.unwrap();
    let cfg = SyncConfig {
        api_url: backend.api_url(),
        channel_url: backend.channel_url(),
        connect_timeout: Duration::from_secs(2),
        // A long first delay so the window is observable.
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(2),
            max_attempts: None,
        },
        ..SyncConfig::default()
    };
    let (manager, _events) = manager_with(cfg);

    manager.connect(None).await;
    wait_for_channel(&backend).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    backend.drop_channel(None).await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    // Deep inside the backoff sleep: no channel yet, state still honest.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!backend.channel_connected(None).await);
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    manager.disconnect().await;
}

/// An intentional disconnect closes the channel on the server side and
/// triggers no reconnection.
#[tokio::test]
async fn intentional_disconnect_is_not_retried() {
    let backend = MockBackend::spawn().await.unwrap();
    let cfg = fast_config(backend.api_url(), backend.channel_url(), None);
    let (manager, _events) = manager_with(cfg);

    manager.connect(None).await;
    wait_for_channel(&backend).await;

    manager.disconnect().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while backend.channel_connected(None).await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!backend.channel_connected(None).await, "server must see the close");

    let count = backend.connection_count();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(backend.connection_count(), count, "no reconnect after disconnect");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// State transitions are observable through the watch channel.
#[tokio::test]
async fn state_watch_reports_the_connected_transition() {
    let backend = MockBackend::spawn().await.unwrap();
    let cfg = fast_config(backend.api_url(), backend.channel_url(), None);
    let (manager, _events) = manager_with(cfg);
    let mut watch = manager.watch_state();
    assert_eq!(*watch.borrow(), ConnectionState::Disconnected);

    manager.connect(None).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout waiting for Connected via watch"
        );
        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .expect("watch should change")
            .unwrap();
        if *watch.borrow_and_update() == ConnectionState::Connected {
            break;
        }
    }

    manager.disconnect().await;
}
