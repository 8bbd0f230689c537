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

//! Integration tests for attachment uploads.
//!
//! These tests validate:
//! - A valid batch uploads concurrently and yields one attachment with a
//!   storage key per file, with progress reaching 100
//! - A failed upload ends in `error`, is excluded from the result, and
//!   does not block the rest of the flow
//! - A batch that fails validation sends zero requests
//! - Uploaded keys flow into the next query request

use std::sync::Arc;
use std::time::Duration;

use chatloop::auth::StaticTokens;
use chatloop::config::SyncConfig;
use chatloop::http::ApiClient;
use chatloop::query::QueryDispatcher;
use chatloop::store::MessageStore;
use chatloop::upload::{UploadFile, UploadRejected, UploadTracker};
use chatloop_mockd::MockBackend;

// =============================================================================
// Helpers
// =============================================================================

fn api(backend: &MockBackend) -> Arc<ApiClient> {
    let cfg = Arc::new(SyncConfig {
        api_url: backend.api_url(),
        channel_url: backend.channel_url(),
        ..SyncConfig::default()
    });
    let tokens = Arc::new(StaticTokens::new("tok", "refresh"));
    Arc::new(ApiClient::new(cfg, tokens))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn batch_uploads_and_returns_storage_keys() {
    let backend = MockBackend::spawn().await.unwrap();
    let tracker = UploadTracker::new(api(&backend));

    let files = vec![
        UploadFile::new("photo.png", "image/png", vec![0u8; 128]),
        UploadFile::new("notes.pdf", "application/pdf", vec![1u8; 200 * 1024]),
    ];
    let attachments = tracker.upload_batch(files).await.unwrap();

    assert_eq!(attachments.len(), 2);
    for attachment in &attachments {
        let key = attachment.object_key.as_deref().unwrap();
        assert!(key.starts_with("uploads/"), "unexpected key {key}");
        assert!(key.ends_with(&attachment.file_name));
    }
    assert_eq!(backend.upload_count(), 2);

    let progress = tracker.progress();
    assert_eq!(progress.len(), 2);
    for state in progress.values() {
        assert!(state.uploaded);
        assert_eq!(state.progress, 100);
        assert!(state.error.is_none());
    }
    assert!(!tracker.in_progress(), "send gate must reopen");
}

/// A backend-side failure lands the file in `error` without failing the
/// batch; the result simply excludes it.
#[tokio::test]
async fn failed_upload_is_tracked_and_excluded() {
    let backend = MockBackend::spawn().await.unwrap();
    backend.set_fail_uploads(true).await;
    let tracker = UploadTracker::new(api(&backend));

    let files = vec![UploadFile::new("doomed.txt", "text/plain", vec![2u8; 64])];
    let attachments = tracker.upload_batch(files).await.unwrap();
    assert!(attachments.is_empty());

    let progress = tracker.progress();
    let state = &progress["doomed.txt"];
    assert!(!state.uploaded);
    assert!(state.error.is_some());
    assert!(state.is_terminal());
    assert!(!tracker.in_progress());
}

/// Validation happens before any network call: an oversized or oversize
/// batch sends nothing.
#[tokio::test]
async fn rejected_batch_sends_no_requests() {
    let backend = MockBackend::spawn().await.unwrap();
    let tracker = UploadTracker::new(api(&backend));

    let too_many: Vec<UploadFile> = (0..6)
        .map(|i| UploadFile::new(format!("f{i}.png"), "image/png", vec![0u8; 16]))
        .collect();
    assert!(matches!(
        tracker.upload_batch(too_many).await,
        Err(UploadRejected::TooManyFiles { count: 6, max: 5 })
    ));

    let oversized = vec![UploadFile::new(
        "big.pdf",
        "application/pdf",
        vec![0u8; 11 * 1024 * 1024],
    )];
    assert!(matches!(
        tracker.upload_batch(oversized).await,
        Err(UploadRejected::FileTooLarge { .. })
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.upload_count(), 0, "nothing may reach the backend");
    assert!(tracker.progress().is_empty(), "nothing gets tracked");
}

/// The storage keys from a finished batch are referenced in the following
/// query request.
#[tokio::test]
async fn uploaded_keys_flow_into_the_next_query() {
    let backend = MockBackend::spawn().await.unwrap();
    let api = api(&backend);
    let tracker = UploadTracker::new(Arc::clone(&api));
    let store = Arc::new(MessageStore::new());
    let dispatcher = QueryDispatcher::new(api, Arc::clone(&store));

    let files = vec![UploadFile::new("spec.pdf", "application/pdf", vec![3u8; 512])];
    let attachments = tracker.upload_batch(files).await.unwrap();
    assert_eq!(attachments.len(), 1);
    let key = attachments[0].object_key.clone().unwrap();

    dispatcher
        .send("summarize the attached file", None, attachments)
        .await
        .unwrap();

    let sent = backend.last_query().await.unwrap();
    assert_eq!(sent.file_attachments, vec![key]);
    assert_eq!(store.messages()[0].attachments.len(), 1);
}
