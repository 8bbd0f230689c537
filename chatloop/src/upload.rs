//! Attachment upload with per-file progress tracking.
//!
//! A batch of 1–5 files (≤10 MB each, image/PDF/plain-text) is validated
//! up front — a violation rejects the batch before any request is sent —
//! then uploaded concurrently. Each file ends in exactly one terminal
//! state, `uploaded` (with a storage key) or `error`; a failed file does
//! not block the others or the overall send.
//!
//! Progress is published as an immutable map replaced on every update
//! through a watch channel, so readers never observe a half-applied
//! update.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;

use chatloop_proto::message::Attachment;
use chatloop_proto::upload::UploadResponse;

use crate::http::ApiClient;

/// Upload body chunk size; one progress update per chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// A file staged for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl UploadFile {
    /// Creates a staged file.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// Tracked state of one file, keyed by filename in the progress map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub name: String,
    /// Percentage of bytes handed to the transport, 0–100.
    pub progress: u8,
    /// Terminal: the backend stored the file.
    pub uploaded: bool,
    /// Terminal: the upload failed. Mutually exclusive with `uploaded`.
    pub error: Option<String>,
    /// Storage reference, present once `uploaded`.
    pub object_key: Option<String>,
}

impl UploadProgress {
    fn started(name: &str) -> Self {
        Self {
            name: name.to_string(),
            progress: 0,
            uploaded: false,
            error: None,
            object_key: None,
        }
    }

    /// Whether this file reached `uploaded` or `error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.uploaded || self.error.is_some()
    }
}

/// The published progress snapshot: filename to state.
pub type ProgressMap = Arc<HashMap<String, UploadProgress>>;

/// A batch refused by validation, before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejected {
    /// More files than the configured batch limit.
    #[error("too many files: {count} (limit {max})")]
    TooManyFiles { count: usize, max: usize },

    /// A file over the configured size limit.
    #[error("{name} is too large: {size} bytes (limit {max})")]
    FileTooLarge { name: String, size: u64, max: u64 },

    /// A file outside the image/PDF/plain-text allowlist.
    #[error("{name} has unsupported type {content_type}")]
    UnsupportedType { name: String, content_type: String },
}

/// Uploads attachment batches and tracks per-file progress.
pub struct UploadTracker {
    api: Arc<ApiClient>,
    progress_tx: watch::Sender<ProgressMap>,
}

impl UploadTracker {
    /// Creates a tracker over the shared HTTP client.
    #[must_use]
    pub fn new(api: Arc<ApiClient>) -> Self {
        let (progress_tx, _) = watch::channel(Arc::new(HashMap::new()));
        Self { api, progress_tx }
    }

    /// Watch channel publishing each replaced progress map.
    #[must_use]
    pub fn watch_progress(&self) -> watch::Receiver<ProgressMap> {
        self.progress_tx.subscribe()
    }

    /// Current progress snapshot.
    #[must_use]
    pub fn progress(&self) -> ProgressMap {
        self.progress_tx.borrow().clone()
    }

    /// Whether any tracked file has not reached a terminal state. The send
    /// control stays disabled while this is `true`.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.progress_tx
            .borrow()
            .values()
            .any(|p| !p.is_terminal())
    }

    /// Validates a batch against the configured limits.
    ///
    /// # Errors
    ///
    /// Returns the first [`UploadRejected`] violation; nothing has been
    /// sent.
    pub fn validate(&self, files: &[UploadFile]) -> Result<(), UploadRejected> {
        let limits = &self.api.config().upload;
        if files.len() > limits.max_files {
            return Err(UploadRejected::TooManyFiles {
                count: files.len(),
                max: limits.max_files,
            });
        }
        for file in files {
            let size = file.data.len() as u64;
            if size > limits.max_file_bytes {
                return Err(UploadRejected::FileTooLarge {
                    name: file.name.clone(),
                    size,
                    max: limits.max_file_bytes,
                });
            }
            if !type_allowed(&file.content_type) {
                return Err(UploadRejected::UnsupportedType {
                    name: file.name.clone(),
                    content_type: file.content_type.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validates and uploads a batch concurrently.
    ///
    /// Returns attachments for the files that finished `uploaded`, each
    /// carrying its object key; files that errored are tracked in the
    /// progress map but excluded from the result rather than failing the
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns [`UploadRejected`] when validation refuses the batch; no
    /// file has started uploading.
    pub async fn upload_batch(
        &self,
        files: Vec<UploadFile>,
    ) -> Result<Vec<Attachment>, UploadRejected> {
        self.validate(&files)?;
        if files.is_empty() {
            return Ok(vec![]);
        }

        // Replace the map with fresh entries for this batch.
        let seeded: HashMap<String, UploadProgress> = files
            .iter()
            .map(|f| (f.name.clone(), UploadProgress::started(&f.name)))
            .collect();
        let _ = self.progress_tx.send(Arc::new(seeded));

        let results =
            futures_util::future::join_all(files.into_iter().map(|f| self.upload_one(f))).await;
        Ok(results.into_iter().flatten().collect())
    }

    /// Uploads one file to its terminal state.
    async fn upload_one(&self, file: UploadFile) -> Option<Attachment> {
        let name = file.name.clone();
        match self.try_upload(&file).await {
            Ok(object_key) => {
                publish(&self.progress_tx, &name, |p| {
                    p.progress = 100;
                    p.uploaded = true;
                    p.object_key = Some(object_key.clone());
                });
                tracing::info!(file = %name, object_key = %object_key, "upload complete");
                Some(Attachment {
                    file_name: file.name,
                    content_type: file.content_type,
                    size: file.data.len() as u64,
                    object_key: Some(object_key),
                })
            }
            Err(reason) => {
                tracing::warn!(file = %name, reason = %reason, "upload failed");
                publish(&self.progress_tx, &name, |p| {
                    p.error = Some(reason);
                });
                None
            }
        }
    }

    async fn try_upload(&self, file: &UploadFile) -> Result<String, String> {
        let url = self.api.config().upload_url();
        let response = self
            .api
            .send_authorized(|http| {
                // Rebuilt per attempt; a refresh-and-retry restarts the
                // progress from zero.
                publish(&self.progress_tx, &file.name, |p| p.progress = 0);
                let build_part = || {
                    let stream = progress_stream(
                        file.name.clone(),
                        file.data.clone(),
                        self.progress_tx.clone(),
                    );
                    reqwest::multipart::Part::stream_with_length(
                        reqwest::Body::wrap_stream(stream),
                        file.data.len() as u64,
                    )
                    .file_name(file.name.clone())
                };
                let part = build_part()
                    .mime_str(&file.content_type)
                    .unwrap_or_else(|_| build_part());
                let form = reqwest::multipart::Form::new().part("file", part);
                http.post(&url).multipart(form)
            })
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("upload rejected with status {}", response.status()));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| format!("malformed upload response: {e}"))?;
        Ok(body.object_key)
    }
}

/// Whether a declared MIME type is in the allowlist.
fn type_allowed(content_type: &str) -> bool {
    content_type.starts_with("image/")
        || content_type == "application/pdf"
        || content_type == "text/plain"
}

/// Replaces the published map with a copy that has `apply` folded into the
/// named entry.
fn publish(
    tx: &watch::Sender<ProgressMap>,
    name: &str,
    apply: impl FnOnce(&mut UploadProgress),
) {
    tx.send_modify(|map| {
        let mut next: HashMap<String, UploadProgress> = (**map).clone();
        let entry = next
            .entry(name.to_string())
            .or_insert_with(|| UploadProgress::started(name));
        apply(entry);
        *map = Arc::new(next);
    });
}

/// Chunks the file body, publishing a progress percentage per chunk.
fn progress_stream(
    name: String,
    data: Bytes,
    tx: watch::Sender<ProgressMap>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let total = data.len().max(1) as u64;
    let ranges: Vec<std::ops::Range<usize>> = (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|start| start..(start + CHUNK_SIZE).min(data.len()))
        .collect();

    let mut sent: u64 = 0;
    futures_util::stream::iter(ranges).map(move |range| {
        let chunk = data.slice(range);
        sent += chunk.len() as u64;
        let pct = u8::try_from(sent * 100 / total).unwrap_or(100);
        publish(&tx, &name, |p| p.progress = pct);
        Ok(chunk)
    })
}
