//! Response body for the upload endpoint.

use serde::{Deserialize, Serialize};

/// Successful `POST /upload` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Storage reference to include in a query's `file_attachments`.
    pub object_key: String,
}
