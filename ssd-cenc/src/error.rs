//! Error types for sessions, backends and the decrypt path.

use crate::{cdm::CdmStatus, key::KeyId};
use thiserror::Error;

/// Errors that can occur while driving a DRM backend or decrypting samples.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend refused to start (no sessions are possible).
    #[error("backend initialization failed: {0}")]
    BackendInit(String),

    /// Device provisioning failed, session creation is blocked until retried.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The session is unusable and must be discarded.
    #[error("session creation failed: {0}")]
    SessionCreate(String),

    /// No usable key yet, retry after the next key status change.
    #[error("key {key_id} is not ready for decryption")]
    KeyNotReady { key_id: KeyId },

    /// Decrypt against a pool id which was never added or was removed.
    #[error("fragment pool {0} is unknown")]
    UnknownPool(u32),

    /// Sample layout does not match its data.
    #[error("malformed sample: {0}")]
    MalformedSample(String),

    /// The backend failed to decrypt a single sample.
    #[error("backend failed to decrypt sample with key {key_id} ({status})")]
    BackendDecrypt { key_id: KeyId, status: CdmStatus },

    /// Operation on a session after `close`.
    #[error("session is closed")]
    SessionClosed,

    /// License or provisioning server answered with a non-success status.
    #[error("license server responded with status {status}: '{body}'")]
    Transport { status: u16, body: String },

    /// License template or license response could not be processed.
    #[error("license error: {0}")]
    License(String),

    /// Named blob does not exist in the store.
    #[error("blob '{0}' not found")]
    BlobNotFound(String),

    /// Invalid hex string.
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid JSON document.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true for errors which are expected under license renewal churn
    /// and should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyNotReady { .. })
    }

    /// Returns true for errors which only affect the current sample,
    /// the session stays usable.
    pub fn is_sample_local(&self) -> bool {
        matches!(
            self,
            Self::UnknownPool(_) | Self::MalformedSample(_) | Self::BackendDecrypt { .. }
        )
    }
}

/// A `Result` alias where the `Err` case is `ssd_cenc::Error`.
pub type Result<T> = std::result::Result<T, Error>;
