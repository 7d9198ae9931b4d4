//! Contract between the core and a content decryption module (CDM).
//!
//! A backend is driven through [`Cdm`] and reports asynchronous events
//! (license messages, key status changes, session removal) through the
//! [`CdmEvents`] sink it receives on initialization. The core never depends
//! on a concrete backend; [`ClearKeyCdm`] is the software backend shipped
//! with this crate.

mod cipher;
mod clearkey;

pub use clearkey::ClearKeyCdm;

use crate::{
    config::AdapterConfig,
    host::Host,
    key::{KeyId, KeyStatus},
    sample::{EncryptionScheme, Pattern, Subsample},
};
use std::{fmt, sync::Arc};

/// Blob name of the persisted device certificate.
pub const CERTIFICATE_BLOB: &str = "cert.bin";

/// Failure codes reported by a backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CdmStatus {
    NeedsProvisioning,
    SessionNotFound,
    NoKey,
    DecryptError,
    TypeError,
    NotSupported,
    InvalidState,
    Unexpected,
}

impl fmt::Display for CdmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NeedsProvisioning => "needs provisioning",
            Self::SessionNotFound => "session not found",
            Self::NoKey => "no key",
            Self::DecryptError => "decrypt error",
            Self::TypeError => "type error",
            Self::NotSupported => "not supported",
            Self::InvalidState => "invalid state",
            Self::Unexpected => "unexpected error",
        })
    }
}

pub type CdmResult<T> = std::result::Result<T, CdmStatus>;

/// Kind of message a backend wants delivered to a license server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

/// Format of the initialization data passed to [`Cdm::generate_request`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InitDataType {
    /// One or more `pssh` boxes.
    #[default]
    Cenc,
    /// JSON `{"kids":[...]}` document.
    KeyIds,
    /// Raw key id bytes.
    WebM,
}

/// Output protection a backend demands before releasing decrypted frames.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutputRequirements {
    /// Required HDCP version as `major * 10 + minor`, 0 when not required.
    pub hdcp_version: u8,
    /// Pixel count above which HDCP is enforced, 0 when unlimited.
    pub hdcp_limit: u32,
    /// Largest allowed pixel count, 0 when unlimited.
    pub resolution_limit: u32,
}

/// One sample handed to a backend. `data` holds only the protected bytes
/// (already packed and pattern expanded) and `subsamples` describes how
/// they split into runs.
#[derive(Clone, Copy, Debug)]
pub struct DecryptRequest<'a> {
    pub key_id: KeyId,
    pub iv: [u8; 16],
    pub scheme: EncryptionScheme,
    pub pattern: Pattern,
    pub data: &'a [u8],
    pub subsamples: &'a [Subsample],
    /// Restart the cipher from `iv` for every run instead of chaining.
    pub iv_per_subsample: bool,
}

/// Sink for events a backend raises from its own threads.
pub trait CdmEvents: Send + Sync {
    fn on_message(&self, session_id: &str, message_type: MessageType, message: &[u8]);
    fn on_key_statuses_change(&self, session_id: &str, has_usable_key: bool);
    fn on_remove_complete(&self, session_id: &str);
}

/// A content decryption module.
///
/// Every method may be called from any thread. Implementations must not
/// invoke [`CdmEvents`] while holding a lock that one of their own methods
/// needs, since the sink calls straight back into the backend.
pub trait Cdm: Send + Sync {
    fn initialize(
        &self,
        host: Host,
        events: Arc<dyn CdmEvents>,
        config: &AdapterConfig,
    ) -> CdmResult<()>;

    /// Allocate a new session and return its id.
    fn create_session(&self) -> CdmResult<String>;

    /// Generate a license request, delivered through [`CdmEvents::on_message`].
    fn generate_request(
        &self,
        session_id: &str,
        init_data_type: InitDataType,
        init_data: &[u8],
    ) -> CdmResult<()>;

    /// Feed a license server response into the session.
    fn update(&self, session_id: &str, response: &[u8]) -> CdmResult<()>;

    fn key_statuses(&self, session_id: &str) -> CdmResult<Vec<(KeyId, KeyStatus)>>;

    /// Decrypt `request.data`, returning exactly as many bytes.
    fn decrypt(&self, session_id: &str, request: &DecryptRequest<'_>) -> CdmResult<Vec<u8>>;

    fn close(&self, session_id: &str) -> CdmResult<()>;

    /// Generate a renewal request, delivered through [`CdmEvents::on_message`].
    fn request_renewal(&self, session_id: &str) -> CdmResult<()>;

    /// License expiration in milliseconds since the unix epoch.
    fn expiration(&self, session_id: &str) -> CdmResult<Option<i64>>;

    fn output_requirements(&self, session_id: &str, key_id: &KeyId) -> OutputRequirements;

    /// Device provisioning request, `None` if the backend needs none.
    fn provisioning_request(&self) -> CdmResult<Option<Vec<u8>>>;

    /// Install a provisioning response, persisting [`CERTIFICATE_BLOB`].
    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<()>;

    /// Release everything. No other method is called afterwards.
    fn terminate(&self);
}
