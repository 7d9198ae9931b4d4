//! Software backend implementing W3C ClearKey.
//!
//! License requests are `{"kids":[...],"type":"temporary"}` and responses are
//! JSON web key sets `{"keys":[{"kty":"oct","kid":..,"k":..}]}` with
//! unpadded base64url values. A response may carry an `expiration` in
//! milliseconds since the unix epoch; past it every key reports expired.

use super::{
    CERTIFICATE_BLOB, Cdm, CdmEvents, CdmResult, CdmStatus, DecryptRequest, InitDataType,
    MessageType, OutputRequirements, cipher,
};
use crate::{
    config::{AdapterConfig, SecureOutput},
    host::Host,
    key::{KeyId, KeyStatus},
    lock, pssh,
};
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

const PROVISIONING_REQUEST: &[u8] = br#"{"type":"provisioning"}"#;

#[derive(Deserialize, Serialize)]
struct LicenseRequestMessage {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: String,
}

#[derive(Deserialize, Serialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

#[derive(Deserialize, Serialize)]
struct KeySet {
    keys: Vec<JsonWebKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<i64>,
}

#[derive(Default)]
struct ClearKeySession {
    keys: BTreeMap<KeyId, [u8; 16]>,
    requested: Vec<KeyId>,
    expiration: Option<i64>,
    expiry_reported: bool,
}

impl ClearKeySession {
    fn is_expired(&self, now: i64) -> bool {
        self.expiration.is_some_and(|x| now >= x)
    }
}

#[derive(Default)]
struct Inner {
    host: Option<Host>,
    events: Option<Arc<dyn CdmEvents>>,
    sessions: HashMap<String, ClearKeySession>,
    next_session: u32,
}

/// ClearKey content decryption module.
#[derive(Default)]
pub struct ClearKeyCdm {
    inner: Mutex<Inner>,
    preloaded: BTreeMap<KeyId, [u8; 16]>,
    requires_provisioning: bool,
}

impl ClearKeyCdm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys every new session starts with, for playback without a license server.
    pub fn with_keys<I: IntoIterator<Item = (KeyId, [u8; 16])>>(mut self, keys: I) -> Self {
        self.preloaded.extend(keys);
        self
    }

    /// Refuse to create sessions until a device certificate is stored.
    pub fn with_provisioning(mut self, required: bool) -> Self {
        self.requires_provisioning = required;
        self
    }

    /// Serialize a license (JSON web key set) for `keys`.
    pub fn license(keys: &[(KeyId, [u8; 16])], expiration: Option<i64>) -> Vec<u8> {
        let key_set = KeySet {
            keys: keys
                .iter()
                .map(|(kid, k)| JsonWebKey {
                    kty: "oct".to_owned(),
                    kid: encode(kid.as_bytes()),
                    k: encode(k),
                })
                .collect(),
            expiration,
        };

        serde_json::to_vec(&key_set).unwrap_or_default()
    }

    /// Key ids listed in a license request message.
    pub fn requested_key_ids(message: &[u8]) -> CdmResult<Vec<KeyId>> {
        let message = serde_json::from_slice::<LicenseRequestMessage>(message)
            .map_err(|_| CdmStatus::TypeError)?;
        message.kids.iter().map(|x| decode_key_id(x)).collect()
    }

    fn now(inner: &Inner) -> i64 {
        inner.host.as_ref().map(|x| x.clock.now_ms()).unwrap_or_default()
    }

    fn events(inner: &Inner) -> CdmResult<Arc<dyn CdmEvents>> {
        inner.events.clone().ok_or(CdmStatus::InvalidState)
    }

    fn request_message(key_ids: &[KeyId]) -> Vec<u8> {
        let message = LicenseRequestMessage {
            kids: key_ids.iter().map(|x| encode(x.as_bytes())).collect(),
            session_type: "temporary".to_owned(),
        };

        serde_json::to_vec(&message).unwrap_or_default()
    }
}

impl Cdm for ClearKeyCdm {
    fn initialize(
        &self,
        host: Host,
        events: Arc<dyn CdmEvents>,
        config: &AdapterConfig,
    ) -> CdmResult<()> {
        if config.secure_output == SecureOutput::Secure {
            warn!("clearkey cannot provide a secure output path");
            return Err(CdmStatus::NotSupported);
        }

        if config.server_certificate.is_some() {
            debug!("clearkey ignores the server certificate");
        }

        let mut inner = lock(&self.inner);
        inner.host = Some(host);
        inner.events = Some(events);
        Ok(())
    }

    fn create_session(&self) -> CdmResult<String> {
        let mut inner = lock(&self.inner);
        let host = inner.host.as_ref().ok_or(CdmStatus::InvalidState)?;

        if self.requires_provisioning && !host.storage.exists(CERTIFICATE_BLOB) {
            return Err(CdmStatus::NeedsProvisioning);
        }

        inner.next_session += 1;
        let session_id = format!("ck{:08x}", inner.next_session);
        inner.sessions.insert(
            session_id.clone(),
            ClearKeySession {
                keys: self.preloaded.clone(),
                ..Default::default()
            },
        );

        debug!("clearkey session {} created", session_id);
        Ok(session_id)
    }

    fn generate_request(
        &self,
        session_id: &str,
        init_data_type: InitDataType,
        init_data: &[u8],
    ) -> CdmResult<()> {
        let key_ids = match init_data_type {
            InitDataType::Cenc => pssh::key_ids(init_data).map_err(|_| CdmStatus::TypeError)?,
            InitDataType::KeyIds => Self::requested_key_ids(init_data)?,
            InitDataType::WebM => {
                vec![KeyId::from_slice(init_data).map_err(|_| CdmStatus::TypeError)?]
            }
        };

        if key_ids.is_empty() {
            return Err(CdmStatus::TypeError);
        }

        let events = {
            let mut inner = lock(&self.inner);
            let events = Self::events(&inner)?;
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or(CdmStatus::SessionNotFound)?;
            session.requested = key_ids.clone();
            events
        };

        events.on_message(
            session_id,
            MessageType::LicenseRequest,
            &Self::request_message(&key_ids),
        );
        Ok(())
    }

    fn update(&self, session_id: &str, response: &[u8]) -> CdmResult<()> {
        let key_set =
            serde_json::from_slice::<KeySet>(response).map_err(|_| CdmStatus::TypeError)?;

        if key_set.keys.is_empty() {
            return Err(CdmStatus::TypeError);
        }

        let mut keys = Vec::with_capacity(key_set.keys.len());
        for jwk in &key_set.keys {
            if jwk.kty != "oct" {
                return Err(CdmStatus::TypeError);
            }

            let key = decode(&jwk.k)?;
            let key = <[u8; 16]>::try_from(key.as_slice()).map_err(|_| CdmStatus::TypeError)?;
            keys.push((decode_key_id(&jwk.kid)?, key));
        }

        let (events, has_usable_key) = {
            let mut inner = lock(&self.inner);
            let events = Self::events(&inner)?;
            let now = Self::now(&inner);
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or(CdmStatus::SessionNotFound)?;

            session.keys.extend(keys);
            session.expiration = key_set.expiration;
            session.expiry_reported = false;
            (events, !session.is_expired(now))
        };

        debug!(
            "clearkey session {} updated with {} keys",
            session_id,
            key_set.keys.len()
        );
        events.on_key_statuses_change(session_id, has_usable_key);
        Ok(())
    }

    fn key_statuses(&self, session_id: &str) -> CdmResult<Vec<(KeyId, KeyStatus)>> {
        let inner = lock(&self.inner);
        let now = Self::now(&inner);
        let session = inner
            .sessions
            .get(session_id)
            .ok_or(CdmStatus::SessionNotFound)?;
        let status = if session.is_expired(now) {
            KeyStatus::Expired
        } else {
            KeyStatus::Usable
        };

        Ok(session.keys.keys().map(|x| (*x, status)).collect())
    }

    fn decrypt(&self, session_id: &str, request: &DecryptRequest<'_>) -> CdmResult<Vec<u8>> {
        let (key, expired) = {
            let mut inner = lock(&self.inner);
            let now = Self::now(&inner);
            let events = inner.events.clone();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or(CdmStatus::SessionNotFound)?;

            if session.is_expired(now) {
                let report = !session.expiry_reported;
                session.expiry_reported = true;
                (None, events.filter(|_| report))
            } else {
                (session.keys.get(&request.key_id).copied(), None)
            }
        };

        if let Some(events) = expired {
            debug!("clearkey session {} license expired", session_id);
            events.on_key_statuses_change(session_id, false);
        }

        let key = key.ok_or(CdmStatus::NoKey)?;
        cipher::decrypt(&key, request)
    }

    fn close(&self, session_id: &str) -> CdmResult<()> {
        lock(&self.inner)
            .sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or(CdmStatus::SessionNotFound)
    }

    fn request_renewal(&self, session_id: &str) -> CdmResult<()> {
        let (events, key_ids) = {
            let inner = lock(&self.inner);
            let events = Self::events(&inner)?;
            let session = inner
                .sessions
                .get(session_id)
                .ok_or(CdmStatus::SessionNotFound)?;
            let key_ids = if session.requested.is_empty() {
                session.keys.keys().copied().collect()
            } else {
                session.requested.clone()
            };
            (events, key_ids)
        };

        if key_ids.is_empty() {
            return Err(CdmStatus::InvalidState);
        }

        events.on_message(
            session_id,
            MessageType::LicenseRenewal,
            &Self::request_message(&key_ids),
        );
        Ok(())
    }

    fn expiration(&self, session_id: &str) -> CdmResult<Option<i64>> {
        lock(&self.inner)
            .sessions
            .get(session_id)
            .map(|x| x.expiration)
            .ok_or(CdmStatus::SessionNotFound)
    }

    fn output_requirements(&self, _: &str, _: &KeyId) -> OutputRequirements {
        OutputRequirements::default()
    }

    fn provisioning_request(&self) -> CdmResult<Option<Vec<u8>>> {
        Ok(self
            .requires_provisioning
            .then(|| PROVISIONING_REQUEST.to_vec()))
    }

    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<()> {
        if response.is_empty() {
            return Err(CdmStatus::TypeError);
        }

        let inner = lock(&self.inner);
        let host = inner.host.as_ref().ok_or(CdmStatus::InvalidState)?;

        host.storage
            .write(CERTIFICATE_BLOB, response)
            .map_err(|e| {
                warn!("cannot store device certificate: {}", e);
                CdmStatus::Unexpected
            })
    }

    fn terminate(&self) {
        let mut inner = lock(&self.inner);
        inner.sessions.clear();
        inner.events = None;
        inner.host = None;
    }
}

fn encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn decode(data: &str) -> CdmResult<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|_| CdmStatus::TypeError)
}

fn decode_key_id(data: &str) -> CdmResult<KeyId> {
    KeyId::from_slice(&decode(data)?).map_err(|_| CdmStatus::TypeError)
}
