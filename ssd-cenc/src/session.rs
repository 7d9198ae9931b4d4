//! Per-track decryption session: license state machine, key statuses,
//! fragment pools and the decrypt entry point.

use crate::{
    Error, Result,
    adapter::{Adapter, Router},
    cdm::{Cdm, CdmStatus, DecryptRequest, InitDataType, MessageType},
    config::{SecureOutput, SessionOptions},
    host::{Host, TimerClient},
    key::{KeyId, KeyStatus, KeyTable},
    lock, nal,
    pool::{CryptoInfo, FragmentInfo, PoolId, PoolTable},
    pssh,
    repack::{RepackedSample, resets_iv_per_subsample},
    sample::{EncryptionScheme, Pattern, Subsample, check_layout},
};
use base64::Engine;
use log::{debug, info, trace, warn};
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak},
    time::{Duration, Instant},
};

/// Renewals are requested this long before the license expires.
const RENEWAL_MARGIN_MS: i64 = 30_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    ChallengePending,
    Licensed,
    Renewing,
    Closed,
}

impl SessionState {
    /// Decrypt only succeeds in these states.
    pub fn can_decrypt(self) -> bool {
        matches!(self, Self::Licensed | Self::Renewing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::ChallengePending => "challenge-pending",
            Self::Licensed => "licensed",
            Self::Renewing => "renewing",
            Self::Closed => "closed",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaType {
    Audio,
    Video,
}

/// What a decoder has to provide for samples of one key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// A usable key exists, samples can be decrypted.
    pub supports_decoding: bool,
    /// Decrypted frames must stay on a protected path.
    pub secure_path: bool,
    /// The secure decoder expects Annex-B input.
    pub annexb_required: bool,
    pub hdcp_version: u8,
    pub hdcp_limit: u32,
    pub resolution_limit: u32,
}

struct State {
    state: SessionState,
    session_id: String,
    challenge: Option<Vec<u8>>,
    keys: KeyTable,
    default_key_id: Option<KeyId>,
}

pub(crate) struct SessionShared {
    me: Weak<SessionShared>,
    cdm: Arc<dyn Cdm>,
    router: Arc<Router>,
    host: Host,
    secure_output: SecureOutput,
    pssh: Vec<u8>,
    state: Mutex<State>,
    challenge_ready: Condvar,
    pools: Mutex<PoolTable>,
    /// Held shared by decrypts in flight, exclusively while keys are replaced.
    renewal: RwLock<()>,
}

/// One backend session, exclusively owned by the track that opened it.
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Create a backend session and generate its license request.
    ///
    /// Returns once the challenge is available through [`Self::challenge`],
    /// or at once in `Licensed` state when `skip_session_message` is set.
    pub fn open(adapter: &Adapter, options: SessionOptions) -> Result<Self> {
        let cdm = adapter.cdm().clone();
        let session_id = match cdm.create_session() {
            Ok(x) => x,
            Err(CdmStatus::NeedsProvisioning) if adapter.config().auto_provision => {
                adapter.ensure_provisioned()?;
                cdm.create_session()
                    .map_err(|e| Error::SessionCreate(e.to_string()))?
            }
            Err(CdmStatus::NeedsProvisioning) => {
                return Err(Error::Provisioning("device is not provisioned".to_owned()));
            }
            Err(e) => return Err(Error::SessionCreate(e.to_string())),
        };

        let mut key_hints = options.key_hints.clone();
        if key_hints.is_empty() && !options.pssh.is_empty() {
            match pssh::key_ids(&options.pssh) {
                Ok(x) => key_hints = x,
                Err(e) => debug!("no key ids derived from init data ({})", e),
            }
        }

        let mut keys = KeyTable::new();
        for key_id in &key_hints {
            keys.upsert(*key_id, KeyStatus::StatusPending);
        }

        let shared = Arc::new_cyclic(|me| SessionShared {
            me: me.clone(),
            cdm: cdm.clone(),
            router: adapter.router().clone(),
            host: adapter.host().clone(),
            secure_output: adapter.config().secure_output,
            pssh: options.pssh.clone(),
            state: Mutex::new(State {
                state: SessionState::Created,
                session_id: session_id.clone(),
                challenge: None,
                keys,
                default_key_id: options.default_key_id.or(key_hints.first().copied()),
            }),
            challenge_ready: Condvar::new(),
            pools: Mutex::new(PoolTable::default()),
            renewal: RwLock::new(()),
        });

        shared.router.register(&session_id, &shared);
        let session = Self { shared };
        info!("session {} created", session_id);

        if options.skip_session_message {
            let statuses = cdm.key_statuses(&session_id).unwrap_or_default();
            let mut state = lock(&session.shared.state);
            for (key_id, status) in statuses {
                state.keys.upsert(key_id, status);
            }
            state.state = SessionState::Licensed;
            debug!("session {} licensed without license exchange", session_id);
            drop(state);
            return Ok(session);
        }

        let (init_data_type, init_data) = if !options.pssh.is_empty() {
            (InitDataType::Cenc, options.pssh.clone())
        } else if !key_hints.is_empty() {
            (InitDataType::KeyIds, key_ids_init_data(&key_hints))
        } else {
            return Err(Error::SessionCreate(
                "neither init data nor key ids were given".to_owned(),
            ));
        };

        if let Err(e) = cdm.generate_request(&session_id, init_data_type, &init_data) {
            return Err(Error::SessionCreate(format!(
                "backend cannot generate a license request ({})",
                e
            )));
        }

        if session.wait_for_challenge(options.challenge_timeout).is_none() {
            return Err(Error::SessionCreate(format!(
                "no license request within {:?}",
                options.challenge_timeout
            )));
        }

        Ok(session)
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn session_id(&self) -> String {
        lock(&self.shared.state).session_id.clone()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.state).state
    }

    pub fn pssh(&self) -> &[u8] {
        &self.shared.pssh
    }

    /// The outstanding license request, present while a round trip is due.
    pub fn challenge(&self) -> Option<Vec<u8>> {
        lock(&self.shared.state).challenge.clone()
    }

    /// Block until a license request is outstanding or `timeout` elapses.
    pub fn wait_for_challenge(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);

        loop {
            if let Some(challenge) = &state.challenge {
                return Some(challenge.clone());
            }

            if state.state == SessionState::Closed {
                return None;
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = self
                .shared
                .challenge_ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Feed a license server response into the backend.
    ///
    /// A response for a closed session is discarded. A response the backend
    /// rejects closes the session with [`Error::SessionCreate`].
    pub fn apply_response(&self, response: &[u8]) -> Result<()> {
        self.shared.apply_response(response)
    }

    /// Release the backend session. Pools become invalid, pending
    /// responses and timers are discarded.
    pub fn close(&self) {
        self.shared.close(true);
    }

    /// Register a fragment pool with `crypto` and no explicit key id.
    pub fn add_pool(&self, crypto: CryptoInfo) -> PoolId {
        let id = lock(&self.shared.pools).add(FragmentInfo {
            crypto,
            ..Default::default()
        });
        trace!("pool {} added", id);
        id
    }

    /// Replace the configuration of `pool` wholesale.
    pub fn set_fragment_info(&self, pool: PoolId, info: FragmentInfo) -> Result<()> {
        lock(&self.shared.pools).set(pool, info)
    }

    pub fn remove_pool(&self, pool: PoolId) -> Result<()> {
        lock(&self.shared.pools).remove(pool)?;
        trace!("pool {} removed", pool);
        Ok(())
    }

    /// Decrypt one sample of `pool` with an explicit scheme and pattern.
    ///
    /// `input` is never modified. On [`Error::KeyNotReady`] retry after the
    /// next key status change.
    pub fn decrypt(
        &self,
        pool: PoolId,
        scheme: EncryptionScheme,
        pattern: Pattern,
        iv: &[u8],
        input: &[u8],
        subsamples: &[Subsample],
    ) -> Result<Vec<u8>> {
        let info = self.shared.fragment_info(pool)?;
        self.shared
            .decrypt(&info, scheme, pattern, iv, input, subsamples)
    }

    /// Decrypt one sample with the scheme and pattern configured for `pool`.
    pub fn decrypt_sample(
        &self,
        pool: PoolId,
        iv: &[u8],
        input: &[u8],
        subsamples: &[Subsample],
    ) -> Result<Vec<u8>> {
        let info = self.shared.fragment_info(pool)?;
        let CryptoInfo {
            scheme, pattern, ..
        } = info.crypto;
        self.shared
            .decrypt(&info, scheme, pattern, iv, input, subsamples)
    }

    pub fn key_status(&self, key_id: &KeyId) -> Option<KeyStatus> {
        lock(&self.shared.state).keys.status(key_id)
    }

    pub fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        lock(&self.shared.state).keys.to_vec()
    }

    pub fn has_key_id(&self, key_id: &KeyId) -> bool {
        lock(&self.shared.state).keys.contains(key_id)
    }

    /// Expect `key_id` in the license, it stays pending until reported.
    pub fn add_key_id(&self, key_id: KeyId) {
        let mut state = lock(&self.shared.state);
        if !state.keys.contains(&key_id) {
            state.keys.upsert(key_id, KeyStatus::StatusPending);
        }
    }

    /// Record a key status learned outside of the backend's notifications.
    pub fn add_session_key(&self, key_id: KeyId, status: KeyStatus) {
        lock(&self.shared.state).keys.upsert(key_id, status);
    }

    pub fn default_key_id(&self) -> Option<KeyId> {
        lock(&self.shared.state).default_key_id
    }

    pub fn set_default_key_id(&self, key_id: KeyId) {
        lock(&self.shared.state).default_key_id = Some(key_id);
    }

    /// Decoder requirements for samples protected with `key_id`.
    pub fn capabilities(&self, key_id: &KeyId, media_type: MediaType) -> Capabilities {
        let (supports_decoding, session_id) = {
            let state = lock(&self.shared.state);
            let usable = state.state.can_decrypt()
                && state.keys.status(key_id).is_some_and(KeyStatus::is_usable);
            (usable, state.session_id.clone())
        };

        let mut capabilities = Capabilities {
            supports_decoding,
            ..Default::default()
        };

        if media_type == MediaType::Video {
            let requirements = self.shared.cdm.output_requirements(&session_id, key_id);
            capabilities.secure_path = self.shared.secure_output == SecureOutput::Secure;
            capabilities.annexb_required = capabilities.secure_path;
            capabilities.hdcp_version = requirements.hdcp_version;
            capabilities.hdcp_limit = requirements.hdcp_limit;
            capabilities.resolution_limit = requirements.resolution_limit;
        }

        capabilities
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close(true);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Session")
            .field("session_id", &state.session_id)
            .field("state", &state.state)
            .field("keys", &state.keys.len())
            .finish()
    }
}

impl SessionShared {
    fn fragment_info(&self, pool: PoolId) -> Result<Arc<FragmentInfo>> {
        let info = lock(&self.pools).get(pool);

        match info {
            Err(_) if lock(&self.state).state == SessionState::Closed => Err(Error::SessionClosed),
            x => x,
        }
    }

    fn key_lost(&self, key_id: &KeyId) -> bool {
        let state = lock(&self.state);
        state.state == SessionState::Renewing
            || !state.keys.status(key_id).is_some_and(KeyStatus::is_usable)
    }

    fn decrypt(
        &self,
        info: &FragmentInfo,
        scheme: EncryptionScheme,
        pattern: Pattern,
        iv: &[u8],
        input: &[u8],
        subsamples: &[Subsample],
    ) -> Result<Vec<u8>> {
        if !subsamples.is_empty() {
            check_layout(subsamples, input.len())?;
        }

        let output = if scheme == EncryptionScheme::Clear {
            if lock(&self.state).state == SessionState::Closed {
                return Err(Error::SessionClosed);
            }
            input.to_vec()
        } else {
            let iv = expand_iv(iv)?;
            let _guard = self.renewal.read().unwrap_or_else(PoisonError::into_inner);

            let (session_id, key_id) = {
                let state = lock(&self.state);
                let key_id = info.key_id.or(state.default_key_id).ok_or_else(|| {
                    Error::MalformedSample("no key id configured for the sample".to_owned())
                })?;

                match state.state {
                    SessionState::Closed => return Err(Error::SessionClosed),
                    x if !x.can_decrypt() => return Err(Error::KeyNotReady { key_id }),
                    _ => (),
                }

                if !state.keys.status(&key_id).is_some_and(KeyStatus::is_usable) {
                    return Err(Error::KeyNotReady { key_id });
                }

                (state.session_id.clone(), key_id)
            };

            let packed = RepackedSample::new(input, subsamples, scheme, pattern)?;

            if packed.is_empty() {
                input.to_vec()
            } else {
                let request = DecryptRequest {
                    key_id,
                    iv,
                    scheme,
                    pattern,
                    data: packed.data(),
                    subsamples: packed.subsamples(),
                    iv_per_subsample: resets_iv_per_subsample(scheme, pattern),
                };

                let clear = match self.cdm.decrypt(&session_id, &request) {
                    Ok(x) => x,
                    // the key expired under us, a renewal is on its way
                    Err(CdmStatus::NoKey) if self.key_lost(&key_id) => {
                        debug!(
                            "session {} lost key {} while decrypting",
                            session_id, key_id
                        );
                        return Err(Error::KeyNotReady { key_id });
                    }
                    Err(status) => {
                        warn!(
                            "session {} failed to decrypt sample with key {} ({})",
                            session_id, key_id, status
                        );
                        return Err(Error::BackendDecrypt { key_id, status });
                    }
                };

                packed
                    .restore(input, &clear)
                    .ok_or(Error::BackendDecrypt {
                        key_id,
                        status: CdmStatus::Unexpected,
                    })?
            }
        };

        if info.annexb && info.nal_length_size > 0 {
            return nal::to_annexb(&output, info.nal_length_size, &info.parameter_sets);
        }

        Ok(output)
    }

    fn apply_response(&self, response: &[u8]) -> Result<()> {
        let session_id = {
            let state = lock(&self.state);
            if state.state == SessionState::Closed {
                debug!(
                    "discarding license response for closed session {}",
                    state.session_id
                );
                return Ok(());
            }
            state.session_id.clone()
        };

        {
            let guard = self.renewal.write().unwrap_or_else(PoisonError::into_inner);

            if let Err(status) = self.cdm.update(&session_id, response) {
                drop(guard);
                warn!("session {} rejected license ({})", session_id, status);
                self.close(true);
                return Err(Error::SessionCreate(format!(
                    "backend rejected license ({})",
                    status
                )));
            }

            let statuses = self.cdm.key_statuses(&session_id).unwrap_or_default();
            let mut state = lock(&self.state);

            if state.state == SessionState::Closed {
                return Ok(());
            }

            state.keys.replace_all(statuses);
            state.challenge = None;
            state.state = SessionState::Licensed;

            if !state.keys.has_usable() {
                warn!("session {} licensed without a usable key", session_id);
            }

            info!(
                "session {} licensed with {} keys",
                session_id,
                state.keys.len()
            );
        }

        self.schedule_renewal(&session_id);
        Ok(())
    }

    fn schedule_renewal(&self, session_id: &str) {
        let Ok(Some(expiration)) = self.cdm.expiration(session_id) else {
            return;
        };

        let remaining = expiration - self.host.clock.now_ms();
        if remaining <= 0 {
            return;
        }

        let delay = if remaining > 2 * RENEWAL_MARGIN_MS {
            remaining - RENEWAL_MARGIN_MS
        } else {
            remaining / 2
        };

        let Some(me) = self.me.upgrade() else {
            return;
        };

        debug!("session {} renews in {} ms", session_id, delay);
        self.host
            .timers
            .set_timeout(Duration::from_millis(delay as u64), me, 0);

        if lock(&self.state).state == SessionState::Closed {
            self.host.timers.cancel(self);
        }
    }

    fn request_renewal(&self) {
        let session_id = {
            let state = lock(&self.state);
            if state.state != SessionState::Licensed {
                return;
            }
            state.session_id.clone()
        };

        debug!("session {} requests license renewal", session_id);
        if let Err(e) = self.cdm.request_renewal(&session_id) {
            warn!("session {} cannot request renewal ({})", session_id, e);
        }
    }

    /// Close the session. `release` is false when the backend already
    /// dropped it.
    pub(crate) fn close(&self, release: bool) {
        let session_id = {
            let mut state = lock(&self.state);
            if state.state == SessionState::Closed {
                return;
            }
            state.state = SessionState::Closed;
            state.challenge = None;
            self.challenge_ready.notify_all();
            state.session_id.clone()
        };

        self.router.unregister(&session_id);
        self.host.timers.cancel(self);

        let _guard = self.renewal.write().unwrap_or_else(PoisonError::into_inner);
        lock(&self.pools).clear();

        if release {
            if let Err(e) = self.cdm.close(&session_id) {
                debug!("backend failed to close session {} ({})", session_id, e);
            }
        }

        info!("session {} closed", session_id);
    }

    pub(crate) fn on_message(&self, message_type: MessageType, message: &[u8]) {
        let mut state = lock(&self.state);

        if state.state == SessionState::Closed {
            return;
        }

        match message_type {
            MessageType::LicenseRequest | MessageType::IndividualizationRequest => {
                state.challenge = Some(message.to_vec());
                if !state.state.can_decrypt() {
                    state.state = SessionState::ChallengePending;
                }
            }
            MessageType::LicenseRenewal => {
                state.challenge = Some(message.to_vec());
                state.state = if state.state.can_decrypt() {
                    SessionState::Renewing
                } else {
                    SessionState::ChallengePending
                };
                info!("session {} is renewing its license", state.session_id);
            }
            MessageType::LicenseRelease => {
                debug!("session {} ignores license release", state.session_id);
                return;
            }
        }

        debug!(
            "session {} received {} byte {:?} message",
            state.session_id,
            message.len(),
            message_type
        );
        self.challenge_ready.notify_all();
    }

    pub(crate) fn on_key_statuses_change(&self, has_usable_key: bool) {
        let session_id = {
            let state = lock(&self.state);
            if state.state == SessionState::Closed {
                return;
            }
            state.session_id.clone()
        };

        let statuses = self.cdm.key_statuses(&session_id).unwrap_or_default();
        let renew = {
            let mut state = lock(&self.state);
            if state.state == SessionState::Closed {
                return;
            }

            for (key_id, status) in statuses {
                state.keys.upsert(key_id, status);
            }

            debug!(
                "session {} key statuses changed, usable key: {}",
                session_id, has_usable_key
            );

            match state.state {
                SessionState::Created | SessionState::ChallengePending if has_usable_key => {
                    state.challenge = None;
                    state.state = SessionState::Licensed;
                    false
                }
                SessionState::Licensed => !has_usable_key,
                _ => false,
            }
        };

        if renew {
            self.request_renewal();
        }
    }

    pub(crate) fn on_remove_complete(&self) {
        self.close(false);
    }
}

impl TimerClient for SessionShared {
    fn on_timer_expired(&self, _: u64) {
        self.request_renewal();
    }
}

fn expand_iv(iv: &[u8]) -> Result<[u8; 16]> {
    let mut output = [0; 16];

    match iv.len() {
        16 | 8 => output[..iv.len()].copy_from_slice(iv),
        x => {
            return Err(Error::MalformedSample(format!(
                "iv must be 8 or 16 bytes, got {}",
                x
            )));
        }
    }

    Ok(output)
}

/// W3C `keyids` init data for `key_ids`.
fn key_ids_init_data(key_ids: &[KeyId]) -> Vec<u8> {
    let kids = key_ids
        .iter()
        .map(|x| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(x.as_bytes()))
        .collect::<Vec<_>>();

    serde_json::json!({ "kids": kids }).to_string().into_bytes()
}
