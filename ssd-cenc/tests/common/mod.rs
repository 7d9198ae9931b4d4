#![allow(dead_code)]

use aes::{
    Aes128,
    cipher::{BlockEncryptMut, KeyIvInit, StreamCipher, block_padding::NoPadding},
};
use ssd_cenc::{
    Adapter, AdapterConfig, KeyId, KeyStatus, Result, SecureOutput,
    cdm::{
        CERTIFICATE_BLOB, Cdm, CdmEvents, CdmResult, CdmStatus, ClearKeyCdm, DecryptRequest,
        InitDataType, MessageType, OutputRequirements,
    },
    host::{Clock, Host, MemoryStore},
    transport::{LicenseRequest, LicenseResponse, LicenseTransport},
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, LazyLock, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

pub const XOR: u8 = 0xaa;

pub static TEST_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("ssd-cenc-tests");
    std::fs::create_dir_all(&dir).ok();
    dir
});

pub fn kid(byte: u8) -> KeyId {
    KeyId::from([byte; 16])
}

/// Decrypt call as seen by the stub backend.
#[derive(Clone, Debug)]
pub struct RecordedDecrypt {
    pub key_id: KeyId,
    pub iv: [u8; 16],
    pub data: Vec<u8>,
    pub subsamples: Vec<(u16, u32)>,
    pub iv_per_subsample: bool,
}

#[derive(Default)]
pub struct StubState {
    pub events: Option<Arc<dyn CdmEvents>>,
    pub host: Option<Host>,
    pub keys: HashMap<String, Vec<(KeyId, KeyStatus)>>,
    pub calls: Vec<String>,
    pub decrypts: Vec<RecordedDecrypt>,
    pub expiration: Option<i64>,
    pub create_error: Option<CdmStatus>,
    pub decrypt_error: Option<CdmStatus>,
    pub needs_provisioning: bool,
    pub reject_secure: bool,
    pub requirements: OutputRequirements,
    next_session: u32,
}

/// Test double backend.
///
/// Challenges are `challenge:<init data>`, a license is a comma separated
/// list of hex key ids (all usable) or `reject`, and decryption XORs every
/// byte with [`XOR`].
#[derive(Default)]
pub struct StubCdm {
    state: Mutex<StubState>,
}

impl StubCdm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|x| *x == call).count()
    }

    pub fn events(&self) -> Arc<dyn CdmEvents> {
        self.state().events.clone().unwrap()
    }

    /// Change one key status and notify, as a backend does on its own.
    pub fn set_key_status(&self, session_id: &str, key_id: KeyId, status: KeyStatus) {
        let has_usable_key = {
            let mut state = self.state();
            let keys = state.keys.entry(session_id.to_owned()).or_default();
            match keys.iter_mut().find(|(x, _)| *x == key_id) {
                Some((_, x)) => *x = status,
                None => keys.push((key_id, status)),
            }
            keys.iter().any(|(_, x)| x.is_usable())
        };

        self.events()
            .on_key_statuses_change(session_id, has_usable_key);
    }

    pub fn license(key_ids: &[KeyId]) -> Vec<u8> {
        key_ids
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }

    fn record(&self, call: &str) {
        self.state().calls.push(call.to_owned());
    }
}

impl Cdm for StubCdm {
    fn initialize(
        &self,
        host: Host,
        events: Arc<dyn CdmEvents>,
        config: &AdapterConfig,
    ) -> CdmResult<()> {
        self.record("initialize");

        let mut state = self.state();
        if state.reject_secure && config.secure_output == SecureOutput::Secure {
            return Err(CdmStatus::NotSupported);
        }

        state.host = Some(host);
        state.events = Some(events);
        Ok(())
    }

    fn create_session(&self) -> CdmResult<String> {
        self.record("create_session");
        let mut state = self.state();

        if let Some(e) = state.create_error {
            return Err(e);
        }

        let provisioned = state
            .host
            .as_ref()
            .is_some_and(|x| x.storage.exists(CERTIFICATE_BLOB));
        if state.needs_provisioning && !provisioned {
            return Err(CdmStatus::NeedsProvisioning);
        }

        state.next_session += 1;
        let session_id = format!("stub-{}", state.next_session);
        state.keys.insert(session_id.clone(), Vec::new());
        Ok(session_id)
    }

    fn generate_request(
        &self,
        session_id: &str,
        _: InitDataType,
        init_data: &[u8],
    ) -> CdmResult<()> {
        self.record("generate_request");
        let mut challenge = b"challenge:".to_vec();
        challenge.extend_from_slice(init_data);
        self.events()
            .on_message(session_id, MessageType::LicenseRequest, &challenge);
        Ok(())
    }

    fn update(&self, session_id: &str, response: &[u8]) -> CdmResult<()> {
        self.record("update");

        if response == b"reject" {
            return Err(CdmStatus::TypeError);
        }

        let keys = String::from_utf8_lossy(response)
            .split(',')
            .filter(|x| !x.is_empty())
            .map(|x| x.parse::<KeyId>().map(|x| (x, KeyStatus::Usable)))
            .collect::<Result<Vec<_>>>()
            .map_err(|_| CdmStatus::TypeError)?;
        let has_usable_key = !keys.is_empty();

        self.state().keys.insert(session_id.to_owned(), keys);
        self.events()
            .on_key_statuses_change(session_id, has_usable_key);
        Ok(())
    }

    fn key_statuses(&self, session_id: &str) -> CdmResult<Vec<(KeyId, KeyStatus)>> {
        self.state()
            .keys
            .get(session_id)
            .cloned()
            .ok_or(CdmStatus::SessionNotFound)
    }

    fn decrypt(&self, _: &str, request: &DecryptRequest<'_>) -> CdmResult<Vec<u8>> {
        let mut state = self.state();
        state.calls.push("decrypt".to_owned());
        state.decrypts.push(RecordedDecrypt {
            key_id: request.key_id,
            iv: request.iv,
            data: request.data.to_vec(),
            subsamples: request
                .subsamples
                .iter()
                .map(|x| (x.clear_bytes, x.cipher_bytes))
                .collect(),
            iv_per_subsample: request.iv_per_subsample,
        });

        if let Some(e) = state.decrypt_error {
            return Err(e);
        }

        Ok(request.data.iter().map(|x| x ^ XOR).collect())
    }

    fn close(&self, session_id: &str) -> CdmResult<()> {
        self.record("close");
        self.state()
            .keys
            .remove(session_id)
            .map(|_| ())
            .ok_or(CdmStatus::SessionNotFound)
    }

    fn request_renewal(&self, session_id: &str) -> CdmResult<()> {
        self.record("request_renewal");
        self.events()
            .on_message(session_id, MessageType::LicenseRenewal, b"renewal");
        Ok(())
    }

    fn expiration(&self, _: &str) -> CdmResult<Option<i64>> {
        Ok(self.state().expiration)
    }

    fn output_requirements(&self, _: &str, _: &KeyId) -> OutputRequirements {
        self.state().requirements
    }

    fn provisioning_request(&self) -> CdmResult<Option<Vec<u8>>> {
        self.record("provisioning_request");
        Ok(self
            .state()
            .needs_provisioning
            .then(|| b"provision-me".to_vec()))
    }

    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<()> {
        self.record("handle_provisioning_response");
        let state = self.state();
        let host = state.host.as_ref().ok_or(CdmStatus::InvalidState)?;
        host.storage
            .write(CERTIFICATE_BLOB, response)
            .map_err(|_| CdmStatus::Unexpected)
    }

    fn terminate(&self) {
        self.record("terminate");
    }
}

type Responder = Box<dyn Fn(&LicenseRequest) -> LicenseResponse + Send + Sync>;

/// Transport answering every request with a closure and recording requests.
pub struct StubTransport {
    responder: Responder,
    pub requests: Mutex<Vec<LicenseRequest>>,
}

impl StubTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&LicenseRequest) -> LicenseResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answer with `status` and `body` regardless of the request.
    pub fn fixed(status: u16, body: &[u8]) -> Arc<Self> {
        let body = body.to_vec();
        Self::new(move |_| LicenseResponse {
            status,
            headers: Vec::new(),
            body: body.clone(),
        })
    }

    /// Answer ClearKey license requests with `keys`.
    pub fn clearkey_server(keys: Vec<(KeyId, [u8; 16])>, expiration: Option<i64>) -> Arc<Self> {
        Self::new(move |request| {
            let requested = ClearKeyCdm::requested_key_ids(&request.body).unwrap_or_default();
            let keys = keys
                .iter()
                .filter(|(x, _)| requested.contains(x))
                .copied()
                .collect::<Vec<_>>();

            LicenseResponse {
                status: 200,
                headers: Vec::new(),
                body: ClearKeyCdm::license(&keys, expiration),
            }
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl LicenseTransport for StubTransport {
    fn submit(&self, request: &LicenseRequest) -> Result<LicenseResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok((self.responder)(request))
    }
}

/// Clock only moving when told to.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(now_ms)))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adapter over a fresh [`StubCdm`] with in-memory storage.
pub fn stub_adapter(config: AdapterConfig) -> Result<(Arc<StubCdm>, Adapter)> {
    let cdm = StubCdm::new();
    let adapter = Adapter::initialize(
        config,
        cdm.clone(),
        Arc::new(MemoryStore::new()),
        StubTransport::fixed(500, b""),
    )?;
    Ok((cdm, adapter))
}

/// Poll `condition` for up to five seconds.
pub fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }

    condition()
}

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|x| (x * 7 + 3) as u8).collect()
}

pub fn ctr_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    ctr::Ctr128BE::<Aes128>::new(key.into(), iv.into()).apply_keystream(data);
}

/// CBC encrypt whole blocks of `data` in place, returning the last
/// ciphertext block for chaining.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> [u8; 16] {
    let len = data.len();
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .unwrap();

    let mut last = *iv;
    if len >= 16 {
        last.copy_from_slice(&data[len - 16..]);
    }
    last
}
