//! Backend lifecycle and routing of backend events to their sessions.

use crate::{
    Error, Result,
    cdm::{CERTIFICATE_BLOB, Cdm, CdmEvents, MessageType},
    config::{AdapterConfig, SessionOptions},
    host::{BlobStore, Host},
    lock,
    session::{Session, SessionShared},
    transport::{LicenseRequest, LicenseTransport},
};
use log::{debug, info, trace};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

/// Session id to session lookup. Holds no ownership: a session that was
/// dropped simply stops receiving events.
#[derive(Default)]
pub(crate) struct Router {
    sessions: Mutex<HashMap<String, Weak<SessionShared>>>,
}

impl Router {
    pub(crate) fn register(&self, session_id: &str, session: &Arc<SessionShared>) {
        lock(&self.sessions).insert(session_id.to_owned(), Arc::downgrade(session));
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        lock(&self.sessions).remove(session_id);
    }

    /// The lock is released before the caller dispatches to the session.
    fn get(&self, session_id: &str) -> Option<Arc<SessionShared>> {
        let session = lock(&self.sessions).get(session_id).and_then(Weak::upgrade);

        if session.is_none() {
            trace!("dropping event for unknown session {}", session_id);
        }

        session
    }

    fn drain(&self) -> Vec<Arc<SessionShared>> {
        lock(&self.sessions)
            .drain()
            .filter_map(|(_, x)| x.upgrade())
            .collect()
    }

    fn len(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|x| x.strong_count() > 0)
            .count()
    }
}

impl CdmEvents for Router {
    fn on_message(&self, session_id: &str, message_type: MessageType, message: &[u8]) {
        if let Some(session) = self.get(session_id) {
            session.on_message(message_type, message);
        }
    }

    fn on_key_statuses_change(&self, session_id: &str, has_usable_key: bool) {
        if let Some(session) = self.get(session_id) {
            session.on_key_statuses_change(has_usable_key);
        }
    }

    fn on_remove_complete(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.on_remove_complete();
        }
    }
}

/// Owner of one backend instance.
///
/// Dropping the adapter closes every session still open before the backend
/// is terminated.
pub struct Adapter {
    cdm: Arc<dyn Cdm>,
    host: Host,
    router: Arc<Router>,
    transport: Arc<dyn LicenseTransport>,
    config: AdapterConfig,
    provisioning: Mutex<()>,
}

impl Adapter {
    /// Start `cdm` with `storage`, a system clock and fresh timers.
    pub fn initialize(
        config: AdapterConfig,
        cdm: Arc<dyn Cdm>,
        storage: Arc<dyn BlobStore>,
        transport: Arc<dyn LicenseTransport>,
    ) -> Result<Self> {
        Self::with_host(config, cdm, Host::new(storage), transport)
    }

    pub fn with_host(
        config: AdapterConfig,
        cdm: Arc<dyn Cdm>,
        host: Host,
        transport: Arc<dyn LicenseTransport>,
    ) -> Result<Self> {
        let router = Arc::new(Router::default());

        if let Some(certificate) = config
            .server_certificate_bytes()
            .map_err(|e| Error::BackendInit(e.to_string()))?
        {
            debug!("using {} byte server certificate", certificate.len());
        }

        cdm.initialize(host.clone(), router.clone(), &config)
            .map_err(|e| Error::BackendInit(e.to_string()))?;

        info!("backend initialized");
        Ok(Self {
            cdm,
            host,
            router,
            transport,
            config,
            provisioning: Mutex::new(()),
        })
    }

    /// Provision the device unless a certificate is already stored or the
    /// backend needs none. Calling it again once provisioned does nothing.
    pub fn ensure_provisioned(&self) -> Result<()> {
        let _guard = lock(&self.provisioning);

        if self.host.storage.exists(CERTIFICATE_BLOB) {
            trace!("device already provisioned");
            return Ok(());
        }

        let request = self
            .cdm
            .provisioning_request()
            .map_err(|e| Error::Provisioning(format!("backend refused request ({})", e)))?;

        let Some(body) = request else {
            debug!("backend needs no provisioning");
            return Ok(());
        };

        let url = self
            .config
            .provisioning_url
            .clone()
            .ok_or_else(|| Error::Provisioning("no provisioning url configured".to_owned()))?;

        info!("provisioning device at {}", url);
        let response = self
            .transport
            .submit(&LicenseRequest {
                url,
                headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
                body,
            })
            .map_err(|e| Error::Provisioning(e.to_string()))?;

        if !response.is_success() {
            return Err(Error::Provisioning(format!(
                "server responded with status {}",
                response.status
            )));
        }

        self.cdm
            .handle_provisioning_response(&response.body)
            .map_err(|e| Error::Provisioning(format!("backend rejected response ({})", e)))?;

        info!("device provisioned");
        Ok(())
    }

    /// Open a session, see [`Session::open`].
    pub fn open_session(&self, options: SessionOptions) -> Result<Session> {
        Session::open(self, options)
    }

    /// Route backend events for `session` to it. Sessions opened through
    /// this adapter are registered already.
    pub fn register_session(&self, session: &Session) {
        self.router.register(&session.session_id(), session.shared());
    }

    pub fn unregister_session(&self, session: &Session) {
        self.router.unregister(&session.session_id());
    }

    /// Number of sessions receiving events.
    pub fn session_count(&self) -> usize {
        self.router.len()
    }

    /// The event sink handed to the backend.
    pub fn events(&self) -> Arc<dyn CdmEvents> {
        self.router.clone()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn LicenseTransport> {
        &self.transport
    }

    pub(crate) fn cdm(&self) -> &Arc<dyn Cdm> {
        &self.cdm
    }

    pub(crate) fn host(&self) -> &Host {
        &self.host
    }

    pub(crate) fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        for session in self.router.drain() {
            session.close(true);
        }

        self.cdm.terminate();
        self.host.timers.cancel_all();
        info!("backend terminated");
    }
}
