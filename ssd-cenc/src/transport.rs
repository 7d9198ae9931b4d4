//! Request/response exchange with license and provisioning servers.

use crate::Result;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LicenseRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LicenseResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl LicenseResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non success status into [`crate::Error::Transport`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(crate::Error::Transport {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }
}

/// Network channel to a license server. Any status code is a successful
/// submission, callers decide what a failure status means.
pub trait LicenseTransport: Send + Sync {
    fn submit(&self, request: &LicenseRequest) -> Result<LicenseResponse>;

    /// Run [`Self::submit`] on its own thread and hand the result to `callback`.
    fn submit_async<F>(
        self: Arc<Self>,
        request: LicenseRequest,
        callback: F,
    ) -> JoinHandle<()>
    where
        Self: Sized + 'static,
        F: FnOnce(Result<LicenseResponse>) + Send + 'static,
    {
        thread::spawn(move || callback(self.submit(&request)))
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::{LicenseRequest, LicenseResponse, LicenseTransport};
    use crate::Result;
    use log::debug;
    use reqwest::blocking::Client;
    use std::time::Duration;

    /// Blocking HTTP POST transport.
    #[derive(Clone, Debug)]
    pub struct HttpTransport {
        client: Client,
        headers: Vec<(String, String)>,
    }

    impl HttpTransport {
        pub fn new(timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: Client::builder().timeout(timeout).build()?,
                headers: Vec::new(),
            })
        }

        /// Headers sent with every request, before the request's own headers.
        pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
            self.headers = headers;
            self
        }
    }

    impl LicenseTransport for HttpTransport {
        fn submit(&self, request: &LicenseRequest) -> Result<LicenseResponse> {
            debug!("POST {} ({} bytes)", request.url, request.body.len());

            let mut builder = self.client.post(&request.url).body(request.body.clone());

            for (name, value) in self.headers.iter().chain(&request.headers) {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder.send()?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response.bytes()?.to_vec();

            debug!("license server responded with {} ({} bytes)", status, body.len());

            Ok(LicenseResponse {
                status,
                headers,
                body,
            })
        }
    }
}
