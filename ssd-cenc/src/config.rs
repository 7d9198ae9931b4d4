//! Adapter and session configuration.

use crate::{Error, Result, key::KeyId};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Output protection requested from the backend.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecureOutput {
    #[default]
    None,
    /// Decrypted frames must stay on a protected path.
    Secure,
}

/// Settings for one [`crate::Adapter`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// License server template, see [`crate::license::LicenseTemplate`].
    pub license_url: String,
    /// Base64 encoded service certificate handed to the backend.
    pub server_certificate: Option<String>,
    pub secure_output: SecureOutput,
    /// Base directory of the per license domain blob stores.
    pub storage_dir: Option<PathBuf>,
    /// Server receiving device provisioning requests.
    pub provisioning_url: Option<String>,
    pub request_timeout_secs: u64,
    /// Provision the device when a session cannot be created without it.
    pub auto_provision: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            license_url: String::new(),
            server_certificate: None,
            secure_output: SecureOutput::None,
            storage_dir: None,
            provisioning_url: None,
            request_timeout_secs: 10,
            auto_provision: true,
        }
    }
}

impl AdapterConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn server_certificate_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.server_certificate
            .as_deref()
            .map(|x| {
                base64::engine::general_purpose::STANDARD
                    .decode(x.trim())
                    .map_err(|e| Error::License(format!("invalid server certificate: {}", e)))
            })
            .transpose()
    }
}

/// Settings for one [`crate::Session`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Raw `pssh` boxes (or other init data) for the license request.
    pub pssh: Vec<u8>,
    /// Key assumed for pools configured without one.
    pub default_key_id: Option<KeyId>,
    /// Keys expected in the license, tracked as pending until reported.
    pub key_hints: Vec<KeyId>,
    /// Keys are already installed in the backend, no license round trip.
    pub skip_session_message: bool,
    /// How long [`crate::Session::open`] waits for the first challenge.
    pub challenge_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pssh: Vec::new(),
            default_key_id: None,
            key_hints: Vec::new(),
            skip_session_message: false,
            challenge_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    pub fn new(pssh: Vec<u8>) -> Self {
        Self {
            pssh,
            ..Default::default()
        }
    }

    pub fn default_key_id(mut self, key_id: KeyId) -> Self {
        self.default_key_id = Some(key_id);
        self
    }

    pub fn key_hint(mut self, key_id: KeyId) -> Self {
        if !self.key_hints.contains(&key_id) {
            self.key_hints.push(key_id);
        }
        self
    }

    pub fn skip_session_message(mut self, skip: bool) -> Self {
        self.skip_session_message = skip;
        self
    }

    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"license_url":"https://example.com/lic","secure_output":"secure"}"#)
                .unwrap();
        assert_eq!(config.license_url, "https://example.com/lic");
        assert_eq!(config.secure_output, SecureOutput::Secure);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.auto_provision);
    }

    #[test]
    fn server_certificate_is_base64() {
        let mut config = AdapterConfig::default();
        assert!(config.server_certificate_bytes().unwrap().is_none());

        config.server_certificate = Some("AQID".to_owned());
        assert_eq!(config.server_certificate_bytes().unwrap(), Some(vec![1, 2, 3]));

        config.server_certificate = Some("***".to_owned());
        assert!(matches!(
            config.server_certificate_bytes(),
            Err(Error::License(_))
        ));
    }

    #[test]
    fn key_hints_are_unique() {
        let key_id = KeyId::from([1; 16]);
        let options = SessionOptions::new(vec![]).key_hint(key_id).key_hint(key_id);
        assert_eq!(options.key_hints, [key_id]);
    }
}
