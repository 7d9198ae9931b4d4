#![cfg_attr(docsrs, feature(doc_cfg))]

//! This crate contains per-track CENC/CBCS decryption sessions on top of a
//! pluggable DRM backend ([`cdm::Cdm`]).
//!
//! An [`Adapter`] owns one backend instance and routes its events to the
//! [`Session`]s opened through it. A session runs the license exchange,
//! tracks key statuses, holds fragment pools and decrypts samples by packing
//! their protected bytes into the layout the backend expects.
//!
//! # Example
//!
//! ```no_run
//! use ssd_cenc::{
//!     Adapter, AdapterConfig, EncryptionScheme, Pattern, SessionOptions, Subsample,
//!     cdm::ClearKeyCdm,
//!     host::MemoryStore,
//!     pool::{CryptoInfo, FragmentInfo},
//! };
//! use std::sync::Arc;
//!
//! # fn transport() -> Arc<dyn ssd_cenc::transport::LicenseTransport> { unimplemented!() }
//! let key_id = "eb676abbcb345e96bbcf616630f1a3da".parse()?;
//! let cdm = ClearKeyCdm::new().with_keys([(key_id, [0x10; 16])]);
//! let adapter = Adapter::initialize(
//!     AdapterConfig::default(),
//!     Arc::new(cdm),
//!     Arc::new(MemoryStore::new()),
//!     transport(),
//! )?;
//!
//! let session = adapter.open_session(
//!     SessionOptions::default()
//!         .key_hint(key_id)
//!         .skip_session_message(true),
//! )?;
//! let crypto = CryptoInfo {
//!     scheme: EncryptionScheme::AesCtr,
//!     pattern: Pattern::NONE,
//!     iv_size: 8,
//! };
//! let pool = session.add_pool(crypto);
//! session.set_fragment_info(pool, FragmentInfo::new(key_id, crypto))?;
//!
//! let sample = vec![0; 100];
//! let clear = session.decrypt_sample(pool, &[0; 8], &sample, &[Subsample::new(16, 84)])?;
//! # Ok::<(), ssd_cenc::Error>(())
//! ```
//!
//! # Optional Features
//!
//! - **http**: Enables [`transport::HttpTransport`], a blocking `reqwest` transport.
//! - **native-tls**: `http` with the platform TLS stack.
//! - **rustls-tls-webpki-roots**: `http` with rustls.

pub mod cdm;
pub mod host;
pub mod license;
pub mod nal;
pub mod pool;
pub mod pssh;
pub mod repack;
pub mod transport;

mod adapter;
mod config;
mod error;
mod key;
mod reader;
mod sample;
mod session;

pub use adapter::Adapter;
pub use config::{AdapterConfig, SecureOutput, SessionOptions};
pub use error::{Error, Result};
pub use key::{KeyId, KeyStatus, KeyTable};
pub use reader::{BoxHeader, Reader};
pub use sample::{AES_BLOCK_SIZE, EncryptionScheme, Pattern, Subsample, check_layout};
pub use session::{Capabilities, MediaType, Session, SessionState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if another thread panicked with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
