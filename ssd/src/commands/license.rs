use anyhow::{Result, bail};
use base64::Engine;
use clap::Args;
use colored::Colorize;
use log::{debug, info};
use ssd_cenc::{
    Adapter, AdapterConfig, KeyStatus, SessionOptions,
    cdm::ClearKeyCdm,
    host::FileStore,
    license::{LicenseTemplate, license_exchange},
    pssh::PsshBox,
    transport::HttpTransport,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Args, Clone, Debug)]
/// Request content keys from a license server through a ClearKey session.
pub struct License {
    /// PSSH data input.
    /// Can be an init file path, a file of pssh boxes or base64 encoded PSSH boxes.
    #[arg(required = true, value_name = "PATH|BASE64")]
    input: String,

    /// License server url or template '<url>|<headers>|<body>|<response>'.
    #[arg(long, value_name = "TEMPLATE")]
    license_url: Option<String>,

    /// Extra headers for license request in same format as curl.
    ///
    /// This option can be used multiple times.
    #[arg(short = 'H', long = "header", value_name = "KEY:VALUE", value_parser = super::parse_header)]
    headers: Vec<(String, String)>,

    /// Base directory of the per license domain storage.
    #[arg(long, value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Adapter configuration file (json).
    #[arg(long, value_name = "JSON")]
    config: Option<PathBuf>,
}

impl License {
    fn pssh(&self) -> Result<Vec<u8>> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(self.input.trim());

        let data = if Path::new(&self.input).exists() {
            fs::read(&self.input)?
        } else if let Ok(data) = decoded {
            data
        } else {
            bail!("Unable to determine the INPUT type.");
        };

        let boxes = PsshBox::parse_all(&data)?;

        if boxes.is_empty() {
            bail!("No PSSH box found in INPUT.");
        }

        debug!("found {} pssh boxes", boxes.len());
        Ok(boxes.iter().flat_map(|x| x.to_bytes()).collect())
    }

    pub fn execute(self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => AdapterConfig::from_json_file(path)?,
            None => AdapterConfig::default(),
        };

        if let Some(license_url) = &self.license_url {
            config.license_url = license_url.clone();
        }

        if config.license_url.is_empty() {
            bail!(
                "License server url not provided. Use {} flag or set it in {}.",
                "--license-url".bold().green(),
                "--config".bold().green()
            );
        }

        let template = config.license_url.parse::<LicenseTemplate>()?;
        let storage_dir = self
            .storage
            .clone()
            .or_else(|| config.storage_dir.clone())
            .unwrap_or_else(|| env::temp_dir().join("ssd"));
        let storage = FileStore::for_license_url(storage_dir, &config.license_url);
        debug!("storage directory {}", storage.dir().display());

        let transport =
            HttpTransport::new(config.request_timeout())?.with_headers(self.headers.clone());
        let adapter = Adapter::initialize(
            config,
            Arc::new(ClearKeyCdm::new()),
            Arc::new(storage),
            Arc::new(transport),
        )?;

        let session = adapter.open_session(SessionOptions::new(self.pssh()?))?;
        info!("Requesting license for session {}", session.session_id());
        license_exchange(&session, adapter.transport().as_ref(), &template)?;

        for (kid, status) in session.key_statuses() {
            let status = match status {
                KeyStatus::Usable => status.to_string().green(),
                _ => status.to_string().red(),
            };
            println!("[{}] {} {}", "KEY".bold().green(), kid, status);
        }

        Ok(())
    }
}
