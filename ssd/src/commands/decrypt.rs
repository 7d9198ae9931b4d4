use crate::mp4::{self, TrackEncryption};
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use log::{debug, info};
use ssd_cenc::{
    Adapter, AdapterConfig, KeyId, SessionOptions,
    cdm::ClearKeyCdm,
    host::MemoryStore,
    pool::{CryptoInfo, FragmentInfo},
    transport::HttpTransport,
};
use std::{fs, path::PathBuf, sync::Arc};

#[derive(Args, Clone, Debug)]
/// Decrypt a protected fMP4 segment with known content keys.
pub struct Decrypt {
    /// Media segment to decrypt. May also contain the init segment.
    #[arg(required = true)]
    input: PathBuf,

    /// Init segment carrying the track encryption defaults.
    #[arg(long)]
    init: Option<PathBuf>,

    /// Content key in KID:KEY format.
    ///
    /// This option can be used multiple times.
    #[arg(short, long = "key", required = true, value_name = "KID:KEY", value_parser = super::parse_key)]
    keys: Vec<(KeyId, [u8; 16])>,

    /// Path of the decrypted segment.
    #[arg(short, long, required = true)]
    output: PathBuf,
}

impl Decrypt {
    pub fn execute(self) -> Result<()> {
        let mut data = fs::read(&self.input)?;
        let track = match &self.init {
            Some(init) => TrackEncryption::parse(&fs::read(init)?)?,
            None => TrackEncryption::parse(&data)?,
        };
        debug!(
            "{:?} track with default key id {} and pattern {}:{}",
            track.scheme,
            track.default_key_id,
            track.pattern.crypt_byte_block,
            track.pattern.skip_byte_block
        );

        let samples = mp4::parse_segment(&data, &track)?;

        if samples.is_empty() {
            bail!("No samples found in {}.", self.input.display());
        }

        let config = AdapterConfig::default();
        let transport = HttpTransport::new(config.request_timeout())?;
        let adapter = Adapter::initialize(
            config,
            Arc::new(ClearKeyCdm::new().with_keys(self.keys.clone())),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        )?;

        let session = adapter.open_session(
            SessionOptions::default()
                .key_hint(track.default_key_id)
                .skip_session_message(true),
        )?;

        if !session
            .key_status(&track.default_key_id)
            .is_some_and(|x| x.is_usable())
        {
            bail!(
                "No {} given for default key id {}.",
                "--key".bold().green(),
                track.default_key_id
            );
        }

        let crypto = CryptoInfo {
            scheme: track.scheme,
            pattern: track.pattern,
            iv_size: track.per_sample_iv_size,
        };
        let pool = session.add_pool(crypto);
        session.set_fragment_info(pool, FragmentInfo::new(track.default_key_id, crypto))?;

        for sample in &samples {
            let range = sample.offset..sample.offset + sample.size;
            let decrypted = session.decrypt(
                pool,
                track.scheme,
                track.pattern,
                &sample.iv,
                &data[range.clone()],
                &sample.subsamples,
            )?;
            data[range].copy_from_slice(&decrypted);
        }

        session.remove_pool(pool)?;
        fs::write(&self.output, &data)?;
        info!(
            "Decrypted {} samples into {}",
            samples.len(),
            self.output.display()
        );
        Ok(())
    }
}
