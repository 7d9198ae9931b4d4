//! Sample encryption descriptors: schemes, patterns and subsample maps.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Cipher used to protect a sample.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionScheme {
    #[default]
    Clear,
    /// AES-128-CTR (`cenc`, `cens`).
    AesCtr,
    /// AES-128-CBC (`cbc1`, `cbcs`).
    AesCbc,
}

impl EncryptionScheme {
    /// Map a `schm` box scheme type four-cc to a cipher.
    pub fn from_scheme_type(scheme_type: u32) -> Option<Self> {
        match &scheme_type.to_be_bytes() {
            b"cenc" | b"cens" => Some(Self::AesCtr),
            b"cbc1" | b"cbcs" => Some(Self::AesCbc),
            _ => None,
        }
    }

    /// Granularity a protected run must respect when no pattern is active.
    pub fn block_size(self) -> usize {
        match self {
            Self::AesCbc => AES_BLOCK_SIZE,
            Self::AesCtr | Self::Clear => 1,
        }
    }
}

/// Crypt/skip block pattern in units of 16-byte blocks.
/// Both zero means every block of a protected run is encrypted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

impl Pattern {
    pub const NONE: Self = Self {
        crypt_byte_block: 0,
        skip_byte_block: 0,
    };

    pub fn new(crypt_byte_block: u8, skip_byte_block: u8) -> Self {
        Self {
            crypt_byte_block,
            skip_byte_block,
        }
    }

    pub fn is_active(&self) -> bool {
        self.crypt_byte_block != 0 || self.skip_byte_block != 0
    }

    pub(crate) fn crypt_size(&self) -> usize {
        self.crypt_byte_block as usize * AES_BLOCK_SIZE
    }

    pub(crate) fn skip_size(&self) -> usize {
        self.skip_byte_block as usize * AES_BLOCK_SIZE
    }
}

/// One `(clear, cipher)` run of a sample.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Subsample {
    /// Number of cleartext bytes at the start of the subsample.
    pub clear_bytes: u16,
    /// Number of protected bytes following the cleartext.
    pub cipher_bytes: u32,
}

impl Subsample {
    pub fn new(clear_bytes: u16, cipher_bytes: u32) -> Self {
        Self {
            clear_bytes,
            cipher_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.clear_bytes as usize + self.cipher_bytes as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse `count` big endian `(u16, u32)` entries as stored in a `senc` box.
    pub fn parse_entries(count: u16, data: &[u8]) -> Result<Vec<Self>> {
        let count = count as usize;

        if data.len() < count * 6 {
            return Err(Error::MalformedSample(format!(
                "insufficient subsample data: need {} bytes, got {}",
                count * 6,
                data.len()
            )));
        }

        Ok(data
            .chunks_exact(6)
            .take(count)
            .map(|x| Self {
                clear_bytes: u16::from_be_bytes([x[0], x[1]]),
                cipher_bytes: u32::from_be_bytes([x[2], x[3], x[4], x[5]]),
            })
            .collect())
    }
}

/// Check that a subsample map describes exactly `len` bytes.
pub fn check_layout(subsamples: &[Subsample], len: usize) -> Result<()> {
    let total = subsamples.iter().map(|x| x.len()).sum::<usize>();

    if total != len {
        return Err(Error::MalformedSample(format!(
            "subsamples describe {} bytes but sample has {} bytes",
            total, len
        )));
    }

    Ok(())
}
