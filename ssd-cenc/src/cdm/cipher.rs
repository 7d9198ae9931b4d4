use super::{CdmResult, CdmStatus, DecryptRequest};
use crate::sample::{AES_BLOCK_SIZE, EncryptionScheme};
use aes::{
    Aes128,
    cipher::{
        BlockDecryptMut, KeyIvInit, StreamCipher, block_padding::NoPadding,
        generic_array::GenericArray,
    },
};
use std::ops::Range;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypt the packed buffer of `request` with `key`.
///
/// The buffer only holds protected bytes, so CTR runs share one keystream and
/// CBC runs share one chain unless the request restarts from its IV for
/// every run. A trailing partial CBC block is left as is.
pub(crate) fn decrypt(key: &[u8; 16], request: &DecryptRequest<'_>) -> CdmResult<Vec<u8>> {
    let mut output = request.data.to_vec();
    let ranges = protected_ranges(request)?;

    match request.scheme {
        EncryptionScheme::Clear => (),
        EncryptionScheme::AesCtr => {
            let mut cipher = ctr_cipher(key, &request.iv);

            for range in ranges {
                if request.iv_per_subsample {
                    cipher = ctr_cipher(key, &request.iv);
                }
                cipher.apply_keystream(&mut output[range]);
            }
        }
        EncryptionScheme::AesCbc => {
            let mut iv = request.iv;

            for range in ranges {
                if request.iv_per_subsample {
                    iv = request.iv;
                }

                let run = &mut output[range];
                let blocks = run.len() - run.len() % AES_BLOCK_SIZE;
                if blocks == 0 {
                    continue;
                }

                let mut next_iv = [0; 16];
                next_iv.copy_from_slice(&run[blocks - AES_BLOCK_SIZE..blocks]);

                Aes128CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv))
                    .decrypt_padded_mut::<NoPadding>(&mut run[..blocks])
                    .map_err(|_| CdmStatus::DecryptError)?;
                iv = next_iv;
            }
        }
    }

    Ok(output)
}

fn ctr_cipher(key: &[u8; 16], iv: &[u8; 16]) -> Aes128Ctr {
    Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

fn protected_ranges(request: &DecryptRequest<'_>) -> CdmResult<Vec<Range<usize>>> {
    if request.subsamples.is_empty() {
        return Ok(vec![0..request.data.len()]);
    }

    let mut ranges = Vec::with_capacity(request.subsamples.len());
    let mut offset = 0;

    for subsample in request.subsamples {
        offset += subsample.clear_bytes as usize;
        let end = offset + subsample.cipher_bytes as usize;

        if end > request.data.len() {
            return Err(CdmStatus::TypeError);
        }

        ranges.push(offset..end);
        offset = end;
    }

    Ok(ranges)
}
