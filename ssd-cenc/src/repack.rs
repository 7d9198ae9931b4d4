//! Conversion between the subsample layout of an encrypted sample and the
//! packed buffer a backend decrypts.
//!
//! Only the bytes that are really protected end up in the packed buffer:
//! cleartext runs and the skipped blocks of a crypt/skip pattern stay behind.
//! The packed buffer is described by one `(0, n)` subsample per protected run,
//! so the backend can continue a CTR keystream across run boundaries or
//! restart the CBC chain for every run, whichever the scheme asks for.
//!
//! Every offset is derived from the subsample descriptors while packing and
//! recorded in a [`Segment`]; restoring the sample reuses those segments and
//! never recomputes offsets on its own.

use crate::{
    Error, Result,
    sample::{EncryptionScheme, Pattern, Subsample, check_layout},
};

/// Protected bytes copied from `sample_offset` in the sample to
/// `packed_offset` in the packed buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    pub sample_offset: usize,
    pub packed_offset: usize,
    pub len: usize,
}

/// A sample split into cleartext (left in place) and protected bytes
/// (gathered into one contiguous buffer).
#[derive(Clone, Debug, Default)]
pub struct RepackedSample {
    data: Vec<u8>,
    subsamples: Vec<Subsample>,
    segments: Vec<Segment>,
    sample_len: usize,
}

impl RepackedSample {
    /// Pack the protected bytes of `input`.
    ///
    /// An empty `subsamples` map means the whole sample is one protected run.
    /// With no pattern active, a protected run of a block cipher must be a
    /// whole number of blocks.
    pub fn new(
        input: &[u8],
        subsamples: &[Subsample],
        scheme: EncryptionScheme,
        pattern: Pattern,
    ) -> Result<Self> {
        let mut packed = Self {
            sample_len: input.len(),
            ..Default::default()
        };

        if scheme == EncryptionScheme::Clear {
            if !subsamples.is_empty() {
                check_layout(subsamples, input.len())?;
            }
            return Ok(packed);
        }

        if subsamples.is_empty() {
            packed.push_run(input, 0, input.len(), scheme, pattern)?;
            return Ok(packed);
        }

        check_layout(subsamples, input.len())?;

        let mut offset = 0;
        for subsample in subsamples {
            offset += subsample.clear_bytes as usize;
            let len = subsample.cipher_bytes as usize;
            packed.push_run(input, offset, len, scheme, pattern)?;
            offset += len;
        }

        Ok(packed)
    }

    fn push_run(
        &mut self,
        input: &[u8],
        offset: usize,
        len: usize,
        scheme: EncryptionScheme,
        pattern: Pattern,
    ) -> Result<()> {
        let start = self.data.len();

        if !pattern.is_active() {
            if len % scheme.block_size() != 0 {
                return Err(Error::MalformedSample(format!(
                    "protected run of {} bytes at offset {} is not a multiple of {} byte blocks",
                    len,
                    offset,
                    scheme.block_size()
                )));
            }
            self.push_segment(input, offset, len);
        } else if pattern.crypt_byte_block != 0 {
            let crypt_size = pattern.crypt_size();
            let unit_size = crypt_size + pattern.skip_size();
            let mut pos = 0;

            while len - pos >= unit_size {
                self.push_segment(input, offset + pos, crypt_size);
                pos += unit_size;
            }

            // the last partial pattern unit is protected in full
            let tail = len - pos;
            if tail % scheme.block_size() != 0 {
                return Err(Error::MalformedSample(format!(
                    "pattern tail of {} bytes at offset {} is not a multiple of {} byte blocks",
                    tail,
                    offset + pos,
                    scheme.block_size()
                )));
            }
            self.push_segment(input, offset + pos, tail);
        }

        let protected = self.data.len() - start;
        if protected > 0 {
            self.subsamples.push(Subsample::new(0, protected as u32));
        }

        Ok(())
    }

    fn push_segment(&mut self, input: &[u8], sample_offset: usize, len: usize) {
        if len == 0 {
            return;
        }

        self.segments.push(Segment {
            sample_offset,
            packed_offset: self.data.len(),
            len,
        });
        self.data
            .extend_from_slice(&input[sample_offset..sample_offset + len]);
    }

    /// Protected bytes in sample order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Layout of [`Self::data`], one fully protected entry per protected run.
    pub fn subsamples(&self) -> &[Subsample] {
        &self.subsamples
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true if nothing in the sample is protected.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rebuild the sample shape from the original `input` and the backend's
    /// cleartext for [`Self::data`]. Returns `None` if either buffer does not
    /// have the length this layout was built for.
    pub fn restore(&self, input: &[u8], clear: &[u8]) -> Option<Vec<u8>> {
        if input.len() != self.sample_len || clear.len() != self.data.len() {
            return None;
        }

        let mut output = input.to_vec();

        for segment in &self.segments {
            output[segment.sample_offset..segment.sample_offset + segment.len].copy_from_slice(
                &clear[segment.packed_offset..segment.packed_offset + segment.len],
            );
        }

        Some(output)
    }
}

/// CBC pattern encryption (`cbcs`) restarts from the sample IV for every
/// subsample, every other scheme chains across subsamples.
pub fn resets_iv_per_subsample(scheme: EncryptionScheme, pattern: Pattern) -> bool {
    scheme == EncryptionScheme::AesCbc && pattern.is_active()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|x| x as u8).collect()
    }

    fn flip(data: &[u8]) -> Vec<u8> {
        data.iter().map(|x| x ^ 0xff).collect()
    }

    #[test]
    fn subsamples_keep_clear_bytes_in_place() {
        let input = sample(100);
        let packed = RepackedSample::new(
            &input,
            &[Subsample::new(16, 84)],
            EncryptionScheme::AesCtr,
            Pattern::NONE,
        )
        .unwrap();

        assert_eq!(packed.data(), &input[16..]);
        assert_eq!(packed.subsamples(), [Subsample::new(0, 84)]);

        let output = packed.restore(&input, &flip(packed.data())).unwrap();
        assert_eq!(output.len(), 100);
        assert_eq!(&output[..16], &input[..16]);
        assert_eq!(&output[16..], &flip(&input[16..])[..]);
    }

    #[test]
    fn empty_map_is_one_protected_run() {
        let input = sample(37);
        let packed =
            RepackedSample::new(&input, &[], EncryptionScheme::AesCtr, Pattern::NONE).unwrap();
        assert_eq!(packed.data(), &input[..]);
        assert_eq!(packed.subsamples(), [Subsample::new(0, 37)]);
    }

    #[test]
    fn empty_map_cbc_must_be_whole_blocks() {
        let input = sample(40);
        let result = RepackedSample::new(&input, &[], EncryptionScheme::AesCbc, Pattern::NONE);
        assert!(matches!(result, Err(Error::MalformedSample(_))));

        let packed =
            RepackedSample::new(&input[..32], &[], EncryptionScheme::AesCbc, Pattern::NONE)
                .unwrap();
        assert_eq!(packed.data(), &input[..32]);
    }

    #[test]
    fn multiple_runs_are_concatenated() {
        let input = sample(10 + 32 + 5 + 16 + 3);
        let map = [
            Subsample::new(10, 32),
            Subsample::new(5, 16),
            Subsample::new(3, 0),
        ];
        let packed =
            RepackedSample::new(&input, &map, EncryptionScheme::AesCbc, Pattern::NONE).unwrap();

        assert_eq!(
            packed.segments(),
            [
                Segment {
                    sample_offset: 10,
                    packed_offset: 0,
                    len: 32
                },
                Segment {
                    sample_offset: 47,
                    packed_offset: 32,
                    len: 16
                },
            ]
        );
        assert_eq!(
            packed.subsamples(),
            [Subsample::new(0, 32), Subsample::new(0, 16)]
        );

        let output = packed.restore(&input, &flip(packed.data())).unwrap();
        assert_eq!(&output[..10], &input[..10]);
        assert_eq!(&output[42..47], &input[42..47]);
        assert_eq!(&output[63..], &input[63..]);
    }

    #[test]
    fn layout_mismatch_is_malformed() {
        let input = sample(100);
        let result = RepackedSample::new(
            &input,
            &[Subsample::new(16, 80)],
            EncryptionScheme::AesCtr,
            Pattern::NONE,
        );
        assert!(matches!(result, Err(Error::MalformedSample(_))));
    }

    #[test]
    fn cbc_run_must_be_whole_blocks() {
        let input = sample(40);
        let result = RepackedSample::new(
            &input,
            &[Subsample::new(0, 40)],
            EncryptionScheme::AesCbc,
            Pattern::NONE,
        );
        assert!(matches!(result, Err(Error::MalformedSample(_))));
    }

    #[test]
    fn one_in_ten_pattern() {
        // two full pattern units plus a 48 byte tail
        let input = sample(8 + 160 * 2 + 48);
        let map = [Subsample::new(8, 368)];
        let packed = RepackedSample::new(
            &input,
            &map,
            EncryptionScheme::AesCbc,
            Pattern::new(1, 9),
        )
        .unwrap();

        let offsets = packed
            .segments()
            .iter()
            .map(|x| (x.sample_offset, x.len))
            .collect::<Vec<_>>();
        assert_eq!(offsets, [(8, 16), (168, 16), (328, 48)]);

        let output = packed.restore(&input, &flip(packed.data())).unwrap();
        for block in 0..20 {
            let range = 8 + block * 16..8 + (block + 1) * 16;
            if block % 10 == 0 {
                assert_ne!(&output[range.clone()], &input[range]);
            } else {
                assert_eq!(&output[range.clone()], &input[range]);
            }
        }
        assert_eq!(&output[328..], &flip(&input[328..])[..]);
    }

    #[test]
    fn ctr_pattern_tail_is_protected_in_full() {
        let input = sample(200);
        let packed = RepackedSample::new(
            &input,
            &[Subsample::new(0, 200)],
            EncryptionScheme::AesCtr,
            Pattern::new(1, 9),
        )
        .unwrap();

        let offsets = packed
            .segments()
            .iter()
            .map(|x| (x.sample_offset, x.len))
            .collect::<Vec<_>>();
        assert_eq!(offsets, [(0, 16), (160, 40)]);
        assert_eq!(packed.subsamples(), [Subsample::new(0, 56)]);

        let input = sample(20);
        let packed = RepackedSample::new(
            &input,
            &[Subsample::new(0, 20)],
            EncryptionScheme::AesCtr,
            Pattern::new(1, 9),
        )
        .unwrap();
        assert_eq!(packed.data(), &input[..]);
    }

    #[test]
    fn cbc_pattern_tail_must_be_whole_blocks() {
        let input = sample(180);
        let result = RepackedSample::new(
            &input,
            &[Subsample::new(0, 180)],
            EncryptionScheme::AesCbc,
            Pattern::new(1, 9),
        );
        assert!(matches!(result, Err(Error::MalformedSample(_))));
    }

    #[test]
    fn zero_crypt_pattern_is_clear() {
        let input = sample(64);
        let packed = RepackedSample::new(
            &input,
            &[Subsample::new(0, 64)],
            EncryptionScheme::AesCbc,
            Pattern::new(0, 9),
        )
        .unwrap();
        assert!(packed.is_empty());
        assert!(packed.subsamples().is_empty());
        assert_eq!(packed.restore(&input, &[]).unwrap(), input);
    }

    #[test]
    fn restore_rejects_wrong_lengths() {
        let input = sample(32);
        let packed =
            RepackedSample::new(&input, &[], EncryptionScheme::AesCtr, Pattern::NONE).unwrap();
        assert!(packed.restore(&input, &[0; 31]).is_none());
        assert!(packed.restore(&input[..31], &[0; 32]).is_none());
    }

    #[test]
    fn iv_reset_only_for_cbc_patterns() {
        assert!(resets_iv_per_subsample(
            EncryptionScheme::AesCbc,
            Pattern::new(1, 9)
        ));
        assert!(!resets_iv_per_subsample(
            EncryptionScheme::AesCbc,
            Pattern::NONE
        ));
        assert!(!resets_iv_per_subsample(
            EncryptionScheme::AesCtr,
            Pattern::new(1, 9)
        ));
    }
}
