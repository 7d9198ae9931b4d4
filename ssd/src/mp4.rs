//! Just enough ISO-BMFF parsing to locate protected samples: the track
//! encryption defaults of an init segment (`schm`, `tenc`) and the sample
//! layout of a media segment (`tfhd`, `trun`, `senc`).

use anyhow::{Result, bail};
use ssd_cenc::{BoxHeader, EncryptionScheme, KeyId, Pattern, Reader, Subsample};

/// Bytes between the header of a visual sample entry and its child boxes.
const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;
const AUDIO_SAMPLE_ENTRY_SIZE: usize = 28;

const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x000010;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET: u32 = 0x000800;

const SENC_USE_SUBSAMPLE_ENCRYPTION: u32 = 0x000002;

/// Encryption defaults of a protected track.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackEncryption {
    pub scheme: EncryptionScheme,
    pub pattern: Pattern,
    pub default_key_id: KeyId,
    /// Size of the IVs stored in `senc`, 0 when `constant_iv` is used.
    pub per_sample_iv_size: u8,
    pub constant_iv: Vec<u8>,
}

impl TrackEncryption {
    /// Read the encryption defaults of the first protected track in `init`.
    pub fn parse(init: &[u8]) -> Result<Self> {
        let mut state = InitState::default();
        state.walk(init)?;

        let Some(mut track) = state.tenc else {
            bail!("No 'tenc' box found, the track is not protected.");
        };

        track.scheme = match state.scheme_type {
            Some(x) => match EncryptionScheme::from_scheme_type(x) {
                Some(x) => x,
                None => bail!(
                    "'{}' protection scheme is not supported.",
                    String::from_utf8_lossy(&x.to_be_bytes())
                ),
            },
            None => EncryptionScheme::AesCtr,
        };

        Ok(track)
    }
}

#[derive(Default)]
struct InitState {
    scheme_type: Option<u32>,
    tenc: Option<TrackEncryption>,
}

impl InitState {
    fn walk(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = Reader::new(data);

        while reader.remaining() >= 8 && self.tenc.is_none() {
            let header = BoxHeader::read(&mut reader)?;
            let payload = &data[header.payload_start()..header.end()];

            match &header.name {
                b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"sinf" | b"schi" => {
                    self.walk(payload)?
                }
                b"stsd" => self.walk(payload.get(8..).unwrap_or_default())?,
                b"encv" => self.walk(payload.get(VISUAL_SAMPLE_ENTRY_SIZE..).unwrap_or_default())?,
                b"enca" => self.walk(payload.get(AUDIO_SAMPLE_ENTRY_SIZE..).unwrap_or_default())?,
                b"schm" => {
                    let mut reader = Reader::new(payload);
                    reader.skip(4)?;
                    self.scheme_type = Some(reader.read_u32()?);
                }
                b"tenc" => self.tenc = Some(parse_tenc(payload)?),
                _ => (),
            }

            reader.skip(header.end() - reader.get_position())?;
        }

        Ok(())
    }
}

fn parse_tenc(payload: &[u8]) -> Result<TrackEncryption> {
    let mut reader = Reader::new(payload);
    let version = reader.read_u8()?;
    reader.skip(3 + 1)?;

    let pattern = match version {
        0 => {
            reader.skip(1)?;
            Pattern::NONE
        }
        _ => {
            let blocks = reader.read_u8()?;
            Pattern::new(blocks >> 4, blocks & 0x0f)
        }
    };

    let is_protected = reader.read_u8()?;
    let per_sample_iv_size = reader.read_u8()?;
    let default_key_id = KeyId::from(reader.read_array::<16>()?);

    let constant_iv = if is_protected == 1 && per_sample_iv_size == 0 {
        let size = reader.read_u8()?;
        reader.read_bytes(size as usize)?.to_vec()
    } else {
        Vec::new()
    };

    Ok(TrackEncryption {
        scheme: EncryptionScheme::Clear,
        pattern,
        default_key_id,
        per_sample_iv_size,
        constant_iv,
    })
}

/// Position and encryption parameters of one sample in a media segment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleEntry {
    pub offset: usize,
    pub size: usize,
    pub iv: Vec<u8>,
    /// Empty when the whole sample is protected.
    pub subsamples: Vec<Subsample>,
}

/// Samples of every `moof`/`mdat` pair in `segment`, in file order.
pub fn parse_segment(segment: &[u8], track: &TrackEncryption) -> Result<Vec<SampleEntry>> {
    let mut reader = Reader::new(segment);
    let mut samples = Vec::new();
    let mut fragment = None;

    while reader.remaining() >= 8 {
        let header = BoxHeader::read(&mut reader)?;
        let payload = &segment[header.payload_start()..header.end()];

        match &header.name {
            b"moof" => {
                let mut moof = Fragment {
                    moof_start: header.start,
                    ..Default::default()
                };
                moof.walk(payload, track)?;
                fragment = Some(moof);
            }
            b"mdat" => {
                if let Some(moof) = fragment.take() {
                    samples.extend(moof.samples(&header, track)?);
                }
            }
            _ => (),
        }

        reader.skip(header.end() - reader.get_position())?;
    }

    Ok(samples)
}

#[derive(Default)]
struct Fragment {
    moof_start: usize,
    base_data_offset: Option<u64>,
    default_sample_size: u32,
    data_offset: Option<i32>,
    sizes: Vec<u32>,
    ivs: Vec<Vec<u8>>,
    subsamples: Vec<Vec<Subsample>>,
}

impl Fragment {
    fn walk(&mut self, data: &[u8], track: &TrackEncryption) -> Result<()> {
        let mut reader = Reader::new(data);

        while reader.remaining() >= 8 {
            let header = BoxHeader::read(&mut reader)?;
            let payload = &data[header.payload_start()..header.end()];

            match &header.name {
                b"traf" => self.walk(payload, track)?,
                b"tfhd" => self.parse_tfhd(payload)?,
                b"trun" => self.parse_trun(payload)?,
                b"senc" => self.parse_senc(payload, track)?,
                _ => (),
            }

            reader.skip(header.end() - reader.get_position())?;
        }

        Ok(())
    }

    fn parse_tfhd(&mut self, payload: &[u8]) -> Result<()> {
        let mut reader = Reader::new(payload);
        let flags = reader.read_u32()? & 0xffffff;
        reader.skip(4)?; // track_ID

        if flags & TFHD_BASE_DATA_OFFSET != 0 {
            self.base_data_offset = Some(reader.read_u64()?);
        }
        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            reader.skip(4)?;
        }
        if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
            reader.skip(4)?;
        }
        if flags & TFHD_DEFAULT_SAMPLE_SIZE != 0 {
            self.default_sample_size = reader.read_u32()?;
        }

        Ok(())
    }

    fn parse_trun(&mut self, payload: &[u8]) -> Result<()> {
        let mut reader = Reader::new(payload);
        let flags = reader.read_u32()? & 0xffffff;
        let sample_count = reader.read_u32()?;

        if flags & TRUN_DATA_OFFSET != 0 {
            self.data_offset = Some(reader.read_i32()?);
        }
        if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            reader.skip(4)?;
        }

        for _ in 0..sample_count {
            if flags & TRUN_SAMPLE_DURATION != 0 {
                reader.skip(4)?;
            }

            self.sizes.push(if flags & TRUN_SAMPLE_SIZE != 0 {
                reader.read_u32()?
            } else {
                self.default_sample_size
            });

            if flags & TRUN_SAMPLE_FLAGS != 0 {
                reader.skip(4)?;
            }
            if flags & TRUN_SAMPLE_COMPOSITION_TIME_OFFSET != 0 {
                reader.skip(4)?;
            }
        }

        Ok(())
    }

    fn parse_senc(&mut self, payload: &[u8], track: &TrackEncryption) -> Result<()> {
        let mut reader = Reader::new(payload);
        let flags = reader.read_u32()? & 0xffffff;
        let sample_count = reader.read_u32()?;

        for _ in 0..sample_count {
            self.ivs.push(if track.per_sample_iv_size > 0 {
                reader
                    .read_bytes(track.per_sample_iv_size as usize)?
                    .to_vec()
            } else {
                track.constant_iv.clone()
            });

            self.subsamples
                .push(if flags & SENC_USE_SUBSAMPLE_ENCRYPTION != 0 {
                    let count = reader.read_u16()?;
                    let entries = reader.read_bytes(count as usize * 6)?;
                    Subsample::parse_entries(count, entries)?
                } else {
                    Vec::new()
                });
        }

        Ok(())
    }

    fn samples(self, mdat: &BoxHeader, track: &TrackEncryption) -> Result<Vec<SampleEntry>> {
        if !self.ivs.is_empty() && self.ivs.len() != self.sizes.len() {
            bail!(
                "'senc' describes {} samples but 'trun' lists {}.",
                self.ivs.len(),
                self.sizes.len()
            );
        }

        let mut offset = match self.data_offset {
            Some(x) => {
                let base = self.base_data_offset.unwrap_or(self.moof_start as u64) as i64;
                usize::try_from(base + x as i64)?
            }
            None => mdat.payload_start(),
        };

        let mut samples = Vec::with_capacity(self.sizes.len());

        for (i, size) in self.sizes.into_iter().enumerate() {
            let size = size as usize;

            if offset < mdat.payload_start() || offset + size > mdat.end() {
                bail!("Sample {} at offset {} lies outside of 'mdat'.", i, offset);
            }

            samples.push(SampleEntry {
                offset,
                size,
                iv: self
                    .ivs
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| track.constant_iv.clone()),
                subsamples: self.subsamples.get(i).cloned().unwrap_or_default(),
            });
            offset += size;
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp4_box(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut data = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(name);
        data.extend_from_slice(payload);
        data
    }

    fn full_box(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = (flags | (version as u32) << 24).to_be_bytes().to_vec();
        data.extend_from_slice(payload);
        mp4_box(name, &data)
    }

    fn init(scheme: &[u8; 4], tenc: Vec<u8>) -> Vec<u8> {
        let mut schm = scheme.to_vec();
        schm.extend_from_slice(&0x10000u32.to_be_bytes());

        let sinf = [
            mp4_box(b"frma", b"avc1"),
            full_box(b"schm", 0, 0, &schm),
            mp4_box(b"schi", &tenc),
        ]
        .concat();

        let mut encv = vec![0; VISUAL_SAMPLE_ENTRY_SIZE];
        encv.extend(mp4_box(b"sinf", &sinf));

        let mut stsd = 1u32.to_be_bytes().to_vec();
        stsd.extend(mp4_box(b"encv", &encv));

        let mut data = full_box(b"stsd", 0, 0, &stsd);
        for name in [b"stbl", b"minf", b"mdia", b"trak", b"moov"] {
            data = mp4_box(name, &data);
        }
        [mp4_box(b"ftyp", b"isom"), data].concat()
    }

    #[test]
    fn cenc_track() {
        let mut tenc = vec![0, 0, 1, 8];
        tenc.extend_from_slice(&[0xaa; 16]);
        let data = init(b"cenc", full_box(b"tenc", 0, 0, &tenc));

        let track = TrackEncryption::parse(&data).unwrap();
        assert_eq!(track.scheme, EncryptionScheme::AesCtr);
        assert_eq!(track.pattern, Pattern::NONE);
        assert_eq!(track.default_key_id, KeyId::from([0xaa; 16]));
        assert_eq!(track.per_sample_iv_size, 8);
        assert!(track.constant_iv.is_empty());
    }

    #[test]
    fn cbcs_track_with_constant_iv() {
        let mut tenc = vec![0, 0x19, 1, 0];
        tenc.extend_from_slice(&[0xbb; 16]);
        tenc.push(16);
        tenc.extend_from_slice(&[0x42; 16]);
        let data = init(b"cbcs", full_box(b"tenc", 1, 0, &tenc));

        let track = TrackEncryption::parse(&data).unwrap();
        assert_eq!(track.scheme, EncryptionScheme::AesCbc);
        assert_eq!(track.pattern, Pattern::new(1, 9));
        assert_eq!(track.per_sample_iv_size, 0);
        assert_eq!(track.constant_iv, vec![0x42; 16]);
    }

    #[test]
    fn unprotected_or_unknown_scheme() {
        assert!(TrackEncryption::parse(&mp4_box(b"moov", &[])).is_err());

        let mut tenc = vec![0, 0, 1, 8];
        tenc.extend_from_slice(&[0xaa; 16]);
        assert!(TrackEncryption::parse(&init(b"abcd", full_box(b"tenc", 0, 0, &tenc))).is_err());
    }

    #[test]
    fn segment_samples() {
        let track = TrackEncryption {
            scheme: EncryptionScheme::AesCtr,
            per_sample_iv_size: 8,
            ..Default::default()
        };

        let tfhd = full_box(b"tfhd", 0, TFHD_DEFAULT_SAMPLE_SIZE, &[0, 0, 0, 1, 0, 0, 0, 20]);

        let mut senc = 2u32.to_be_bytes().to_vec();
        senc.extend_from_slice(&[1; 8]);
        senc.extend_from_slice(&[0, 1, 0, 4, 0, 0, 0, 16]);
        senc.extend_from_slice(&[2; 8]);
        senc.extend_from_slice(&[0, 1, 0, 2, 0, 0, 0, 18]);
        let senc = full_box(b"senc", 0, SENC_USE_SUBSAMPLE_ENCRYPTION, &senc);

        // data offset is patched once the moof size is known
        let trun = |offset: i32| {
            let mut trun = 2u32.to_be_bytes().to_vec();
            trun.extend_from_slice(&offset.to_be_bytes());
            full_box(b"trun", 0, TRUN_DATA_OFFSET, &trun)
        };
        let moof = |offset: i32| {
            let traf = mp4_box(b"traf", &[tfhd.clone(), trun(offset), senc.clone()].concat());
            mp4_box(b"moof", &traf)
        };

        let moof_size = moof(0).len() as i32;
        let styp = mp4_box(b"styp", b"msdh");
        let data = [
            styp.clone(),
            moof(moof_size + 8),
            mp4_box(b"mdat", &[0; 40]),
        ]
        .concat();

        let samples = parse_segment(&data, &track).unwrap();
        let mdat_payload = styp.len() + moof_size as usize + 8;

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].offset, mdat_payload);
        assert_eq!(samples[0].size, 20);
        assert_eq!(samples[0].iv, vec![1; 8]);
        assert_eq!(samples[0].subsamples, vec![Subsample::new(4, 16)]);
        assert_eq!(samples[1].offset, mdat_payload + 20);
        assert_eq!(samples[1].subsamples, vec![Subsample::new(2, 18)]);
    }

    #[test]
    fn samples_must_fit_mdat() {
        let track = TrackEncryption::default();
        let tfhd = full_box(b"tfhd", 0, TFHD_DEFAULT_SAMPLE_SIZE, &[0, 0, 0, 1, 0, 0, 0, 64]);
        let trun = full_box(b"trun", 0, 0, &1u32.to_be_bytes());
        let data = [
            mp4_box(b"moof", &mp4_box(b"traf", &[tfhd, trun].concat())),
            mp4_box(b"mdat", &[0; 32]),
        ]
        .concat();

        assert!(parse_segment(&data, &track).is_err());
    }
}
