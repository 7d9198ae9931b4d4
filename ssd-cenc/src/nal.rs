//! Length-prefixed to Annex-B NAL unit conversion for decoders that need
//! start codes and in-band parameter sets.

use crate::{Error, Result};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Replace every `nal_length_size` byte length prefix with a 4 byte start
/// code and prepend `parameter_sets` (already in Annex-B form).
pub fn to_annexb(data: &[u8], nal_length_size: u8, parameter_sets: &[u8]) -> Result<Vec<u8>> {
    let size = nal_length_size as usize;

    if !matches!(size, 1 | 2 | 4) {
        return Err(Error::MalformedSample(format!(
            "unsupported nal length size {}",
            nal_length_size
        )));
    }

    let mut output = Vec::with_capacity(parameter_sets.len() + data.len() + data.len() / 64);
    output.extend_from_slice(parameter_sets);

    let mut pos = 0;
    while pos < data.len() {
        if pos + size > data.len() {
            return Err(Error::MalformedSample(format!(
                "truncated nal length prefix at offset {}",
                pos
            )));
        }

        let nal_len = data[pos..pos + size]
            .iter()
            .fold(0usize, |acc, x| (acc << 8) | *x as usize);
        pos += size;

        if pos + nal_len > data.len() {
            return Err(Error::MalformedSample(format!(
                "nal unit of {} bytes at offset {} overruns sample of {} bytes",
                nal_len,
                pos,
                data.len()
            )));
        }

        output.extend_from_slice(&START_CODE);
        output.extend_from_slice(&data[pos..pos + nal_len]);
        pos += nal_len;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_length_prefixes() {
        let data = [0, 0, 0, 2, 0x65, 0xaa, 0, 0, 0, 1, 0x41];
        let output = to_annexb(&data, 4, &[]).unwrap();
        assert_eq!(output, [0, 0, 0, 1, 0x65, 0xaa, 0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn prepends_parameter_sets() {
        let sps_pps = [0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68];
        let output = to_annexb(&[0, 1, 0x65], 2, &sps_pps).unwrap();
        assert_eq!(&output[..10], &sps_pps);
        assert_eq!(&output[10..], &[0, 0, 0, 1, 0x65]);
    }

    #[test]
    fn rejects_overrun() {
        assert!(matches!(
            to_annexb(&[0, 0, 0, 9, 0x65], 4, &[]),
            Err(Error::MalformedSample(_))
        ));
        assert!(to_annexb(&[0, 0], 3, &[]).is_err());
    }
}
