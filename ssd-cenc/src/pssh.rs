//! Mp4 `pssh` box parsing, used to derive the key ids a session will need.

use crate::{
    Error, Result,
    key::KeyId,
    reader::{BoxHeader, Reader},
};
use prost::Message;

pub const COMMON_SYSTEM_ID: [u8; 16] = [
    0x10, 0x77, 0xef, 0xec, 0xc0, 0xb2, 0x4d, 0x02, 0xac, 0xe3, 0x3c, 0x1e, 0x52, 0xe2, 0xfb, 0x4b,
];
pub const WIDEVINE_SYSTEM_ID: [u8; 16] = [
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21, 0xed,
];

/// Widevine system specific data.
#[derive(Clone, PartialEq, Message)]
pub struct WidevinePsshData {
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub key_ids: Vec<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub provider: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub content_id: Option<Vec<u8>>,
}

/// One parsed `pssh` box.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PsshBox {
    pub version: u8,
    pub system_id: [u8; 16],
    /// Key ids listed in a version 1 box.
    pub key_ids: Vec<KeyId>,
    pub data: Vec<u8>,
}

impl PsshBox {
    pub fn new(system_id: [u8; 16], key_ids: Vec<KeyId>, data: Vec<u8>) -> Self {
        Self {
            version: if key_ids.is_empty() { 0 } else { 1 },
            system_id,
            key_ids,
            data,
        }
    }

    /// Parse every `pssh` box in `data`, looking inside `moov` and `moof`.
    /// Boxes with an unknown version are skipped.
    pub fn parse_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut boxes = Vec::new();
        walk(data, &mut boxes)?;
        Ok(boxes)
    }

    fn parse(payload: &[u8]) -> Result<Option<Self>> {
        let mut reader = Reader::new(payload);
        let version = reader.read_u8()?;
        reader.skip(3)?;

        if version > 1 {
            return Ok(None);
        }

        let system_id = reader.read_array()?;
        let mut key_ids = Vec::new();

        if version == 1 {
            let count = reader.read_u32()?;
            for _ in 0..count {
                key_ids.push(KeyId::from(reader.read_array::<16>()?));
            }
        }

        let size = reader.read_u32()? as usize;
        let data = reader.read_bytes(size)?.to_vec();

        Ok(Some(Self {
            version,
            system_id,
            key_ids,
            data,
        }))
    }

    pub fn is_widevine(&self) -> bool {
        self.system_id == WIDEVINE_SYSTEM_ID
    }

    /// Key ids of the box: the version 1 list followed by any key ids
    /// carried in Widevine system data.
    pub fn all_key_ids(&self) -> Result<Vec<KeyId>> {
        let mut key_ids = self.key_ids.clone();

        if self.is_widevine() && !self.data.is_empty() {
            let data = WidevinePsshData::decode(self.data.as_slice())
                .map_err(|e| Error::License(format!("invalid widevine pssh data: {}", e)))?;

            for key_id in data.key_ids {
                key_ids.push(KeyId::from_slice(&key_id)?);
            }
        }

        Ok(key_ids)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = vec![self.version, 0, 0, 0];
        payload.extend_from_slice(&self.system_id);

        if self.version > 0 {
            payload.extend_from_slice(&(self.key_ids.len() as u32).to_be_bytes());
            for key_id in &self.key_ids {
                payload.extend_from_slice(key_id.as_bytes());
            }
        }

        payload.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        payload.extend_from_slice(&self.data);

        let mut output = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        output.extend_from_slice(b"pssh");
        output.extend_from_slice(&payload);
        output
    }
}

fn walk(data: &[u8], boxes: &mut Vec<PsshBox>) -> Result<()> {
    let mut reader = Reader::new(data);

    while reader.remaining() >= 8 {
        let header = BoxHeader::read(&mut reader)?;
        let payload = &data[header.payload_start()..header.end()];

        match &header.name {
            b"moov" | b"moof" => walk(payload, boxes)?,
            b"pssh" => boxes.extend(PsshBox::parse(payload)?),
            _ => (),
        }

        reader.skip(header.end() - reader.get_position())?;
    }

    Ok(())
}

/// Unique key ids of every `pssh` box in `data`, in order of appearance.
pub fn key_ids(data: &[u8]) -> Result<Vec<KeyId>> {
    let mut key_ids: Vec<KeyId> = Vec::new();

    for pssh in PsshBox::parse_all(data)? {
        for key_id in pssh.all_key_ids()? {
            if !key_ids.contains(&key_id) {
                key_ids.push(key_id);
            }
        }
    }

    Ok(key_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kid(byte: u8) -> KeyId {
        KeyId::from([byte; 16])
    }

    #[test]
    fn version_one_key_ids() {
        let pssh = PsshBox::new(COMMON_SYSTEM_ID, vec![kid(1), kid(2)], vec![]);
        let parsed = PsshBox::parse_all(&pssh.to_bytes()).unwrap();
        assert_eq!(parsed, [pssh]);
        assert_eq!(parsed[0].version, 1);
    }

    #[test]
    fn widevine_data_key_ids() {
        let data = WidevinePsshData {
            key_ids: vec![vec![3; 16]],
            provider: Some("example".to_owned()),
            content_id: None,
        }
        .encode_to_vec();

        let mut init = PsshBox::new(COMMON_SYSTEM_ID, vec![kid(3)], vec![]).to_bytes();
        init.extend(PsshBox::new(WIDEVINE_SYSTEM_ID, vec![], data).to_bytes());

        let mut moov = ((init.len() + 8) as u32).to_be_bytes().to_vec();
        moov.extend_from_slice(b"moov");
        moov.extend(init);

        assert_eq!(key_ids(&moov).unwrap(), [kid(3)]);
    }

    #[test]
    fn skips_other_boxes() {
        let mut data = vec![0, 0, 0, 8, b'f', b't', b'y', b'p'];
        data.extend(PsshBox::new(COMMON_SYSTEM_ID, vec![kid(9)], vec![]).to_bytes());
        assert_eq!(key_ids(&data).unwrap(), [kid(9)]);
        assert!(key_ids(&[0, 0, 0, 8, b'f', b'r', b'e', b'e']).unwrap().is_empty());
    }
}
