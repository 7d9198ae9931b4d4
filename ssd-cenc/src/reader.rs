use std::io::{Error, ErrorKind, Result};

/// Big endian reader over a borrowed buffer, used for parsing mp4 boxes.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn get_length(&self) -> usize {
        self.data.len()
    }

    pub fn get_position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn skip(&mut self, bytes: usize) -> Result<()> {
        self.read_bytes(bytes).map(|_| ())
    }

    pub fn read_bytes(&mut self, bytes: usize) -> Result<&'a [u8]> {
        if bytes > self.remaining() {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "cannot read {} bytes at offset {} of {} byte buffer",
                    bytes,
                    self.position,
                    self.data.len()
                ),
            ));
        }

        let bytes = &self.data[self.position..self.position + bytes];
        self.position += bytes.len();
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let [a, b, c] = self.read_array()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }
}

/// Header of one mp4 box.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoxHeader {
    pub name: [u8; 4],
    /// Offset of the box start in the buffer it was read from.
    pub start: usize,
    /// Size of the header itself (8 or 16 bytes).
    pub header_size: usize,
    /// Size of the whole box including its header.
    pub size: usize,
}

impl BoxHeader {
    /// Read the header at the reader's position. A size of 0 extends the box
    /// to the end of the buffer.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let start = reader.get_position();
        let size = reader.read_u32()? as u64;
        let name = reader.read_array()?;

        let (size, header_size) = match size {
            0 => ((reader.get_length() - start) as u64, 8),
            1 => (reader.read_u64()?, 16),
            _ => (size, 8),
        };

        if size < header_size as u64 || size > (reader.get_length() - start) as u64 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "box '{}' at offset {} has invalid size {}",
                    String::from_utf8_lossy(&name),
                    start,
                    size
                ),
            ));
        }

        Ok(Self {
            name,
            start,
            header_size,
            size: size as usize,
        })
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn payload_start(&self) -> usize {
        self.start + self.header_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let mut reader = Reader::new(&[0, 1, 0, 0, 2, 0, 0, 0, 3, 9]);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_u24().unwrap(), 2);
        assert_eq!(reader.read_u32().unwrap(), 3);
        assert_eq!(reader.remaining(), 1);
        assert!(reader.read_u16().is_err());
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert!(!reader.has_more_data());
    }

    #[test]
    fn box_header_sizes() {
        let data = [0, 0, 0, 12, b'f', b'r', b'e', b'e', 1, 2, 3, 4];
        let header = BoxHeader::read(&mut Reader::new(&data)).unwrap();
        assert_eq!(&header.name, b"free");
        assert_eq!((header.payload_start(), header.end()), (8, 12));

        let data = [0, 0, 0, 0, b'm', b'd', b'a', b't', 1, 2];
        assert_eq!(BoxHeader::read(&mut Reader::new(&data)).unwrap().size, 10);

        let data = [0, 0, 0, 64, b'm', b'o', b'o', b'v'];
        assert!(BoxHeader::read(&mut Reader::new(&data)).is_err());
    }
}
