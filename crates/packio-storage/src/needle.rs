//! Needle record format
//!
//! Small objects are appended to a per-partition pack file as needles. Each
//! needle carries its own key, encoded metadata and body, and is protected
//! by a CRC32C over everything before the footer.
//!
//! Record format:
//! ```text
//! +--------+---------+--------+---------+---------+-----+------+------+--------+
//! | Magic  | Version | KeyLen | MetaLen | DataLen | Key | Meta | Data | CRC32C |
//! | 4B     | 1B      | 2B     | 4B      | 8B      | var | var  | var  | 4B     |
//! +--------+---------+--------+---------+---------+-----+------+------+--------+
//! ```
//!
//! All integers are little-endian. The key is `<suffix>/<hash>/<file name>`.

use bytes::{Buf, BufMut, BytesMut};
use packio_common::{Error, ObjectHash, Result};

/// Needle magic number
pub(crate) const NEEDLE_MAGIC: u32 = 0x4E45_444C; // "NEDL"

/// Current needle format version
const NEEDLE_VERSION: u8 = 1;

/// Fixed header size (magic + version + key/meta/data lengths)
pub const NEEDLE_HEADER_SIZE: usize = 19;

/// Footer size (CRC32C)
pub const NEEDLE_FOOTER_SIZE: usize = 4;

/// Fixed-size prefix of a needle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleHeader {
    pub key_len: u16,
    pub meta_len: u32,
    pub data_len: u64,
}

impl NeedleHeader {
    /// Parse and validate a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < NEEDLE_HEADER_SIZE {
            return Err(Error::corruption("needle header truncated"));
        }

        let mut buf = &data[..NEEDLE_HEADER_SIZE];
        let magic = buf.get_u32_le();
        if magic != NEEDLE_MAGIC {
            return Err(Error::corruption(format!("bad needle magic: {magic:#010x}")));
        }

        let version = buf.get_u8();
        if version != NEEDLE_VERSION {
            return Err(Error::corruption(format!(
                "unsupported needle version: {version}"
            )));
        }

        Ok(Self {
            key_len: buf.get_u16_le(),
            meta_len: buf.get_u32_le(),
            data_len: buf.get_u64_le(),
        })
    }

    /// Total record length including header and footer
    ///
    /// A damaged header can claim lengths whose sum does not fit in a
    /// `u64`; that is reported as corruption.
    pub fn record_len(&self) -> Result<u64> {
        ((NEEDLE_HEADER_SIZE + NEEDLE_FOOTER_SIZE) as u64)
            .checked_add(u64::from(self.key_len))
            .and_then(|len| len.checked_add(u64::from(self.meta_len)))
            .and_then(|len| len.checked_add(self.data_len))
            .ok_or_else(|| {
                Error::corruption(format!("needle length overflows: data_len {}", self.data_len))
            })
    }
}

/// A decoded needle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    /// `<suffix>/<hash>/<file name>`
    pub key: String,
    /// Encoded metadata map
    pub metadata: Vec<u8>,
    /// Object body
    pub data: Vec<u8>,
}

impl Needle {
    /// Serialize a needle from borrowed parts
    pub fn encode(key: &str, metadata: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let key_len = u16::try_from(key.len())
            .map_err(|_| Error::invalid_argument(format!("needle key too long: {}", key.len())))?;
        let meta_len = u32::try_from(metadata.len()).map_err(|_| {
            Error::invalid_argument(format!("needle metadata too large: {}", metadata.len()))
        })?;

        let total = NEEDLE_HEADER_SIZE + key.len() + metadata.len() + data.len() + NEEDLE_FOOTER_SIZE;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(NEEDLE_MAGIC);
        buf.put_u8(NEEDLE_VERSION);
        buf.put_u16_le(key_len);
        buf.put_u32_le(meta_len);
        buf.put_u64_le(data.len() as u64);
        buf.put_slice(key.as_bytes());
        buf.put_slice(metadata);
        buf.put_slice(data);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        Ok(buf.to_vec())
    }

    /// Serialize this needle
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Self::encode(&self.key, &self.metadata, &self.data)
    }

    /// Parse a complete record, verifying its checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = NeedleHeader::from_bytes(data)?;
        let record_len = usize::try_from(header.record_len()?)
            .map_err(|_| Error::corruption("needle length overflows"))?;
        if data.len() < record_len {
            return Err(Error::corruption(format!(
                "needle truncated: {} of {record_len} bytes",
                data.len()
            )));
        }

        let crc_offset = record_len - NEEDLE_FOOTER_SIZE;
        let stored_crc = (&data[crc_offset..record_len]).get_u32_le();
        let computed_crc = crc32c::crc32c(&data[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(Error::corruption(format!(
                "needle checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let key_end = NEEDLE_HEADER_SIZE + header.key_len as usize;
        let meta_end = key_end + header.meta_len as usize;
        let key = std::str::from_utf8(&data[NEEDLE_HEADER_SIZE..key_end])
            .map_err(|_| Error::corruption("needle key is not UTF-8"))?
            .to_string();

        Ok(Self {
            key,
            metadata: data[key_end..meta_end].to_vec(),
            data: data[meta_end..crc_offset].to_vec(),
        })
    }
}

/// Pack key of an object file
#[must_use]
pub fn needle_key(hash: &ObjectHash, file_name: &str) -> String {
    format!("{}/{}/{file_name}", hash.suffix(), hash.as_str())
}

/// Split a pack key into suffix, hash and file name
#[must_use]
pub fn split_needle_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(suffix), Some(hash), Some(name)) if !name.is_empty() => Some((suffix, hash, name)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Needle {
        let hash = ObjectHash::for_name("/AUTH_test/c/o");
        Needle {
            key: needle_key(&hash, "1500000000.00000.data"),
            metadata: br#"{"Content-Length":"5"}"#.to_vec(),
            data: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_needle_roundtrip() {
        let needle = sample();
        let bytes = needle.to_bytes().unwrap();

        let header = NeedleHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.record_len().unwrap(), bytes.len() as u64);
        assert_eq!(header.data_len, 5);
        assert_eq!(Needle::from_bytes(&bytes).unwrap(), needle);
    }

    #[test]
    fn test_needle_empty_body() {
        let needle = Needle {
            data: Vec::new(),
            ..sample()
        };
        let bytes = needle.to_bytes().unwrap();
        assert_eq!(Needle::from_bytes(&bytes).unwrap().data, b"");
    }

    #[test]
    fn test_needle_detects_bit_flip() {
        let mut bytes = sample().to_bytes().unwrap();
        let last_data_byte = bytes.len() - NEEDLE_FOOTER_SIZE - 1;
        bytes[last_data_byte] ^= 0x01;
        assert!(Needle::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_needle_truncated() {
        let bytes = sample().to_bytes().unwrap();
        assert!(Needle::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err().is_corruption());
        assert!(NeedleHeader::from_bytes(&bytes[..10]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_needle_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = 0;
        assert!(NeedleHeader::from_bytes(&bytes).unwrap_err().is_corruption());
        assert!(NeedleHeader::from_bytes(&[0u8; NEEDLE_HEADER_SIZE]).is_err());
    }

    #[test]
    fn test_needle_length_overflow() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[11..19].copy_from_slice(&(u64::MAX - 5).to_le_bytes());

        let header = NeedleHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.data_len, u64::MAX - 5);
        assert!(header.record_len().unwrap_err().is_corruption());
        assert!(Needle::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_key_too_long() {
        let key = "k".repeat(usize::from(u16::MAX) + 1);
        let err = Needle::encode(&key, b"", b"").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_split_needle_key() {
        let hash = ObjectHash::for_name("/a/c/o");
        let key = needle_key(&hash, "1500000000.00000.data");
        let (suffix, parsed_hash, name) = split_needle_key(&key).unwrap();
        assert_eq!(suffix, hash.suffix());
        assert_eq!(parsed_hash, hash.as_str());
        assert_eq!(name, "1500000000.00000.data");
        assert!(split_needle_key("abc/def").is_none());
        assert!(split_needle_key("abc/def/").is_none());
    }
}
