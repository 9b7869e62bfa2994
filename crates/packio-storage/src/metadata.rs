//! Object metadata codec
//!
//! Metadata is a map of string keys to string values, serialized as a JSON
//! object and spread over numbered attribute slots:
//!
//! ```text
//! user.swift.metadata    bytes [0, chunk)
//! user.swift.metadata1   bytes [chunk, 2*chunk)
//! user.swift.metadata2   ...
//! ```
//!
//! Readers concatenate slots from index 0 until the first absent or empty
//! slot. A value that does not decode to a string map is corruption, never
//! "no metadata".

use crate::xattr::AttrChunks;
use packio_common::{Error, Result};
use std::collections::BTreeMap;

/// Attribute name of the first metadata slot
pub const METADATA_KEY: &str = "user.swift.metadata";

/// Default maximum bytes per slot
pub const METADATA_CHUNK_SIZE: usize = 65536;

/// Prefix of system metadata keys that a metadata override may replace
pub const SYSMETA_PREFIX: &str = "X-Object-Sysmeta-";

/// Object metadata map
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys
pub mod keys {
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const DELETED: &str = "deleted";
    pub const ETAG: &str = "ETag";
    pub const NAME: &str = "name";
    pub const TIMESTAMP: &str = "X-Timestamp";
}

/// Attribute name of slot `index`
#[must_use]
pub fn slot_name(index: usize) -> String {
    if index == 0 {
        METADATA_KEY.to_string()
    } else {
        format!("{METADATA_KEY}{index}")
    }
}

/// Serialize a metadata map
pub fn encode(metadata: &Metadata) -> Result<Vec<u8>> {
    serde_json::to_vec(metadata).map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize a metadata map
pub fn decode(bytes: &[u8]) -> Result<Metadata> {
    if bytes.is_empty() {
        return Err(Error::corruption("no metadata"));
    }

    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::corruption(format!("undecodable metadata: {e}")))?;

    let serde_json::Value::Object(map) = value else {
        return Err(Error::corruption("metadata is not a map"));
    };

    map.into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(value) => Ok((key, value)),
            other => Err(Error::corruption(format!(
                "metadata value for {key:?} is not a string: {other}"
            ))),
        })
        .collect()
}

/// Concatenate metadata slots starting at index 0
pub fn read_raw<A: AttrChunks + ?Sized>(source: &A) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for index in 0.. {
        match source.get_chunk(&slot_name(index))? {
            Some(chunk) if !chunk.is_empty() => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    Ok(buf)
}

/// Split `bytes` into slots of at most `chunk_size` bytes
pub fn write_raw<A: AttrChunks + ?Sized>(sink: &mut A, bytes: &[u8], chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::invalid_argument("metadata chunk size must be positive"));
    }

    for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
        sink.set_chunk(&slot_name(index), chunk)?;
    }
    Ok(())
}

/// Read and decode the metadata of one object
pub fn read_metadata<A: AttrChunks + ?Sized>(source: &A) -> Result<Metadata> {
    decode(&read_raw(source)?)
}

/// Encode and write the metadata of one object
pub fn write_metadata<A: AttrChunks + ?Sized>(
    sink: &mut A,
    metadata: &Metadata,
    chunk_size: usize,
) -> Result<()> {
    write_raw(sink, &encode(metadata)?, chunk_size)
}

/// Whether a metadata override may replace `key`
#[must_use]
pub fn is_overridable(key: &str) -> bool {
    matches!(
        key,
        keys::CONTENT_LENGTH | keys::CONTENT_TYPE | keys::DELETED | keys::ETAG
    ) || key.starts_with(SYSMETA_PREFIX)
}

/// Layer an override map over a base map
///
/// Only overridable keys transfer from `overlay`; every other base entry is
/// kept as is.
#[must_use]
pub fn merge_override(base: &Metadata, overlay: &Metadata) -> Metadata {
    let mut merged = base.clone();
    merged.extend(
        overlay
            .iter()
            .filter(|(key, _)| is_overridable(key))
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    merged
}
