//! Writable object handles
//!
//! A [`PackObject`] is created by [`PackDevice::new_object`] with a declared
//! size. Small objects buffer their body in memory and become a needle on
//! commit; large ones stream into a temporary file under `<device>/tmp`
//! that commit renames into the hash directory.
//!
//! ```text
//!   new_object ──> Open ──commit──> Committed ──close──> Closed
//!                   │                                      ^
//!                   └───────────────close──────────────────┘
//! ```
//!
//! Closing or dropping an uncommitted handle deletes its temporary file.
//!
//! [`PackDevice::new_object`]: crate::device::PackDevice::new_object

use crate::metadata::{Metadata, keys};
use packio_common::{Error, ObjectHash, Partition, Result, Timestamp};
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lifecycle state of a [`PackObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Accepting writes
    Open,
    /// Durable and visible
    Committed,
    /// Released
    Closed,
}

/// Body storage of an object being written
pub(crate) enum ObjectBody {
    /// Buffered for a needle
    Packed(Vec<u8>),
    /// Streamed to a temporary file
    Standalone { tmp_path: PathBuf, file: File },
}

/// An object being written
pub struct PackObject {
    partition: Partition,
    hash: ObjectHash,
    timestamp: Timestamp,
    size: u64,
    metadata: Metadata,
    body: Option<ObjectBody>,
    written: u64,
    etag: md5::Context,
    state: ObjectState,
}

impl PackObject {
    pub(crate) fn new(
        partition: Partition,
        hash: ObjectHash,
        timestamp: Timestamp,
        size: u64,
        metadata: Metadata,
        body: ObjectBody,
    ) -> Self {
        Self {
            partition,
            hash,
            timestamp,
            size,
            metadata,
            body: Some(body),
            written: 0,
            etag: md5::Context::new(),
            state: ObjectState::Open,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn hash(&self) -> &ObjectHash {
        &self.hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Declared body size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Body bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Whether the body will be stored as a needle
    pub fn is_packed(&self) -> bool {
        matches!(self.body, Some(ObjectBody::Packed(_)))
    }

    /// Temporary file backing a large body
    pub fn tmp_path(&self) -> Option<&Path> {
        match &self.body {
            Some(ObjectBody::Standalone { tmp_path, .. }) => Some(tmp_path),
            _ => None,
        }
    }

    /// Caller-supplied metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable caller-supplied metadata, before commit
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Append body bytes
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.state {
            ObjectState::Open => {}
            ObjectState::Committed => {
                return Err(Error::invalid_state("write after commit"));
            }
            ObjectState::Closed => return Err(Error::invalid_state("write after close")),
        }

        let end = self.written + data.len() as u64;
        if end > self.size {
            return Err(Error::invalid_argument(format!(
                "write past declared size {} (would reach {end})",
                self.size
            )));
        }

        match self.body.as_mut() {
            Some(ObjectBody::Packed(buf)) => buf.extend_from_slice(data),
            Some(ObjectBody::Standalone { file, .. }) => file.write_all(data)?,
            None => return Err(Error::invalid_state("object has no body")),
        }

        self.etag.consume(data);
        self.written = end;
        Ok(data.len())
    }

    /// Check that the object can be committed
    pub(crate) fn ensure_committable(&self) -> Result<()> {
        match self.state {
            ObjectState::Open => {}
            ObjectState::Committed => return Err(Error::invalid_state("already committed")),
            ObjectState::Closed => return Err(Error::invalid_state("commit after close")),
        }
        if self.written != self.size {
            return Err(Error::invalid_state(format!(
                "short body: wrote {} of {} bytes",
                self.written, self.size
            )));
        }
        Ok(())
    }

    /// Caller metadata plus the fields the engine maintains
    pub(crate) fn final_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert(keys::CONTENT_LENGTH.to_string(), self.size.to_string());
        metadata.insert(
            keys::ETAG.to_string(),
            format!("{:x}", self.etag.clone().compute()),
        );
        metadata.insert(keys::TIMESTAMP.to_string(), self.timestamp.normal());
        metadata
    }

    pub(crate) fn body_mut(&mut self) -> Option<&mut ObjectBody> {
        self.body.as_mut()
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = ObjectState::Committed;
    }

    /// Release the handle
    ///
    /// An uncommitted temporary file is deleted. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == ObjectState::Closed {
            return;
        }

        if let Some(ObjectBody::Standalone { tmp_path, .. }) = self.body.take()
            && self.state == ObjectState::Open
        {
            match std::fs::remove_file(&tmp_path) {
                Ok(()) => debug!("discarded uncommitted {}", tmp_path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {e}", tmp_path.display()),
            }
        }
        self.body = None;
        self.state = ObjectState::Closed;
    }
}

impl Drop for PackObject {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PackObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackObject")
            .field("partition", &self.partition)
            .field("hash", &self.hash)
            .field("timestamp", &self.timestamp)
            .field("size", &self.size)
            .field("written", &self.written)
            .field("packed", &self.is_packed())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
