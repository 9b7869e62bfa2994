//! Per-partition pack file
//!
//! Needles are appended to `<partition>/needles.pack`. The in-memory index
//! maps each needle key to its location and is rebuilt by scanning the file
//! on open. Appends are serialized; reads use positional I/O and never
//! block on the writer.
//!
//! When the scan meets bytes that do not form a valid record it looks ahead
//! for the next record that does (magic, sane lengths, good checksum). If
//! one exists the region in between is damaged: it is left in place and
//! counted for the auditor. If none exists the remainder is the torn tail
//! of an interrupted append. Opening never modifies the file; the first
//! append copies a torn tail aside to `needles.pack.torn-<uuid>` and cuts
//! it off so new needles land on a record boundary.

use crate::hashes::PackedNames;
use crate::needle::{NEEDLE_HEADER_SIZE, NEEDLE_MAGIC, Needle, NeedleHeader, split_needle_key};
use packio_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Pack file name inside a partition directory
pub const PACK_FILE: &str = "needles.pack";

/// Bytes read at a time while looking for the next record
const RESYNC_WINDOW: usize = 64 * 1024;

/// Where a needle lives in the pack file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleLocation {
    /// Byte offset of the record
    pub offset: u64,
    /// Record length including header and footer
    pub record_len: u64,
    /// Body length
    pub data_len: u64,
}

/// What the bytes at an offset hold
enum Record {
    Valid(Needle, u64),
    /// Complete record with a bad checksum or body
    Damaged(u64),
    /// No readable record
    Unreadable,
}

/// Append position and the unrepaired tail behind it
struct Tail {
    /// End of the last record kept by the scan
    end: u64,
    /// Physical file length
    file_len: u64,
}

/// Append-only needle store for one partition
pub struct PackFile {
    path: PathBuf,
    file: File,
    tail: Mutex<Tail>,
    index: RwLock<BTreeMap<String, NeedleLocation>>,
    /// Damaged regions found by the opening scan
    damaged: u64,
    sync: bool,
}

impl PackFile {
    /// Open or create a pack file and rebuild its index
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let (index, damaged, end) = Self::scan(&file, file_len)?;

        if end < file_len {
            warn!(
                "pack {} has {} torn bytes at offset {end}",
                path.display(),
                file_len - end
            );
        }
        if damaged > 0 {
            warn!("pack {} has {damaged} damaged regions", path.display());
        }
        debug!("opened pack {} with {} needles", path.display(), index.len());

        Ok(Self {
            path,
            file,
            tail: Mutex::new(Tail { end, file_len }),
            index: RwLock::new(index),
            damaged,
            sync,
        })
    }

    fn scan(file: &File, file_len: u64) -> Result<(BTreeMap<String, NeedleLocation>, u64, u64)> {
        let mut index = BTreeMap::new();
        let mut damaged = 0u64;
        let mut offset = 0u64;

        while offset < file_len {
            let skip = match Self::classify(file, offset, file_len)? {
                Record::Valid(needle, record_len) => {
                    index.insert(
                        needle.key,
                        NeedleLocation {
                            offset,
                            record_len,
                            data_len: needle.data.len() as u64,
                        },
                    );
                    offset += record_len;
                    continue;
                }
                Record::Damaged(record_len) => Some(record_len),
                Record::Unreadable => None,
            };

            match Self::resync(file, offset + 1, file_len)? {
                Some(next) => {
                    warn!("skipping damaged bytes {offset}..{next}");
                    damaged += 1;
                    offset = next;
                }
                // A complete record that fails its checksum is kept and
                // reported, even as the last one
                None => match skip {
                    Some(record_len) => {
                        warn!("skipping damaged needle at offset {offset}");
                        damaged += 1;
                        offset += record_len;
                    }
                    None => break,
                },
            }
        }

        Ok((index, damaged, offset))
    }

    /// Classify the bytes at `offset`
    fn classify(file: &File, offset: u64, file_len: u64) -> Result<Record> {
        let remaining = file_len - offset;
        if remaining < NEEDLE_HEADER_SIZE as u64 {
            return Ok(Record::Unreadable);
        }

        let mut header_buf = [0u8; NEEDLE_HEADER_SIZE];
        file.read_exact_at(&mut header_buf, offset)?;
        let Ok(record_len) = NeedleHeader::from_bytes(&header_buf).and_then(|h| h.record_len())
        else {
            return Ok(Record::Unreadable);
        };
        if record_len > remaining {
            return Ok(Record::Unreadable);
        }

        match Self::read_record(file, offset, record_len) {
            Ok(needle) => Ok(Record::Valid(needle, record_len)),
            Err(e) if e.is_corruption() => Ok(Record::Damaged(record_len)),
            Err(e) => Err(e),
        }
    }

    /// Offset of the first valid record at or after `from`
    fn resync(file: &File, from: u64, file_len: u64) -> Result<Option<u64>> {
        let magic = NEEDLE_MAGIC.to_le_bytes();
        let overlap = magic.len() - 1;
        let mut window = vec![0u8; RESYNC_WINDOW];
        let mut pos = from;

        while pos + NEEDLE_HEADER_SIZE as u64 <= file_len {
            let len = usize::try_from(file_len - pos).map_or(RESYNC_WINDOW, |n| n.min(RESYNC_WINDOW));
            let buf = &mut window[..len];
            file.read_exact_at(buf, pos)?;

            for i in 0..len - overlap {
                if buf[i..i + magic.len()] != magic {
                    continue;
                }
                let candidate = pos + i as u64;
                if let Record::Valid(..) = Self::classify(file, candidate, file_len)? {
                    return Ok(Some(candidate));
                }
            }
            pos += (len - overlap) as u64;
        }
        Ok(None)
    }

    fn preserve_tail(path: &Path, file: &File, from: u64, to: u64) -> Result<PathBuf> {
        let len = usize::try_from(to - from)
            .map_err(|_| Error::corruption("torn pack tail too large"))?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, from)?;

        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".torn-{}", Uuid::new_v4().simple()));
        let torn = PathBuf::from(name);
        std::fs::write(&torn, &buf)?;
        Ok(torn)
    }

    /// Move a torn tail aside before the first append lands on it
    fn repair_tail(&self, tail: &mut Tail) -> Result<()> {
        if tail.file_len <= tail.end {
            return Ok(());
        }
        let torn = Self::preserve_tail(&self.path, &self.file, tail.end, tail.file_len)?;
        self.file.set_len(tail.end)?;
        self.file.sync_all()?;
        warn!(
            "cut {} torn bytes from {}, saved to {}",
            tail.file_len - tail.end,
            self.path.display(),
            torn.display()
        );
        tail.file_len = tail.end;
        Ok(())
    }

    fn read_record(file: &File, offset: u64, record_len: u64) -> Result<Needle> {
        let len = usize::try_from(record_len)
            .map_err(|_| Error::corruption(format!("needle at {offset} too large")))?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Needle::from_bytes(&buf)
    }

    /// Path of the pack file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes up to the end of the last kept record
    pub fn len(&self) -> u64 {
        self.tail.lock().end
    }

    /// Whether the pack holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Torn bytes waiting to be cut by the next append
    pub fn torn_bytes(&self) -> u64 {
        let tail = self.tail.lock();
        tail.file_len.saturating_sub(tail.end)
    }

    /// Number of indexed needles
    pub fn needle_count(&self) -> usize {
        self.index.read().len()
    }

    /// Damaged regions found when the pack was opened
    pub const fn damaged_records(&self) -> u64 {
        self.damaged
    }

    /// Append a needle and make it visible
    ///
    /// A failed append is cut back off the file so the next one starts on a
    /// record boundary.
    pub fn append(&self, key: &str, metadata: &[u8], data: &[u8]) -> Result<NeedleLocation> {
        let record = Needle::encode(key, metadata, data)?;
        let mut tail = self.tail.lock();
        self.repair_tail(&mut tail)?;
        let offset = tail.end;

        let written = self.file.write_all_at(&record, offset).and_then(|()| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(truncate_err) = self.file.set_len(offset) {
                warn!(
                    "failed to trim partial needle in {}: {truncate_err}",
                    self.path.display()
                );
            }
            return Err(e.into());
        }

        let location = NeedleLocation {
            offset,
            record_len: record.len() as u64,
            data_len: data.len() as u64,
        };
        tail.end = offset + location.record_len;
        tail.file_len = tail.end;
        self.index.write().insert(key.to_string(), location);
        drop(tail);

        debug!(
            "appended needle {key} at {offset} ({} bytes) to {}",
            location.record_len,
            self.path.display()
        );
        Ok(location)
    }

    /// Location of a needle
    pub fn locate(&self, key: &str) -> Option<NeedleLocation> {
        self.index.read().get(key).copied()
    }

    /// Read and verify a needle by key
    pub fn read(&self, key: &str) -> Result<Option<Needle>> {
        match self.locate(key) {
            Some(location) => self.read_at(location).map(Some),
            None => Ok(None),
        }
    }

    /// Read and verify the needle at a known location
    pub fn read_at(&self, location: NeedleLocation) -> Result<Needle> {
        Self::read_record(&self.file, location.offset, location.record_len)
    }

    /// Snapshot of the index in key order
    pub fn entries(&self) -> Vec<(String, NeedleLocation)> {
        self.index
            .read()
            .iter()
            .map(|(key, location)| (key.clone(), *location))
            .collect()
    }

    /// File names of one hash
    pub fn names_for(&self, suffix: &str, hash: &str) -> Vec<String> {
        let prefix = format!("{suffix}/{hash}/");
        self.index
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    /// Packed file names grouped by suffix, then hash
    pub fn packed_names(&self) -> BTreeMap<String, PackedNames> {
        let mut grouped: BTreeMap<String, PackedNames> = BTreeMap::new();
        for key in self.index.read().keys() {
            if let Some((suffix, hash, name)) = split_needle_key(key) {
                grouped
                    .entry(suffix.to_string())
                    .or_default()
                    .entry(hash.to_string())
                    .or_default()
                    .push(name.to_string());
            }
        }
        grouped
    }

    /// Suffixes with at least one needle
    pub fn suffixes(&self) -> Vec<String> {
        let mut suffixes: Vec<String> = self
            .index
            .read()
            .keys()
            .filter_map(|key| split_needle_key(key).map(|(suffix, _, _)| suffix.to_string()))
            .collect();
        suffixes.dedup();
        suffixes
    }
}
