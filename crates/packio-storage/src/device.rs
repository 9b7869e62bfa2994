//! Device storage engine
//!
//! A [`PackDevice`] serves one storage policy on one device:
//!
//! ```text
//! <device root>/
//! ├── tmp/                         in-flight large bodies
//! ├── quarantined/<objects dir>/   damaged hash directories
//! └── <objects dir>/<partition>/
//!     ├── .lock
//!     ├── hashes.json
//!     ├── hashes.invalid
//!     ├── needles.pack             small object bodies
//!     └── <suffix>/<hash>/<timestamp>.{data,meta,ts}
//! ```
//!
//! Small bodies are appended to the partition's pack file. Large bodies,
//! metadata overrides and tombstones are standalone files carrying their
//! metadata in extended attributes. Every mutation invalidates the suffix
//! it touched.

use crate::hashes::{self, HashOptions, plan_cleanup, read_dir_names};
use crate::metadata::{self, Metadata, keys};
use crate::needle::needle_key;
use crate::object::{ObjectBody, PackObject};
use crate::pack::{NeedleLocation, PACK_FILE, PackFile};
use crate::xattr::{FileAttrs, XattrBackend};
use packio_common::{
    EngineConfig, Error, FileKind, ObjectHash, Partition, Policy, Result, Timestamp,
    is_suffix_name,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Temporary directory name under a device root
pub const TMP_DIR: &str = "tmp";

/// Where a committed object file lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    /// Needle in the partition pack file
    Packed { key: String, location: NeedleLocation },
    /// File inside a hash directory
    Standalone { path: PathBuf },
}

/// Body of an object read back
#[derive(Debug)]
pub enum ObjectData {
    Packed(Vec<u8>),
    Standalone(File),
}

/// Current state of an object
#[derive(Debug)]
pub struct StoredObject {
    /// Effective metadata, overrides applied
    pub metadata: Metadata,
    /// Name of the data file
    pub data_file: String,
    pub data: ObjectData,
}

/// Result of auditing a partition
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub corrupted_files: u64,
}

/// Device statistics
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub needles_written: AtomicU64,
    pub files_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub tombstones_written: AtomicU64,
    pub commit_errors: AtomicU64,
    pub audits: AtomicU64,
    pub corrupted_found: AtomicU64,
}

/// Storage engine for one (device, policy) pair
pub struct PackDevice {
    name: String,
    root: PathBuf,
    policy: Policy,
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    config: EngineConfig,
    xattr: Arc<dyn XattrBackend>,
    packs: RwLock<HashMap<Partition, Arc<PackFile>>>,
    stats: DeviceStats,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

impl PackDevice {
    /// Open a device root for one policy, creating its directories
    pub fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        policy: Policy,
        config: EngineConfig,
        xattr: Arc<dyn XattrBackend>,
    ) -> Result<Self> {
        let name = name.into();
        let root = root.into();
        let objects_dir = root.join(policy.dir_name());
        let tmp_dir = root.join(TMP_DIR);
        fs::create_dir_all(&objects_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        info!(
            "opened device {name} policy {policy} at {}",
            objects_dir.display()
        );

        Ok(Self {
            name,
            root,
            policy,
            objects_dir,
            tmp_dir,
            config,
            xattr,
            packs: RwLock::new(HashMap::new()),
            stats: DeviceStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.objects_dir.join(partition.to_string())
    }

    fn hash_options(&self) -> HashOptions {
        HashOptions::from(&self.config)
    }

    fn ensure_partition_dir(&self, partition: Partition) -> Result<PathBuf> {
        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::PartitionUnavailable(format!("{}: {e}", dir.display())))?;
        Ok(dir)
    }

    /// Pack file of a partition if it has one
    fn pack(&self, partition: Partition) -> Result<Option<Arc<PackFile>>> {
        if let Some(pack) = self.packs.read().get(&partition) {
            return Ok(Some(Arc::clone(pack)));
        }
        if !self.partition_dir(partition).join(PACK_FILE).is_file() {
            return Ok(None);
        }
        self.pack_for_write(partition).map(Some)
    }

    /// Pack file of a partition, created on first use
    fn pack_for_write(&self, partition: Partition) -> Result<Arc<PackFile>> {
        if let Some(pack) = self.packs.read().get(&partition) {
            return Ok(Arc::clone(pack));
        }

        let mut packs = self.packs.write();
        if let Some(pack) = packs.get(&partition) {
            return Ok(Arc::clone(pack));
        }
        let path = self.partition_dir(partition).join(PACK_FILE);
        let pack = Arc::new(PackFile::open(&path, self.config.fsync)?);
        packs.insert(partition, Arc::clone(&pack));
        Ok(pack)
    }

    fn create_tmp(&self, hash: &ObjectHash) -> Result<(PathBuf, File)> {
        let tmp_path = self
            .tmp_dir
            .join(format!("{}.{}", hash.as_str(), Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        if let Err(e) = self.xattr.reset(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok((tmp_path, file))
    }

    /// Start writing an object of `size` bytes
    pub fn new_object(
        &self,
        partition: Partition,
        hash: ObjectHash,
        timestamp: Timestamp,
        size: u64,
        metadata: Metadata,
    ) -> Result<PackObject> {
        self.ensure_partition_dir(partition)?;

        let body = if self.config.is_needle(size) {
            let capacity = usize::try_from(size).unwrap_or_default();
            ObjectBody::Packed(Vec::with_capacity(capacity))
        } else {
            let (tmp_path, file) = self.create_tmp(&hash)?;
            ObjectBody::Standalone { tmp_path, file }
        };

        Ok(PackObject::new(
            partition, hash, timestamp, size, metadata, body,
        ))
    }

    /// Make a fully written object durable and visible
    pub fn commit_write(&self, object: &mut PackObject) -> Result<ObjectRef> {
        object.ensure_committable()?;

        let partition = object.partition();
        let hash = object.hash().clone();
        let size = object.size();
        let name = FileKind::Data.file_name(object.timestamp());
        let metadata = object.final_metadata();
        let partition_dir = self.ensure_partition_dir(partition)?;

        let committed = match object.body_mut() {
            Some(ObjectBody::Packed(data)) => {
                let key = needle_key(&hash, &name);
                let encoded = metadata::encode(&metadata)?;
                self.pack_for_write(partition)
                    .and_then(|pack| pack.append(&key, &encoded, data))
                    .map(|location| ObjectRef::Packed { key, location })
            }
            Some(ObjectBody::Standalone { tmp_path, file }) => self
                .place_standalone(tmp_path, file, &partition_dir, &hash, &name, &metadata)
                .map(|path| ObjectRef::Standalone { path }),
            None => Err(Error::invalid_state("object has no body")),
        };

        let object_ref = match committed {
            Ok(object_ref) => object_ref,
            Err(e) => {
                self.stats.commit_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        object.mark_committed();

        match &object_ref {
            ObjectRef::Packed { .. } => &self.stats.needles_written,
            ObjectRef::Standalone { .. } => &self.stats.files_written,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(size, Ordering::Relaxed);

        self.invalidate(partition, hash.suffix())?;
        debug!(
            "committed {}/{} in partition {partition} on {}",
            hash.as_str(),
            name,
            self.name
        );
        Ok(object_ref)
    }

    /// Attach metadata to a temporary file and rename it into place
    fn place_standalone(
        &self,
        tmp_path: &Path,
        file: &File,
        partition_dir: &Path,
        hash: &ObjectHash,
        name: &str,
        metadata: &Metadata,
    ) -> Result<PathBuf> {
        let mut attrs = FileAttrs::new(self.xattr.as_ref(), tmp_path);
        metadata::write_metadata(&mut attrs, metadata, self.config.metadata_chunk_size)?;
        if self.config.fsync {
            file.sync_all()?;
        }

        let hash_dir = partition_dir.join(hash.suffix()).join(hash.as_str());
        fs::create_dir_all(&hash_dir)?;
        let path = hash_dir.join(name);
        fs::rename(tmp_path, &path)?;

        if self.config.fsync {
            File::open(&hash_dir)?.sync_all()?;
        }
        Ok(path)
    }

    fn write_marker(
        &self,
        partition: Partition,
        hash: &ObjectHash,
        kind: FileKind,
        timestamp: Timestamp,
        mut metadata: Metadata,
    ) -> Result<ObjectRef> {
        let partition_dir = self.ensure_partition_dir(partition)?;
        metadata.insert(keys::TIMESTAMP.to_string(), timestamp.normal());

        let (tmp_path, file) = self.create_tmp(hash)?;
        let placed = self.place_standalone(
            &tmp_path,
            &file,
            &partition_dir,
            hash,
            &kind.file_name(timestamp),
            &metadata,
        );
        let path = match placed {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                self.stats.commit_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        self.invalidate(partition, hash.suffix())?;
        Ok(ObjectRef::Standalone { path })
    }

    /// Record a deletion at `timestamp`
    pub fn delete_object(
        &self,
        partition: Partition,
        hash: &ObjectHash,
        timestamp: Timestamp,
        metadata: Metadata,
    ) -> Result<ObjectRef> {
        let object_ref = self.write_marker(partition, hash, FileKind::Tombstone, timestamp, metadata)?;
        self.stats.tombstones_written.fetch_add(1, Ordering::Relaxed);
        debug!("deleted {} at {timestamp} on {}", hash.as_str(), self.name);
        Ok(object_ref)
    }

    /// Record a metadata override at `timestamp`
    pub fn post_metadata(
        &self,
        partition: Partition,
        hash: &ObjectHash,
        timestamp: Timestamp,
        metadata: Metadata,
    ) -> Result<ObjectRef> {
        self.write_marker(partition, hash, FileKind::Meta, timestamp, metadata)
    }

    fn read_file_metadata(&self, path: &Path) -> Result<Metadata> {
        metadata::read_metadata(&FileAttrs::new(self.xattr.as_ref(), path))
    }

    /// Read the current state of an object
    ///
    /// Returns [`Error::ObjectNotFound`] when no data file exists or the
    /// newest state is a tombstone. Nothing is deleted on this path.
    pub fn get_object(&self, partition: Partition, hash: &ObjectHash) -> Result<StoredObject> {
        let not_found = || Error::ObjectNotFound(format!("{}/{}", partition, hash.as_str()));
        let hash_dir = self
            .partition_dir(partition)
            .join(hash.suffix())
            .join(hash.as_str());

        let local = read_dir_names(&hash_dir)?.unwrap_or_default();
        let pack = self.pack(partition)?;
        let packed = pack
            .as_ref()
            .map(|pack| pack.names_for(hash.suffix(), hash.as_str()))
            .unwrap_or_default();

        let mut names: Vec<String> = local.iter().chain(&packed).cloned().collect();
        names.sort_unstable();
        names.dedup();

        let plan = plan_cleanup(&names, Timestamp::now(), self.config.reclaim_age());
        let mut newest_meta: Option<&String> = None;

        for name in &plan.keep {
            match FileKind::of(name) {
                Some(FileKind::Meta) => newest_meta = newest_meta.or(Some(name)),
                Some(FileKind::Tombstone) => return Err(not_found()),
                Some(FileKind::Data) => {
                    let (base, data) = match (&pack, local.binary_search(name)) {
                        (_, Ok(_)) => {
                            let path = hash_dir.join(name);
                            let base = self.read_file_metadata(&path)?;
                            (base, ObjectData::Standalone(File::open(&path)?))
                        }
                        (Some(pack), Err(_)) => {
                            let needle = pack
                                .read(&needle_key(hash, name))?
                                .ok_or_else(not_found)?;
                            let base = metadata::decode(&needle.metadata)?;
                            (base, ObjectData::Packed(needle.data))
                        }
                        (None, Err(_)) => return Err(not_found()),
                    };

                    // Overrides are always standalone files
                    let effective = match newest_meta {
                        Some(meta) => {
                            let overlay = self.read_file_metadata(&hash_dir.join(meta))?;
                            metadata::merge_override(&base, &overlay)
                        }
                        None => base,
                    };

                    return Ok(StoredObject {
                        metadata: effective,
                        data_file: name.clone(),
                        data,
                    });
                }
                None => {}
            }
        }
        Err(not_found())
    }

    /// Suffixes present in a partition
    ///
    /// Combines suffix directories with suffixes that only have needles.
    /// A missing partition has no suffixes.
    pub fn list_suffixes(
        &self,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let partition_dir = self.partition_dir(partition);
        let mut suffixes = BTreeSet::new();

        for name in read_dir_names(&partition_dir)?.unwrap_or_default() {
            check_cancelled(cancel)?;
            if is_suffix_name(&name) && partition_dir.join(&name).is_dir() {
                suffixes.insert(name);
            }
        }

        if let Some(pack) = self.pack(partition)? {
            check_cancelled(cancel)?;
            suffixes.extend(pack.suffixes());
        }

        Ok(suffixes.into_iter().collect())
    }

    /// Verify every object file of a partition
    ///
    /// Needles are checked against their CRC and must carry decodable
    /// metadata; standalone files must carry decodable metadata. Damaged
    /// files are counted, never repaired or moved.
    pub fn audit_partition(
        &self,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> Result<AuditStats> {
        let mut stats = AuditStats::default();

        if let Some(pack) = self.pack(partition)? {
            stats.corrupted_files += pack.damaged_records();
            for (key, location) in pack.entries() {
                check_cancelled(cancel)?;
                let verified = pack
                    .read_at(location)
                    .and_then(|needle| metadata::decode(&needle.metadata).map(|_| needle));
                match verified {
                    Ok(needle) => {
                        stats.processed_files += 1;
                        stats.processed_bytes += needle.data.len() as u64;
                    }
                    Err(e) if e.is_corruption() => {
                        warn!("audit: needle {key} in partition {partition} on {}: {e}", self.name);
                        stats.corrupted_files += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let partition_dir = self.partition_dir(partition);
        for suffix in read_dir_names(&partition_dir)?.unwrap_or_default() {
            if !is_suffix_name(&suffix) {
                continue;
            }
            self.audit_suffix(&partition_dir.join(&suffix), cancel, &mut stats)?;
        }

        self.stats.audits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .corrupted_found
            .fetch_add(stats.corrupted_files, Ordering::Relaxed);
        info!(
            "audited partition {partition} on {}: {} files, {} bytes, {} corrupted",
            self.name, stats.processed_files, stats.processed_bytes, stats.corrupted_files
        );
        Ok(stats)
    }

    fn audit_suffix(
        &self,
        suffix_dir: &Path,
        cancel: &CancellationToken,
        stats: &mut AuditStats,
    ) -> Result<()> {
        let hashes = match read_dir_names(suffix_dir) {
            Ok(names) => names.unwrap_or_default(),
            Err(Error::NotADirectory(path)) => {
                warn!("audit: suffix {} is not a directory", path.display());
                stats.corrupted_files += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for hash in hashes {
            let hash_dir = suffix_dir.join(&hash);
            let files = match read_dir_names(&hash_dir) {
                Ok(names) => names.unwrap_or_default(),
                Err(Error::NotADirectory(path)) => {
                    warn!("audit: hash {} is not a directory", path.display());
                    stats.corrupted_files += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for name in files {
                check_cancelled(cancel)?;
                if FileKind::of(&name).is_none() {
                    continue;
                }
                let path = hash_dir.join(&name);
                let len = match fs::metadata(&path) {
                    Ok(meta) => meta.len(),
                    // Reclaimed while we were looking
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };

                match self.verify_standalone(&path, &name, len) {
                    Ok(()) => {
                        stats.processed_files += 1;
                        stats.processed_bytes += len;
                    }
                    Err(e) if e.is_corruption() => {
                        warn!("audit: {}: {e}", path.display());
                        stats.corrupted_files += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn verify_standalone(&self, path: &Path, name: &str, len: u64) -> Result<()> {
        let metadata = self.read_file_metadata(path)?;
        if FileKind::of(name) == Some(FileKind::Data)
            && let Some(declared) = metadata.get(keys::CONTENT_LENGTH)
            && declared.parse::<u64>().ok() != Some(len)
        {
            return Err(Error::corruption(format!(
                "content length {declared} does not match file size {len}"
            )));
        }
        Ok(())
    }

    /// Record that a suffix of a partition changed
    pub fn invalidate(&self, partition: Partition, suffix: &str) -> Result<()> {
        hashes::invalidate_suffix(
            &self.partition_dir(partition),
            suffix,
            self.config.lock_timeout(),
        )
    }

    /// Suffix digests of a partition, recomputing stale or requested ones
    pub fn get_hashes(
        &self,
        partition: Partition,
        recalculate: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let partition_dir = self.partition_dir(partition);
        match fs::metadata(&partition_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(Error::NotADirectory(partition_dir)),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        }

        let packed = self
            .pack(partition)?
            .map(|pack| pack.packed_names())
            .unwrap_or_default();
        hashes::get_hashes(&partition_dir, &self.hash_options(), recalculate, &packed)
    }
}

impl std::fmt::Debug for PackDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackDevice")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("objects_dir", &self.objects_dir)
            .finish_non_exhaustive()
    }
}
