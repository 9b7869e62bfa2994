//! Suffix hashes
//!
//! Replication compares partitions suffix by suffix. Each suffix digest is
//! the MD5 of the surviving object file names of every hash directory under
//! it, taken in ascending hash order with names newest first.
//!
//! Digests are cached per partition in `hashes.json`. Writers never touch
//! the cache; they append the suffix to `hashes.invalid` under the partition
//! lock. [`get_hashes`] folds the log into the cache and recomputes stale
//! entries on demand.
//!
//! Hash directory cleanup follows the object file precedence rules:
//!
//! - a lone tombstone older than the reclaim age removes the whole directory
//! - otherwise names are scanned newest first; the newest data file or
//!   tombstone makes everything older obsolete
//! - only the newest metadata override survives
//!
//! A hash "directory" that turns out to be a regular file is moved to
//! `<device>/quarantined/<objects dir>/<hash>-<uuid>` and its suffix is
//! invalidated.

use crate::lock::PartitionLock;
use packio_common::{EngineConfig, Error, FileKind, Result, Timestamp, is_suffix_name};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix hash cache file name
pub const HASH_FILE: &str = "hashes.json";

/// Invalidation log file name
pub const HASH_INVALIDATIONS_FILE: &str = "hashes.invalid";

/// Quarantine directory name under a device root
pub const QUARANTINE_DIR: &str = "quarantined";

/// Object file names stored outside hash directories, by hash
pub type PackedNames = BTreeMap<String, Vec<String>>;

/// Cached digests per suffix; `None` marks a suffix needing recomputation
pub type HashCache = BTreeMap<String, Option<String>>;

/// Parameters for cleanup and hashing
#[derive(Clone, Copy, Debug)]
pub struct HashOptions {
    pub reclaim_age: Duration,
    pub lock_timeout: Duration,
}

impl From<&EngineConfig> for HashOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            reclaim_age: config.reclaim_age(),
            lock_timeout: config.lock_timeout(),
        }
    }
}

impl Default for HashOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Outcome of applying the precedence rules to one hash directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupPlan {
    /// Surviving names, newest first
    pub keep: Vec<String>,
    /// Obsolete names
    pub remove: Vec<String>,
}

/// Decide which object files of a hash directory survive
///
/// `names` must be sorted ascending; fixed-width timestamps make that
/// chronological.
#[must_use]
pub fn plan_cleanup(names: &[String], now: Timestamp, reclaim_age: Duration) -> CleanupPlan {
    if let [only] = names {
        if FileKind::of(only) == Some(FileKind::Tombstone) && tombstone_expired(only, now, reclaim_age)
        {
            return CleanupPlan {
                keep: Vec::new(),
                remove: vec![only.clone()],
            };
        }
        return CleanupPlan {
            keep: vec![only.clone()],
            remove: Vec::new(),
        };
    }

    let mut plan = CleanupPlan::default();
    let mut delete_rest = false;
    let mut seen_meta = false;

    for name in names.iter().rev() {
        if delete_rest {
            plan.remove.push(name.clone());
            continue;
        }
        match FileKind::of(name) {
            Some(FileKind::Meta) => {
                if seen_meta {
                    plan.remove.push(name.clone());
                    continue;
                }
                seen_meta = true;
            }
            Some(FileKind::Data | FileKind::Tombstone) => delete_rest = true,
            None => {}
        }
        plan.keep.push(name.clone());
    }
    plan
}

fn tombstone_expired(name: &str, now: Timestamp, reclaim_age: Duration) -> bool {
    match Timestamp::from_file_name(name) {
        Ok(timestamp) => timestamp.age(now) > reclaim_age,
        Err(_) => {
            warn!("keeping tombstone with unparsable timestamp: {name}");
            false
        }
    }
}

/// Sorted entry names of a directory, `None` if it does not exist
pub fn read_dir_names(dir: &Path) -> Result<Option<Vec<String>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == ErrorKind::NotADirectory => {
            return Err(Error::NotADirectory(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => debug!("skipping non-UTF-8 entry {name:?} in {}", dir.display()),
        }
    }
    names.sort_unstable();
    Ok(Some(names))
}

/// Apply the precedence rules to a hash directory on disk
///
/// Returns the surviving names, newest first. A missing directory yields an
/// empty list; a directory left empty is removed.
pub fn cleanup_list_dir(hash_dir: &Path, reclaim_age: Duration) -> Result<Vec<String>> {
    cleanup_hash_dir(hash_dir, &[], Timestamp::now(), reclaim_age)
}

/// Cleanup where some names live outside the directory
///
/// Packed names take part in precedence but are never deleted here.
pub(crate) fn cleanup_hash_dir(
    hash_dir: &Path,
    packed: &[String],
    now: Timestamp,
    reclaim_age: Duration,
) -> Result<Vec<String>> {
    let on_disk = read_dir_names(hash_dir)?;
    let local = on_disk.as_deref().unwrap_or_default();

    let mut names: Vec<String> = local.iter().chain(packed).cloned().collect();
    names.sort_unstable();
    names.dedup();

    let plan = plan_cleanup(&names, now, reclaim_age);
    for name in &plan.remove {
        if local.binary_search(name).is_ok() {
            remove_obsolete(&hash_dir.join(name));
        }
    }

    if on_disk.is_some() && plan.keep.iter().all(|name| local.binary_search(name).is_err()) {
        remove_empty_dir(hash_dir);
    }
    Ok(plan.keep)
}

fn remove_obsolete(path: &Path) {
    let result = match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::IsADirectory => fs::remove_dir_all(path),
        other => other,
    };
    match result {
        Ok(()) => debug!("removed obsolete {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove obsolete {}: {e}", path.display()),
    }
}

fn remove_empty_dir(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => debug!("removed empty {}", dir.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        // Something landed in it since the listing
        Err(e) => debug!("kept {}: {e}", dir.display()),
    }
}

/// Move a damaged hash directory aside
///
/// `hash_dir` must sit at `<device>/<objects dir>/<partition>/<suffix>/<hash>`.
pub fn quarantine_hash(hash_dir: &Path) -> Result<PathBuf> {
    let layout_error = || {
        Error::invalid_argument(format!(
            "not inside an object tree: {}",
            hash_dir.display()
        ))
    };

    let hash = hash_dir.file_name().ok_or_else(layout_error)?;
    let objects_dir = hash_dir
        .ancestors()
        .nth(3)
        .ok_or_else(layout_error)?;
    let objects_name = objects_dir.file_name().ok_or_else(layout_error)?;
    let device_dir = objects_dir.parent().ok_or_else(layout_error)?;

    let quarantine_dir = device_dir.join(QUARANTINE_DIR).join(objects_name);
    fs::create_dir_all(&quarantine_dir)?;

    let dest = quarantine_dir.join(format!(
        "{}-{}",
        hash.to_string_lossy(),
        Uuid::new_v4().simple()
    ));
    fs::rename(hash_dir, &dest)?;
    warn!("quarantined {} to {}", hash_dir.display(), dest.display());
    Ok(dest)
}

/// Record that a suffix's digest is stale
pub fn invalidate_suffix(partition_dir: &Path, suffix: &str, lock_timeout: Duration) -> Result<()> {
    if !is_suffix_name(suffix) {
        return Err(Error::invalid_argument(format!("invalid suffix: {suffix:?}")));
    }

    let _lock = PartitionLock::acquire(partition_dir, lock_timeout)?;
    let mut log = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o660)
        .open(partition_dir.join(HASH_INVALIDATIONS_FILE))?;
    log.write_all(format!("{suffix}\n").as_bytes())?;
    Ok(())
}

/// Record that the suffix containing `hash_dir` is stale
pub fn invalidate_hash(hash_dir: &Path, lock_timeout: Duration) -> Result<()> {
    let suffix_dir = hash_dir.parent();
    let suffix = suffix_dir.and_then(Path::file_name).and_then(|s| s.to_str());
    let partition_dir = suffix_dir.and_then(Path::parent);

    match (partition_dir, suffix) {
        (Some(partition_dir), Some(suffix)) => invalidate_suffix(partition_dir, suffix, lock_timeout),
        _ => Err(Error::invalid_argument(format!(
            "not inside a partition: {}",
            hash_dir.display()
        ))),
    }
}

/// Clean every hash directory of a suffix and digest what survives
pub fn recalculate_suffix_hash(suffix_dir: &Path, options: &HashOptions) -> Result<String> {
    recalculate_suffix_hash_with(suffix_dir, options, &PackedNames::new())
}

/// Suffix digest including names that live in the partition's pack file
pub fn recalculate_suffix_hash_with(
    suffix_dir: &Path,
    options: &HashOptions,
    packed: &PackedNames,
) -> Result<String> {
    let now = Timestamp::now();
    let mut hashes: BTreeSet<String> = read_dir_names(suffix_dir)?
        .unwrap_or_default()
        .into_iter()
        .collect();
    hashes.extend(packed.keys().cloned());

    let mut context = md5::Context::new();
    for hash in &hashes {
        let hash_dir = suffix_dir.join(hash);
        let packed_names = packed.get(hash).map_or(&[][..], Vec::as_slice);

        match cleanup_hash_dir(&hash_dir, packed_names, now, options.reclaim_age) {
            Ok(keep) => {
                for name in &keep {
                    context.consume(name.as_bytes());
                }
            }
            // Contained here: the rest of the suffix still gets hashed
            Err(Error::NotADirectory(_)) => {
                if let Err(e) = quarantine_hash(&hash_dir) {
                    warn!("failed to quarantine {}: {e}", hash_dir.display());
                    continue;
                }
                if let Err(e) = invalidate_hash(&hash_dir, options.lock_timeout) {
                    warn!("failed to invalidate {}: {e}", hash_dir.display());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(format!("{:x}", context.compute()))
}

fn read_hash_cache(partition_dir: &Path) -> Result<Option<HashCache>> {
    let path = partition_dir.join(HASH_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(cache) => Ok(Some(cache)),
        Err(e) => {
            warn!("discarding unreadable {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Replace the hash cache atomically; caller holds the partition lock
fn write_hash_cache(partition_dir: &Path, cache: &HashCache) -> Result<()> {
    let bytes = serde_json::to_vec(cache).map_err(|e| Error::Serialization(e.to_string()))?;
    let tmp_path = partition_dir.join(format!("{HASH_FILE}.tmp"));
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_data()?;
    }
    fs::rename(&tmp_path, partition_dir.join(HASH_FILE))?;
    Ok(())
}

/// Fold the invalidation log into the cache
///
/// The cache is persisted before the log is truncated, so a crash in
/// between only repeats work.
fn consolidate_hashes(
    partition_dir: &Path,
    options: &HashOptions,
    packed: &BTreeMap<String, PackedNames>,
) -> Result<HashCache> {
    let _lock = PartitionLock::acquire(partition_dir, options.lock_timeout)?;

    let (mut cache, mut dirty) = match read_hash_cache(partition_dir)? {
        Some(cache) => (cache, false),
        None => {
            let mut cache = HashCache::new();
            for name in read_dir_names(partition_dir)?.unwrap_or_default() {
                if is_suffix_name(&name) {
                    cache.insert(name, None);
                }
            }
            for suffix in packed.keys() {
                cache.insert(suffix.clone(), None);
            }
            (cache, true)
        }
    };

    let log_path = partition_dir.join(HASH_INVALIDATIONS_FILE);
    let invalidated = match fs::read_to_string(&log_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    for suffix in invalidated.lines().map(str::trim) {
        if is_suffix_name(suffix) {
            cache.insert(suffix.to_string(), None);
            dirty = true;
        } else if !suffix.is_empty() {
            warn!("ignoring bad invalidation entry {suffix:?} in {}", log_path.display());
        }
    }

    if dirty {
        write_hash_cache(partition_dir, &cache)?;
    }
    if !invalidated.is_empty() {
        OpenOptions::new().write(true).truncate(true).open(&log_path)?;
    }
    Ok(cache)
}

/// Current suffix digests of a partition
///
/// Suffixes named in `recalculate` are recomputed even if cached. Suffixes
/// found empty are dropped from the result and the cache.
pub fn get_hashes(
    partition_dir: &Path,
    options: &HashOptions,
    recalculate: &[String],
    packed: &BTreeMap<String, PackedNames>,
) -> Result<BTreeMap<String, String>> {
    let mut cache = consolidate_hashes(partition_dir, options, packed)?;
    for suffix in recalculate {
        if is_suffix_name(suffix) {
            cache.insert(suffix.clone(), None);
        }
    }

    let stale: Vec<String> = cache
        .iter()
        .filter(|(_, digest)| digest.is_none())
        .map(|(suffix, _)| suffix.clone())
        .collect();
    let empty = PackedNames::new();

    for suffix in &stale {
        let suffix_dir = partition_dir.join(suffix);
        let suffix_packed = packed.get(suffix).unwrap_or(&empty);

        match recalculate_suffix_hash_with(&suffix_dir, options, suffix_packed) {
            Ok(digest) => {
                let local = read_dir_names(&suffix_dir)?;
                if suffix_packed.is_empty() && local.as_ref().is_none_or(Vec::is_empty) {
                    if local.is_some() {
                        remove_empty_dir(&suffix_dir);
                    }
                    cache.remove(suffix);
                } else {
                    cache.insert(suffix.clone(), Some(digest));
                }
            }
            Err(Error::NotADirectory(path)) => {
                warn!("suffix path is not a directory: {}", path.display());
                cache.remove(suffix);
            }
            Err(e) => return Err(e),
        }
    }

    if !stale.is_empty() {
        let _lock = PartitionLock::acquire(partition_dir, options.lock_timeout)?;
        write_hash_cache(partition_dir, &cache)?;
    }

    Ok(cache
        .into_iter()
        .filter_map(|(suffix, digest)| digest.map(|digest| (suffix, digest)))
        .collect())
}
