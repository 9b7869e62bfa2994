//! Core type definitions for PackIO
//!
//! This module defines the identifiers that name things on disk: storage
//! policies and their object directories, object hashes and the suffix
//! fragment derived from them, timestamps and object file kinds.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Object directory name of policy 0
pub const BASE_POLICY_DIR: &str = "objects";

/// Length of the hex suffix fragment that groups hash directories
pub const SUFFIX_LEN: usize = 3;

/// Storage policy index
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct Policy(u32);

impl Policy {
    /// Create a policy from its index
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the policy index
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Object directory name for this policy (`objects`, `objects-N`)
    #[must_use]
    pub fn dir_name(self) -> String {
        if self.0 == 0 {
            BASE_POLICY_DIR.to_string()
        } else {
            format!("{BASE_POLICY_DIR}-{}", self.0)
        }
    }

    /// Parse a policy back out of its object directory name
    ///
    /// Only the canonical spelling produced by [`Policy::dir_name`] is
    /// accepted, so the mapping stays bijective.
    pub fn from_dir_name(dir: &str) -> Result<Self> {
        if dir == BASE_POLICY_DIR {
            return Ok(Self(0));
        }

        let invalid = || Error::InvalidPolicyDir(dir.to_string());
        let digits = dir
            .strip_prefix(BASE_POLICY_DIR)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(invalid)?;

        if digits.is_empty()
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        digits.parse::<u32>().map(Self).map_err(|_| invalid())
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Policy({})", self.0)
    }
}

/// Object directory name for a policy
#[must_use]
pub fn policy_dir(policy: Policy) -> String {
    policy.dir_name()
}

/// Policy for an object directory name
pub fn un_policy_dir(dir: &str) -> Result<Policy> {
    Policy::from_dir_name(dir)
}

/// Partition number within a policy's object tree
pub type Partition = u64;

/// Fractional digits kept by [`Timestamp`]
const TIMESTAMP_PRECISION: u64 = 100_000;

/// Object timestamp with 10 microsecond resolution
///
/// Rendered as `SSSSSSSSSS.FFFFF`. The fixed width keeps lexical order of
/// file names equal to chronological order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall clock time
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(elapsed.as_secs() * TIMESTAMP_PRECISION + u64::from(elapsed.subsec_nanos()) / 10_000)
    }

    /// Timestamp at a whole number of seconds since the epoch
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * TIMESTAMP_PRECISION)
    }

    /// Whole seconds since the epoch
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / TIMESTAMP_PRECISION
    }

    /// Fixed-width rendering used in file names
    #[must_use]
    pub fn normal(self) -> String {
        format!(
            "{:010}.{:05}",
            self.0 / TIMESTAMP_PRECISION,
            self.0 % TIMESTAMP_PRECISION
        )
    }

    /// Time elapsed between this timestamp and `now`
    #[must_use]
    pub const fn age(self, now: Self) -> Duration {
        Duration::from_secs(now.as_secs().saturating_sub(self.as_secs()))
    }

    /// Parse `SECONDS[.FRACTION]`
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::invalid_argument(format!("invalid timestamp: {s:?}"));
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));

        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let secs: u64 = whole.parse().map_err(|_| invalid())?;
        let mut units = 0u64;
        let mut scale = TIMESTAMP_PRECISION;
        for digit in frac.bytes().take(5) {
            scale /= 10;
            units += u64::from(digit - b'0') * scale;
        }

        secs.checked_mul(TIMESTAMP_PRECISION)
            .and_then(|v| v.checked_add(units))
            .map(Self)
            .ok_or_else(invalid)
    }

    /// Parse the timestamp embedded in an object file name
    ///
    /// Strips the extension and any `_`-separated fragment that follows the
    /// timestamp (`1500000000.00000_frag.ts`).
    pub fn from_file_name(name: &str) -> Result<Self> {
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let stem = stem.split_once('_').map_or(stem, |(ts, _)| ts);
        Self::parse(stem)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.normal())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normal())
    }
}

/// Hash identifying one logical object (32 lowercase hex characters)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectHash(String);

impl ObjectHash {
    /// Hash an object name
    #[must_use]
    pub fn for_name(name: &str) -> Self {
        Self(format!("{:x}", md5::compute(name.as_bytes())))
    }

    /// Validate an existing hash string
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 32 && is_lower_hex(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::invalid_argument(format!("invalid object hash: {s:?}")))
        }
    }

    /// Suffix fragment grouping this hash
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.0[self.0.len() - SUFFIX_LEN..]
    }

    /// Get the hash as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.0)
    }
}

/// Whether a directory entry name is a suffix directory
#[must_use]
pub fn is_suffix_name(name: &str) -> bool {
    name.len() == SUFFIX_LEN && is_lower_hex(name)
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Kind of an object state file inside a hash directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Object body and its base metadata
    Data,
    /// Metadata override layered over a data file
    Meta,
    /// Delete marker
    Tombstone,
}

impl FileKind {
    /// File name extension, including the dot
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Data => ".data",
            Self::Meta => ".meta",
            Self::Tombstone => ".ts",
        }
    }

    /// Classify a file name by its extension
    #[must_use]
    pub fn of(file_name: &str) -> Option<Self> {
        [Self::Data, Self::Meta, Self::Tombstone]
            .into_iter()
            .find(|kind| file_name.ends_with(kind.extension()))
    }

    /// File name for an object state written at `timestamp`
    #[must_use]
    pub fn file_name(self, timestamp: Timestamp) -> String {
        format!("{}{}", timestamp.normal(), self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_dir_roundtrip() {
        for index in [0, 1, 2, 9, 10, 42, 1000, u32::MAX] {
            let policy = Policy::new(index);
            let dir = policy_dir(policy);
            assert_eq!(un_policy_dir(&dir).unwrap(), policy);
            assert_eq!(policy_dir(un_policy_dir(&dir).unwrap()), dir);
        }
        assert_eq!(Policy::new(0).dir_name(), "objects");
        assert_eq!(Policy::new(7).dir_name(), "objects-7");
    }

    #[test]
    fn test_policy_dir_rejects_non_canonical() {
        for dir in [
            "objects-0",
            "objects-01",
            "objects-",
            "objects-x",
            "objects-1a",
            "objects--1",
            "object",
            "containers",
            "objects-99999999999",
        ] {
            assert!(un_policy_dir(dir).is_err(), "{dir} should not parse");
        }
    }

    #[test]
    fn test_timestamp_normal() {
        let ts = Timestamp::parse("1500000000.5").unwrap();
        assert_eq!(ts.normal(), "1500000000.50000");
        assert_eq!(ts.as_secs(), 1_500_000_000);
        assert_eq!(Timestamp::from_secs(42).normal(), "0000000042.00000");
    }

    #[test]
    fn test_timestamp_ordering_matches_names() {
        let older = Timestamp::parse("999999999.99999").unwrap();
        let newer = Timestamp::parse("1000000000.00000").unwrap();
        assert!(older < newer);
        assert!(older.normal() < newer.normal());
    }

    #[test]
    fn test_timestamp_from_file_name() {
        let ts = Timestamp::from_file_name("1500000000.12345.ts").unwrap();
        assert_eq!(ts.normal(), "1500000000.12345");

        let ts = Timestamp::from_file_name("1500000000.12345_ctype.ts").unwrap();
        assert_eq!(ts.normal(), "1500000000.12345");

        assert!(Timestamp::from_file_name("garbage.ts").is_err());
        assert!(Timestamp::from_file_name(".ts").is_err());
    }

    #[test]
    fn test_timestamp_age() {
        let then = Timestamp::from_secs(1000);
        let now = Timestamp::from_secs(1600);
        assert_eq!(then.age(now), Duration::from_secs(600));
        assert_eq!(now.age(then), Duration::ZERO);
    }

    #[test]
    fn test_object_hash_suffix() {
        let hash = ObjectHash::for_name("/AUTH_test/photos/cat.jpg");
        assert_eq!(hash.as_str().len(), 32);
        assert_eq!(hash.suffix(), &hash.as_str()[29..]);
        assert!(is_suffix_name(hash.suffix()));
        assert_eq!(ObjectHash::parse(hash.as_str()).unwrap(), hash);
    }

    #[test]
    fn test_object_hash_parse_rejects() {
        assert!(ObjectHash::parse("abc").is_err());
        assert!(ObjectHash::parse("D41D8CD98F00B204E9800998ECF8427E").is_err());
        assert!(ObjectHash::parse("d41d8cd98f00b204e9800998ecf8427e").is_ok());
    }

    #[test]
    fn test_suffix_name() {
        assert!(is_suffix_name("a1f"));
        assert!(!is_suffix_name("A1F"));
        assert!(!is_suffix_name("hashes.invalid"));
        assert!(!is_suffix_name(".lock"));
    }

    #[test]
    fn test_file_kind() {
        let ts = Timestamp::from_secs(1_500_000_000);
        assert_eq!(FileKind::Data.file_name(ts), "1500000000.00000.data");
        assert_eq!(FileKind::of("1500000000.00000.meta"), Some(FileKind::Meta));
        assert_eq!(FileKind::of("1500000000.00000.ts"), Some(FileKind::Tombstone));
        assert_eq!(FileKind::of("1500000000.00000.durable"), None);
    }
}
