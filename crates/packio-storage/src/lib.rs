//! PackIO Storage Engine - Pack-based object storage
//!
//! This crate implements the on-disk engine of a PackIO storage node:
//! - Small objects packed as checksummed needles in per-partition pack files
//! - Large objects, metadata overrides and tombstones as standalone files
//! - Object metadata chunked across extended attribute slots
//! - Suffix hash trees with an append-only invalidation log
//! - Partition audit and suffix listing for replication

pub mod device;
pub mod hashes;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod needle;
pub mod object;
pub mod pack;
pub mod xattr;

// Re-exports
pub use device::{AuditStats, DeviceStats, ObjectData, ObjectRef, PackDevice, StoredObject};
pub use hashes::{
    CleanupPlan, HASH_FILE, HASH_INVALIDATIONS_FILE, HashOptions, QUARANTINE_DIR,
    cleanup_list_dir, get_hashes, invalidate_hash, invalidate_suffix, plan_cleanup,
    quarantine_hash, recalculate_suffix_hash,
};
pub use lock::PartitionLock;
pub use manager::DeviceManager;
pub use metadata::{METADATA_CHUNK_SIZE, METADATA_KEY, Metadata, merge_override};
pub use needle::{Needle, NeedleHeader};
pub use object::{ObjectState, PackObject};
pub use pack::{NeedleLocation, PACK_FILE, PackFile};
pub use xattr::{AttrChunks, FileAttrs, FsXattr, MemoryAttrs, MemoryXattr, XattrBackend};
