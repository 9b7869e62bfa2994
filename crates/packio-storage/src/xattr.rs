//! Extended attribute access
//!
//! Object metadata lives in named attribute slots attached to each object
//! file. [`XattrBackend`] is the process-wide capability for reading and
//! writing those slots by path; [`AttrChunks`] is the per-object view the
//! metadata codec works against.
//!
//! [`FsXattr`] talks to the kernel. [`MemoryXattr`] keeps attributes in
//! memory keyed by inode, so it follows files across renames the way real
//! attributes do; it backs tests on filesystems without user xattrs. Its
//! entries outlive deleted files, so new files are reset before use.

use packio_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Named attribute storage for files
pub trait XattrBackend: Send + Sync {
    /// Read an attribute, `None` if the file has no attribute by that name
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace an attribute
    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;

    /// Drop whatever a freshly created file might inherit
    ///
    /// Kernel attributes die with their inode, so there is nothing to do by
    /// default.
    fn reset(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Attribute slots of a single object
pub trait AttrChunks {
    /// Read one slot, `None` if absent
    fn get_chunk(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write one slot
    fn set_chunk(&mut self, name: &str, value: &[u8]) -> Result<()>;
}

/// Attribute slots of a file, through a backend
pub struct FileAttrs<'a> {
    backend: &'a dyn XattrBackend,
    path: &'a Path,
}

impl<'a> FileAttrs<'a> {
    /// View the attributes of `path`
    pub fn new(backend: &'a dyn XattrBackend, path: &'a Path) -> Self {
        Self { backend, path }
    }
}

impl AttrChunks for FileAttrs<'_> {
    fn get_chunk(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(self.path, name)
    }

    fn set_chunk(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.backend.set(self.path, name, value)
    }
}

/// Detached attribute slots, used where no file exists yet
#[derive(Debug, Default, Clone)]
pub struct MemoryAttrs {
    slots: HashMap<String, Vec<u8>>,
}

impl MemoryAttrs {
    /// Create an empty slot set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of populated slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is populated
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop a slot
    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.slots.remove(name)
    }
}

impl AttrChunks for MemoryAttrs {
    fn get_chunk(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.slots.get(name).cloned())
    }

    fn set_chunk(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.slots.insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

/// Kernel extended attributes
#[derive(Debug, Default, Clone, Copy)]
pub struct FsXattr;

#[cfg(target_os = "linux")]
impl XattrBackend for FsXattr {
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let c_path = c_path(path)?;
        let c_name = c_name(name)?;

        loop {
            // SAFETY: both strings are NUL-terminated and outlive the call;
            // a null buffer with size 0 only queries the value length.
            let size =
                unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
            if size < 0 {
                return absent_or_error(std::io::Error::last_os_error());
            }

            let mut buf = vec![0u8; size as usize];
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let read = unsafe {
                libc::getxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if read < 0 {
                let err = std::io::Error::last_os_error();
                // Value grew between the two calls
                if err.raw_os_error() == Some(libc::ERANGE) {
                    continue;
                }
                return absent_or_error(err);
            }

            buf.truncate(read as usize);
            return Ok(Some(buf));
        }
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let c_path = c_path(path)?;
        let c_name = c_name(name)?;

        // SAFETY: `value` is valid for `value.len()` bytes.
        let ret = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if ret == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl XattrBackend for FsXattr {
    fn get(&self, _path: &Path, _name: &str) -> Result<Option<Vec<u8>>> {
        Err(unsupported())
    }

    fn set(&self, _path: &Path, _name: &str, _value: &[u8]) -> Result<()> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "extended attributes are only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
fn absent_or_error(err: std::io::Error) -> Result<Option<Vec<u8>>> {
    if err.raw_os_error() == Some(libc::ENODATA) {
        Ok(None)
    } else {
        Err(Error::Io(err))
    }
}

#[cfg(target_os = "linux")]
fn c_path(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::invalid_argument(format!("path contains NUL: {}", path.display())))
}

#[cfg(target_os = "linux")]
fn c_name(name: &str) -> Result<std::ffi::CString> {
    std::ffi::CString::new(name)
        .map_err(|_| Error::invalid_argument(format!("attribute name contains NUL: {name:?}")))
}

/// In-memory attributes keyed by (device, inode, name)
#[derive(Debug, Default)]
pub struct MemoryXattr {
    attrs: RwLock<HashMap<(u64, u64, String), Vec<u8>>>,
}

impl MemoryXattr {
    /// Create an empty attribute store
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path, name: &str) -> Result<(u64, u64, String)> {
        let meta = std::fs::metadata(path)?;
        Ok((meta.dev(), meta.ino(), name.to_string()))
    }
}

impl XattrBackend for MemoryXattr {
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let key = Self::key(path, name)?;
        Ok(self.attrs.read().get(&key).cloned())
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let key = Self::key(path, name)?;
        self.attrs.write().insert(key, value.to_vec());
        Ok(())
    }

    fn reset(&self, path: &Path) -> Result<()> {
        let meta = std::fs::metadata(path)?;
        self.attrs
            .write()
            .retain(|(dev, ino, _), _| (*dev, *ino) != (meta.dev(), meta.ino()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_xattr_follows_rename() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("tmp-object");
        let dest = dir.path().join("1500000000.00000.data");
        std::fs::write(&tmp, b"body").unwrap();

        let backend = MemoryXattr::new();
        backend.set(&tmp, "user.test", b"value").unwrap();
        std::fs::rename(&tmp, &dest).unwrap();

        assert_eq!(backend.get(&dest, "user.test").unwrap().unwrap(), b"value");
        assert!(backend.get(&dest, "user.other").unwrap().is_none());
    }

    #[test]
    fn test_memory_xattr_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("object");
        let other = dir.path().join("other");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(&other, b"").unwrap();

        let backend = MemoryXattr::new();
        backend.set(&path, "user.a", b"1").unwrap();
        backend.set(&path, "user.a1", b"2").unwrap();
        backend.set(&other, "user.a", b"3").unwrap();

        backend.reset(&path).unwrap();
        assert!(backend.get(&path, "user.a").unwrap().is_none());
        assert!(backend.get(&path, "user.a1").unwrap().is_none());
        assert_eq!(backend.get(&other, "user.a").unwrap().unwrap(), b"3");
    }

    #[test]
    fn test_memory_xattr_missing_file() {
        let dir = tempdir().unwrap();
        let backend = MemoryXattr::new();
        let err = backend.get(&dir.path().join("nope"), "user.test").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_file_attrs_view() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("object");
        std::fs::write(&path, b"").unwrap();

        let backend = MemoryXattr::new();
        let mut attrs = FileAttrs::new(&backend, &path);
        attrs.set_chunk("user.a", b"1").unwrap();
        assert_eq!(attrs.get_chunk("user.a").unwrap().unwrap(), b"1");
        assert_eq!(backend.get(&path, "user.a").unwrap().unwrap(), b"1");
    }

    #[test]
    fn test_memory_attrs() {
        let mut attrs = MemoryAttrs::new();
        assert!(attrs.is_empty());
        attrs.set_chunk("user.a", b"x").unwrap();
        attrs.set_chunk("user.a", b"y").unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_chunk("user.a").unwrap().unwrap(), b"y");
        assert_eq!(attrs.remove("user.a").unwrap(), b"y");
        assert!(attrs.get_chunk("user.a").unwrap().is_none());
    }
}
