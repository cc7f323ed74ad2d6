//! Storage Environment
//!
//! A size-bounded, memory-mapped environment living in one directory (or one
//! file with `NO_SUBDIR`). Opening follows the create → size → open sequence:
//!
//! ```text
//! EnvironmentBuilder::new()      create: defaults, no resources yet
//!     .map_size(bytes)           size bound, validated on open
//!     .flags(EnvFlags::...)      open flags
//!     .open(path, mode)          directory, lock file, data file, mapping
//! ```
//!
//! ## On-Disk Layout
//! ```text
//! {path}/                        ({path} and {path}-lock with NO_SUBDIR)
//!   ├── data.mdb                 meta page + map_size bytes, memory-mapped
//!   └── lock.mdb                 flock()ed while the environment is open
//!
//! data.mdb page 0:
//! ┌─────────┬─────────┬──────────────────────────┬─────────┐
//! │ Len (4) │ CRC (4) │ Meta (bincode)           │ padding │
//! └─────────┴─────────┴──────────────────────────┴─────────┘
//! ```
//!
//! Every resource acquired during `open` is owned by a local until the
//! `Environment` is assembled, so any early return releases what was
//! already acquired.

use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{Mmap, MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::error::StorageInitError;

/// Data file name inside the environment directory
pub const DATA_FILENAME: &str = "data.mdb";

/// Lock file name inside the environment directory
pub const LOCK_FILENAME: &str = "lock.mdb";

/// Suffix appended to the data file path for the lock file with `NO_SUBDIR`
pub const LOCK_SUFFIX: &str = "-lock";

/// Default map size: 10 MiB
pub const DEFAULT_MAP_SIZE: u64 = 10 * 1024 * 1024;

const MAGIC: u32 = 0x5350_4B44; // "SPKD"
const FORMAT_VERSION: u16 = 1;

/// `[len (4)][crc (4)]` ahead of the encoded meta
const META_PREFIX: usize = 8;

// =============================================================================
// Flags
// =============================================================================

/// Flags controlling how an environment is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnvFlags(u32);

impl EnvFlags {
    pub const EMPTY: EnvFlags = EnvFlags(0);

    /// Open without write access; the environment must already exist
    pub const READ_ONLY: EnvFlags = EnvFlags(1 << 0);

    /// `path` names the data file itself rather than a directory
    pub const NO_SUBDIR: EnvFlags = EnvFlags(1 << 1);

    /// Map the data file writable
    pub const WRITE_MAP: EnvFlags = EnvFlags(1 << 2);

    /// Never flush on close
    pub const NO_SYNC: EnvFlags = EnvFlags(1 << 3);

    /// Flush asynchronously on close
    pub const MAP_ASYNC: EnvFlags = EnvFlags(1 << 4);

    /// Skip the lock file entirely
    pub const NO_LOCK: EnvFlags = EnvFlags(1 << 5);

    const NAMES: [(EnvFlags, &'static str); 6] = [
        (Self::READ_ONLY, "read-only"),
        (Self::NO_SUBDIR, "no-subdir"),
        (Self::WRITE_MAP, "write-map"),
        (Self::NO_SYNC, "no-sync"),
        (Self::MAP_ASYNC, "map-async"),
        (Self::NO_LOCK, "no-lock"),
    ];

    pub const fn contains(self, other: EnvFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Look up a single flag by its command-line name (e.g. `no-subdir`)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for EnvFlags {
    type Output = EnvFlags;

    fn bitor(self, rhs: EnvFlags) -> EnvFlags {
        EnvFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EnvFlags {
    fn bitor_assign(&mut self, rhs: EnvFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EnvFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Meta Page
// =============================================================================

/// Environment metadata stored at the start of the data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Meta {
    magic: u32,
    version: u16,
    page_size: u32,
    map_size: u64,
    /// Creation time (unix millis)
    created_at: u64,
}

impl Meta {
    fn new(page_size: u64, map_size: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            map_size,
            created_at,
        }
    }

    fn encode(&self) -> std::result::Result<Vec<u8>, String> {
        let body = bincode::serialize(self).map_err(|e| e.to_string())?;
        let crc = crc32fast::hash(&body);

        let mut page = Vec::with_capacity(META_PREFIX + body.len());
        page.extend_from_slice(&(body.len() as u32).to_le_bytes());
        page.extend_from_slice(&crc.to_le_bytes());
        page.extend_from_slice(&body);
        Ok(page)
    }

    fn decode(page: &[u8]) -> std::result::Result<Self, String> {
        if page.len() < META_PREFIX {
            return Err("meta page truncated".to_string());
        }
        let len = u32::from_le_bytes([page[0], page[1], page[2], page[3]]) as usize;
        let crc = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);

        let body = page
            .get(META_PREFIX..META_PREFIX + len)
            .ok_or_else(|| format!("meta length {} exceeds page", len))?;
        if crc32fast::hash(body) != crc {
            return Err("meta checksum mismatch".to_string());
        }

        let meta: Meta = bincode::deserialize(body).map_err(|e| e.to_string())?;
        if meta.magic != MAGIC {
            return Err(format!("bad magic {:#x}", meta.magic));
        }
        if meta.version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", meta.version));
        }
        Ok(meta)
    }
}

/// System page size, falling back to 4 KiB
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions; a negative return is handled.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects the size bound and flags before any file is touched
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    map_size: u64,
    flags: EnvFlags,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            flags: EnvFlags::EMPTY,
        }
    }

    /// Set the size bound of the memory map (rounded up to a page)
    pub fn map_size(mut self, size: u64) -> Self {
        self.map_size = size;
        self
    }

    /// Set the open flags
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Open the environment at `path`, creating files with `mode`
    ///
    /// Steps:
    /// 1. Validate the map size
    /// 2. Resolve (and create) the directory layout
    /// 3. Take the lock file
    /// 4. Open the data file, write or verify the meta page
    /// 5. Size the data file to the map and map it
    pub fn open(self, path: &Path, mode: u32) -> Result<Environment, StorageInitError> {
        let page = page_size();
        if self.map_size < page {
            return Err(StorageInitError::MapSize {
                size: self.map_size,
                min: page,
            });
        }
        let map_size = self.map_size.div_ceil(page) * page;
        let read_only = self.flags.contains(EnvFlags::READ_ONLY);

        // Step 1: Layout
        let (data_path, lock_path) = if self.flags.contains(EnvFlags::NO_SUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            prepare_dir(path, mode, read_only)?;
            (path.join(DATA_FILENAME), path.join(LOCK_FILENAME))
        };

        // Step 2: Lock
        let lock = if self.flags.contains(EnvFlags::NO_LOCK) {
            None
        } else {
            Some(acquire_lock(&lock_path, mode, read_only)?)
        };

        // Step 3: Data file and meta page
        let open_err = |source: io::Error| StorageInitError::Open {
            path: data_path.clone(),
            source,
        };
        let mut data = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .mode(mode)
            .open(&data_path)
            .map_err(open_err)?;

        let file_len = data.metadata().map_err(open_err)?.len();
        let mut meta = if file_len == 0 {
            if read_only {
                return Err(StorageInitError::Corrupt {
                    path: data_path.clone(),
                    reason: "empty data file opened read-only".to_string(),
                });
            }
            let meta = Meta::new(page, map_size);
            write_meta(&mut data, &meta).map_err(open_err)?;
            meta
        } else {
            read_meta(&mut data, page).map_err(|reason| StorageInitError::Corrupt {
                path: data_path.clone(),
                reason,
            })?
        };

        // Step 4: Size and map
        let map_len = if read_only {
            file_len
        } else {
            let target = map_size.max(meta.map_size);
            if target != meta.map_size {
                meta.map_size = target;
                write_meta(&mut data, &meta).map_err(open_err)?;
            }
            if data.metadata().map_err(open_err)?.len() < target {
                data.set_len(target).map_err(open_err)?;
            }
            target
        };

        let writable = !read_only && self.flags.contains(EnvFlags::WRITE_MAP);
        let map = Map::new(&data, map_len as usize, writable).map_err(open_err)?;

        tracing::debug!(
            "Opened environment {} (map_size={}, flags={})",
            path.display(),
            map_len,
            self.flags
        );

        Ok(Environment {
            path: path.to_path_buf(),
            data_path,
            flags: self.flags,
            meta,
            map,
            data,
            _lock: lock,
        })
    }
}

/// Mode for a freshly created directory: `mode` plus search bits where readable
fn dir_mode(mode: u32) -> u32 {
    mode | ((mode & 0o444) >> 2)
}

fn prepare_dir(path: &Path, mode: u32, read_only: bool) -> Result<(), StorageInitError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StorageInitError::Open {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "not a directory"),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound && !read_only => DirBuilder::new()
            .recursive(true)
            .mode(dir_mode(mode))
            .create(path)
            .map_err(StorageInitError::Create),
        Err(source) => Err(StorageInitError::Open {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn acquire_lock(path: &Path, mode: u32, read_only: bool) -> Result<File, StorageInitError> {
    let file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .create(!read_only)
        .mode(mode)
        .open(path)
        .map_err(|source| StorageInitError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let op = if read_only { libc::LOCK_SH } else { libc::LOCK_EX };
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(if err.kind() == io::ErrorKind::WouldBlock {
            StorageInitError::Locked {
                path: path.to_path_buf(),
            }
        } else {
            StorageInitError::Open {
                path: path.to_path_buf(),
                source: err,
            }
        });
    }
    Ok(file)
}

fn write_meta(file: &mut File, meta: &Meta) -> io::Result<()> {
    let page = meta
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&page)?;
    file.flush()
}

fn read_meta(file: &mut File, page_size: u64) -> std::result::Result<Meta, String> {
    let len = file.metadata().map_err(|e| e.to_string())?.len().min(page_size) as usize;
    let mut page = vec![0u8; len];
    file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
    file.read_exact(&mut page).map_err(|e| e.to_string())?;
    Meta::decode(&page)
}

// =============================================================================
// Environment
// =============================================================================

enum Map {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Map {
    fn new(file: &File, len: usize, writable: bool) -> io::Result<Self> {
        // SAFETY: the data file is held open for the lifetime of the map and
        // the lock file keeps other environments from resizing it.
        unsafe {
            if writable {
                MmapOptions::new().len(len).map_mut(file).map(Map::Writable)
            } else {
                MmapOptions::new().len(len).map(file).map(Map::ReadOnly)
            }
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Map::ReadOnly(m) => &m[..],
            Map::Writable(m) => &m[..],
        }
    }
}

/// Snapshot of an environment's parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub path: PathBuf,
    pub map_size: u64,
    pub page_size: u64,
    pub flags: EnvFlags,
    /// Creation time (unix millis) recorded in the meta page
    pub created_at: u64,
}

/// An open storage environment
///
/// Dropping it unmaps the data file and releases the lock without flushing;
/// `close` flushes first according to the sync flags.
pub struct Environment {
    path: PathBuf,
    data_path: PathBuf,
    flags: EnvFlags,
    meta: Meta,
    map: Map,
    data: File,
    _lock: Option<File>,
}

impl Environment {
    /// Start building an environment
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the memory-mapped data file
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Length of the memory map in bytes
    pub fn map_size(&self) -> u64 {
        self.map.as_slice().len() as u64
    }

    /// Read-only view of the mapped data file
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_slice()
    }

    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            path: self.path.clone(),
            map_size: self.map_size(),
            page_size: self.meta.page_size as u64,
            flags: self.flags,
            created_at: self.meta.created_at,
        }
    }

    /// Flush mapped pages to disk according to the sync flags
    pub fn sync(&self) -> io::Result<()> {
        if self.flags.contains(EnvFlags::READ_ONLY) || self.flags.contains(EnvFlags::NO_SYNC) {
            return Ok(());
        }
        match &self.map {
            Map::Writable(m) if self.flags.contains(EnvFlags::MAP_ASYNC) => m.flush_async(),
            Map::Writable(m) => m.flush(),
            Map::ReadOnly(_) => self.data.sync_all(),
        }
    }

    /// Flush and release the environment
    pub fn close(self) -> io::Result<()> {
        let result = self.sync();
        tracing::debug!("Closed environment {}", self.path.display());
        result
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("map_size", &self.map_size())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip_detects_corruption() {
        let meta = Meta::new(4096, 1 << 20);
        let mut page = meta.encode().unwrap();
        assert_eq!(Meta::decode(&page).unwrap(), meta);

        let last = page.len() - 1;
        page[last] ^= 0xFF;
        assert!(Meta::decode(&page).unwrap_err().contains("checksum"));
    }

    #[test]
    fn test_flags_display_and_lookup() {
        let flags = EnvFlags::NO_SUBDIR | EnvFlags::NO_SYNC;
        assert_eq!(flags.to_string(), "no-subdir|no-sync");
        assert_eq!(EnvFlags::EMPTY.to_string(), "none");
        assert_eq!(EnvFlags::from_name("write-map"), Some(EnvFlags::WRITE_MAP));
        assert_eq!(EnvFlags::from_name("bogus"), None);
        assert!(flags.contains(EnvFlags::NO_SYNC));
        assert!(!flags.contains(EnvFlags::READ_ONLY));
    }

    #[test]
    fn test_dir_mode_adds_search_bits() {
        assert_eq!(dir_mode(0o644), 0o755);
        assert_eq!(dir_mode(0o600), 0o700);
    }
}
