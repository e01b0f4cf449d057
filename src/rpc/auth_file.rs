//! Credential file storage shared by the trust and ticket stores
//!
//! Both files use one entry per line:
//!
//! ```text
//! serverAddress=userName:value
//! ```
//!
//! Writers take an advisory lock on `<file>.lck`, rewrite the whole file into
//! a sibling temp file and rename it into place, so readers never see a
//! partial file and never need the lock. When persistence is disabled the
//! same operations run against an in-memory map.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One parsed credential line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEntry {
    /// Server address or id
    pub server_address: String,
    /// User name (or trust role sentinel)
    pub user_name: String,
    /// Ticket or fingerprint
    pub value: String,
}

impl AuthEntry {
    /// Parse `address=user:value`; the user ends at the first `:` after the `=`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let equals = line.find('=')?;
        let colon = line[equals..].find(':').map(|i| equals + i)?;
        if colon + 1 >= line.len() {
            return None;
        }
        Some(Self {
            server_address: line[..equals].to_string(),
            user_name: line[equals + 1..colon].to_string(),
            value: line[colon + 1..].to_string(),
        })
    }

    /// Serialized line form
    pub fn to_line(&self) -> String {
        format!("{}={}:{}", self.server_address, self.user_name, self.value)
    }
}

/// Prefix a bare port with `localhost:`.
pub fn normalize_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("localhost:{address}")
    }
}

/// Retry budget for the advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Number of acquisition attempts
    pub tries: u32,
    /// Sleep between attempts, in milliseconds
    pub wait_ms: u64,
    /// Total time ceiling across all attempts, in milliseconds
    pub delay_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            tries: 100,
            wait_ms: 100,
            delay_ms: 300_000,
        }
    }
}

enum Backend {
    File {
        path: PathBuf,
        policy: LockPolicy,
        writers: Mutex<()>,
    },
    Memory(RwLock<HashMap<String, String>>),
}

/// A credential store backed by a file or by memory.
pub struct AuthStore {
    backend: Backend,
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend {
            Backend::File { path, .. } => f.debug_tuple("AuthStore::File").field(path).finish(),
            Backend::Memory(_) => f.write_str("AuthStore::Memory"),
        }
    }
}

impl AuthStore {
    /// Store persisted at `path`
    pub fn file(path: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            backend: Backend::File {
                path: path.into(),
                policy,
                writers: Mutex::new(()),
            },
        }
    }

    /// Store held in memory only
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File { path, .. } => Some(path),
            Backend::Memory(_) => None,
        }
    }

    /// All entries in file order (memory order is unspecified).
    pub fn entries(&self) -> StoreResult<Vec<AuthEntry>> {
        match &self.backend {
            Backend::File { path, .. } => read_entries(path),
            Backend::Memory(map) => Ok(map
                .read()
                .iter()
                .filter_map(|(key, value)| AuthEntry::parse_line(&format!("{key}:{value}")))
                .collect()),
        }
    }

    /// Entry for (`address`, `user`), if present.
    pub fn entry(&self, user: &str, address: &str) -> StoreResult<Option<AuthEntry>> {
        if user.trim().is_empty() || address.trim().is_empty() {
            return Ok(None);
        }
        let address = normalize_address(address);
        match &self.backend {
            Backend::Memory(map) => Ok(map
                .read()
                .get(&format!("{address}={user}"))
                .map(|value| AuthEntry {
                    server_address: address.clone(),
                    user_name: user.to_string(),
                    value: value.clone(),
                })),
            Backend::File { path, .. } => Ok(read_entries(path)?
                .into_iter()
                .find(|entry| entry.server_address == address && entry.user_name == user)),
        }
    }

    /// Insert, replace or (with `None` or a blank value) delete an entry.
    ///
    /// Blank users or addresses are ignored.
    pub fn save(&self, user: &str, address: &str, value: Option<&str>) -> StoreResult<()> {
        if user.trim().is_empty() || address.trim().is_empty() {
            return Ok(());
        }
        let address = normalize_address(address);
        let value = value.filter(|v| !v.trim().is_empty());
        match &self.backend {
            Backend::Memory(map) => {
                let key = format!("{address}={user}");
                let mut map = map.write();
                match value {
                    Some(value) => {
                        map.insert(key, value.to_string());
                    }
                    None => {
                        map.remove(&key);
                    }
                }
                Ok(())
            }
            Backend::File {
                path,
                policy,
                writers,
            } => {
                let _writer = writers.lock();
                save_file_entry(path, *policy, &address, user, value)
            }
        }
    }
}

fn read_entries(path: &Path) -> StoreResult<Vec<AuthEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(content.lines().filter_map(AuthEntry::parse_line).collect())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lck");
    PathBuf::from(name)
}

fn save_file_entry(
    path: &Path,
    policy: LockPolicy,
    address: &str,
    user: &str,
    value: Option<&str>,
) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let _lock = FileLock::acquire(&lock_path(path), policy)?;

    let prefix = format!("{address}={user}:");
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };

    let mut out = String::with_capacity(existing.len() + 128);
    let mut replaced = false;
    for line in existing.lines() {
        if !replaced && line.starts_with(&prefix) {
            replaced = true;
            if let Some(value) = value {
                out.push_str(&prefix);
                out.push_str(value);
                out.push('\n');
            }
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !replaced {
        if let Some(value) = value {
            out.push_str(&prefix);
            out.push_str(value);
            out.push('\n');
        }
    }

    write_replace(path, out.as_bytes(), true).map_err(|source| StoreError::RewriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(file = %path.display(), address, user, cleared = value.is_none(), "credential file updated");
    Ok(())
}

/// Write `data` to a sibling temp file and rename it over `path`.
///
/// With `read_only` the new file is left readable by its owner only.
pub(crate) fn write_replace(path: &Path, data: &[u8], read_only: bool) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "auth".to_string());
    let temp_path = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        if read_only {
            set_owner_read_only(&temp_path)?;
        }

        #[cfg(not(unix))]
        {
            if path.exists() {
                let mut perms = fs::metadata(path)?.permissions();
                perms.set_readonly(false);
                fs::set_permissions(path, perms)?;
            }
        }

        fs::rename(&temp_path, path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn set_owner_read_only(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o400))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)
    }
}

/// Exclusive advisory lock held for the guard's lifetime.
struct FileLock {
    _file: File,
    #[cfg(not(unix))]
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path, policy: LockPolicy) -> StoreResult<Self> {
        let tries = policy.tries.max(1);
        let wait = Duration::from_millis(policy.wait_ms.max(1));
        let ceiling = Duration::from_millis(policy.delay_ms);
        let started = Instant::now();

        for attempt in 1..=tries {
            if let Some(lock) = Self::try_acquire(path)? {
                if attempt > 1 {
                    debug!(lock = %path.display(), attempt, "credential lock acquired");
                }
                return Ok(lock);
            }
            if attempt == tries || started.elapsed() + wait > ceiling {
                break;
            }
            debug!(lock = %path.display(), remaining = tries - attempt, "credential lock busy, retrying");
            std::thread::sleep(wait);
        }

        warn!(lock = %path.display(), tries, "credential lock not acquired");
        Err(StoreError::LockTimeout {
            path: path.to_path_buf(),
            tries,
        })
    }

    #[cfg(unix)]
    fn try_acquire(path: &Path) -> StoreResult<Option<Self>> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // SAFETY: flock is a standard POSIX call on a descriptor owned by
        // `file`; LOCK_NB makes it return immediately.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(Some(Self { _file: file }));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err.into())
        }
    }

    #[cfg(not(unix))]
    fn try_acquire(path: &Path) -> StoreResult<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
