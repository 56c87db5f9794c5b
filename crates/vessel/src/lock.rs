//! Cross-process cooperative locking.
//!
//! Two primitives coordinate concurrent engine processes:
//!
//! - [`PathLock`]: a cooperative lock on a single path, backed by an on-disk
//!   lock file created with `O_CREAT|O_EXCL` plus a process-local mutex table
//!   keyed by the canonicalized path (so threads of one process queue up
//!   without hammering the filesystem).
//! - [`LockDir`]: an exclusive-or-shared lock over a whole store, backed by a
//!   directory holding one `exclusive.lock` file and any number of
//!   `sharedlock-<pid>-<random>` files.
//!
//! Lock files contain the holder's PID. An acquirer finding a lock file whose
//! PID no longer exists removes it and retries, so a crashed peer cannot
//! deadlock the store. All waits honor a caller-supplied deadline and surface
//! [`Error::Timeout`] when it elapses; there are no silent infinite waits.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use log::debug;
use once_cell::sync::Lazy;
use rustix::io::Errno;
use rustix::process::{test_kill_process, Pid};

use crate::error::{Context, Error, Result};
use crate::util::generate_tmpname;

/// Poll interval bounds for the on-disk watch loop.
const WATCH_POLL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(100);

static LOCAL_LOCKS: Lazy<LocalLockTable> = Lazy::new(LocalLockTable::default);

/// Process-local table of held lock paths.
///
/// Serializes threads of this process on the canonical path before any disk
/// I/O happens. Waiting uses a condvar so release wakes waiters promptly.
#[derive(Default)]
struct LocalLockTable {
    held: Mutex<HashSet<PathBuf>>,
    cond: Condvar,
}

impl LocalLockTable {
    fn acquire(&self, path: &Path, deadline: Instant) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        while held.contains(path) {
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_error(path, deadline));
            }
            let (guard, _) = self.cond.wait_timeout(held, deadline - now).unwrap();
            held = guard;
        }
        held.insert(path.to_path_buf());
        Ok(())
    }

    fn release(&self, path: &Path) {
        let mut held = self.held.lock().unwrap();
        held.remove(path);
        self.cond.notify_all();
    }
}

fn timeout_error(path: &Path, deadline: Instant) -> Error {
    Error::Timeout {
        path: path.to_path_buf(),
        waited: Instant::now().saturating_duration_since(deadline),
    }
}

/// Canonicalize the directory part of a lock path; the file itself need not
/// exist yet.
fn canonical_lock_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::invalid_input(format!("lock path {path:?} has no file name")))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p
            .canonicalize()
            .with_ctx(|| format!("canonicalize lock directory {}", p.display()))?,
        _ => std::env::current_dir().ctx("determine working directory")?,
    };
    Ok(parent.join(file_name))
}

/// True if a process with the given PID is (still) alive.
///
/// Only ESRCH is treated as dead; EPERM means the process exists but belongs
/// to another user.
fn pid_alive(pid: u32) -> bool {
    match i32::try_from(pid).ok().and_then(Pid::from_raw) {
        Some(pid) => !matches!(test_kill_process(pid), Err(Errno::SRCH)),
        None => false,
    }
}

/// Read the holder PID out of a lock file, if it parses.
fn read_lock_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Sleep until the lock file at `path` changes or `max` elapses.
///
/// "Changes" means removed, recreated, or rewritten; detected by polling the
/// (mtime, size) pair. This keeps a waiting process responsive to an unlock
/// without requiring an inotify watch.
fn watch_lock_file(path: &Path, max: Duration) {
    fn stamp(path: &Path) -> Option<(SystemTime, u64)> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        Some((meta.modified().ok()?, meta.len()))
    }

    let initial = stamp(path);
    let deadline = Instant::now() + max;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(WATCH_POLL.min(deadline - now));
        if stamp(path) != initial {
            return;
        }
    }
}

/// A held cooperative lock on one path. Released on drop.
#[derive(Debug)]
pub struct PathLock {
    path: PathBuf,
}

impl PathLock {
    /// Acquire the lock at `path`, waiting at most `timeout`.
    pub fn lock(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = canonical_lock_path(path.as_ref())?;
        let deadline = Instant::now() + timeout;

        LOCAL_LOCKS.acquire(&path, deadline)?;
        match Self::lock_disk(&path, deadline) {
            Ok(()) => Ok(PathLock { path }),
            Err(e) => {
                LOCAL_LOCKS.release(&path);
                Err(e)
            }
        }
    }

    fn lock_disk(path: &Path, deadline: Instant) -> Result<()> {
        let mut backoff = Duration::from_millis(2);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // A failed PID write leaves an empty lock file, which
                    // peers treat as held; still release disk state on error.
                    if let Err(e) = file.write_all(std::process::id().to_string().as_bytes()) {
                        let _ = std::fs::remove_file(path);
                        return Err(e).with_ctx(|| format!("write lock file {}", path.display()));
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = read_lock_pid(path) {
                        if !pid_alive(pid) {
                            debug!("removing stale lock {} held by dead pid {pid}", path.display());
                            let _ = std::fs::remove_file(path);
                            continue;
                        }
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(timeout_error(path, deadline));
                    }
                    watch_lock_file(path, backoff.min(deadline - now));
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(e) => {
                    return Err(e).with_ctx(|| format!("create lock file {}", path.display()))
                }
            }
        }
    }

    /// The canonicalized path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        LOCAL_LOCKS.release(&self.path);
    }
}

/// An exclusive-or-shared lock over a directory tree.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

/// A held shared lock. Released on drop.
#[derive(Debug)]
pub struct SharedLock {
    file: PathBuf,
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.file);
    }
}

/// A held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct ExclusiveLock {
    _excl: PathLock,
}

impl LockDir {
    /// Open (creating if necessary) the lock directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_ctx(|| format!("create lock directory {}", dir.display()))?;
        Ok(LockDir { dir })
    }

    fn exclusive_path(&self) -> PathBuf {
        self.dir.join("exclusive.lock")
    }

    /// Acquire a shared lock: readers are not blocked by other readers.
    ///
    /// Takes the exclusive lock only for the instant needed to place the
    /// shared marker file, so a waiting exclusive acquirer cannot race us.
    pub fn shared(&self, timeout: Duration) -> Result<SharedLock> {
        let excl = PathLock::lock(self.exclusive_path(), timeout)?;
        let name = format!(
            "sharedlock-{}-{}",
            std::process::id(),
            generate_tmpname("")
        );
        let file = self.dir.join(name);
        std::fs::write(&file, std::process::id().to_string())
            .with_ctx(|| format!("create shared lock {}", file.display()))?;
        drop(excl);
        Ok(SharedLock { file })
    }

    /// Acquire the exclusive lock: blocks new readers, then waits until every
    /// live shared holder is gone.
    pub fn exclusive(&self, timeout: Duration) -> Result<ExclusiveLock> {
        let deadline = Instant::now() + timeout;
        let excl = PathLock::lock(self.exclusive_path(), timeout)?;

        let mut backoff = Duration::from_millis(2);
        loop {
            if self.live_shared_count()? == 0 {
                return Ok(ExclusiveLock { _excl: excl });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_error(&self.dir, deadline));
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Count live shared lock files, unlinking those whose PID is dead.
    fn live_shared_count(&self) -> Result<usize> {
        let mut live = 0;
        let entries = std::fs::read_dir(&self.dir)
            .with_ctx(|| format!("read lock directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_ctx(|| format!("read lock directory {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix("sharedlock-") else {
                continue;
            };
            let pid: Option<u32> = rest.split('-').next().and_then(|p| p.parse().ok());
            match pid {
                Some(pid) if pid_alive(pid) => live += 1,
                _ => {
                    debug!("removing dead shared lock {name}");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(live)
    }
}
