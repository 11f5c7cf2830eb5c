//! Single-instance advisory lock and process liveness probes.
//!
//! The daemon takes a POSIX record lock (`fcntl F_SETLK`, write lock over
//! the whole file) on `flowd.lock` and writes its pid into the file. The
//! lock is released by the kernel when the process exits, however it
//! exits. Observers use `F_GETLK`, which reports the holder's pid without
//! ever taking the lock, so probing cannot race a daemon start.
//!
//! The lock file must not be opened and closed elsewhere in the daemon
//! process: closing any descriptor of the file drops a POSIX record lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by another instance (recorded pid {holder:?})")]
    Contended { path: PathBuf, holder: Option<u32> },
    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Process exit status when another instance owns the state directory
/// (`EX_TEMPFAIL`).
pub const EXIT_LOCK_CONTENTION: u8 = 75;

impl LockError {
    /// Exit status the daemon reports for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            LockError::Contended { .. } => EXIT_LOCK_CONTENTION,
            LockError::Io { .. } => 1,
        }
    }
}

/// Held for the daemon's lifetime; dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Non-blocking acquire. Never waits or retries.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io { path: path.to_path_buf(), source };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let mut fl = whole_file_lock(libc::F_WRLCK);
        // SAFETY: fd is valid for the lifetime of `file`; `fl` is a fully
        // initialised flock struct.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl as *mut libc::flock) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EACCES || code == libc::EAGAIN => Err(LockError::Contended {
                    path: path.to_path_buf(),
                    holder: read_recorded_pid(path),
                }),
                _ => Err(io_err(err)),
            };
        }

        let pid = std::process::id();
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{pid}").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        Ok(Self { _file: file, path: path.to_path_buf(), pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What an observer can learn about the lock without taking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProbe {
    /// No lock file at all.
    Missing,
    /// File exists but nobody holds the lock.
    Free { recorded_pid: Option<u32> },
    /// Held; `holder_pid` comes from the kernel, `recorded_pid` from the file.
    Held { holder_pid: u32, recorded_pid: Option<u32> },
}

pub fn probe(path: &Path) -> io::Result<LockProbe> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockProbe::Missing),
        Err(e) => return Err(e),
    };
    let recorded_pid = read_recorded_pid(path);

    let mut fl = whole_file_lock(libc::F_RDLCK);
    // SAFETY: as in `acquire`; F_GETLK only fills `fl`.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl as *mut libc::flock) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if fl.l_type == libc::F_UNLCK as libc::c_short {
        Ok(LockProbe::Free { recorded_pid })
    } else {
        Ok(LockProbe::Held {
            holder_pid: fl.l_pid as u32,
            recorded_pid,
        })
    }
}

/// Whether a process with `pid` exists (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn read_recorded_pid(path: &Path) -> Option<u32> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

fn whole_file_lock(kind: libc::c_int) -> libc::flock {
    // SAFETY: flock is a plain C struct; all-zero is a valid value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    const HOLDER_PATH_ENV: &str = "FLOWD_TEST_LOCK_HOLDER_PATH";

    fn wait_for(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !path.exists() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Child side of `test_second_instance_is_contended`: a POSIX record
    /// lock is invisible inside its own process, so the holder has to be
    /// another one. Does nothing when run directly.
    #[test]
    #[ignore]
    fn hold_lock_until_released() {
        let Ok(path) = std::env::var(HOLDER_PATH_ENV) else {
            return;
        };
        let path = PathBuf::from(path);
        let _lock = InstanceLock::acquire(&path).unwrap();
        std::fs::write(path.with_extension("ready"), "").unwrap();
        let release = path.with_extension("release");
        let deadline = Instant::now() + Duration::from_secs(20);
        while !release.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_second_instance_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowd.lock");

        let mut child = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "lock::tests::hold_lock_until_released", "--ignored", "--nocapture"])
            .env(HOLDER_PATH_ENV, &path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let child_pid = child.id();
        wait_for(&path.with_extension("ready"));

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(
            matches!(err, LockError::Contended { holder: Some(pid), .. } if pid == child_pid),
            "unexpected: {err:?}"
        );
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);
        assert_eq!(
            probe(&path).unwrap(),
            LockProbe::Held {
                holder_pid: child_pid,
                recorded_pid: Some(child_pid),
            }
        );

        std::fs::write(path.with_extension("release"), "").unwrap();
        assert!(child.wait().unwrap().success());

        // The kernel drops the lock with the holder.
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_recorded_pid(&path), Some(lock.pid()));
    }

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowd.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.pid(), std::process::id());
        assert_eq!(read_recorded_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_probe_missing_and_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowd.lock");
        assert_eq!(probe(&path).unwrap(), LockProbe::Missing);

        std::fs::write(&path, "4242\n").unwrap();
        // Same-process locks are invisible to F_GETLK, so only the
        // unlocked case is observable here.
        assert_eq!(probe(&path).unwrap(), LockProbe::Free { recorded_pid: Some(4242) });
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
    }
}
