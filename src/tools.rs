//! Small filesystem and time helpers shared across the storage layer.

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomically replace the contents of `path`.
///
/// Note: we use mkstemp here, because this works with different
/// processes and threads. The data is written to a temporary file in the
/// same directory and moved into place with an atomic rename.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = stat::Mode::S_IRUSR
        | stat::Mode::S_IWUSR
        | stat::Mode::S_IRGRP
        | stat::Mode::S_IROTH;

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = file.sync_data() {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Take an exclusive, non-blocking lock on `path` (created if missing).
///
/// A second writer on the same store directory is a contract violation,
/// so there is no retry loop: the caller either owns the store or fails
/// immediately. The lock is released when the returned file is dropped.
pub fn lock_file<P: AsRef<Path>>(path: P) -> Result<File, Error> {
    let path = path.as_ref();
    let lockfile = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => bail!("unable to open lock {:?} - {}", path, err),
    };

    if let Err(err) = flock(lockfile.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        bail!("unable to acquire lock {:?} - {}", path, err);
    }

    Ok(lockfile)
}

/// Current wall-clock time in Unix microseconds.
pub fn epoch_us() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        replace_file(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        replace_file(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let guard = lock_file(&path).unwrap();
        assert!(lock_file(&path).is_err());
        drop(guard);
        assert!(lock_file(&path).is_ok());
    }
}
