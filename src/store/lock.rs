use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{LatchError, Result};

const MAX_BACKOFF: Duration = Duration::from_millis(128);

/// Acquire an exclusive advisory lock on `path`, returning the locked File
/// handle. Retries with exponential backoff until `timeout` has elapsed, then
/// fails with `RegistryBusy`. The lock is released when the File is dropped.
pub fn acquire_lock(path: &Path, timeout: Duration) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| LatchError::RegistryUnavailable(format!("{}: {e}", path.display())))?;

    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(1);

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LatchError::RegistryBusy(path.display().to_string()));
                }
                std::thread::sleep(delay.min(deadline - now));
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let file = acquire_lock(&lock_path, Duration::from_millis(50)).unwrap();
        // Held; a second handle times out
        assert!(acquire_lock(&lock_path, Duration::from_millis(50)).is_err());
        release_lock(file).unwrap();
        let _file = acquire_lock(&lock_path, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn acquire_reports_busy_after_timeout() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("busy.lock");

        let _held = acquire_lock(&lock_path, Duration::from_millis(50)).unwrap();

        let start = Instant::now();
        let err = acquire_lock(&lock_path, Duration::from_millis(200)).unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.code(), "registry_busy");
        assert!(
            elapsed >= Duration::from_millis(200),
            "expected to wait out the timeout, but elapsed was {elapsed:?}",
        );
        assert!(elapsed < Duration::from_secs(2), "waited too long: {elapsed:?}");
    }

    #[test]
    fn waiter_gets_lock_once_holder_drops() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("handoff.lock");

        let held = acquire_lock(&lock_path, Duration::from_millis(50)).unwrap();
        let waiter_path = lock_path.clone();
        let waiter =
            std::thread::spawn(move || acquire_lock(&waiter_path, Duration::from_secs(5)).is_ok());
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn unopenable_path_is_unavailable() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("missing-dir").join("x.lock");
        let err = acquire_lock(&lock_path, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.code(), "registry_unavailable");
    }
}
