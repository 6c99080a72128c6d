use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("another Glint updater is already running")]
    AlreadyRunning,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive lock held for the lifetime of the updater host. The lock file
/// records the owning pid.
#[derive(Debug)]
pub struct SingleInstance {
    _file: File,
}

impl SingleInstance {
    pub fn acquire(lock_path: &Path) -> Result<Self, AcquireError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| AcquireError::io("failed to create lock directory", error))?;
        }

        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|error| AcquireError::io("failed to open instance lock file", error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(AcquireError::AlreadyRunning);
            }
            Err(error) if error.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Err(AcquireError::AlreadyRunning);
            }
            Err(error) => {
                return Err(AcquireError::io("failed to acquire instance lock", error));
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| AcquireError::io("failed to write instance lock metadata", error))?;

        Ok(Self { _file: lock_file })
    }
}

#[cfg(test)]
mod tests {
    use super::{AcquireError, SingleInstance};

    #[test]
    fn first_acquire_writes_pid() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let lock_path = temp.path().join("data").join("updater.lock");

        let _guard = SingleInstance::acquire(&lock_path).expect("first acquire should succeed");

        let contents = std::fs::read_to_string(&lock_path).expect("lock file should be readable");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn second_acquire_reports_already_running_until_released() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let lock_path = temp.path().join("updater.lock");

        let guard = SingleInstance::acquire(&lock_path).expect("first acquire should succeed");
        let error = SingleInstance::acquire(&lock_path).expect_err("second acquire should fail");
        assert!(matches!(error, AcquireError::AlreadyRunning));

        drop(guard);
        assert!(SingleInstance::acquire(&lock_path).is_ok());
    }
}
