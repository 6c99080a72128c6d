use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};
use sha2::{Digest, Sha512};

use crate::error::UpdateError;
use crate::manifest::to_hex;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Ok,
    Mismatch { expected: String, actual: String },
    /// The feed declared no digest. This is never a pass.
    MissingDigest,
}

impl Verification {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Hash `path` with SHA-512 and compare it with the declared hex digest.
///
/// # Errors
/// Returns an error when the file cannot be opened or read.
pub fn verify(path: &Path, declared_hex: Option<&str>) -> Result<Verification, UpdateError> {
    let Some(expected) = declared_hex.map(str::trim).filter(|hex| !hex.is_empty()) else {
        warn!("No digest declared for {}", path.display());
        return Ok(Verification::MissingDigest);
    };

    let actual = sha512_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        info!("Update checksum verified for {}", path.display());
        Ok(Verification::Ok)
    } else {
        Ok(Verification::Mismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// [`verify`] on the blocking pool, for callers on the async runtime.
///
/// # Errors
/// Returns an error when the file cannot be read or the hashing task dies.
pub async fn verify_in_background(
    path: PathBuf,
    declared_hex: Option<String>,
) -> Result<Verification, UpdateError> {
    tokio::task::spawn_blocking(move || verify(&path, declared_hex.as_deref()))
        .await
        .map_err(|error| {
            UpdateError::io(
                "checksum task failed",
                std::io::Error::other(error.to_string()),
            )
        })?
}

/// Streaming SHA-512 of a file as lowercase hex.
///
/// # Errors
/// Returns an error when the file cannot be opened or read.
pub fn sha512_file(path: &Path) -> Result<String, UpdateError> {
    let mut file = std::fs::File::open(path).map_err(|error| {
        UpdateError::io_with_path("failed to open file for checksum", path, error)
    })?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0_u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).map_err(|error| {
            UpdateError::io_with_path("failed to read file for checksum", path, error)
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(to_hex(&hasher.finalize()))
}
