// Streaming SHA-256 of file contents, used to key the content-addressed store.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{BundleError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Returns the lowercase hex-encoded SHA-256 digest of the file at `path`.
///
/// Reads the file in bounded-size chunks rather than loading it whole, so hashing
/// a multi-gigabyte shared library doesn't balloon memory use.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| BundleError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| BundleError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
