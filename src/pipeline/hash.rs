use anyhow::{Context, Result};
use memmap2::MmapOptions;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

// Memory mapping beats buffered reads past this size
const MMAP_THRESHOLD: u64 = 8 * 1024 * 1024;
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Lowercase hex SHA-256 of a local file. Used as the content hash when the
/// content store cannot report one.
pub fn content_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len();
    let mut sha = Sha256::new();

    if size >= MMAP_THRESHOLD {
        // Safety: the file is open for the lifetime of the map and not written here
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        for chunk in mmap.chunks(CHUNK_SIZE) {
            sha.update(chunk);
        }
    } else {
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 { break; }
            sha.update(&buf[..n]);
        }
    }
    Ok(hex::encode(sha.finalize()))
}
