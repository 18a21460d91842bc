use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::errors::{LauncherError, Result};

const HASH_BUFFER_BYTES: usize = 1024 * 1024;
const MURMUR_SEED: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Infers the algorithm from a hex digest's length.
    pub fn for_digest(digest: &str) -> Option<Self> {
        match digest.trim().len() {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

pub fn sanitize_hash(hash: &str) -> Option<String> {
    let normalized = hash.trim().to_ascii_lowercase();
    if normalized.len() < 8 {
        return None;
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(normalized)
}

fn digest_reader<D: Digest>(mut file: File) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0_u8; HASH_BUFFER_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams `path` through the requested digest with a fixed-size buffer.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let file = File::open(path)?;
    match algorithm {
        HashAlgorithm::Sha1 => digest_reader::<Sha1>(file),
        HashAlgorithm::Sha256 => digest_reader::<Sha256>(file),
    }
}

/// Returns `Ok(false)` on a digest mismatch; only unreadable files are errors.
pub fn verify_file(path: &Path, expected: &str) -> Result<bool> {
    let expected = sanitize_hash(expected)
        .ok_or_else(|| LauncherError::Integrity(format!("malformed digest '{}'", expected)))?;
    let algorithm = HashAlgorithm::for_digest(&expected).ok_or_else(|| {
        LauncherError::Integrity(format!("unsupported digest length {}", expected.len()))
    })?;
    let actual = hash_file(path, algorithm)?;
    Ok(actual == expected)
}

/// Async wrapper that keeps hashing off the runtime's worker threads.
pub async fn verify_file_async(path: &Path, expected: &str) -> Result<bool> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || verify_file(&path, &expected))
        .await
        .map_err(|err| LauncherError::Config(err.to_string()))?
}

/// CurseForge-style package fingerprint: MurmurHash2 (seed 1) over the file
/// with tab, newline, carriage return and space bytes removed.
pub fn murmur2_fingerprint(path: &Path) -> Result<u32> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    data.retain(|byte| !matches!(byte, 9 | 10 | 13 | 32));
    Ok(murmur2(&data, MURMUR_SEED))
}

fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = data.len() as u32;
    let mut h = seed ^ len;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
