//! Content digests for backup verification and deduplication.
//!
//! Files are hashed with SHA-512 in 1 MiB blocks. Files larger than
//! [`PARTIAL_HASH_THRESHOLD`] get a *sampled* digest: only the first, last and
//! middle 1 MiB windows are folded in. This keeps hashing of large media
//! files cheap, but it is a fingerprint rather than a checksum: corruption or
//! differences outside the three windows go undetected, both by the post-copy
//! verification and by deduplication.

use sha2::{Digest as _, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Streaming block size and partial-hash window size.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Files strictly larger than this are hashed partially.
pub const PARTIAL_HASH_THRESHOLD: u64 = 32 * 1024 * 1024;

/// 512-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 64]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 64];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..16])
    }
}

/// Whether a file of this size gets a sampled digest.
pub fn is_partial(size: u64) -> bool {
    size > PARTIAL_HASH_THRESHOLD
}

/// Hash a file, either fully or by sampling start, end and middle windows.
pub fn digest(path: &Path, partial: bool) -> io::Result<Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; BLOCK_SIZE as usize];

    if partial {
        let size = file.metadata()?.len();
        let end_window = size.saturating_sub(BLOCK_SIZE);
        let middle_window = (size / 2).saturating_sub(BLOCK_SIZE / 2);

        for offset in [0, end_window, middle_window] {
            file.seek(SeekFrom::Start(offset))?;
            let n = read_window(&mut file, &mut buffer)?;
            hasher.update(&buffer[..n]);
        }
    } else {
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
    }

    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    Ok(Digest(out))
}

/// Like [`digest`], but a failure is reported as absence.
pub fn try_digest(path: &Path, partial: bool) -> Option<Digest> {
    match digest(path, partial) {
        Ok(d) => Some(d),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Digest unavailable");
            None
        }
    }
}

/// Fill `buffer` as far as the file allows.
fn read_window(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
