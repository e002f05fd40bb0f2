//! Content digests used to skip copies of unchanged files.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::trace;

/// BLAKE3 digest of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(blake3::Hash);

impl Digest {
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContentDiffer {
    buffer_size: usize,
}

impl Default for ContentDiffer {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }
}

impl ContentDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash the file at `path`, streaming it through a fixed-size buffer.
    pub fn digest(&self, path: &Path) -> io::Result<Digest> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let bytes_read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Digest(hasher.finalize()))
    }

    /// Whether two regular files hold identical content.
    ///
    /// Any read failure (either side missing, unreadable, vanished) counts as
    /// "different" so the caller falls back to copying.
    pub fn same_content(&self, a: &Path, b: &Path) -> bool {
        let (Ok(meta_a), Ok(meta_b)) = (std::fs::metadata(a), std::fs::metadata(b)) else {
            return false;
        };
        if !meta_a.is_file() || !meta_b.is_file() || meta_a.len() != meta_b.len() {
            return false;
        }

        match (self.digest(a), self.digest(b)) {
            (Ok(da), Ok(db)) if da == db => true,
            (Ok(da), Ok(db)) => {
                trace!("{} ({}) differs from {} ({})", a.display(), da.to_hex(), b.display(), db.to_hex());
                false
            }
            _ => false,
        }
    }
}
