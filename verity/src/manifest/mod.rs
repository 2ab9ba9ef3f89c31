//! The manifest lists, for every protected path, one expected digest per
//! block of the file:
//!
//! ```text
//! <entry_count>\n
//! <path> <digest_0> <digest_1> ... <digest_n>\n
//! ...
//! ```
//!
//! The whole file is authenticated against an expected digest before any
//! entry is trusted.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use bstr::{BStr, ByteSlice};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::digests::Digester;

mod builder;
mod generate;

pub use self::builder::{Assembled, ManifestBuilder, SkipReason};
pub use self::generate::generate;

/// The largest number of entries a manifest may declare, enough to cover
/// 1 GiB worth of single-block files.
pub const MAX_ENTRIES: usize = (1024 * 1024 * 1024) / crate::verify::BLOCK_SIZE as usize;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to read manifest {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("manifest digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("manifest is malformed: no newline terminating the entry count")]
    MissingCountLine,

    #[error("manifest is malformed: invalid entry count {0:?}")]
    InvalidCount(String),

    #[error("manifest declares {declared} entries, at most {max} are allowed")]
    TooManyEntries { declared: usize, max: usize },

    #[error("unable to walk {0:?}: {1}")]
    Walk(PathBuf, #[source] walkdir::Error),

    #[error("unable to digest {0:?}: {1}")]
    DigestFile(PathBuf, #[source] std::io::Error),
}

/// The expected digests of a single protected file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Space-separated hex digests, one per block.
    digests: Bytes,
    hex_len: usize,
}

impl ManifestEntry {
    fn new(digests: Bytes, hex_len: usize) -> Self {
        Self { digests, hex_len }
    }

    /// Number of blocks the entry has a digest for.
    pub fn block_count(&self) -> u64 {
        if self.digests.is_empty() {
            return 0;
        }
        ((self.digests.len() + 1) / (self.hex_len + 1)) as u64
    }

    /// Returns the expected hex digest for the given block, if recorded.
    pub fn digest(&self, block: u64) -> Option<&[u8]> {
        let start = usize::try_from(block)
            .ok()?
            .checked_mul(self.hex_len + 1)?;
        let end = start.checked_add(self.hex_len)?;
        self.digests.get(start..end)
    }

    fn well_formed(&self) -> bool {
        let count = self.block_count() as usize;
        count == 0 || self.digests.len() == count * (self.hex_len + 1) - 1
    }
}

/// A parsed, authenticated manifest.
///
/// Keys and values are slices of the one buffer the manifest was read into,
/// nothing is copied per entry. The table never changes after loading, so it
/// can be shared between request threads without locking.
#[derive(Debug)]
pub struct Manifest {
    entries: HashMap<Bytes, ManifestEntry>,
    declared: usize,
}

impl Manifest {
    /// Reads the manifest at `path`, authenticates it against
    /// `expected_digest` and parses it.
    #[instrument(skip(expected_digest, digester), err)]
    pub fn load(
        path: &Path,
        expected_digest: &str,
        digester: &dyn Digester,
        max_entries: usize,
    ) -> Result<Self, Error> {
        let buf: Bytes = std::fs::read(path)
            .map_err(|e| Error::Read(path.to_path_buf(), e))?
            .into();

        if !digester.check(&buf, expected_digest.as_bytes()) {
            return Err(Error::DigestMismatch {
                expected: expected_digest.to_string(),
                actual: digester.compute(&buf),
            });
        }

        Self::parse(buf, digester.hex_len(), max_entries)
    }

    /// Parses an (already authenticated) manifest buffer.
    pub fn parse(buf: Bytes, hex_len: usize, max_entries: usize) -> Result<Self, Error> {
        let newline = match buf.find_byte(b'\n') {
            None | Some(0) => return Err(Error::MissingCountLine),
            Some(pos) => pos,
        };

        let count_line = &buf[..newline];
        let declared: usize = count_line
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::InvalidCount(count_line.to_str_lossy().into_owned()))?;

        if declared > max_entries {
            return Err(Error::TooManyEntries {
                declared,
                max: max_entries,
            });
        }

        let mut entries = HashMap::with_capacity(declared);
        let mut cursor = newline + 1;

        for _ in 0..declared {
            // A line without a terminating newline ends the manifest early.
            let Some(len) = buf[cursor..].find_byte(b'\n') else {
                break;
            };
            let line = buf.slice(cursor..cursor + len);
            cursor += len + 1;

            let (path, digests) = match line.find_byte(b' ') {
                Some(space) => (line.slice(..space), line.slice(space + 1..)),
                None => (line.clone(), Bytes::new()),
            };

            let entry = ManifestEntry::new(digests, hex_len);
            if !entry.well_formed() {
                warn!(path = %BStr::new(&path), "digest list has an unexpected length");
            }

            if entries.contains_key(&path) {
                debug!(path = %BStr::new(&path), "duplicate manifest entry, keeping the first");
                continue;
            }
            entries.insert(path, entry);
        }

        if entries.len() < declared {
            debug!(
                declared,
                found = entries.len(),
                "manifest has fewer entries than declared"
            );
        }

        Ok(Self { entries, declared })
    }

    /// Looks up the entry for a path, as seen from the root of the mount.
    pub fn get(&self, path: &[u8]) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry count from the first line of the manifest.
    pub fn declared(&self) -> usize {
        self.declared
    }
}
