use std::{io, path::PathBuf};

use bstr::BString;
use thiserror::Error;

use crate::{digests, manifest};

/// Errors preventing a [crate::Verity] from being set up. None of them are
/// recoverable, the filesystem must not be mounted.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Digest(#[from] digests::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::Error),

    #[error("unable to open learning output {path:?}: {source}")]
    LearningOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from a verified read.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("block {block} of {path} does not match its recorded digest")]
    Tampered { path: BString, block: u64 },

    #[error("block {block} of {path} has data, but only {known} blocks are recorded")]
    OutOfRange { path: BString, block: u64, known: u64 },

    #[error("unable to record learned digest: {0}")]
    Learning(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ReadError> for io::Error {
    fn from(value: ReadError) -> Self {
        match value {
            // keep the errno of the underlying filesystem
            ReadError::Io(e) => e,
            ReadError::Tampered { .. } | ReadError::OutOfRange { .. } | ReadError::Learning(_) => {
                io::Error::from_raw_os_error(libc::EIO)
            }
        }
    }
}
