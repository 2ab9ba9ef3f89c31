use std::path::PathBuf;

use crate::{digests::DigestAlgorithm, manifest::MAX_ENTRIES};

/// Where the manifest is read from, unless configured otherwise.
pub const DEFAULT_MANIFEST_PATH: &str = "/.verity_manifest";

/// The manifest digest expected, unless configured otherwise.
pub const DEFAULT_MANIFEST_DIGEST: &str = "64a17769525546b19ea554ff27848544d621cdda";

/// Everything needed to set up a [crate::Verity].
#[derive(Clone, Debug)]
pub struct VerityConfig {
    pub manifest_path: PathBuf,
    pub manifest_digest: String,
    pub algorithm: DigestAlgorithm,

    /// Record digests of everything read instead of verifying.
    pub learning_mode: bool,
    /// File learned digests are appended to. They are logged if unset.
    pub learning_output: Option<PathBuf>,

    pub max_entries: usize,
}

impl Default for VerityConfig {
    fn default() -> Self {
        Self {
            manifest_path: DEFAULT_MANIFEST_PATH.into(),
            manifest_digest: DEFAULT_MANIFEST_DIGEST.to_string(),
            algorithm: DigestAlgorithm::default(),
            learning_mode: false,
            learning_output: None,
            max_entries: MAX_ENTRIES,
        }
    }
}
