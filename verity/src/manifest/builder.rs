use std::collections::{btree_map::Entry, BTreeMap};

use bstr::BString;
use tracing::warn;

use crate::learning::LearningRecord;

/// Why a path could not be put into a manifest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkipReason {
    /// The path is empty, or contains a space or newline.
    UnrepresentablePath,
    /// Not every block between 0 and the last seen one has a digest.
    MissingBlocks { first_missing: u64 },
    /// The same block was seen with different digests.
    ConflictingDigests { block: u64 },
    /// A digest doesn't have the length of the manifest's algorithm.
    InvalidDigest { block: u64 },
}

#[derive(Debug)]
enum FileDigests {
    Blocks(BTreeMap<u64, String>),
    Conflicting(u64),
}

/// Collects per-block digests, from learning-mode records or from walking a
/// directory tree, and renders them into manifest format.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    files: BTreeMap<BString, FileDigests>,
}

/// The output of [ManifestBuilder::build].
#[derive(Debug)]
pub struct Assembled {
    /// The rendered manifest file contents.
    pub manifest: Vec<u8>,
    /// Number of entries in the manifest.
    pub entries: usize,
    /// Paths that were left out, and why.
    pub skipped: Vec<(BString, SkipReason)>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single learned block digest.
    pub fn insert(&mut self, record: LearningRecord) {
        let LearningRecord {
            path,
            block,
            digest,
        } = record;

        let file = self
            .files
            .entry(path)
            .or_insert_with(|| FileDigests::Blocks(BTreeMap::new()));

        let conflicting = match file {
            FileDigests::Conflicting(_) => return,
            FileDigests::Blocks(blocks) => match blocks.entry(block) {
                Entry::Vacant(e) => {
                    e.insert(digest);
                    false
                }
                Entry::Occupied(e) => *e.get() != digest,
            },
        };

        if conflicting {
            *file = FileDigests::Conflicting(block);
        }
    }

    /// Adds the complete digest list of a file, replacing anything known about
    /// it before.
    pub fn insert_file(&mut self, path: impl Into<BString>, digests: Vec<String>) {
        self.files.insert(
            path.into(),
            FileDigests::Blocks(
                digests
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| (i as u64, d))
                    .collect(),
            ),
        );
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Renders the manifest, for an algorithm whose hex digests are
    /// `hex_len` characters long. Paths are sorted, so equal inputs produce
    /// byte-identical manifests (and thus identical manifest digests).
    pub fn build(&self, hex_len: usize) -> Assembled {
        let mut body = Vec::new();
        let mut entries = 0;
        let mut skipped = Vec::new();

        for (path, file) in &self.files {
            if path.is_empty() || path.contains(&b' ') || path.contains(&b'\n') {
                warn!(path = %path, "path can't be represented in a manifest");
                skipped.push((path.clone(), SkipReason::UnrepresentablePath));
                continue;
            }

            let blocks = match file {
                FileDigests::Conflicting(block) => {
                    warn!(path = %path, block, "conflicting digests");
                    skipped.push((
                        path.clone(),
                        SkipReason::ConflictingDigests { block: *block },
                    ));
                    continue;
                }
                FileDigests::Blocks(blocks) => blocks,
            };

            // BTreeMap keys are sorted, so they are contiguous iff each one
            // equals its position.
            if let Some(first_missing) = blocks
                .keys()
                .enumerate()
                .find_map(|(i, block)| (*block != i as u64).then_some(i as u64))
            {
                warn!(path = %path, first_missing, "missing block digests");
                skipped.push((path.clone(), SkipReason::MissingBlocks { first_missing }));
                continue;
            }

            if let Some(block) = blocks
                .iter()
                .find_map(|(block, digest)| (digest.len() != hex_len).then_some(*block))
            {
                warn!(path = %path, block, hex_len, "digest has the wrong length");
                skipped.push((path.clone(), SkipReason::InvalidDigest { block }));
                continue;
            }

            body.extend_from_slice(path);
            for digest in blocks.values() {
                body.push(b' ');
                body.extend_from_slice(digest.as_bytes());
            }
            body.push(b'\n');
            entries += 1;
        }

        let mut manifest = format!("{entries}\n").into_bytes();
        manifest.extend_from_slice(&body);

        Assembled {
            manifest,
            entries,
            skipped,
        }
    }
}

impl Extend<LearningRecord> for ManifestBuilder {
    fn extend<T: IntoIterator<Item = LearningRecord>>(&mut self, iter: T) {
        for record in iter {
            self.insert(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{ManifestBuilder, SkipReason};
    use crate::learning::LearningRecord;
    use crate::manifest::{Manifest, MAX_ENTRIES};

    const D0: &str = "0000000000000000000000000000000000000000";
    const D1: &str = "1111111111111111111111111111111111111111";

    fn record(path: &str, block: u64, digest: &str) -> LearningRecord {
        LearningRecord {
            path: path.into(),
            block,
            digest: digest.to_string(),
        }
    }

    #[test]
    fn out_of_order_records() {
        let mut builder = ManifestBuilder::new();
        builder.extend([
            record("/b", 0, D1),
            record("/a", 1, D1),
            record("/a", 0, D0),
            record("/a", 1, D1),
        ]);

        let assembled = builder.build(40);
        assert!(assembled.skipped.is_empty());
        assert_eq!(2, assembled.entries);
        assert_eq!(
            format!("2\n/a {D0} {D1}\n/b {D1}\n").into_bytes(),
            assembled.manifest
        );

        // what we render must parse again
        let manifest =
            Manifest::parse(Bytes::from(assembled.manifest), 40, MAX_ENTRIES).expect("must parse");
        assert_eq!(2, manifest.get(b"/a").expect("must exist").block_count());
    }

    #[test]
    fn skips_incomplete_files() {
        let mut builder = ManifestBuilder::new();
        builder.extend([
            record("/gap", 0, D0),
            record("/gap", 2, D0),
            record("/late", 1, D0),
            record("/conflict", 0, D0),
            record("/conflict", 0, D1),
            record("/with space", 0, D0),
            record("/ok", 0, D0),
        ]);

        let assembled = builder.build(40);
        assert_eq!(1, assembled.entries);
        assert_eq!(format!("1\n/ok {D0}\n").into_bytes(), assembled.manifest);

        let mut skipped = assembled.skipped;
        skipped.sort();
        assert_eq!(
            vec![
                ("/conflict".into(), SkipReason::ConflictingDigests { block: 0 }),
                ("/gap".into(), SkipReason::MissingBlocks { first_missing: 1 }),
                ("/late".into(), SkipReason::MissingBlocks { first_missing: 0 }),
                ("/with space".into(), SkipReason::UnrepresentablePath),
            ],
            skipped
        );
    }

    /// Digests of another algorithm never end up in the manifest.
    #[test]
    fn skips_digests_of_the_wrong_length() {
        let sha256 = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let mut builder = ManifestBuilder::new();
        builder.extend([
            record("/sha256", 0, sha256),
            record("/mixed", 0, D0),
            record("/mixed", 1, sha256),
            record("/ok", 0, D1),
        ]);

        let assembled = builder.build(40);
        assert_eq!(format!("1\n/ok {D1}\n").into_bytes(), assembled.manifest);

        let mut skipped = assembled.skipped;
        skipped.sort();
        assert_eq!(
            vec![
                ("/mixed".into(), SkipReason::InvalidDigest { block: 1 }),
                ("/sha256".into(), SkipReason::InvalidDigest { block: 0 }),
            ],
            skipped
        );

        // the same records are fine for an algorithm with 64 character digests
        let mut builder = ManifestBuilder::new();
        builder.insert(record("/sha256", 0, sha256));
        let assembled = builder.build(64);
        assert!(assembled.skipped.is_empty());
        assert_eq!(1, assembled.entries);
    }

    #[test]
    fn empty() {
        let assembled = ManifestBuilder::new().build(40);
        assert_eq!(b"0\n".to_vec(), assembled.manifest);
        assert_eq!(0, assembled.entries);
    }
}
