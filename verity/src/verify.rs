use std::{fs::File, io, os::unix::fs::FileExt, sync::Arc};

use bstr::{BStr, BString};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::VerityConfig,
    digests::Digester,
    errors::{Error, ReadError},
    learning::{DigestLog, LearningRecord, TracingLog, WriterLog},
    manifest::{Manifest, ManifestEntry},
};

/// The unit of verification. Every block of a protected file has its own
/// digest.
pub const BLOCK_SIZE: u64 = 4096;

/// Rounds `offset` down to the start of its block.
pub const fn block_base(offset: u64) -> u64 {
    offset & !(BLOCK_SIZE - 1)
}

/// Rounds `offset` up to the next block boundary.
pub const fn block_align(offset: u64) -> u64 {
    block_base(offset.saturating_add(BLOCK_SIZE - 1))
}

pub const fn block_index(offset: u64) -> u64 {
    offset / BLOCK_SIZE
}

/// Positional reads, without moving any file cursor.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Whether reads are checked against a manifest, or only observed.
pub enum Mode {
    Enforce(Manifest),
    Learn(Arc<dyn DigestLog>),
}

#[derive(Clone, Copy)]
enum Check<'a> {
    Enforce(&'a ManifestEntry),
    Learn(&'a dyn DigestLog),
}

/// Verifies reads of protected files block by block.
pub struct Verity {
    digester: Box<dyn Digester>,
    mode: Mode,
}

impl Verity {
    pub fn new(digester: Box<dyn Digester>, mode: Mode) -> Self {
        Self { digester, mode }
    }

    /// Sets up verification as configured. In enforcing mode this loads and
    /// authenticates the manifest, any failure means nothing must be served.
    #[instrument(skip_all, fields(manifest = ?config.manifest_path, learning_mode = config.learning_mode), err)]
    pub fn initialize(config: &VerityConfig) -> Result<Self, Error> {
        let digester = config.algorithm.digester();

        let mode = if config.learning_mode {
            let log: Arc<dyn DigestLog> = match &config.learning_output {
                Some(path) => {
                    Arc::new(
                        WriterLog::create(path).map_err(|source| Error::LearningOutput {
                            path: path.clone(),
                            source,
                        })?,
                    )
                }
                None => Arc::new(TracingLog),
            };
            warn!("learning mode enabled, reads are not verified");
            Mode::Learn(log)
        } else {
            let expected = config.algorithm.parse_hex_digest(&config.manifest_digest)?;
            let manifest = Manifest::load(
                &config.manifest_path,
                &expected,
                digester.as_ref(),
                config.max_entries,
            )?;
            info!(
                entries = manifest.len(),
                algorithm = %config.algorithm,
                "manifest loaded"
            );
            Mode::Enforce(manifest)
        };

        Ok(Self::new(digester, mode))
    }

    /// Reads `buf.len()` bytes at `offset` from `src`, which is the file
    /// found at `path` (relative to the root of the mount).
    ///
    /// Files not listed in the manifest are read as they are. Otherwise every
    /// block touched by the request is read completely and checked before
    /// anything from it is returned. In learning mode, the digest of every
    /// block touched is recorded instead.
    pub fn read<R>(
        &self,
        path: &[u8],
        src: &R,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ReadError>
    where
        R: ReadAt + ?Sized,
    {
        let check = match &self.mode {
            Mode::Learn(log) => Check::Learn(log.as_ref()),
            Mode::Enforce(manifest) => match manifest.get(path) {
                Some(entry) => Check::Enforce(entry),
                None => return Ok(src.read_at(buf, offset)?),
            },
        };

        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset.saturating_add(buf.len() as u64);
        let mut block_buf = vec![0u8; BLOCK_SIZE as usize];
        let mut block = block_index(offset);
        let mut copied = 0;

        loop {
            let block_start = block * BLOCK_SIZE;
            let n = fill_block(src, &mut block_buf, block_start)?;
            let data = &block_buf[..n];

            match check {
                Check::Enforce(entry) => match entry.digest(block) {
                    // past the end of the file, which is where it should end.
                    None if n == 0 => break,
                    None => {
                        warn!(path = %BStr::new(path), block, "data past the recorded blocks");
                        return Err(ReadError::OutOfRange {
                            path: path.into(),
                            block,
                            known: entry.block_count(),
                        });
                    }
                    Some(expected) => {
                        if !self.digester.check(data, expected) {
                            error!(path = %BStr::new(path), block, "block digest mismatch, file has been tampered with");
                            return Err(ReadError::Tampered {
                                path: path.into(),
                                block,
                            });
                        }
                    }
                },
                Check::Learn(log) => {
                    // block 0 is recorded even when empty, so empty files
                    // get an entry too.
                    if n > 0 || block == 0 {
                        log.record(&LearningRecord {
                            path: BString::from(path),
                            block,
                            digest: self.digester.compute(data),
                        })
                        .map_err(ReadError::Learning)?;
                    }
                }
            }

            // copy the part of the block overlapping with the request.
            let from = offset.max(block_start);
            let to = end.min(block_start + n as u64);
            if to > from {
                let len = (to - from) as usize;
                let src_start = (from - block_start) as usize;
                let dst_start = (from - offset) as usize;
                buf[dst_start..dst_start + len].copy_from_slice(&data[src_start..src_start + len]);
                copied += len;
            }

            if n < BLOCK_SIZE as usize || block_start + BLOCK_SIZE >= end {
                break;
            }
            block += 1;
        }

        debug!(copied, "verified read");
        Ok(copied)
    }
}

/// Reads the block starting at `offset` into `buf`, until it's full or the
/// file ends. Returns the number of bytes read.
pub(crate) fn fill_block<R>(src: &R, buf: &mut [u8], offset: u64) -> io::Result<usize>
where
    R: ReadAt + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match src.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use bytes::Bytes;
    use rstest::rstest;

    use super::{block_align, block_base, Mode, ReadAt, Verity};
    use crate::{
        config::VerityConfig,
        digests::DigestAlgorithm,
        errors::{Error, ReadError},
        fixtures::{
            BLOB_4097, BLOB_4097_BLOCK_0_SHA1, BLOB_4097_BLOCK_1_SHA1, EMPTY_BLOB_SHA1,
            MANIFEST_CONTENTS, MANIFEST_SHA1,
        },
        learning::{LearningRecord, MemoryLog},
        manifest::{self, Manifest, MAX_ENTRIES},
    };

    /// Hands out at most 100 bytes per call.
    struct ShortReads<'a>(&'a [u8]);

    impl ReadAt for ShortReads<'_> {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let len = buf.len().min(100);
            self.0.read_at(&mut buf[..len], offset)
        }
    }

    fn enforcing() -> Verity {
        let manifest =
            Manifest::parse(MANIFEST_CONTENTS.clone(), 40, MAX_ENTRIES).expect("must parse");
        Verity::new(DigestAlgorithm::Sha1.digester(), Mode::Enforce(manifest))
    }

    fn read(
        verity: &Verity,
        path: &[u8],
        src: &[u8],
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, ReadError> {
        let mut buf = vec![0u8; len];
        let n = verity.read(path, src, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 4096)]
    #[case(4095, 4096)]
    #[case(4096, 4096)]
    #[case(4097, 8192)]
    fn alignment(#[case] offset: u64, #[case] aligned: u64) {
        assert_eq!(aligned, block_align(offset));
        assert_eq!(aligned - if offset % 4096 == 0 { 0 } else { 4096 }, block_base(offset));
    }

    /// Any window of the file reads back exactly as stored.
    #[rstest]
    #[case::whole(0, 4097)]
    #[case::first_block(0, 4096)]
    #[case::last_byte(4096, 1)]
    #[case::across_boundary(4095, 2)]
    #[case::inside_block(100, 10)]
    #[case::past_end(0, 8192)]
    #[case::at_end(4097, 10)]
    #[case::beyond_end(10000, 10)]
    fn round_trip(#[case] offset: u64, #[case] len: usize) {
        let verity = enforcing();
        let data = read(&verity, b"/blob", &BLOB_4097, offset, len).expect("must succeed");

        let start = (offset as usize).min(BLOB_4097.len());
        let end = (offset as usize + len).min(BLOB_4097.len());
        assert_eq!(&BLOB_4097[start..end], &data[..]);
    }

    #[test]
    fn short_reads_are_retried() {
        let verity = enforcing();
        let src = ShortReads(&BLOB_4097);
        let mut buf = vec![0u8; 4097];
        assert_eq!(4097, verity.read(b"/blob", &src, &mut buf, 0).expect("must succeed"));
        assert_eq!(&BLOB_4097[..], &buf[..]);
    }

    #[test]
    fn empty_protected_file() {
        let verity = enforcing();
        assert!(read(&verity, b"/empty", b"", 0, 10).expect("must succeed").is_empty());

        // something appeared in a file recorded as empty
        assert!(matches!(
            read(&verity, b"/empty", b"x", 0, 10),
            Err(ReadError::Tampered { block: 0, .. })
        ));
    }

    /// An entry without any digests only allows reading nothing.
    #[test]
    fn entry_without_digests() {
        let manifest = Manifest::parse(Bytes::from_static(b"1\n/bare\n"), 40, MAX_ENTRIES)
            .expect("must parse");
        let verity = Verity::new(DigestAlgorithm::Sha1.digester(), Mode::Enforce(manifest));

        assert!(read(&verity, b"/bare", b"", 0, 10).expect("must succeed").is_empty());
        assert!(matches!(
            read(&verity, b"/bare", b"x", 0, 10),
            Err(ReadError::OutOfRange {
                block: 0,
                known: 0,
                ..
            })
        ));
    }

    /// A modified block fails every read touching it, others stay readable.
    #[test]
    fn tampered_block() {
        let verity = enforcing();
        let mut tampered = BLOB_4097.to_vec();
        tampered[4096] ^= 0xff;

        assert_eq!(
            &BLOB_4097[..4096],
            &read(&verity, b"/blob", &tampered, 0, 4096).expect("block 0 is fine")[..]
        );

        for (offset, len) in [(4096, 1), (4095, 2), (0, 4097)] {
            match read(&verity, b"/blob", &tampered, offset, len) {
                Err(ReadError::Tampered { path, block }) => {
                    assert_eq!("/blob", path);
                    assert_eq!(1, block);
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn truncated_file() {
        let verity = enforcing();
        let truncated = &BLOB_4097[..4096];

        assert!(read(&verity, b"/blob", truncated, 0, 4096).is_ok());
        assert!(matches!(
            read(&verity, b"/blob", truncated, 4096, 10),
            Err(ReadError::Tampered { block: 1, .. })
        ));
    }

    #[test]
    fn data_past_recorded_blocks() {
        let manifest = Manifest::parse(
            Bytes::from(format!("1\n/blob {BLOB_4097_BLOCK_0_SHA1}\n")),
            40,
            MAX_ENTRIES,
        )
        .expect("must parse");
        let verity = Verity::new(DigestAlgorithm::Sha1.digester(), Mode::Enforce(manifest));

        assert!(read(&verity, b"/blob", &BLOB_4097, 0, 4096).is_ok());
        assert!(matches!(
            read(&verity, b"/blob", &BLOB_4097, 4000, 200),
            Err(ReadError::OutOfRange {
                block: 1,
                known: 1,
                ..
            })
        ));
    }

    /// Files missing from the manifest are served as they are, corrupted or not.
    #[test]
    fn unprotected_passthrough() {
        let verity = enforcing();
        let mut corrupted = BLOB_4097.to_vec();
        corrupted[0] ^= 0xff;

        assert_eq!(
            &corrupted[10..20],
            &read(&verity, b"/other", &corrupted, 10, 10).expect("must succeed")[..]
        );
        // the manifest key is the full path
        assert!(read(&verity, b"blob", &corrupted, 0, 10).is_ok());
    }

    #[test]
    fn learning_records_blocks() {
        let log = Arc::new(MemoryLog::default());
        let verity = Verity::new(DigestAlgorithm::Sha1.digester(), Mode::Learn(log.clone()));

        for _ in 0..2 {
            assert_eq!(
                &BLOB_4097[..],
                &read(&verity, b"/blob", &BLOB_4097, 0, 8192).expect("must succeed")[..]
            );
        }
        assert!(read(&verity, b"/empty", b"", 0, 10).expect("must succeed").is_empty());
        // nothing to record past the end
        assert!(read(&verity, b"/blob", &BLOB_4097, 8192, 10).expect("must succeed").is_empty());

        let record = |path: &str, block, digest: &str| LearningRecord {
            path: path.into(),
            block,
            digest: digest.to_string(),
        };
        assert_eq!(
            vec![
                record("/blob", 0, BLOB_4097_BLOCK_0_SHA1),
                record("/blob", 1, BLOB_4097_BLOCK_1_SHA1),
                record("/blob", 0, BLOB_4097_BLOCK_0_SHA1),
                record("/blob", 1, BLOB_4097_BLOCK_1_SHA1),
                record("/empty", 0, EMPTY_BLOB_SHA1),
            ],
            log.records()
        );
    }

    #[test]
    fn initialize_checks_manifest_digest() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let manifest_path = tmpdir.path().join("manifest");
        std::fs::write(&manifest_path, &MANIFEST_CONTENTS[..]).unwrap();

        let mut config = VerityConfig {
            manifest_path,
            manifest_digest: MANIFEST_SHA1.to_uppercase(),
            ..Default::default()
        };
        let verity = Verity::initialize(&config).expect("must initialize");
        assert!(read(&verity, b"/blob", &BLOB_4097, 0, 4097).is_ok());

        config.manifest_digest = EMPTY_BLOB_SHA1.to_string();
        assert!(matches!(
            Verity::initialize(&config),
            Err(Error::Manifest(manifest::Error::DigestMismatch { .. }))
        ));

        config.manifest_digest = "64a17769".to_string();
        assert!(matches!(Verity::initialize(&config), Err(Error::Digest(_))));
    }

    /// The default configuration accepts manifests declaring up to
    /// [MAX_ENTRIES] entries, and nothing above.
    #[rstest]
    #[case::at_limit(MAX_ENTRIES, true)]
    #[case::above_limit(MAX_ENTRIES + 1, false)]
    fn initialize_entry_limit(#[case] declared: usize, #[case] accepted: bool) {
        assert_eq!(262144, MAX_ENTRIES);

        let tmpdir = tempfile::TempDir::new().unwrap();
        let manifest_path = tmpdir.path().join("manifest");
        let contents = format!("{declared}\n");
        std::fs::write(&manifest_path, &contents).unwrap();

        let config = VerityConfig {
            manifest_path,
            manifest_digest: DigestAlgorithm::Sha1.digester().compute(contents.as_bytes()),
            ..Default::default()
        };

        match Verity::initialize(&config) {
            Ok(_) => assert!(accepted, "must be rejected"),
            Err(Error::Manifest(manifest::Error::TooManyEntries { declared: d, max })) => {
                assert!(!accepted, "must be accepted");
                assert_eq!(declared, d);
                assert_eq!(MAX_ENTRIES, max);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn initialize_learning_output() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let output = tmpdir.path().join("learned");
        let config = VerityConfig {
            manifest_path: tmpdir.path().join("does-not-exist"),
            learning_mode: true,
            learning_output: Some(output.clone()),
            ..Default::default()
        };

        let verity = Verity::initialize(&config).expect("must initialize");
        read(&verity, b"/empty", b"", 0, 1).expect("must succeed");
        assert_eq!(
            format!("/empty|0|{EMPTY_BLOB_SHA1}\n"),
            std::fs::read_to_string(&output).unwrap()
        );

        let config = VerityConfig {
            learning_output: Some(tmpdir.path().join("missing-dir/learned")),
            ..config
        };
        assert!(matches!(
            Verity::initialize(&config),
            Err(Error::LearningOutput { .. })
        ));
    }
}
