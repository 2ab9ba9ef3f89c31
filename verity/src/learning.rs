//! Learning mode records the digest of every block that is read instead of
//! checking it. The records can later be assembled into a manifest, see
//! [crate::manifest::ManifestBuilder].
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufRead, Write},
    path::Path,
};

use bstr::{BStr, BString, ByteSlice};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::manifest::ManifestBuilder;

/// Marks learning records in log output.
pub const LEARNING_PREFIX: &str = "[learning] ";

/// The digest of one block of a file, as observed in learning mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LearningRecord {
    pub path: BString,
    pub block: u64,
    pub digest: String,
}

impl LearningRecord {
    /// Parses a single `path|block|digest` line.
    ///
    /// Anything up to and including a [LEARNING_PREFIX] is ignored, so lines
    /// taken from the log can be passed in as they are.
    pub fn parse_line(line: &[u8]) -> Option<Self> {
        let line = line.trim_end_with(|c| c == '\n' || c == '\r');
        let line = match line.rfind(LEARNING_PREFIX) {
            Some(pos) => &line[pos + LEARNING_PREFIX.len()..],
            None => line,
        };

        // paths may contain '|', block and digest never do.
        let mut fields = line.rsplitn(3, |b| *b == b'|');
        let digest = fields.next()?;
        // log formatters append span fields and escape sequences to the message.
        let digest = match digest
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == 0x1b)
        {
            Some(end) => &digest[..end],
            None => digest,
        };
        let block = fields.next()?;
        let path = fields.next()?;

        if path.is_empty() || digest.is_empty() || !digest.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }

        Some(Self {
            path: path.into(),
            block: block.to_str().ok()?.parse().ok()?,
            digest: digest.to_str().ok()?.to_ascii_lowercase(),
        })
    }

    /// Writes the record as a `path|block|digest` line, keeping the raw path
    /// bytes.
    pub fn write_line(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.path)?;
        writeln!(w, "|{}|{}", self.block, self.digest)
    }
}

impl fmt::Display for LearningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            BStr::new(&self.path),
            self.block,
            self.digest
        )
    }
}

/// Somewhere learned digests go.
pub trait DigestLog: Send + Sync {
    fn record(&self, record: &LearningRecord) -> io::Result<()>;
}

/// Emits learned digests as log events.
#[derive(Debug, Default)]
pub struct TracingLog;

impl DigestLog for TracingLog {
    fn record(&self, record: &LearningRecord) -> io::Result<()> {
        info!(target: "verity::learning", "{LEARNING_PREFIX}{record}");
        Ok(())
    }
}

/// Writes learned digests as lines to a writer, flushing after each one.
pub struct WriterLog<W> {
    w: Mutex<W>,
}

impl<W: Write + Send> WriterLog<W> {
    pub fn new(w: W) -> Self {
        Self { w: Mutex::new(w) }
    }

    pub fn into_inner(self) -> W {
        self.w.into_inner()
    }
}

impl WriterLog<File> {
    /// Opens (or creates) `path` for appending.
    pub fn create(path: &Path) -> io::Result<Self> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(f))
    }
}

impl<W: Write + Send> DigestLog for WriterLog<W> {
    fn record(&self, record: &LearningRecord) -> io::Result<()> {
        let mut w = self.w.lock();
        record.write_line(&mut *w)?;
        w.flush()
    }
}

/// Keeps learned digests in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LearningRecord>>,
}

impl MemoryLog {
    pub fn records(&self) -> Vec<LearningRecord> {
        self.records.lock().clone()
    }
}

impl DigestLog for MemoryLog {
    fn record(&self, record: &LearningRecord) -> io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Feeds all records found in `r` into `builder`, skipping lines that are not
/// learning records. Returns the number of records read.
pub fn read_log<R: BufRead>(r: R, builder: &mut ManifestBuilder) -> io::Result<usize> {
    let mut count = 0;
    for line in r.split(b'\n') {
        let line = line?;
        match LearningRecord::parse_line(&line) {
            Some(record) => {
                builder.insert(record);
                count += 1;
            }
            None => debug!(line = %BStr::new(&line), "skipping line"),
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use parking_lot::Mutex;
    use rstest::rstest;

    use super::{read_log, DigestLog, LearningRecord, TracingLog, WriterLog};
    use crate::manifest::ManifestBuilder;

    /// Collects everything a fmt subscriber writes.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const DIGEST: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    #[rstest]
    #[case::plain("/a/b|3|da39a3ee5e6b4b0d3255bfef95601890afd80709", "/a/b", 3)]
    #[case::log_line(
        "2024-01-01T00:00:00Z  INFO verity::learning: [learning] /x|0|da39a3ee5e6b4b0d3255bfef95601890afd80709",
        "/x",
        0
    )]
    #[case::pipe_in_path("/a|b|1|DA39A3EE5E6B4B0D3255BFEF95601890AFD80709\r\n", "/a|b", 1)]
    #[case::span_fields(
        " INFO read: verity::learning: [learning] /x|2|da39a3ee5e6b4b0d3255bfef95601890afd80709 rq.inode=2 rq.offset=8192 rq.size=4096",
        "/x",
        2
    )]
    fn parse_line(#[case] line: &str, #[case] path: &str, #[case] block: u64) {
        let record = LearningRecord::parse_line(line.as_bytes()).expect("must parse");
        assert_eq!(path, record.path);
        assert_eq!(block, record.block);
        assert_eq!(DIGEST, record.digest);
    }

    #[rstest]
    #[case::empty("")]
    #[case::unrelated("INFO mounted filesystem")]
    #[case::no_path("|0|da39a3ee5e6b4b0d3255bfef95601890afd80709")]
    #[case::bad_block("/a|x|da39a3ee5e6b4b0d3255bfef95601890afd80709")]
    #[case::bad_digest("/a|0|not-hex")]
    fn parse_line_rejects(#[case] line: &str) {
        assert_eq!(None, LearningRecord::parse_line(line.as_bytes()));
    }

    #[test]
    fn writer_log_round_trip() {
        let log = WriterLog::new(Vec::new());
        let record = LearningRecord {
            path: "/etc/hosts".into(),
            block: 7,
            digest: DIGEST.to_string(),
        };
        log.record(&record).expect("must write");
        log.record(&record).expect("must write");

        let out = log.into_inner();
        assert_eq!(format!("/etc/hosts|7|{DIGEST}\n").repeat(2).into_bytes(), out);

        let mut builder = ManifestBuilder::new();
        assert_eq!(2, read_log(&out[..], &mut builder).expect("must read"));
        assert_eq!(1, builder.len());
    }

    /// Records logged from within a filesystem request span, as the compact
    /// formatter renders them, can be assembled again.
    #[rstest]
    #[case::plain(false)]
    #[case::ansi(true)]
    fn tracing_log_round_trip(#[case] ansi: bool) {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_ansi(ansi)
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .finish();

        let record = LearningRecord {
            path: "/blob".into(),
            block: 0,
            digest: DIGEST.to_string(),
        };
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("read", rq.inode = 2, rq.offset = 0, rq.size = 4096);
            let _guard = span.enter();
            TracingLog.record(&record).expect("must log");
        });

        let out = captured.0.lock().clone();
        let mut builder = ManifestBuilder::new();
        assert_eq!(1, read_log(&out[..], &mut builder).expect("must read"));

        let assembled = builder.build(DIGEST.len());
        assert!(assembled.skipped.is_empty());
        assert_eq!(format!("1\n/blob {DIGEST}\n").into_bytes(), assembled.manifest);
    }

    #[test]
    fn display() {
        let record = LearningRecord {
            path: "/a".into(),
            block: 0,
            digest: DIGEST.to_string(),
        };
        assert_eq!(format!("/a|0|{DIGEST}"), record.to_string());
    }
}
