use std::{fs::File, io, os::unix::ffi::OsStrExt, path::Path};

use bstr::BString;
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use walkdir::WalkDir;

use super::{Error, ManifestBuilder};
use crate::{
    digests::Digester,
    verify::{fill_block, BLOCK_SIZE},
};

/// Walks the tree at `root` and digests every regular file in it, block by
/// block. Keys are the paths relative to `root`, with a leading `/`, which is
/// how the files are seen when `root` is the source of a mount.
///
/// Symlinks are not followed, and neither they nor other special files get
/// an entry.
#[instrument(skip(digester), fields(indicatif.pb_show = 1), err)]
pub fn generate(root: &Path, digester: &dyn Digester) -> Result<ManifestBuilder, Error> {
    let span = Span::current();
    span.pb_set_style(&verity_tracing::PB_SPINNER_STYLE);
    span.pb_set_message(&format!("Digesting files below {}", root.display()));
    span.pb_start();

    let mut builder = ManifestBuilder::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Walk(root.to_path_buf(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir only yields paths below root");
        let mut key = BString::from("/");
        key.extend_from_slice(relative.as_os_str().as_bytes());

        let digests = digest_file(entry.path(), digester)
            .map_err(|e| Error::DigestFile(entry.path().to_path_buf(), e))?;
        debug!(path = %key, blocks = digests.len(), "digested file");

        builder.insert_file(key, digests);
        span.pb_inc(1);
    }

    Ok(builder)
}

/// Returns one digest per block. Empty files get the digest of no data.
fn digest_file(path: &Path, digester: &dyn Digester) -> io::Result<Vec<String>> {
    let f = File::open(path)?;
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut digests = Vec::new();

    for block in 0.. {
        let n = fill_block(&f, &mut buf, block * BLOCK_SIZE)?;
        if n == 0 && block > 0 {
            break;
        }
        digests.push(digester.compute(&buf[..n]));
        if n < buf.len() {
            break;
        }
    }

    Ok(digests)
}
