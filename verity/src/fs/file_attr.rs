use std::{fs::Metadata, os::unix::fs::MetadataExt};

use fuse_backend_rs::abi::fuse_abi::Attr;

/// Builds the [Attr] for `ino` from the metadata of the file it passes
/// through to. Everything but the inode number is reported as it is.
pub fn gen_file_attr(metadata: &Metadata, ino: u64) -> Attr {
    Attr {
        ino,
        size: metadata.size(),
        blksize: metadata.blksize() as u32,
        blocks: metadata.blocks(),
        mode: metadata.mode(),
        atime: metadata.atime() as u64,
        mtime: metadata.mtime() as u64,
        ctime: metadata.ctime() as u64,
        atimensec: metadata.atime_nsec() as u32,
        mtimensec: metadata.mtime_nsec() as u32,
        ctimensec: metadata.ctime_nsec() as u32,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: 0,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}
