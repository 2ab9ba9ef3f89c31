mod file_attr;
mod inode_tracker;

#[cfg(feature = "fuse")]
pub mod fuse;


use std::{
    collections::HashMap,
    ffi::{CStr, CString, OsStr},
    fs::{self, File},
    io,
    mem::MaybeUninit,
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        fs::{DirBuilderExt, DirEntryExt, FileExt, FileTypeExt, PermissionsExt},
        io::FromRawFd,
    },
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use fuse_backend_rs::{
    abi::fuse_abi::{stat64, statvfs64, CreateIn, SetattrValid},
    api::filesystem::{
        Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyReader,
        ZeroCopyWriter,
    },
};
use nix::{
    fcntl::{self, OFlag},
    sys::{
        stat::{self, Mode, SFlag, UtimensatFlags},
        time::TimeSpec,
    },
    unistd::{self, AccessFlags},
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use self::{
    file_attr::gen_file_attr,
    inode_tracker::{child_path, InodeTracker},
};
use crate::Verity;

/// How long the kernel may cache attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// A directory listing, taken when the directory was opened.
struct DirSnapshotEntry {
    name: Vec<u8>,
    ino: u64,
    type_: u32,
}

enum Handle {
    File(Arc<File>),
    Dir(Arc<Vec<DirSnapshotEntry>>),
}

/// A FUSE filesystem passing every operation through to a source directory,
/// except reads, which are verified by a [Verity].
///
/// Inodes are handed out per path below the root of the mount by the
/// [InodeTracker]. That same path (`/a/b` for `<source>/a/b`) is what's looked
/// up in the manifest when a file is read.
///
/// Operations run with the credentials of the process serving the mount, not
/// those of the caller.
pub struct VerityFs {
    source: PathBuf,
    verity: Verity,

    /// This keeps track of inodes and the paths they stand for.
    inode_tracker: RwLock<InodeTracker>,

    /// This holds all open file and directory handles.
    handles: RwLock<HashMap<u64, Handle>>,

    next_handle: AtomicU64,
}

impl VerityFs {
    pub fn new(source: impl Into<PathBuf>, verity: Verity) -> Self {
        Self {
            source: source.into(),
            verity,

            inode_tracker: RwLock::new(Default::default()),

            handles: RwLock::new(Default::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Translates a path below the root of the mount to the path in the source
    /// directory.
    fn source_path(&self, path: &Path) -> PathBuf {
        self.source.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn mount_path(&self, inode: u64) -> io::Result<Arc<Path>> {
        self.inode_tracker
            .read()
            .get(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn real_path(&self, inode: u64) -> io::Result<PathBuf> {
        Ok(self.source_path(&self.mount_path(inode)?))
    }

    fn child(&self, parent: u64, name: &CStr) -> io::Result<PathBuf> {
        Ok(child_path(&self.mount_path(parent)?, name.to_bytes()))
    }

    /// Looks up the file at `path`, and allocates an inode for it.
    fn entry_for(&self, path: &Path) -> io::Result<Entry> {
        let metadata = fs::symlink_metadata(self.source_path(path))?;
        let ino = self.inode_tracker.write().put(path);

        Ok(Entry {
            inode: ino,
            attr: gen_file_attr(&metadata, ino).into(),
            attr_timeout: ATTR_TTL,
            entry_timeout: ATTR_TTL,
            ..Default::default()
        })
    }

    fn insert_handle(&self, handle: Handle) -> u64 {
        // handles are never reused.
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        debug!("add handle {}", fh);
        self.handles.write().insert(fh, handle);
        fh
    }

    fn file(&self, handle: u64) -> io::Result<Arc<File>> {
        match self.handles.read().get(&handle) {
            Some(Handle::File(file)) => Ok(file.clone()),
            Some(Handle::Dir(_)) => Err(io::Error::from_raw_os_error(libc::EISDIR)),
            None => {
                warn!("file handle {} unknown", handle);
                Err(io::Error::from_raw_os_error(libc::EBADF))
            }
        }
    }
}

/// Opens `path` with the flags of an open(2) call.
fn open_file(path: &Path, flags: u32, mode: u32) -> io::Result<File> {
    let fd = fcntl::open(
        path,
        OFlag::from_bits_truncate(flags as libc::c_int) | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(mode as libc::mode_t),
    )?;

    // SAFETY: fd was just opened, and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS
fn file_type_bits(file_type: fs::FileType) -> u32 {
    if file_type.is_dir() {
        libc::S_IFDIR as u32
    } else if file_type.is_symlink() {
        libc::S_IFLNK as u32
    } else if file_type.is_fifo() {
        libc::S_IFIFO as u32
    } else if file_type.is_socket() {
        libc::S_IFSOCK as u32
    } else if file_type.is_block_device() {
        libc::S_IFBLK as u32
    } else if file_type.is_char_device() {
        libc::S_IFCHR as u32
    } else {
        libc::S_IFREG as u32
    }
}

/// The time to set for a timestamp in a setattr request.
fn timespec(
    valid: SetattrValid,
    set: SetattrValid,
    now: SetattrValid,
    sec: i64,
    nsec: i64,
) -> TimeSpec {
    let special = |tv_nsec| TimeSpec::from(libc::timespec { tv_sec: 0, tv_nsec });

    if valid.contains(now) {
        special(libc::UTIME_NOW)
    } else if valid.contains(set) {
        TimeSpec::new(sec, nsec)
    } else {
        special(libc::UTIME_OMIT)
    }
}

impl FileSystem for VerityFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {
        self.handles.write().clear();
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let path = self.child(parent, name)?;
        self.entry_for(&path)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.count = count))]
    fn forget(&self, _ctx: &Context, inode: Self::Inode, count: u64) {
        self.inode_tracker.write().forget(inode, count);
    }

    fn batch_forget(&self, _ctx: &Context, requests: Vec<(Self::Inode, u64)>) {
        let mut inode_tracker = self.inode_tracker.write();
        for (inode, count) in requests {
            inode_tracker.forget(inode, count);
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let metadata = match handle.and_then(|fh| self.file(fh).ok()) {
            Some(file) => file.metadata()?,
            None => fs::symlink_metadata(self.real_path(inode)?)?,
        };

        Ok((gen_file_attr(&metadata, inode).into(), ATTR_TTL))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.valid = ?valid))]
    fn setattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let path = self.real_path(inode)?;

        if valid.contains(SetattrValid::MODE) {
            fs::set_permissions(&path, fs::Permissions::from_mode(attr.st_mode & 0o7777))?;
        }

        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            std::os::unix::fs::lchown(
                &path,
                valid.contains(SetattrValid::UID).then_some(attr.st_uid),
                valid.contains(SetattrValid::GID).then_some(attr.st_gid),
            )?;
        }

        if valid.contains(SetattrValid::SIZE) {
            match handle.map(|fh| self.file(fh)).transpose()? {
                Some(file) => file.set_len(attr.st_size as u64)?,
                None => unistd::truncate(&path, attr.st_size)?,
            }
        }

        if valid.intersects(SetattrValid::ATIME | SetattrValid::MTIME) {
            let atime = timespec(
                valid,
                SetattrValid::ATIME,
                SetattrValid::ATIME_NOW,
                attr.st_atime,
                attr.st_atime_nsec,
            );
            let mtime = timespec(
                valid,
                SetattrValid::MTIME,
                SetattrValid::MTIME_NOW,
                attr.st_mtime,
                attr.st_mtime_nsec,
            );
            stat::utimensat(None, &path, &atime, &mtime, UtimensatFlags::NoFollowSymlink)?;
        }

        self.getattr(ctx, inode, handle)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        Ok(fs::read_link(self.real_path(inode)?)?
            .into_os_string()
            .into_vec())
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn symlink(
        &self,
        _ctx: &Context,
        linkname: &CStr,
        parent: Self::Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        let path = self.child(parent, name)?;
        std::os::unix::fs::symlink(
            OsStr::from_bytes(linkname.to_bytes()),
            self.source_path(&path),
        )?;
        self.entry_for(&path)
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name, rq.mode = mode))]
    fn mknod(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        rdev: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child(parent, name)?;
        let real = self.source_path(&path);

        let perm = Mode::from_bits_truncate((mode & !umask & 0o7777) as libc::mode_t);
        let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);

        if kind == SFlag::S_IFIFO {
            unistd::mkfifo(&real, perm)?;
        } else {
            stat::mknod(&real, kind, perm, rdev as libc::dev_t)?;
        }

        self.entry_for(&path)
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name, rq.mode = mode))]
    fn mkdir(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child(parent, name)?;
        fs::DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(self.source_path(&path))?;
        self.entry_for(&path)
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let path = self.child(parent, name)?;
        fs::remove_file(self.source_path(&path))?;
        self.inode_tracker.write().remove_path(&path);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let path = self.child(parent, name)?;
        fs::remove_dir(self.source_path(&path))?;
        self.inode_tracker.write().remove_path(&path);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.olddir = olddir, rq.oldname = ?oldname, rq.newdir = newdir, rq.newname = ?newname))]
    fn rename(
        &self,
        _ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        flags: u32,
    ) -> io::Result<()> {
        // RENAME_NOREPLACE, RENAME_EXCHANGE and RENAME_WHITEOUT
        if flags != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let from = self.child(olddir, oldname)?;
        let to = self.child(newdir, newname)?;
        fs::rename(self.source_path(&from), self.source_path(&to))?;
        self.inode_tracker.write().rename(&from, &to);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.newparent = newparent, rq.newname = ?newname))]
    fn link(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        newparent: Self::Inode,
        newname: &CStr,
    ) -> io::Result<Entry> {
        let path = self.child(newparent, newname)?;
        fs::hard_link(self.real_path(inode)?, self.source_path(&path))?;
        self.entry_for(&path)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let file = open_file(&self.real_path(inode)?, flags, 0)?;
        let fh = self.insert_handle(Handle::File(Arc::new(file)));
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn create(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let path = self.child(parent, name)?;
        let file = open_file(
            &self.source_path(&path),
            args.flags | libc::O_CREAT as u32,
            args.mode & !args.umask & 0o7777,
        )?;

        let entry = self.entry_for(&path)?;
        let fh = self.insert_handle(Handle::File(Arc::new(file)));
        Ok((entry, Some(fh), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let file = self.file(handle)?;
        let path = self.mount_path(inode)?;

        let mut buf = vec![0u8; size as usize];
        let n = self
            .verity
            .read(path.as_os_str().as_bytes(), &*file, &mut buf, offset)?;

        w.write(&buf[..n])
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let file = self.file(handle)?;

        let mut buf = vec![0u8; size as usize];
        r.read_exact(&mut buf)?;
        file.write_all_at(&buf, offset)?;

        Ok(buf.len())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn flush(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _lock_owner: u64,
    ) -> io::Result<()> {
        // closing a duplicate reports errors of delayed writes, without
        // closing the handle itself.
        drop(self.file(handle)?.try_clone()?);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn fsync(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        datasync: bool,
        handle: Self::Handle,
    ) -> io::Result<()> {
        let file = self.file(handle)?;
        if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        // remove and get ownership on the file, dropping it closes it.
        match self.handles.write().remove(&handle) {
            Some(file) => drop(file),
            None => {
                debug!("file_handle {} not found", handle);
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn statfs(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<statvfs64> {
        let path = CString::new(self.real_path(inode)?.into_os_string().into_vec())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        let mut out = MaybeUninit::<statvfs64>::zeroed();
        // SAFETY: path is NUL-terminated, out is a valid statvfs64 to write to.
        if unsafe { libc::statvfs64(path.as_ptr(), out.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: statvfs64 succeeded, so it filled out.
        Ok(unsafe { out.assume_init() })
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.real_path(inode)?)? {
            let entry = entry?;
            entries.push(DirSnapshotEntry {
                ino: entry.ino(),
                type_: file_type_bits(entry.file_type()?),
                name: entry.file_name().into_vec(),
            });
        }

        let fh = self.insert_handle(Handle::Dir(Arc::new(entries)));
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let entries = match self.handles.read().get(&handle) {
            Some(Handle::Dir(entries)) => entries.clone(),
            _ => {
                warn!("directory handle {} unknown", handle);
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
        };

        for (i, entry) in entries.iter().skip(offset as usize).enumerate() {
            // the second parameter will become the "offset" parameter on the next call.
            let written = add_entry(DirEntry {
                ino: entry.ino,
                offset: offset + i as u64 + 1,
                type_: entry.type_,
                name: &entry.name,
            })?;
            // If the buffer is full, add_entry will return `Ok(0)`.
            if written == 0 {
                break;
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn fsyncdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        datasync: bool,
        handle: Self::Handle,
    ) -> io::Result<()> {
        let dir = File::open(self.real_path(inode)?)?;
        if datasync {
            dir.sync_data()
        } else {
            dir.sync_all()
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn releasedir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
    ) -> io::Result<()> {
        self.handles.write().remove(&handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.mask = mask))]
    fn access(&self, _ctx: &Context, inode: Self::Inode, mask: u32) -> io::Result<()> {
        unistd::access(
            &self.real_path(inode)?,
            AccessFlags::from_bits_truncate(mask as libc::c_int),
        )?;
        Ok(())
    }
}
