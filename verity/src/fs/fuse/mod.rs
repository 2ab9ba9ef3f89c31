use std::{
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use fuse_backend_rs::{api::filesystem::FileSystem, transport::FuseSession};
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{error, info, instrument};

/// One worker: pulls requests off its own channel of the session until the
/// session goes away.
struct FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    server: Arc<fuse_backend_rs::api::server::Server<Arc<FS>>>,
    channel: fuse_backend_rs::transport::FuseChannel,
}

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

impl<FS> FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    fn start(&mut self) -> io::Result<()> {
        while let Some((reader, writer)) = self
            .channel
            .get_request()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?
        {
            if let Err(e) = self
                .server
                .handle_message(reader, writer.into(), None, None)
            {
                match e {
                    // This indicates the session has been shut down.
                    fuse_backend_rs::Error::EncodeMessage(e) if e.raw_os_error() == Some(BADFD) => {
                        break;
                    }
                    error => {
                        error!(?error, "failed to handle fuse request");
                        continue;
                    }
                }
            }
        }
        Ok(())
    }
}

/// A mounted [FileSystem], served by `num_threads` workers each reading from
/// its own channel on the FUSE session.
///
/// Handles are cheap to clone and share the session. Whichever handle
/// unmounts first tears the mount down, later calls are no-ops. The last
/// handle dropped unmounts if nothing else did. Workers are joined before
/// unmount returns, so the filesystem (and the manifest inside it) is only
/// freed once no request can reach it anymore.
#[derive(Clone)]
pub struct FuseDaemon {
    session: Arc<Mutex<FuseSession>>,
    threads: Arc<ThreadPool>,
    unmounted: Arc<AtomicBool>,
}

impl FuseDaemon {
    #[instrument(skip(fs, mountpoint), fields(mountpoint=?mountpoint), err)]
    pub fn new<FS, P>(
        fs: FS,
        mountpoint: P,
        num_threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        FS: FileSystem + Sync + Send + 'static,
        P: AsRef<Path> + std::fmt::Debug,
    {
        let server = Arc::new(fuse_backend_rs::api::server::Server::new(Arc::new(fs)));

        let mut session = FuseSession::new(mountpoint.as_ref(), "verity", "", false)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        session
            .mount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("verity_fuse".to_string())
            .build();

        for _ in 0..num_threads {
            // each worker gets its own channel on the session.
            let mut server = FuseServer {
                server: server.clone(),
                channel: session
                    .new_channel()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
            };

            threads.execute(move || {
                if let Err(error) = server.start() {
                    error!(?error, "fuse worker failed");
                }
            });
        }

        info!(num_threads, allow_other, "mounted");

        Ok(FuseDaemon {
            session: Arc::new(Mutex::new(session)),
            threads: Arc::new(threads),
            unmounted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Blocks until every worker has exited, which happens once the mount is
    /// gone, whether through [FuseDaemon::unmount] or an external `umount`.
    #[instrument(skip_all)]
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Unmounts and joins the workers.
    #[instrument(skip_all, err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.session
            .lock()
            .umount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        self.wait();
        info!("unmounted");
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        // other handles still point at the mount.
        if Arc::strong_count(&self.session) > 1 {
            return;
        }
        if let Err(error) = self.unmount() {
            error!(?error, "failed to unmount fuse filesystem")
        }
    }
}
