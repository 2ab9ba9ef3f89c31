use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use verity_fs::{
    config::{DEFAULT_MANIFEST_DIGEST, DEFAULT_MANIFEST_PATH},
    digests::{DigestAlgorithm, Digester},
    fs::{fuse::FuseDaemon, VerityFs},
    learning,
    manifest::{self, Assembled, ManifestBuilder, MAX_ENTRIES},
    Verity, VerityConfig,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mounts SOURCE at DEST, verifying every read against the manifest.
    Mount {
        /// The directory whose contents are served.
        source: PathBuf,

        /// Where to mount the filesystem.
        dest: PathBuf,

        /// Path to the manifest listing the per-block digests.
        #[arg(long, env = "VERITY_MANIFEST", default_value = DEFAULT_MANIFEST_PATH)]
        manifest: PathBuf,

        /// Hex digest the manifest file itself must have.
        #[arg(long, env = "VERITY_MANIFEST_DIGEST", default_value = DEFAULT_MANIFEST_DIGEST)]
        manifest_digest: String,

        #[arg(long, env = "VERITY_DIGEST_ALGORITHM", default_value_t = DigestAlgorithm::Sha1)]
        digest_algorithm: DigestAlgorithm,

        /// Don't verify anything, record the digest of every block read
        /// instead.
        #[arg(long, env = "VERITY_LEARNING_MODE")]
        learning_mode: bool,

        /// Append learned digests to this file, rather than logging them.
        #[arg(long, env = "VERITY_LEARNING_OUTPUT", requires = "learning_mode")]
        learning_output: Option<PathBuf>,

        /// Number of FUSE threads to spawn.
        #[arg(long, env = "VERITY_THREADS", default_value_t = 4)]
        threads: usize,

        /// Whether to configure the mountpoint with allow_other.
        /// Requires /etc/fuse.conf to contain the `user_allow_other`
        /// option, configured via `programs.fuse.userAllowOther` on NixOS.
        #[arg(long, env = "VERITY_ALLOW_OTHER", default_value_t = false)]
        allow_other: bool,
    },

    /// Walks a directory tree and writes a manifest covering every regular
    /// file below it.
    Generate {
        root: PathBuf,

        /// Where to write the manifest to.
        #[arg(long, short = 'o')]
        output: PathBuf,

        #[arg(long, env = "VERITY_DIGEST_ALGORITHM", default_value_t = DigestAlgorithm::Sha1)]
        digest_algorithm: DigestAlgorithm,
    },

    /// Assembles a manifest from the digests recorded in learning mode.
    Assemble {
        /// Learning output files, or logs containing learning records.
        #[arg(required = true)]
        logs: Vec<PathBuf>,

        /// Where to write the manifest to.
        #[arg(long, short = 'o')]
        output: PathBuf,

        #[arg(long, env = "VERITY_DIGEST_ALGORITHM", default_value_t = DigestAlgorithm::Sha1)]
        digest_algorithm: DigestAlgorithm,
    },
}

/// Keeps the process from being ptraced or dumping core, and makes sure
/// files are created with exactly the mode requested through the mount.
fn harden_process() {
    #[cfg(all(target_os = "linux", not(debug_assertions)))]
    clear_dumpable();

    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
}

#[cfg(all(target_os = "linux", not(debug_assertions)))]
fn clear_dumpable() {
    // SAFETY: PR_SET_DUMPABLE takes no pointers.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "unable to clear dumpable flag");
    }
}

/// Writes an assembled manifest to `output`, and prints its digest, which is
/// what a mount needs to be told to trust it.
fn write_manifest(
    tracing_handle: &verity_tracing::TracingHandle,
    assembled: Assembled,
    output: &Path,
    algorithm: DigestAlgorithm,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for (path, reason) in &assembled.skipped {
        warn!(path = %path, ?reason, "left out of the manifest");
    }

    std::fs::write(output, &assembled.manifest)?;

    let digest = algorithm.digester().compute(&assembled.manifest);
    info!(
        entries = assembled.entries,
        skipped = assembled.skipped.len(),
        output = ?output,
        "wrote manifest"
    );
    writeln!(tracing_handle.get_stdout_writer(), "{digest}")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let tracing_handle = verity_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .json(cli.json)
        .enable_progressbar()
        .build()?;

    match cli.command {
        Commands::Mount {
            source,
            dest,
            manifest,
            manifest_digest,
            digest_algorithm,
            learning_mode,
            learning_output,
            threads,
            allow_other,
        } => {
            harden_process();

            let config = VerityConfig {
                manifest_path: manifest,
                manifest_digest,
                algorithm: digest_algorithm,
                learning_mode,
                learning_output,
                max_entries: MAX_ENTRIES,
            };

            // Nothing gets mounted unless the manifest checks out.
            let verity = Verity::initialize(&config)?;

            let fuse_daemon = tokio::task::spawn_blocking(move || {
                info!(source = ?source, mount_path = ?dest, "mounting");
                let fs = VerityFs::new(source, verity);

                FuseDaemon::new(fs, &dest, threads, allow_other)
            })
            .await??;

            // grab a handle to unmount the file system, and register a signal
            // handler.
            tokio::spawn({
                let fuse_daemon = fuse_daemon.clone();
                async move {
                    tokio::signal::ctrl_c().await?;
                    info!("interrupt received, unmounting…");
                    tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await??;
                    info!("unmount occured, terminating…");
                    Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
                }
            });

            // Wait for the server to finish, which can either happen through it
            // being unmounted externally, or receiving a signal invoking the
            // handler above.
            tokio::task::spawn_blocking(move || fuse_daemon.wait()).await?
        }
        Commands::Generate {
            root,
            output,
            digest_algorithm,
        } => {
            let builder = tokio::task::spawn_blocking(move || {
                manifest::generate(&root, &*digest_algorithm.digester())
            })
            .await??;

            write_manifest(
                &tracing_handle,
                builder.build(digest_algorithm.hex_len()),
                &output,
                digest_algorithm,
            )?;
        }
        Commands::Assemble {
            logs,
            output,
            digest_algorithm,
        } => {
            let mut builder = ManifestBuilder::new();
            for log in &logs {
                let f = File::open(log).map_err(|e| format!("unable to open {log:?}: {e}"))?;
                let records = learning::read_log(BufReader::new(f), &mut builder)?;
                info!(log = ?log, records, "read learning records");
            }

            if builder.is_empty() {
                return Err("no learning records found".into());
            }

            write_manifest(
                &tracing_handle,
                builder.build(digest_algorithm.hex_len()),
                &output,
                digest_algorithm,
            )?;
        }
    }

    Ok(())
}
