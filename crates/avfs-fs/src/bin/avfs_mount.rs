//! avfs-mount: serve the contents of an archive as a read-only filesystem.
//!
//! # Usage
//!
//! ```bash
//! # Serve over WebDAV on localhost:4918
//! avfs-mount photos.zip
//!
//! # Mount through FUSE (built with the `fuse` feature)
//! avfs-mount photos.tar.gz --mount-point /mnt/photos
//! ```

use avfs_fs::webdav;
use avfs_fs::{ArchiveFs, HandleStrategy, MountConfig, ProviderOptions};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Handles {
    /// One decoder shared by all readers
    Single,
    /// One decoder per worker thread
    PerThread,
    /// A pool of decoders, grown on demand
    Pooled,
}

/// Serve an archive as a read-only filesystem.
///
/// ZIP, 7z, tar and tar.gz archives are supported. Files are decompressed on
/// first read and kept in memory until the archive is unmounted.
#[derive(Parser, Debug)]
#[command(name = "avfs-mount")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the archive
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Mount through FUSE at this directory instead of serving WebDAV
    #[cfg(feature = "fuse")]
    #[arg(short, long, value_name = "DIR")]
    mount_point: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "4918")]
    port: u16,

    /// How decoder handles are shared between readers (default depends on format)
    #[arg(long, value_enum)]
    handles: Option<Handles>,

    /// Idle decoders kept by the pooled strategy
    #[arg(long, value_name = "N")]
    pool_size: Option<usize>,

    /// Volume label
    #[arg(short, long, default_value = "AVFS")]
    label: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn strategy(&self) -> Option<HandleStrategy> {
        match (self.handles, self.pool_size) {
            (Some(Handles::Single), _) => Some(HandleStrategy::Single),
            (Some(Handles::PerThread), _) => Some(HandleStrategy::PerThread),
            (Some(Handles::Pooled), max_idle) => Some(HandleStrategy::Pooled { max_idle }),
            (None, Some(max_idle)) => Some(HandleStrategy::Pooled {
                max_idle: Some(max_idle),
            }),
            (None, None) => None,
        }
    }
}

/// Mount through FUSE when a mount point was given. Hands the filesystem
/// back when it should be served over WebDAV instead.
#[cfg(feature = "fuse")]
async fn try_fuse(fs: ArchiveFs, args: &Args) -> Option<ArchiveFs> {
    let mount_point = match args.mount_point.clone() {
        Some(mount_point) => mount_point,
        None => return Some(fs),
    };

    let result =
        tokio::task::spawn_blocking(move || avfs_fs::fuse::mount(fs, mount_point)).await;
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!("Mount error: {}", e);
            process::exit(1);
        }
        Err(e) => {
            error!("Mount task failed: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(not(feature = "fuse"))]
async fn try_fuse(fs: ArchiveFs, _args: &Args) -> Option<ArchiveFs> {
    Some(fs)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    // Validate archive path
    if !args.archive.is_file() {
        error!("Archive not found: {}", args.archive.display());
        process::exit(1);
    }

    // Open the archive
    info!("Opening archive: {}", args.archive.display());
    let config = MountConfig {
        volume_label: args.label.clone(),
        ..MountConfig::default()
    };
    let options = ProviderOptions {
        strategy: args.strategy(),
    };
    let fs = match ArchiveFs::from_path(&args.archive, options, config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Failed to open archive: {}", e);
            if let Some(source) = std::error::Error::source(&e) {
                error!("  caused by: {}", source);
            }
            process::exit(1);
        }
    };

    // Build the file tree
    if let Err(e) = fs.mount() {
        error!("Failed to read archive: {}", e);
        if let Some(source) = std::error::Error::source(&e) {
            error!("  caused by: {}", source);
        }
        process::exit(1);
    }

    // Display archive info
    if let Ok(space) = fs.disk_space() {
        info!("Format: {}, {} bytes uncompressed", fs.format(), space.total_bytes);
    }

    // Mount through FUSE if requested
    let Some(fs) = try_fuse(fs, &args).await else {
        return;
    };

    // Serve over WebDAV
    if let Err(e) = webdav::serve(fs, args.port).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
