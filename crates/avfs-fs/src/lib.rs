//! # avfs-fs
//!
//! Read-only virtual filesystem over the contents of an archive.
//!
//! This crate provides:
//! - [`ArchiveFs`], the filesystem operation contract: open, read, enumerate
//!   and stat against the mounted archive tree, with every mutation refused
//! - A per-mount path cache ([`NodeCache`])
//! - **WebDAV server support** (with the `webdav` feature)
//! - FUSE filesystem support (with the `fuse` feature)
//!
//! ## Example
//!
//! ```ignore
//! use avfs_fs::{ArchiveFs, MountConfig, OpenOptions, ProviderOptions};
//!
//! let fs = ArchiveFs::from_path("photos.zip", ProviderOptions::default(), MountConfig::default())?;
//! fs.mount()?;
//!
//! for info in fs.read_dir("/2021", None)? {
//!     println!("{} ({} bytes)", info.name, info.length);
//! }
//!
//! let handle = fs.open("/2021/beach.jpg", OpenOptions::read_only())?;
//! let mut buf = vec![0; 4096];
//! let n = fs.read("/2021/beach.jpg", Some(&handle), 0, &mut buf)?;
//! ```
//!
//! ## Front ends
//!
//! The `webdav` feature serves the archive over HTTP on localhost; the
//! `fuse` feature mounts it into the local directory tree. Both translate
//! their requests into [`ArchiveFs`] calls.

mod cache;
mod config;
mod error;
mod handler;

#[cfg(feature = "webdav")]
pub mod webdav;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use cache::{normalize, NodeCache};
pub use config::MountConfig;
pub use error::{FsError, FsResult};
pub use handler::{
    default_timestamp, ArchiveFs, DiskSpace, FileHandle, FileInfo, OpenOptions, VolumeInfo,
    FILE_SYSTEM_NAME, MAX_COMPONENT_LENGTH,
};

// Re-export archive types callers need to build and address a filesystem.
pub use avfs_archive::{ArchiveFormat, HandleStrategy, NodeId, ProviderOptions};
