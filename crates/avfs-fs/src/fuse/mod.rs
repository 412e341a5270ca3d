//! FUSE front end.
//!
//! Mounts an [`ArchiveFs`](crate::ArchiveFs) read-only through `fuser`.
//! Inode numbers are tree node indices shifted by one, so the tree root is
//! `FUSE_ROOT_ID`.
//!
//! # Example
//!
//! ```ignore
//! use avfs_fs::fuse::mount;
//! use avfs_fs::{ArchiveFs, MountConfig, ProviderOptions};
//!
//! let fs = ArchiveFs::from_path("photos.zip", ProviderOptions::default(), MountConfig::default())?;
//! mount(fs, "/mnt/photos")?;
//! ```

mod adapter;

pub use adapter::*;
