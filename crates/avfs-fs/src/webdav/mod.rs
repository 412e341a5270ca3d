//! WebDAV front end.
//!
//! Exposes an [`ArchiveFs`](crate::ArchiveFs) as a read-only WebDAV share,
//! so it can be mounted without kernel extensions from Finder, Explorer,
//! davfs2 or any other WebDAV client. Every modifying method is answered
//! with 403 Forbidden.
//!
//! # Example
//!
//! ```ignore
//! use avfs_fs::webdav::serve;
//! use avfs_fs::{ArchiveFs, MountConfig, ProviderOptions};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let fs = ArchiveFs::from_path("photos.zip", ProviderOptions::default(), MountConfig::default())
//!         .expect("open archive");
//!     serve(fs, 4918).await
//! }
//! ```

mod filesystem;
mod server;

pub use filesystem::AvfsDavFs;
pub use server::{serve, serve_background, AvfsWebDavServer};
