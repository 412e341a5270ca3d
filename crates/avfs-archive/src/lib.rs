//! # avfs-archive
//!
//! Archive providers and the in-memory file tree behind an avfs mount.
//!
//! This crate provides:
//! - Format detection and provider construction for ZIP, 7z, tar and tar.gz
//! - [`FsTree`], an arena of file and directory nodes with aggregated sizes
//! - Lazy, at-most-once extraction of file contents into node buffers
//! - Codec handle sharing strategies (single, per-thread, pooled)
//!
//! ## Example
//!
//! ```ignore
//! use avfs_archive::{open_archive, ProviderOptions};
//!
//! let provider = open_archive("photos.zip", ProviderOptions::default())?;
//! let tree = provider.read_fs_tree()?;
//! let id = tree.lookup("/2021/beach.jpg").unwrap();
//! let bytes = tree.fill_buffer(id, |ctx, buf| provider.extract_entry(ctx, buf))?;
//! ```

mod error;
mod format;
mod handles;
mod provider;
mod sevenz_codec;
mod tar_codec;
mod tree;
pub mod zip64;
mod zip_codec;

pub use error::{Error, Result};
pub use format::{detect_format, open_archive, ArchiveFormat, ProviderOptions};
pub use handles::{HandlePool, HandleStrategy, Handles, PerThreadHandles, SingleHandle};
pub use provider::{ArchiveProvider, Codec, CodecProvider};
pub use sevenz_codec::SevenZipCodec;
pub use tar_codec::{TarCodec, TarHandle};
pub use tree::{
    fold_case, path_components, EntryContext, EntryMeta, EntryTimes, FillState, FsTree,
    FsTreeBuilder, FsTreeNode, NodeId, ROOT,
};
pub use zip_codec::ZipCodec;
