//! The filesystem operation contract.
//!
//! [`ArchiveFs`] answers open/read/enumerate/stat requests against the tree
//! of the mounted archive and refuses every mutation. Front ends call it
//! from many threads at once.

use crate::cache::NodeCache;
use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use avfs_archive::{
    open_archive, ArchiveFormat, ArchiveProvider, FsTree, FsTreeNode, NodeId, ProviderOptions,
};
use log::{debug, info, trace};
use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

/// Maximum length of one path component.
pub const MAX_COMPONENT_LENGTH: u32 = 255;

/// File system name reported with the volume information.
pub const FILE_SYSTEM_NAME: &str = "AVFS";

/// Timestamp reported when the archive records none.
pub fn default_timestamp() -> SystemTime {
    static DEFAULT: OnceLock<SystemTime> = OnceLock::new();
    *DEFAULT.get_or_init(SystemTime::now)
}

/// Requested access when opening a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    /// Open the path, creating it if it is missing.
    pub create: bool,
    /// Create the path, failing if it exists.
    pub create_new: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    fn modifies(&self) -> bool {
        self.write || self.append || self.truncate || self.create_new
    }
}

/// An open file or directory.
///
/// Carries the resolved node so later calls skip path resolution. A handle
/// belongs to the mount it was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    pub node: NodeId,
    pub is_directory: bool,
    generation: u64,
}

impl FileHandle {
    /// Mount generation the handle was opened under.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Metadata of one node, as reported to front ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub node: NodeId,
    pub name: String,
    pub is_directory: bool,
    /// Uncompressed size; the sum of all descendant files for directories.
    pub length: u64,
    pub compressed_length: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

impl FileInfo {
    fn from_node(id: NodeId, node: &FsTreeNode) -> Self {
        let times = node.times();
        let fallback = default_timestamp();
        Self {
            node: id,
            name: node.name().to_string(),
            is_directory: node.is_directory(),
            length: node.length(),
            compressed_length: node.compressed_length(),
            created: times.created.unwrap_or(fallback),
            accessed: times.accessed.unwrap_or(fallback),
            modified: times.modified.unwrap_or(fallback),
        }
    }
}

/// Static description of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub file_system_name: String,
    pub read_only: bool,
    pub compressed: bool,
    pub case_sensitive: bool,
    pub max_component_length: u32,
}

/// Volume size. An archive never has free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

/// Everything that lives exactly as long as one mount.
struct MountSession {
    tree: FsTree,
    cache: NodeCache,
    generation: u64,
}

/// Read-only filesystem over one archive.
pub struct ArchiveFs {
    provider: Box<dyn ArchiveProvider>,
    config: MountConfig,
    session: RwLock<Option<Arc<MountSession>>>,
    generations: AtomicU64,
}

impl ArchiveFs {
    pub fn new(provider: Box<dyn ArchiveProvider>, config: MountConfig) -> Self {
        Self {
            provider,
            config,
            session: RwLock::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// Open the archive at `path` with the provider matching its format.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        options: ProviderOptions,
        config: MountConfig,
    ) -> FsResult<Self> {
        let provider = open_archive(path, options).map_err(FsError::ProviderInit)?;
        Ok(Self::new(provider, config))
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn format(&self) -> ArchiveFormat {
        self.provider.format()
    }

    /// Build the tree and start serving. Mounting while mounted remounts.
    pub fn mount(&self) -> FsResult<()> {
        if self.unmount() {
            debug!("Remounting {} archive", self.provider.format());
        }

        let tree = self
            .provider
            .read_fs_tree()
            .map_err(FsError::ProviderInit)?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            "Mounted {} archive as '{}': {} nodes, {} bytes (generation {})",
            self.provider.format(),
            self.config.volume_label,
            tree.node_count(),
            tree.root().length(),
            generation
        );

        *self.session.write() = Some(Arc::new(MountSession {
            tree,
            cache: NodeCache::new(),
            generation,
        }));
        Ok(())
    }

    /// Release the tree and every extracted buffer. Returns whether anything
    /// was mounted.
    pub fn unmount(&self) -> bool {
        match self.session.write().take() {
            Some(session) => {
                info!(
                    "Unmounted generation {} ({} bytes were resident)",
                    session.generation,
                    session.tree.resident_bytes()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.session.read().is_some()
    }

    fn session(&self) -> FsResult<Arc<MountSession>> {
        self.session.read().clone().ok_or(FsError::NotMounted)
    }

    fn resolve(
        &self,
        session: &MountSession,
        path: &str,
        handle: Option<&FileHandle>,
    ) -> FsResult<NodeId> {
        match handle {
            Some(handle) => check_handle(session, handle),
            None => session
                .cache
                .resolve(&session.tree, path)
                .ok_or_else(|| FsError::PathNotFound(path.to_string())),
        }
    }

    /// Open `path`. Any request that would modify the volume is refused.
    pub fn open(&self, path: &str, options: OpenOptions) -> FsResult<FileHandle> {
        trace!("open({}, {:?})", path, options);
        let session = self.session()?;

        if options.modifies() {
            debug!("Refusing writable open of {}", path);
            return Err(FsError::AccessDenied(path.to_string()));
        }
        match session.cache.resolve(&session.tree, path) {
            Some(id) => handle_for(&session, id),
            None if options.create => {
                debug!("Refusing to create {}", path);
                Err(FsError::AccessDenied(path.to_string()))
            }
            None => Err(FsError::PathNotFound(path.to_string())),
        }
    }

    /// Release a handle. Nothing is held per handle, so this only traces.
    pub fn close(&self, handle: &FileHandle) {
        trace!("close({:?})", handle);
    }

    /// Read from `path` (or the node behind `handle`) at `offset`.
    ///
    /// The first read of a file extracts it in full; the call blocks until
    /// that extraction is done. Returns the number of bytes copied, zero at
    /// or past the end of the file.
    pub fn read(
        &self,
        path: &str,
        handle: Option<&FileHandle>,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        trace!("read({}, offset={}, len={})", path, offset, buf.len());
        let session = self.session()?;
        let id = self.resolve(&session, path, handle)?;
        self.read_resolved(&session, id, offset, buf)
    }

    /// List the immediate children of a directory.
    pub fn read_dir(&self, path: &str, handle: Option<&FileHandle>) -> FsResult<Vec<FileInfo>> {
        trace!("read_dir({})", path);
        let session = self.session()?;
        let id = self.resolve(&session, path, handle)?;
        list_children(&session, id)
    }

    pub fn get_info(&self, path: &str, handle: Option<&FileHandle>) -> FsResult<FileInfo> {
        trace!("get_info({})", path);
        let session = self.session()?;
        let id = self.resolve(&session, path, handle)?;
        node_info(&session, id)
    }

    // Handle and node addressed variants for inode-based front ends.

    pub fn read_handle(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        trace!("read_handle({:?}, offset={})", handle.node, offset);
        let session = self.session()?;
        let id = check_handle(&session, handle)?;
        self.read_resolved(&session, id, offset, buf)
    }

    pub fn open_node(&self, id: NodeId, options: OpenOptions) -> FsResult<FileHandle> {
        trace!("open_node({:?}, {:?})", id, options);
        let session = self.session()?;
        if options.modifies() {
            debug!("Refusing writable open of {:?}", id);
            return Err(FsError::AccessDenied(node_path(&session, id)));
        }
        handle_for(&session, id)
    }

    /// Look up `name` among the children of `parent`.
    pub fn lookup(&self, parent: NodeId, name: &str) -> FsResult<FileInfo> {
        trace!("lookup({:?}, {})", parent, name);
        let session = self.session()?;
        let node = get_node(&session, parent)?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory(node.full_path().to_string()));
        }
        let child = node
            .child(name)
            .ok_or_else(|| FsError::PathNotFound(format!("{}/{}", node.full_path(), name)))?;
        node_info(&session, child)
    }

    pub fn node_info(&self, id: NodeId) -> FsResult<FileInfo> {
        trace!("node_info({:?})", id);
        let session = self.session()?;
        node_info(&session, id)
    }

    pub fn read_node(&self, id: NodeId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        trace!("read_node({:?}, offset={})", id, offset);
        let session = self.session()?;
        self.read_resolved(&session, id, offset, buf)
    }

    pub fn read_dir_node(&self, id: NodeId) -> FsResult<Vec<FileInfo>> {
        trace!("read_dir_node({:?})", id);
        let session = self.session()?;
        list_children(&session, id)
    }

    /// Absolute path of `id`.
    pub fn node_path(&self, id: NodeId) -> FsResult<String> {
        let session = self.session()?;
        Ok(get_node(&session, id)?.full_path().to_string())
    }

    /// Parent of `id`; `None` for the root.
    pub fn parent_of(&self, id: NodeId) -> FsResult<Option<NodeId>> {
        let session = self.session()?;
        Ok(get_node(&session, id)?.parent())
    }

    fn read_resolved(
        &self,
        session: &MountSession,
        id: NodeId,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let node = get_node(session, id)?;
        if node.is_directory() {
            return Err(FsError::IsADirectory(node.full_path().to_string()));
        }

        let content = session
            .tree
            .fill_buffer(id, |context, destination| {
                self.provider.extract_entry(context, destination)
            })
            .map_err(|source| FsError::ExtractionFailed {
                path: node.full_path().to_string(),
                source,
            })?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let count = buf.len().min(content.len() - start);
        buf[..count].copy_from_slice(&content[start..start + count]);
        Ok(count)
    }

    // Mutations. The volume is read-only.

    fn deny<T>(&self, operation: &str, path: &str) -> FsResult<T> {
        debug!("Refusing {} on {}", operation, path);
        Err(FsError::AccessDenied(path.to_string()))
    }

    pub fn write(
        &self,
        path: &str,
        _handle: Option<&FileHandle>,
        _offset: u64,
        _data: &[u8],
    ) -> FsResult<usize> {
        self.deny("write", path)
    }

    pub fn delete_file(&self, path: &str) -> FsResult<()> {
        self.deny("delete_file", path)
    }

    pub fn delete_directory(&self, path: &str) -> FsResult<()> {
        self.deny("delete_directory", path)
    }

    pub fn rename(&self, from: &str, _to: &str, _replace: bool) -> FsResult<()> {
        self.deny("rename", from)
    }

    pub fn set_attributes(&self, path: &str, _attributes: u32) -> FsResult<()> {
        self.deny("set_attributes", path)
    }

    pub fn set_times(
        &self,
        path: &str,
        _created: Option<SystemTime>,
        _accessed: Option<SystemTime>,
        _modified: Option<SystemTime>,
    ) -> FsResult<()> {
        self.deny("set_times", path)
    }

    pub fn set_len(&self, path: &str, _length: u64) -> FsResult<()> {
        self.deny("set_len", path)
    }

    pub fn lock(&self, path: &str, _offset: u64, _length: u64) -> FsResult<()> {
        self.deny("lock", path)
    }

    pub fn unlock(&self, path: &str, _offset: u64, _length: u64) -> FsResult<()> {
        self.deny("unlock", path)
    }

    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            label: self.config.volume_label.clone(),
            file_system_name: FILE_SYSTEM_NAME.to_string(),
            read_only: true,
            compressed: true,
            case_sensitive: false,
            max_component_length: MAX_COMPONENT_LENGTH,
        }
    }

    pub fn disk_space(&self) -> FsResult<DiskSpace> {
        let session = self.session()?;
        Ok(DiskSpace {
            total_bytes: session.tree.root().length(),
            free_bytes: 0,
            available_bytes: 0,
        })
    }

    /// Number of nodes in the mounted tree, root included.
    pub fn node_count(&self) -> FsResult<usize> {
        Ok(self.session()?.tree.node_count())
    }

    /// Bytes held in extracted buffers of the current mount.
    pub fn resident_bytes(&self) -> FsResult<u64> {
        Ok(self.session()?.tree.resident_bytes())
    }
}

impl fmt::Debug for ArchiveFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveFs")
            .field("format", &self.provider.format())
            .field("label", &self.config.volume_label)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

fn check_handle(session: &MountSession, handle: &FileHandle) -> FsResult<NodeId> {
    if handle.generation != session.generation || session.tree.node(handle.node).is_none() {
        return Err(FsError::InvalidHandle);
    }
    Ok(handle.node)
}

fn get_node(session: &MountSession, id: NodeId) -> FsResult<&FsTreeNode> {
    session
        .tree
        .node(id)
        .ok_or_else(|| FsError::PathNotFound(format!("#{}", id.index())))
}

fn node_path(session: &MountSession, id: NodeId) -> String {
    session
        .tree
        .node(id)
        .map(|node| node.full_path().to_string())
        .unwrap_or_else(|| format!("#{}", id.index()))
}

fn handle_for(session: &MountSession, id: NodeId) -> FsResult<FileHandle> {
    let node = get_node(session, id)?;
    Ok(FileHandle {
        node: id,
        is_directory: node.is_directory(),
        generation: session.generation,
    })
}

fn node_info(session: &MountSession, id: NodeId) -> FsResult<FileInfo> {
    Ok(FileInfo::from_node(id, get_node(session, id)?))
}

fn list_children(session: &MountSession, id: NodeId) -> FsResult<Vec<FileInfo>> {
    let node = get_node(session, id)?;
    if !node.is_directory() {
        return Err(FsError::NotADirectory(node.full_path().to_string()));
    }

    let mut children: Vec<FileInfo> = node
        .children()
        .filter_map(|child| session.tree.node(child).map(|n| FileInfo::from_node(child, n)))
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}
