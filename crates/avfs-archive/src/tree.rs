//! In-memory directory tree indexing every archive entry.
//!
//! The tree is built once per mount by an [`FsTreeBuilder`] and frozen into
//! an [`FsTree`]. After that its shape never changes; the only mutation left
//! is each file node filling its content buffer, at most once, on first read.

use crate::{Error, Result};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::SystemTime;

/// Id of the root directory in every tree.
pub const ROOT: NodeId = NodeId(0);

/// Index of a node inside its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Rebuild an id from a raw arena index (e.g. a FUSE inode).
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// The raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Opaque token a provider hands out to locate an entry for extraction.
///
/// Only meaningful to the provider that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryContext(u64);

impl EntryContext {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Timestamps recorded in the archive for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTimes {
    pub created: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

impl EntryTimes {
    /// Times with only a modification time, as most containers record.
    pub fn modified(modified: Option<SystemTime>) -> Self {
        Self {
            modified,
            ..Self::default()
        }
    }

    /// Overwrite the fields that `other` knows about.
    fn merge(&mut self, other: EntryTimes) {
        if other.created.is_some() {
            self.created = other.created;
        }
        if other.accessed.is_some() {
            self.accessed = other.accessed;
        }
        if other.modified.is_some() {
            self.modified = other.modified;
        }
    }
}

/// Metadata for one archive entry as reported by a provider.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    /// Uncompressed size in bytes.
    pub length: u64,
    /// Stored size in bytes.
    pub compressed_length: u64,
    pub times: EntryTimes,
    pub context: EntryContext,
}

/// Extraction state of a file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    /// No successful extraction yet.
    Unfilled,
    /// A thread holds the node's gate and is extracting.
    Filling,
    /// The buffer is published and immutable.
    Filled,
}

/// Split an archive path into its components.
///
/// Both `/` and `\` separate components; empty and `.` components are dropped.
pub fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
        .filter(|component| !component.is_empty() && *component != ".")
}

/// Case-fold a single name for child lookup.
pub fn fold_case(name: &str) -> String {
    name.to_lowercase()
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// A file or directory in the tree.
pub struct FsTreeNode {
    name: String,
    full_path: String,
    parent: Option<NodeId>,
    /// Present iff this node is a directory. Keys are case-folded names.
    children: Option<HashMap<String, NodeId>>,
    length: u64,
    compressed_length: u64,
    times: EntryTimes,
    context: Option<EntryContext>,
    content: OnceLock<Box<[u8]>>,
    fill_gate: Mutex<()>,
}

impl FsTreeNode {
    fn new(name: &str, full_path: String, parent: Option<NodeId>, is_directory: bool) -> Self {
        Self {
            name: name.to_string(),
            full_path,
            parent,
            children: is_directory.then(HashMap::new),
            length: 0,
            compressed_length: 0,
            times: EntryTimes::default(),
            context: None,
            content: OnceLock::new(),
            fill_gate: Mutex::new(()),
        }
    }

    /// The entry's own name, as spelled by the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute `/`-separated path from the root.
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    /// Uncompressed size; for directories the sum over all descendant files.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Stored size; for directories the sum over all descendant files.
    pub fn compressed_length(&self) -> u64 {
        self.compressed_length
    }

    pub fn times(&self) -> EntryTimes {
        self.times
    }

    pub fn context(&self) -> Option<EntryContext> {
        self.context
    }

    /// Ids of the immediate children, in no particular order. Empty for files.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flat_map(|children| children.values().copied())
    }

    /// Number of immediate children. Zero for files.
    pub fn child_count(&self) -> usize {
        self.children.as_ref().map_or(0, HashMap::len)
    }

    /// Case-insensitive child lookup.
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.as_ref()?.get(&fold_case(name)).copied()
    }

    /// Extraction state. Directories have nothing to extract and report `Filled`.
    pub fn fill_state(&self) -> FillState {
        if self.is_directory() || self.content.get().is_some() {
            FillState::Filled
        } else if self.fill_gate.is_locked() {
            FillState::Filling
        } else {
            FillState::Unfilled
        }
    }

    /// The extracted bytes, once filled.
    pub fn content(&self) -> Option<&[u8]> {
        self.content.get().map(|content| &content[..])
    }

    /// Run `extract` at most once for this node and return the filled buffer.
    ///
    /// Returns the freshly filled byte count alongside the content so the
    /// tree can keep its resident total.
    fn fill_buffer<F>(&self, extract: F) -> Result<(&[u8], u64)>
    where
        F: FnOnce(EntryContext, &mut [u8]) -> Result<()>,
    {
        if self.is_directory() {
            return Ok((&[], 0));
        }
        if let Some(content) = self.content.get() {
            return Ok((&content[..], 0));
        }

        let _gate = self.fill_gate.lock();
        // Another reader may have finished while we waited on the gate.
        if let Some(content) = self.content.get() {
            return Ok((&content[..], 0));
        }

        let len = usize::try_from(self.length).map_err(|_| {
            Error::InvalidArchive(format!("{} is too large to buffer", self.full_path))
        })?;
        let mut buffer = vec![0u8; len].into_boxed_slice();
        if len > 0 {
            let context = self
                .context
                .ok_or_else(|| Error::MissingContext(self.full_path.clone()))?;
            debug!("Extracting {} ({} bytes)", self.full_path, len);
            if let Err(err) = extract(context, &mut buffer) {
                error!("Failed to extract {}: {}", self.full_path, err);
                return Err(err);
            }
        }

        let content = self.content.get_or_init(|| buffer);
        Ok((&content[..], self.length))
    }
}

impl fmt::Debug for FsTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsTreeNode")
            .field("full_path", &self.full_path)
            .field("is_directory", &self.is_directory())
            .field("length", &self.length)
            .field("compressed_length", &self.compressed_length)
            .field("fill_state", &self.fill_state())
            .finish()
    }
}

/// Incrementally builds an [`FsTree`] from archive entries.
#[derive(Debug)]
pub struct FsTreeBuilder {
    nodes: Vec<FsTreeNode>,
    skipped: usize,
}

impl Default for FsTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FsTreeBuilder {
    /// Create a builder holding only the root directory.
    pub fn new() -> Self {
        Self {
            nodes: vec![FsTreeNode::new("", "/".to_string(), None, true)],
            skipped: 0,
        }
    }

    /// Number of entries rejected so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Return the child `name` of `parent`, creating it if absent.
    ///
    /// Returns `None` when `parent` is a file. An existing child is returned
    /// as is, whatever its kind.
    pub fn get_or_add_child(
        &mut self,
        parent: NodeId,
        is_directory: bool,
        name: &str,
    ) -> Option<NodeId> {
        let key = fold_case(name);
        let full_path = {
            let parent_node = self.nodes.get(parent.0)?;
            let children = parent_node.children.as_ref()?;
            if let Some(&existing) = children.get(&key) {
                return Some(existing);
            }
            child_path(&parent_node.full_path, name)
        };

        let id = NodeId(self.nodes.len());
        self.nodes
            .push(FsTreeNode::new(name, full_path, Some(parent), is_directory));
        if let Some(children) = self.nodes[parent.0].children.as_mut() {
            children.insert(key, id);
        }
        Some(id)
    }

    /// Insert one archive entry, creating intermediate directories.
    ///
    /// Returns the terminal node, or `None` if the entry was skipped.
    pub fn insert_entry(&mut self, path: &str, is_directory: bool, meta: EntryMeta) -> Option<NodeId> {
        let components: Vec<&str> = path_components(path).collect();
        if components.iter().any(|component| *component == "..") {
            warn!("Skipping entry with parent reference: {}", path);
            self.skipped += 1;
            return None;
        }

        let Some((last, parents)) = components.split_last() else {
            if is_directory {
                self.nodes[ROOT.0].times.merge(meta.times);
                return Some(ROOT);
            }
            warn!("Skipping file entry with empty name: {:?}", path);
            self.skipped += 1;
            return None;
        };

        let mut node = ROOT;
        for component in parents {
            match self.get_or_add_child(node, true, component) {
                Some(child) if self.nodes[child.0].is_directory() => node = child,
                _ => {
                    warn!("Skipping {}: '{}' is a file", path, component);
                    self.skipped += 1;
                    return None;
                }
            }
        }

        if is_directory {
            return self.insert_directory(node, last, path, meta);
        }

        match self.nodes[node.0].child(last) {
            Some(existing) if self.nodes[existing.0].is_directory() => {
                warn!("Skipping file {}: a directory has the same name", path);
                self.skipped += 1;
                None
            }
            Some(existing) => {
                debug!("Replacing duplicate entry {}", path);
                let old = {
                    let file = &self.nodes[existing.0];
                    (file.length, file.compressed_length)
                };
                self.set_file_meta(existing, meta);
                self.adjust_ancestors(existing, old, (meta.length, meta.compressed_length));
                Some(existing)
            }
            None => {
                let id = self.get_or_add_child(node, false, last)?;
                self.set_file_meta(id, meta);
                self.adjust_ancestors(id, (0, 0), (meta.length, meta.compressed_length));
                Some(id)
            }
        }
    }

    fn insert_directory(
        &mut self,
        parent: NodeId,
        name: &str,
        path: &str,
        meta: EntryMeta,
    ) -> Option<NodeId> {
        let id = self.get_or_add_child(parent, true, name)?;
        let dir = &mut self.nodes[id.0];
        if !dir.is_directory() {
            warn!("Skipping directory {}: a file has the same name", path);
            self.skipped += 1;
            return None;
        }
        dir.times.merge(meta.times);
        dir.context = Some(meta.context);
        Some(id)
    }

    fn set_file_meta(&mut self, id: NodeId, meta: EntryMeta) {
        let file = &mut self.nodes[id.0];
        file.length = meta.length;
        file.compressed_length = meta.compressed_length;
        file.times = meta.times;
        file.context = Some(meta.context);
    }

    /// Swap `old` sizes for `new` sizes on every ancestor of `id`.
    fn adjust_ancestors(&mut self, id: NodeId, old: (u64, u64), new: (u64, u64)) {
        let mut current = self.nodes[id.0].parent;
        while let Some(ancestor) = current {
            let dir = &mut self.nodes[ancestor.0];
            dir.length = dir.length - old.0 + new.0;
            dir.compressed_length = dir.compressed_length - old.1 + new.1;
            current = dir.parent;
        }
    }

    /// Freeze the tree. No structural change is possible afterwards.
    pub fn finish(self) -> FsTree {
        FsTree {
            nodes: self.nodes,
            resident_bytes: AtomicU64::new(0),
        }
    }
}

/// The frozen directory tree of one mount.
pub struct FsTree {
    nodes: Vec<FsTreeNode>,
    resident_bytes: AtomicU64,
}

impl FsTree {
    pub fn root(&self) -> &FsTreeNode {
        &self.nodes[ROOT.0]
    }

    pub fn node(&self, id: NodeId) -> Option<&FsTreeNode> {
        self.nodes.get(id.0)
    }

    /// Total number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of file nodes.
    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|node| !node.is_directory()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &FsTreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index), node))
    }

    /// Case-insensitive child lookup.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)?.child(name)
    }

    /// Resolve a path by descending from the root.
    ///
    /// Fails if a component is missing or a file sits where a directory is
    /// expected.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        path_components(path).try_fold(ROOT, |node, component| self.child(node, component))
    }

    /// Bytes currently held in filled buffers.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    /// Fill the buffer of `id` on first use and return its contents.
    ///
    /// `extract` runs at most once per node across all threads unless it
    /// fails, in which case the node stays unfilled and a later call retries.
    /// Directories return an empty slice without calling `extract`.
    pub fn fill_buffer<F>(&self, id: NodeId, extract: F) -> Result<&[u8]>
    where
        F: FnOnce(EntryContext, &mut [u8]) -> Result<()>,
    {
        let node = self.node(id).ok_or(Error::UnknownNode(id.0))?;
        let (content, filled) = node.fill_buffer(extract)?;
        if filled > 0 {
            self.resident_bytes.fetch_add(filled, Ordering::Relaxed);
        }
        Ok(content)
    }
}

impl fmt::Debug for FsTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsTree")
            .field("nodes", &self.nodes.len())
            .field("length", &self.root().length)
            .field("resident_bytes", &self.resident_bytes())
            .finish()
    }
}
