use avfs_archive::{fold_case, path_components, FsTree, NodeId};
use dashmap::DashMap;
use log::debug;

/// Canonical cache key for `path`: components split on `/` and `\`, empty
/// and `.` components dropped, case-folded, joined with `/`.
pub fn normalize(path: &str) -> String {
    path_components(path)
        .map(fold_case)
        .collect::<Vec<_>>()
        .join("/")
}

/// Memoized path resolution for one mount. Only successful lookups are kept.
#[derive(Debug, Default)]
pub struct NodeCache {
    entries: DashMap<String, NodeId>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `path` against `tree`, consulting the cache first.
    pub fn resolve(&self, tree: &FsTree, path: &str) -> Option<NodeId> {
        let key = normalize(path);
        if let Some(id) = self.entries.get(&key) {
            return Some(*id);
        }

        debug!("Node cache miss: /{}", key);
        let id = tree.lookup(path)?;
        self.entries.insert(key, id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avfs_archive::{EntryContext, EntryMeta, EntryTimes, FsTreeBuilder};

    fn tree() -> FsTree {
        let mut builder = FsTreeBuilder::new();
        builder.insert_entry(
            "Docs/Readme.TXT",
            false,
            EntryMeta {
                length: 4,
                compressed_length: 4,
                times: EntryTimes::default(),
                context: EntryContext::new(0),
            },
        );
        builder.finish()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/Docs/Readme.TXT"), "docs/readme.txt");
        assert_eq!(normalize("\\docs\\\\readme.txt"), "docs/readme.txt");
        assert_eq!(normalize("./docs/./"), "docs");
        assert_eq!(normalize("/"), "");
    }

    #[test]
    fn test_only_hits_are_cached() {
        let tree = tree();
        let cache = NodeCache::new();

        let id = cache.resolve(&tree, "/docs/readme.txt").unwrap();
        assert_eq!(cache.resolve(&tree, "\\DOCS\\README.txt"), Some(id));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.resolve(&tree, "/docs/missing"), None);
        assert_eq!(cache.resolve(&tree, "/docs/readme.txt/below"), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_root_resolves() {
        let tree = tree();
        let cache = NodeCache::new();
        assert_eq!(cache.resolve(&tree, "/"), Some(avfs_archive::ROOT));
        assert_eq!(cache.resolve(&tree, ""), Some(avfs_archive::ROOT));
    }
}
