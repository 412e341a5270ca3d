//! `fuser::Filesystem` implementation over [`ArchiveFs`].

use crate::error::FsError;
use crate::handler::{ArchiveFs, FileHandle, FileInfo, OpenOptions};
use avfs_archive::NodeId;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EACCES, EBADF, EIO, EISDIR, ENODEV, ENOENT, ENOTDIR};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Block size for attributes and filesystem statistics.
const BLOCK_SIZE: u32 = 512;

fn to_ino(id: NodeId) -> u64 {
    id.index() as u64 + FUSE_ROOT_ID
}

fn to_node(ino: u64) -> NodeId {
    NodeId::from_index(ino.saturating_sub(FUSE_ROOT_ID) as usize)
}

/// Map a filesystem error onto an errno value.
pub fn errno(err: &FsError) -> c_int {
    match err {
        FsError::PathNotFound(_) => ENOENT,
        FsError::NotADirectory(_) => ENOTDIR,
        FsError::IsADirectory(_) => EISDIR,
        FsError::AccessDenied(_) => EACCES,
        FsError::InvalidHandle => EBADF,
        FsError::NotMounted => ENODEV,
        FsError::ExtractionFailed { .. } | FsError::ProviderInit(_) => EIO,
    }
}

/// Translate `open(2)` flags into [`OpenOptions`].
fn open_options(flags: i32) -> OpenOptions {
    let access = flags & libc::O_ACCMODE;
    OpenOptions {
        read: access == libc::O_RDONLY || access == libc::O_RDWR,
        write: access == libc::O_WRONLY || access == libc::O_RDWR,
        append: flags & libc::O_APPEND != 0,
        truncate: flags & libc::O_TRUNC != 0,
        create: flags & libc::O_CREAT != 0,
        create_new: flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0,
    }
}

/// FUSE adapter over one archive filesystem.
pub struct AvfsFuse {
    fs: ArchiveFs,
    /// Open handles by FUSE file handle number.
    handles: HashMap<u64, FileHandle>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl AvfsFuse {
    /// Wrap `fs`, mounting it first if needed so that a broken archive fails
    /// before anything is registered with the kernel.
    pub fn new(fs: ArchiveFs) -> io::Result<Self> {
        if !fs.is_mounted() {
            fs.mount()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }

        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        Ok(Self {
            fs,
            handles: HashMap::new(),
            next_fh: 1,
            uid,
            gid,
        })
    }

    pub fn archive_fs(&self) -> &ArchiveFs {
        &self.fs
    }

    fn attr(&self, info: &FileInfo) -> FileAttr {
        let blocks = (info.compressed_length + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE);
        FileAttr {
            ino: to_ino(info.node),
            size: info.length,
            blocks,
            atime: info.accessed,
            mtime: info.modified,
            ctime: info.modified,
            crtime: info.created,
            kind: if info.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: if info.is_directory { 0o555 } else { 0o444 },
            nlink: if info.is_directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> String {
        self.fs
            .node_path(to_node(ino))
            .unwrap_or_else(|_| format!("#{}", ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> String {
        format!(
            "{}/{}",
            self.path_of(parent).trim_end_matches('/'),
            name.to_string_lossy()
        )
    }

    fn deny(&self, operation: &str, result: Result<(), FsError>) -> c_int {
        match result {
            Ok(()) => EACCES,
            Err(e) => {
                debug!("{}: {}", operation, e);
                errno(&e)
            }
        }
    }
}

impl Filesystem for AvfsFuse {
    fn destroy(&mut self) {
        info!("FUSE session ending");
        self.handles.clear();
        self.fs.unmount();
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={})", ino);

        match self.fs.node_info(to_node(ino)) {
            Ok(info) => reply.attr(&self.fs.config().attr_ttl, &self.attr(&info)),
            Err(e) => {
                warn!("getattr: inode {}: {}", ino, e);
                reply.error(errno(&e));
            }
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        trace!("lookup(parent={}, name='{}')", parent, name);

        match self.fs.lookup(to_node(parent), &name) {
            Ok(info) => reply.entry(&self.fs.config().attr_ttl, &self.attr(&info), 0),
            Err(e) => {
                debug!("lookup: {}", e);
                reply.error(errno(&e));
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={}, offset={})", ino, offset);

        let node = to_node(ino);
        let children = match self.fs.read_dir_node(node) {
            Ok(children) => children,
            Err(e) => {
                warn!("readdir: inode {}: {}", ino, e);
                reply.error(errno(&e));
                return;
            }
        };
        let parent = match self.fs.parent_of(node) {
            Ok(parent) => parent.map_or(ino, to_ino),
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        entries.extend(children.into_iter().map(|child| {
            let kind = if child.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            (to_ino(child.node), kind, child.name)
        }));

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={}, flags={:#o})", ino, flags);

        match self.fs.open_node(to_node(ino), open_options(flags)) {
            Ok(handle) if handle.is_directory => reply.error(EISDIR),
            Ok(handle) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(e) => {
                debug!("open: inode {}: {}", ino, e);
                reply.error(errno(&e));
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let mut buffer = vec![0u8; size as usize];
        let result = match self.handles.get(&fh) {
            Some(handle) => self.fs.read_handle(handle, offset as u64, &mut buffer),
            None => self.fs.read_node(to_node(ino), offset as u64, &mut buffer),
        };

        match result {
            Ok(count) => reply.data(&buffer[..count]),
            Err(e) => {
                error!("read: inode {}: {}", ino, e);
                reply.error(errno(&e));
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.remove(&fh) {
            self.fs.close(&handle);
        }
        reply.ok();
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let handle = self.handles.get(&fh).copied();
        let path = self.path_of(ino);
        let result = self
            .fs
            .write(&path, handle.as_ref(), offset.max(0) as u64, data)
            .map(|_| ());
        reply.error(self.deny("write", result));
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = self.path_of(ino);
        let result = if let Some(size) = size {
            self.fs.set_len(&path, size)
        } else if let Some(mode) = mode {
            self.fs.set_attributes(&path, mode)
        } else {
            let time = |t: Option<TimeOrNow>| match t {
                Some(TimeOrNow::SpecificTime(t)) => Some(t),
                Some(TimeOrNow::Now) => Some(SystemTime::now()),
                None => None,
            };
            self.fs.set_times(&path, crtime, time(atime), time(mtime))
        };
        reply.error(self.deny("setattr", result));
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = self.child_path(parent, name);
        let result = self.fs.open(&path, OpenOptions {
            create_new: true,
            ..OpenOptions::default()
        });
        reply.error(self.deny("mknod", result.map(|_| ())));
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = self.child_path(parent, name);
        let result = self.fs.open(&path, OpenOptions {
            create_new: true,
            ..OpenOptions::default()
        });
        reply.error(self.deny("mkdir", result.map(|_| ())));
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = self.child_path(parent, name);
        let mut options = open_options(flags);
        options.create = true;
        let result = self.fs.open(&path, options);
        reply.error(self.deny("create", result.map(|_| ())));
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name);
        reply.error(self.deny("unlink", self.fs.delete_file(&path)));
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name);
        reply.error(self.deny("rmdir", self.fs.delete_directory(&path)));
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = self.child_path(parent, name);
        let to = self.child_path(newparent, newname);
        reply.error(self.deny("rename", self.fs.rename(&from, &to, true)));
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");

        let (space, files) = match (self.fs.disk_space(), self.fs.node_count()) {
            (Ok(space), Ok(files)) => (space, files as u64),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(errno(&e));
                return;
            }
        };
        let blocks = (space.total_bytes + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE);
        let volume = self.fs.volume_info();

        reply.statfs(
            blocks,
            space.free_bytes / u64::from(BLOCK_SIZE),
            space.available_bytes / u64::from(BLOCK_SIZE),
            files,
            0,
            BLOCK_SIZE,
            volume.max_component_length,
            BLOCK_SIZE,
        );
    }
}

fn mount_options(fs: &ArchiveFs) -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName(fs.config().volume_label.clone()),
        MountOption::Subtype("avfs".to_string()),
        MountOption::DefaultPermissions,
    ]
}

/// Mount `fs` at `mount_point`, blocking until it is unmounted.
pub fn mount<P: AsRef<Path>>(fs: ArchiveFs, mount_point: P) -> io::Result<()> {
    let options = mount_options(&fs);
    let adapter = AvfsFuse::new(fs)?;
    let mount_point = mount_point.as_ref();

    info!(
        "Mounting {} archive at {}",
        adapter.fs.format(),
        mount_point.display()
    );

    fuser::mount2(adapter, mount_point, &options)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}

/// Mount `fs` in the background. Dropping the returned session unmounts.
pub fn mount_background<P: AsRef<Path>>(
    fs: ArchiveFs,
    mount_point: P,
) -> io::Result<fuser::BackgroundSession> {
    let options = mount_options(&fs);
    let adapter = AvfsFuse::new(fs)?;
    let mount_point = mount_point.as_ref();

    info!(
        "Mounting {} archive at {} (background)",
        adapter.fs.format(),
        mount_point.display()
    );

    fuser::spawn_mount2(adapter, mount_point, &options)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_mapping() {
        assert_eq!(to_ino(avfs_archive::ROOT), FUSE_ROOT_ID);
        assert_eq!(to_node(FUSE_ROOT_ID), avfs_archive::ROOT);
        assert_eq!(to_node(to_ino(NodeId::from_index(41))), NodeId::from_index(41));
    }

    #[test]
    fn test_open_flags() {
        assert_eq!(open_options(libc::O_RDONLY), OpenOptions::read_only());
        assert!(open_options(libc::O_WRONLY).write);
        assert!(open_options(libc::O_RDWR | libc::O_TRUNC).truncate);
        assert!(open_options(libc::O_CREAT | libc::O_EXCL).create_new);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno(&FsError::PathNotFound("/x".into())), ENOENT);
        assert_eq!(errno(&FsError::AccessDenied("/x".into())), EACCES);
        assert_eq!(errno(&FsError::InvalidHandle), EBADF);
        assert_eq!(errno(&FsError::NotMounted), ENODEV);
    }
}
