//! `dav_server::fs::DavFileSystem` implementation over [`ArchiveFs`].

use crate::error::FsError;
use crate::handler::{ArchiveFs, FileHandle, FileInfo, OpenOptions};
use dav_server::davpath::DavPath;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError as DavError, FsFuture, FsStream,
    OpenOptions as DavOpenOptions, ReadDirMeta,
};
use futures::stream;
use log::{debug, error, trace};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

fn dav_error(err: FsError) -> DavError {
    match err {
        FsError::PathNotFound(_) => DavError::NotFound,
        FsError::NotADirectory(_) | FsError::IsADirectory(_) | FsError::AccessDenied(_) => {
            DavError::Forbidden
        }
        other => {
            error!("WebDAV request failed: {}", other);
            DavError::GeneralFailure
        }
    }
}

fn dav_path(path: &DavPath) -> String {
    path.as_rel_ospath().to_string_lossy().into_owned()
}

/// WebDAV view of an [`ArchiveFs`].
#[derive(Clone)]
pub struct AvfsDavFs {
    fs: Arc<ArchiveFs>,
}

impl AvfsDavFs {
    /// Wrap a mounted filesystem.
    pub fn new(fs: Arc<ArchiveFs>) -> Self {
        Self { fs }
    }

    pub fn archive_fs(&self) -> &ArchiveFs {
        &self.fs
    }
}

impl DavFileSystem for AvfsDavFs {
    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: DavOpenOptions,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        trace!("open({:?}, {:?})", path, options);

        let result = (|| -> Result<Box<dyn DavFile>, DavError> {
            let path = dav_path(path);
            let handle = self
                .fs
                .open(
                    &path,
                    OpenOptions {
                        read: options.read,
                        write: options.write,
                        append: options.append,
                        truncate: options.truncate,
                        create: options.create,
                        create_new: options.create_new,
                    },
                )
                .map_err(dav_error)?;
            let info = self
                .fs
                .get_info(&path, Some(&handle))
                .map_err(dav_error)?;

            Ok(Box::new(AvfsDavFile {
                fs: Arc::clone(&self.fs),
                path,
                handle,
                info,
                position: 0,
            }) as Box<dyn DavFile>)
        })();

        Box::pin(async move { result })
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        trace!("read_dir({:?}, {:?})", path, meta);

        let result = self
            .fs
            .read_dir(&dav_path(path), None)
            .map_err(dav_error)
            .map(|children| {
                debug!("read_dir: returning {} entries", children.len());
                let entries = children
                    .into_iter()
                    .map(|info| {
                        let entry: Box<dyn DavDirEntry> = Box::new(AvfsDavDirEntry { info });
                        Ok::<_, DavError>(entry)
                    });
                Box::pin(stream::iter(entries)) as FsStream<Box<dyn DavDirEntry>>
            });

        Box::pin(async move { result })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        trace!("metadata({:?})", path);

        let result = self
            .fs
            .get_info(&dav_path(path), None)
            .map(|info| Box::new(AvfsDavMetaData::from(&info)) as Box<dyn DavMetaData>)
            .map_err(dav_error);

        Box::pin(async move { result })
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let result = self
            .fs
            .open(
                &dav_path(path),
                OpenOptions {
                    create_new: true,
                    ..OpenOptions::default()
                },
            )
            .map(|_| ())
            .map_err(dav_error);
        Box::pin(async move { result })
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let result = self.fs.delete_directory(&dav_path(path)).map_err(dav_error);
        Box::pin(async move { result })
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let result = self.fs.delete_file(&dav_path(path)).map_err(dav_error);
        Box::pin(async move { result })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        let result = self
            .fs
            .rename(&dav_path(from), &dav_path(to), true)
            .map_err(dav_error);
        Box::pin(async move { result })
    }

    fn copy<'a>(&'a self, _from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        let result = self
            .fs
            .open(
                &dav_path(to),
                OpenOptions {
                    write: true,
                    create: true,
                    ..OpenOptions::default()
                },
            )
            .map(|_| ())
            .map_err(dav_error);
        Box::pin(async move { result })
    }
}

/// An open archive file. Reads go through the shared node buffer.
#[derive(Debug)]
struct AvfsDavFile {
    fs: Arc<ArchiveFs>,
    /// Path the file was opened with.
    path: String,
    handle: FileHandle,
    info: FileInfo,
    position: u64,
}

impl AvfsDavFile {
    fn write_at(&self, data: &[u8]) -> Result<(), FsError> {
        self.fs
            .write(&self.path, Some(&self.handle), self.position, data)
            .map(|_| ())
    }
}

impl DavFile for AvfsDavFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let meta = AvfsDavMetaData::from(&self.info);
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, bytes::Bytes> {
        let remaining = self.info.length.saturating_sub(self.position);
        let to_read = std::cmp::min(count as u64, remaining) as usize;

        if to_read == 0 {
            return Box::pin(async move { Ok(bytes::Bytes::new()) });
        }

        // The first read of a file extracts it, which can take a while.
        let fs = Arc::clone(&self.fs);
        let handle = self.handle;
        let position = self.position;
        Box::pin(async move {
            let buffer = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; to_read];
                let n = fs.read_handle(&handle, position, &mut buffer)?;
                buffer.truncate(n);
                Ok::<_, FsError>(buffer)
            })
            .await
            .map_err(|_| DavError::GeneralFailure)?
            .map_err(dav_error)?;

            self.position += buffer.len() as u64;
            Ok(bytes::Bytes::from(buffer))
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<'_, u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.info.length as i64 + n,
            SeekFrom::Current(n) => self.position as i64 + n,
        };

        if new_pos < 0 {
            return Box::pin(async { Err(DavError::GeneralFailure) });
        }

        self.position = new_pos as u64;
        let pos = self.position;
        Box::pin(async move { Ok(pos) })
    }

    fn write_buf(&mut self, buf: Box<dyn bytes::Buf + Send>) -> FsFuture<'_, ()> {
        let result = self.write_at(buf.chunk()).map_err(dav_error);
        Box::pin(async move { result })
    }

    fn write_bytes(&mut self, buf: bytes::Bytes) -> FsFuture<'_, ()> {
        let result = self.write_at(&buf).map_err(dav_error);
        Box::pin(async move { result })
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl Drop for AvfsDavFile {
    fn drop(&mut self) {
        self.fs.close(&self.handle);
    }
}

struct AvfsDavDirEntry {
    info: FileInfo,
}

impl DavDirEntry for AvfsDavDirEntry {
    fn name(&self) -> Vec<u8> {
        self.info.name.as_bytes().to_vec()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let meta = AvfsDavMetaData::from(&self.info);
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }
}

#[derive(Clone, Debug)]
struct AvfsDavMetaData {
    is_dir: bool,
    len: u64,
    modified: SystemTime,
    created: SystemTime,
}

impl From<&FileInfo> for AvfsDavMetaData {
    fn from(info: &FileInfo) -> Self {
        Self {
            is_dir: info.is_directory,
            len: info.length,
            modified: info.modified,
            created: info.created,
        }
    }
}

impl DavMetaData for AvfsDavMetaData {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> Result<SystemTime, DavError> {
        Ok(self.modified)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn created(&self) -> Result<SystemTime, DavError> {
        Ok(self.created)
    }
}
