#![cfg(feature = "webdav")]

use avfs_fs::webdav::{serve_background, AvfsDavFs};
use avfs_fs::{ArchiveFs, MountConfig, ProviderOptions};
use dav_server::davpath::DavPath;
use dav_server::fs::{DavFileSystem, FsError};
use futures::StreamExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::{write::FileOptions, ZipWriter};

fn create_zip(dir: &Path) -> PathBuf {
    let path = dir.join("share.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options: FileOptions<()> =
        FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("Photos/beach.jpg", options).unwrap();
    zip.write_all(&[0xffu8; 300]).unwrap();
    zip.start_file("Photos/notes.txt", options).unwrap();
    zip.write_all(b"sunny").unwrap();
    zip.finish().unwrap();
    path
}

fn dav_fs(dir: &Path) -> AvfsDavFs {
    let fs = ArchiveFs::from_path(create_zip(dir), ProviderOptions::default(), MountConfig::default())
        .unwrap();
    fs.mount().unwrap();
    AvfsDavFs::new(Arc::new(fs))
}

#[tokio::test]
async fn metadata_reflects_the_tree() {
    let temp_dir = TempDir::new().unwrap();
    let dav = dav_fs(temp_dir.path());

    let dir = dav.metadata(&DavPath::new("/photos/").unwrap()).await.unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.len(), 305);

    let file = dav
        .metadata(&DavPath::new("/Photos/NOTES.txt").unwrap())
        .await
        .unwrap();
    assert!(!file.is_dir());
    assert_eq!(file.len(), 5);

    let missing = dav.metadata(&DavPath::new("/nope").unwrap()).await;
    assert!(matches!(missing, Err(FsError::NotFound)));
}

#[tokio::test]
async fn read_dir_lists_children() {
    let temp_dir = TempDir::new().unwrap();
    let dav = dav_fs(temp_dir.path());

    let mut entries = dav
        .read_dir(
            &DavPath::new("/Photos/").unwrap(),
            dav_server::fs::ReadDirMeta::Data,
        )
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Some(entry) = entries.next().await {
        names.push(String::from_utf8(entry.unwrap().name()).unwrap());
    }
    assert_eq!(names, vec!["beach.jpg", "notes.txt"]);
}

#[tokio::test]
async fn modifications_are_forbidden() {
    let temp_dir = TempDir::new().unwrap();
    let dav = dav_fs(temp_dir.path());
    let notes = DavPath::new("/Photos/notes.txt").unwrap();

    assert!(matches!(dav.remove_file(&notes).await, Err(FsError::Forbidden)));
    assert!(matches!(
        dav.remove_dir(&DavPath::new("/Photos/").unwrap()).await,
        Err(FsError::Forbidden)
    ));
    assert!(matches!(
        dav.create_dir(&DavPath::new("/New/").unwrap()).await,
        Err(FsError::Forbidden)
    ));
    assert!(matches!(
        dav.rename(&notes, &DavPath::new("/Photos/moved.txt").unwrap())
            .await,
        Err(FsError::Forbidden)
    ));

    // Still there, still readable.
    assert_eq!(dav.metadata(&notes).await.unwrap().len(), 5);
}

#[tokio::test]
async fn background_server_unmounts_on_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let fs = ArchiveFs::from_path(
        create_zip(temp_dir.path()),
        ProviderOptions::default(),
        MountConfig::default(),
    )
    .unwrap();

    let server = serve_background(fs, 0).await.unwrap();
    assert_ne!(server.addr().port(), 0);
    assert!(server.mount_url().starts_with("http://127.0.0.1:"));
    assert!(server.archive_fs().is_mounted());

    let fs_info = server.archive_fs().get_info("/photos", None).unwrap();
    assert_eq!(fs_info.length, 305);
    server.shutdown();
}
