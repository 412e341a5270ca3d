use avfs_archive::{
    open_archive, ArchiveFormat, ArchiveProvider, EntryContext, FsTree, HandleStrategy,
};
use avfs_fs::{ArchiveFs, FsError, MountConfig, OpenOptions, ProviderOptions};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use zip::{write::FileOptions, ZipWriter};

fn large_payload() -> Vec<u8> {
    (0..1_000_000u32).map(|i| (i.wrapping_mul(31) % 253) as u8).collect()
}

fn create_zip(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options: FileOptions<()> =
        FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("a/b/c.txt", options).unwrap();
    zip.write_all(b"0123456789").unwrap();
    zip.start_file("a/d.txt", options).unwrap();
    zip.write_all(b"hello").unwrap();
    zip.add_directory("Dir/", options).unwrap();
    zip.start_file("Dir/File.txt", options).unwrap();
    zip.write_all(b"mixed case").unwrap();
    zip.start_file("big/large.bin", options).unwrap();
    zip.write_all(&large_payload()).unwrap();
    zip.add_directory("empty/", options).unwrap();
    zip.finish().unwrap();
    path
}

fn create_tar_gz(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.tar.gz");
    let encoder = flate2::write::GzEncoder::new(
        File::create(&path).unwrap(),
        flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in [
        ("a/b/c.txt", &b"0123456789"[..]),
        ("a/d.txt", &b"hello"[..]),
        ("Dir/File.txt", &b"mixed case"[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

/// Wraps a provider, counting extractions and slowing them down so that
/// concurrent readers overlap.
struct CountingProvider {
    inner: Box<dyn ArchiveProvider>,
    extractions: Arc<AtomicUsize>,
    delay: Duration,
    fail_next: Arc<AtomicUsize>,
}

impl ArchiveProvider for CountingProvider {
    fn read_fs_tree(&self) -> avfs_archive::Result<FsTree> {
        self.inner.read_fs_tree()
    }

    fn extract_entry(
        &self,
        context: EntryContext,
        destination: &mut [u8],
    ) -> avfs_archive::Result<()> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(avfs_archive::Error::InvalidArchive("injected failure".into()));
        }
        self.inner.extract_entry(context, destination)
    }

    fn format(&self) -> ArchiveFormat {
        self.inner.format()
    }

    fn strategy(&self) -> HandleStrategy {
        self.inner.strategy()
    }
}

struct Fixture {
    _temp_dir: TempDir,
    fs: Arc<ArchiveFs>,
    extractions: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

fn mounted(delay: Duration) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let inner = open_archive(create_zip(temp_dir.path()), ProviderOptions::default()).unwrap();
    let extractions = Arc::new(AtomicUsize::new(0));
    let fail_next = Arc::new(AtomicUsize::new(0));
    let provider = CountingProvider {
        inner,
        extractions: Arc::clone(&extractions),
        delay,
        fail_next: Arc::clone(&fail_next),
    };

    let fs = ArchiveFs::new(Box::new(provider), MountConfig::default());
    fs.mount().unwrap();
    Fixture {
        _temp_dir: temp_dir,
        fs: Arc::new(fs),
        extractions,
        fail_next,
    }
}

fn read_all(fs: &ArchiveFs, path: &str) -> Vec<u8> {
    let info = fs.get_info(path, None).unwrap();
    let mut buf = vec![0u8; info.length as usize];
    let n = fs.read(path, None, 0, &mut buf).unwrap();
    assert_eq!(n, buf.len());
    buf
}

#[test]
fn sizes_are_aggregated_per_directory() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    assert_eq!(fs.get_info("/a", None).unwrap().length, 15);
    assert_eq!(fs.get_info("/a/b", None).unwrap().length, 10);
    assert_eq!(fs.get_info("/a/b/c.txt", None).unwrap().length, 10);
    assert_eq!(fs.get_info("/empty", None).unwrap().length, 0);

    let total = 10 + 5 + 10 + large_payload().len() as u64;
    assert_eq!(fs.get_info("/", None).unwrap().length, total);
    assert_eq!(fs.disk_space().unwrap().total_bytes, total);
    assert_eq!(fs.disk_space().unwrap().free_bytes, 0);
}

#[test]
fn lookup_is_case_insensitive() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let upper = fs.get_info("/Dir/File.txt", None).unwrap();
    let lower = fs.get_info("/dir/file.TXT", None).unwrap();
    assert_eq!(upper.node, lower.node);
    assert_eq!(upper.name, "File.txt");
    assert_eq!(read_all(fs, "\\DIR\\FILE.TXT"), b"mixed case");
}

#[test]
fn read_dir_lists_immediate_children() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let children = fs.read_dir("/a", None).unwrap();
    let listing: Vec<(&str, bool)> = children
        .iter()
        .map(|info| (info.name.as_str(), info.is_directory))
        .collect();
    assert_eq!(listing, vec![("b", true), ("d.txt", false)]);

    assert!(fs.read_dir("/empty", None).unwrap().is_empty());
    assert!(matches!(
        fs.read_dir("/a/d.txt", None),
        Err(FsError::NotADirectory(_))
    ));
    assert!(matches!(
        fs.read_dir("/missing", None),
        Err(FsError::PathNotFound(_))
    ));
}

#[test]
fn reads_respect_offset_and_eof() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let mut buf = [0u8; 4];
    assert_eq!(fs.read("/a/b/c.txt", None, 3, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"3456");
    assert_eq!(fs.read("/a/b/c.txt", None, 8, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"89");
    assert_eq!(fs.read("/a/b/c.txt", None, 10, &mut buf).unwrap(), 0);
    assert_eq!(fs.read("/a/b/c.txt", None, u64::MAX, &mut buf).unwrap(), 0);

    assert!(matches!(
        fs.read("/a/b", None, 0, &mut buf),
        Err(FsError::IsADirectory(_))
    ));
    assert!(matches!(
        fs.read("/a/b/c.txt/x", None, 0, &mut buf),
        Err(FsError::PathNotFound(_))
    ));
}

#[test]
fn repeated_reads_extract_once() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let first = read_all(fs, "/a/d.txt");
    let second = read_all(fs, "/A/D.TXT");
    assert_eq!(first, b"hello");
    assert_eq!(first, second);
    assert_eq!(fixture.extractions.load(Ordering::SeqCst), 1);
    assert_eq!(fs.resident_bytes().unwrap(), 5);
}

#[test]
fn concurrent_readers_share_one_extraction() {
    let fixture = mounted(Duration::from_millis(200));
    let barrier = Arc::new(Barrier::new(8));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fixture.fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                read_all(&fs, "/big/large.bin")
            })
        })
        .collect();

    let expected = large_payload();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), expected);
    }
    assert_eq!(fixture.extractions.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_extraction_is_retried() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;
    fixture.fail_next.store(1, Ordering::SeqCst);

    let mut buf = [0u8; 5];
    let err = fs.read("/a/d.txt", None, 0, &mut buf).unwrap_err();
    assert!(matches!(err, FsError::ExtractionFailed { .. }));
    assert_eq!(fs.resident_bytes().unwrap(), 0);

    assert_eq!(fs.read("/a/d.txt", None, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(fixture.extractions.load(Ordering::SeqCst), 2);
}

#[test]
fn mutations_are_denied_and_leave_tree_unchanged() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;
    let before = fs.get_info("/", None).unwrap();

    let denied = |result: Result<(), FsError>| matches!(result, Err(FsError::AccessDenied(_)));
    assert!(denied(fs.write("/a/d.txt", None, 0, b"x").map(|_| ())));
    assert!(denied(fs.delete_file("/a/d.txt")));
    assert!(denied(fs.delete_directory("/a")));
    assert!(denied(fs.rename("/a/d.txt", "/a/e.txt", false)));
    assert!(denied(fs.set_attributes("/a/d.txt", 0)));
    assert!(denied(fs.set_times("/a/d.txt", None, None, None)));
    assert!(denied(fs.set_len("/a/d.txt", 0)));
    assert!(denied(fs.lock("/a/d.txt", 0, 1)));
    assert!(denied(fs.unlock("/a/d.txt", 0, 1)));

    assert_eq!(fs.get_info("/", None).unwrap(), before);
    assert_eq!(read_all(fs, "/a/d.txt"), b"hello");
    assert!(fs.get_info("/a/e.txt", None).is_err());
}

#[test]
fn open_refuses_writable_access() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let handle = fs.open("/a/d.txt", OpenOptions::read_only()).unwrap();
    assert!(!handle.is_directory);
    assert!(fs.open("/a", OpenOptions::read_only()).unwrap().is_directory);

    for options in [
        OpenOptions { write: true, ..OpenOptions::read_only() },
        OpenOptions { append: true, ..OpenOptions::read_only() },
        OpenOptions { truncate: true, ..OpenOptions::read_only() },
        OpenOptions { create_new: true, ..OpenOptions::default() },
    ] {
        assert!(matches!(
            fs.open("/a/d.txt", options),
            Err(FsError::AccessDenied(_))
        ));
    }

    // Open-or-create succeeds on an existing path but cannot create.
    let create = OpenOptions { create: true, ..OpenOptions::read_only() };
    assert!(fs.open("/a/d.txt", create).is_ok());
    assert!(matches!(
        fs.open("/a/new.txt", create),
        Err(FsError::AccessDenied(_))
    ));
    assert!(matches!(
        fs.open("/a/new.txt", OpenOptions::read_only()),
        Err(FsError::PathNotFound(_))
    ));
}

#[test]
fn handles_resolve_without_path_and_expire_on_remount() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let handle = fs.open("/a/b/c.txt", OpenOptions::read_only()).unwrap();
    let mut buf = [0u8; 10];
    // The handle wins over the path it is passed with.
    assert_eq!(fs.read("ignored", Some(&handle), 0, &mut buf).unwrap(), 10);
    assert_eq!(fs.read_handle(&handle, 0, &mut buf).unwrap(), 10);
    fs.close(&handle);

    fs.mount().unwrap();
    assert!(matches!(
        fs.read("/a/b/c.txt", Some(&handle), 0, &mut buf),
        Err(FsError::InvalidHandle)
    ));
    assert_eq!(fs.resident_bytes().unwrap(), 0);

    let fresh = fs.open("/a/b/c.txt", OpenOptions::read_only()).unwrap();
    assert!(fresh.generation() > handle.generation());

    assert!(fs.unmount());
    assert!(!fs.is_mounted());
    assert!(matches!(
        fs.read_handle(&fresh, 0, &mut buf),
        Err(FsError::NotMounted)
    ));
    assert!(matches!(fs.disk_space(), Err(FsError::NotMounted)));
    assert!(!fs.unmount());
}

#[test]
fn node_operations_walk_the_tree() {
    let fixture = mounted(Duration::ZERO);
    let fs = &fixture.fs;

    let root = fs.get_info("/", None).unwrap();
    let a = fs.lookup(root.node, "A").unwrap();
    assert!(a.is_directory);
    let d = fs.lookup(a.node, "d.txt").unwrap();
    assert_eq!(fs.parent_of(d.node).unwrap(), Some(a.node));
    assert_eq!(fs.parent_of(root.node).unwrap(), None);
    assert_eq!(fs.node_path(d.node).unwrap(), "/a/d.txt");

    let mut buf = [0u8; 5];
    assert_eq!(fs.read_node(d.node, 0, &mut buf).unwrap(), 5);
    assert_eq!(fs.read_dir_node(a.node).unwrap().len(), 2);
    assert!(matches!(
        fs.lookup(d.node, "x"),
        Err(FsError::NotADirectory(_))
    ));
    assert!(matches!(
        fs.lookup(a.node, "zzz"),
        Err(FsError::PathNotFound(_))
    ));
}

#[test]
fn volume_information() {
    let fixture = mounted(Duration::ZERO);
    let volume = fixture.fs.volume_info();

    assert_eq!(volume.label, "AVFS");
    assert_eq!(volume.file_system_name, avfs_fs::FILE_SYSTEM_NAME);
    assert!(volume.read_only);
    assert!(volume.compressed);
    assert!(!volume.case_sensitive);
    assert_eq!(volume.max_component_length, 255);
}

#[test]
fn missing_timestamps_use_process_default() {
    let temp_dir = TempDir::new().unwrap();
    let fs = ArchiveFs::from_path(
        create_tar_gz(temp_dir.path()),
        ProviderOptions::default(),
        MountConfig::default(),
    )
    .unwrap();
    fs.mount().unwrap();

    // Implicit directories carry no timestamps at all.
    let a = fs.get_info("/a", None).unwrap();
    assert_eq!(a.created, avfs_fs::default_timestamp());
    assert_eq!(a.modified, avfs_fs::default_timestamp());
    assert_eq!(fs.format(), ArchiveFormat::TarGzip);
    assert_eq!(read_all(&fs, "/dir/file.txt"), b"mixed case");
}

#[test]
fn unsupported_archive_fails_before_mount() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("plain.txt");
    File::create(&path).unwrap().write_all(b"nothing here").unwrap();

    let err = ArchiveFs::from_path(&path, ProviderOptions::default(), MountConfig::default())
        .unwrap_err();
    assert!(matches!(err, FsError::ProviderInit(_)));
}
