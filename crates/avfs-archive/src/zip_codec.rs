use crate::format::ArchiveFormat;
use crate::provider::{fill_exact, Codec};
use crate::tree::{EntryContext, EntryMeta, EntryTimes, FsTreeBuilder};
use crate::zip64::CentralIndex;
use crate::{Error, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use log::{debug, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zip::read::ZipFile;
use zip::{DateTime, ExtraField, ZipArchive};

/// 100ns ticks between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

/// DOS timestamps carry no zone; they are read as UTC.
fn dos_time(dt: DateTime) -> Option<SystemTime> {
    let date = NaiveDate::from_ymd_opt(
        i32::from(dt.year()),
        u32::from(dt.month()),
        u32::from(dt.day()),
    )?;
    let naive = date.and_hms_opt(
        u32::from(dt.hour()),
        u32::from(dt.minute()),
        u32::from(dt.second()),
    )?;
    Some(Utc.from_utc_datetime(&naive).into())
}

fn unix_time(secs: u32) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(u64::from(secs)))
}

fn filetime(ticks: u64) -> Option<SystemTime> {
    if ticks == 0 {
        return None;
    }
    let since_epoch = ticks.checked_sub(FILETIME_UNIX_OFFSET)?;
    UNIX_EPOCH.checked_add(Duration::from_nanos(since_epoch.saturating_mul(100)))
}

/// Entry times, most precise source last: DOS, extended timestamp, NTFS.
fn entry_times(entry: &ZipFile<'_>) -> EntryTimes {
    let mut times = EntryTimes::modified(entry.last_modified().and_then(dos_time));
    for field in entry.extra_data_fields() {
        match field {
            ExtraField::ExtendedTimestamp(ts) => {
                if let Some(t) = ts.mod_time().and_then(unix_time) {
                    times.modified = Some(t);
                }
                if let Some(t) = ts.ac_time().and_then(unix_time) {
                    times.accessed = Some(t);
                }
                if let Some(t) = ts.cr_time().and_then(unix_time) {
                    times.created = Some(t);
                }
            }
            ExtraField::Ntfs(ntfs) => {
                if let Some(t) = filetime(ntfs.mtime()) {
                    times.modified = Some(t);
                }
                if let Some(t) = filetime(ntfs.atime()) {
                    times.accessed = Some(t);
                }
                if let Some(t) = filetime(ntfs.ctime()) {
                    times.created = Some(t);
                }
            }
        }
    }
    times
}

/// ZIP codec. The entry context is the entry's index in the central directory.
#[derive(Debug)]
pub struct ZipCodec {
    path: PathBuf,
    index: CentralIndex,
}

impl ZipCodec {
    /// Open the ZIP file at `path` and read its central directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Fail early if the zip reader cannot make sense of the container.
        let archive = ZipArchive::new(BufReader::new(File::open(&path)?))?;
        debug!("{} lists {} entries", path.display(), archive.len());

        let index = match CentralIndex::read(&mut File::open(&path)?) {
            Ok(index) => {
                if index.zip64_count() > 0 {
                    debug!("{} entries need ZIP64 sizes", index.zip64_count());
                }
                index
            }
            Err(e) => {
                warn!(
                    "Could not index central directory of {}: {}",
                    path.display(),
                    e
                );
                CentralIndex::default()
            }
        };

        Ok(Self { path, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn central_index(&self) -> &CentralIndex {
        &self.index
    }
}

impl Codec for ZipCodec {
    type Handle = ZipArchive<BufReader<File>>;

    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn open_handle(&self) -> Result<Self::Handle> {
        debug!("Opening zip handle on {}", self.path.display());
        Ok(ZipArchive::new(BufReader::new(File::open(&self.path)?))?)
    }

    fn read_entries(&self, builder: &mut FsTreeBuilder) -> Result<()> {
        let mut archive = self.open_handle()?;
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            let name = entry.name().to_string();
            let is_directory = entry.is_dir();
            let (length, compressed_length) =
                self.index
                    .reconcile(entry.name_raw(), entry.size(), entry.compressed_size());

            builder.insert_entry(
                &name,
                is_directory,
                EntryMeta {
                    length: if is_directory { 0 } else { length },
                    compressed_length: if is_directory { 0 } else { compressed_length },
                    times: entry_times(&entry),
                    context: EntryContext::new(i as u64),
                },
            );
        }
        Ok(())
    }

    fn extract(
        &self,
        handle: &mut Self::Handle,
        context: EntryContext,
        destination: &mut [u8],
    ) -> Result<()> {
        let index = usize::try_from(context.raw())
            .ok()
            .filter(|&i| i < handle.len())
            .ok_or(Error::InvalidContext(context.raw()))?;

        let entry = handle.by_index(index)?;
        fill_exact(entry, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use zip::write::{FileOptions, ZipWriter};

    fn fixture() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let mut zip = ZipWriter::new(file.reopen().unwrap());
        let options: FileOptions<()> =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        zip.add_directory("docs/", options).unwrap();
        zip.start_file("docs/readme.txt", options).unwrap();
        zip.write_all(b"read me").unwrap();
        zip.start_file("empty.bin", options).unwrap();
        zip.finish().unwrap();
        file
    }

    #[test]
    fn test_index_matches_zip_reader() {
        let file = fixture();
        let codec = ZipCodec::open(file.path()).unwrap();

        let index = codec.central_index();
        assert_eq!(index.len(), 3);
        let readme = index.get(b"docs/readme.txt").unwrap();
        assert_eq!(readme.size, 7);
        assert!(!readme.needs_zip64);
    }

    #[test]
    fn test_extract_by_context() {
        let file = fixture();
        let codec = ZipCodec::open(file.path()).unwrap();
        let mut handle = codec.open_handle().unwrap();

        let mut buf = [0u8; 7];
        codec
            .extract(&mut handle, EntryContext::new(1), &mut buf)
            .unwrap();
        assert_eq!(&buf, b"read me");

        let err = codec
            .extract(&mut handle, EntryContext::new(99), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidContext(99)));
    }

    #[test]
    fn test_wrong_destination_length() {
        let file = fixture();
        let codec = ZipCodec::open(file.path()).unwrap();
        let mut handle = codec.open_handle().unwrap();

        let mut buf = [0u8; 3];
        let err = codec
            .extract(&mut handle, EntryContext::new(1), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 3, .. }));
    }

    /// A stored zip written by hand: general purpose flag 0, so names are
    /// CP437, all stamped 2021-06-15 12:30:20 in DOS format.
    fn cp437_fixture(names: &[&[u8]]) -> NamedTempFile {
        let dos_time: u16 = (12 << 11) | (30 << 5) | (20 / 2);
        let dos_date: u16 = ((2021 - 1980) << 9) | (6 << 5) | 15;

        let header = |sig: u32, name: &[u8], central: bool, offset: u32| {
            let mut buf = sig.to_le_bytes().to_vec();
            if central {
                buf.extend_from_slice(&20u16.to_le_bytes()); // version made by
            }
            buf.extend_from_slice(&20u16.to_le_bytes()); // version needed
            buf.extend_from_slice(&0u16.to_le_bytes()); // flags
            buf.extend_from_slice(&0u16.to_le_bytes()); // stored
            buf.extend_from_slice(&dos_time.to_le_bytes());
            buf.extend_from_slice(&dos_date.to_le_bytes());
            buf.extend_from_slice(&[0u8; 12]); // crc and sizes of an empty file
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes()); // extra
            if central {
                buf.extend_from_slice(&[0u8; 10]); // comment, disk, attributes
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            buf.extend_from_slice(name);
            buf
        };

        let mut bytes = Vec::new();
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(bytes.len() as u32);
            bytes.extend(header(0x0403_4b50, *name, false, 0));
        }
        let cd_offset = bytes.len() as u32;
        for (name, offset) in names.iter().zip(offsets) {
            bytes.extend(header(0x0201_4b50, *name, true, offset));
        }
        let cd_size = bytes.len() as u32 - cd_offset;
        bytes.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&(names.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(names.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&cd_size.to_le_bytes());
        bytes.extend_from_slice(&cd_offset.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file
    }

    #[test]
    fn test_cp437_names_keep_their_metadata() {
        let file = cp437_fixture(&[b"cafe.txt", b"caf\x82.txt"]);
        let codec = ZipCodec::open(file.path()).unwrap();
        assert!(codec.central_index().get(b"caf\x82.txt").is_some());

        let mut builder = FsTreeBuilder::new();
        codec.read_entries(&mut builder).unwrap();
        let tree = builder.finish();

        let expected = Utc
            .with_ymd_and_hms(2021, 6, 15, 12, 30, 20)
            .single()
            .map(SystemTime::from);
        for path in ["cafe.txt", "café.txt"] {
            let id = tree.lookup(path).unwrap();
            let node = tree.node(id).unwrap();
            assert_eq!(node.times().modified, expected, "{}", path);
        }
        let accented = tree.node(tree.lookup("café.txt").unwrap()).unwrap();
        assert_eq!(accented.name(), "café.txt");
    }

    #[test]
    fn test_times_from_zip_writer() {
        let file = fixture();
        let codec = ZipCodec::open(file.path()).unwrap();
        let mut builder = FsTreeBuilder::new();
        codec.read_entries(&mut builder).unwrap();
        let tree = builder.finish();

        let readme = tree.node(tree.lookup("docs/readme.txt").unwrap()).unwrap();
        assert!(readme.times().modified.is_some());
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(filetime(0), None);
        assert_eq!(filetime(FILETIME_UNIX_OFFSET), Some(UNIX_EPOCH));
        assert_eq!(
            filetime(FILETIME_UNIX_OFFSET + 10_000_000),
            Some(UNIX_EPOCH + Duration::from_secs(1))
        );
        // Before 1970 is not representable here.
        assert_eq!(filetime(1), None);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"PK\x03\x04 but not really a zip").unwrap();
        assert!(ZipCodec::open(file.path()).is_err());
    }
}
