use crate::format::ArchiveFormat;
use crate::provider::{fill_exact, Codec};
use crate::tree::{EntryContext, EntryMeta, EntryTimes, FsTreeBuilder};
use crate::{Error, Result};
use flate2::read::GzDecoder;
use log::{debug, trace};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tar::{Archive, EntryType, Header};

/// One indexed tar member.
#[derive(Debug, Clone)]
struct TarMember {
    path: String,
    is_directory: bool,
    /// Offset of the member's data in the (decompressed) tar stream.
    offset: u64,
    size: u64,
    times: EntryTimes,
}

/// Codec for plain and gzip-compressed tar archives.
///
/// Tar has no central index, so the whole stream is scanned once when the
/// codec is opened. The entry context is the member's position in that scan.
#[derive(Debug)]
pub struct TarCodec {
    path: PathBuf,
    format: ArchiveFormat,
    members: Vec<TarMember>,
}

/// Decoder state for one tar handle.
pub enum TarHandle {
    /// Uncompressed tar: any member is one seek away.
    Plain(File),
    /// Gzip stream, positioned `position` bytes into the decompressed tar.
    /// Moving backwards means decoding again from the start.
    Gzip {
        decoder: GzDecoder<BufReader<File>>,
        position: u64,
    },
}

fn gzip_decoder(path: &Path) -> Result<GzDecoder<BufReader<File>>> {
    Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
}

fn header_times(header: &Header) -> EntryTimes {
    let at = |secs: u64| UNIX_EPOCH.checked_add(Duration::from_secs(secs));
    let mut times = EntryTimes::modified(header.mtime().ok().and_then(at));
    if let Some(gnu) = header.as_gnu() {
        times.accessed = gnu.atime().ok().filter(|&secs| secs > 0).and_then(at);
    }
    times
}

fn scan<R: Read>(reader: R) -> Result<Vec<TarMember>> {
    let mut archive = Archive::new(reader);
    let mut members = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        let kind = entry.header().entry_type();
        let is_directory = match kind {
            EntryType::Directory => true,
            EntryType::Regular | EntryType::Continuous => false,
            other => {
                debug!("Skipping tar member of type {:?}", other);
                continue;
            }
        };

        let path = entry.path()?.to_string_lossy().into_owned();
        trace!("tar member {} at {}", path, entry.raw_file_position());
        members.push(TarMember {
            path,
            is_directory,
            offset: entry.raw_file_position(),
            size: if is_directory { 0 } else { entry.size() },
            times: header_times(entry.header()),
        });
    }
    Ok(members)
}

impl TarCodec {
    /// Open and index the tar archive at `path`.
    pub fn open<P: AsRef<Path>>(path: P, format: ArchiveFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let members = match format {
            ArchiveFormat::Tar => scan(BufReader::new(File::open(&path)?))?,
            ArchiveFormat::TarGzip => scan(gzip_decoder(&path)?)?,
            ArchiveFormat::Zip | ArchiveFormat::SevenZip => {
                return Err(Error::UnsupportedFormat(format!(
                    "{} is not a tar archive",
                    path.display()
                )))
            }
        };

        debug!("Indexed {} members of {}", members.len(), path.display());
        Ok(Self {
            path,
            format,
            members,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of indexed members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl Codec for TarCodec {
    type Handle = TarHandle;

    fn format(&self) -> ArchiveFormat {
        self.format
    }

    fn open_handle(&self) -> Result<TarHandle> {
        debug!("Opening {} handle on {}", self.format, self.path.display());
        match self.format {
            ArchiveFormat::TarGzip => Ok(TarHandle::Gzip {
                decoder: gzip_decoder(&self.path)?,
                position: 0,
            }),
            _ => Ok(TarHandle::Plain(File::open(&self.path)?)),
        }
    }

    fn read_entries(&self, builder: &mut FsTreeBuilder) -> Result<()> {
        for (i, member) in self.members.iter().enumerate() {
            builder.insert_entry(
                &member.path,
                member.is_directory,
                EntryMeta {
                    length: member.size,
                    compressed_length: member.size,
                    times: member.times,
                    context: EntryContext::new(i as u64),
                },
            );
        }
        Ok(())
    }

    fn extract(
        &self,
        handle: &mut TarHandle,
        context: EntryContext,
        destination: &mut [u8],
    ) -> Result<()> {
        let member = usize::try_from(context.raw())
            .ok()
            .and_then(|i| self.members.get(i))
            .filter(|member| !member.is_directory)
            .ok_or(Error::InvalidContext(context.raw()))?;

        match handle {
            TarHandle::Plain(file) => {
                file.seek(SeekFrom::Start(member.offset))?;
                fill_exact(file.by_ref().take(member.size), destination)
            }
            TarHandle::Gzip { decoder, position } => {
                if *position > member.offset {
                    debug!(
                        "Rewinding gzip stream from {} to {} for {}",
                        position, member.offset, member.path
                    );
                    *decoder = gzip_decoder(&self.path)?;
                    *position = 0;
                }

                let gap = member.offset - *position;
                let skipped = io::copy(&mut decoder.by_ref().take(gap), &mut io::sink())?;
                *position += skipped;
                if skipped < gap {
                    return Err(Error::InvalidArchive(format!(
                        "gzip stream ended before {}",
                        member.path
                    )));
                }

                fill_exact(decoder.by_ref().take(member.size), destination)?;
                *position += member.size;
                Ok(())
            }
        }
    }
}
