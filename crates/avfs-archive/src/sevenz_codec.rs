use crate::format::ArchiveFormat;
use crate::provider::{fill_exact, Codec};
use crate::tree::{EntryContext, EntryMeta, EntryTimes, FsTreeBuilder};
use crate::{Error, Result};
use log::{debug, trace};
use sevenz_rust::{Password, SevenZReader};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

fn sevenz_error(err: sevenz_rust::Error) -> Error {
    Error::SevenZip(err.to_string())
}

/// One file record from the archive header.
#[derive(Debug, Clone)]
struct SevenZipMember {
    name: String,
    is_directory: bool,
    size: u64,
    /// Earlier records carrying the same name.
    occurrence: usize,
}

/// Codec for 7z archives.
///
/// Entries in a solid block can only be reached by decoding everything
/// before them, so extraction walks the archive in order and skips to the
/// target. The entry context is the record's position in the header.
#[derive(Debug)]
pub struct SevenZipCodec {
    path: PathBuf,
    members: Vec<SevenZipMember>,
}

impl SevenZipCodec {
    /// Open the 7z file at `path` and read its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = SevenZReader::open(&path, Password::empty()).map_err(sevenz_error)?;

        let mut members: Vec<SevenZipMember> = Vec::new();
        for file in &reader.archive().files {
            let occurrence = members.iter().filter(|m| m.name == file.name).count();
            members.push(SevenZipMember {
                name: file.name.clone(),
                is_directory: file.is_directory,
                size: file.size,
                occurrence,
            });
        }

        debug!("{} lists {} entries", path.display(), members.len());
        Ok(Self { path, members })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Codec for SevenZipCodec {
    type Handle = SevenZReader<File>;

    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::SevenZip
    }

    fn open_handle(&self) -> Result<Self::Handle> {
        debug!("Opening 7z handle on {}", self.path.display());
        SevenZReader::open(&self.path, Password::empty()).map_err(sevenz_error)
    }

    fn read_entries(&self, builder: &mut FsTreeBuilder) -> Result<()> {
        // 7z records one size per entry; it is reported for both lengths.
        for (i, member) in self.members.iter().enumerate() {
            builder.insert_entry(
                &member.name,
                member.is_directory,
                EntryMeta {
                    length: member.size,
                    compressed_length: member.size,
                    times: EntryTimes::default(),
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
        let target = usize::try_from(context.raw())
            .ok()
            .and_then(|i| self.members.get(i))
            .filter(|member| !member.is_directory)
            .ok_or(Error::InvalidContext(context.raw()))?;

        let mut seen = 0;
        let mut outcome: Option<Result<()>> = None;
        handle
            .for_each_entries(|entry, reader| {
                if entry.name != target.name {
                    trace!("Skipping 7z entry {}", entry.name);
                    io::copy(reader, &mut io::sink())?;
                    return Ok(true);
                }
                if seen < target.occurrence {
                    seen += 1;
                    io::copy(reader, &mut io::sink())?;
                    return Ok(true);
                }
                outcome = Some(fill_exact(reader, &mut *destination));
                Ok(false)
            })
            .map_err(sevenz_error)?;

        outcome.unwrap_or_else(|| {
            Err(Error::InvalidArchive(format!(
                "{} not found while decoding",
                target.name
            )))
        })
    }
}
