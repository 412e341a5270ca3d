//! Secondary pass over a ZIP central directory.
//!
//! Central-directory records store sizes in 32-bit fields. An entry that does
//! not fit sets the field to `0xFFFFFFFF` and carries the real value in the
//! ZIP64 extended-information extra field. This module reads the raw records
//! independently of the main zip reader, so the sizes of such entries can be
//! checked against a second source before they go into the tree.
//!
//! Records are keyed by their raw name bytes, which is what the zip reader
//! exposes as `name_raw()` whatever encoding it decoded the name with.

use crate::{Error, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;

const EOCD_LEN: u64 = 22;
const ZIP64_LOCATOR_LEN: u64 = 20;
const ZIP64_EOCD_LEN: usize = 56;
const CENTRAL_HEADER_LEN: usize = 46;
const MAX_COMMENT_LEN: u64 = 0xFFFF;

const SATURATED_U32: u32 = 0xFFFF_FFFF;
const SATURATED_U16: u16 = 0xFFFF;

const EXTRA_ZIP64: u16 = 0x0001;

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    bytes.try_into().ok().map(u32::from_le_bytes)
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    bytes.try_into().ok().map(u64::from_le_bytes)
}

/// Sizes of one central-directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralRecord {
    pub size: u64,
    pub compressed_size: u64,
    /// Sizes were saturated in the 32-bit fields and re-derived from the
    /// ZIP64 extra field.
    pub needs_zip64: bool,
}

/// Index of the raw central directory, keyed by raw entry name.
#[derive(Debug, Default)]
pub struct CentralIndex {
    records: HashMap<Vec<u8>, CentralRecord>,
}

impl CentralIndex {
    /// Read the central directory of the ZIP file behind `reader`.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        let (eocd_pos, eocd) = find_eocd(reader, file_len)?;

        let mut entries = u64::from(read_u16(&eocd, 10).unwrap_or(0));
        let mut cd_size = u64::from(read_u32(&eocd, 12).unwrap_or(0));
        let mut cd_offset = u64::from(read_u32(&eocd, 16).unwrap_or(0));
        let is_zip64 = entries == u64::from(SATURATED_U16)
            || cd_size == u64::from(SATURATED_U32)
            || cd_offset == u64::from(SATURATED_U32);

        if is_zip64 {
            (entries, cd_size, cd_offset) = read_zip64_eocd(reader, eocd_pos)?;
        } else if cd_offset + cd_size != eocd_pos && cd_size <= eocd_pos {
            // Data prepended to the archive shifts every offset.
            debug!(
                "Central directory offset {} adjusted to {}",
                cd_offset,
                eocd_pos - cd_size
            );
            cd_offset = eocd_pos - cd_size;
        }

        if cd_offset.checked_add(cd_size).map_or(true, |end| end > file_len) {
            return Err(Error::InvalidArchive(format!(
                "central directory ({} bytes at {}) exceeds file length {}",
                cd_size, cd_offset, file_len
            )));
        }

        let mut directory = vec![0u8; cd_size as usize];
        reader.seek(SeekFrom::Start(cd_offset))?;
        reader.read_exact(&mut directory)?;

        let index = Self::parse(&directory);
        if index.records.len() as u64 != entries {
            debug!(
                "Central directory lists {} entries, parsed {} distinct names",
                entries,
                index.records.len()
            );
        }
        Ok(index)
    }

    /// Parse a raw central directory. Parsing stops at the first malformed
    /// or truncated record.
    pub fn parse(directory: &[u8]) -> Self {
        let mut records = HashMap::new();
        let mut pos = 0;
        while pos < directory.len() {
            match parse_record(&directory[pos..]) {
                Some((name, record, consumed)) => {
                    records.insert(name, record);
                    pos += consumed;
                }
                None => {
                    warn!("Stopped reading central directory at byte {}", pos);
                    break;
                }
            }
        }
        Self { records }
    }

    pub fn get(&self, raw_name: &[u8]) -> Option<&CentralRecord> {
        self.records.get(raw_name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records whose sizes needed the ZIP64 extra field.
    pub fn zip64_count(&self) -> usize {
        self.records.values().filter(|r| r.needs_zip64).count()
    }

    /// Validate the sizes another reader reported for the entry named
    /// `raw_name`.
    ///
    /// For ZIP64 entries the sizes from this index win when the two disagree.
    pub fn reconcile(&self, raw_name: &[u8], size: u64, compressed_size: u64) -> (u64, u64) {
        match self.records.get(raw_name) {
            Some(record)
                if record.needs_zip64
                    && (record.size, record.compressed_size) != (size, compressed_size) =>
            {
                warn!(
                    "ZIP64 mitigation: {} listed as {}/{} bytes, central directory says {}/{}",
                    String::from_utf8_lossy(raw_name),
                    size,
                    compressed_size,
                    record.size,
                    record.compressed_size
                );
                (record.size, record.compressed_size)
            }
            _ => (size, compressed_size),
        }
    }
}

/// Locate the end-of-central-directory record. Returns its absolute offset
/// and the bytes from there to the end of the file.
fn find_eocd<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<(u64, Vec<u8>)> {
    if file_len < EOCD_LEN {
        return Err(Error::InvalidArchive("file too short for a zip archive".into()));
    }
    let tail_len = file_len.min(EOCD_LEN + MAX_COMMENT_LEN);
    let tail_start = file_len - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    reader.seek(SeekFrom::Start(tail_start))?;
    reader.read_exact(&mut tail)?;

    let last = tail.len() - EOCD_LEN as usize;
    (0..=last)
        .rev()
        .find(|&pos| read_u32(&tail, pos) == Some(EOCD_SIG))
        .map(|pos| (tail_start + pos as u64, tail.split_off(pos)))
        .ok_or_else(|| Error::InvalidArchive("end of central directory not found".into()))
}

/// Read `(entries, cd_size, cd_offset)` from the ZIP64 end-of-central-directory.
fn read_zip64_eocd<R: Read + Seek>(reader: &mut R, eocd_pos: u64) -> Result<(u64, u64, u64)> {
    let locator_pos = eocd_pos
        .checked_sub(ZIP64_LOCATOR_LEN)
        .ok_or_else(|| Error::InvalidArchive("missing ZIP64 locator".into()))?;
    let mut locator = [0u8; ZIP64_LOCATOR_LEN as usize];
    reader.seek(SeekFrom::Start(locator_pos))?;
    reader.read_exact(&mut locator)?;
    if read_u32(&locator, 0) != Some(ZIP64_LOCATOR_SIG) {
        return Err(Error::InvalidArchive("bad ZIP64 locator signature".into()));
    }
    let record_pos = read_u64(&locator, 8).unwrap_or(0);

    let mut record = [0u8; ZIP64_EOCD_LEN];
    reader.seek(SeekFrom::Start(record_pos))?;
    reader.read_exact(&mut record)?;
    if read_u32(&record, 0) != Some(ZIP64_EOCD_SIG) {
        return Err(Error::InvalidArchive("bad ZIP64 end of central directory".into()));
    }

    let field = |at| {
        read_u64(&record, at)
            .ok_or_else(|| Error::InvalidArchive("truncated ZIP64 end of central directory".into()))
    };
    Ok((field(32)?, field(40)?, field(48)?))
}

/// Parse one central-directory record. Returns the raw name, the record and
/// the record's length.
fn parse_record(buf: &[u8]) -> Option<(Vec<u8>, CentralRecord, usize)> {
    if read_u32(buf, 0)? != CENTRAL_HEADER_SIG {
        return None;
    }
    let compressed32 = read_u32(buf, 20)?;
    let size32 = read_u32(buf, 24)?;
    let name_len = usize::from(read_u16(buf, 28)?);
    let extra_len = usize::from(read_u16(buf, 30)?);
    let comment_len = usize::from(read_u16(buf, 32)?);
    let offset32 = read_u32(buf, 42)?;

    let name_end = CENTRAL_HEADER_LEN + name_len;
    let extra_end = name_end + extra_len;
    let total = extra_end + comment_len;
    let name = buf.get(CENTRAL_HEADER_LEN..name_end)?.to_vec();
    let extra = buf.get(name_end..extra_end)?;
    if buf.len() < total {
        return None;
    }

    let mut record = CentralRecord {
        size: u64::from(size32),
        compressed_size: u64::from(compressed32),
        needs_zip64: false,
    };

    let saturated = size32 == SATURATED_U32 || compressed32 == SATURATED_U32;
    if saturated {
        let zip64 = extra_fields(extra)
            .find(|(id, _)| *id == EXTRA_ZIP64)
            .and_then(|(_, data)| zip64_sizes(data, size32, compressed32, offset32));
        match zip64 {
            Some((size, compressed)) => {
                record.size = size.unwrap_or(record.size);
                record.compressed_size = compressed.unwrap_or(record.compressed_size);
                record.needs_zip64 = true;
            }
            None => warn!(
                "{} has saturated sizes but no ZIP64 extra field",
                String::from_utf8_lossy(&name)
            ),
        }
    }
    Some((name, record, total))
}

/// Values of the ZIP64 extra field. Only the saturated 32-bit fields are
/// present, in the order size, compressed size, local header offset.
fn zip64_sizes(
    data: &[u8],
    size32: u32,
    compressed32: u32,
    offset32: u32,
) -> Option<(Option<u64>, Option<u64>)> {
    let mut at = 0;
    let mut next = |saturated: bool| -> Option<Option<u64>> {
        if !saturated {
            return Some(None);
        }
        let value = read_u64(data, at)?;
        at += 8;
        Some(Some(value))
    };
    let size = next(size32 == SATURATED_U32)?;
    let compressed = next(compressed32 == SATURATED_U32)?;
    // The offset follows; a field too short to hold it is still usable.
    let _ = next(offset32 == SATURATED_U32);
    Some((size, compressed))
}

/// Iterate `(header id, data)` pairs of an extra-field block.
fn extra_fields(mut extra: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        let id = read_u16(extra, 0)?;
        let len = usize::from(read_u16(extra, 2)?);
        let data = extra.get(4..4 + len)?;
        extra = &extra[4 + len..];
        Some((id, data))
    })
}
