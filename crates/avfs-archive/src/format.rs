use crate::handles::HandleStrategy;
use crate::provider::{ArchiveProvider, CodecProvider};
use crate::sevenz_codec::SevenZipCodec;
use crate::tar_codec::TarCodec;
use crate::zip_codec::ZipCodec;
use crate::{Error, Result};
use log::info;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Container formats understood by avfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZip,
    Tar,
    TarGzip,
}

impl ArchiveFormat {
    /// Detect the format from the leading bytes of a file.
    pub fn from_signature(header: &[u8]) -> Option<Self> {
        const ZIP_SIGNATURES: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
        const SEVEN_ZIP_SIGNATURE: &[u8] = &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

        if ZIP_SIGNATURES.iter().any(|sig| header.starts_with(sig)) {
            Some(ArchiveFormat::Zip)
        } else if header.starts_with(SEVEN_ZIP_SIGNATURE) {
            Some(ArchiveFormat::SevenZip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGzip)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// The strategy used when the caller does not choose one.
    ///
    /// Gzip streams and solid 7z blocks can only be decoded forwards, so
    /// each thread keeps its own warm decoder; seekable containers share a
    /// pool.
    pub fn default_strategy(self) -> HandleStrategy {
        match self {
            ArchiveFormat::Zip | ArchiveFormat::Tar => HandleStrategy::pooled_default(),
            ArchiveFormat::SevenZip | ArchiveFormat::TarGzip => HandleStrategy::PerThread,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::Zip => write!(f, "zip"),
            ArchiveFormat::SevenZip => write!(f, "7z"),
            ArchiveFormat::Tar => write!(f, "tar"),
            ArchiveFormat::TarGzip => write!(f, "tar.gz"),
        }
    }
}

/// Detect the format of the archive at `path`.
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<ArchiveFormat> {
    let path = path.as_ref();
    let mut header = Vec::with_capacity(512);
    File::open(path)?.take(512).read_to_end(&mut header)?;

    ArchiveFormat::from_signature(&header)
        .ok_or_else(|| Error::UnsupportedFormat(path.display().to_string()))
}

/// Options for opening an archive provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderOptions {
    /// Override the format's default handle strategy.
    pub strategy: Option<HandleStrategy>,
}

/// Open the archive at `path` with the provider matching its format.
///
/// The container index is read here, so a corrupt or unsupported archive
/// fails before anything is mounted.
pub fn open_archive<P: AsRef<Path>>(
    path: P,
    options: ProviderOptions,
) -> Result<Box<dyn ArchiveProvider>> {
    let path = path.as_ref();
    let format = detect_format(path)?;
    let strategy = options
        .strategy
        .unwrap_or_else(|| format.default_strategy());

    info!(
        "Opening {} archive {} with {} handles",
        format,
        path.display(),
        strategy
    );

    let provider: Box<dyn ArchiveProvider> = match format {
        ArchiveFormat::Zip => Box::new(CodecProvider::new(ZipCodec::open(path)?, strategy)),
        ArchiveFormat::SevenZip => {
            Box::new(CodecProvider::new(SevenZipCodec::open(path)?, strategy))
        }
        ArchiveFormat::Tar | ArchiveFormat::TarGzip => {
            Box::new(CodecProvider::new(TarCodec::open(path, format)?, strategy))
        }
    };
    Ok(provider)
}
