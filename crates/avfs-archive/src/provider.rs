use crate::format::ArchiveFormat;
use crate::handles::{HandleStrategy, Handles};
use crate::tree::{EntryContext, FsTree, FsTreeBuilder};
use crate::{Error, Result};
use log::info;
use std::io::{ErrorKind, Read};

/// Supplies the directory tree of one archive and extracts its entries.
///
/// Implementations must be callable from many threads at once; how they
/// share the underlying decoder is their own business.
pub trait ArchiveProvider: Send + Sync {
    /// Enumerate every entry and build the tree for a new mount.
    fn read_fs_tree(&self) -> Result<FsTree>;

    /// Decompress the entry named by `context` into `destination`, which is
    /// exactly the entry's uncompressed length.
    fn extract_entry(&self, context: EntryContext, destination: &mut [u8]) -> Result<()>;

    /// The container format being served.
    fn format(&self) -> ArchiveFormat;

    /// How codec handles are shared between extractions.
    fn strategy(&self) -> HandleStrategy;
}

/// A format-specific decoder.
///
/// A codec knows how to list entries and how to extract one entry through a
/// handle; it does not decide how handles are shared.
pub trait Codec: Send + Sync {
    /// Stateful decoder object.
    type Handle: Send + 'static;

    fn format(&self) -> ArchiveFormat;

    /// Open a fresh, independent decoder handle.
    fn open_handle(&self) -> Result<Self::Handle>;

    /// Insert every entry of the archive into `builder`.
    fn read_entries(&self, builder: &mut FsTreeBuilder) -> Result<()>;

    /// Extract one entry through `handle`.
    fn extract(
        &self,
        handle: &mut Self::Handle,
        context: EntryContext,
        destination: &mut [u8],
    ) -> Result<()>;
}

/// An [`ArchiveProvider`] built from a [`Codec`] and a handle strategy.
pub struct CodecProvider<C: Codec> {
    codec: C,
    handles: Handles<C::Handle>,
}

impl<C: Codec> CodecProvider<C> {
    pub fn new(codec: C, strategy: HandleStrategy) -> Self {
        Self {
            codec,
            handles: Handles::new(strategy),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Codec handles opened so far.
    pub fn handles_opened(&self) -> usize {
        self.handles.opened()
    }
}

impl<C: Codec> ArchiveProvider for CodecProvider<C> {
    fn read_fs_tree(&self) -> Result<FsTree> {
        let mut builder = FsTreeBuilder::new();
        self.codec.read_entries(&mut builder)?;
        let skipped = builder.skipped();
        let tree = builder.finish();

        info!(
            "Loaded {} files ({} bytes) from {} archive, {} entries skipped",
            tree.file_count(),
            tree.root().length(),
            self.codec.format(),
            skipped
        );
        Ok(tree)
    }

    fn extract_entry(&self, context: EntryContext, destination: &mut [u8]) -> Result<()> {
        self.handles.with_handle(
            || self.codec.open_handle(),
            |handle| self.codec.extract(handle, context, destination),
        )
    }

    fn format(&self) -> ArchiveFormat {
        self.codec.format()
    }

    fn strategy(&self) -> HandleStrategy {
        self.handles.strategy()
    }
}

/// Read exactly `destination.len()` bytes from `reader` and check that the
/// entry ends there.
pub(crate) fn fill_exact<R: Read>(mut reader: R, destination: &mut [u8]) -> Result<()> {
    let expected = destination.len() as u64;
    let mut filled = 0;
    while filled < destination.len() {
        match reader.read(&mut destination[filled..]) {
            Ok(0) => {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    // Reading to the end also lets checksumming readers verify the entry.
    let mut trailing = [0u8; 1];
    loop {
        match reader.read(&mut trailing) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: expected + 1,
                })
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_exact() {
        let mut buf = [0u8; 4];
        fill_exact(&b"abcd"[..], &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        let short = fill_exact(&b"abc"[..], &mut buf).unwrap_err();
        assert!(matches!(
            short,
            Error::SizeMismatch {
                expected: 4,
                actual: 3
            }
        ));

        let long = fill_exact(&b"abcde"[..], &mut buf).unwrap_err();
        assert!(matches!(long, Error::SizeMismatch { expected: 4, .. }));
    }
}
