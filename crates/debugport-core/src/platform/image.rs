//! # Image Metadata
//!
//! Mapped executable images, the file objects that back them, and the
//! resolver the broker uses to turn one into the other.
//!
//! Resolution is best-effort: a missing file or unreadable header degrades
//! the resulting debug event (no file handle, zero symbol offsets) but never
//! fails an attach.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{Address, ProcessId};

/// Header fields the debugger uses to locate symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageHeaders
{
    /// File offset of the COFF symbol table (0 if none)
    pub symbol_table_offset: u32,
    /// Number of COFF symbols
    pub symbol_count: u32,
    /// Entry point, relative to the image base
    pub entry_point_rva: u64,
}

/// An executable image mapped into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage
{
    /// Load address
    pub base: Address,
    /// Mapped size in bytes
    pub size: u64,
    /// Backing file, if the mapping has one
    pub path: Option<PathBuf>,
    /// Parsed headers, if they were readable
    pub headers: Option<ImageHeaders>,
}

impl MappedImage
{
    /// An anonymous image with no backing file and no readable headers.
    pub fn new(base: Address, size: u64) -> Self
    {
        Self {
            base,
            size,
            path: None,
            headers: None,
        }
    }

    /// Attach a backing file path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self
    {
        self.path = Some(path.into());
        self
    }

    /// Attach parsed headers.
    #[must_use]
    pub fn with_headers(mut self, headers: ImageHeaders) -> Self
    {
        self.headers = Some(headers);
        self
    }

    /// Absolute entry point, if the headers are known.
    pub fn entry_point(&self) -> Option<Address>
    {
        self.headers.and_then(|headers| self.base.checked_add(headers.entry_point_rva))
    }
}

/// A durable reference to an image's backing file.
///
/// Events carry these by `Arc`; the reference is released when the event is
/// freed or when its ownership moves to a debugger-owned handle.
#[derive(Debug, PartialEq, Eq)]
pub struct FileObject
{
    path: PathBuf,
}

impl FileObject
{
    /// Open a file object for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path
    {
        &self.path
    }
}

/// Resolves mapped images to file objects and header fields.
pub trait ImageResolver: Send + Sync + fmt::Debug
{
    /// Open the file backing `image`. `None` if it has no file or it can't be opened.
    fn open_file(&self, image: &MappedImage) -> Option<Arc<FileObject>>;

    /// Read the image headers. `None` if they aren't readable.
    fn read_headers(&self, image: &MappedImage) -> Option<ImageHeaders>;
}

/// Resolver that trusts what the loader recorded in the [`MappedImage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LoaderImageResolver;

impl ImageResolver for LoaderImageResolver
{
    fn open_file(&self, image: &MappedImage) -> Option<Arc<FileObject>>
    {
        image.path.as_ref().map(|path| Arc::new(FileObject::new(path.clone())))
    }

    fn read_headers(&self, image: &MappedImage) -> Option<ImageHeaders>
    {
        image.headers
    }
}

/// Callback run for every image reported at process start, debugger or not.
pub type ImageNotifyCallback = Arc<dyn Fn(ProcessId, &MappedImage) + Send + Sync>;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_entry_point_requires_headers()
    {
        let image = MappedImage::new(Address::new(0x40_0000), 0x1000);
        assert_eq!(image.entry_point(), None);

        let image = image.with_headers(ImageHeaders {
            entry_point_rva: 0x120,
            ..ImageHeaders::default()
        });
        assert_eq!(image.entry_point(), Some(Address::new(0x40_0120)));
    }

    #[test]
    fn test_loader_resolver_degrades_without_path()
    {
        let resolver = LoaderImageResolver;
        let anonymous = MappedImage::new(Address::new(0x1000), 0x1000);
        assert!(resolver.open_file(&anonymous).is_none());

        let backed = anonymous.with_path("/bin/target");
        let file = resolver.open_file(&backed).unwrap();
        assert_eq!(file.path(), Path::new("/bin/target"));
    }
}
