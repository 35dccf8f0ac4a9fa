use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// How a file is opened through the [`FileSystem`] seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist.
    Read,
    /// Create or truncate, then write.
    Write,
    /// Create if absent, then append.
    Append,
}

/// An open file handle obtained from a [`FileSystem`].
pub trait RemoteFile: Send {
    /// Appends `data` at the current end of the file.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads the remaining contents of the file into `out`.
    fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize>;

    /// Flushes and closes the handle.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Filesystem abstraction for the shared work directory.
///
/// The work directory may live on a remote filesystem; deployments swap in
/// their own driver by implementing this trait and handing it to the
/// engine at construction time. Only the operations the engine needs are
/// present: no deletion, no rename, no truncation.
pub trait FileSystem: Send + Sync {
    /// Creates the directory `path` (and missing parents).
    fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Opens `path` in the given mode.
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn RemoteFile>>;
}

/// The default [`FileSystem`]: plain `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

struct LocalFile {
    file: File,
}

impl RemoteFile for LocalFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        Read::read_to_end(&mut self.file, out)
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush()
    }
}

impl FileSystem for LocalFileSystem {
    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn RemoteFile>> {
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path)?,
            OpenMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            OpenMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
        };
        Ok(Box::new(LocalFile { file }))
    }
}
