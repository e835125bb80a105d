use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::error::{IoResultExt, Result};

/// source of a layer's bytes; every call to `open` returns a fresh stream
/// positioned at the start
pub trait Opener: Send + Sync + fmt::Debug {
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// backing file, when the bytes are exactly one whole file
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// a whole file on disk
///
/// when the file lives in a scratch directory, the directory handle is kept
/// so the file outlives the conversion that produced it; the directory is
/// removed once the last opener referencing it is dropped.
#[derive(Clone, Debug)]
pub struct FileOpener {
    path: PathBuf,
    _scratch: Option<Arc<TempDir>>,
}

impl FileOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _scratch: None,
        }
    }

    /// file inside a scratch directory that must live as long as the opener
    pub fn in_scratch(path: impl Into<PathBuf>, scratch: Arc<TempDir>) -> Self {
        Self {
            path: path.into(),
            _scratch: Some(scratch),
        }
    }
}

impl Opener for FileOpener {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).with_path(&self.path)?;
        Ok(Box::new(file))
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// in-memory bytes
#[derive(Clone)]
pub struct BytesOpener(Arc<Vec<u8>>);

impl BytesOpener {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(data.into()))
    }
}

impl fmt::Debug for BytesOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BytesOpener({} bytes)", self.0.len())
    }
}

impl Opener for BytesOpener {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(ArcBytes(self.0.clone()))))
    }
}

struct ArcBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// a byte range of a file, e.g. one blob inside a container image
#[derive(Clone, Debug)]
pub struct BlobOpener {
    path: PathBuf,
    offset: u64,
    size: u64,
}

impl BlobOpener {
    pub fn new(path: impl Into<PathBuf>, offset: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Opener for BlobOpener {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let mut file = File::open(&self.path).with_path(&self.path)?;
        file.seek(SeekFrom::Start(self.offset)).with_path(&self.path)?;
        Ok(Box::new(file.take(self.size)))
    }
}

/// read everything an opener yields
pub fn read_all(opener: &dyn Opener) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    opener
        .open()?
        .read_to_end(&mut buf)
        .with_path("<layer stream>")?;
    Ok(buf)
}
