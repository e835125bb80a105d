use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::digest::Digest;
use crate::error::{IoResultExt, Result};
use crate::fs::FsType;
use crate::image::opener::{FileOpener, Opener};
use crate::types::{Descriptor, LayerMediaType};

/// one layer of an image
///
/// archive layers may be compressed, so their digest and diff id differ;
/// filesystem image layers are stored uncompressed and the two are equal.
#[derive(Clone, Debug)]
pub enum Layer {
    Archive(ArchiveLayer),
    Squashfs(FsImageLayer),
    Ext3(FsImageLayer),
}

impl Layer {
    /// wrap a filesystem image layer in the matching variant
    pub fn from_fs_image(layer: FsImageLayer) -> Self {
        match layer.fs_type {
            FsType::Ext3 => Layer::Ext3(layer),
            FsType::Squashfs => Layer::Squashfs(layer),
        }
    }

    /// digest of the stored bytes
    pub fn digest(&self) -> Digest {
        match self {
            Layer::Archive(l) => l.digest,
            Layer::Squashfs(l) | Layer::Ext3(l) => l.digest,
        }
    }

    /// digest of the uncompressed content
    pub fn diff_id(&self) -> Digest {
        match self {
            Layer::Archive(l) => l.diff_id,
            Layer::Squashfs(l) | Layer::Ext3(l) => l.digest,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Layer::Archive(l) => l.size,
            Layer::Squashfs(l) | Layer::Ext3(l) => l.size,
        }
    }

    pub fn media_type(&self) -> LayerMediaType {
        match self {
            Layer::Archive(l) => l.media_type,
            Layer::Squashfs(_) => LayerMediaType::Squashfs,
            Layer::Ext3(_) => LayerMediaType::Ext3,
        }
    }

    /// fresh stream over the stored bytes
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.opener().open()
    }

    /// fresh stream over the uncompressed content
    pub fn open_uncompressed(&self) -> Result<Box<dyn Read + Send>> {
        let raw = self.open()?;
        match self.media_type() {
            LayerMediaType::TarGzip | LayerMediaType::DockerTarGzip => {
                Ok(Box::new(flate2::read::GzDecoder::new(raw)))
            }
            LayerMediaType::TarZstd => {
                let decoder = zstd::stream::read::Decoder::new(raw).with_path("<zstd>")?;
                Ok(Box::new(decoder))
            }
            _ => Ok(raw),
        }
    }

    pub fn opener(&self) -> &Arc<dyn Opener> {
        match self {
            Layer::Archive(l) => &l.opener,
            Layer::Squashfs(l) | Layer::Ext3(l) => &l.opener,
        }
    }

    /// manifest descriptor for this layer
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type().as_str(), self.size(), self.digest())
    }

    /// true for the ext3 writable overlay encoding
    pub fn is_overlay(&self) -> bool {
        matches!(self, Layer::Ext3(_))
    }

    pub fn is_squashfs(&self) -> bool {
        matches!(self, Layer::Squashfs(_))
    }
}

/// tar-based layer, possibly compressed
#[derive(Clone)]
pub struct ArchiveLayer {
    media_type: LayerMediaType,
    digest: Digest,
    diff_id: Digest,
    size: u64,
    opener: Arc<dyn Opener>,
}

impl ArchiveLayer {
    /// hash the stored and the uncompressed bytes of `opener`
    pub fn from_opener(opener: Arc<dyn Opener>, media_type: LayerMediaType) -> Result<Self> {
        if !media_type.is_archive() {
            return Err(crate::Error::UnsupportedMediaType(media_type.to_string()));
        }
        let (digest, size) = Digest::from_reader(&mut opener.open()?).with_path("<layer>")?;
        let mut layer = Self {
            media_type,
            digest,
            diff_id: digest,
            size,
            opener,
        };
        if media_type != LayerMediaType::Tar {
            let mut uncompressed = Layer::Archive(layer.clone()).open_uncompressed()?;
            layer.diff_id = Digest::from_reader(&mut uncompressed)
                .with_path("<layer>")?
                .0;
        }
        Ok(layer)
    }

    /// uncompressed tar file on disk
    pub fn from_tar_file(path: &Path) -> Result<Self> {
        Self::from_opener(Arc::new(FileOpener::new(path)), LayerMediaType::Tar)
    }

    /// layer whose digests are already known, e.g. one loaded from a container
    pub fn from_parts(
        media_type: LayerMediaType,
        digest: Digest,
        diff_id: Digest,
        size: u64,
        opener: Arc<dyn Opener>,
    ) -> Self {
        Self {
            media_type,
            digest,
            diff_id,
            size,
            opener,
        }
    }
}

impl fmt::Debug for ArchiveLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveLayer")
            .field("media_type", &self.media_type)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}

/// uncompressed filesystem image layer (ext3 or squashfs)
#[derive(Clone)]
pub struct FsImageLayer {
    fs_type: FsType,
    digest: Digest,
    size: u64,
    opener: Arc<dyn Opener>,
}

impl FsImageLayer {
    /// validate the header window, then reopen the source to hash it
    pub fn from_opener(opener: Arc<dyn Opener>, fs_type: FsType) -> Result<Self> {
        fs_type.check_reader(&mut opener.open()?)?;
        let (digest, size) = Digest::from_reader(&mut opener.open()?).with_path("<layer>")?;
        Ok(Self {
            fs_type,
            digest,
            size,
            opener,
        })
    }

    pub fn from_file(path: &Path, fs_type: FsType) -> Result<Self> {
        Self::from_opener(Arc::new(FileOpener::new(path)), fs_type)
    }

    /// layer whose digest is already known; the header is not re-checked
    pub fn from_parts(fs_type: FsType, digest: Digest, size: u64, opener: Arc<dyn Opener>) -> Self {
        Self {
            fs_type,
            digest,
            size,
            opener,
        }
    }

    pub fn fs_type(&self) -> FsType {
        self.fs_type
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }
}

impl fmt::Debug for FsImageLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsImageLayer")
            .field("fs_type", &self.fs_type)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}
