use std::fmt;
use std::str::FromStr;

use crate::Error;

/// sylabs squashfs layer encoding
pub const SQUASHFS_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.image.layer.v1.squashfs";
/// sylabs ext3 writable overlay layer encoding
pub const EXT3_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.image.layer.v1.ext3";
/// artifact type of data containers
pub const DATA_CONTAINER_ARTIFACT_TYPE: &str = "application/vnd.sylabs.data-container.v1";

pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const DOCKER_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// layer encodings understood by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerMediaType {
    Tar,
    TarGzip,
    TarZstd,
    DockerTarGzip,
    Squashfs,
    Ext3,
}

impl LayerMediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerMediaType::Tar => OCI_LAYER_TAR,
            LayerMediaType::TarGzip => OCI_LAYER_TAR_GZIP,
            LayerMediaType::TarZstd => OCI_LAYER_TAR_ZSTD,
            LayerMediaType::DockerTarGzip => DOCKER_LAYER_TAR_GZIP,
            LayerMediaType::Squashfs => SQUASHFS_LAYER_MEDIA_TYPE,
            LayerMediaType::Ext3 => EXT3_LAYER_MEDIA_TYPE,
        }
    }

    /// tar-based layer (possibly compressed)
    pub fn is_archive(&self) -> bool {
        !matches!(self, LayerMediaType::Squashfs | LayerMediaType::Ext3)
    }
}

impl fmt::Display for LayerMediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerMediaType {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            OCI_LAYER_TAR => Ok(LayerMediaType::Tar),
            OCI_LAYER_TAR_GZIP => Ok(LayerMediaType::TarGzip),
            OCI_LAYER_TAR_ZSTD => Ok(LayerMediaType::TarZstd),
            DOCKER_LAYER_TAR_GZIP => Ok(LayerMediaType::DockerTarGzip),
            SQUASHFS_LAYER_MEDIA_TYPE => Ok(LayerMediaType::Squashfs),
            EXT3_LAYER_MEDIA_TYPE => Ok(LayerMediaType::Ext3),
            other => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }
}
