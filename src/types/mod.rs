mod manifest;
mod media;
mod metadata;

pub use manifest::{Descriptor, ImageIndex, Manifest, ANNOTATION_REF_NAME};
pub use media::{
    LayerMediaType, DATA_CONTAINER_ARTIFACT_TYPE, DOCKER_LAYER_TAR_GZIP, EXT3_LAYER_MEDIA_TYPE,
    OCI_CONFIG, OCI_EMPTY, OCI_INDEX, OCI_LAYER_TAR, OCI_LAYER_TAR_GZIP, OCI_LAYER_TAR_ZSTD,
    OCI_MANIFEST, SQUASHFS_LAYER_MEDIA_TYPE,
};
pub use metadata::{Xattr, PAX_XATTR_PREFIX};
