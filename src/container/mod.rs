//! single-file container holding one OCI image
//!
//! the container stores an OCI image index plus every blob it references,
//! each addressed by a descriptor. see [`format`] for the byte layout.

pub mod file;
pub mod format;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::fs::FsType;
use crate::image::{ArchiveLayer, BytesOpener, FsImageLayer, Image, ImageSource, Layer, Opener};
use crate::types::{Descriptor, ImageIndex, LayerMediaType, Manifest, ANNOTATION_REF_NAME, OCI_MANIFEST};

pub use file::{FileImage, LoadMode, Selector};
pub use format::DataType;

/// a blob to store and where its bytes come from
#[derive(Clone, Debug)]
pub struct PlanBlob {
    pub digest: Digest,
    pub size: u64,
    pub source: Arc<dyn Opener>,
}

/// everything needed to write or update a container: the serialized root
/// index and the blobs it references
#[derive(Clone, Debug)]
pub struct IndexPlan {
    pub root_index: Vec<u8>,
    pub blobs: Vec<PlanBlob>,
}

impl IndexPlan {
    /// index holding exactly `image`
    pub fn single(image: &dyn ImageSource) -> Result<Self> {
        Self::with_siblings(image, Vec::new())
    }

    /// index holding `image` after `siblings`, which are assumed to be
    /// stored already
    pub fn with_siblings(image: &dyn ImageSource, siblings: Vec<Descriptor>) -> Result<Self> {
        let raw_manifest = image.raw_manifest()?;
        let raw_config = image.raw_config()?;
        let manifest: Manifest = serde_json::from_slice(&raw_manifest)?;

        let mut desc = Descriptor::new(
            manifest.media_type.clone().unwrap_or_else(|| OCI_MANIFEST.to_string()),
            raw_manifest.len() as u64,
            Digest::of_bytes(&raw_manifest),
        );
        desc.artifact_type = manifest.artifact_type.clone();

        let mut manifests = siblings;
        manifests.push(desc);
        let root_index = serde_json::to_vec(&ImageIndex::new(manifests))?;

        let mut blobs = Vec::with_capacity(image.layers().len() + 2);
        for layer in image.layers() {
            blobs.push(PlanBlob {
                digest: layer.digest(),
                size: layer.size(),
                source: layer.opener().clone(),
            });
        }
        blobs.push(PlanBlob {
            digest: manifest.config.digest,
            size: raw_config.len() as u64,
            source: Arc::new(BytesOpener::new(raw_config)),
        });
        blobs.push(PlanBlob {
            digest: Digest::of_bytes(&raw_manifest),
            size: raw_manifest.len() as u64,
            source: Arc::new(BytesOpener::new(raw_manifest)),
        });

        Ok(Self { root_index, blobs })
    }

    /// blobs with duplicates (same digest) removed, first occurrence kept
    pub fn unique_blobs(&self) -> Vec<&PlanBlob> {
        let mut seen = HashSet::new();
        self.blobs.iter().filter(|b| seen.insert(b.digest)).collect()
    }
}

/// true for index entries that accompany an image without being one:
/// cosign-style signatures, attestations and sboms
pub fn is_tolerated_sibling(desc: &Descriptor) -> bool {
    if let Some(name) = desc.annotations.get(ANNOTATION_REF_NAME) {
        if [".sig", ".att", ".sbom"].iter().any(|s| name.ends_with(s)) {
            return true;
        }
    }
    matches!(&desc.artifact_type, Some(t) if t.starts_with("application/vnd.dev.cosign."))
}

/// the single runnable image in a container
pub struct SingleImage {
    /// index entry of the image
    pub descriptor: Descriptor,
    /// tolerated siblings, kept when the index is rewritten
    pub siblings: Vec<Descriptor>,
    pub image: Image,
    /// artifact type from the stored manifest
    pub artifact_type: Option<String>,
}

impl SingleImage {
    pub fn is_signed(&self, fimg: &FileImage) -> bool {
        !self.siblings.is_empty() || !fimg.get_descriptors(DataType::Signature).is_empty()
    }
}

/// find and load the one image in `fimg`
pub fn single_image(fimg: &FileImage) -> Result<SingleImage> {
    let index = fimg.root_index()?;
    let (siblings, images): (Vec<_>, Vec<_>) =
        index.manifests.into_iter().partition(is_tolerated_sibling);
    let descriptor = match images.len() {
        0 => return Err(Error::NoImages),
        1 => images.into_iter().next().ok_or(Error::NoImages)?,
        n => return Err(Error::MultipleImages(n)),
    };

    let raw_manifest = fimg.read_blob(descriptor.digest)?;
    let manifest: Manifest = serde_json::from_slice(&raw_manifest)?;
    let image = load_image(fimg, &manifest)?;
    Ok(SingleImage {
        descriptor,
        siblings,
        image,
        artifact_type: manifest.artifact_type,
    })
}

/// build an [`Image`] whose layers read straight from the container
pub fn load_image(fimg: &FileImage, manifest: &Manifest) -> Result<Image> {
    let config = fimg.read_blob(manifest.config.digest)?;
    let diff_ids: Vec<Option<Digest>> = match serde_json::from_slice::<serde_json::Value>(&config) {
        Ok(value) => value["rootfs"]["diff_ids"]
            .as_array()
            .map(|ids| ids.iter().map(|v| v.as_str().and_then(|s| Digest::from_str(s).ok())).collect())
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (i, ld) in manifest.layers.iter().enumerate() {
        let raw = fimg.get_descriptor(Selector::BlobDigest(ld.digest))?;
        let opener: Arc<dyn Opener> = Arc::new(fimg.blob_opener(&raw));
        let media_type = LayerMediaType::from_str(&ld.media_type)?;
        let layer = match media_type {
            LayerMediaType::Squashfs => Layer::Squashfs(FsImageLayer::from_parts(
                FsType::Squashfs,
                ld.digest,
                raw.size,
                opener,
            )),
            LayerMediaType::Ext3 => {
                Layer::Ext3(FsImageLayer::from_parts(FsType::Ext3, ld.digest, raw.size, opener))
            }
            LayerMediaType::Tar => Layer::Archive(ArchiveLayer::from_parts(
                media_type, ld.digest, ld.digest, raw.size, opener,
            )),
            _ => match diff_ids.get(i).copied().flatten() {
                Some(diff_id) => Layer::Archive(ArchiveLayer::from_parts(
                    media_type, ld.digest, diff_id, raw.size, opener,
                )),
                None => Layer::Archive(ArchiveLayer::from_opener(opener, media_type)?),
            },
        };
        layers.push(layer);
    }

    Ok(Image::new(config, layers)?
        .with_config_media_type(manifest.config.media_type.clone())
        .with_annotations(manifest.annotations.clone()))
}
