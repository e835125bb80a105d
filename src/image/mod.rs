//! in-memory image model
//!
//! An [`Image`] is an immutable value: a raw config blob, manifest
//! annotations, and an ordered list of [`Layer`]s. Transforms return new
//! images and never mutate their input.

pub mod layer;
pub mod opener;

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::types::{Descriptor, Manifest, OCI_CONFIG};

pub use layer::{ArchiveLayer, FsImageLayer, Layer};
pub use opener::{BlobOpener, BytesOpener, FileOpener, Opener};

/// user agent recorded in image history
pub const USER_AGENT: &str = concat!("ocisif/", env!("CARGO_PKG_VERSION"));

/// position of the writable overlay in `layers`, if any
///
/// an ext3 layer is only valid as the final layer; anything else is an
/// error. every caller that needs to know about the overlay goes through here.
pub fn overlay_index(layers: &[Layer]) -> Result<Option<usize>> {
    let count = layers.len();
    for (i, layer) in layers.iter().enumerate() {
        if layer.is_overlay() && i + 1 != count {
            return Err(Error::OverlayNotLast { position: i, count });
        }
    }
    Ok(match layers.last() {
        Some(l) if l.is_overlay() => Some(count - 1),
        _ => None,
    })
}

/// read-only view of an image, as consumed by the writer
pub trait ImageSource {
    /// serialized manifest, exactly as it will be stored
    fn raw_manifest(&self) -> Result<Vec<u8>>;

    fn raw_config(&self) -> Result<Vec<u8>>;

    fn layers(&self) -> &[Layer];

    /// digest of the serialized manifest
    fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(&self.raw_manifest()?))
    }

    fn manifest(&self) -> Result<Manifest> {
        Ok(serde_json::from_slice(&self.raw_manifest()?)?)
    }
}

/// a single image: config, annotations, layers
#[derive(Clone, Debug)]
pub struct Image {
    config: Vec<u8>,
    config_media_type: String,
    annotations: BTreeMap<String, String>,
    layers: Vec<Layer>,
}

impl Image {
    /// image from a raw config blob, kept byte-for-byte
    pub fn new(config: Vec<u8>, layers: Vec<Layer>) -> Result<Self> {
        overlay_index(&layers)?;
        Ok(Self {
            config,
            config_media_type: OCI_CONFIG.to_string(),
            annotations: BTreeMap::new(),
            layers,
        })
    }

    /// image with a minimal linux config whose diff ids match `layers`
    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        let config = json!({
            "architecture": std::env::consts::ARCH,
            "os": "linux",
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let config = serde_json::to_vec(&config)?;
        Self::new(config, Vec::new())?.with_layers(layers)
    }

    pub fn with_config_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.config_media_type = media_type.into();
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn config_media_type(&self) -> &str {
        &self.config_media_type
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// the writable overlay layer, if present
    pub fn overlay(&self) -> Result<Option<&Layer>> {
        Ok(overlay_index(&self.layers)?.map(|i| &self.layers[i]))
    }

    /// config parsed as json
    pub fn config_json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.config)?)
    }

    /// new image with `layers` replacing the current ones; `rootfs.diff_ids`
    /// is rewritten to match
    pub fn with_layers(&self, layers: Vec<Layer>) -> Result<Image> {
        overlay_index(&layers)?;
        let mut config = self.config.clone();
        if self.config_media_type == OCI_CONFIG {
            let mut value = self.config_json()?;
            let diff_ids: Vec<Value> = layers
                .iter()
                .map(|l| Value::String(l.diff_id().to_string()))
                .collect();
            if let Some(obj) = value.as_object_mut() {
                let rootfs = obj
                    .entry("rootfs")
                    .or_insert_with(|| json!({ "type": "layers" }));
                if let Some(rootfs) = rootfs.as_object_mut() {
                    rootfs.insert("diff_ids".to_string(), Value::Array(diff_ids));
                }
            }
            config = serde_json::to_vec(&value)?;
        }
        Ok(Image {
            config,
            config_media_type: self.config_media_type.clone(),
            annotations: self.annotations.clone(),
            layers,
        })
    }

    /// new image with layer `index` replaced
    pub fn set_layer(&self, index: usize, layer: Layer) -> Result<Image> {
        let mut layers = self.layers.clone();
        match layers.get_mut(index) {
            Some(slot) => *slot = layer,
            None => {
                return Err(Error::CorruptContainer(format!(
                    "layer index {} out of range ({} layers)",
                    index,
                    self.layers.len()
                )))
            }
        }
        self.with_layers(layers)
    }

    /// new image with `layer` appended
    pub fn append_layer(&self, layer: Layer) -> Result<Image> {
        let mut layers = self.layers.clone();
        layers.push(layer);
        self.with_layers(layers)
    }

    /// new image whose history is exactly one non-empty-layer entry
    pub fn with_history(&self, comment: &str) -> Result<Image> {
        let mut value = self.config_json()?;
        let entry = json!({
            "created": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "created_by": USER_AGENT,
            "comment": comment,
        });
        if let Some(obj) = value.as_object_mut() {
            obj.insert("history".to_string(), Value::Array(vec![entry]));
        }
        Ok(Image {
            config: serde_json::to_vec(&value)?,
            ..self.clone()
        })
    }

    fn config_descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.config_media_type.clone(),
            self.config.len() as u64,
            Digest::of_bytes(&self.config),
        )
    }

    fn build_manifest(&self) -> Manifest {
        let mut manifest = Manifest::new(
            self.config_descriptor(),
            self.layers.iter().map(Layer::descriptor).collect(),
        );
        manifest.annotations = self.annotations.clone();
        manifest
    }
}

impl ImageSource for Image {
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.build_manifest())?)
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(self.config.clone())
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn manifest(&self) -> Result<Manifest> {
        Ok(self.build_manifest())
    }
}
