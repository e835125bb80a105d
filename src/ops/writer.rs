use std::path::PathBuf;

use crate::config::{Config, DEFAULT_SPARE_DESCRIPTOR_CAPACITY};
use crate::container::{FileImage, IndexPlan};
use crate::error::{Error, Result};
use crate::image::{overlay_index, Image, ImageSource};
use crate::ops::artifact::Oci11Artifact;
use crate::ops::squash::squash;
use crate::ops::squashfs::to_squashfs_from;
use crate::ops::TransformOptions;

/// what [`ImageWriter`] does to an image before storing it
#[derive(Clone)]
pub struct WriterOptions {
    /// merge the layers below any overlay into one
    pub squash: bool,
    /// re-encode archive layers as squashfs
    pub squashfs_layers: bool,
    /// OCI 1.1 artifact type recorded in the manifest
    pub artifact_type: Option<String>,
    pub spare_descriptor_capacity: u32,
    pub transform: TransformOptions,
}

impl WriterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            spare_descriptor_capacity: config.spare_descriptor_capacity,
            transform: TransformOptions::from_config(config),
            ..Self::default()
        }
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            squash: false,
            squashfs_layers: true,
            artifact_type: None,
            spare_descriptor_capacity: DEFAULT_SPARE_DESCRIPTOR_CAPACITY,
            transform: TransformOptions::default(),
        }
    }
}

/// transforms an image as requested and writes it to a new container file
pub struct ImageWriter {
    src: Image,
    dest: PathBuf,
    work_dir: PathBuf,
    opts: WriterOptions,
}

impl ImageWriter {
    pub fn new(
        src: Image,
        dest: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        opts: WriterOptions,
    ) -> Result<Self> {
        let dest = dest.into();
        if dest.as_os_str().is_empty() {
            return Err(Error::NoDestination);
        }
        let work_dir = work_dir.into();
        if work_dir.as_os_str().is_empty() {
            return Err(Error::NoWorkDir);
        }
        Ok(Self {
            src,
            dest,
            work_dir,
            opts,
        })
    }

    /// writer with options from `config`, using its scratch root as the
    /// working directory
    pub fn from_config(src: Image, dest: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        Self::new(src, dest, config.scratch_root(), WriterOptions::from_config(config))
    }

    /// the image as it will be stored, without writing it
    pub fn transform(&self) -> Result<Image> {
        let layers = self.src.layers();
        if layers.is_empty() {
            return Err(Error::NoLayers);
        }
        let has_overlay = overlay_index(layers)?.is_some();
        let count = layers.len();
        let can_squash = (has_overlay && count > 2) || (!has_overlay && count > 1);

        let origin = self.src.digest()?;
        let mut img = self.src.clone();
        let transform = &self.opts.transform;

        if self.opts.squash && can_squash {
            img = squash(&img, &self.work_dir, transform)?;
        }
        if self.opts.squashfs_layers {
            img = to_squashfs_from(&img, origin, &self.work_dir, transform)?;
        }
        Ok(img)
    }

    /// transform and write; the destination appears only once complete
    pub fn write(&self) -> Result<()> {
        let img = self.transform()?;
        let cancel = &self.opts.transform.cancel;
        cancel.check()?;

        let plan = match &self.opts.artifact_type {
            Some(t) => IndexPlan::single(&Oci11Artifact::new(img, t.clone()))?,
            None => IndexPlan::single(&img)?,
        };
        FileImage::write_cancellable(&self.dest, &plan, self.opts.spare_descriptor_capacity, cancel)?;
        tracing::info!(dest = %self.dest.display(), "wrote image");
        Ok(())
    }
}
