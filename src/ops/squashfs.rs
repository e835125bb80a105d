use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::FsType;
use crate::image::{overlay_index, FileOpener, FsImageLayer, Image, ImageSource, Layer};
use crate::ops::whiteout::aufs_to_overlay;
use crate::ops::{scratch_dir, TransformOptions};
use crate::types::OCI_CONFIG;

/// re-encode every archive layer as squashfs
///
/// squashfs layers pass through, as does a trailing ext3 overlay. any
/// conversion failure aborts the whole call with
/// [`Error::SquashfsConversion`].
pub fn to_squashfs(img: &Image, work_dir: &Path, opts: &TransformOptions) -> Result<Image> {
    let origin = img.digest()?;
    to_squashfs_from(img, origin, work_dir, opts)
}

/// like [`to_squashfs`], recording `origin` as the source image in history
pub fn to_squashfs_from(
    img: &Image,
    origin: Digest,
    work_dir: &Path,
    opts: &TransformOptions,
) -> Result<Image> {
    if img.layers().iter().all(Layer::is_squashfs) {
        return Ok(img.clone());
    }

    let layers = convert_layers(img, work_dir, opts).map_err(|e| match e {
        Error::Cancelled | Error::SquashfsConversion(_) => e,
        other => Error::SquashfsConversion(Box::new(other)),
    })?;

    let converted = img.with_layers(layers)?;
    if converted.config_media_type() != OCI_CONFIG {
        return Ok(converted);
    }
    converted.with_history(&format!("oci-sif created from {}", origin.hex()))
}

fn convert_layers(img: &Image, work_dir: &Path, opts: &TransformOptions) -> Result<Vec<Layer>> {
    let overlay = overlay_index(img.layers())?;
    // a lone layer has nothing below it for whiteouts to act on
    let skip_whiteouts = img.layers().len() == 1;
    let scratch = scratch_dir(work_dir, "squashfs-")?;

    let mut layers = Vec::with_capacity(img.layers().len());
    for (i, layer) in img.layers().iter().enumerate() {
        opts.cancel.check()?;
        match layer {
            Layer::Squashfs(_) => layers.push(layer.clone()),
            Layer::Ext3(_) => {
                debug_assert_eq!(overlay, Some(i));
                tracing::info!(layer = i, "image carries a writable overlay; seal it to make it read-only");
                layers.push(layer.clone());
            }
            Layer::Archive(_) => {
                let dest = scratch.path().join(format!("layer-{}.sqfs", i));
                if skip_whiteouts {
                    opts.tools
                        .tar_to_squashfs(&mut layer.open_uncompressed()?, &dest)?;
                } else {
                    let tar = scratch.path().join(format!("layer-{}.tar", i));
                    let file = File::create(&tar).with_path(&tar)?;
                    let mut out = aufs_to_overlay(layer, BufWriter::new(file))?;
                    out.flush().with_path(&tar)?;
                    drop(out);

                    let mut input = BufReader::new(File::open(&tar).with_path(&tar)?);
                    opts.tools.tar_to_squashfs(&mut input, &dest)?;
                    std::fs::remove_file(&tar).with_path(&tar)?;
                }

                let opener = Arc::new(FileOpener::in_scratch(&dest, scratch.clone()));
                let converted = FsImageLayer::from_opener(opener, FsType::Squashfs)?;
                let converted = Layer::from_fs_image(converted);
                tracing::debug!(
                    layer = i,
                    source = %layer.digest(),
                    digest = %converted.digest(),
                    "converted layer to squashfs"
                );
                layers.push(converted);
            }
        }
    }
    Ok(layers)
}
