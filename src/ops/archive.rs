use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::digest::DigestWriter;
use crate::error::{Error, IoResultExt, Result};
use crate::image::{ArchiveLayer, FileOpener, Image, ImageSource, Layer};
use crate::ops::whiteout::overlay_to_aufs;
use crate::ops::{scratch_dir, TransformOptions};
use crate::types::LayerMediaType;

/// re-encode a squashfs layer as an uncompressed tar layer
///
/// overlayfs whiteouts in the squashfs tree become AUFS markers. archive
/// layers come back unchanged; an ext3 overlay cannot be converted.
pub fn to_archive(layer: &Layer, work_dir: &Path, opts: &TransformOptions) -> Result<Layer> {
    match layer {
        Layer::Archive(_) => Ok(layer.clone()),
        Layer::Ext3(_) => Err(Error::UnsupportedMediaType(format!(
            "{} cannot be converted to an archive layer",
            layer.media_type()
        ))),
        Layer::Squashfs(_) => squashfs_to_archive(layer, work_dir, opts),
    }
}

/// image with every squashfs layer converted to tar, for destinations that
/// do not accept squashfs
pub fn to_archive_image(img: &Image, work_dir: &Path, opts: &TransformOptions) -> Result<Image> {
    if !img.layers().iter().any(Layer::is_squashfs) {
        return Ok(img.clone());
    }
    let mut layers = Vec::with_capacity(img.layers().len());
    for layer in img.layers() {
        opts.cancel.check()?;
        if layer.is_squashfs() {
            layers.push(to_archive(layer, work_dir, opts)?);
        } else {
            layers.push(layer.clone());
        }
    }
    img.with_layers(layers)
}

fn squashfs_to_archive(layer: &Layer, work_dir: &Path, opts: &TransformOptions) -> Result<Layer> {
    let scratch = scratch_dir(work_dir, "archive-")?;

    // the tools need a file; layers read from a container are byte ranges
    let image: PathBuf = match layer.opener().path() {
        Some(p) => p.to_path_buf(),
        None => {
            let p = scratch.path().join("layer.sqfs");
            let mut out = File::create(&p).with_path(&p)?;
            io::copy(&mut layer.open()?, &mut out).with_path(&p)?;
            p
        }
    };

    let raw = scratch.path().join("raw.tar");
    {
        let mut out = BufWriter::new(File::create(&raw).with_path(&raw)?);
        opts.tools.squashfs_to_tar(&image, &mut out)?;
        out.flush().with_path(&raw)?;
    }

    let dest = scratch.path().join("layer.tar");
    let input = BufReader::new(File::open(&raw).with_path(&raw)?);
    let file = File::create(&dest).with_path(&dest)?;
    let writer = overlay_to_aufs(input, DigestWriter::new(BufWriter::new(file)))?;
    let (digest, size, mut inner) = writer.finish();
    inner.flush().with_path(&dest)?;
    drop(inner);

    std::fs::remove_file(&raw).with_path(&raw)?;
    if image.starts_with(scratch.path()) {
        std::fs::remove_file(&image).with_path(&image)?;
    }

    tracing::debug!(source = %layer.digest(), digest = %digest, "converted squashfs layer to tar");
    Ok(Layer::Archive(ArchiveLayer::from_parts(
        LayerMediaType::Tar,
        digest,
        digest,
        size,
        Arc::new(FileOpener::in_scratch(&dest, scratch)),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        archive_image, ext3_layer, read_tar, squashfs_layer_from, FakeTools, TestEntry,
    };
    use crate::types::OCI_LAYER_TAR;
    use tempfile::tempdir;

    fn fake_opts() -> TransformOptions {
        TransformOptions::new(Arc::new(FakeTools::default()))
    }

    #[test]
    fn test_squashfs_to_tar_translates_whiteouts() {
        let dir = tempdir().unwrap();
        let layer = squashfs_layer_from(&[
            TestEntry::DirXattr("var", "trusted.overlay.opaque", "y"),
            TestEntry::CharDev("etc/shadow"),
            TestEntry::File("etc/hosts", "h"),
        ]);
        let out = to_archive(&layer, dir.path(), &fake_opts()).unwrap();

        assert_eq!(out.media_type().as_str(), OCI_LAYER_TAR);
        assert_eq!(out.digest(), out.diff_id());
        let paths: Vec<String> = read_tar(out.open().unwrap()).into_iter().map(|i| i.path).collect();
        assert_eq!(
            paths,
            vec!["var", "var/.wh..wh..opq", "etc/.wh.shadow", "etc/hosts"]
        );
    }

    #[test]
    fn test_archive_layer_passes_through() {
        let dir = tempdir().unwrap();
        let layer = archive_image(1).layers()[0].clone();
        let out = to_archive(&layer, dir.path(), &fake_opts()).unwrap();
        assert_eq!(out.digest(), layer.digest());
    }

    #[test]
    fn test_ext3_rejected() {
        let dir = tempdir().unwrap();
        let err = to_archive(&ext3_layer(&[]), dir.path(), &fake_opts()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(_)));
    }

    #[test]
    fn test_to_archive_image_converts_only_squashfs() {
        let dir = tempdir().unwrap();
        let base = archive_image(1);
        let img = base
            .append_layer(squashfs_layer_from(&[TestEntry::File("f", "x")]))
            .unwrap()
            .append_layer(ext3_layer(&[]))
            .unwrap();
        let out = to_archive_image(&img, dir.path(), &fake_opts()).unwrap();

        let kinds: Vec<LayerMediaType> = out.layers().iter().map(Layer::media_type).collect();
        assert_eq!(
            kinds,
            vec![LayerMediaType::Tar, LayerMediaType::Tar, LayerMediaType::Ext3]
        );
        assert_eq!(out.layers()[0].digest(), base.layers()[0].digest());
    }
}
