//! writable ext3 overlay lifecycle on a container file
//!
//! an image has an overlay when its final layer is ext3. every operation
//! here works on a single-image container, locks it for writing, and stages
//! its changes so a failure leaves the file as it was.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use crate::container::{single_image, FileImage, IndexPlan, LoadMode, Selector, SingleImage};
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{FsType, MountGuard};
use crate::image::{overlay_index, FileOpener, FsImageLayer, Image, ImageSource, Layer};
use crate::ops::artifact::Oci11Artifact;
use crate::ops::scratch_dir;
use crate::ops::whiteout::FUSE_OVERLAY_OPAQUE_MARKER;
use crate::tools::FsTools;

/// where the overlay lives inside the container file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayInfo {
    /// byte offset of the ext3 filesystem within the container
    pub offset: u64,
    pub size: u64,
    pub digest: Digest,
    /// descriptor id of the overlay blob
    pub id: u32,
}

/// the overlay of the image in `path`, if it has one
pub fn has_overlay(path: &Path) -> Result<Option<OverlayInfo>> {
    let fimg = FileImage::load(path, LoadMode::ReadOnly)?;
    let single = single_image(&fimg)?;
    overlay_info(&fimg, &single)
}

fn overlay_info(fimg: &FileImage, single: &SingleImage) -> Result<Option<OverlayInfo>> {
    let Some(idx) = overlay_index(single.image.layers())? else {
        return Ok(None);
    };
    let desc = fimg.get_descriptor(Selector::BlobDigest(single.image.layers()[idx].digest()))?;
    Ok(Some(OverlayInfo {
        offset: desc.offset,
        size: desc.size,
        digest: desc.digest,
        id: desc.id,
    }))
}

/// append the ext3 image at `overlay` as the image's writable overlay
pub fn add_overlay(path: &Path, overlay: &Path) -> Result<()> {
    let mut fimg = FileImage::load(path, LoadMode::ReadWrite)?;
    let single = single_image(&fimg)?;
    if single.is_signed(&fimg) {
        return Err(Error::ImageSigned);
    }
    if single.image.overlay()?.is_some() {
        return Err(Error::OverlayExists);
    }

    let layer = FsImageLayer::from_file(overlay, FsType::Ext3)?;
    let digest = layer.digest();
    let img = single.image.append_layer(Layer::Ext3(layer))?;
    store(&mut fimg, &single, &img)?;
    tracing::info!(image = %path.display(), overlay = %digest, "added overlay");
    Ok(())
}

/// re-hash the overlay after it was written through a mount and record the
/// new digest in place; returns whether anything changed
pub fn sync_overlay(path: &Path) -> Result<bool> {
    let mut fimg = FileImage::load(path, LoadMode::ReadWrite)?;
    let single = single_image(&fimg)?;
    let Some(info) = overlay_info(&fimg, &single)? else {
        return Err(Error::NoOverlay);
    };

    let raw = fimg.get_descriptor(Selector::Id(info.id))?;
    let opener = Arc::new(fimg.blob_opener(&raw));
    // the bytes changed under a mount; they must still be ext3
    let overlay = FsImageLayer::from_opener(opener, FsType::Ext3)?;
    let digest = overlay.digest();
    if digest == info.digest {
        tracing::info!("OCI digest matches overlay, no update required.");
        return Ok(false);
    }

    // patch the descriptor; the blob stays where it is
    fimg.set_descriptor_digest(info.id, digest)?;
    let layer = Layer::Ext3(overlay);
    let idx = single.image.layers().len() - 1;
    let img = single.image.set_layer(idx, layer)?;
    store(&mut fimg, &single, &img)?;
    tracing::info!(old = %info.digest, new = %digest, "updated overlay digest");
    Ok(true)
}

/// replace the overlay with a squashfs layer holding its upper directory
///
/// the overlay is mounted read-only under a scratch directory in `work_dir`
/// and always unmounted before returning.
pub fn seal_overlay(path: &Path, work_dir: &Path, tools: &dyn FsTools) -> Result<()> {
    let mut fimg = FileImage::load(path, LoadMode::ReadWrite)?;
    let single = single_image(&fimg)?;
    let Some(info) = overlay_info(&fimg, &single)? else {
        return Err(Error::NoOverlay);
    };

    let scratch = scratch_dir(work_dir, "overlay-")?;
    let mnt = scratch.path().join("overlay");
    DirBuilder::new().mode(0o755).create(&mnt).with_path(&mnt)?;
    let dest = scratch.path().join("overlay.sqfs");

    let guard = MountGuard::mount_ext3(tools, path, info.offset, &mnt).map_err(conversion)?;
    let built = tools.dir_to_squashfs(
        &guard.path().join("upper"),
        &dest,
        &[FUSE_OVERLAY_OPAQUE_MARKER.to_string()],
    );
    if let Err(e) = &built {
        tracing::error!(error = %e, "failed to pack overlay upper directory");
    }
    guard.unmount()?;
    built.map_err(conversion)?;

    let opener = Arc::new(FileOpener::in_scratch(&dest, scratch.clone()));
    let sealed = Layer::from_fs_image(FsImageLayer::from_opener(opener, FsType::Squashfs)?);
    let digest = sealed.digest();
    let idx = single.image.layers().len() - 1;
    let img = single.image.set_layer(idx, sealed)?;
    store(&mut fimg, &single, &img)?;
    tracing::info!(image = %path.display(), layer = %digest, "sealed overlay");
    Ok(())
}

fn conversion(e: Error) -> Error {
    Error::SquashfsConversion(Box::new(e))
}

/// write `img` back as the container's image, keeping its artifact type and
/// any signature siblings
fn store(fimg: &mut FileImage, single: &SingleImage, img: &Image) -> Result<()> {
    let siblings = single.siblings.clone();
    let plan = match &single.artifact_type {
        Some(t) => IndexPlan::with_siblings(&Oci11Artifact::new(img.clone(), t.clone()), siblings)?,
        None => IndexPlan::with_siblings(img, siblings)?,
    };
    fimg.update(&plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::DataType;
    use crate::image::opener::read_all;
    use crate::image::BlobOpener;
    use crate::ops::{squash, to_squashfs, TransformOptions};
    use crate::testutil::{
        archive_image, fake_ext3, fake_squashfs, squashfs_items, tar_bytes, FakeTools,
    };
    use crate::types::{LayerMediaType, DATA_CONTAINER_ARTIFACT_TYPE};
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    fn write_image(dir: &Path, img: &dyn ImageSource) -> std::path::PathBuf {
        let dest = dir.join("image.sif");
        FileImage::write(&dest, &IndexPlan::single(img).unwrap(), 8).unwrap();
        dest
    }

    fn write_overlay_file(dir: &Path, files: &[(&'static str, &'static str)]) -> std::path::PathBuf {
        let path = dir.join("overlay.img");
        std::fs::write(&path, fake_ext3(files)).unwrap();
        path
    }

    fn layer_kinds(path: &Path) -> Vec<LayerMediaType> {
        let fimg = FileImage::load(path, LoadMode::ReadOnly).unwrap();
        single_image(&fimg)
            .unwrap()
            .image
            .layers()
            .iter()
            .map(Layer::media_type)
            .collect()
    }

    #[test]
    fn test_add_then_has_overlay() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        let ovl = write_overlay_file(dir.path(), &[("upper/a", "a")]);
        assert_eq!(has_overlay(&sif).unwrap(), None);

        add_overlay(&sif, &ovl).unwrap();

        let info = has_overlay(&sif).unwrap().unwrap();
        let bytes = std::fs::read(&ovl).unwrap();
        assert_eq!(info.size, bytes.len() as u64);
        assert_eq!(info.digest, Digest::of_bytes(&bytes));
        let at_offset = read_all(&BlobOpener::new(&sif, info.offset, info.size)).unwrap();
        assert_eq!(Digest::of_bytes(&at_offset), Digest::of_bytes(&bytes));
        assert_eq!(
            layer_kinds(&sif),
            vec![LayerMediaType::Tar, LayerMediaType::Ext3]
        );
    }

    #[test]
    fn test_add_rejects_squashfs_source() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(2));
        let bad = dir.path().join("bad.img");
        std::fs::write(&bad, fake_squashfs(&tar_bytes(&[("x", "x")]))).unwrap();
        let before = std::fs::read(&sif).unwrap();

        let err = add_overlay(&sif, &bad).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader { fs_type: "ext3", .. }));
        assert_eq!(layer_kinds(&sif).len(), 2);
        assert_eq!(std::fs::read(&sif).unwrap(), before);
    }

    #[test]
    fn test_add_rejects_short_source() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        let short = dir.path().join("short.img");
        std::fs::write(&short, b"tiny").unwrap();
        assert!(matches!(
            add_overlay(&sif, &short),
            Err(Error::HeaderTooShort { .. })
        ));
    }

    #[test]
    fn test_add_twice_rejected() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        let ovl = write_overlay_file(dir.path(), &[]);
        add_overlay(&sif, &ovl).unwrap();
        assert!(matches!(add_overlay(&sif, &ovl), Err(Error::OverlayExists)));
    }

    #[test]
    fn test_add_rejects_signed_image() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        {
            let mut fimg = FileImage::load(&sif, LoadMode::ReadWrite).unwrap();
            fimg.add_bytes(DataType::Signature, b"signature").unwrap();
            fimg.commit().unwrap();
        }
        let ovl = write_overlay_file(dir.path(), &[]);
        assert!(matches!(add_overlay(&sif, &ovl), Err(Error::ImageSigned)));
    }

    #[test]
    fn test_add_keeps_artifact_type() {
        let dir = tempdir().unwrap();
        let art = Oci11Artifact::new(archive_image(1), DATA_CONTAINER_ARTIFACT_TYPE);
        let sif = write_image(dir.path(), &art);
        add_overlay(&sif, &write_overlay_file(dir.path(), &[])).unwrap();

        let fimg = FileImage::load(&sif, LoadMode::ReadOnly).unwrap();
        let single = single_image(&fimg).unwrap();
        assert_eq!(single.artifact_type.as_deref(), Some(DATA_CONTAINER_ARTIFACT_TYPE));
    }

    #[test]
    fn test_sync_is_idempotent() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();

        let before = std::fs::read(&sif).unwrap();
        assert!(!sync_overlay(&sif).unwrap());
        assert!(!sync_overlay(&sif).unwrap());
        assert_eq!(std::fs::read(&sif).unwrap(), before);
    }

    #[test]
    fn test_sync_patches_digest_in_place() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();
        let info = has_overlay(&sif).unwrap().unwrap();

        // simulate a write through a mount: change a byte past the header
        let file = std::fs::OpenOptions::new().write(true).open(&sif).unwrap();
        file.write_all_at(b"Z", info.offset + info.size - 1).unwrap();
        drop(file);

        assert!(sync_overlay(&sif).unwrap());
        let after = has_overlay(&sif).unwrap().unwrap();
        assert_eq!(after.offset, info.offset);
        assert_eq!(after.size, info.size);
        assert_eq!(after.id, info.id);
        assert_ne!(after.digest, info.digest);
        let bytes = read_all(&BlobOpener::new(&sif, after.offset, after.size)).unwrap();
        assert_eq!(Digest::of_bytes(&bytes), after.digest);

        assert!(!sync_overlay(&sif).unwrap());
    }

    #[test]
    fn test_sync_rejects_clobbered_header() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();
        let info = has_overlay(&sif).unwrap().unwrap();

        // ext superblock magic
        let file = std::fs::OpenOptions::new().write(true).open(&sif).unwrap();
        file.write_all_at(&[0, 0], info.offset + 1080).unwrap();
        drop(file);
        let before = std::fs::read(&sif).unwrap();

        let err = sync_overlay(&sif).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader { .. }));
        assert_eq!(std::fs::read(&sif).unwrap(), before);
        assert_eq!(has_overlay(&sif).unwrap().unwrap().digest, info.digest);
    }

    #[test]
    fn test_sync_without_overlay() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        assert!(matches!(sync_overlay(&sif), Err(Error::NoOverlay)));
    }

    #[test]
    fn test_seal_replaces_overlay() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        let ovl = write_overlay_file(
            dir.path(),
            &[("upper/etc/motd", "hello"), ("upper/var/.wh..opq", ""), ("work/junk", "")],
        );
        add_overlay(&sif, &ovl).unwrap();

        let tools = FakeTools::default();
        let work = tempdir().unwrap();
        seal_overlay(&sif, work.path(), &tools).unwrap();

        assert_eq!(tools.mounted(), 0);
        assert_eq!(tools.unmount_count(), 1);
        assert_eq!(has_overlay(&sif).unwrap(), None);
        assert_eq!(
            layer_kinds(&sif),
            vec![LayerMediaType::Tar, LayerMediaType::Squashfs]
        );

        let fimg = FileImage::load(&sif, LoadMode::ReadOnly).unwrap();
        let single = single_image(&fimg).unwrap();
        let paths: Vec<String> = squashfs_items(&single.image.layers()[1])
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert_eq!(paths, vec!["etc", "etc/motd", "var"]);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_seal_without_overlay_leaves_file() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(2));
        let before = std::fs::read(&sif).unwrap();
        let tools = FakeTools::default();

        let err = seal_overlay(&sif, dir.path(), &tools).unwrap_err();
        assert!(matches!(err, Error::NoOverlay));
        assert_eq!(std::fs::read(&sif).unwrap(), before);
        assert_eq!(tools.unmount_count(), 0);
    }

    #[test]
    fn test_seal_failure_unmounts_and_leaves_file() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();
        let before = std::fs::read(&sif).unwrap();

        let tools = FakeTools::failing_squashfs();
        let work = tempdir().unwrap();
        let err = seal_overlay(&sif, work.path(), &tools).unwrap_err();
        assert!(err.is_squashfs_conversion());
        assert_eq!(tools.mounted(), 0);
        assert_eq!(tools.unmount_count(), 1);
        assert_eq!(std::fs::read(&sif).unwrap(), before);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_seal_mount_failure_is_conversion() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();
        let info = has_overlay(&sif).unwrap().unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&sif).unwrap();
        file.write_all_at(&[0, 0], info.offset + 1080).unwrap();
        drop(file);
        let before = std::fs::read(&sif).unwrap();

        let tools = FakeTools::default();
        let work = tempdir().unwrap();
        let err = seal_overlay(&sif, work.path(), &tools).unwrap_err();
        assert!(err.is_squashfs_conversion());
        assert_eq!(tools.mounted(), 0);
        assert_eq!(tools.unmount_count(), 0);
        assert_eq!(std::fs::read(&sif).unwrap(), before);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_seal_unmount_failure_escalates() {
        let dir = tempdir().unwrap();
        let sif = write_image(dir.path(), &archive_image(1));
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/a", "a")])).unwrap();
        let before = std::fs::read(&sif).unwrap();

        let tools = FakeTools::default();
        tools
            .fail_unmount
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = seal_overlay(&sif, dir.path(), &tools).unwrap_err();
        assert!(matches!(err, Error::Unmount { .. }));
        assert_eq!(std::fs::read(&sif).unwrap(), before);
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let opts = TransformOptions::new(tools.clone());

        let img = to_squashfs(&archive_image(3), dir.path(), &opts).unwrap();
        assert_eq!(img.manifest().unwrap().layers.len(), 3);
        assert!(img.layers().iter().all(Layer::is_squashfs));

        let img = squash(&img, dir.path(), &opts).unwrap();
        let img = to_squashfs(&img, dir.path(), &opts).unwrap();
        assert_eq!(img.layers().len(), 1);
        assert!(img.layers()[0].is_squashfs());

        let sif = write_image(dir.path(), &img);
        add_overlay(&sif, &write_overlay_file(dir.path(), &[("upper/new", "n")])).unwrap();
        assert_eq!(
            layer_kinds(&sif),
            vec![LayerMediaType::Squashfs, LayerMediaType::Ext3]
        );

        let work = tempdir().unwrap();
        seal_overlay(&sif, work.path(), tools.as_ref()).unwrap();
        assert_eq!(
            layer_kinds(&sif),
            vec![LayerMediaType::Squashfs, LayerMediaType::Squashfs]
        );
        assert_eq!(has_overlay(&sif).unwrap(), None);
    }
}
