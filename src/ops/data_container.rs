//! data containers: a file or directory tree packed as a single squashfs
//! layer, tagged with the data container artifact type

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::container::{single_image, FileImage, LoadMode, Selector};
use crate::digest::DigestWriter;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{read_xattrs, FileMetadata, FileType};
use crate::image::{ArchiveLayer, FileOpener, Image, ImageSource, Layer};
use crate::ops::tar_stream::{append_entry, EntryHead, TAR_STREAM};
use crate::ops::writer::{ImageWriter, WriterOptions};
use crate::ops::scratch_dir;
use crate::types::{LayerMediaType, DATA_CONTAINER_ARTIFACT_TYPE, OCI_EMPTY};

/// write a data container holding `src` to `dest`
///
/// a regular file is stored under its base name; a directory contributes
/// its contents, not itself. only regular files and directories are
/// accepted. `opts` supplies tooling and spare capacity; squashing and the
/// artifact type are fixed.
pub fn write_data_container_from_path(
    src: &Path,
    dest: &Path,
    work_dir: &Path,
    mut opts: WriterOptions,
) -> Result<()> {
    let scratch = scratch_dir(work_dir, "data-")?;
    let tar_path = scratch.path().join("data.tar");
    let file = File::create(&tar_path).with_path(&tar_path)?;
    let writer = pack(src, DigestWriter::new(BufWriter::new(file)))?;
    let (digest, size, mut inner) = writer.finish();
    inner.flush().with_path(&tar_path)?;
    drop(inner);

    let layer = Layer::Archive(ArchiveLayer::from_parts(
        LayerMediaType::Tar,
        digest,
        digest,
        size,
        Arc::new(FileOpener::in_scratch(&tar_path, scratch)),
    ));
    let img = Image::new(b"{}".to_vec(), vec![layer])?.with_config_media_type(OCI_EMPTY);

    opts.squash = false;
    opts.squashfs_layers = true;
    opts.artifact_type = Some(DATA_CONTAINER_ARTIFACT_TYPE.to_string());
    ImageWriter::new(img, dest, work_dir, opts)?.write()
}

/// byte offset of the squashfs layer in the data container at `path`
pub fn data_container_layer_offset(path: &Path) -> Result<u64> {
    let fimg = FileImage::load(path, LoadMode::ReadOnly)?;
    let single = single_image(&fimg)?;
    let layers = single.image.layers();
    if layers.len() != 1 {
        return Err(Error::NotADataContainer(format!(
            "expected 1 layer, found {}",
            layers.len()
        )));
    }
    if !layers[0].is_squashfs() {
        return Err(Error::NotADataContainer(format!(
            "layer has media type {}",
            layers[0].media_type()
        )));
    }
    Ok(fimg.get_descriptor(Selector::BlobDigest(layers[0].digest()))?.offset)
}

fn pack<W: Write>(src: &Path, out: W) -> Result<W> {
    let meta = FileMetadata::from_path(src)?;
    let mut builder = tar::Builder::new(out);
    match meta.file_type {
        FileType::Regular => {
            let name = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::UnsupportedFileType {
                    path: src.to_path_buf(),
                    kind: "unnamed path",
                })?;
            append_path(&mut builder, src, name, &meta)?;
        }
        FileType::Directory => {
            for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Io {
                    path: src.to_path_buf(),
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walkdir error")),
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(src)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                let meta = FileMetadata::from_path(entry.path())?;
                append_path(&mut builder, entry.path(), rel, &meta)?;
            }
        }
        other => {
            return Err(Error::UnsupportedFileType {
                path: src.to_path_buf(),
                kind: other.name(),
            })
        }
    }
    builder.into_inner().with_path(TAR_STREAM)
}

fn append_path<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: String,
    meta: &FileMetadata,
) -> Result<()> {
    let kind = match meta.file_type {
        FileType::Regular => tar::EntryType::Regular,
        FileType::Directory => tar::EntryType::Directory,
        other => {
            return Err(Error::UnsupportedFileType {
                path: path.to_path_buf(),
                kind: other.name(),
            })
        }
    };

    let mut header = tar::Header::new_ustar();
    header.set_entry_type(kind);
    header.set_mode(meta.mode);
    header.set_uid(meta.uid as u64);
    header.set_gid(meta.gid as u64);
    header.set_mtime(meta.mtime.max(0) as u64);
    header.set_size(if kind.is_file() { meta.size } else { 0 });

    let head = EntryHead {
        header,
        path: name,
        link_name: None,
        xattrs: read_xattrs(path)?,
    };
    if kind.is_file() {
        let file = File::open(path).with_path(path)?;
        append_entry(builder, &head, file)
    } else {
        append_entry(builder, &head, io::empty())
    }
}
