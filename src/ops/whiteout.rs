//! whiteout conventions
//!
//! OCI archive layers mark deletions AUFS-style: an empty `.wh.<name>` file
//! removes `<name>`, and `.wh..wh..opq` inside a directory hides everything
//! the lower layers put there. squashfs layers are mounted through
//! overlayfs, which expects a 0:0 character device in place of the deleted
//! name and a `trusted.overlay.opaque=y` xattr on opaque directories.

use std::collections::HashSet;
use std::io::{self, Read, Write};

use crate::error::{IoResultExt, Result};
use crate::image::Layer;
use crate::ops::tar_stream::{append_entry, join_path, split_path, EntryHead, TAR_STREAM};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// marker fuse-overlayfs leaves in opaque directories; valid in neither
/// convention and dropped when sealing an overlay
pub const FUSE_OVERLAY_OPAQUE_MARKER: &str = ".wh..opq";

/// what an AUFS-style entry path means
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Whiteout {
    /// not a marker
    None,
    /// deletes the named path
    Path(String),
    /// makes the named directory opaque; "" is the root
    Opaque(String),
}

pub fn classify(path: &str) -> Whiteout {
    let (parent, name) = split_path(path);
    if name == OPAQUE_MARKER {
        Whiteout::Opaque(parent.to_string())
    } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
        Whiteout::Path(join_path(parent, target))
    } else {
        Whiteout::None
    }
}

/// true for an overlayfs whiteout: a character device numbered 0:0
pub fn is_overlay_whiteout(head: &EntryHead) -> bool {
    head.kind() == tar::EntryType::Char
        && matches!(head.header.device_major(), Ok(Some(0)) | Ok(None))
        && matches!(head.header.device_minor(), Ok(Some(0)) | Ok(None))
}

pub fn is_overlay_opaque(head: &EntryHead) -> bool {
    head.is_dir() && head.xattr(OVERLAY_OPAQUE_XATTR) == Some(b"y".as_slice())
}

/// rewrite the layer's AUFS markers into overlayfs form
///
/// reads the layer twice: once to learn which opaque directories have an
/// entry of their own, once to emit.
pub fn aufs_to_overlay<W: Write>(layer: &Layer, out: W) -> Result<W> {
    let mut opaque = HashSet::new();
    let mut dirs = HashSet::new();
    {
        let mut archive = tar::Archive::new(layer.open_uncompressed()?);
        for entry in archive.entries().with_path(TAR_STREAM)? {
            let mut entry = entry.with_path(TAR_STREAM)?;
            let Some(head) = EntryHead::read(&mut entry)? else {
                continue;
            };
            if let Whiteout::Opaque(dir) = classify(&head.path) {
                opaque.insert(dir);
            } else if head.is_dir() {
                dirs.insert(head.path);
            }
        }
    }

    let mut builder = tar::Builder::new(out);
    let mut archive = tar::Archive::new(layer.open_uncompressed()?);
    for entry in archive.entries().with_path(TAR_STREAM)? {
        let mut entry = entry.with_path(TAR_STREAM)?;
        let Some(mut head) = EntryHead::read(&mut entry)? else {
            continue;
        };
        match classify(&head.path) {
            Whiteout::Opaque(dir) => {
                if dir.is_empty() {
                    tracing::debug!("ignoring opaque marker at layer root");
                } else if !dirs.contains(&dir) {
                    let mut synth =
                        EntryHead::empty(dir, tar::EntryType::Directory, 0o755, &head.header);
                    synth.set_xattr(OVERLAY_OPAQUE_XATTR, b"y");
                    append_entry(&mut builder, &synth, io::empty())?;
                }
            }
            Whiteout::Path(target) => {
                let wh = EntryHead::empty(target, tar::EntryType::Char, 0, &head.header);
                append_entry(&mut builder, &wh, io::empty())?;
            }
            Whiteout::None => {
                if head.is_dir() && opaque.contains(&head.path) {
                    head.set_xattr(OVERLAY_OPAQUE_XATTR, b"y");
                }
                append_entry(&mut builder, &head, &mut entry)?;
            }
        }
    }
    builder.into_inner().with_path(TAR_STREAM)
}

/// rewrite overlayfs whiteouts in a tar stream into AUFS markers
pub fn overlay_to_aufs<R: Read, W: Write>(input: R, out: W) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    let mut archive = tar::Archive::new(input);
    for entry in archive.entries().with_path(TAR_STREAM)? {
        let mut entry = entry.with_path(TAR_STREAM)?;
        let Some(mut head) = EntryHead::read(&mut entry)? else {
            continue;
        };
        if is_overlay_whiteout(&head) {
            let (parent, name) = split_path(&head.path);
            let marker = join_path(parent, &format!("{}{}", WHITEOUT_PREFIX, name));
            let wh = EntryHead::empty(marker, tar::EntryType::Regular, 0o600, &head.header);
            append_entry(&mut builder, &wh, io::empty())?;
        } else if is_overlay_opaque(&head) {
            head.remove_xattr(OVERLAY_OPAQUE_XATTR);
            append_entry(&mut builder, &head, io::empty())?;
            let marker = join_path(&head.path, OPAQUE_MARKER);
            let opq = EntryHead::empty(marker, tar::EntryType::Regular, 0o600, &head.header);
            append_entry(&mut builder, &opq, io::empty())?;
        } else {
            append_entry(&mut builder, &head, &mut entry)?;
        }
    }
    builder.into_inner().with_path(TAR_STREAM)
}
