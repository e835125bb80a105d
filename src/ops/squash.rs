use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::digest::DigestWriter;
use crate::error::{IoResultExt, Result};
use crate::image::{overlay_index, ArchiveLayer, FileOpener, Image, ImageSource, Layer};
use crate::ops::archive::to_archive;
use crate::ops::tar_stream::{ancestors, append_entry, normalize_path, EntryHead, TAR_STREAM};
use crate::ops::whiteout::{classify, Whiteout};
use crate::ops::{scratch_dir, TransformOptions};
use crate::types::LayerMediaType;

/// what the layers above the one being read have already decided
#[derive(Default)]
struct MergeState {
    /// paths defined by an upper layer
    seen: HashSet<String>,
    /// paths an upper layer whited out
    deleted: HashSet<String>,
    /// directories an upper layer made opaque
    opaque: HashSet<String>,
    /// paths an upper layer defines as something other than a directory
    non_dir: HashSet<String>,
    root_opaque: bool,
}

impl MergeState {
    fn visible(&self, path: &str) -> bool {
        if self.root_opaque || self.seen.contains(path) || self.deleted.contains(path) {
            return false;
        }
        ancestors(path).all(|a| {
            !self.deleted.contains(a) && !self.opaque.contains(a) && !self.non_dir.contains(a)
        })
    }
}

/// merge every layer below the overlay into one tar layer
///
/// layers apply first to last; whiteouts in a layer delete matching paths
/// from the layers below it and are not carried into the result. a trailing
/// ext3 overlay is re-appended untouched. with fewer than two mergeable
/// layers the image is returned as is.
pub fn squash(img: &Image, work_dir: &Path, opts: &TransformOptions) -> Result<Image> {
    let overlay = overlay_index(img.layers())?;
    let base_len = overlay.unwrap_or(img.layers().len());
    if base_len < 2 {
        return Ok(img.clone());
    }

    let mut base = Vec::with_capacity(base_len);
    for layer in &img.layers()[..base_len] {
        opts.cancel.check()?;
        base.push(to_archive(layer, work_dir, opts)?);
    }

    let scratch = scratch_dir(work_dir, "squash-")?;
    let dest = scratch.path().join("squashed.tar");
    let file = File::create(&dest).with_path(&dest)?;
    let mut writer = DigestWriter::new(BufWriter::new(file));
    merge_layers(&base, &mut writer, opts)?;
    let (digest, size, mut inner) = writer.finish();
    inner.flush().with_path(&dest)?;
    drop(inner);

    let merged = ArchiveLayer::from_parts(
        LayerMediaType::Tar,
        digest,
        digest,
        size,
        Arc::new(FileOpener::in_scratch(&dest, scratch)),
    );
    tracing::debug!(layers = base_len, digest = %digest, size, "squashed layers");

    let mut layers = vec![Layer::Archive(merged)];
    if let Some(i) = overlay {
        layers.push(img.layers()[i].clone());
    }
    img.with_layers(layers)
}

/// two passes: decide winners top-down, then emit them bottom-up
fn merge_layers<W: Write>(layers: &[Layer], out: W, opts: &TransformOptions) -> Result<W> {
    let mut state = MergeState::default();
    let mut dirs: BTreeMap<String, EntryHead> = BTreeMap::new();
    // per layer: winning non-directory path -> ordinal of its entry
    let mut winners: Vec<HashMap<String, usize>> = vec![HashMap::new(); layers.len()];

    for (idx, layer) in layers.iter().enumerate().rev() {
        opts.cancel.check()?;
        let mut latest: HashMap<String, (usize, EntryHead)> = HashMap::new();
        let mut deleted = Vec::new();
        let mut opaque = Vec::new();

        let mut archive = tar::Archive::new(layer.open_uncompressed()?);
        for (ordinal, entry) in archive.entries().with_path(TAR_STREAM)?.enumerate() {
            let mut entry = entry.with_path(TAR_STREAM)?;
            let Some(head) = EntryHead::read(&mut entry)? else {
                continue;
            };
            match classify(&head.path) {
                Whiteout::Path(target) => deleted.push(target),
                Whiteout::Opaque(dir) => opaque.push(dir),
                Whiteout::None => {
                    latest.insert(head.path.clone(), (ordinal, head));
                }
            }
        }

        for (path, (ordinal, head)) in &latest {
            if !state.visible(path) {
                continue;
            }
            if head.is_dir() {
                dirs.insert(path.clone(), head.clone());
            } else {
                winners[idx].insert(path.clone(), *ordinal);
            }
        }

        for (path, (_, head)) in latest {
            if !head.is_dir() {
                state.non_dir.insert(path.clone());
            }
            state.seen.insert(path);
        }
        state.deleted.extend(deleted);
        for dir in opaque {
            if dir.is_empty() {
                state.root_opaque = true;
            } else {
                state.opaque.insert(dir);
            }
        }
    }

    let mut builder = tar::Builder::new(out);
    for head in dirs.values() {
        append_entry(&mut builder, head, io::empty())?;
    }

    let mut emitted = HashSet::new();
    let mut hard_links = Vec::new();
    for (idx, layer) in layers.iter().enumerate() {
        opts.cancel.check()?;
        if winners[idx].is_empty() {
            continue;
        }
        let mut archive = tar::Archive::new(layer.open_uncompressed()?);
        for (ordinal, entry) in archive.entries().with_path(TAR_STREAM)?.enumerate() {
            let mut entry = entry.with_path(TAR_STREAM)?;
            let Some(head) = EntryHead::read(&mut entry)? else {
                continue;
            };
            if winners[idx].get(&head.path) != Some(&ordinal) {
                continue;
            }
            if head.is_hard_link() {
                hard_links.push(head);
                continue;
            }
            append_entry(&mut builder, &head, &mut entry)?;
            emitted.insert(head.path);
        }
    }

    // a link whose target did not survive the merge would dangle
    for head in hard_links {
        let target = head.link_name.as_deref().and_then(normalize_path);
        match target {
            Some(t) if emitted.contains(&t) => append_entry(&mut builder, &head, io::empty())?,
            _ => tracing::warn!(path = %head.path, "dropping hard link to removed file"),
        }
    }

    builder.into_inner().with_path(TAR_STREAM)
}
