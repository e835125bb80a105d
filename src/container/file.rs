use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::cancel::CancelToken;
use crate::container::format::{align_up, DataType, Header, RawDescriptor, DESCRIPTOR_SIZE, HEADER_SIZE};
use crate::container::{IndexPlan, PlanBlob};
use crate::digest::{Digest, DigestWriter};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic;
use crate::image::BlobOpener;
use crate::types::{ImageIndex, Manifest, OCI_INDEX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    ReadOnly,
    /// exclusive access; holds a non-blocking flock for the handle's lifetime
    ReadWrite,
}

/// how to pick a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    Id(u32),
    /// an OCI blob by content digest
    BlobDigest(Digest),
    RootIndex,
}

/// handle on a container file
///
/// mutations (`set_descriptor_digest`, `add_object`, `delete_object`) are
/// staged in memory and only become visible to readers of the file at
/// [`FileImage::commit`]. dropping a handle with uncommitted changes discards
/// them, including any object bytes appended past the committed end.
pub struct FileImage {
    path: PathBuf,
    file: File,
    mode: LoadMode,
    header: Header,
    slots: Vec<Option<RawDescriptor>>,
    /// end of appended data, committed or staged
    append_end: u64,
    committed_len: u64,
    dirty: bool,
    _lock: Option<Flock<File>>,
}

impl FileImage {
    /// write a new container holding `plan` to `dest`, replacing any existing
    /// file atomically
    pub fn write(dest: &Path, plan: &IndexPlan, spare: u32) -> Result<()> {
        Self::write_cancellable(dest, plan, spare, &CancelToken::new())
    }

    /// like [`FileImage::write`], checking `cancel` between blobs and before
    /// the final rename
    pub fn write_cancellable(
        dest: &Path,
        plan: &IndexPlan,
        spare: u32,
        cancel: &CancelToken,
    ) -> Result<()> {
        let blobs = plan.unique_blobs();
        let capacity = blobs.len() as u32 + 1 + spare;

        write_atomic(dest, |file, tmp| {
            let mut header = Header::new(capacity);
            let mut slots: Vec<Option<RawDescriptor>> = vec![None; capacity as usize];
            let mut cursor = header.data_offset;

            for (i, blob) in blobs.iter().enumerate() {
                cancel.check()?;
                let offset = align_up(cursor);
                let size = copy_blob(file, tmp, offset, blob)?;
                slots[i] = Some(RawDescriptor {
                    id: i as u32 + 1,
                    data_type: DataType::Blob,
                    offset,
                    size,
                    digest: blob.digest,
                });
                cursor = offset + size;
            }

            let offset = align_up(cursor);
            file.write_all_at(&plan.root_index, offset).with_path(tmp)?;
            slots[blobs.len()] = Some(RawDescriptor {
                id: blobs.len() as u32 + 1,
                data_type: DataType::RootIndex,
                offset,
                size: plan.root_index.len() as u64,
                digest: Digest::of_bytes(&plan.root_index),
            });
            header.data_end = offset + plan.root_index.len() as u64;

            file.write_all_at(&encode_table(&header, &slots), 0)
                .with_path(tmp)?;
            file.set_len(header.data_end).with_path(tmp)?;
            cancel.check()
        })?;

        tracing::debug!(dest = %dest.display(), blobs = blobs.len(), capacity, "wrote container");
        Ok(())
    }

    pub fn load(path: &Path, mode: LoadMode) -> Result<Self> {
        let file = match mode {
            LoadMode::ReadOnly => File::open(path),
            LoadMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path),
        }
        .with_path(path)?;

        let lock = match mode {
            LoadMode::ReadOnly => None,
            LoadMode::ReadWrite => {
                let handle = file.try_clone().with_path(path)?;
                let flock = Flock::lock(handle, FlockArg::LockExclusiveNonblock)
                    .map_err(|_| Error::LockContention)?;
                Some(flock)
            }
        };

        let len = file.metadata().with_path(path)?.len();
        let mut hdr = [0u8; HEADER_SIZE as usize];
        if len < HEADER_SIZE {
            return Err(Error::NotAContainer(path.to_path_buf()));
        }
        file.read_exact_at(&mut hdr, 0).with_path(path)?;
        if !Header::has_magic(&hdr) {
            return Err(Error::NotAContainer(path.to_path_buf()));
        }
        let header = Header::decode(&hdr)?;
        if HEADER_SIZE + header.table_size() > len || header.data_offset > len {
            return Err(Error::CorruptContainer(format!(
                "descriptor table of {} slots exceeds file size {}",
                header.capacity, len
            )));
        }

        let mut table = vec![0u8; header.table_size() as usize];
        file.read_exact_at(&mut table, HEADER_SIZE).with_path(path)?;
        let mut slots = Vec::with_capacity(header.capacity as usize);
        for chunk in table.chunks(DESCRIPTOR_SIZE as usize) {
            let desc = RawDescriptor::decode(chunk)?;
            if let Some(d) = &desc {
                if d.end() > len || d.offset < header.data_offset {
                    return Err(Error::CorruptContainer(format!(
                        "descriptor {} out of bounds",
                        d.id
                    )));
                }
            }
            slots.push(desc);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mode,
            header,
            slots,
            append_end: header.data_end.max(len),
            committed_len: len,
            dirty: false,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.header.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// all used descriptors of `data_type`, in table order
    pub fn get_descriptors(&self, data_type: DataType) -> Vec<RawDescriptor> {
        self.slots
            .iter()
            .flatten()
            .filter(|d| d.data_type == data_type)
            .copied()
            .collect()
    }

    pub fn get_descriptor(&self, selector: Selector) -> Result<RawDescriptor> {
        let found = self.slots.iter().flatten().find(|d| match selector {
            Selector::Id(id) => d.id == id,
            Selector::BlobDigest(digest) => d.data_type == DataType::Blob && d.digest == digest,
            Selector::RootIndex => d.data_type == DataType::RootIndex,
        });
        found.copied().ok_or_else(|| {
            Error::DescriptorNotFound(match selector {
                Selector::Id(id) => format!("id {}", id),
                Selector::BlobDigest(digest) => digest.to_string(),
                Selector::RootIndex => "root index".to_string(),
            })
        })
    }

    fn has_blob(&self, digest: Digest) -> bool {
        self.get_descriptor(Selector::BlobDigest(digest)).is_ok()
    }

    pub fn read_object(&self, desc: &RawDescriptor) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; desc.size as usize];
        self.file
            .read_exact_at(&mut buf, desc.offset)
            .with_path(&self.path)?;
        Ok(buf)
    }

    /// reusable opener over an object's bytes
    pub fn blob_opener(&self, desc: &RawDescriptor) -> BlobOpener {
        BlobOpener::new(&self.path, desc.offset, desc.size)
    }

    pub fn root_index(&self) -> Result<ImageIndex> {
        let desc = self.get_descriptor(Selector::RootIndex)?;
        Ok(serde_json::from_slice(&self.read_object(&desc)?)?)
    }

    /// blob contents by digest
    pub fn read_blob(&self, digest: Digest) -> Result<Vec<u8>> {
        let desc = self.get_descriptor(Selector::BlobDigest(digest))?;
        self.read_object(&desc)
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode != LoadMode::ReadWrite {
            return Err(Error::Io {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "container loaded read-only"),
            });
        }
        Ok(())
    }

    /// record a new digest for an existing object without moving its bytes
    pub fn set_descriptor_digest(&mut self, id: u32, digest: Digest) -> Result<()> {
        self.require_writable()?;
        let slot = self
            .slots
            .iter_mut()
            .flatten()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::DescriptorNotFound(format!("id {}", id)))?;
        slot.digest = digest;
        self.dirty = true;
        Ok(())
    }

    /// append an object, verifying its content against `digest`
    pub fn add_object(
        &mut self,
        data_type: DataType,
        digest: Digest,
        src: &mut dyn Read,
    ) -> Result<RawDescriptor> {
        self.require_writable()?;
        let slot_index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::NoFreeDescriptor)?;
        let id = self.slots.iter().flatten().map(|d| d.id).max().unwrap_or(0) + 1;

        let offset = align_up(self.append_end);
        self.dirty = true;
        self.file
            .seek(SeekFrom::Start(offset))
            .with_path(&self.path)?;
        let mut writer = DigestWriter::new(&mut self.file);
        io::copy(src, &mut writer).with_path(&self.path)?;
        let (actual, size, _) = writer.finish();
        if actual != digest {
            return Err(Error::DigestMismatch {
                expected: digest,
                actual,
            });
        }

        let desc = RawDescriptor {
            id,
            data_type,
            offset,
            size,
            digest,
        };
        self.slots[slot_index] = Some(desc);
        self.append_end = offset + size;
        Ok(desc)
    }

    pub fn add_bytes(&mut self, data_type: DataType, data: &[u8]) -> Result<RawDescriptor> {
        self.add_object(data_type, Digest::of_bytes(data), &mut &data[..])
    }

    pub fn delete_object(&mut self, id: u32) -> Result<()> {
        self.require_writable()?;
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.map(|d| d.id) == Some(id))
            .ok_or_else(|| Error::DescriptorNotFound(format!("id {}", id)))?;
        *slot = None;
        self.dirty = true;
        Ok(())
    }

    /// make staged changes durable: one write of header and table, then
    /// truncate any trailing space no descriptor uses
    pub fn commit(&mut self) -> Result<()> {
        self.require_writable()?;
        if !self.dirty {
            return Ok(());
        }
        self.file.sync_data().with_path(&self.path)?;

        let data_end = self
            .slots
            .iter()
            .flatten()
            .map(|d| d.end())
            .max()
            .unwrap_or(self.header.data_offset)
            .max(self.header.data_offset);
        let mut header = self.header;
        header.data_end = data_end;

        self.file
            .write_all_at(&encode_table(&header, &self.slots), 0)
            .with_path(&self.path)?;
        if data_end < self.append_end.max(self.committed_len) {
            self.file.set_len(data_end).with_path(&self.path)?;
        }
        self.file.sync_all().with_path(&self.path)?;

        self.header = header;
        self.append_end = data_end;
        self.committed_len = data_end;
        self.dirty = false;
        Ok(())
    }

    /// replace the root index with `plan`'s, adding blobs it needs and
    /// dropping blobs nothing references any more, in one commit
    pub fn update(&mut self, plan: &IndexPlan) -> Result<()> {
        self.require_writable()?;
        let index: ImageIndex = serde_json::from_slice(&plan.root_index)?;
        let blobs = plan.unique_blobs();
        let plan_blobs: HashMap<Digest, &PlanBlob> = blobs.iter().map(|b| (b.digest, *b)).collect();
        let reachable = self.reachable(&index, &plan_blobs)?;

        // free slots first so the additions fit
        let stale: Vec<u32> = self
            .slots
            .iter()
            .flatten()
            .filter(|d| match d.data_type {
                DataType::Blob => !reachable.contains(&d.digest),
                DataType::RootIndex => true,
                DataType::Signature => false,
            })
            .map(|d| d.id)
            .collect();
        for id in stale {
            self.delete_object(id)?;
        }

        for blob in blobs {
            if !reachable.contains(&blob.digest) || self.has_blob(blob.digest) {
                continue;
            }
            let mut src = blob.source.open()?;
            self.add_object(DataType::Blob, blob.digest, &mut src)?;
        }
        self.add_bytes(DataType::RootIndex, &plan.root_index)?;
        self.commit()
    }

    /// digests of every blob reachable from `index`
    fn reachable(
        &self,
        index: &ImageIndex,
        plan_blobs: &HashMap<Digest, &PlanBlob>,
    ) -> Result<HashSet<Digest>> {
        let mut seen = HashSet::new();
        let mut stack: Vec<(String, Digest)> = index
            .manifests
            .iter()
            .map(|d| (d.media_type.clone(), d.digest))
            .collect();

        while let Some((media_type, digest)) = stack.pop() {
            if !seen.insert(digest) {
                continue;
            }
            let content = match plan_blobs.get(&digest) {
                Some(blob) => crate::image::opener::read_all(blob.source.as_ref())?,
                None => self.read_blob(digest)?,
            };
            if media_type == OCI_INDEX {
                let nested: ImageIndex = serde_json::from_slice(&content)?;
                stack.extend(nested.manifests.iter().map(|d| (d.media_type.clone(), d.digest)));
            } else {
                let manifest: Manifest = serde_json::from_slice(&content)?;
                seen.insert(manifest.config.digest);
                seen.extend(manifest.layers.iter().map(|l| l.digest));
            }
        }
        Ok(seen)
    }
}

impl Drop for FileImage {
    fn drop(&mut self) {
        if self.dirty && self.mode == LoadMode::ReadWrite {
            tracing::debug!(path = %self.path.display(), "discarding uncommitted container changes");
            if let Err(e) = self.file.set_len(self.committed_len) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to discard appended data");
            }
        }
    }
}

fn encode_table(header: &Header, slots: &[Option<RawDescriptor>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity((HEADER_SIZE + header.table_size()) as usize);
    buf.extend_from_slice(&header.encode());
    for slot in slots {
        match slot {
            Some(d) => buf.extend_from_slice(&d.encode()),
            None => buf.extend_from_slice(&[0u8; DESCRIPTOR_SIZE as usize]),
        }
    }
    buf
}

/// copy a plan blob into `file` at `offset`, verifying its digest
fn copy_blob(file: &mut File, tmp: &Path, offset: u64, blob: &PlanBlob) -> Result<u64> {
    file.seek(SeekFrom::Start(offset)).with_path(tmp)?;
    let mut src = blob.source.open()?;
    let mut writer = DigestWriter::new(&mut *file);
    io::copy(&mut src, &mut writer).with_path(tmp)?;
    let (digest, size, _) = writer.finish();
    if digest != blob.digest {
        return Err(Error::DigestMismatch {
            expected: blob.digest,
            actual: digest,
        });
    }
    if size != blob.size {
        return Err(Error::CorruptContainer(format!(
            "blob {} is {} bytes, expected {}",
            blob.digest, size, blob.size
        )));
    }
    Ok(size)
}
