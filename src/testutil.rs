//! test fixtures shared across modules
//!
//! fake squashfs and ext3 images are a valid 2048-byte header followed by a
//! plain tar stream, which is enough for every code path that inspects
//! headers, hashes bytes, or goes through [`FsTools`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::header::{ext3_header_template, squashfs_header_template, HEADER_WINDOW};
use crate::fs::{check_ext3_header, check_squashfs_header};
use crate::image::{ArchiveLayer, BytesOpener, FsImageLayer, Image, Layer};
use crate::tools::FsTools;
use crate::types::LayerMediaType;

/// one entry of a test tar stream
#[derive(Clone, Debug)]
pub enum TestEntry {
    File(&'static str, &'static str),
    Dir(&'static str),
    /// overlayfs-style whiteout, a 0:0 char device
    CharDev(&'static str),
    /// directory carrying a PAX xattr record
    DirXattr(&'static str, &'static str, &'static str),
}

/// build a deterministic tar stream
pub fn tar_with(entries: &[TestEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_ustar();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match entry {
            TestEntry::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, data.as_bytes()).unwrap();
            }
            TestEntry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            TestEntry::CharDev(path) => {
                header.set_entry_type(tar::EntryType::Char);
                header.set_mode(0o600);
                header.set_size(0);
                header.set_device_major(0).unwrap();
                header.set_device_minor(0).unwrap();
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            TestEntry::DirXattr(path, name, value) => {
                let key = format!("SCHILY.xattr.{}", name);
                builder
                    .append_pax_extensions([(key.as_str(), value.as_bytes())])
                    .unwrap();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// tar stream of regular files
pub fn tar_bytes(files: &[(&'static str, &'static str)]) -> Vec<u8> {
    let entries: Vec<TestEntry> = files.iter().map(|&(p, d)| TestEntry::File(p, d)).collect();
    tar_with(&entries)
}

pub fn archive_layer_from(entries: &[TestEntry]) -> Layer {
    let opener = Arc::new(BytesOpener::new(tar_with(entries)));
    Layer::Archive(ArchiveLayer::from_opener(opener, LayerMediaType::Tar).unwrap())
}

/// image with `n` tar layers; layer i holds `file<i>` containing `LAYER <i>`
pub fn archive_image(n: usize) -> Image {
    const NAMES: [&str; 5] = ["file1", "file2", "file3", "file4", "file5"];
    const DATA: [&str; 5] = ["LAYER 1", "LAYER 2", "LAYER 3", "LAYER 4", "LAYER 5"];
    let layers = (0..n)
        .map(|i| archive_layer_from(&[TestEntry::File(NAMES[i], DATA[i])]))
        .collect();
    Image::from_layers(layers).unwrap()
}

/// fake ext3 image: header window then a tar of `files`
pub fn fake_ext3(files: &[(&'static str, &'static str)]) -> Vec<u8> {
    let mut data = ext3_header_template().to_vec();
    data.extend_from_slice(&tar_bytes(files));
    data
}

pub fn ext3_layer(files: &[(&'static str, &'static str)]) -> Layer {
    let opener = Arc::new(BytesOpener::new(fake_ext3(files)));
    Layer::Ext3(FsImageLayer::from_opener(opener, crate::fs::FsType::Ext3).unwrap())
}

/// fake squashfs image wrapping a tar stream
pub fn fake_squashfs(tar: &[u8]) -> Vec<u8> {
    let mut data = squashfs_header_template().to_vec();
    data.extend_from_slice(tar);
    data
}

pub fn squashfs_layer_from(entries: &[TestEntry]) -> Layer {
    let opener = Arc::new(BytesOpener::new(fake_squashfs(&tar_with(entries))));
    Layer::Squashfs(FsImageLayer::from_opener(opener, crate::fs::FsType::Squashfs).unwrap())
}

/// decoded tar entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TarItem {
    pub path: String,
    pub kind: tar::EntryType,
    pub data: Vec<u8>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

pub fn read_tar(reader: impl Read) -> Vec<TarItem> {
    let mut archive = tar::Archive::new(reader);
    let mut items = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        let kind = entry.header().entry_type();
        let mut xattrs = BTreeMap::new();
        if let Some(exts) = entry.pax_extensions().unwrap() {
            for ext in exts {
                let ext = ext.unwrap();
                if let Some(name) = ext.key().ok().and_then(|k| k.strip_prefix("SCHILY.xattr.")) {
                    xattrs.insert(name.to_string(), ext.value_bytes().to_vec());
                }
            }
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        items.push(TarItem {
            path,
            kind,
            data,
            xattrs,
        });
    }
    items
}

pub fn read_tar_paths(reader: impl Read) -> Vec<String> {
    read_tar(reader).into_iter().map(|i| i.path).collect()
}

/// contents of a fake squashfs layer as tar items
pub fn squashfs_items(layer: &Layer) -> Vec<TarItem> {
    let mut data = Vec::new();
    layer.open().unwrap().read_to_end(&mut data).unwrap();
    check_squashfs_header(&data).unwrap();
    read_tar(&data[HEADER_WINDOW..])
}

/// [`FsTools`] over the fake image formats, recording mounts
#[derive(Debug, Default)]
pub struct FakeTools {
    mounted: AtomicUsize,
    unmounts: AtomicUsize,
    conversions: AtomicUsize,
    pub fail_squashfs: AtomicBool,
    pub fail_unmount: AtomicBool,
}

impl FakeTools {
    pub fn failing_squashfs() -> Self {
        let tools = Self::default();
        tools.fail_squashfs.store(true, Ordering::SeqCst);
        tools
    }

    /// mounts not yet unmounted
    pub fn mounted(&self) -> usize {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    /// squashfs images built so far
    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }

    fn check_fail(&self, tool: &str) -> Result<()> {
        if self.fail_squashfs.load(Ordering::SeqCst) {
            return Err(Error::Tool {
                tool: tool.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

impl FsTools for FakeTools {
    fn tar_to_squashfs(&self, tar: &mut dyn Read, dest: &Path) -> Result<()> {
        self.check_fail("mksquashfs")?;
        let mut out = File::create(dest).with_path(dest)?;
        out.write_all(&squashfs_header_template()).with_path(dest)?;
        io::copy(tar, &mut out).with_path(dest)?;
        self.conversions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn squashfs_to_tar(&self, image: &Path, out: &mut dyn Write) -> Result<()> {
        let data = fs::read(image).with_path(image)?;
        check_squashfs_header(&data)?;
        out.write_all(&data[HEADER_WINDOW..]).with_path(image)?;
        Ok(())
    }

    fn dir_to_squashfs(&self, src: &Path, dest: &Path, exclude_names: &[String]) -> Result<()> {
        self.check_fail("mksquashfs")?;
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        let walker = walkdir::WalkDir::new(src)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !exclude_names
                    .iter()
                    .any(|n| e.file_name().to_string_lossy() == n.as_str())
            });
        for entry in walker {
            let entry = entry.map_err(|e| Error::Tool {
                tool: "mksquashfs".to_string(),
                message: e.to_string(),
            })?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            builder
                .append_path_with_name(entry.path(), rel)
                .with_path(entry.path())?;
        }
        let tar = builder.into_inner().with_path(dest)?;
        fs::write(dest, fake_squashfs(&tar)).with_path(dest)?;
        self.conversions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mount_ext3(&self, image: &Path, offset: u64, mnt: &Path) -> Result<()> {
        let mut file = File::open(image).with_path(image)?;
        file.seek(SeekFrom::Start(offset)).with_path(image)?;
        let mut header = [0u8; HEADER_WINDOW];
        file.read_exact(&mut header).with_path(image)?;
        check_ext3_header(&header).map_err(|e| Error::Mount {
            path: mnt.to_path_buf(),
            message: e.to_string(),
        })?;
        tar::Archive::new(file).unpack(mnt).with_path(mnt)?;
        self.mounted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&self, mnt: &Path) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(Error::Unmount {
                path: mnt.to_path_buf(),
                message: "simulated failure".to_string(),
            });
        }
        for entry in fs::read_dir(mnt).with_path(mnt)? {
            let path = entry.with_path(mnt)?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path).with_path(&path)?;
            } else {
                fs::remove_file(&path).with_path(&path)?;
            }
        }
        self.mounted.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
