//! helpers for reading and re-emitting tar entries

use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{IoResultExt, Result};
use crate::types::{Xattr, PAX_XATTR_PREFIX};

/// label used for io errors on in-flight tar streams
pub(crate) const TAR_STREAM: &str = "<tar stream>";

/// relative path with `.` components, leading `/` and trailing `/` removed;
/// `None` for the archive root
pub fn normalize_path(path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// split `a/b/c` into (`a/b`, `c`); the parent of a top-level name is ""
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// proper ancestors of `path`, nearest first
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut rest = path;
    std::iter::from_fn(move || {
        let i = rest.rfind('/')?;
        rest = &rest[..i];
        Some(rest)
    })
}

/// header, normalized path and xattrs of one entry, detached from its stream
#[derive(Clone, Debug)]
pub struct EntryHead {
    pub header: tar::Header,
    pub path: String,
    pub link_name: Option<PathBuf>,
    pub xattrs: Vec<Xattr>,
}

impl EntryHead {
    /// `None` for entries naming the archive root
    pub fn read<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Option<Self>> {
        let raw_path = entry.path().with_path(TAR_STREAM)?.into_owned();
        let Some(path) = normalize_path(&raw_path) else {
            return Ok(None);
        };
        let link_name = entry
            .link_name()
            .with_path(TAR_STREAM)?
            .map(|l| l.into_owned());

        let mut xattrs = Vec::new();
        if let Some(exts) = entry.pax_extensions().with_path(TAR_STREAM)? {
            for ext in exts {
                let ext = ext.with_path(TAR_STREAM)?;
                if let Some(name) = ext.key().ok().and_then(|k| k.strip_prefix(PAX_XATTR_PREFIX)) {
                    xattrs.push(Xattr::new(name, ext.value_bytes()));
                }
            }
        }

        let mut header = entry.header().clone();
        header.set_size(entry.size());
        Ok(Some(Self {
            header,
            path,
            link_name,
            xattrs,
        }))
    }

    pub fn kind(&self) -> tar::EntryType {
        self.header.entry_type()
    }

    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    pub fn is_hard_link(&self) -> bool {
        self.kind().is_hard_link()
    }

    pub fn xattr(&self, name: &str) -> Option<&[u8]> {
        self.xattrs
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.as_slice())
    }

    pub fn set_xattr(&mut self, name: &str, value: &[u8]) {
        self.xattrs.retain(|x| x.name != name);
        self.xattrs.push(Xattr::new(name, value));
        self.xattrs.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn remove_xattr(&mut self, name: &str) {
        self.xattrs.retain(|x| x.name != name);
    }

    /// synthesized entry with no content
    pub fn empty(path: String, kind: tar::EntryType, mode: u32, like: &tar::Header) -> Self {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(0);
        header.set_uid(like.uid().unwrap_or(0));
        header.set_gid(like.gid().unwrap_or(0));
        header.set_mtime(like.mtime().unwrap_or(0));
        if kind == tar::EntryType::Char || kind == tar::EntryType::Block {
            let _ = header.set_device_major(0);
            let _ = header.set_device_minor(0);
        }
        Self {
            header,
            path,
            link_name: None,
            xattrs: Vec::new(),
        }
    }
}

/// append `head` with `data` as content, xattrs as PAX records
pub fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    head: &EntryHead,
    data: impl Read,
) -> Result<()> {
    if !head.xattrs.is_empty() {
        let keys: Vec<String> = head.xattrs.iter().map(Xattr::pax_key).collect();
        let records = keys
            .iter()
            .zip(&head.xattrs)
            .map(|(k, x)| (k.as_str(), x.value.as_slice()));
        builder.append_pax_extensions(records).with_path(TAR_STREAM)?;
    }

    let mut header = head.header.clone();
    if let Some(link) = &head.link_name {
        header.set_size(0);
        builder
            .append_link(&mut header, &head.path, link)
            .with_path(&head.path)?;
    } else if head.is_dir() {
        header.set_size(0);
        builder
            .append_data(&mut header, format!("{}/", head.path), io::empty())
            .with_path(&head.path)?;
    } else {
        builder
            .append_data(&mut header, &head.path, data)
            .with_path(&head.path)?;
    }
    Ok(())
}
