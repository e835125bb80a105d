//! filesystem image header checks
//!
//! Every file accepted as an ext3 or squashfs layer source is checked here
//! first; the first [`HEADER_WINDOW`] bytes must be readable.

use std::io::Read;

use crate::error::{Error, Result};
use crate::types::LayerMediaType;

/// number of leading bytes inspected before trusting a filesystem image
pub const HEADER_WINDOW: usize = 2048;

// ext superblock lives at 1024; offsets below are absolute
const EXT_MAGIC_OFFSET: usize = 1080;
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];
const EXT_INCOMPAT_OFFSET: usize = 1120;
const EXT_RO_COMPAT_OFFSET: usize = 1124;

// filetype | recover | journal_dev | meta_bg
const EXT3_INCOMPAT_SUPPORTED: u32 = 0x0002 | 0x0004 | 0x0008 | 0x0010;
// sparse_super | large_file | btree_dir
const EXT3_RO_COMPAT_SUPPORTED: u32 = 0x0001 | 0x0002 | 0x0004;

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const SQUASHFS_COMPRESSION_OFFSET: usize = 20;
const SQUASHFS_MAJOR_OFFSET: usize = 28;
const SQUASHFS_MAJOR: u16 = 4;
// gzip, lzma, lzo, xz, lz4, zstd
const SQUASHFS_MAX_COMPRESSION_ID: u16 = 6;

/// filesystem images accepted as layer sources
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    Ext3,
    Squashfs,
}

impl FsType {
    pub fn name(&self) -> &'static str {
        match self {
            FsType::Ext3 => "ext3",
            FsType::Squashfs => "squashfs",
        }
    }

    pub fn media_type(&self) -> LayerMediaType {
        match self {
            FsType::Ext3 => LayerMediaType::Ext3,
            FsType::Squashfs => LayerMediaType::Squashfs,
        }
    }

    /// validate a header window for this filesystem type
    pub fn check(&self, header: &[u8]) -> Result<()> {
        match self {
            FsType::Ext3 => check_ext3_header(header),
            FsType::Squashfs => check_squashfs_header(header),
        }
    }

    /// read the header window from `reader` and validate it
    pub fn check_reader<R: Read + ?Sized>(&self, reader: &mut R) -> Result<()> {
        let mut buf = [0u8; HEADER_WINDOW];
        reader.read_exact(&mut buf).map_err(|_| Error::HeaderTooShort {
            fs_type: self.name(),
            expected: HEADER_WINDOW,
        })?;
        self.check(&buf)
    }
}

fn le_u16(b: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([b[offset], b[offset + 1]])
}

fn le_u32(b: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
}

fn invalid(fs: FsType, reason: impl Into<String>) -> Error {
    Error::InvalidHeader {
        fs_type: fs.name(),
        reason: reason.into(),
    }
}

/// check for an ext superblock whose feature set an ext3 driver can mount
pub fn check_ext3_header(b: &[u8]) -> Result<()> {
    if b.len() < HEADER_WINDOW {
        return Err(Error::HeaderTooShort {
            fs_type: FsType::Ext3.name(),
            expected: HEADER_WINDOW,
        });
    }
    if b[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2] != EXT_MAGIC {
        return Err(invalid(FsType::Ext3, "ext superblock magic not found"));
    }

    let incompat = le_u32(b, EXT_INCOMPAT_OFFSET);
    if incompat & !EXT3_INCOMPAT_SUPPORTED != 0 {
        return Err(invalid(
            FsType::Ext3,
            format!("unsupported incompat features {:#x}", incompat & !EXT3_INCOMPAT_SUPPORTED),
        ));
    }
    let ro_compat = le_u32(b, EXT_RO_COMPAT_OFFSET);
    if ro_compat & !EXT3_RO_COMPAT_SUPPORTED != 0 {
        return Err(invalid(
            FsType::Ext3,
            format!(
                "unsupported read-only compat features {:#x}",
                ro_compat & !EXT3_RO_COMPAT_SUPPORTED
            ),
        ));
    }
    Ok(())
}

/// check for a squashfs 4.x superblock
pub fn check_squashfs_header(b: &[u8]) -> Result<()> {
    if b.len() < HEADER_WINDOW {
        return Err(Error::HeaderTooShort {
            fs_type: FsType::Squashfs.name(),
            expected: HEADER_WINDOW,
        });
    }
    if &b[..4] != SQUASHFS_MAGIC {
        return Err(invalid(FsType::Squashfs, "squashfs magic not found"));
    }
    let major = le_u16(b, SQUASHFS_MAJOR_OFFSET);
    if major != SQUASHFS_MAJOR {
        return Err(invalid(
            FsType::Squashfs,
            format!("unsupported squashfs version {}", major),
        ));
    }
    let compression = le_u16(b, SQUASHFS_COMPRESSION_OFFSET);
    if compression == 0 || compression > SQUASHFS_MAX_COMPRESSION_ID {
        return Err(invalid(
            FsType::Squashfs,
            format!("unknown compression id {}", compression),
        ));
    }
    Ok(())
}

/// a minimal header window that passes [`check_ext3_header`]
pub fn ext3_header_template() -> [u8; HEADER_WINDOW] {
    let mut b = [0u8; HEADER_WINDOW];
    b[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2].copy_from_slice(&EXT_MAGIC);
    // has_journal
    b[1116..1120].copy_from_slice(&0x0004u32.to_le_bytes());
    b[EXT_INCOMPAT_OFFSET..EXT_INCOMPAT_OFFSET + 4].copy_from_slice(&0x0002u32.to_le_bytes());
    b[EXT_RO_COMPAT_OFFSET..EXT_RO_COMPAT_OFFSET + 4].copy_from_slice(&0x0001u32.to_le_bytes());
    b
}

/// a minimal header window that passes [`check_squashfs_header`]
pub fn squashfs_header_template() -> [u8; HEADER_WINDOW] {
    let mut b = [0u8; HEADER_WINDOW];
    b[..4].copy_from_slice(SQUASHFS_MAGIC);
    b[SQUASHFS_COMPRESSION_OFFSET..SQUASHFS_COMPRESSION_OFFSET + 2]
        .copy_from_slice(&1u16.to_le_bytes());
    b[SQUASHFS_MAJOR_OFFSET..SQUASHFS_MAJOR_OFFSET + 2]
        .copy_from_slice(&SQUASHFS_MAJOR.to_le_bytes());
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext3_valid() {
        assert!(check_ext3_header(&ext3_header_template()).is_ok());
    }

    #[test]
    fn test_ext3_bad_magic() {
        let b = [0u8; HEADER_WINDOW];
        assert!(matches!(
            check_ext3_header(&b),
            Err(Error::InvalidHeader { fs_type: "ext3", .. })
        ));
    }

    #[test]
    fn test_ext4_extents_rejected() {
        let mut b = ext3_header_template();
        // extents
        b[EXT_INCOMPAT_OFFSET..EXT_INCOMPAT_OFFSET + 4]
            .copy_from_slice(&(0x0002u32 | 0x0040).to_le_bytes());
        let err = check_ext3_header(&b).unwrap_err();
        assert!(err.to_string().contains("incompat"));
    }

    #[test]
    fn test_ext3_huge_file_rejected() {
        let mut b = ext3_header_template();
        b[EXT_RO_COMPAT_OFFSET..EXT_RO_COMPAT_OFFSET + 4].copy_from_slice(&0x0008u32.to_le_bytes());
        assert!(check_ext3_header(&b).is_err());
    }

    #[test]
    fn test_squashfs_valid() {
        assert!(check_squashfs_header(&squashfs_header_template()).is_ok());
    }

    #[test]
    fn test_squashfs_is_not_ext3() {
        assert!(check_ext3_header(&squashfs_header_template()).is_err());
        assert!(check_squashfs_header(&ext3_header_template()).is_err());
    }

    #[test]
    fn test_squashfs_wrong_version() {
        let mut b = squashfs_header_template();
        b[SQUASHFS_MAJOR_OFFSET..SQUASHFS_MAJOR_OFFSET + 2].copy_from_slice(&3u16.to_le_bytes());
        assert!(check_squashfs_header(&b).is_err());
    }

    #[test]
    fn test_squashfs_unknown_compression() {
        let mut b = squashfs_header_template();
        b[SQUASHFS_COMPRESSION_OFFSET..SQUASHFS_COMPRESSION_OFFSET + 2]
            .copy_from_slice(&9u16.to_le_bytes());
        assert!(check_squashfs_header(&b).is_err());
    }

    #[test]
    fn test_check_reader_short_input() {
        let data = vec![0u8; 100];
        let err = FsType::Ext3.check_reader(&mut &data[..]).unwrap_err();
        assert!(matches!(err, Error::HeaderTooShort { .. }));
    }

    #[test]
    fn test_check_reader_reads_window() {
        let mut data = squashfs_header_template().to_vec();
        data.extend_from_slice(b"payload");
        assert!(FsType::Squashfs.check_reader(&mut &data[..]).is_ok());
    }
}
