//! on-disk layout of a container file
//!
//! ```text
//! 0      header (128 bytes)
//! 128    descriptor table (capacity * 64 bytes)
//! ...    padding to 4096
//! data   objects, each starting on a 4096 boundary
//! ```
//!
//! all integers are little endian. an unused descriptor slot is all zeroes.

use crate::digest::Digest;
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 8] = b"SIFOCI01";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 128;
pub const DESCRIPTOR_SIZE: u64 = 64;
/// alignment of every data object
pub const ALIGN: u64 = 4096;

pub fn align_up(v: u64) -> u64 {
    v.div_ceil(ALIGN) * ALIGN
}

/// kind of object a descriptor points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// the OCI image index at the root of the container
    RootIndex = 1,
    /// a content-addressed OCI blob (manifest, config or layer)
    Blob = 2,
    /// detached signature over the container
    Signature = 3,
}

impl DataType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(DataType::RootIndex),
            2 => Ok(DataType::Blob),
            3 => Ok(DataType::Signature),
            other => Err(Error::CorruptContainer(format!("unknown data type {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub capacity: u32,
    pub data_offset: u64,
    pub data_end: u64,
}

impl Header {
    pub fn new(capacity: u32) -> Self {
        let data_offset = align_up(HEADER_SIZE + capacity as u64 * DESCRIPTOR_SIZE);
        Self {
            capacity,
            data_offset,
            data_end: data_offset,
        }
    }

    pub fn has_magic(b: &[u8]) -> bool {
        b.len() >= MAGIC.len() && &b[..MAGIC.len()] == MAGIC
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut b = [0u8; HEADER_SIZE as usize];
        b[0..8].copy_from_slice(MAGIC);
        b[8..12].copy_from_slice(&VERSION.to_le_bytes());
        b[12..16].copy_from_slice(&self.capacity.to_le_bytes());
        b[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        b[24..32].copy_from_slice(&self.data_end.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_SIZE as usize || !Self::has_magic(b) {
            return Err(Error::CorruptContainer("bad header".to_string()));
        }
        let version = read_u32(b, 8);
        if version != VERSION {
            return Err(Error::CorruptContainer(format!(
                "unsupported version {}",
                version
            )));
        }
        let header = Self {
            capacity: read_u32(b, 12),
            data_offset: read_u64(b, 16),
            data_end: read_u64(b, 24),
        };
        if header.data_offset < HEADER_SIZE + header.table_size() || header.data_end < header.data_offset {
            return Err(Error::CorruptContainer("inconsistent header".to_string()));
        }
        Ok(header)
    }

    pub fn table_size(&self) -> u64 {
        self.capacity as u64 * DESCRIPTOR_SIZE
    }
}

/// one descriptor table entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawDescriptor {
    pub id: u32,
    pub data_type: DataType,
    pub offset: u64,
    pub size: u64,
    pub digest: Digest,
}

impl RawDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE as usize] {
        let mut b = [0u8; DESCRIPTOR_SIZE as usize];
        b[0] = 1;
        b[1] = self.data_type as u8;
        b[4..8].copy_from_slice(&self.id.to_le_bytes());
        b[8..16].copy_from_slice(&self.offset.to_le_bytes());
        b[16..24].copy_from_slice(&self.size.to_le_bytes());
        b[24..56].copy_from_slice(self.digest.as_bytes());
        b
    }

    /// `None` for an unused slot
    pub fn decode(b: &[u8]) -> Result<Option<Self>> {
        if b.len() < DESCRIPTOR_SIZE as usize {
            return Err(Error::CorruptContainer("short descriptor".to_string()));
        }
        if b[0] == 0 {
            return Ok(None);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&b[24..56]);
        let desc = Self {
            data_type: DataType::from_u8(b[1])?,
            id: read_u32(b, 4),
            offset: read_u64(b, 8),
            size: read_u64(b, 16),
            digest: Digest::from_bytes(digest),
        };
        if desc.offset.checked_add(desc.size).is_none() {
            return Err(Error::CorruptContainer(format!(
                "descriptor {} extent overflows",
                desc.id
            )));
        }
        Ok(Some(desc))
    }

    /// first byte past the object; saturates on an extent no decoded
    /// descriptor can carry
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    let mut v = [0u8; 4];
    v.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(v)
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(v)
}
