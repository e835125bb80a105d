pub mod header;
pub mod mount;
pub mod read;
pub mod write;

pub use header::{check_ext3_header, check_squashfs_header, FsType, HEADER_WINDOW};
pub use mount::MountGuard;
pub use read::{read_xattrs, FileMetadata, FileType};
pub use write::{fsync_dir, temp_sibling, write_atomic};
