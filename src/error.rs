use std::path::PathBuf;

use crate::digest::Digest;

/// error type for container image operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not a container image: {0}")]
    NotAContainer(PathBuf),

    #[error("corrupt container image: {0}")]
    CorruptContainer(String),

    #[error("no free descriptor slot in container image")]
    NoFreeDescriptor,

    #[error("descriptor not found: {0}")]
    DescriptorNotFound(String),

    #[error("lock contention on container image")]
    LockContention,

    #[error("only single image containers are supported, found {0} images")]
    MultipleImages(usize),

    #[error("container does not hold an image")]
    NoImages,

    #[error("image has no layers")]
    NoLayers,

    #[error("not a data container: {0}")]
    NotADataContainer(String),

    #[error("writable overlay layer at position {position} of {count} is not the final layer")]
    OverlayNotLast { position: usize, count: usize },

    #[error("image does not contain a writable overlay")]
    NoOverlay,

    #[error("writable overlay already exists in image")]
    OverlayExists,

    #[error("cannot add overlay to a signed image")]
    ImageSigned,

    #[error("file is not a valid {fs_type} image: {reason}")]
    InvalidHeader {
        fs_type: &'static str,
        reason: String,
    },

    #[error("while reading {fs_type} file header: file shorter than {expected} bytes")]
    HeaderTooShort {
        fs_type: &'static str,
        expected: usize,
    },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("{path}: unsupported file type ({kind})")]
    UnsupportedFileType { path: PathBuf, kind: &'static str },

    #[error("could not convert layer to squashfs: {0}")]
    SquashfsConversion(#[source] Box<Error>),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("failed to mount {path}: {message}")]
    Mount { path: PathBuf, message: String },

    #[error("failed to unmount {path}: {message}")]
    Unmount { path: PathBuf, message: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("no destination file provided")]
    NoDestination,

    #[error("no work directory for intermediate files provided")]
    NoWorkDir,

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// true when the failure happened while producing squashfs layers
    pub fn is_squashfs_conversion(&self) -> bool {
        matches!(self, Error::SquashfsConversion(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_path_wraps_io_error() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = res.with_path("/some/file").unwrap_err();
        match err {
            Error::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/some/file"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_squashfs_conversion_category() {
        let err = Error::SquashfsConversion(Box::new(Error::Tool {
            tool: "mksquashfs".to_string(),
            message: "exit status 1".to_string(),
        }));
        assert!(err.is_squashfs_conversion());
        assert!(err.to_string().contains("could not convert layer to squashfs"));
        assert!(!Error::NoOverlay.is_squashfs_conversion());
    }
}
