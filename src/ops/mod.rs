//! operations on images and container files

mod archive;
mod artifact;
mod data_container;
mod overlay;
mod squash;
mod squashfs;
pub mod tar_stream;
pub mod whiteout;
mod writer;

use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{IoResultExt, Result};
use crate::tools::{FsTools, HostTools};

pub use archive::{to_archive, to_archive_image};
pub use artifact::Oci11Artifact;
pub use data_container::{data_container_layer_offset, write_data_container_from_path};
pub use overlay::{add_overlay, has_overlay, seal_overlay, sync_overlay, OverlayInfo};
pub use squash::squash;
pub use squashfs::{to_squashfs, to_squashfs_from};
pub use writer::{ImageWriter, WriterOptions};

/// host tooling and cancellation shared by the layer transforms
#[derive(Clone)]
pub struct TransformOptions {
    pub tools: Arc<dyn FsTools>,
    pub cancel: CancelToken,
}

impl TransformOptions {
    pub fn new(tools: Arc<dyn FsTools>) -> Self {
        Self {
            tools,
            cancel: CancelToken::new(),
        }
    }

    /// host tools at the paths named in `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(HostTools::new(config.tools.clone())))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self::new(Arc::new(HostTools::default()))
    }
}

/// scratch directory under `work_dir`, removed when the last handle drops
pub(crate) fn scratch_dir(work_dir: &Path, prefix: &str) -> Result<Arc<tempfile::TempDir>> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(work_dir)
        .with_path(work_dir)?;
    Ok(Arc::new(dir))
}
