use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tools::FsTools;

/// a mounted ext3 overlay, unmounted when dropped
///
/// call [`MountGuard::unmount`] on the success path so unmount failures
/// surface as errors; drop only logs them.
pub struct MountGuard<'a> {
    tools: &'a dyn FsTools,
    path: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    /// mount the ext3 filesystem found at `offset` within `image` onto `mnt`
    pub fn mount_ext3(
        tools: &'a dyn FsTools,
        image: &Path,
        offset: u64,
        mnt: &Path,
    ) -> Result<Self> {
        tools.mount_ext3(image, offset, mnt)?;
        tracing::debug!(image = %image.display(), offset, mnt = %mnt.display(), "mounted overlay");
        Ok(Self {
            tools,
            path: mnt.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// unmount now, reporting failure
    pub fn unmount(mut self) -> Result<()> {
        self.mounted = false;
        self.tools.unmount(&self.path)?;
        tracing::debug!(mnt = %self.path.display(), "unmounted overlay");
        Ok(())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        if let Err(e) = self.tools.unmount(&self.path) {
            tracing::error!(mnt = %self.path.display(), error = %e, "failed to unmount overlay");
        }
    }
}
