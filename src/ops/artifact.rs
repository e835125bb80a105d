use crate::error::Result;
use crate::image::{ImageSource, Layer};

/// an image whose manifest carries an OCI 1.1 `artifactType`
///
/// config and layers are the inner image's; only the manifest bytes, and so
/// the manifest digest, differ.
#[derive(Clone, Debug)]
pub struct Oci11Artifact<I> {
    inner: I,
    artifact_type: String,
}

impl<I: ImageSource> Oci11Artifact<I> {
    pub fn new(inner: I, artifact_type: impl Into<String>) -> Self {
        Self {
            inner,
            artifact_type: artifact_type.into(),
        }
    }

    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I: ImageSource> ImageSource for Oci11Artifact<I> {
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        let mut manifest = self.inner.manifest()?;
        manifest.artifact_type = Some(self.artifact_type.clone());
        Ok(serde_json::to_vec(&manifest)?)
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        self.inner.raw_config()
    }

    fn layers(&self) -> &[Layer] {
        self.inner.layers()
    }
}
