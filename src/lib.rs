//! ocisif - single-file OCI images with squashfs layers
//!
//! builds and maintains container files that hold exactly one OCI image,
//! its layers stored as squashfs, optionally topped by a writable ext3
//! overlay.
//!
//! # Core concepts
//!
//! - **Image**: raw config, annotations and an ordered list of layers
//! - **Layer**: an archive (tar, maybe compressed), a squashfs image, or an
//!   ext3 image; each knows its digest, diff id, size and media type
//! - **Overlay**: an ext3 layer in final position holding in-progress writes
//! - **Container**: a file with a descriptor table addressing a root OCI
//!   index and every blob it references
//!
//! # Overlay lifecycle
//!
//! an image without overlay gains one with [`ops::add_overlay`]. after
//! writing through a mount, [`ops::sync_overlay`] re-records its digest in
//! place. [`ops::seal_overlay`] turns it into an immutable squashfs layer.
//!
//! # Example usage
//!
//! ```no_run
//! use ocisif::ops::{self, ImageWriter, WriterOptions};
//! use ocisif::Image;
//! use std::path::Path;
//!
//! # fn layers() -> Vec<ocisif::Layer> { Vec::new() }
//! let image = Image::from_layers(layers()).unwrap();
//! let opts = WriterOptions { squash: true, ..WriterOptions::default() };
//! ImageWriter::new(image, "/tmp/image.sif", "/tmp", opts)
//!     .unwrap()
//!     .write()
//!     .unwrap();
//!
//! ops::add_overlay(Path::new("/tmp/image.sif"), Path::new("/tmp/overlay.img")).unwrap();
//! ```

mod cancel;
mod config;
mod digest;
mod error;

pub mod container;
pub mod fs;
pub mod image;
pub mod ops;
pub mod tools;
pub mod types;

#[cfg(test)]
mod testutil;

pub use cancel::CancelToken;
pub use config::{Config, ToolPaths, DEFAULT_SPARE_DESCRIPTOR_CAPACITY};
pub use digest::{Digest, DigestWriter};
pub use error::{Error, IoResultExt, Result};
pub use image::{overlay_index, Image, ImageSource, Layer};
pub use tools::{FsTools, HostTools};
