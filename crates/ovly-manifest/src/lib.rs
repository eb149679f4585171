//! # ovly-manifest
//!
//! GLEP-44 manifests for package directories.
//!
//! ```text
//! AUX fix-build.patch 412 SHA256 ... SHA512 ... WHIRLPOOL ...
//! DIST seewave_2.0.tar.gz 2394821 SHA256 ... SHA512 ... WHIRLPOOL ...
//! EBUILD seewave-2.0.ebuild 731 SHA256 ... SHA512 ... WHIRLPOOL ...
//! MISC metadata.xml 240 SHA256 ... SHA512 ... WHIRLPOOL ...
//! ```
//!
//! Generation is behind the [`ManifestGenerator`] capability, selected once
//! from configuration:
//!
//! - [`InternalManifest`]: hashes files itself, reuses existing entries,
//!   thread-safe
//! - [`ExternalManifest`]: runs the `ebuild` tool, serialized by a global lock
//! - [`NoManifest`]: does nothing

pub mod entry;
pub mod external;
pub mod file;
pub mod generator;
pub mod internal;

pub use entry::{FileType, ManifestEntry};
pub use external::ExternalManifest;
pub use file::{ManifestFile, MANIFEST_NAME};
pub use generator::{create_generator, ManifestContext, ManifestGenerator, NoManifest};
pub use internal::InternalManifest;

use std::io;

use thiserror::Error;

/// Errors that can occur during manifest operations
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Dist(#[from] ovly_dist::DistError),

    #[error("manifest parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("unsupported manifest implementation: {0}")]
    Unsupported(String),

    #[error("manifest tool failed ({}): {stderr}", .status.map_or("signal".to_string(), |c| c.to_string()))]
    Subprocess { status: Option<i32>, stderr: String },
}

pub type Result<T> = std::result::Result<T, ManifestError>;
