//! # ovly-overlay
//!
//! The package side of the overlay builder:
//!
//! - [`PackageRecord`]: one package version as produced by the ebuild creator
//! - [`PackageDir`]: all versions of one package and the addition-control
//!   decision that admits, replaces, defers, revbumps or rejects a record
//! - [`Category`]: package directories of one category, written by a bounded
//!   pool of worker threads
//! - [`Overlay`]: categories plus repository-wide files (profiles, eclasses)
//!
//! ## On-disk layout
//!
//! ```text
//! overlay/
//! ├── eclass/R-packages.eclass
//! ├── metadata/layout.conf
//! ├── profiles/{repo_name,categories}
//! └── sci-R/seewave/
//!     ├── Manifest
//!     ├── metadata.xml
//!     └── seewave-2.0.ebuild
//! ```

pub mod category;
pub mod metadata;
pub mod overlay;
pub mod package_dir;
pub mod policy;
pub mod record;
pub mod version;

pub use category::{Category, WriteOptions, WriteReport};
pub use overlay::{AddFlags, Overlay, OverlayStats};
pub use package_dir::PackageDir;
pub use policy::{AddOutcome, AddPolicy, RejectReason};
pub use record::{PackageRecord, PackageSource};
pub use version::Version;

use std::io;

use thiserror::Error;

/// Errors that can occur while building an overlay
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ovly_config::ConfigError),

    #[error("distfile error: {0}")]
    Dist(#[from] ovly_dist::DistError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ovly_manifest::ManifestError),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("package record is read-only: {0}")]
    ReadOnly(String),

    #[error("no package directory for handle {0}")]
    UnknownOwner(ovly_dist::OwnerHandle),

    #[error("worker {worker} failed writing {package}: {source}")]
    Worker {
        package: String,
        worker: usize,
        #[source]
        source: Box<OverlayError>,
    },
}

pub type Result<T> = std::result::Result<T, OverlayError>;
