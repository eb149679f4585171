//! # ovly-dist
//!
//! Distfile bookkeeping for the ovly overlay builder.
//!
//! A *distfile* is a source archive tracked by its path relative to the
//! distroot. This crate owns:
//!
//! - [`DistMap`]: the persistent registry `distfile -> (repo, origin, digest)`
//! - [`Distroot`] / [`Distdir`]: the directory the distfiles are materialized
//!   into, using an ordered [`Strategy`] of linking methods
//! - digest helpers and the shared [`HashCache`]
//! - [`OwnerRegistry`]: generation-checked handles standing in for
//!   back-references to package directories
//!
//! ## Distroot layout
//!
//! ```text
//! flat:          per-package:
//! distfiles/     distfiles/
//! ├── a_1.0.tgz  ├── a/
//! └── b_2.1.tgz  │   └── a_1.0.tgz
//!                └── b/
//!                    └── b_2.1.tgz
//! ```

pub mod digest;
pub mod distmap;
pub mod distroot;
pub mod link_strategy;
pub mod owner;
pub mod parallel;

pub use digest::{digest_file, DigestKind, HashCache, DEFAULT_MANIFEST_DIGESTS};
pub use distmap::{
    stats, Compression, DistMap, DistMapEntry, DistMapStats, EntryState, IntegrityStatus,
    DISTMAP_DIGEST,
};
pub use distroot::{DistfileInfo, Distdir, Distroot, DistrootLayout, IntegrityReport};
pub use link_strategy::{FsLinker, LinkMethod, Linker, Strategy};
pub use owner::{OwnerHandle, OwnerRegistry, RecordRef};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during distfile operations
#[derive(Error, Debug)]
pub enum DistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("all linking strategies exhausted for {}", path.display())]
    StrategiesExhausted { path: PathBuf },

    #[error("{method} of {} failed: {source}", dest.display())]
    LinkFailed {
        method: &'static str,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("distfile not in distmap: {0}")]
    NotFound(String),

    #[error("distmap entry is not persistent: {0}")]
    NotPersistent(String),

    #[error("distmap format error at line {line}: {reason}")]
    Format { line: usize, reason: String },

    #[error("unknown digest: {0}")]
    UnknownDigest(String),
}

pub type Result<T> = std::result::Result<T, DistError>;
