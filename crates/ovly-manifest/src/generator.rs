//! The manifest generator capability

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ovly_config::ManifestConfig;
use ovly_dist::{DigestKind, DistfileInfo};

use crate::external::ExternalManifest;
use crate::internal::InternalManifest;
use crate::{ManifestError, Result};

/// Everything a generator needs to know about one package directory
#[derive(Debug, Clone)]
pub struct ManifestContext {
    pub package_dir: PathBuf,
    pub overlay_dir: PathBuf,
    pub ebuild_files: Vec<PathBuf>,
    /// Source archives referenced by the directory's ebuilds
    pub distfiles: Vec<DistfileInfo>,
    /// DIST names to drop from an existing manifest
    pub removed_distfiles: Vec<String>,
    /// Files rewritten since the manifest was last generated; always rehashed
    pub changed_files: Vec<PathBuf>,
}

impl ManifestContext {
    pub fn new(package_dir: &Path, overlay_dir: &Path) -> Self {
        Self {
            package_dir: package_dir.to_path_buf(),
            overlay_dir: overlay_dir.to_path_buf(),
            ebuild_files: Vec::new(),
            distfiles: Vec::new(),
            removed_distfiles: Vec::new(),
            changed_files: Vec::new(),
        }
    }
}

/// Writes the manifest of a package directory
pub trait ManifestGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `generate` may run concurrently for different directories
    fn thread_safe(&self) -> bool;

    fn generate(&self, ctx: &ManifestContext) -> Result<()>;
}

/// Generator that writes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoManifest;

impl ManifestGenerator for NoManifest {
    fn name(&self) -> &'static str {
        "none"
    }

    fn thread_safe(&self) -> bool {
        true
    }

    fn generate(&self, _ctx: &ManifestContext) -> Result<()> {
        Ok(())
    }
}

/// Select a generator by name (`internal`, `external` or `none`)
pub fn create_generator(
    kind: &str,
    hashes: &[String],
    ebuild_prog: &Path,
) -> Result<Arc<dyn ManifestGenerator>> {
    let kinds = DigestKind::parse_list(hashes)?;
    if kinds.is_empty() {
        return Err(ManifestError::Unsupported("empty hash list".into()));
    }
    match kind {
        "internal" => Ok(Arc::new(InternalManifest::new(kinds))),
        "external" => Ok(Arc::new(ExternalManifest::new(ebuild_prog, kinds))),
        "none" => Ok(Arc::new(NoManifest)),
        other => Err(ManifestError::Unsupported(other.to_string())),
    }
}

/// [`create_generator`] from the `[manifest]` configuration section
pub fn from_config(config: &ManifestConfig) -> Result<Arc<dyn ManifestGenerator>> {
    create_generator(&config.implementation, &config.hashes, &config.ebuild_prog)
}
