//! Package records
//!
//! A record is one version of one package. It is built by the ebuild
//! creator, handed to a [`PackageDir`](crate::PackageDir) and frozen once
//! admitted.

use std::path::{Path, PathBuf};

use ovly_dist::{DistfileInfo, Distdir, HashCache, OwnerHandle};

use crate::policy::AddPolicy;
use crate::version::Version;
use crate::{OverlayError, Result};

/// Archive extensions the revision is inserted in front of
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst", ".tgz", ".tbz2", ".zip", ".tar",
];

/// Where a record's source archive came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    /// Fetched archive on disk
    pub src: PathBuf,
    pub repo_name: Option<String>,
    /// Path of the archive inside its repository
    pub repo_file: String,
}

impl PackageSource {
    /// Archive file name as fetched
    pub fn file_name(&self) -> &str {
        self.repo_file.rsplit('/').next().unwrap_or(&self.repo_file)
    }
}

#[derive(Debug, Clone)]
pub struct PackageRecord {
    name: String,
    version: String,
    revision: u32,
    ebuild: Option<String>,
    description: Option<String>,
    source: Option<PackageSource>,
    hashes: HashCache,
    policy: AddPolicy,
    physical_only: bool,
    imported: bool,
    readonly: bool,
    backref: Option<OwnerHandle>,
}

impl PackageRecord {
    pub fn new(name: &str, version: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
            return Err(OverlayError::InvalidName(name.to_string()));
        }
        let parsed = Version::parse(version)?;
        if parsed.revision() > 0 {
            return Err(OverlayError::InvalidVersion(format!(
                "{} (set the revision separately)",
                version
            )));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            revision: 0,
            ebuild: None,
            description: None,
            source: None,
            hashes: HashCache::new(),
            policy: AddPolicy::NONE,
            physical_only: false,
            imported: false,
            readonly: false,
            backref: None,
        })
    }

    /// Placeholder for an ebuild found on disk
    pub fn physical_only(name: &str, version: &str, revision: u32) -> Result<Self> {
        let mut record = Self::new(name, version)?;
        record.revision = revision;
        record.physical_only = true;
        record.imported = true;
        Ok(record)
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_ebuild(mut self, text: &str) -> Self {
        self.ebuild = Some(text.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_source(mut self, src: &Path, repo_name: Option<&str>, repo_file: &str) -> Self {
        self.source = Some(PackageSource {
            src: src.to_path_buf(),
            repo_name: repo_name.map(str::to_string),
            repo_file: repo_file.to_string(),
        });
        self
    }

    pub fn with_policy(mut self, policy: AddPolicy) -> Self {
        self.policy = policy;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn ebuild(&self) -> Option<&str> {
        self.ebuild.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> Option<&PackageSource> {
        self.source.as_ref()
    }

    /// Checksum cache of the source archive
    pub fn hashes(&self) -> &HashCache {
        &self.hashes
    }

    pub fn policy(&self) -> AddPolicy {
        self.policy
    }

    pub fn is_physical_only(&self) -> bool {
        self.physical_only
    }

    pub fn is_imported(&self) -> bool {
        self.imported
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Package directory holding this record
    pub fn backref(&self) -> Option<OwnerHandle> {
        self.backref
    }

    // ========================================================================
    // Derived names
    // ========================================================================

    /// `1.0` or `1.0-r1`; unique within a package directory
    pub fn ebuild_version(&self) -> String {
        if self.revision == 0 {
            self.version.clone()
        } else {
            format!("{}-r{}", self.version, self.revision)
        }
    }

    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.ebuild_version())
    }

    pub fn ebuild_file(&self) -> String {
        format!("{}-{}.ebuild", self.name, self.ebuild_version())
    }

    /// Distfile name: the archive name with `-rN` before the extension
    /// once the record was revbumped.
    pub fn distfile(&self) -> Option<String> {
        let source = self.source.as_ref()?;
        let file_name = source.file_name();
        if self.revision == 0 {
            return Some(file_name.to_string());
        }

        let suffix = format!("-r{}", self.revision);
        let ext_len = ARCHIVE_EXTENSIONS
            .iter()
            .find(|ext| file_name.len() > ext.len() && file_name.ends_with(*ext))
            .map(|ext| ext.len())
            .or_else(|| file_name.rfind('.').filter(|&i| i > 0).map(|i| file_name.len() - i))
            .unwrap_or(0);
        let (stem, ext) = file_name.split_at(file_name.len() - ext_len);
        Some(format!("{}{}{}", stem, suffix, ext))
    }

    /// Boundary description of the distfile for the distroot
    pub fn distfile_info(&self, distdir: &Distdir) -> Option<DistfileInfo> {
        let source = self.source.as_ref()?;
        let distfile = self.distfile()?;
        Some(
            DistfileInfo::new(
                &distdir.distfile_key(&distfile),
                &source.src,
                source.repo_name.as_deref(),
                &source.repo_file,
            )
            .with_hashes(self.hashes.clone()),
        )
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(OverlayError::ReadOnly(format!(
                "{}-{}",
                self.name,
                self.ebuild_version()
            )));
        }
        Ok(())
    }

    pub fn set_policy(&mut self, policy: AddPolicy) -> Result<()> {
        self.check_writable()?;
        self.policy = policy;
        Ok(())
    }

    pub fn set_ebuild(&mut self, text: &str) -> Result<()> {
        self.check_writable()?;
        self.ebuild = Some(text.to_string());
        Ok(())
    }

    /// Increment the revision. Derived names follow.
    pub fn bump_revision(&mut self) -> Result<u32> {
        self.check_writable()?;
        self.revision += 1;
        Ok(self.revision)
    }

    /// Freeze the record
    pub fn make_readonly(&mut self) {
        self.readonly = true;
    }

    /// Stamp the owning directory and drop the policy; done on admission
    pub(crate) fn admit(&mut self, owner: OwnerHandle) {
        self.backref = Some(owner);
        self.policy = AddPolicy::NONE;
        self.readonly = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(repo_file: &str) -> PackageRecord {
        PackageRecord::new("seewave", "2.0")
            .unwrap()
            .with_source(Path::new("/src/x"), Some("CRAN"), repo_file)
    }

    #[test]
    fn test_derived_names() {
        let mut r = record("src/contrib/seewave_2.0.tar.gz");
        assert_eq!(r.ebuild_version(), "2.0");
        assert_eq!(r.ebuild_file(), "seewave-2.0.ebuild");
        assert_eq!(r.distfile().as_deref(), Some("seewave_2.0.tar.gz"));

        r.bump_revision().unwrap();
        assert_eq!(r.ebuild_version(), "2.0-r1");
        assert_eq!(r.ebuild_file(), "seewave-2.0-r1.ebuild");
        assert_eq!(r.distfile().as_deref(), Some("seewave_2.0-r1.tar.gz"));
    }

    #[test]
    fn test_revbumped_distfile_extensions() {
        let names = [
            ("a_1.zip", "a_1-r2.zip"),
            ("a_1.tgz", "a_1-r2.tgz"),
            ("a_1.gem", "a_1-r2.gem"),
            ("archive", "archive-r2"),
        ];
        for (input, expected) in names {
            let r = record(input).with_revision(2);
            assert_eq!(r.distfile().as_deref(), Some(expected));
        }
    }

    #[test]
    fn test_readonly_blocks_mutation() {
        let mut r = record("a.tgz");
        r.make_readonly();
        assert!(matches!(r.bump_revision(), Err(OverlayError::ReadOnly(_))));
        assert!(r.set_policy(AddPolicy::FORCE_DENY).is_err());
        assert_eq!(r.revision(), 0);
    }

    #[test]
    fn test_invalid_input() {
        assert!(PackageRecord::new("", "1.0").is_err());
        assert!(PackageRecord::new("sci-R/x", "1.0").is_err());
        assert!(PackageRecord::new("x", "1.0-r1").is_err());
        assert!(PackageRecord::new("x", "one").is_err());
    }

    #[test]
    fn test_physical_only() {
        let r = PackageRecord::physical_only("x", "1.0", 3).unwrap();
        assert!(r.is_physical_only());
        assert!(r.is_imported());
        assert_eq!(r.ebuild_version(), "1.0-r3");
        assert!(r.distfile().is_none());
    }

    #[test]
    fn test_distfile_info_shares_hashes() {
        let r = record("a_1.tgz");
        let distroot = ovly_dist::Distroot::open_temporary(ovly_dist::DistrootLayout::PerPackage).unwrap();
        let info = r.distfile_info(&distroot.get_distdir("seewave")).unwrap();
        assert_eq!(info.distfile, "seewave/a_1.tgz");
        assert!(info.hashes.shares_storage_with(r.hashes()));
    }
}
