//! # Package directory
//!
//! All versions of one package, keyed by ebuild version, and the
//! addition-control decision run for every incoming record.
//!
//! ## Addition decision
//!
//! For a record whose version already exists, in priority order:
//!
//! ```text
//! FORCE_DENY            -> reject
//! DENY_REPLACE          -> reject
//! existing physical-only / add_if_physical / FORCE_REPLACE -> replace
//! allow_postpone (without REVBUMP_ON_COLLISION)           -> defer
//! distfile claimed by another directory                   -> reject
//! REVBUMP_ON_COLLISION or digest changed -> bump revision, decide again
//! otherwise             -> reject (already present)
//! ```
//!
//! A new version is rejected under `REPLACE_ONLY` or on a distfile collision
//! and inserted otherwise. A new version, or one replacing a physical-only
//! placeholder, whose distfile was written earlier with different content
//! is revbumped instead, so the old archive stays in place. Each revbump moves the record to a version key
//! that did not exist a moment ago, so the loop ends after at most one pass
//! per existing revision.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ovly_config::{log_overlay_debug, log_overlay_info, log_overlay_warn};
use ovly_dist::{DistfileInfo, Distdir, Distroot, OwnerHandle};
use ovly_manifest::{ManifestContext, ManifestGenerator};

use crate::metadata::{render_metadata_xml, write_if_changed, METADATA_XML};
use crate::policy::{AddOutcome, AddPolicy, RejectReason};
use crate::record::PackageRecord;
use crate::version::Version;
use crate::Result;

#[derive(Debug)]
pub struct PackageDir {
    category: String,
    name: String,
    path: PathBuf,
    overlay_dir: PathBuf,
    handle: OwnerHandle,
    distroot: Arc<Distroot>,
    distdir: Distdir,
    packages: BTreeMap<String, PackageRecord>,
    /// Distfile names dropped since the manifest was last written
    removed_distfiles: Vec<String>,
    /// Files rewritten since the manifest was last written
    rewritten: Vec<PathBuf>,
    needs_manifest: bool,
    needs_metadata: bool,
    modified: bool,
}

impl PackageDir {
    /// Create the in-memory directory; nothing is written yet
    pub fn new(overlay_dir: &Path, category: &str, name: &str, distroot: Arc<Distroot>) -> Self {
        let full_name = format!("{}/{}", category, name);
        let handle = distroot.owners().register(&full_name);
        let distdir = distroot.get_distdir(name);
        Self {
            category: category.to_string(),
            name: name.to_string(),
            path: overlay_dir.join(category).join(name),
            overlay_dir: overlay_dir.to_path_buf(),
            handle,
            distroot,
            distdir,
            packages: BTreeMap::new(),
            removed_distfiles: Vec::new(),
            rewritten: Vec::new(),
            needs_manifest: false,
            needs_metadata: false,
            modified: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `category/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> OwnerHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, ebuild_version: &str) -> Option<&PackageRecord> {
        self.packages.get(ebuild_version)
    }

    /// Ebuild versions held, in key order
    pub fn versions(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    pub fn needs_manifest(&self) -> bool {
        self.needs_manifest
    }

    pub fn needs_metadata(&self) -> bool {
        self.needs_metadata
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    // ========================================================================
    // Addition control
    // ========================================================================

    /// Decide whether `record` may be added and add it if so.
    ///
    /// `add_if_physical` lets the record replace any existing version;
    /// `allow_postpone` turns an unresolved collision into
    /// [`AddOutcome::Deferred`].
    pub fn add_package(
        &mut self,
        mut record: PackageRecord,
        add_if_physical: bool,
        allow_postpone: bool,
    ) -> Result<AddOutcome> {
        loop {
            let policy = record.policy();
            if policy.contains(AddPolicy::FORCE_DENY) {
                return Ok(AddOutcome::Rejected(RejectReason::ForceDeny));
            }

            let key = record.ebuild_version();
            let info = record.distfile_info(&self.distdir);

            let existing_physical_only = match self.packages.get(&key) {
                Some(existing) => existing.is_physical_only(),
                None => {
                    if policy.contains(AddPolicy::REPLACE_ONLY) {
                        return Ok(AddOutcome::Rejected(RejectReason::NothingToReplace));
                    }
                    if let Some(info) = &info {
                        if !self.distroot.handle_file_collision(self.handle, info) {
                            return Ok(AddOutcome::Rejected(RejectReason::Collision));
                        }
                    }
                    if self.persistent_digest_changed(info.as_ref())? {
                        self.revbump(&mut record)?;
                        continue;
                    }
                    self.insert(record)?;
                    return Ok(AddOutcome::Added);
                }
            };

            if policy.contains(AddPolicy::DENY_REPLACE) {
                return Ok(AddOutcome::Rejected(RejectReason::DenyReplace));
            }
            if existing_physical_only && self.persistent_digest_changed(info.as_ref())? {
                self.revbump(&mut record)?;
                continue;
            }
            if existing_physical_only || add_if_physical || policy.contains(AddPolicy::FORCE_REPLACE)
            {
                self.insert(record)?;
                return Ok(AddOutcome::Replaced);
            }
            if allow_postpone && !policy.contains(AddPolicy::REVBUMP_ON_COLLISION) {
                return Ok(AddOutcome::Deferred(self.handle));
            }
            if let Some(info) = &info {
                if !self.distroot.handle_file_collision(self.handle, info) {
                    return Ok(AddOutcome::Rejected(RejectReason::Collision));
                }
            }

            let revbump = policy.contains(AddPolicy::REVBUMP_ON_COLLISION)
                || match &info {
                    Some(info) => self.distroot.distmap().check_revbump_necessary(info)?,
                    None => false,
                };
            if !revbump {
                return Ok(AddOutcome::Rejected(RejectReason::AlreadyPresent));
            }
            self.revbump(&mut record)?;
        }
    }

    /// A persistent entry from an earlier write holds different content for
    /// the same distfile and origin. Overwriting it would lose the old file.
    fn persistent_digest_changed(&self, info: Option<&DistfileInfo>) -> Result<bool> {
        let info = match info {
            Some(info) => info,
            None => return Ok(false),
        };
        let distmap = self.distroot.distmap();
        if !distmap.get(&info.distfile).is_some_and(|e| e.is_persistent()) {
            return Ok(false);
        }
        Ok(distmap.check_revbump_necessary(info)?)
    }

    fn revbump(&self, record: &mut PackageRecord) -> Result<()> {
        let revision = record.bump_revision()?;
        let mut policy = record.policy();
        policy.remove(AddPolicy::REPLACE_ONLY);
        record.set_policy(policy)?;
        log_overlay_info!(
            "Revbump",
            package = self.full_name(),
            version = record.version(),
            revision = revision
        );
        Ok(())
    }

    /// Admit a record, replacing a version with the same key
    fn insert(&mut self, mut record: PackageRecord) -> Result<()> {
        let key = record.ebuild_version();
        record.admit(self.handle);

        let new_info = record.distfile_info(&self.distdir);
        if let Some(old) = self.packages.get(&key) {
            if let Some(old_info) = old.distfile_info(&self.distdir) {
                if new_info.as_ref().map(|i| &i.distfile) != Some(&old_info.distfile) {
                    self.release_distfile(&old_info.distfile)?;
                }
            }
        }
        if let Some(info) = &new_info {
            self.distroot.register_volatile(self.handle, info, &key);
        }

        log_overlay_debug!("Package added", package = self.full_name(), version = key.as_str());
        self.packages.insert(key, record);
        self.modified = true;
        self.needs_manifest = true;
        self.needs_metadata = true;
        Ok(())
    }

    fn release_distfile(&mut self, distfile: &str) -> Result<()> {
        self.distroot.unregister(self.handle, distfile)?;
        let name = distfile.rsplit('/').next().unwrap_or(distfile);
        self.removed_distfiles.push(name.to_string());
        Ok(())
    }

    // ========================================================================
    // Disk state
    // ========================================================================

    /// Import `<name>-<version>.ebuild` files as physical-only records
    pub fn scan(&mut self) -> Result<usize> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}-", self.name);
        let mut imported = 0;
        for entry in entries {
            let file_name = entry?.file_name().to_string_lossy().into_owned();
            let version = match file_name
                .strip_suffix(".ebuild")
                .and_then(|s| s.strip_prefix(&prefix))
            {
                Some(version) => version,
                None => continue,
            };

            let parsed = match Version::parse(version) {
                Ok(parsed) => parsed,
                Err(_) => {
                    log_overlay_warn!("Skipping unparsable ebuild", file = file_name.as_str());
                    continue;
                }
            };
            if self.packages.contains_key(version) {
                continue;
            }

            let mut record =
                PackageRecord::physical_only(&self.name, parsed.base(), parsed.revision())?;
            record.admit(self.handle);
            self.packages.insert(record.ebuild_version(), record);
            imported += 1;
        }
        Ok(imported)
    }

    /// Write ebuilds of records not on disk yet (distfile first, then ebuild)
    pub fn write_ebuilds(&mut self) -> Result<usize> {
        let mut written = 0;
        for record in self.packages.values() {
            let text = match record.ebuild() {
                Some(text) if !record.is_physical_only() => text,
                _ => continue,
            };
            if written == 0 {
                fs::create_dir_all(&self.path)?;
            }
            if let Some(info) = record.distfile_info(&self.distdir) {
                self.distroot.distmap_register(self.handle, &info)?;
            }
            let ebuild = self.path.join(record.ebuild_file());
            if write_if_changed(&ebuild, text.as_bytes())? {
                self.rewritten.push(ebuild);
                self.needs_manifest = true;
            }
            written += 1;
        }
        Ok(written)
    }

    /// Write `metadata.xml` from the newest record that has a description
    pub fn write_metadata(&mut self) -> Result<bool> {
        if !self.needs_metadata {
            return Ok(false);
        }
        self.needs_metadata = false;

        let newest = self
            .sorted_versions()
            .into_iter()
            .rev()
            .filter_map(|(_, key)| self.packages.get(&key))
            .find_map(|r| r.description());
        let description = match newest {
            Some(description) => description,
            None => return Ok(false),
        };

        fs::create_dir_all(&self.path)?;
        let path = self.path.join(METADATA_XML);
        if write_if_changed(&path, render_metadata_xml(description).as_bytes())? {
            self.rewritten.push(path);
            self.needs_manifest = true;
        }
        Ok(true)
    }

    /// Regenerate the manifest if anything changed. Returns true if it ran.
    pub fn write_manifest(&mut self, generator: &dyn ManifestGenerator) -> Result<bool> {
        if !self.needs_manifest || self.packages.is_empty() || !self.path.is_dir() {
            return Ok(false);
        }

        let mut ctx = ManifestContext::new(&self.path, &self.overlay_dir);
        for record in self.packages.values() {
            let ebuild = self.path.join(record.ebuild_file());
            if !ebuild.exists() {
                continue;
            }
            ctx.ebuild_files.push(ebuild);
            if let Some(info) = record.distfile_info(&self.distdir) {
                ctx.distfiles.push(info);
            }
        }
        ctx.removed_distfiles = self.removed_distfiles.clone();
        ctx.changed_files = self.rewritten.clone();

        generator.generate(&ctx)?;
        self.removed_distfiles.clear();
        self.rewritten.clear();
        self.needs_manifest = false;
        Ok(true)
    }

    /// Ebuilds, metadata and (optionally) the manifest
    pub fn write(&mut self, generator: Option<&dyn ManifestGenerator>) -> Result<usize> {
        let written = self.write_ebuilds()?;
        self.write_metadata()?;
        if let Some(generator) = generator {
            self.write_manifest(generator)?;
        }
        self.modified = false;
        Ok(written)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove one version: its record, its ebuild file and its distfile claim
    pub fn purge_package(&mut self, ebuild_version: &str) -> Result<bool> {
        let record = match self.packages.remove(ebuild_version) {
            Some(record) => record,
            None => return Ok(false),
        };

        match fs::remove_file(self.path.join(record.ebuild_file())) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(info) = record.distfile_info(&self.distdir) {
            self.release_distfile(&info.distfile)?;
        }

        log_overlay_debug!("Package purged", package = self.full_name(), version = ebuild_version);
        self.modified = true;
        self.needs_manifest = true;
        self.needs_metadata = true;
        Ok(true)
    }

    /// Keep the `n` highest versions with an ebuild on disk, purge older ones.
    /// Returns the number of purged versions.
    pub fn keep_nth_latest(&mut self, n: usize) -> Result<usize> {
        let mut on_disk: Vec<(Version, String)> = self
            .sorted_versions()
            .into_iter()
            .filter(|(_, key)| {
                self.packages
                    .get(key)
                    .is_some_and(|r| self.path.join(r.ebuild_file()).exists())
            })
            .collect();
        on_disk.reverse();

        let mut purged = 0;
        for (_, key) in on_disk.into_iter().skip(n) {
            if self.purge_package(&key)? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// `(version, key)` pairs in ascending version order
    fn sorted_versions(&self) -> Vec<(Version, String)> {
        let mut versions: Vec<(Version, String)> = self
            .packages
            .keys()
            .filter_map(|key| Version::parse(key).ok().map(|v| (v, key.clone())))
            .collect();
        versions.sort_by(|a, b| a.0.cmp(&b.0));
        versions
    }

    /// Remove the directory if it holds no ebuilds. Returns true if removed.
    pub fn remove_if_empty(&mut self) -> Result<bool> {
        if !self.packages.is_empty() {
            return Ok(false);
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    /// Give up the owner handle; claims on distfiles are dropped with it
    pub fn release(&self) {
        self.distroot.distmap().drop_owner(self.handle);
        self.distroot.owners().release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovly_dist::{Compression, DistMapEntry, DistrootLayout, Strategy};
    use ovly_manifest::InternalManifest;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        distroot: Arc<Distroot>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let distroot = Distroot::open_persistent(
                &temp.path().join("distfiles"),
                DistrootLayout::Flat,
                Strategy::parse(&["copy"]).unwrap(),
                &temp.path().join("distmap"),
                Compression::None,
                true,
            )
            .unwrap();
            Self {
                temp,
                distroot: Arc::new(distroot),
            }
        }

        fn overlay(&self) -> PathBuf {
            self.temp.path().join("overlay")
        }

        fn dir(&self, name: &str) -> PackageDir {
            PackageDir::new(&self.overlay(), "sci-R", name, self.distroot.clone())
        }

        fn source(&self, file: &str, content: &[u8]) -> PathBuf {
            let path = self.temp.path().join("sources").join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn record(&self, name: &str, version: &str, content: &[u8]) -> PackageRecord {
            let file = format!("{}_{}.tar.gz", name, version);
            let src = self.source(&file, content);
            PackageRecord::new(name, version)
                .unwrap()
                .with_source(&src, Some("CRAN"), &file)
                .with_ebuild(&format!("# {} {}\nEAPI=8\n", name, version))
        }
    }

    #[test]
    fn test_add_new_version() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        let outcome = dir.add_package(fx.record("a", "1.0", b"a"), false, false).unwrap();
        assert_eq!(outcome, AddOutcome::Added);

        let record = dir.get("1.0").unwrap();
        assert_eq!(record.backref(), Some(dir.handle()));
        assert!(record.is_readonly());
        assert!(fx.distroot.distmap().has_backref_to("a_1.0.tar.gz", dir.handle()));
        assert!(dir.needs_manifest() && dir.needs_metadata());
    }

    #[test]
    fn test_policy_rejections() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");

        let denied = fx.record("a", "1.0", b"a").with_policy(AddPolicy::FORCE_DENY);
        assert_eq!(
            dir.add_package(denied, true, true).unwrap(),
            AddOutcome::Rejected(RejectReason::ForceDeny)
        );

        let replace_only = fx.record("a", "1.0", b"a").with_policy(AddPolicy::REPLACE_ONLY);
        assert_eq!(
            dir.add_package(replace_only, false, false).unwrap(),
            AddOutcome::Rejected(RejectReason::NothingToReplace)
        );

        dir.add_package(fx.record("a", "1.0", b"a"), false, false).unwrap();
        let deny = fx.record("a", "1.0", b"a").with_policy(AddPolicy::DENY_REPLACE);
        assert_eq!(
            dir.add_package(deny, true, false).unwrap(),
            AddOutcome::Rejected(RejectReason::DenyReplace)
        );
    }

    #[test]
    fn test_replace_paths() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"a"), false, false).unwrap();

        let forced = fx.record("a", "1.0", b"a").with_policy(AddPolicy::FORCE_REPLACE);
        assert_eq!(dir.add_package(forced, false, false).unwrap(), AddOutcome::Replaced);
        assert_eq!(
            dir.add_package(fx.record("a", "1.0", b"a"), true, false).unwrap(),
            AddOutcome::Replaced
        );
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_manifest_tracks_same_size_rewrite() {
        use ovly_dist::{digest::digest_bytes, DigestKind};
        use ovly_manifest::{FileType, ManifestFile};

        let fx = Fixture::new();
        let generator = InternalManifest::new(vec![DigestKind::Sha256]);
        let mut dir = fx.dir("a");
        let first = PackageRecord::new("a", "1.0").unwrap().with_ebuild("AAAA\n");
        dir.add_package(first, false, false).unwrap();
        dir.write(Some(&generator)).unwrap();

        let second = PackageRecord::new("a", "1.0")
            .unwrap()
            .with_ebuild("BBBB\n")
            .with_policy(AddPolicy::FORCE_REPLACE);
        assert_eq!(dir.add_package(second, false, false).unwrap(), AddOutcome::Replaced);
        dir.write(Some(&generator)).unwrap();

        let manifest = ManifestFile::read(dir.path()).unwrap();
        let entry = manifest.get(FileType::Ebuild, "a-1.0.ebuild").unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(entry.hashes.snapshot(), digest_bytes(b"BBBB\n", &[DigestKind::Sha256]));
    }

    #[test]
    fn test_physical_only_is_replaced() {
        let fx = Fixture::new();
        let path = fx.overlay().join("sci-R/a");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("a-1.0.ebuild"), "old\n").unwrap();
        fs::write(path.join("unrelated.txt"), "x").unwrap();

        let mut dir = fx.dir("a");
        assert_eq!(dir.scan().unwrap(), 1);
        assert!(dir.get("1.0").unwrap().is_physical_only());

        assert_eq!(
            dir.add_package(fx.record("a", "1.0", b"a"), false, false).unwrap(),
            AddOutcome::Replaced
        );
        dir.write_ebuilds().unwrap();
        assert_eq!(
            fs::read_to_string(path.join("a-1.0.ebuild")).unwrap(),
            "# a 1.0\nEAPI=8\n"
        );
    }

    #[test]
    fn test_postpone_returns_handle() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"a"), false, false).unwrap();

        let record = fx.record("a", "1.0", b"changed").with_policy(AddPolicy::DENY_REPLACE);
        assert_eq!(
            dir.add_package(record, false, true).unwrap(),
            AddOutcome::Rejected(RejectReason::DenyReplace)
        );

        let record = fx.record("a", "1.0", b"changed");
        assert_eq!(
            dir.add_package(record.clone(), false, true).unwrap(),
            AddOutcome::Deferred(dir.handle())
        );
        // The policy survives the deferral untouched
        let record = record.with_policy(AddPolicy::REVBUMP_ON_COLLISION);
        assert_eq!(dir.add_package(record, false, true).unwrap(), AddOutcome::Added);
        assert!(dir.get("1.0-r1").is_some());
    }

    #[test]
    fn test_idempotent_readd() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        assert_eq!(
            dir.add_package(fx.record("a", "1.0", b"same"), false, false).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            dir.add_package(fx.record("a", "1.0", b"same"), false, false).unwrap(),
            AddOutcome::Rejected(RejectReason::AlreadyPresent)
        );
        assert_eq!(dir.versions(), vec!["1.0"]);
    }

    #[test]
    fn test_revbump_on_changed_digest() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"first"), false, false).unwrap();
        dir.write_ebuilds().unwrap();

        let outcome = dir
            .add_package(fx.record("a", "1.0", b"second"), false, false)
            .unwrap();
        assert_eq!(outcome, AddOutcome::Added);
        assert_eq!(dir.versions(), vec!["1.0", "1.0-r1"]);
        assert_eq!(
            dir.get("1.0-r1").unwrap().distfile().as_deref(),
            Some("a_1.0-r1.tar.gz")
        );
    }

    #[test]
    fn test_explicit_revbump_policy_skips_taken_revisions() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"x"), false, false).unwrap();
        dir.add_package(fx.record("a", "1.0", b"x").with_revision(1), false, false)
            .unwrap();

        let record = fx
            .record("a", "1.0", b"x")
            .with_policy(AddPolicy::REVBUMP_ON_COLLISION | AddPolicy::REPLACE_ONLY);
        assert_eq!(dir.add_package(record, false, false).unwrap(), AddOutcome::Added);
        assert_eq!(dir.versions(), vec!["1.0", "1.0-r1", "1.0-r2"]);
    }

    #[test]
    fn test_collision_with_other_directory() {
        let fx = Fixture::new();
        let mut a = fx.dir("a");
        let mut b = fx.dir("b");

        let src = fx.source("shared.tgz", b"shared");
        let make = |name: &str| {
            PackageRecord::new(name, "1.0")
                .unwrap()
                .with_source(&src, Some("CRAN"), "shared.tgz")
                .with_ebuild("EAPI=8\n")
        };

        assert_eq!(a.add_package(make("a"), false, false).unwrap(), AddOutcome::Added);
        assert_eq!(
            b.add_package(make("b"), false, false).unwrap(),
            AddOutcome::Rejected(RejectReason::Collision)
        );
        let distmap = fx.distroot.distmap();
        let entry = distmap.get("shared.tgz").unwrap();
        assert_eq!(entry.backrefs.iter().copied().collect::<Vec<_>>(), vec![a.handle()]);
    }

    #[test]
    fn test_write_registers_persistent_entries() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(
            fx.record("a", "1.0", b"a").with_description("An R package"),
            false,
            false,
        )
        .unwrap();

        let generator = InternalManifest::new(vec![ovly_dist::DigestKind::Sha256]);
        assert_eq!(dir.write(Some(&generator)).unwrap(), 1);

        assert!(dir.path().join("a-1.0.ebuild").exists());
        assert!(dir.path().join("metadata.xml").exists());
        assert!(dir.path().join("Manifest").exists());
        assert!(fx.distroot.root().join("a_1.0.tar.gz").exists());
        assert!(fx.distroot.distmap().get("a_1.0.tar.gz").unwrap().is_persistent());
        assert!(!dir.needs_manifest());
    }

    #[test]
    fn test_persistent_entry_from_earlier_run_is_kept() {
        let fx = Fixture::new();
        let record = fx.record("a", "1.0", b"a");
        let digest = record
            .hashes()
            .get_or_compute(&record.source().unwrap().src, &[ovly_dist::DISTMAP_DIGEST])
            .unwrap()[&ovly_dist::DISTMAP_DIGEST]
            .clone();
        fx.distroot.distmap().add_entry(
            "a_1.0.tar.gz",
            DistMapEntry::persistent(Some("CRAN".into()), "a_1.0.tar.gz".into(), digest),
        );

        let mut dir = fx.dir("a");
        assert_eq!(dir.add_package(record, false, false).unwrap(), AddOutcome::Added);
        assert!(fx.distroot.distmap().get("a_1.0.tar.gz").unwrap().is_persistent());
    }

    #[test]
    fn test_keep_nth_latest() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        for version in ["1.0", "1.1", "1.2", "2.0"] {
            dir.add_package(fx.record("a", version, version.as_bytes()), false, false)
                .unwrap();
        }
        dir.write(None).unwrap();
        let generator = InternalManifest::new(vec![ovly_dist::DigestKind::Sha256]);
        dir.write_manifest(&generator).unwrap();
        assert!(!dir.needs_manifest());

        assert_eq!(dir.keep_nth_latest(2).unwrap(), 2);
        assert_eq!(dir.versions(), vec!["1.2", "2.0"]);
        assert!(!dir.path().join("a-1.0.ebuild").exists());
        assert!(!dir.path().join("a-1.1.ebuild").exists());
        assert!(dir.path().join("a-2.0.ebuild").exists());
        assert!(dir.needs_manifest());
        assert!(dir.needs_metadata());
        assert!(!fx.distroot.root().join("a_1.0.tar.gz").exists());
    }

    #[test]
    fn test_keep_nth_latest_ignores_unwritten() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"1"), false, false).unwrap();
        dir.write(None).unwrap();
        dir.add_package(fx.record("a", "2.0", b"2"), false, false).unwrap();

        assert_eq!(dir.keep_nth_latest(1).unwrap(), 0);
        assert_eq!(dir.versions(), vec!["1.0", "2.0"]);
    }

    #[test]
    fn test_remove_if_empty_and_release() {
        let fx = Fixture::new();
        let mut dir = fx.dir("a");
        dir.add_package(fx.record("a", "1.0", b"1"), false, false).unwrap();
        dir.write(None).unwrap();
        assert!(!dir.remove_if_empty().unwrap());

        assert!(dir.purge_package("1.0").unwrap());
        assert!(!dir.purge_package("1.0").unwrap());
        assert!(dir.remove_if_empty().unwrap());
        assert!(!dir.path().exists());

        let handle = dir.handle();
        dir.release();
        assert!(!fx.distroot.owners().is_live(handle));
    }
}
