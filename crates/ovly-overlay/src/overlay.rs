//! # Overlay
//!
//! Categories plus the repository-wide files: `profiles/repo_name`,
//! `profiles/categories`, `metadata/layout.conf` and imported eclasses.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ovly_config::{log_overlay_debug, log_overlay_info, normalize_path, Config};
use ovly_dist::{Distroot, OwnerHandle};
use ovly_manifest::ManifestGenerator;

use crate::category::{Category, WriteOptions, WriteReport};
use crate::metadata::{import_eclasses, write_profiles};
use crate::policy::AddOutcome;
use crate::record::PackageRecord;
use crate::{OverlayError, Result};

/// Top-level directories that never hold packages
const RESERVED_DIRS: &[&str] = &["eclass", "licenses", "metadata", "profiles", "scripts"];

/// How [`Overlay::add_package`] treats an existing version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddFlags {
    /// Replace an existing version unconditionally
    pub add_if_physical: bool,
    /// Defer unresolved collisions instead of deciding now
    pub allow_postpone: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverlayStats {
    pub categories: usize,
    pub packages: usize,
    pub ebuilds: usize,
    pub added: usize,
    pub replaced: usize,
    pub deferred: usize,
    pub rejected: usize,
}

pub struct Overlay {
    name: String,
    dir: PathBuf,
    eclass_dirs: Vec<PathBuf>,
    masters: Vec<String>,
    keep_nth_latest: usize,
    jobs: usize,
    distroot: Arc<Distroot>,
    generator: Arc<dyn ManifestGenerator>,
    categories: BTreeMap<String, Category>,
    counters: OverlayStats,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("generator", &self.generator.name())
            .field("categories", &self.categories.len())
            .finish()
    }
}

impl Overlay {
    /// Open the overlay described by `config`, including its distroot.
    ///
    /// Existing ebuilds are imported when incremental mode is on.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let distroot = Distroot::from_config(&config.distfiles, &config.distmap)?;
        Self::open_with(config, Arc::new(distroot))
    }

    /// Open with an already constructed distroot
    pub fn open_with(config: &Config, distroot: Arc<Distroot>) -> Result<Self> {
        config.validate()?;
        let generator = ovly_manifest::generator::from_config(&config.manifest)?;

        let mut overlay = Self {
            name: config.overlay.name.clone(),
            dir: normalize_path(&config.overlay.dir),
            eclass_dirs: config.overlay.eclass_dirs.iter().map(|d| normalize_path(d)).collect(),
            masters: config.overlay.masters.clone(),
            keep_nth_latest: config.overlay.keep_nth_latest,
            jobs: config.write.jobs,
            distroot,
            generator,
            categories: BTreeMap::new(),
            counters: OverlayStats::default(),
        };
        if config.write.incremental {
            overlay.scan()?;
        }
        Ok(overlay)
    }

    /// Replace the manifest generator chosen from configuration
    pub fn with_generator(mut self, generator: Arc<dyn ManifestGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn distroot(&self) -> &Arc<Distroot> {
        &self.distroot
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    // ========================================================================
    // Adding packages
    // ========================================================================

    pub fn add_package(
        &mut self,
        category: &str,
        record: PackageRecord,
        flags: AddFlags,
    ) -> Result<AddOutcome> {
        if category.is_empty()
            || category.contains('/')
            || category.contains(char::is_whitespace)
            || RESERVED_DIRS.contains(&category)
        {
            return Err(OverlayError::InvalidName(category.to_string()));
        }

        let (dir, distroot) = (&self.dir, &self.distroot);
        let package = record.name().to_string();
        let outcome = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| Category::new(dir, category, distroot.clone()))
            .get_or_create(&package)
            .add_package(record, flags.add_if_physical, flags.allow_postpone)?;

        self.count(category, &package, &outcome);
        Ok(outcome)
    }

    /// Decide a deferred record now; postponing is no longer allowed
    pub fn retry_deferred(&mut self, handle: OwnerHandle, record: PackageRecord) -> Result<AddOutcome> {
        let dir = self
            .categories
            .values_mut()
            .find_map(|c| c.get_by_handle_mut(handle))
            .ok_or(OverlayError::UnknownOwner(handle))?;
        let full_name = dir.full_name();
        let outcome = dir.add_package(record, false, false)?;

        let (category, package) = full_name.split_once('/').unwrap_or(("", full_name.as_str()));
        self.count(category, package, &outcome);
        Ok(outcome)
    }

    fn count(&mut self, category: &str, package: &str, outcome: &AddOutcome) {
        match outcome {
            AddOutcome::Added => self.counters.added += 1,
            AddOutcome::Replaced => self.counters.replaced += 1,
            AddOutcome::Deferred(_) => self.counters.deferred += 1,
            AddOutcome::Rejected(reason) => {
                self.counters.rejected += 1;
                log_overlay_debug!(
                    "Package rejected",
                    category = category,
                    package = package,
                    reason = reason.to_string()
                );
            }
        }
    }

    // ========================================================================
    // Disk state
    // ========================================================================

    /// Import existing categories and ebuilds. Returns the number of ebuilds.
    pub fn scan(&mut self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut found = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || RESERVED_DIRS.contains(&name.as_str()) {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let (dir, distroot) = (&self.dir, &self.distroot);
            let category = self
                .categories
                .entry(name.clone())
                .or_insert_with(|| Category::new(dir, &name, distroot.clone()));
            found += category.scan()?;
        }

        log_overlay_info!("Overlay scanned", overlay = self.name.as_str(), ebuilds = found);
        Ok(found)
    }

    /// Write repository files, then every category
    pub fn write(&mut self) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        // Directories left empty by rejected additions
        for category in self.categories.values_mut() {
            report.pruned += category.remove_empty()?;
        }
        self.categories.retain(|_, c| !c.is_empty());

        fs::create_dir_all(&self.dir)?;
        write_profiles(
            &self.dir,
            &self.name,
            self.categories
                .values()
                .filter(|c| !c.is_empty())
                .map(|c| c.name()),
            &self.masters,
        )?;
        let eclasses = import_eclasses(&self.dir, &self.eclass_dirs)?;

        let options = WriteOptions {
            jobs: self.jobs,
            generator: self.generator.clone(),
        };
        for category in self.categories.values_mut() {
            report.merge(category.write(&options)?);
        }

        if self.keep_nth_latest > 0 {
            self.keep_nth_latest(self.keep_nth_latest)?;
            for category in self.categories.values_mut() {
                report.merge(category.write_manifests(self.generator.as_ref())?);
                report.pruned += category.remove_empty()?;
            }
        }
        self.categories.retain(|_, c| !c.is_empty());

        log_overlay_info!(
            "Overlay written",
            overlay = self.name.as_str(),
            ebuilds = report.written,
            manifests = report.manifests,
            failed = report.failed.len(),
            eclasses = eclasses
        );
        Ok(report)
    }

    /// Keep the `n` newest ebuilds of every package. Returns the number purged.
    pub fn keep_nth_latest(&mut self, n: usize) -> Result<usize> {
        let mut purged = 0;
        for category in self.categories.values_mut() {
            purged += category.keep_nth_latest(n)?;
        }
        Ok(purged)
    }

    /// Save the DistMap or remove a temporary distroot
    pub fn finalize(&self) -> Result<()> {
        self.distroot.finalize()?;
        Ok(())
    }

    pub fn stats(&self) -> OverlayStats {
        let mut stats = self.counters.clone();
        for category in self.categories.values() {
            if category.is_empty() {
                continue;
            }
            stats.categories += 1;
            for dir in category.package_dirs() {
                stats.packages += 1;
                stats.ebuilds += dir.len();
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RejectReason;
    use ovly_config::testing::TestEnvironment;

    fn open(env: &TestEnvironment) -> Overlay {
        let mut config = env.config();
        config.manifest.hashes = vec!["sha256".to_string()];
        Overlay::open(&config).unwrap()
    }

    fn record(env: &TestEnvironment, name: &str, version: &str) -> PackageRecord {
        let file = format!("{}_{}.tar.gz", name, version);
        let src = env.source_file(&file, file.as_bytes()).unwrap();
        PackageRecord::new(name, version)
            .unwrap()
            .with_source(&src, Some("CRAN"), &file)
            .with_ebuild("EAPI=8\n")
    }

    #[test]
    fn test_write_repository_files() {
        let env = TestEnvironment::new().unwrap();
        let mut overlay = open(&env);
        overlay
            .add_package("sci-R", record(&env, "seewave", "2.0"), AddFlags::default())
            .unwrap();

        let report = overlay.write().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.manifests, 1);

        let dir = overlay.dir();
        assert_eq!(
            fs::read_to_string(dir.join("profiles/repo_name")).unwrap(),
            format!("{}\n", overlay.name())
        );
        assert_eq!(fs::read_to_string(dir.join("profiles/categories")).unwrap(), "sci-R\n");
        assert!(dir.join("metadata/layout.conf").exists());
        assert!(dir.join("sci-R/seewave/seewave-2.0.ebuild").exists());
        assert!(dir.join("sci-R/seewave/Manifest").exists());
    }

    #[test]
    fn test_invalid_category() {
        let env = TestEnvironment::new().unwrap();
        let mut overlay = open(&env);
        for bad in ["", "a/b", "profiles", "sci R"] {
            let result = overlay.add_package(bad, record(&env, "x", "1.0"), AddFlags::default());
            assert!(matches!(result, Err(OverlayError::InvalidName(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_deferred_retry() {
        let env = TestEnvironment::new().unwrap();
        let mut overlay = open(&env);
        overlay
            .add_package("sci-R", record(&env, "a", "1.0"), AddFlags::default())
            .unwrap();

        let flags = AddFlags {
            allow_postpone: true,
            ..AddFlags::default()
        };
        let handle = match overlay.add_package("sci-R", record(&env, "a", "1.0"), flags).unwrap() {
            AddOutcome::Deferred(handle) => handle,
            other => panic!("expected deferral, got {:?}", other),
        };

        let outcome = overlay.retry_deferred(handle, record(&env, "a", "1.0")).unwrap();
        assert_eq!(outcome, AddOutcome::Rejected(RejectReason::AlreadyPresent));

        let stats = overlay.stats();
        assert_eq!((stats.added, stats.deferred, stats.rejected), (1, 1, 1));
        assert_eq!((stats.categories, stats.packages, stats.ebuilds), (1, 1, 1));
    }

    #[test]
    fn test_retry_unknown_handle() {
        let env = TestEnvironment::new().unwrap();
        let mut overlay = open(&env);
        let stray = overlay.distroot().owners().register("nowhere/stray");
        assert!(matches!(
            overlay.retry_deferred(stray, record(&env, "a", "1.0")),
            Err(OverlayError::UnknownOwner(_))
        ));
    }

    #[test]
    fn test_scan_skips_reserved_dirs() {
        let env = TestEnvironment::new().unwrap();
        let dir = &env.overlay_dir;
        fs::create_dir_all(dir.join("sci-R/a")).unwrap();
        fs::write(dir.join("sci-R/a/a-1.0.ebuild"), "").unwrap();
        fs::create_dir_all(dir.join("eclass")).unwrap();
        fs::create_dir_all(dir.join("profiles")).unwrap();

        let overlay = open(&env);
        assert!(overlay.category("sci-R").is_some());
        assert!(overlay.category("eclass").is_none());
        assert!(overlay.category("profiles").is_none());
        assert_eq!(overlay.stats().ebuilds, 1);
    }
}
