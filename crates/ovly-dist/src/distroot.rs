//! # Distroot
//!
//! The directory distfiles are materialized into, plus the DistMap that
//! records where each of them came from.
//!
//! A persistent distroot keeps its tree and saves the DistMap on
//! [`Distroot::finalize`]. A temporary distroot lives in a fresh temporary
//! directory that is deleted on finalize. Dropping a distroot finalizes it
//! unless that already happened.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ovly_config::{
    log_distroot_debug, log_distroot_info, log_distroot_warn, normalize_path, DistMapConfig,
    DistfilesConfig,
};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::digest::HashCache;
use crate::distmap::{Compression, DistMap, DistMapEntry, IntegrityStatus, DISTMAP_DIGEST};
use crate::link_strategy::{is_unsupported, FsLinker, LinkMethod, Linker, Strategy, SupportMask};
use crate::owner::{OwnerHandle, OwnerRegistry, RecordRef};
use crate::parallel;
use crate::{DistError, Result};

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistrootLayout {
    /// All distfiles in the root directory
    #[default]
    Flat,
    /// One subdirectory per package name
    PerPackage,
}

impl FromStr for DistrootLayout {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(DistrootLayout::Flat),
            "per-package" => Ok(DistrootLayout::PerPackage),
            other => Err(DistError::Config(format!(
                "unknown distroot layout '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Distdir
// ============================================================================

/// One package's view of the distroot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distdir {
    root: PathBuf,
    prefix: Option<String>,
}

impl Distdir {
    /// Physical directory
    pub fn path(&self) -> PathBuf {
        match &self.prefix {
            Some(prefix) => self.root.join(prefix),
            None => self.root.clone(),
        }
    }

    /// DistMap key for a file placed in this distdir
    pub fn distfile_key(&self, file_name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, file_name),
            None => file_name.to_string(),
        }
    }

    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.path().join(file_name)
    }
}

// ============================================================================
// DistfileInfo
// ============================================================================

/// What a package record hands to the distroot about its source archive
#[derive(Debug, Clone)]
pub struct DistfileInfo {
    /// DistMap key (relative to the distroot)
    pub distfile: String,
    /// Archive the distfile is linked from
    pub src: PathBuf,
    pub repo_name: Option<String>,
    /// Path of the archive inside its repository
    pub repo_file: String,
    /// The record's checksum cache
    pub hashes: HashCache,
}

impl DistfileInfo {
    pub fn new(distfile: &str, src: &Path, repo_name: Option<&str>, repo_file: &str) -> Self {
        Self {
            distfile: distfile.to_string(),
            src: src.to_path_buf(),
            repo_name: repo_name.map(str::to_string),
            repo_file: repo_file.to_string(),
            hashes: HashCache::new(),
        }
    }

    /// Share an existing checksum cache instead of a fresh one
    pub fn with_hashes(mut self, hashes: HashCache) -> Self {
        self.hashes = hashes;
        self
    }

    /// DistMap digest of the source archive (cached)
    pub fn digest(&self) -> io::Result<String> {
        let mut values = self.hashes.get_or_compute(&self.src, &[DISTMAP_DIGEST])?;
        values
            .remove(&DISTMAP_DIGEST)
            .ok_or_else(|| io::Error::other("digest missing after computation"))
    }

    fn same_origin(&self, entry: &DistMapEntry) -> bool {
        entry.repo_name == self.repo_name && entry.repo_file == self.repo_file
    }
}

// ============================================================================
// Distroot
// ============================================================================

/// Summary of [`Distroot::check_integrity`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Files hashed
    pub checked: usize,
    /// Files without an entry (dummy entries created)
    pub added: usize,
    /// Entries dropped because the file content changed
    pub mismatched: usize,
    /// Entries dropped because the file is gone
    pub missing: usize,
}

#[derive(Debug)]
enum Kind {
    Persistent {
        distmap_file: PathBuf,
        compression: Compression,
    },
    Temporary(Mutex<Option<TempDir>>),
}

pub struct Distroot {
    root: PathBuf,
    layout: DistrootLayout,
    strategy: Strategy,
    support: SupportMask,
    linker: Box<dyn Linker>,
    distmap: Mutex<DistMap>,
    owners: Arc<OwnerRegistry>,
    kind: Kind,
    digest_threads: Option<usize>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Distroot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distroot")
            .field("root", &self.root)
            .field("layout", &self.layout)
            .field("strategy", &self.strategy)
            .field("linker", &self.linker.name())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Distroot {
    /// Open (or create) a persistent distroot and load its DistMap
    pub fn open_persistent(
        root: &Path,
        layout: DistrootLayout,
        strategy: Strategy,
        distmap_file: &Path,
        compression: Compression,
        update_only: bool,
    ) -> Result<Self> {
        if strategy.is_tmpdir() {
            return Err(DistError::Config(
                "'tmpdir' strategy requires a temporary distroot".into(),
            ));
        }
        fs::create_dir_all(root)?;
        let distmap = DistMap::read_file(distmap_file, true, update_only)?;
        log_distroot_debug!(
            "Opened persistent distroot",
            root = root.display().to_string(),
            entries = distmap.len()
        );

        Ok(Self::build(
            root.to_path_buf(),
            layout,
            strategy,
            distmap,
            Kind::Persistent {
                distmap_file: distmap_file.to_path_buf(),
                compression,
            },
        ))
    }

    /// Create a distroot in a fresh temporary directory
    pub fn open_temporary(layout: DistrootLayout) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ovly-distroot-")
            .tempdir()?;
        let root = dir.path().to_path_buf();
        log_distroot_debug!("Opened temporary distroot", root = root.display().to_string());

        Ok(Self::build(
            root,
            layout,
            Strategy::new(vec![LinkMethod::TmpDir])?,
            DistMap::new(true),
            Kind::Temporary(Mutex::new(Some(dir))),
        ))
    }

    /// Open the distroot described by configuration.
    ///
    /// A `tmpdir` strategy yields a temporary distroot; anything else a
    /// persistent one, verified first when `verify` is set.
    pub fn from_config(distfiles: &DistfilesConfig, distmap: &DistMapConfig) -> Result<Self> {
        let layout: DistrootLayout = distfiles.layout.parse()?;
        let strategy = Strategy::parse(&distfiles.strategy)?;
        if strategy.is_tmpdir() {
            return Self::open_temporary(layout);
        }

        let distroot = Self::open_persistent(
            &normalize_path(&distfiles.root),
            layout,
            strategy,
            &normalize_path(&distmap.file),
            distmap.compression.parse()?,
            distmap.update_only,
        )?;
        if distfiles.verify {
            distroot.check_integrity()?;
        }
        Ok(distroot)
    }

    fn build(
        root: PathBuf,
        layout: DistrootLayout,
        strategy: Strategy,
        distmap: DistMap,
        kind: Kind,
    ) -> Self {
        Self {
            root,
            layout,
            strategy,
            support: SupportMask::default(),
            linker: Box::new(FsLinker),
            distmap: Mutex::new(distmap),
            owners: Arc::new(OwnerRegistry::new()),
            kind,
            digest_threads: None,
            finalized: AtomicBool::new(false),
        }
    }

    /// Replace the filesystem linker
    pub fn with_linker(mut self, linker: Box<dyn Linker>) -> Self {
        self.linker = linker;
        self
    }

    /// Share an owner registry with other components
    pub fn with_owners(mut self, owners: Arc<OwnerRegistry>) -> Self {
        self.owners = owners;
        self
    }

    pub fn with_digest_threads(mut self, threads: usize) -> Self {
        self.digest_threads = Some(threads);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> DistrootLayout {
        self.layout
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.kind, Kind::Persistent { .. })
    }

    /// Lock the DistMap. Every mutation goes through this guard.
    pub fn distmap(&self) -> MutexGuard<'_, DistMap> {
        self.distmap.lock().unwrap()
    }

    pub fn owners(&self) -> &Arc<OwnerRegistry> {
        &self.owners
    }

    /// Whether a link method is still enabled for this distroot
    pub fn method_enabled(&self, method: LinkMethod) -> bool {
        self.support.is_enabled(method)
    }

    pub fn get_distdir(&self, package_name: &str) -> Distdir {
        let prefix = match self.layout {
            DistrootLayout::Flat => None,
            DistrootLayout::PerPackage => Some(package_name.to_string()),
        };
        Distdir {
            root: self.root.clone(),
            prefix,
        }
    }

    // ========================================================================
    // Linking
    // ========================================================================

    /// Materialize `src` as `distfile`, replacing whatever is there
    pub fn add(&self, src: &Path, distfile: &str) -> Result<PathBuf> {
        let dest = self.root.join(distfile);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if fs::symlink_metadata(&dest).is_ok() {
            if same_file(src, &dest) {
                return Ok(dest);
            }
            fs::remove_file(&dest)?;
        }

        for &method in self.strategy.methods() {
            if !self.support.is_enabled(method) {
                continue;
            }
            match self.linker.link(method, src, &dest) {
                Ok(()) => {
                    log_distroot_debug!("Linked distfile", distfile = distfile, method = method.name());
                    return Ok(dest);
                }
                Err(e) if is_unsupported(method, &e) => {
                    if self.support.disable(method) {
                        log_distroot_warn!(
                            "Strategy disabled",
                            strategy = method.name(),
                            error = e.to_string()
                        );
                    }
                    let _ = fs::remove_file(&dest);
                }
                Err(e) => {
                    return Err(DistError::LinkFailed {
                        method: method.name(),
                        dest,
                        source: e,
                    })
                }
            }
        }

        Err(DistError::StrategiesExhausted { path: dest })
    }

    // ========================================================================
    // DistMap bookkeeping
    // ========================================================================

    /// Whether `owner` may claim `info.distfile`.
    ///
    /// False if a different live package directory already claims the file.
    pub fn handle_file_collision(&self, owner: OwnerHandle, info: &DistfileInfo) -> bool {
        let distmap = self.distmap();
        let entry = match distmap.get(&info.distfile) {
            Some(entry) => entry,
            None => return true,
        };
        !entry
            .backrefs
            .iter()
            .any(|&other| other != owner && self.owners.is_live(other))
    }

    /// Stage a volatile entry for a record that is not written yet.
    ///
    /// A persistent entry of the same origin is kept (the file may already
    /// be in place from an earlier run); only the backref is added.
    pub fn register_volatile(&self, owner: OwnerHandle, info: &DistfileInfo, version: &str) {
        let mut distmap = self.distmap();
        if let Some(entry) = distmap.get(&info.distfile) {
            if entry.is_persistent() && info.same_origin(entry) {
                distmap.add_backref(&info.distfile, owner);
                return;
            }
        }
        distmap.add_volatile(
            &info.distfile,
            info,
            RecordRef {
                owner,
                version: version.to_string(),
            },
        );
    }

    /// Link a record's distfile and record it as persistent.
    ///
    /// Skipped when an equal persistent entry exists and the file is in place.
    pub fn distmap_register(&self, owner: OwnerHandle, info: &DistfileInfo) -> Result<PathBuf> {
        let digest = info.digest()?;
        let dest = self.root.join(&info.distfile);

        {
            let mut distmap = self.distmap();
            let up_to_date = distmap.get(&info.distfile).is_some_and(|entry| {
                info.same_origin(entry) && entry.digest() == Some(digest.as_str())
            });
            if up_to_date && dest.exists() {
                distmap.add_backref(&info.distfile, owner);
                return Ok(dest);
            }
        }

        let dest = self.add(&info.src, &info.distfile)?;
        let entry = DistMapEntry::persistent(info.repo_name.clone(), info.repo_file.clone(), digest)
            .with_backref(owner);
        self.distmap().add_entry(&info.distfile, entry);
        Ok(dest)
    }

    /// Drop `owner`'s claim on `distfile`. Once nobody claims it the entry
    /// and the file are removed. Returns true if that happened.
    pub fn unregister(&self, owner: OwnerHandle, distfile: &str) -> Result<bool> {
        let mut distmap = self.distmap();
        match distmap.drop_backref(distfile, owner) {
            Some(0) => {
                distmap.try_delete(distfile);
            }
            _ => return Ok(false),
        }
        drop(distmap);

        match fs::remove_file(self.root.join(distfile)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        log_distroot_debug!("Distfile released", distfile = distfile);
        Ok(true)
    }

    /// Reconcile the distroot tree with the DistMap.
    ///
    /// Files without an entry get a dummy entry, entries whose file changed
    /// or vanished are dropped. Temporary distroots have nothing to check.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        if !self.is_persistent() {
            return Ok(report);
        }

        let files = self.collect_files();
        let digests = parallel::digest_files(
            files.iter().map(|(path, _)| path.clone()).collect(),
            &[DISTMAP_DIGEST],
            self.digest_threads,
        )?;

        let mut distmap = self.distmap();
        let mut seen = HashSet::with_capacity(files.len());
        for (path, key) in files {
            report.checked += 1;
            let digest = match digests.get(&path) {
                Some(Ok(values)) => values.get(&DISTMAP_DIGEST).cloned(),
                Some(Err(e)) => {
                    log_distroot_warn!(
                        "Cannot hash distfile",
                        distfile = key.as_str(),
                        error = e.to_string()
                    );
                    None
                }
                None => None,
            };

            match digest {
                Some(digest) => match distmap.check_integrity(&key, &digest) {
                    IntegrityStatus::Ok => {}
                    IntegrityStatus::Missing => {
                        distmap.add_dummy_entry(&key, digest);
                        report.added += 1;
                    }
                    IntegrityStatus::Mismatch => {
                        distmap.try_delete(&key);
                        report.mismatched += 1;
                    }
                },
                None => {
                    if distmap.try_delete(&key).is_some() {
                        report.mismatched += 1;
                    }
                }
            }
            seen.insert(key);
        }

        let stale: Vec<String> = distmap
            .iter()
            .filter(|(key, entry)| entry.is_persistent() && !seen.contains(*key))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in stale {
            distmap.try_delete(&key);
            report.missing += 1;
        }

        log_distroot_info!(
            "Integrity check finished",
            checked = report.checked,
            added = report.added,
            mismatched = report.mismatched,
            missing = report.missing
        );
        Ok(report)
    }

    /// Regular files and symlinks below the root, with their DistMap keys.
    /// Hidden files (the DistMap itself, its temp files) are skipped.
    fn collect_files(&self) -> Vec<(PathBuf, String)> {
        let distmap_file = match &self.kind {
            Kind::Persistent { distmap_file, .. } => Some(distmap_file.as_path()),
            Kind::Temporary(_) => None,
        };

        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter(|e| Some(e.path()) != distmap_file)
            .filter_map(|e| {
                let key = e.path().strip_prefix(&self.root).ok()?;
                Some((e.path().to_path_buf(), key.to_string_lossy().into_owned()))
            })
            .collect()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Save the DistMap (persistent) or delete the tree (temporary).
    /// Only the first call does anything.
    pub fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match &self.kind {
            Kind::Persistent {
                distmap_file,
                compression,
            } => {
                let mut distmap = self.distmap();
                if distmap.is_dirty() {
                    distmap.write_file(distmap_file, *compression)?;
                }
            }
            Kind::Temporary(dir) => {
                if let Some(dir) = dir.lock().unwrap().take() {
                    log_distroot_debug!(
                        "Removing temporary distroot",
                        root = self.root.display().to_string()
                    );
                    dir.close()?;
                }
            }
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl Drop for Distroot {
    fn drop(&mut self) {
        if self.is_finalized() {
            return;
        }
        if let Err(e) = self.finalize() {
            log_distroot_warn!("Finalize on drop failed", error = e.to_string());
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
