//! # Category
//!
//! Package directories of one category and the concurrent writer.
//!
//! `write` feeds the directories that need work into a shared queue and
//! starts `min(jobs, #dirs)` worker threads. Each worker pulls one directory
//! at a time and writes its ebuilds, then its metadata. Manifests are
//! written inside the worker only if the generator is thread-safe, otherwise
//! in one sequential pass after all workers joined.
//!
//! The first worker error is kept and returned once every worker finished
//! its current directory; remaining queue items are left alone.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ovly_config::{log_overlay_debug, log_writer_debug, log_writer_error};
use ovly_dist::{Distroot, OwnerHandle};
use ovly_manifest::{ManifestError, ManifestGenerator};

use crate::package_dir::PackageDir;
use crate::{OverlayError, Result};

/// Upper bound for the automatic worker count
const MAX_AUTO_JOBS: usize = 4;

/// Default worker count: half the cores, between 1 and 4
pub fn default_jobs() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_AUTO_JOBS)
}

#[derive(Clone)]
pub struct WriteOptions {
    /// Worker threads (0 = [`default_jobs`])
    pub jobs: usize,
    pub generator: Arc<dyn ManifestGenerator>,
}

impl std::fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOptions")
            .field("jobs", &self.jobs)
            .field("generator", &self.generator.name())
            .finish()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Ebuild files written or confirmed up to date
    pub written: usize,
    /// Manifests regenerated
    pub manifests: usize,
    /// Packages whose manifest tool failed, with the error text
    pub failed: Vec<(String, String)>,
    /// Package directories removed because they became empty
    pub pruned: usize,
}

impl WriteReport {
    pub fn merge(&mut self, other: WriteReport) {
        self.written += other.written;
        self.manifests += other.manifests;
        self.failed.extend(other.failed);
        self.pruned += other.pruned;
    }
}

#[derive(Debug)]
pub struct Category {
    name: String,
    path: PathBuf,
    overlay_dir: PathBuf,
    distroot: Arc<Distroot>,
    dirs: BTreeMap<String, PackageDir>,
}

impl Category {
    pub fn new(overlay_dir: &Path, name: &str, distroot: Arc<Distroot>) -> Self {
        Self {
            name: name.to_string(),
            path: overlay_dir.join(name),
            overlay_dir: overlay_dir.to_path_buf(),
            distroot,
            dirs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn get(&self, package: &str) -> Option<&PackageDir> {
        self.dirs.get(package)
    }

    pub fn get_or_create(&mut self, package: &str) -> &mut PackageDir {
        let (overlay_dir, category, distroot) = (&self.overlay_dir, &self.name, &self.distroot);
        self.dirs
            .entry(package.to_string())
            .or_insert_with(|| PackageDir::new(overlay_dir, category, package, distroot.clone()))
    }

    /// Package directory owning `handle`
    pub fn get_by_handle_mut(&mut self, handle: OwnerHandle) -> Option<&mut PackageDir> {
        self.dirs.values_mut().find(|d| d.handle() == handle)
    }

    pub fn package_dirs(&self) -> impl Iterator<Item = &PackageDir> {
        self.dirs.values()
    }

    /// Import existing package directories. Returns the number of ebuilds found.
    pub fn scan(&mut self) -> Result<usize> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut found = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let package = entry.file_name().to_string_lossy().into_owned();
            if package.starts_with('.') {
                continue;
            }
            found += self.get_or_create(&package).scan()?;
        }

        log_overlay_debug!("Category scanned", category = self.name.as_str(), ebuilds = found);
        Ok(found)
    }

    /// Apply [`PackageDir::keep_nth_latest`] to every directory
    pub fn keep_nth_latest(&mut self, n: usize) -> Result<usize> {
        let mut purged = 0;
        for dir in self.dirs.values_mut() {
            purged += dir.keep_nth_latest(n)?;
        }
        Ok(purged)
    }

    /// Drop directories without ebuilds from disk and memory
    pub fn remove_empty(&mut self) -> Result<usize> {
        let empty: Vec<String> = self
            .dirs
            .iter()
            .filter(|(_, dir)| dir.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        for name in &empty {
            if let Some(mut dir) = self.dirs.remove(name) {
                dir.remove_if_empty()?;
                dir.release();
            }
        }
        if self.dirs.is_empty() {
            // Only succeeds if nothing else lives there
            let _ = fs::remove_dir(&self.path);
        }
        Ok(empty.len())
    }

    /// Regenerate pending manifests one directory at a time
    pub fn write_manifests(&mut self, generator: &dyn ManifestGenerator) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        for dir in self.dirs.values_mut() {
            write_manifest(dir, generator, &mut report)?;
        }
        Ok(report)
    }

    // ========================================================================
    // Concurrent write
    // ========================================================================

    /// Write every modified package directory with a bounded worker pool
    pub fn write(&mut self, options: &WriteOptions) -> Result<WriteReport> {
        let pending: Vec<&mut PackageDir> = self
            .dirs
            .values_mut()
            .filter(|d| d.is_modified() || d.needs_manifest())
            .collect();
        if pending.is_empty() {
            return Ok(WriteReport {
                pruned: self.remove_empty()?,
                ..WriteReport::default()
            });
        }

        let configured = if options.jobs == 0 {
            default_jobs()
        } else {
            options.jobs
        };
        let jobs = configured.min(pending.len());
        let generator = options.generator.as_ref();
        let in_worker = generator.thread_safe();

        log_writer_debug!(
            "Writing category",
            category = self.name.as_str(),
            packages = pending.len(),
            jobs = jobs,
            generator = generator.name()
        );

        let (tx, rx) = crossbeam_channel::unbounded();
        for dir in pending {
            // Receiver is alive; unbounded send cannot fail
            let _ = tx.send(dir);
        }
        drop(tx);

        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<OverlayError>> = Mutex::new(None);
        let report = Mutex::new(WriteReport::default());

        thread::scope(|scope| -> io::Result<()> {
            for worker in 0..jobs {
                let rx = rx.clone();
                let (abort, first_error, report) = (&abort, &first_error, &report);
                thread::Builder::new()
                    .name(format!("ovly-writer-{}", worker))
                    .spawn_scoped(scope, move || {
                        while let Ok(dir) = rx.recv() {
                            if abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let mut local = WriteReport::default();
                            let result = write_dir(dir, in_worker.then_some(generator), &mut local);
                            report.lock().unwrap().merge(local);

                            if let Err(e) = result {
                                let package = dir.full_name();
                                log_writer_error!(
                                    "Worker failed",
                                    worker = worker,
                                    package = package.as_str(),
                                    error = e.to_string()
                                );
                                abort.store(true, Ordering::SeqCst);
                                let mut slot = first_error.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(OverlayError::Worker {
                                        package,
                                        worker,
                                        source: Box::new(e),
                                    });
                                }
                            }
                        }
                    })?;
            }
            Ok(())
        })?;
        drop(rx);

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        let mut report = report.into_inner().unwrap();

        if !in_worker {
            report.merge(self.write_manifests(generator)?);
        }
        report.pruned = self.remove_empty()?;
        Ok(report)
    }
}

/// Ebuilds and metadata, plus the manifest when `generator` is given
fn write_dir(
    dir: &mut PackageDir,
    generator: Option<&dyn ManifestGenerator>,
    report: &mut WriteReport,
) -> Result<()> {
    report.written += dir.write(None)?;
    if let Some(generator) = generator {
        write_manifest(dir, generator, report)?;
    }
    Ok(())
}

/// A failing manifest tool is recorded in the report, not raised
fn write_manifest(
    dir: &mut PackageDir,
    generator: &dyn ManifestGenerator,
    report: &mut WriteReport,
) -> Result<()> {
    match dir.write_manifest(generator) {
        Ok(true) => report.manifests += 1,
        Ok(false) => {}
        Err(OverlayError::Manifest(e @ ManifestError::Subprocess { .. })) => {
            report.failed.push((dir.full_name(), e.to_string()));
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
