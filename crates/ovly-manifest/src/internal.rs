//! In-process manifest generation
//!
//! An existing entry is reused when its file was not rewritten in this run,
//! is not newer than the old manifest, has the same size and the entry
//! carries every configured hash. Rewriting a manifest after adding one
//! ebuild therefore only hashes that ebuild. Existing DIST entries are kept
//! unless the context lists them as removed; their hashes only seed the
//! record's cache once the distfile's content digest is confirmed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ovly_config::log_manifest_debug;
use ovly_dist::{digest_file, DigestKind, HashCache, DISTMAP_DIGEST};
use walkdir::WalkDir;

use crate::entry::{FileType, ManifestEntry};
use crate::file::{ManifestFile, MANIFEST_NAME};
use crate::generator::{ManifestContext, ManifestGenerator};
use crate::Result;

/// Directory holding AUX files
const FILESDIR: &str = "files";

#[derive(Debug, Clone)]
pub struct InternalManifest {
    kinds: Vec<DigestKind>,
}

impl InternalManifest {
    pub fn new(mut kinds: Vec<DigestKind>) -> Self {
        kinds.sort();
        kinds.dedup();
        Self { kinds }
    }

    pub fn kinds(&self) -> &[DigestKind] {
        &self.kinds
    }

    /// Build the manifest without writing it
    pub fn build(&self, ctx: &ManifestContext) -> Result<ManifestFile> {
        let old = ManifestFile::read(&ctx.package_dir)?;
        let old_mtime = fs::metadata(old.path()).and_then(|m| m.modified()).ok();
        let changed: BTreeSet<&PathBuf> = ctx.changed_files.iter().collect();
        let mut manifest = ManifestFile::new(&ctx.package_dir);

        for (filetype, name, path) in classify_dir(&ctx.package_dir) {
            let meta = fs::metadata(&path)?;
            let size = meta.len();
            if let Some(existing) = old.get(filetype, &name) {
                let unchanged = !changed.contains(&path)
                    && not_newer(meta.modified().ok(), old_mtime)
                    && existing.size == size;
                if unchanged && existing.hashes.contains_all(&self.kinds) {
                    manifest.insert(existing.clone());
                    continue;
                }
            }
            let hashes = HashCache::with_values(digest_file(&path, &self.kinds)?);
            manifest.insert(ManifestEntry::new(filetype, &name, size, hashes));
        }

        // DIST entries of ebuilds not handled in this run stay as they are
        for entry in old.entries().filter(|e| e.filetype == FileType::Dist) {
            if !ctx.removed_distfiles.contains(&entry.filename) {
                manifest.insert(entry.clone());
            }
        }

        for info in &ctx.distfiles {
            let name = dist_name(&info.distfile);
            let size = fs::metadata(&info.src)?.len();
            if let Some(existing) = old.get(FileType::Dist, name) {
                if existing.size == size {
                    let known = existing.hashes.get(DISTMAP_DIGEST);
                    let actual = info.hashes.get_or_compute(&info.src, &[DISTMAP_DIGEST])?;
                    if known.is_some() && known.as_ref() == actual.get(&DISTMAP_DIGEST) {
                        info.hashes.seed(&existing.hashes.snapshot());
                    }
                }
            }
            info.hashes.get_or_compute(&info.src, &self.kinds)?;
            manifest.insert(ManifestEntry::new(
                FileType::Dist,
                name,
                size,
                info.hashes.clone(),
            ));
        }

        Ok(manifest)
    }
}

impl ManifestGenerator for InternalManifest {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn thread_safe(&self) -> bool {
        true
    }

    fn generate(&self, ctx: &ManifestContext) -> Result<()> {
        let manifest = self.build(ctx)?;
        manifest.write(&self.kinds)?;
        log_manifest_debug!(
            "Manifest written",
            dir = ctx.package_dir.display().to_string(),
            entries = manifest.len()
        );
        Ok(())
    }
}

/// Whether a file was last modified no later than the old manifest
fn not_newer(file: Option<SystemTime>, manifest: Option<SystemTime>) -> bool {
    match (file, manifest) {
        (Some(file), Some(manifest)) => file <= manifest,
        _ => false,
    }
}

/// File name a distfile key is known by in a manifest
fn dist_name(distfile: &str) -> &str {
    distfile.rsplit('/').next().unwrap_or(distfile)
}

/// Every manifest-relevant file of a package directory
fn classify_dir(dir: &Path) -> Vec<(FileType, String, std::path::PathBuf)> {
    let filesdir = dir.join(FILESDIR);
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if let Ok(rel) = path.strip_prefix(&filesdir) {
            files.push((
                FileType::Aux,
                rel.to_string_lossy().into_owned(),
                path.to_path_buf(),
            ));
            continue;
        }

        let rel = match path.strip_prefix(dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        if rel == MANIFEST_NAME {
            continue;
        }
        let filetype = if rel.ends_with(".ebuild") && !rel.contains('/') {
            FileType::Ebuild
        } else {
            FileType::Misc
        };
        files.push((filetype, rel, path.to_path_buf()));
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovly_dist::{digest::digest_bytes, DistfileInfo};
    use tempfile::TempDir;

    fn package_dir(temp: &TempDir) -> std::path::PathBuf {
        let dir = temp.path().join("sci-R/seewave");
        fs::create_dir_all(dir.join("files")).unwrap();
        fs::write(dir.join("seewave-2.0.ebuild"), "EAPI=8\n").unwrap();
        fs::write(dir.join("metadata.xml"), "<pkgmetadata/>\n").unwrap();
        fs::write(dir.join("files/fix.patch"), "--- a\n+++ b\n").unwrap();
        fs::write(dir.join(".hidden"), "x").unwrap();
        dir
    }

    #[test]
    fn test_classification() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        fs::write(dir.join(MANIFEST_NAME), "").unwrap();

        let mut files: Vec<(FileType, String)> = classify_dir(&dir)
            .into_iter()
            .map(|(t, n, _)| (t, n))
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                (FileType::Aux, "fix.patch".to_string()),
                (FileType::Ebuild, "seewave-2.0.ebuild".to_string()),
                (FileType::Misc, "metadata.xml".to_string()),
            ]
        );
    }

    #[test]
    fn test_generate_writes_every_entry() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        let src = temp.path().join("seewave_2.0.tar.gz");
        fs::write(&src, b"sources").unwrap();

        let info = DistfileInfo::new("seewave/seewave_2.0.tar.gz", &src, Some("CRAN"), "seewave_2.0.tar.gz");
        let mut ctx = ManifestContext::new(&dir, temp.path());
        ctx.distfiles.push(info.clone());

        let generator = InternalManifest::new(ovly_dist::DEFAULT_MANIFEST_DIGESTS.to_vec());
        generator.generate(&ctx).unwrap();

        let manifest = ManifestFile::read(&dir).unwrap();
        assert_eq!(manifest.len(), 4);
        let dist = manifest.get(FileType::Dist, "seewave_2.0.tar.gz").unwrap();
        assert_eq!(dist.size, 7);
        let expected = digest_bytes(b"sources", &[DigestKind::Sha512]);
        assert_eq!(
            dist.hashes.get(DigestKind::Sha512),
            expected.get(&DigestKind::Sha512).cloned()
        );
        // The record's cache was filled, not a copy of it
        assert!(info.hashes.contains_all(generator.kinds()));
    }

    #[test]
    fn test_unchanged_entries_are_reused() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        fs::write(
            dir.join(MANIFEST_NAME),
            "EBUILD seewave-2.0.ebuild 7 SHA256 cached\n",
        )
        .unwrap();

        let generator = InternalManifest::new(vec![DigestKind::Sha256]);
        let manifest = generator.build(&ManifestContext::new(&dir, temp.path())).unwrap();
        let ebuild = manifest.get(FileType::Ebuild, "seewave-2.0.ebuild").unwrap();
        assert_eq!(ebuild.hashes.get(DigestKind::Sha256).as_deref(), Some("cached"));

        // A size change forces rehashing
        fs::write(dir.join("seewave-2.0.ebuild"), "EAPI=8\n# changed\n").unwrap();
        let manifest = generator.build(&ManifestContext::new(&dir, temp.path())).unwrap();
        let ebuild = manifest.get(FileType::Ebuild, "seewave-2.0.ebuild").unwrap();
        assert_ne!(ebuild.hashes.get(DigestKind::Sha256).as_deref(), Some("cached"));
    }

    #[test]
    fn test_old_dist_entries_kept_unless_removed() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        fs::write(
            dir.join(MANIFEST_NAME),
            "DIST old_0.9.tar.gz 3 SHA256 aa\nDIST gone_0.8.tar.gz 3 SHA256 bb\n",
        )
        .unwrap();

        let mut ctx = ManifestContext::new(&dir, temp.path());
        ctx.removed_distfiles.push("gone_0.8.tar.gz".to_string());
        let manifest = InternalManifest::new(vec![DigestKind::Sha256]).build(&ctx).unwrap();
        assert!(manifest.get(FileType::Dist, "old_0.9.tar.gz").is_some());
        assert!(manifest.get(FileType::Dist, "gone_0.8.tar.gz").is_none());
    }

    #[test]
    fn test_dist_hashes_seeded_from_existing_manifest() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        let src = temp.path().join("a_1.tar.gz");
        fs::write(&src, b"12345").unwrap();
        let sha256 = digest_bytes(b"12345", &[DigestKind::Sha256])[&DigestKind::Sha256].clone();
        fs::write(
            dir.join(MANIFEST_NAME),
            format!("DIST a_1.tar.gz 5 SHA256 {} SHA512 seeded\n", sha256),
        )
        .unwrap();

        let info = DistfileInfo::new("a_1.tar.gz", &src, None, "a_1.tar.gz");
        let mut ctx = ManifestContext::new(&dir, temp.path());
        ctx.distfiles.push(info.clone());

        let generator = InternalManifest::new(vec![DigestKind::Sha256, DigestKind::Sha512]);
        let manifest = generator.build(&ctx).unwrap();
        let dist = manifest.get(FileType::Dist, "a_1.tar.gz").unwrap();
        assert_eq!(dist.hashes.get(DigestKind::Sha512).as_deref(), Some("seeded"));
        assert!(dist.hashes.shares_storage_with(&info.hashes));
    }

    #[test]
    fn test_same_size_distfile_is_rehashed() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        let src = temp.path().join("a_1.tar.gz");
        let old = digest_bytes(b"12345", &[DigestKind::Sha256, DigestKind::Sha512]);
        fs::write(
            dir.join(MANIFEST_NAME),
            format!(
                "DIST a_1.tar.gz 5 SHA256 {} SHA512 {}\n",
                old[&DigestKind::Sha256],
                old[&DigestKind::Sha512]
            ),
        )
        .unwrap();
        fs::write(&src, b"54321").unwrap();

        let info = DistfileInfo::new("a_1.tar.gz", &src, None, "a_1.tar.gz");
        let mut ctx = ManifestContext::new(&dir, temp.path());
        ctx.distfiles.push(info);

        let generator = InternalManifest::new(vec![DigestKind::Sha256, DigestKind::Sha512]);
        let manifest = generator.build(&ctx).unwrap();
        let dist = manifest.get(FileType::Dist, "a_1.tar.gz").unwrap();
        let expected = digest_bytes(b"54321", &[DigestKind::Sha256, DigestKind::Sha512]);
        assert_eq!(dist.hashes.snapshot(), expected);
    }

    #[test]
    fn test_rewritten_file_of_same_size_is_rehashed() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        let ebuild = dir.join("seewave-2.0.ebuild");
        let generator = InternalManifest::new(vec![DigestKind::Sha256]);
        generator.generate(&ManifestContext::new(&dir, temp.path())).unwrap();

        fs::write(&ebuild, "EAPI=7\n").unwrap();
        let mut ctx = ManifestContext::new(&dir, temp.path());
        ctx.changed_files.push(ebuild.clone());
        generator.generate(&ctx).unwrap();

        let manifest = ManifestFile::read(&dir).unwrap();
        let entry = manifest.get(FileType::Ebuild, "seewave-2.0.ebuild").unwrap();
        let expected = digest_bytes(b"EAPI=7\n", &[DigestKind::Sha256]);
        assert_eq!(entry.hashes.snapshot(), expected);
    }

    #[test]
    fn test_file_newer_than_manifest_is_rehashed() {
        let temp = TempDir::new().unwrap();
        let dir = package_dir(&temp);
        let generator = InternalManifest::new(vec![DigestKind::Sha256]);
        generator.generate(&ManifestContext::new(&dir, temp.path())).unwrap();

        // Same size, edited behind the generator's back
        let xml = dir.join("metadata.xml");
        fs::write(&xml, "<pkgmetadata*>\n").unwrap();
        let manifest_mtime = fs::metadata(dir.join(MANIFEST_NAME)).unwrap().modified().unwrap();
        let later = filetime::FileTime::from_system_time(
            manifest_mtime + std::time::Duration::from_secs(10),
        );
        filetime::set_file_mtime(&xml, later).unwrap();

        let manifest = generator.build(&ManifestContext::new(&dir, temp.path())).unwrap();
        let entry = manifest.get(FileType::Misc, "metadata.xml").unwrap();
        let expected = digest_bytes(b"<pkgmetadata*>\n", &[DigestKind::Sha256]);
        assert_eq!(entry.hashes.snapshot(), expected);
    }
}
