//! Manifest file reading and writing

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ovly_dist::DigestKind;

use crate::entry::{FileType, ManifestEntry};
use crate::Result;

pub const MANIFEST_NAME: &str = "Manifest";

/// The manifest of one package directory
#[derive(Debug, Clone)]
pub struct ManifestFile {
    root: PathBuf,
    entries: BTreeMap<(FileType, String), ManifestEntry>,
}

impl ManifestFile {
    pub fn new(package_dir: &Path) -> Self {
        Self {
            root: package_dir.to_path_buf(),
            entries: BTreeMap::new(),
        }
    }

    /// Read `<package_dir>/Manifest`; a missing file yields an empty manifest
    pub fn read(package_dir: &Path) -> Result<Self> {
        let mut manifest = Self::new(package_dir);
        let text = match fs::read_to_string(manifest.path()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(manifest),
            Err(e) => return Err(e.into()),
        };
        manifest.parse(&text)?;
        Ok(manifest)
    }

    /// Add entries from manifest text
    pub fn parse(&mut self, text: &str) -> Result<()> {
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            self.insert(ManifestEntry::parse_line(line, idx + 1)?);
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(MANIFEST_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert or replace the entry for `(filetype, filename)`
    pub fn insert(&mut self, entry: ManifestEntry) -> Option<ManifestEntry> {
        self.entries
            .insert((entry.filetype, entry.filename.clone()), entry)
    }

    pub fn get(&self, filetype: FileType, filename: &str) -> Option<&ManifestEntry> {
        self.entries.get(&(filetype, filename.to_string()))
    }

    pub fn remove(&mut self, filetype: FileType, filename: &str) -> Option<ManifestEntry> {
        self.entries.remove(&(filetype, filename.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted manifest text
    pub fn render(&self, kinds: &[DigestKind]) -> String {
        let mut out = String::new();
        for entry in self.entries.values() {
            out.push_str(&entry.to_line(kinds));
            out.push('\n');
        }
        out
    }

    /// Write the manifest atomically. An empty manifest removes the file.
    pub fn write(&self, kinds: &[DigestKind]) -> Result<()> {
        let path = self.path();
        if self.entries.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(self.render(kinds).as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}
