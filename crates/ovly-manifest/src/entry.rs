//! Manifest entries

use std::fmt;
use std::str::FromStr;

use ovly_dist::{DigestKind, HashCache};

use crate::{ManifestError, Result};

/// Entry type. Declaration order is the order entries are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    Aux,
    Dist,
    Ebuild,
    Misc,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Aux => "AUX",
            FileType::Dist => "DIST",
            FileType::Ebuild => "EBUILD",
            FileType::Misc => "MISC",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AUX" => Ok(FileType::Aux),
            "DIST" => Ok(FileType::Dist),
            "EBUILD" => Ok(FileType::Ebuild),
            "MISC" => Ok(FileType::Misc),
            other => Err(format!("unknown file type '{}'", other)),
        }
    }
}

/// One manifest line
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub filetype: FileType,
    pub filename: String,
    pub size: u64,
    /// For DIST entries this is the package record's own cache
    pub hashes: HashCache,
}

impl ManifestEntry {
    pub fn new(filetype: FileType, filename: &str, size: u64, hashes: HashCache) -> Self {
        Self {
            filetype,
            filename: filename.to_string(),
            size,
            hashes,
        }
    }

    /// Render the entry with the given hash kinds (those not cached are left out)
    pub fn to_line(&self, kinds: &[DigestKind]) -> String {
        let values = self.hashes.snapshot();
        let mut line = format!("{} {} {}", self.filetype, self.filename, self.size);
        for (kind, value) in &values {
            if kinds.contains(kind) {
                line.push(' ');
                line.push_str(kind.manifest_name());
                line.push(' ');
                line.push_str(value);
            }
        }
        line
    }

    /// Parse one manifest line. Unknown hash names are skipped.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        let err = |reason: String| ManifestError::Parse {
            line: line_no,
            reason,
        };

        let mut fields = line.split_whitespace();
        let filetype: FileType = fields
            .next()
            .ok_or_else(|| err("empty line".into()))?
            .parse()
            .map_err(err)?;
        let filename = fields.next().ok_or_else(|| err("missing file name".into()))?;
        let size = fields
            .next()
            .ok_or_else(|| err("missing file size".into()))?
            .parse::<u64>()
            .map_err(|e| err(format!("bad file size: {}", e)))?;

        let hashes = HashCache::new();
        loop {
            let name = match fields.next() {
                Some(name) => name,
                None => break,
            };
            let value = fields
                .next()
                .ok_or_else(|| err(format!("hash {} has no value", name)))?;
            if let Ok(kind) = name.parse::<DigestKind>() {
                hashes.insert(kind, value.to_string());
            }
        }

        Ok(Self::new(filetype, filename, size, hashes))
    }
}
