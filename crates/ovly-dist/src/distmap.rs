//! # DistMap
//!
//! Registry mapping a distfile (path relative to the distroot) to the
//! repository it came from, its path inside that repository and its digest.
//!
//! Entries are either *persistent* (digest known, written to disk) or
//! *volatile* (staged by an in-memory package record, digest computed on
//! demand from the record's hash cache). Only persistent entries are saved.
//!
//! ## File format
//!
//! ```text
//! <|<1
//! a_1.0.tar.gz|cran|_|9f86d08188...
//! b/b_2.1.tar.gz|bioc|src/contrib/b_2.1.tar.gz|60303ae22b...
//! ```
//!
//! The header is `<DLM<FMT`. A `repo_file` equal to the distfile is written
//! as the `_` sentinel, an absent `repo_name` as the empty field. A backslash
//! escapes the delimiter, itself, a literal `_` field (`\_`) and a newline
//! (`\n`). The whole file may be bzip2 or gzip compressed; readers detect
//! this by magic bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use ovly_config::log_distmap_debug;

use crate::digest::{DigestKind, HashCache};
use crate::distroot::DistfileInfo;
use crate::owner::{OwnerHandle, RecordRef};
use crate::{DistError, Result};

/// Digest stored in the DistMap
pub const DISTMAP_DIGEST: DigestKind = DigestKind::Sha256;

/// Default field delimiter
pub const DEFAULT_DELIMITER: char = '|';

/// Format version tag written in the header
pub const FORMAT_VERSION: &str = "1";

/// Written instead of `repo_file` when it equals the distfile
pub const REPO_FILE_SENTINEL: &str = "_";

// ============================================================================
// Statistics
// ============================================================================

static FILES_ADDED: AtomicU64 = AtomicU64::new(0);
static FILES_REMOVED: AtomicU64 = AtomicU64::new(0);
static INTEGRITY_MISMATCHES: AtomicU64 = AtomicU64::new(0);

/// Process-wide DistMap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistMapStats {
    /// Persistent entries added or replaced
    pub files_added: u64,
    /// Persistent entries removed
    pub files_removed: u64,
    /// Integrity checks that found a digest mismatch
    pub integrity_mismatches: u64,
}

/// Snapshot of the process-wide counters
pub fn stats() -> DistMapStats {
    DistMapStats {
        files_added: FILES_ADDED.load(Ordering::Relaxed),
        files_removed: FILES_REMOVED.load(Ordering::Relaxed),
        integrity_mismatches: INTEGRITY_MISMATCHES.load(Ordering::Relaxed),
    }
}

// ============================================================================
// Compression
// ============================================================================

/// Whole-file compression of the DistMap file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Bzip2,
    Gzip,
}

impl FromStr for Compression {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "" => Ok(Compression::None),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(DistError::Config(format!(
                "unknown distmap compression '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Persistence state of an entry
#[derive(Debug, Clone)]
pub enum EntryState {
    Persistent {
        digest: String,
    },
    Volatile {
        record: RecordRef,
        /// The record's checksum cache (shared, not copied)
        hashes: HashCache,
        /// Source archive the digest is computed from
        src: PathBuf,
    },
}

/// Result of [`DistMap::check_integrity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Missing,
    Ok,
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct DistMapEntry {
    pub repo_name: Option<String>,
    pub repo_file: String,
    pub state: EntryState,
    /// Package directories currently claiming the physical file
    pub backrefs: BTreeSet<OwnerHandle>,
}

impl DistMapEntry {
    pub fn persistent(repo_name: Option<String>, repo_file: String, digest: String) -> Self {
        Self {
            repo_name,
            repo_file,
            state: EntryState::Persistent { digest },
            backrefs: BTreeSet::new(),
        }
    }

    pub fn volatile(
        repo_name: Option<String>,
        repo_file: String,
        record: RecordRef,
        hashes: HashCache,
        src: PathBuf,
    ) -> Self {
        Self {
            repo_name,
            repo_file,
            state: EntryState::Volatile {
                record,
                hashes,
                src,
            },
            backrefs: BTreeSet::new(),
        }
    }

    /// Entry for a file found in the distroot without any known origin
    pub fn dummy(distfile: &str, digest: String) -> Self {
        Self::persistent(None, distfile.to_string(), digest)
    }

    pub fn with_backref(mut self, owner: OwnerHandle) -> Self {
        self.backrefs.insert(owner);
        self
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.state, EntryState::Persistent { .. })
    }

    pub fn is_volatile(&self) -> bool {
        !self.is_persistent()
    }

    /// Stored digest (persistent entries only)
    pub fn digest(&self) -> Option<&str> {
        match &self.state {
            EntryState::Persistent { digest } => Some(digest),
            EntryState::Volatile { .. } => None,
        }
    }

    /// Stored digest, or the volatile record's digest computed on demand
    pub fn resolve_digest(&self) -> io::Result<String> {
        match &self.state {
            EntryState::Persistent { digest } => Ok(digest.clone()),
            EntryState::Volatile { hashes, src, .. } => {
                let mut values = hashes.get_or_compute(src, &[DISTMAP_DIGEST])?;
                values
                    .remove(&DISTMAP_DIGEST)
                    .ok_or_else(|| io::Error::other("digest missing after computation"))
            }
        }
    }

    pub fn has_backref_to(&self, owner: OwnerHandle) -> bool {
        self.backrefs.contains(&owner)
    }

    /// Compare everything except backrefs
    fn same_as(&self, other: &DistMapEntry) -> bool {
        if self.repo_name != other.repo_name || self.repo_file != other.repo_file {
            return false;
        }
        match (&self.state, &other.state) {
            (EntryState::Persistent { digest: a }, EntryState::Persistent { digest: b }) => a == b,
            (EntryState::Volatile { record: a, .. }, EntryState::Volatile { record: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }
}

// ============================================================================
// DistMap
// ============================================================================

type ReverseKey = (Option<String>, String);

/// The distfile registry
#[derive(Debug)]
pub struct DistMap {
    entries: BTreeMap<String, DistMapEntry>,
    /// `(repo_name, repo_file) -> distfile`, rebuilt lazily after mutations
    reverse: OnceCell<HashMap<ReverseKey, String>>,
    update_only: bool,
    dirty: bool,
    delimiter: char,
}

impl Default for DistMap {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DistMap {
    pub fn new(update_only: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            reverse: OnceCell::new(),
            update_only,
            dirty: false,
            delimiter: DEFAULT_DELIMITER,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the map changed since it was last read or written
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, distfile: &str) -> Option<&DistMapEntry> {
        self.entries.get(distfile)
    }

    pub fn contains(&self, distfile: &str) -> bool {
        self.entries.contains_key(distfile)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DistMapEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn invalidate(&mut self) {
        self.reverse.take();
        self.dirty = true;
    }

    /// Build the `(repo_name, repo_file) -> distfile` index.
    ///
    /// Revbumped distfiles share their origin with the earlier revisions;
    /// the highest revision wins, as it holds the origin's current content.
    pub fn make_reverse_index(&self) -> HashMap<ReverseKey, String> {
        let mut index: HashMap<ReverseKey, String> = HashMap::new();
        for (distfile, entry) in &self.entries {
            let key = (entry.repo_name.clone(), entry.repo_file.clone());
            match index.get(&key) {
                Some(current) if distfile_revision(current) >= distfile_revision(distfile) => {}
                _ => {
                    index.insert(key, distfile.clone());
                }
            }
        }
        index
    }

    /// Find the distfile fetched as `repo_file` from `repo_name`.
    /// Among revbumped siblings the highest revision is returned.
    pub fn lookup(&self, repo_name: Option<&str>, repo_file: &str) -> Option<(&str, &DistMapEntry)> {
        let index = self.reverse.get_or_init(|| self.make_reverse_index());
        let key = (repo_name.map(str::to_string), repo_file.to_string());
        let distfile = index.get(&key)?;
        self.entries
            .get_key_value(distfile)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Add or replace an entry. Returns true if the map changed.
    ///
    /// In update-only mode an equal entry is left alone; only its backrefs
    /// are merged. Backrefs of a replaced entry carry over.
    pub fn add_entry(&mut self, distfile: &str, mut entry: DistMapEntry) -> bool {
        if let Some(existing) = self.entries.get_mut(distfile) {
            if self.update_only && existing.same_as(&entry) {
                existing.backrefs.extend(entry.backrefs);
                return false;
            }
            entry.backrefs.extend(existing.backrefs.iter().copied());
        }

        if entry.is_persistent() {
            FILES_ADDED.fetch_add(1, Ordering::Relaxed);
        }
        self.entries.insert(distfile.to_string(), entry);
        self.invalidate();
        true
    }

    /// Add an entry for a file whose origin is unknown
    pub fn add_dummy_entry(&mut self, distfile: &str, digest: String) -> bool {
        self.add_entry(distfile, DistMapEntry::dummy(distfile, digest))
    }

    /// Stage a volatile entry for an in-memory record
    pub fn add_volatile(
        &mut self,
        distfile: &str,
        info: &DistfileInfo,
        record: RecordRef,
    ) -> bool {
        let owner = record.owner;
        let entry = DistMapEntry::volatile(
            info.repo_name.clone(),
            info.repo_file.clone(),
            record,
            info.hashes.clone(),
            info.src.clone(),
        )
        .with_backref(owner);
        self.add_entry(distfile, entry)
    }

    /// Convert a volatile entry into a persistent one, computing its digest.
    /// Persistent entries are left alone.
    pub fn make_persistent(&mut self, distfile: &str) -> Result<()> {
        let entry = self
            .entries
            .get(distfile)
            .ok_or_else(|| DistError::NotFound(distfile.to_string()))?;
        if entry.is_persistent() {
            return Ok(());
        }

        let digest = entry.resolve_digest()?;
        if let Some(entry) = self.entries.get_mut(distfile) {
            entry.state = EntryState::Persistent { digest };
        }
        FILES_ADDED.fetch_add(1, Ordering::Relaxed);
        self.invalidate();
        Ok(())
    }

    /// Persistent digest, or the volatile record's computed digest
    pub fn entry_digest(&self, distfile: &str) -> Result<String> {
        let entry = self
            .entries
            .get(distfile)
            .ok_or_else(|| DistError::NotFound(distfile.to_string()))?;
        Ok(entry.resolve_digest()?)
    }

    /// Compare a file's actual digest with the registered one
    pub fn check_integrity(&self, distfile: &str, actual_digest: &str) -> IntegrityStatus {
        let status = match self.entries.get(distfile) {
            None => IntegrityStatus::Missing,
            Some(entry) => match entry.resolve_digest() {
                Ok(digest) if digest == actual_digest => IntegrityStatus::Ok,
                _ => IntegrityStatus::Mismatch,
            },
        };
        if status == IntegrityStatus::Mismatch {
            INTEGRITY_MISMATCHES.fetch_add(1, Ordering::Relaxed);
        }
        status
    }

    /// Remove a persistent entry
    pub fn remove(&mut self, distfile: &str) -> Result<DistMapEntry> {
        match self.entries.get(distfile) {
            None => Err(DistError::NotFound(distfile.to_string())),
            Some(entry) if entry.is_volatile() => Err(DistError::NotPersistent(distfile.to_string())),
            Some(_) => Ok(self.take(distfile)),
        }
    }

    /// Remove a persistent entry if there is one
    pub fn try_remove(&mut self, distfile: &str) -> Option<DistMapEntry> {
        self.remove(distfile).ok()
    }

    /// Remove an entry regardless of its state
    pub fn delete(&mut self, distfile: &str) -> Result<DistMapEntry> {
        if !self.entries.contains_key(distfile) {
            return Err(DistError::NotFound(distfile.to_string()));
        }
        Ok(self.take(distfile))
    }

    /// Remove an entry regardless of its state, if present
    pub fn try_delete(&mut self, distfile: &str) -> Option<DistMapEntry> {
        self.delete(distfile).ok()
    }

    fn take(&mut self, distfile: &str) -> DistMapEntry {
        let entry = self
            .entries
            .remove(distfile)
            .unwrap_or_else(|| unreachable!("caller checked presence of {}", distfile));
        if entry.is_persistent() {
            FILES_REMOVED.fetch_add(1, Ordering::Relaxed);
        }
        self.invalidate();
        entry
    }

    /// Whether adding `info` needs a revision bump.
    ///
    /// True only when the same distfile from the same repository and origin
    /// is already registered with a different digest. A different origin
    /// never triggers a revbump: packages mirrored by several repositories
    /// would otherwise bump each other forever.
    pub fn check_revbump_necessary(&self, info: &DistfileInfo) -> io::Result<bool> {
        let entry = match self.entries.get(&info.distfile) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if entry.repo_name != info.repo_name || entry.repo_file != info.repo_file {
            return Ok(false);
        }
        if let EntryState::Volatile { hashes, .. } = &entry.state {
            if hashes.shares_storage_with(&info.hashes) {
                return Ok(false);
            }
        }
        Ok(entry.resolve_digest()? != info.digest()?)
    }

    pub fn add_backref(&mut self, distfile: &str, owner: OwnerHandle) -> bool {
        match self.entries.get_mut(distfile) {
            Some(entry) => entry.backrefs.insert(owner),
            None => false,
        }
    }

    /// Drop one backref. Returns the number of backrefs left, if the entry exists.
    pub fn drop_backref(&mut self, distfile: &str, owner: OwnerHandle) -> Option<usize> {
        self.entries.get_mut(distfile).map(|entry| {
            entry.backrefs.remove(&owner);
            entry.backrefs.len()
        })
    }

    pub fn has_backref_to(&self, distfile: &str, owner: OwnerHandle) -> bool {
        self.entries
            .get(distfile)
            .is_some_and(|entry| entry.has_backref_to(owner))
    }

    /// Remove `owner` from every entry's backrefs
    pub fn drop_owner(&mut self, owner: OwnerHandle) {
        for entry in self.entries.values_mut() {
            entry.backrefs.remove(&owner);
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Read a DistMap file. A missing file yields an empty map if tolerated.
    pub fn read_file(path: &Path, allow_missing: bool, update_only: bool) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if allow_missing && e.kind() == io::ErrorKind::NotFound => {
                log_distmap_debug!("distmap file missing, starting empty", path = path.display().to_string());
                return Ok(Self::new(update_only));
            }
            Err(e) => return Err(e.into()),
        };

        let mut map = Self::new(update_only);
        map.read_from(file)?;
        map.dirty = false;
        log_distmap_debug!("distmap loaded", path = path.display().to_string(), entries = map.len());
        Ok(map)
    }

    /// Merge entries from a (possibly compressed) reader
    pub fn read_from<R: Read>(&mut self, reader: R) -> Result<usize> {
        let mut buffered = BufReader::new(reader);
        let magic = buffered.fill_buf()?.to_vec();

        let reader: Box<dyn BufRead> = if magic.starts_with(b"BZh") {
            Box::new(BufReader::new(bzip2::read::BzDecoder::new(buffered)))
        } else if magic.starts_with(&[0x1f, 0x8b]) {
            Box::new(BufReader::new(flate2::read::GzDecoder::new(buffered)))
        } else {
            Box::new(buffered)
        };

        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => return Ok(0),
        };
        let delimiter = parse_header(&header)?;

        let mut count = 0;
        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (distfile, entry) = parse_line(&line, delimiter).map_err(|reason| {
                DistError::Format {
                    line: idx + 2,
                    reason,
                }
            })?;
            self.add_entry(&distfile, entry);
            count += 1;
        }
        self.delimiter = delimiter;
        Ok(count)
    }

    /// Write every persistent entry, uncompressed
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        let dlm = self.delimiter;
        writeln!(writer, "<{}<{}", dlm, FORMAT_VERSION)?;

        let mut count = 0;
        for (distfile, entry) in &self.entries {
            let digest = match entry.digest() {
                Some(digest) => digest,
                None => continue,
            };
            let repo_file = if entry.repo_file == *distfile {
                REPO_FILE_SENTINEL.to_string()
            } else {
                escape_field(&entry.repo_file, dlm)
            };
            writeln!(
                writer,
                "{}{dlm}{}{dlm}{repo_file}{dlm}{}",
                escape_field(distfile, dlm),
                escape_field(entry.repo_name.as_deref().unwrap_or(""), dlm),
                escape_field(digest, dlm),
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Write the map to `path` atomically (temp file + fsync + rename)
    pub fn write_file(&mut self, path: &Path, compression: Compression) -> Result<usize> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(path);

        let file = File::create(&tmp_path)?;
        let count = match compression {
            Compression::None => {
                let mut writer = BufWriter::new(file);
                let count = self.write_to(&mut writer)?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                count
            }
            Compression::Bzip2 => {
                let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::best());
                let count = self.write_to(&mut encoder)?;
                encoder.finish()?.sync_all()?;
                count
            }
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(file, flate2::Compression::default());
                let count = self.write_to(&mut encoder)?;
                encoder.finish()?.sync_all()?;
                count
            }
        };

        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.dirty = false;
        log_distmap_debug!("distmap written", path = path.display().to_string(), entries = count);
        Ok(count)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "distmap".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn parse_header(header: &str) -> Result<char> {
    let mut chars = header.chars();
    let bad = |reason: &str| DistError::Format {
        line: 1,
        reason: reason.to_string(),
    };

    if chars.next() != Some('<') {
        return Err(bad("missing header"));
    }
    let delimiter = chars.next().ok_or_else(|| bad("missing delimiter"))?;
    if chars.next() != Some('<') {
        return Err(bad("malformed header"));
    }
    let format: String = chars.collect();
    if format != FORMAT_VERSION {
        return Err(bad(&format!("unsupported format '{}'", format)));
    }
    Ok(delimiter)
}

/// Revision a distfile name carries (`a_1.0-r2.tar.gz` -> 2), 0 if none
fn distfile_revision(distfile: &str) -> u32 {
    let name = distfile.rsplit('/').next().unwrap_or(distfile);
    name.match_indices("-r")
        .filter_map(|(idx, _)| {
            let rest = &name[idx + 2..];
            let end = rest.find('.').unwrap_or(rest.len());
            rest[..end].parse::<u32>().ok()
        })
        .last()
        .unwrap_or(0)
}

fn escape_field(field: &str, delimiter: char) -> String {
    if field == REPO_FILE_SENTINEL {
        return format!("\\{}", field);
    }
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Split at unescaped delimiters, keeping escapes in place
fn split_escaped(line: &str, delimiter: char) -> std::result::Result<Vec<&str>, String> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == '\\' {
            if chars.next().is_none() {
                return Err("dangling escape".to_string());
            }
        } else if c == delimiter {
            fields.push(&line[start..idx]);
            start = idx + c.len_utf8();
        }
    }
    fields.push(&line[start..]);
    Ok(fields)
}

fn unescape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(next) => out.push(next),
            None => {}
        }
    }
    out
}

fn parse_line(line: &str, delimiter: char) -> std::result::Result<(String, DistMapEntry), String> {
    let fields = split_escaped(line, delimiter)?;
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, got {}", fields.len()));
    }
    let distfile = unescape_field(fields[0]);
    let repo_name = unescape_field(fields[1]);
    let digest = unescape_field(fields[3]);
    if distfile.is_empty() || digest.is_empty() {
        return Err("empty distfile or digest".to_string());
    }

    let repo_name = (!repo_name.is_empty()).then_some(repo_name);
    let repo_file = if fields[2] == REPO_FILE_SENTINEL {
        distfile.clone()
    } else {
        unescape_field(fields[2])
    };
    Ok((distfile, DistMapEntry::persistent(repo_name, repo_file, digest)))
}
