//! File digests and the shared per-file hash cache.
//!
//! Every requested hash is fed from a single read of the file, so asking for
//! `SHA256 + SHA512 + WHIRLPOOL` costs one pass over the data.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use sha2::Digest;

use crate::DistError;

/// Read buffer for hashing
const CHUNK_SIZE: usize = 64 * 1024;

/// Hash algorithms understood by manifests and the DistMap.
///
/// Variant order is the alphabetical order of the manifest names, which is
/// the order hashes appear on a manifest line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestKind {
    Blake2b,
    Sha256,
    Sha512,
    Whirlpool,
}

/// Hash set written to manifests unless configured otherwise
pub const DEFAULT_MANIFEST_DIGESTS: [DigestKind; 3] =
    [DigestKind::Sha256, DigestKind::Sha512, DigestKind::Whirlpool];

impl DigestKind {
    /// Name as written in manifest files
    pub fn manifest_name(self) -> &'static str {
        match self {
            DigestKind::Blake2b => "BLAKE2B",
            DigestKind::Sha256 => "SHA256",
            DigestKind::Sha512 => "SHA512",
            DigestKind::Whirlpool => "WHIRLPOOL",
        }
    }

    /// Parse a list of names, e.g. from configuration
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<DigestKind>, DistError> {
        let mut kinds = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<DigestKind>, _>>()?;
        kinds.sort();
        kinds.dedup();
        Ok(kinds)
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manifest_name())
    }
}

impl FromStr for DigestKind {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake2b" => Ok(DigestKind::Blake2b),
            "sha256" => Ok(DigestKind::Sha256),
            "sha512" => Ok(DigestKind::Sha512),
            "whirlpool" => Ok(DigestKind::Whirlpool),
            _ => Err(DistError::UnknownDigest(s.to_string())),
        }
    }
}

enum Hasher {
    Blake2b(blake2::Blake2b512),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Whirlpool(whirlpool::Whirlpool),
}

impl Hasher {
    fn new(kind: DigestKind) -> Self {
        match kind {
            DigestKind::Blake2b => Hasher::Blake2b(blake2::Blake2b512::new()),
            DigestKind::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestKind::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            DigestKind::Whirlpool => Hasher::Whirlpool(whirlpool::Whirlpool::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Blake2b(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Whirlpool(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Blake2b(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::Whirlpool(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash a byte slice with every requested algorithm.
pub fn digest_bytes(data: &[u8], kinds: &[DigestKind]) -> BTreeMap<DigestKind, String> {
    kinds
        .iter()
        .map(|&kind| {
            let mut hasher = Hasher::new(kind);
            hasher.update(data);
            (kind, hasher.finalize_hex())
        })
        .collect()
}

/// Hash a file with every requested algorithm in one read pass.
///
/// Symlinks are followed.
pub fn digest_file(path: &Path, kinds: &[DigestKind]) -> io::Result<BTreeMap<DigestKind, String>> {
    let mut hashers: Vec<(DigestKind, Hasher)> =
        kinds.iter().map(|&k| (k, Hasher::new(k))).collect();

    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buf[..n]);
        }
    }

    Ok(hashers
        .into_iter()
        .map(|(kind, hasher)| (kind, hasher.finalize_hex()))
        .collect())
}

/// Checksum cache bound to one file.
///
/// Clones share storage: a digest computed through any clone is visible to
/// all of them and is never computed again.
#[derive(Debug, Clone, Default)]
pub struct HashCache {
    inner: Arc<Mutex<BTreeMap<DigestKind, String>>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-filled with known values
    pub fn with_values(values: BTreeMap<DigestKind, String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(values)),
        }
    }

    pub fn get(&self, kind: DigestKind) -> Option<String> {
        self.inner.lock().unwrap().get(&kind).cloned()
    }

    pub fn insert(&self, kind: DigestKind, value: String) {
        self.inner.lock().unwrap().insert(kind, value);
    }

    /// Fill in values that are not cached yet; cached values win.
    pub fn seed(&self, values: &BTreeMap<DigestKind, String>) {
        let mut inner = self.inner.lock().unwrap();
        for (kind, value) in values {
            inner.entry(*kind).or_insert_with(|| value.clone());
        }
    }

    pub fn contains_all(&self, kinds: &[DigestKind]) -> bool {
        let inner = self.inner.lock().unwrap();
        kinds.iter().all(|k| inner.contains_key(k))
    }

    /// Copy of every cached value
    pub fn snapshot(&self) -> BTreeMap<DigestKind, String> {
        self.inner.lock().unwrap().clone()
    }

    /// Drop every cached value (the underlying file changed)
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Return the requested digests of `path`, computing only missing ones.
    ///
    /// The lock is held while hashing so concurrent callers never hash the
    /// same file twice.
    pub fn get_or_compute(
        &self,
        path: &Path,
        kinds: &[DigestKind],
    ) -> io::Result<BTreeMap<DigestKind, String>> {
        let mut inner = self.inner.lock().unwrap();
        let missing: Vec<DigestKind> = kinds
            .iter()
            .copied()
            .filter(|k| !inner.contains_key(k))
            .collect();

        if !missing.is_empty() {
            inner.extend(digest_file(path, &missing)?);
        }

        Ok(kinds
            .iter()
            .filter_map(|k| inner.get(k).map(|v| (*k, v.clone())))
            .collect())
    }

    /// Whether two caches share storage
    pub fn shares_storage_with(&self, other: &HashCache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
