//! Distfile link strategy
//!
//! A [`Strategy`] is an ordered list of [`LinkMethod`]s. The distroot tries
//! them in order; a method failing with an "operation not supported" errno is
//! switched off in a [`SupportMask`] for the rest of the process and the next
//! method is tried.
//!
//! # Usage
//!
//! ```ignore
//! use ovly_dist::link_strategy::{FsLinker, LinkMethod, Linker};
//!
//! FsLinker.link(LinkMethod::Hardlink, source, target)?;
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::{DistError, Result};

// ============================================================================
// LinkMethod
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMethod {
    Symlink,
    Hardlink,
    Copy,
    /// Symlink into a throwaway distroot, copying if that fails
    TmpDir,
}

impl LinkMethod {
    pub fn name(self) -> &'static str {
        match self {
            LinkMethod::Symlink => "symlink",
            LinkMethod::Hardlink => "hardlink",
            LinkMethod::Copy => "copy",
            LinkMethod::TmpDir => "tmpdir",
        }
    }

    fn bit(self) -> u8 {
        match self {
            LinkMethod::Symlink => 1,
            LinkMethod::Hardlink => 1 << 1,
            LinkMethod::Copy => 1 << 2,
            LinkMethod::TmpDir => 1 << 3,
        }
    }
}

impl fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LinkMethod {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "symlink" => Ok(LinkMethod::Symlink),
            "hardlink" => Ok(LinkMethod::Hardlink),
            "copy" => Ok(LinkMethod::Copy),
            "tmpdir" => Ok(LinkMethod::TmpDir),
            other => Err(DistError::Config(format!(
                "unknown distfiles strategy '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Validated, ordered list of link methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    methods: Vec<LinkMethod>,
}

impl Strategy {
    pub fn new(methods: Vec<LinkMethod>) -> Result<Self> {
        if methods.is_empty() {
            return Err(DistError::Config("distfiles strategy is empty".into()));
        }
        if methods.len() > 1 && methods.contains(&LinkMethod::TmpDir) {
            return Err(DistError::Config(
                "'tmpdir' strategy cannot be combined with fallbacks".into(),
            ));
        }
        let mut seen = 0u8;
        for method in &methods {
            if seen & method.bit() != 0 {
                return Err(DistError::Config(format!(
                    "strategy '{}' listed twice",
                    method
                )));
            }
            seen |= method.bit();
        }
        Ok(Self { methods })
    }

    /// Parse configuration names, e.g. `["hardlink", "symlink", "copy"]`
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let methods = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Self::new(methods)
    }

    pub fn methods(&self) -> &[LinkMethod] {
        &self.methods
    }

    pub fn is_tmpdir(&self) -> bool {
        self.methods == [LinkMethod::TmpDir]
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            methods: vec![LinkMethod::Hardlink, LinkMethod::Symlink, LinkMethod::Copy],
        }
    }
}

// ============================================================================
// Linker
// ============================================================================

/// Performs one link attempt. The destination does not exist on entry.
pub trait Linker: Send + Sync {
    fn link(&self, method: LinkMethod, source: &Path, target: &Path) -> io::Result<()>;

    /// Name of this linker (for logging/debugging)
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Linker backed by the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLinker;

impl Linker for FsLinker {
    fn link(&self, method: LinkMethod, source: &Path, target: &Path) -> io::Result<()> {
        match method {
            LinkMethod::Symlink => symlink(source, target),
            LinkMethod::Hardlink => fs::hard_link(source, target),
            LinkMethod::Copy => fs::copy(source, target).map(|_| ()),
            LinkMethod::TmpDir => match symlink(source, target) {
                Ok(()) => Ok(()),
                Err(_) => fs::copy(source, target).map(|_| ()),
            },
        }
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

#[cfg(unix)]
fn symlink(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn symlink(_source: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Whether `err` means "this method cannot work here" rather than a real failure
pub fn is_unsupported(method: LinkMethod, err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    match err.raw_os_error() {
        Some(code) => {
            code == libc::EPERM
                || code == libc::EXDEV
                || code == libc::EOPNOTSUPP
                || code == libc::ENOTSUP
                || code == libc::ENOSYS
                || code == libc::EMLINK
                || (method == LinkMethod::Hardlink && code == libc::EACCES)
        }
        None => false,
    }
}

// ============================================================================
// SupportMask
// ============================================================================

/// Methods still believed to work. Updated with relaxed atomics: two threads
/// may both disable the same method, which only duplicates a warning.
#[derive(Debug)]
pub struct SupportMask(AtomicU8);

impl Default for SupportMask {
    fn default() -> Self {
        Self(AtomicU8::new(u8::MAX))
    }
}

impl SupportMask {
    pub fn is_enabled(&self, method: LinkMethod) -> bool {
        self.0.load(Ordering::Relaxed) & method.bit() != 0
    }

    /// Returns true if this call switched the method off
    pub fn disable(&self, method: LinkMethod) -> bool {
        let prev = self.0.fetch_and(!method.bit(), Ordering::Relaxed);
        prev & method.bit() != 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_strategy_validation() {
        assert!(Strategy::parse(&["hardlink", "symlink", "copy"]).is_ok());
        assert!(Strategy::parse(&["tmpdir"]).unwrap().is_tmpdir());
        assert!(matches!(
            Strategy::parse(&["tmpdir", "copy"]),
            Err(DistError::Config(_))
        ));
        assert!(Strategy::parse::<&str>(&[]).is_err());
        assert!(Strategy::parse(&["copy", "copy"]).is_err());
        assert!(Strategy::parse(&["reflink"]).is_err());
    }

    #[test]
    fn test_fs_linker_methods() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.tgz");
        fs::write(&source, b"archive").unwrap();

        for method in [LinkMethod::Symlink, LinkMethod::Hardlink, LinkMethod::Copy, LinkMethod::TmpDir] {
            let target = dir.path().join(format!("target-{}", method));
            FsLinker.link(method, &source, &target).unwrap();
            assert_eq!(fs::read(&target).unwrap(), b"archive");
        }

        let link = dir.path().join("target-symlink");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_unsupported_errnos() {
        let eperm = io::Error::from_raw_os_error(libc::EPERM);
        let exdev = io::Error::from_raw_os_error(libc::EXDEV);
        let eacces = io::Error::from_raw_os_error(libc::EACCES);
        let enoent = io::Error::from_raw_os_error(libc::ENOENT);

        assert!(is_unsupported(LinkMethod::Symlink, &eperm));
        assert!(is_unsupported(LinkMethod::Hardlink, &exdev));
        assert!(is_unsupported(LinkMethod::Hardlink, &eacces));
        assert!(!is_unsupported(LinkMethod::Copy, &eacces));
        assert!(!is_unsupported(LinkMethod::Symlink, &enoent));
    }

    #[test]
    fn test_support_mask() {
        let mask = SupportMask::default();
        assert!(mask.is_enabled(LinkMethod::Symlink));
        assert!(mask.disable(LinkMethod::Symlink));
        assert!(!mask.disable(LinkMethod::Symlink));
        assert!(!mask.is_enabled(LinkMethod::Symlink));
        assert!(mask.is_enabled(LinkMethod::Hardlink));
    }
}
