//! Manifest generation through the `ebuild` tool
//!
//! The tool runs with a rebuilt environment: fetching is disabled and
//! `DISTDIR` points at a private directory of symlinks to the record's
//! distfiles. Invocations are serialized process-wide.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use ovly_config::{log_manifest_debug, log_manifest_error};
use ovly_dist::DigestKind;

use crate::generator::{ManifestContext, ManifestGenerator};
use crate::{ManifestError, Result};

/// Held while the tool runs
static EBUILD_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const DEFAULT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone)]
pub struct ExternalManifest {
    ebuild_prog: PathBuf,
    kinds: Vec<DigestKind>,
}

impl ExternalManifest {
    pub fn new(ebuild_prog: &Path, kinds: Vec<DigestKind>) -> Self {
        Self {
            ebuild_prog: ebuild_prog.to_path_buf(),
            kinds,
        }
    }

    fn command(&self, ebuild: &Path, overlay_dir: &Path, distdir: &Path) -> Command {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let hashes = self
            .kinds
            .iter()
            .map(|k| k.manifest_name())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.ebuild_prog);
        cmd.arg(ebuild)
            .arg("manifest")
            .env_clear()
            .env("PATH", path)
            .env("PORTDIR_OVERLAY", overlay_dir)
            .env("DISTDIR", distdir)
            .env("PORTAGE_RO_DISTDIRS", "")
            .env("FETCHCOMMAND", "/bin/false")
            .env("RESUMECOMMAND", "/bin/false")
            .env("FEATURES", "-distlocks -fetch")
            .env("MANIFEST_HASHES", hashes);
        cmd
    }
}

impl ManifestGenerator for ExternalManifest {
    fn name(&self) -> &'static str {
        "external"
    }

    fn thread_safe(&self) -> bool {
        false
    }

    fn generate(&self, ctx: &ManifestContext) -> Result<()> {
        // One run covers the whole directory
        let ebuild = match ctx.ebuild_files.first() {
            Some(ebuild) => ebuild,
            None => return Ok(()),
        };

        let distdir = tempfile::Builder::new().prefix("ovly-distdir-").tempdir()?;
        for info in &ctx.distfiles {
            let name = info.distfile.rsplit('/').next().unwrap_or(&info.distfile);
            link_into(&info.src, &distdir.path().join(name))?;
        }

        let _guard = EBUILD_LOCK.lock().unwrap();
        log_manifest_debug!(
            "Running manifest tool",
            ebuild = ebuild.display().to_string()
        );
        let output = self
            .command(ebuild, &ctx.overlay_dir, distdir.path())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_manifest_error!(
                "Manifest tool failed",
                ebuild = ebuild.display().to_string(),
                status = output.status.to_string(),
                stderr = stderr.as_str()
            );
            return Err(ManifestError::Subprocess {
                status: output.status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn link_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(not(unix))]
fn link_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dest).map(|_| ())
}
