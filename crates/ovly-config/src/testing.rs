//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated overlay root
//! - A distroot and its DistMap file
//! - Source archives staged outside the distroot
//!
//! # Usage
//!
//! ```ignore
//! use ovly_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let src = env.source_file("pkg_1.0.tar.gz", b"archive bytes")?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Overlay root
    pub overlay_dir: PathBuf,
    /// Distroot directory
    pub distroot: PathBuf,
    /// Fetched source archives live here
    pub sources: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let overlay_dir = root.join("overlay");
        let distroot = root.join("distfiles");
        let sources = root.join("sources");

        std::fs::create_dir_all(&overlay_dir)?;
        std::fs::create_dir_all(&distroot)?;
        std::fs::create_dir_all(&sources)?;

        Ok(Self {
            _temp_dir: temp_dir,
            overlay_dir,
            distroot,
            sources,
            test_id,
        })
    }

    /// DistMap file path (outside the distroot so integrity walks skip it)
    pub fn distmap_path(&self) -> PathBuf {
        self.root().join("distmap.bz2")
    }

    /// Root of the temporary tree
    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Write a source archive and return its path
    pub fn source_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.sources.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// A config pointing every path into this environment
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.overlay.name = format!("test_overlay_{}", self.test_id);
        config.overlay.dir = self.overlay_dir.clone();
        config.distfiles.root = self.distroot.clone();
        config.distmap.file = self.distmap_path();
        config.write.jobs = 2;
        config
    }
}
