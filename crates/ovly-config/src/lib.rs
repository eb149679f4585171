//! # ovly-config
//!
//! Configuration management for the ovly overlay builder.
//!
//! Loads configuration from:
//! 1. `~/.config/ovly/config.toml` (global)
//! 2. `.ovly/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Library crates never read the global instance themselves; they take the
//! relevant section by value so tests stay isolated.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Linking strategy names accepted in `[distfiles] strategy`
pub const KNOWN_STRATEGIES: &[&str] = &["symlink", "hardlink", "copy", "tmpdir"];

/// Manifest implementations accepted in `[manifest] implementation`
pub const KNOWN_MANIFEST_IMPLS: &[&str] = &["internal", "external", "none"];

/// Hash names accepted in `[manifest] hashes`
pub const KNOWN_HASHES: &[&str] = &["sha256", "sha512", "whirlpool", "blake2b"];

/// Distroot layouts accepted in `[distfiles] layout`
pub const KNOWN_LAYOUTS: &[&str] = &["flat", "per-package"];

/// DistMap compression formats
pub const KNOWN_COMPRESSIONS: &[&str] = &["none", "bzip2", "gzip"];

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> =
    Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    new_config.validate()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub overlay: OverlayConfig,
    pub distfiles: DistfilesConfig,
    pub distmap: DistMapConfig,
    pub manifest: ManifestConfig,
    pub write: WriteConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new(".ovly/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without merging or env overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.config/ovly/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ovly/config.toml"))
    }

    /// Merge a project config over this one.
    ///
    /// Sections are replaced wholesale when the project sets a value that
    /// differs from the default.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.overlay != defaults.overlay {
            self.overlay = other.overlay;
        }
        if other.distfiles != defaults.distfiles {
            self.distfiles = other.distfiles;
        }
        if other.distmap != defaults.distmap {
            self.distmap = other.distmap;
        }
        if other.manifest != defaults.manifest {
            self.manifest = other.manifest;
        }
        if other.write != defaults.write {
            self.write = other.write;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("OVLY_OVERLAY_DIR") {
            self.overlay.dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("OVLY_DISTROOT") {
            self.distfiles.root = PathBuf::from(path);
        }
        if let Ok(jobs) = std::env::var("OVLY_JOBS") {
            if let Ok(n) = jobs.parse() {
                self.write.jobs = n;
            }
        }
    }

    /// Startup checks. Every failure here is fatal and never retried.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overlay.name.trim().is_empty() {
            return Err(ConfigError::Invalid("overlay name must not be empty".into()));
        }

        if !KNOWN_LAYOUTS.contains(&self.distfiles.layout.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown distroot layout '{}'",
                self.distfiles.layout
            )));
        }

        let strategy = &self.distfiles.strategy;
        if strategy.is_empty() {
            return Err(ConfigError::Invalid("distfiles strategy is empty".into()));
        }
        for name in strategy {
            if !KNOWN_STRATEGIES.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown distfiles strategy '{}'",
                    name
                )));
            }
        }
        if strategy.len() > 1 && strategy.iter().any(|s| s == "tmpdir") {
            return Err(ConfigError::Invalid(
                "'tmpdir' strategy cannot be combined with fallbacks".into(),
            ));
        }

        if !KNOWN_MANIFEST_IMPLS.contains(&self.manifest.implementation.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unsupported manifest implementation '{}'",
                self.manifest.implementation
            )));
        }
        if self.manifest.hashes.is_empty() {
            return Err(ConfigError::Invalid("manifest hash list is empty".into()));
        }
        for hash in &self.manifest.hashes {
            if !KNOWN_HASHES.contains(&hash.to_ascii_lowercase().as_str()) {
                return Err(ConfigError::Invalid(format!("unknown hash '{}'", hash)));
            }
        }

        if !KNOWN_COMPRESSIONS.contains(&self.distmap.compression.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown distmap compression '{}'",
                self.distmap.compression
            )));
        }

        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Overlay (repository) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Repository name written to `profiles/repo_name`
    pub name: String,
    /// Overlay root directory
    pub dir: PathBuf,
    /// Directories whose `*.eclass` files are imported into the overlay
    pub eclass_dirs: Vec<PathBuf>,
    /// Masters listed in `metadata/layout.conf`
    pub masters: Vec<String>,
    /// Keep only the n latest ebuilds per package (0 = keep all)
    pub keep_nth_latest: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            name: "R_Overlay".to_string(),
            dir: PathBuf::from("~/overlay"),
            eclass_dirs: Vec::new(),
            masters: vec!["gentoo".to_string()],
            keep_nth_latest: 0,
        }
    }
}

/// Distfile materialization configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistfilesConfig {
    /// Distroot directory
    pub root: PathBuf,
    /// `flat` or `per-package`
    pub layout: String,
    /// Ordered linking strategy
    pub strategy: Vec<String>,
    /// Verify the distroot against the DistMap when opening it
    pub verify: bool,
}

impl Default for DistfilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/overlay-distfiles"),
            layout: "flat".to_string(),
            strategy: vec![
                "hardlink".to_string(),
                "symlink".to_string(),
                "copy".to_string(),
            ],
            verify: false,
        }
    }
}

/// DistMap persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistMapConfig {
    pub file: PathBuf,
    pub compression: String,
    /// Replace existing entries only when they differ
    pub update_only: bool,
}

impl Default for DistMapConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("~/overlay-distfiles/.distmap"),
            compression: "bzip2".to_string(),
            update_only: true,
        }
    }
}

/// Manifest generation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// `internal`, `external` or `none`
    pub implementation: String,
    pub hashes: Vec<String>,
    /// Build tool used by the external implementation
    pub ebuild_prog: PathBuf,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            implementation: "internal".to_string(),
            hashes: vec![
                "sha256".to_string(),
                "sha512".to_string(),
                "whirlpool".to_string(),
            ],
            ebuild_prog: PathBuf::from("/usr/bin/ebuild"),
        }
    }
}

/// Overlay writer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Worker threads per category write (0 = auto)
    pub jobs: usize,
    /// Import existing ebuilds and keep the DistMap across runs
    pub incremental: bool,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            incremental: true,
        }
    }
}

/// Robust path normalization (expands a leading `~/`)
pub fn normalize_path(p: &Path) -> PathBuf {
    if let Ok(stripped) = p.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    p.to_path_buf()
}
