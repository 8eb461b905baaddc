//! The install manifest.
//!
//! Records what is installed: version, architecture, channel, and locale.
//! Created by the installer, mutated only by the installer and the update
//! pipeline, and read-only to everything else. The version is monotonic
//! per channel; the update pipeline enforces the no-downgrade rule before
//! ever touching this file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The installed-bundle manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Installed version.
    #[serde(default)]
    pub version: String,

    /// Installed architecture tag (`linux64` or `linux32`).
    #[serde(default)]
    pub architecture: String,

    /// Release channel (`release`, `alpha`, `hardened`).
    #[serde(default)]
    pub channel: String,

    /// Bundle locale.
    #[serde(default)]
    pub locale: String,

    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    path: PathBuf,
}

impl Manifest {
    /// Creates a fresh manifest, marked dirty so the first sync writes it.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        version: impl Into<String>,
        architecture: impl Into<String>,
        channel: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            architecture: architecture.into(),
            channel: channel.into(),
            locale: locale.into(),
            dirty: true,
            path: path.into(),
        }
    }

    /// Loads a manifest if present; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// I/O failures other than not-found, malformed JSON.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut m: Self =
            serde_json::from_slice(&raw).map_err(|e| Error::Serialization(e.to_string()))?;
        m.path = path.to_path_buf();
        m.dirty = false;
        Ok(Some(m))
    }

    /// Sets the version, marking the manifest dirty when it changed.
    pub fn set_version(&mut self, version: &str) {
        if self.version != version {
            self.version = version.to_string();
            self.dirty = true;
        }
    }

    /// Flushes to disk if dirty.
    ///
    /// # Errors
    ///
    /// Serialization or write failures.
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let raw =
            serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        self.dirty = false;
        Ok(())
    }

    /// Deletes the manifest file.
    pub fn purge(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// True when `candidate` is strictly newer than the installed version.
    ///
    /// Alpha versions write their minor break with an `a` (`7.0a4`); those
    /// are normalized before the numeric comparison. Anything unparseable
    /// compares as not-newer, which fails safe for upgrades.
    #[must_use]
    pub fn is_newer_version(&self, candidate: &str) -> bool {
        match (parse_version(&self.version), parse_version(candidate)) {
            (Some(installed), Some(candidate)) => candidate > installed,
            _ => false,
        }
    }

    /// True when the installed version is at least `major.minor`.
    #[must_use]
    pub fn version_at_least(&self, major: u32, minor: u32) -> bool {
        match parse_version(&self.version) {
            Some(v) => v >= vec![major, minor],
            None => false,
        }
    }
}

/// Parses a dotted version, tolerating the alpha `a` separator and the
/// `-hardened` suffix. Missing trailing components compare as zero by
/// Vec ordering semantics combined with trailing-zero trimming.
fn parse_version(version: &str) -> Option<Vec<u32>> {
    let version = version.trim().trim_end_matches("-hardened");
    if version.is_empty() {
        return None;
    }
    let normalized = version.replacen('a', ".", 1);
    let mut parts = Vec::new();
    for part in normalized.split('.') {
        parts.push(part.parse().ok()?);
    }
    // Trim trailing zeros so 11.0 == 11.0.0.
    while parts.last() == Some(&0) {
        parts.pop();
    }
    Some(parts)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(version: &str) -> Manifest {
        Manifest::new("/nonexistent", version, "linux64", "release", "en-US")
    }

    #[test]
    fn test_newer_version_basic() {
        let m = manifest("11.0.4");
        assert!(m.is_newer_version("11.0.5"));
        assert!(m.is_newer_version("11.1"));
        assert!(m.is_newer_version("12.0"));
        assert!(!m.is_newer_version("11.0.4"));
        assert!(!m.is_newer_version("11.0.3"));
        assert!(!m.is_newer_version("10.9.9"));
    }

    #[test]
    fn test_newer_version_alpha() {
        let m = manifest("7.0a3");
        assert!(m.is_newer_version("7.0a4"));
        assert!(!m.is_newer_version("7.0a3"));
        assert!(!m.is_newer_version("7.0a2"));
    }

    #[test]
    fn test_newer_version_hardened_suffix() {
        let m = manifest("7.0.1-hardened");
        assert!(m.is_newer_version("7.0.2-hardened"));
        assert!(!m.is_newer_version("7.0.1"));
    }

    #[test]
    fn test_newer_version_unparseable_fails_safe() {
        let m = manifest("11.0.4");
        assert!(!m.is_newer_version("next"));
        assert!(!m.is_newer_version(""));
        let broken = manifest("unknown");
        assert!(!broken.is_newer_version("11.0.5"));
    }

    #[test]
    fn test_trailing_zeros_equal() {
        let m = manifest("11.0");
        assert!(!m.is_newer_version("11.0.0"));
        assert!(m.is_newer_version("11.0.1"));
    }

    #[test]
    fn test_version_at_least() {
        let m = manifest("6.5a2");
        assert!(m.version_at_least(6, 5));
        assert!(m.version_at_least(6, 0));
        assert!(!m.version_at_least(6, 6));
        assert!(!m.version_at_least(7, 0));
    }

    #[test]
    fn test_load_and_sync_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut m = Manifest::new(&path, "11.0.4", "linux64", "release", "en-US");
        m.sync().unwrap();

        let loaded = Manifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.version, "11.0.4");
        assert_eq!(loaded.architecture, "linux64");

        // A clean manifest does not rewrite the file.
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let mut loaded = loaded;
        loaded.sync().unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            mtime
        );
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(Manifest::load(Path::new("/no/such/manifest.json"))
            .unwrap()
            .is_none());
    }
}
