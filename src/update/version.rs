//! Version bookkeeping for OTA updates.
//!
//! The installed version lives in `version.json` as an exploded triple plus
//! optional prerelease/build metadata. Ordering and parsing are delegated to
//! the `semver` crate, which implements the full precedence rules (numeric
//! prerelease segments compare numerically, a release outranks its own
//! prereleases, build metadata is ignored).

use anyhow::{Context, Result};
use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk shape of `version.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionFile {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerelease: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_metadata: Option<String>,
}

impl VersionFile {
    /// Converts the persisted shape into a comparable [`semver::Version`].
    pub fn to_version(&self) -> Result<Version> {
        let mut version = Version::new(self.major, self.minor, self.patch);
        if let Some(ref pre) = self.prerelease {
            version.pre = Prerelease::new(pre)
                .with_context(|| format!("Invalid prerelease in version file: {pre}"))?;
        }
        if let Some(ref build) = self.build_metadata {
            version.build = BuildMetadata::new(build)
                .with_context(|| format!("Invalid build metadata in version file: {build}"))?;
        }
        Ok(version)
    }

    fn from_version(version: &Version) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
            prerelease: (!version.pre.is_empty()).then(|| version.pre.as_str().to_string()),
            build_metadata: (!version.build.is_empty()).then(|| version.build.as_str().to_string()),
        }
    }
}

/// Parses a semantic version string.
pub fn parse_version(input: &str) -> Result<Version> {
    Version::parse(input.trim()).with_context(|| format!("Invalid version string: {input}"))
}

/// Returns `true` when `candidate` is strictly newer than `current`.
pub fn is_newer_version(candidate: &Version, current: &Version) -> bool {
    candidate > current
}

/// Returns `true` when `target` can replace `current` without a breaking
/// jump: same major version and not older.
pub fn is_compatible_version(current: &Version, target: &Version) -> bool {
    current.major == target.major && target >= current
}

/// Manages the persisted agent version in `version.json`.
#[derive(Debug)]
pub struct VersionManager {
    version_file: PathBuf,
    current: Option<Version>,
}

impl VersionManager {
    pub fn new(version_file: impl Into<PathBuf>) -> Self {
        Self {
            version_file: version_file.into(),
            current: None,
        }
    }

    /// Returns the installed version, loading it from disk on first call.
    ///
    /// A missing or unreadable version file yields the 0.1.0 bootstrap
    /// version so that any published release counts as an update.
    pub fn current_version(&mut self) -> Version {
        if let Some(ref version) = self.current {
            return version.clone();
        }

        let version = match fs::read_to_string(&self.version_file) {
            Ok(content) => serde_json::from_str::<VersionFile>(&content)
                .map_err(anyhow::Error::from)
                .and_then(|file| file.to_version())
                .unwrap_or_else(|e| {
                    log::error!(
                        "Unreadable version file {}: {}, assuming 0.1.0",
                        self.version_file.display(),
                        e
                    );
                    Version::new(0, 1, 0)
                }),
            Err(_) => {
                log::warn!(
                    "Version file {} not found, assuming 0.1.0",
                    self.version_file.display()
                );
                Version::new(0, 1, 0)
            }
        };

        self.current = Some(version.clone());
        version
    }

    /// Persists `version` to the version file and updates the cache.
    pub fn save_version(&mut self, version: &Version) -> Result<()> {
        if let Some(parent) = self.version_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = VersionFile::from_version(version);
        fs::write(&self.version_file, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write {}", self.version_file.display()))?;

        self.current = Some(version.clone());
        log::info!("Saved version: {}", version);
        Ok(())
    }

    /// Saves `version` only if it is strictly newer than the installed one.
    pub fn update_version(&mut self, version: &Version) -> Result<()> {
        let current = self.current_version();
        if !is_newer_version(version, &current) {
            anyhow::bail!("Version {} is not newer than installed {}", version, current);
        }
        self.save_version(version)
    }

    /// Path of the managed version file.
    pub fn version_file(&self) -> &Path {
        &self.version_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_and_serialize_round_trip() {
        for input in [
            "1.0.0",
            "0.1.0",
            "2.10.3-alpha.1",
            "1.2.3-rc.2+build.77",
            "1.0.0+20130313144700",
        ] {
            let version = parse_version(input).unwrap();
            assert_eq!(version.to_string(), input);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_version("1.0").is_err());
        assert!(parse_version("v1.0.0").is_err());
        assert!(parse_version("1.0.0.0").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn test_release_outranks_prerelease() {
        let release = parse_version("1.0.0").unwrap();
        let pre = parse_version("1.0.0-rc.1").unwrap();
        assert!(is_newer_version(&release, &pre));
        assert!(!is_newer_version(&pre, &release));
    }

    #[test]
    fn test_prerelease_ordering() {
        // Numeric segments compare numerically, shorter-but-equal prefixes
        // are smaller, alphanumeric compares lexically.
        let cases = [
            ("1.0.0-alpha", "1.0.0-alpha.1"),
            ("1.0.0-alpha.1", "1.0.0-alpha.2"),
            ("1.0.0-alpha.2", "1.0.0-alpha.10"),
            ("1.0.0-alpha.10", "1.0.0-beta"),
            ("1.0.0-beta.9", "1.0.0-rc.1"),
        ];
        for (smaller, larger) in cases {
            let a = parse_version(smaller).unwrap();
            let b = parse_version(larger).unwrap();
            assert!(a < b, "{smaller} should sort before {larger}");
        }
    }

    #[test]
    fn test_build_metadata_ignored_in_ordering() {
        let a = parse_version("1.0.0+one").unwrap();
        let b = parse_version("1.0.0+two").unwrap();
        assert!(!is_newer_version(&a, &b));
        assert!(!is_newer_version(&b, &a));
    }

    #[test]
    fn test_compatibility_requires_same_major() {
        let current = parse_version("1.4.0").unwrap();
        assert!(is_compatible_version(&current, &parse_version("1.5.0").unwrap()));
        assert!(is_compatible_version(&current, &parse_version("1.4.0").unwrap()));
        assert!(!is_compatible_version(&current, &parse_version("2.0.0").unwrap()));
        assert!(!is_compatible_version(&current, &parse_version("1.3.9").unwrap()));
    }

    #[test]
    fn test_missing_version_file_defaults() {
        let dir = tempdir().unwrap();
        let mut manager = VersionManager::new(dir.path().join("version.json"));
        assert_eq!(manager.current_version(), Version::new(0, 1, 0));
    }

    #[test]
    fn test_save_and_reload_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("version.json");

        let mut manager = VersionManager::new(&path);
        let version = parse_version("1.2.3-beta.1+abc").unwrap();
        manager.save_version(&version).unwrap();

        // A fresh manager reads the exploded JSON shape back.
        let mut reloaded = VersionManager::new(&path);
        assert_eq!(reloaded.current_version(), version);

        let raw: VersionFile =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.major, 1);
        assert_eq!(raw.prerelease.as_deref(), Some("beta.1"));
        assert_eq!(raw.build_metadata.as_deref(), Some("abc"));
    }

    #[test]
    fn test_update_version_refuses_downgrade() {
        let dir = tempdir().unwrap();
        let mut manager = VersionManager::new(dir.path().join("version.json"));
        manager.save_version(&parse_version("1.1.0").unwrap()).unwrap();

        assert!(manager.update_version(&parse_version("1.1.0").unwrap()).is_err());
        assert!(manager.update_version(&parse_version("1.0.9").unwrap()).is_err());
        assert!(manager.update_version(&parse_version("1.2.0").unwrap()).is_ok());
        assert_eq!(manager.current_version(), parse_version("1.2.0").unwrap());
    }
}
