//! Update package inspection and extraction.
//!
//! A package is a gzipped tar archive carrying `package_info.json` (the
//! manifest), an executable `install.sh` post-install script, and payload
//! files at the paths the manifest declares.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;

/// One payload file declared by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageFileEntry {
    /// Path relative to the install directory.
    pub target_path: String,
    /// Octal permission bits as a string, e.g. `"755"`.
    pub permissions: String,
    #[serde(default)]
    pub size: u64,
    /// SHA-256 of the file contents, when the builder recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl PackageFileEntry {
    /// Parses the octal permission string into mode bits.
    pub fn mode(&self) -> Option<u32> {
        u32::from_str_radix(&self.permissions, 8).ok()
    }
}

/// `package_info.json` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    /// Compatibility constraints (minimum agent version, platforms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<serde_json::Value>,
    #[serde(default)]
    pub files: Vec<PackageFileEntry>,
}

/// Entry names the archive must contain to be a valid update package.
const REQUIRED_ENTRIES: [&str; 2] = ["package_info.json", "install.sh"];

fn normalized(name: &Path) -> String {
    name.to_string_lossy()
        .trim_start_matches("./")
        .to_string()
}

/// Validates the archive structure and returns the parsed manifest.
///
/// Checks that the file is a readable gzipped tar containing both
/// `package_info.json` and `install.sh`.
pub fn validate_archive(package_path: &Path) -> Result<PackageInfo> {
    let file = File::open(package_path)
        .with_context(|| format!("Failed to open package {}", package_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut manifest: Option<PackageInfo> = None;
    let mut seen = Vec::new();

    for entry in archive.entries().context("Package is not a valid gzipped tar archive")? {
        let mut entry = entry.context("Package is not a valid gzipped tar archive")?;
        let name = normalized(&entry.path()?);

        if name == "package_info.json" {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            manifest = Some(
                serde_json::from_str(&content).context("Malformed package_info.json")?,
            );
        }
        seen.push(name);
    }

    for required in REQUIRED_ENTRIES {
        anyhow::ensure!(
            seen.iter().any(|name| name == required),
            "Package is missing required file: {required}"
        );
    }

    manifest.context("Package manifest could not be read")
}

/// Extracts the whole archive into `dest`.
pub fn extract_to(package_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(package_path)
        .with_context(|| format!("Failed to open package {}", package_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to extract package into {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders shared by unit and integration tests.

    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{Builder, Header};

    /// Builds a well-formed package archive at `path`.
    pub fn build_package(
        path: &Path,
        manifest: &PackageInfo,
        payload: &[(&str, &[u8])],
        install_script: &str,
    ) {
        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

        let manifest_json = serde_json::to_vec_pretty(manifest).unwrap();
        append_entry(&mut builder, "package_info.json", &manifest_json, 0o644);
        append_entry(&mut builder, "install.sh", install_script.as_bytes(), 0o755);
        for (name, content) in payload {
            append_entry(&mut builder, name, content, 0o644);
        }

        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    fn append_entry(
        builder: &mut Builder<GzEncoder<File>>,
        name: &str,
        content: &[u8],
        mode: u32,
    ) {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(version: &str) -> PackageInfo {
        PackageInfo {
            version: version.to_string(),
            changelog: Some("test build".to_string()),
            compatibility: None,
            files: vec![PackageFileEntry {
                target_path: "bin/agent".to_string(),
                permissions: "755".to_string(),
                size: 5,
                hash: None,
            }],
        }
    }

    #[test]
    fn test_validate_well_formed_package() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        test_support::build_package(
            &path,
            &manifest("1.2.0"),
            &[("bin/agent", b"hello")],
            "#!/bin/bash\nexit 0\n",
        );

        let info = validate_archive(&path).unwrap();
        assert_eq!(info.version, "1.2.0");
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].mode(), Some(0o755));
    }

    #[test]
    fn test_validate_rejects_non_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        std::fs::write(&path, b"definitely not a tarball").unwrap();
        assert!(validate_archive(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_install_script() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use tar::{Builder, Header};

        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let manifest_json = serde_json::to_vec(&manifest("1.0.0")).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(manifest_json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "package_info.json", manifest_json.as_slice())
            .unwrap();
        drop(builder.into_inner().unwrap().finish().unwrap());

        let err = validate_archive(&path).unwrap_err();
        assert!(err.to_string().contains("install.sh"));
    }

    #[test]
    fn test_extract_package_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        test_support::build_package(
            &path,
            &manifest("1.2.0"),
            &[("bin/agent", b"hello"), ("conf/agent.json", b"{}")],
            "#!/bin/bash\nexit 0\n",
        );

        let dest = dir.path().join("scratch");
        extract_to(&path, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("bin/agent")).unwrap(), b"hello");
        assert!(dest.join("install.sh").exists());
        assert!(dest.join("package_info.json").exists());
    }

    #[test]
    fn test_mode_parses_octal_strings() {
        let entry = PackageFileEntry {
            target_path: "x".to_string(),
            permissions: "644".to_string(),
            size: 0,
            hash: None,
        };
        assert_eq!(entry.mode(), Some(0o644));

        let bad = PackageFileEntry {
            target_path: "x".to_string(),
            permissions: "rwx".to_string(),
            size: 0,
            hash: None,
        };
        assert_eq!(bad.mode(), None);
    }
}
