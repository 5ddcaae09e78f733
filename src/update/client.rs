//! OTA update client.
//!
//! Drives the full update lifecycle against the update origin:
//! check → download → verify → install → restart, with automatic rollback
//! to the most recent backup when installation fails. Verification failures
//! abort before anything touches the installed tree, so no rollback is
//! needed on that path.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::package::{self, PackageInfo};
use super::signature::{SignatureInfo, SignatureManager};
use super::version::{self, VersionManager};
use crate::constants;

/// Update pipeline status, reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    NoUpdate,
    Checking,
    Available,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed,
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::NoUpdate => "no_update",
            Self::Checking => "checking",
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(tag)
    }
}

/// Update descriptor returned by the origin's check endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    #[serde(default)]
    pub available: bool,
    pub version: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_url: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// `(status, progress_percent, message)` observer for operator visibility.
pub type ProgressCallback = Arc<dyn Fn(UpdateStatus, f64, &str) + Send + Sync>;

/// Path of the sibling signature file: the package path with `.sig` appended.
fn signature_path_for(package_path: &Path) -> PathBuf {
    let mut path = package_path.as_os_str().to_owned();
    path.push(".sig");
    PathBuf::from(path)
}

/// Client for the agent's OTA update pipeline.
pub struct UpdateClient {
    server_url: String,
    agent_id: String,
    install_dir: PathBuf,
    backup_dir: PathBuf,
    http: reqwest::Client,
    version_manager: StdMutex<VersionManager>,
    signature: SignatureManager,
    status: StdMutex<UpdateStatus>,
    update_info: StdMutex<Option<UpdateInfo>>,
    progress: StdMutex<Option<ProgressCallback>>,
}

impl std::fmt::Debug for UpdateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateClient")
            .field("server_url", &self.server_url)
            .field("install_dir", &self.install_dir)
            .field("status", &self.current_status())
            .finish_non_exhaustive()
    }
}

impl UpdateClient {
    pub fn new(
        server_url: impl Into<String>,
        agent_id: impl Into<String>,
        api_key: &str,
        install_dir: impl Into<PathBuf>,
        signature: SignatureManager,
    ) -> Result<Self> {
        let install_dir = install_dir.into();
        let backup_dir = install_dir.join("backup");
        std::fs::create_dir_all(&install_dir)
            .with_context(|| format!("Failed to create {}", install_dir.display()))?;
        std::fs::create_dir_all(&backup_dir)
            .with_context(|| format!("Failed to create {}", backup_dir.display()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("API key is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(constants::UPDATE_HTTP_TIMEOUT)
            .default_headers(headers)
            .user_agent(constants::user_agent())
            .build()
            .context("Failed to build update HTTP client")?;

        let version_file = install_dir.join("version.json");
        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            install_dir,
            backup_dir,
            http,
            version_manager: StdMutex::new(VersionManager::new(version_file)),
            signature,
            status: StdMutex::new(UpdateStatus::NoUpdate),
            update_info: StdMutex::new(None),
            progress: StdMutex::new(None),
        })
    }

    /// Registers the progress observer.
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress.lock().expect("progress lock poisoned") = Some(callback);
    }

    /// Current pipeline status.
    pub fn current_status(&self) -> UpdateStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// The installed agent version.
    pub fn current_version(&self) -> semver::Version {
        self.version_manager
            .lock()
            .expect("version lock poisoned")
            .current_version()
    }

    fn notify(&self, status: UpdateStatus, progress: f64, message: &str) {
        *self.status.lock().expect("status lock poisoned") = status;
        if let Some(callback) = self.progress.lock().expect("progress lock poisoned").as_ref() {
            callback(status, progress, message);
        }
        log::info!("Update progress: {} ({:.1}%) - {}", status, progress, message);
    }

    /// Asks the origin whether a newer compatible version exists.
    ///
    /// Returns `None` on 404 or `{available: false}`; caches the descriptor
    /// otherwise.
    pub async fn check_for_updates(&self) -> Result<Option<UpdateInfo>> {
        self.notify(UpdateStatus::Checking, 0.0, "Checking for updates...");

        let current = self.current_version();
        let url = format!(
            "{}/api/v1/agents/{}/updates",
            self.server_url, self.agent_id
        );

        let response = self
            .http
            .get(&url)
            .query(&[
                ("current_version", current.to_string()),
                ("platform", std::env::consts::OS.to_string()),
                ("architecture", std::env::consts::ARCH.to_string()),
            ])
            .send()
            .await
            .context("Update check request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.notify(UpdateStatus::NoUpdate, 100.0, "No updates available");
            return Ok(None);
        }
        anyhow::ensure!(
            response.status().is_success(),
            "Update check returned {}",
            response.status()
        );

        let info: UpdateInfo = response
            .json()
            .await
            .context("Malformed update check response")?;
        if !info.available {
            self.notify(UpdateStatus::NoUpdate, 100.0, "No updates available");
            return Ok(None);
        }

        self.notify(
            UpdateStatus::Available,
            100.0,
            &format!("Update available: {}", info.version),
        );
        *self.update_info.lock().expect("update_info lock poisoned") = Some(info.clone());
        Ok(Some(info))
    }

    /// Downloads the package and its signature file into a scratch
    /// directory. Returns `(scratch_dir, package_path)`.
    pub async fn download_update(&self, info: &UpdateInfo) -> Result<(PathBuf, PathBuf)> {
        self.notify(UpdateStatus::Downloading, 0.0, "Starting download...");

        let scratch = std::env::temp_dir().join(format!("agent-update-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;
        let package_path = scratch.join("update_package.tar.gz");

        let response = self
            .http
            .get(&info.download_url)
            .send()
            .await
            .context("Package download request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "Package download returned {}",
            response.status()
        );

        let total = info.size;
        let mut downloaded: u64 = 0;
        let mut file = tokio::fs::File::create(&package_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Package download interrupted")?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if total > 0 {
                let percent = (downloaded as f64 / total as f64) * 100.0;
                self.notify(
                    UpdateStatus::Downloading,
                    percent.min(100.0),
                    &format!("Downloaded {downloaded}/{total} bytes"),
                );
            }
        }
        file.flush().await?;

        if let Some(ref signature_url) = info.signature_url {
            let response = self
                .http
                .get(signature_url)
                .send()
                .await
                .context("Signature download request failed")?;
            anyhow::ensure!(
                response.status().is_success(),
                "Signature download returned {}",
                response.status()
            );
            let body = response.bytes().await?;
            tokio::fs::write(signature_path_for(&package_path), &body).await?;
        }

        self.notify(UpdateStatus::Downloading, 100.0, "Download completed");
        Ok((scratch, package_path))
    }

    /// Verifies the downloaded package. All checks must hold:
    /// archive structure, strictly-newer semver, file hash, and the
    /// cryptographic signature under the declared method.
    pub fn verify_package(&self, package_path: &Path) -> Result<PackageInfo> {
        self.notify(UpdateStatus::Verifying, 0.0, "Verifying package...");

        let manifest = package::validate_archive(package_path)?;

        let package_version = version::parse_version(&manifest.version)?;
        let current = self.current_version();
        anyhow::ensure!(
            version::is_newer_version(&package_version, &current),
            "Package version {} is not newer than installed {}",
            package_version,
            current
        );

        let signature_path = signature_path_for(package_path);
        anyhow::ensure!(
            signature_path.exists(),
            "Signature file missing: {}",
            signature_path.display()
        );
        let signature_info: SignatureInfo =
            serde_json::from_str(&std::fs::read_to_string(&signature_path)?)
                .context("Malformed signature file")?;

        anyhow::ensure!(
            self.signature.verify_file(package_path, &signature_info)?,
            "Package signature verification failed"
        );

        self.notify(UpdateStatus::Verifying, 100.0, "Package verification completed");
        Ok(manifest)
    }

    /// Snapshots the installed tree (minus the backup directory) into
    /// `backup/backup_<UTC-timestamp>.tar.gz`.
    pub fn create_backup(&self) -> Result<PathBuf> {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.backup_dir.join(format!("backup_{timestamp}.tar.gz"));
        log::info!("Creating backup: {}", backup_path.display());

        let file = std::fs::File::create(&backup_path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        for entry in std::fs::read_dir(&self.install_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == "backup" {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                builder.append_dir_all(Path::new(&name), &path)?;
            } else {
                builder.append_path_with_name(&path, Path::new(&name))?;
            }
        }

        builder
            .into_inner()?
            .finish()
            .context("Failed to finalize backup archive")?;
        log::info!("Backup created: {}", backup_path.display());
        Ok(backup_path)
    }

    /// Installs a verified package: backup, extract, copy manifest files with
    /// their permission bits, persist the new version, run `install.sh`.
    /// Any failure rolls back to the backup taken at the start.
    pub async fn install_update(&self, package_path: &Path, manifest: &PackageInfo) -> Result<()> {
        self.notify(UpdateStatus::Installing, 0.0, "Starting installation...");

        let backup_path = self.create_backup().context("Backup creation failed")?;
        self.notify(UpdateStatus::Installing, 20.0, "Backup created");

        match self.install_files(package_path, manifest).await {
            Ok(()) => {
                self.notify(UpdateStatus::Installing, 100.0, "Installation completed");
                log::info!("Update installed: {}", manifest.version);
                Ok(())
            }
            Err(e) => {
                log::error!("Installation failed, rolling back: {}", e);
                if let Err(rollback_err) =
                    self.rollback_update(backup_path.file_name().and_then(|n| n.to_str()))
                {
                    log::error!("Rollback also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn install_files(&self, package_path: &Path, manifest: &PackageInfo) -> Result<()> {
        let scratch = std::env::temp_dir().join(format!("agent-install-{}", uuid::Uuid::new_v4()));
        package::extract_to(package_path, &scratch)?;
        self.notify(UpdateStatus::Installing, 40.0, "Package extracted");

        let result = self.apply_extracted(&scratch, manifest).await;
        let _ = std::fs::remove_dir_all(&scratch);
        result
    }

    async fn apply_extracted(&self, scratch: &Path, manifest: &PackageInfo) -> Result<()> {
        for entry in &manifest.files {
            let source = scratch.join(&entry.target_path);
            let target = self.install_dir.join(&entry.target_path);
            anyhow::ensure!(
                source.exists(),
                "Manifest entry missing from package: {}",
                entry.target_path
            );

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)
                .with_context(|| format!("Failed to install {}", entry.target_path))?;

            #[cfg(unix)]
            if let Some(mode) = entry.mode() {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                {
                    log::warn!("Could not set permissions on {}: {}", target.display(), e);
                }
            }
        }
        self.notify(UpdateStatus::Installing, 70.0, "Files installed");

        let new_version = version::parse_version(&manifest.version)?;
        self.version_manager
            .lock()
            .expect("version lock poisoned")
            .save_version(&new_version)
            .context("Failed to persist new version")?;
        self.notify(UpdateStatus::Installing, 90.0, "Version updated");

        self.run_install_script(scratch).await
    }

    /// Runs the package's `install.sh` with `INSTALL_DIR`/`BACKUP_DIR` in the
    /// environment. Must exit zero within the script timeout.
    async fn run_install_script(&self, scratch: &Path) -> Result<()> {
        let script = scratch.join("install.sh");
        if !script.exists() {
            return Ok(());
        }

        let mut command = tokio::process::Command::new("bash");
        command
            .arg(&script)
            .env("INSTALL_DIR", &self.install_dir)
            .env("BACKUP_DIR", &self.backup_dir)
            .kill_on_drop(true);

        let output = tokio::time::timeout(constants::INSTALL_SCRIPT_TIMEOUT, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("Install script timed out"))?
            .context("Failed to run install script")?;

        anyhow::ensure!(
            output.status.success(),
            "Install script failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        log::info!("Install script executed successfully");
        Ok(())
    }

    /// Restores the installed tree from `backup_name`, or the newest backup
    /// when `None`. The version file is restored from the backup contents,
    /// so it matches what was actually put back.
    pub fn rollback_update(&self, backup_name: Option<&str>) -> Result<()> {
        let backup_path = match backup_name {
            Some(name) => self.backup_dir.join(name),
            None => self
                .list_backups()?
                .into_iter()
                .next()
                .context("No backups found")?,
        };
        anyhow::ensure!(
            backup_path.exists(),
            "Backup not found: {}",
            backup_path.display()
        );
        log::info!("Rolling back using {}", backup_path.display());

        // Clear the install tree, keeping the backups themselves.
        for entry in std::fs::read_dir(&self.install_dir)? {
            let entry = entry?;
            if entry.file_name() == "backup" {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }

        let file = std::fs::File::open(&backup_path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        archive
            .unpack(&self.install_dir)
            .context("Failed to restore backup")?;

        // Drop the cached version so the next read reflects the restored file.
        *self.version_manager.lock().expect("version lock poisoned") =
            VersionManager::new(self.install_dir.join("version.json"));

        log::info!("Rollback completed");
        Ok(())
    }

    /// Backups sorted newest-first by modification time.
    fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("backup_") && name.ends_with(".tar.gz") {
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                backups.push((mtime, entry.path()));
            }
        }
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    /// Deletes all but the `keep_count` most recent backups. Returns how
    /// many were removed.
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize> {
        let backups = self.list_backups()?;
        let mut deleted = 0;
        for backup in backups.into_iter().skip(keep_count) {
            match std::fs::remove_file(&backup) {
                Ok(()) => {
                    deleted += 1;
                    log::info!("Deleted old backup {}", backup.display());
                }
                Err(e) => log::error!("Failed to delete backup {}: {}", backup.display(), e),
            }
        }
        Ok(deleted)
    }

    /// Writes a delayed-restart script and spawns it in a new session so it
    /// survives this process exiting. Prefers systemd, then SysV `service`,
    /// then a plain re-exec of the installed binary.
    pub fn schedule_restart(&self, delay: Duration) -> Result<()> {
        let script_path = self.install_dir.join("restart_agent.sh");
        let script = format!(
            "#!/bin/bash\n\
             sleep {delay}\n\
             echo \"Restarting agent after update...\"\n\
             if command -v systemctl >/dev/null 2>&1; then\n\
             \x20   systemctl restart netprobe-agent\n\
             elif command -v service >/dev/null 2>&1; then\n\
             \x20   service netprobe-agent restart\n\
             else\n\
             \x20   pkill -f netprobe-agent\n\
             \x20   cd \"{install_dir}\"\n\
             \x20   ./netprobe-agent &\n\
             fi\n",
            delay = delay.as_secs(),
            install_dir = self.install_dir.display(),
        );
        std::fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        }

        let mut command = std::process::Command::new("bash");
        command.arg(&script_path);
        // Detach into a new session so the restart outlives this process.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command.spawn().context("Failed to spawn restart script")?;

        log::info!("Restart scheduled in {}s", delay.as_secs());
        Ok(())
    }

    /// Runs the complete pipeline. Returns `true` when an update was
    /// installed.
    pub async fn perform_update(&self, auto_restart: bool) -> Result<bool> {
        let Some(info) = self.check_for_updates().await.inspect_err(|e| {
            self.notify(UpdateStatus::Failed, 0.0, &format!("Update check failed: {e}"));
        })?
        else {
            return Ok(false);
        };

        let (scratch, package_path) = match self.download_update(&info).await {
            Ok(paths) => paths,
            Err(e) => {
                self.notify(UpdateStatus::Failed, 0.0, &format!("Download failed: {e}"));
                return Err(e);
            }
        };

        let outcome = async {
            let manifest = self.verify_package(&package_path).inspect_err(|e| {
                self.notify(UpdateStatus::Failed, 0.0, &format!("Verification failed: {e}"));
            })?;

            self.install_update(&package_path, &manifest)
                .await
                .inspect_err(|e| {
                    self.notify(UpdateStatus::Failed, 0.0, &format!("Installation failed: {e}"));
                })?;

            self.notify(UpdateStatus::Completed, 100.0, "Update completed successfully");
            if auto_restart {
                self.schedule_restart(constants::RESTART_DELAY)?;
            }
            Ok(true)
        }
        .await;

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            log::warn!("Failed to clean up download scratch dir: {}", e);
        }
        outcome
    }

    /// Install directory root.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Backup directory root.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}
