//! The update pipeline.
//!
//! Mozilla-compatible check-and-apply: fetch `updates.xml` over tor,
//! refuse downgrades, download and verify the MAR, hand it to the real
//! updater inside a fresh sandbox, and only then commit the new version to
//! the manifest. A failed update leaves the previous install untouched.

pub mod https;
pub mod metadata;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use crate::constants::{
    MAX_MAR_SIZE, MAX_METADATA_SIZE, METADATA_FETCH_TIMEOUT, UPDATE_STATUS_SUCCEEDED,
};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::progress::{CancelToken, Progress};
use crate::sandbox::{Helper, SandboxSpec};
use crate::seccomp;
use crate::tor::Tor;
use crate::update::https::{HttpsClient, PinSet};
use crate::update::metadata::{parse_update_xml, select_patch, UpdateEntry};

/// Sandbox-side install directory during the apply step.
const INSTALL_SANDBOX_DIR: &str = "/home/amnesia/sandboxed-tor-browser/tor-browser";

/// Sandbox-side staging directory during the apply step.
const UPDATE_SANDBOX_DIR: &str = "/home/amnesia/sandboxed-tor-browser/update";

/// Sandbox-side browser home, the updater's working directory.
const BROWSER_HOME: &str = "/home/amnesia/sandboxed-tor-browser/tor-browser/Browser";

/// Autoconfig loader dropped into `defaults/pref` after an update.
const AUTOCONFIG_JS: &[u8] = include_bytes!("../../assets/autoconfig.js");

/// Locked prefs referenced by the autoconfig loader.
const MOZILLA_CFG: &[u8] = include_bytes!("../../assets/mozilla.cfg");

// =============================================================================
// Collaborator Seams
// =============================================================================

/// Verifies a MAR's internal signature block against the hard-coded
/// signing key. Implemented outside the core.
pub trait MarVerifier: Send + Sync {
    /// Returns Ok only for a correctly signed MAR.
    ///
    /// # Errors
    ///
    /// `BadSignature` (or equivalent) on any verification failure.
    fn verify(&self, mar: &[u8]) -> Result<()>;
}

/// Relaunches the supervised tor after a successful update.
#[async_trait]
pub trait TorLauncher: Send + Sync {
    /// Spawns and bootstraps a fresh tor.
    async fn launch(&self, progress: &Progress, cancel: &mut CancelToken) -> Result<Tor>;
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Host-side paths the pipeline operates on.
#[derive(Debug, Clone)]
pub struct UpdatePaths {
    /// Bundle install directory (contains `Browser/`).
    pub install_dir: PathBuf,
    /// Parent directory for the `update` staging area.
    pub user_data_dir: PathBuf,
}

impl UpdatePaths {
    fn staging_dir(&self) -> PathBuf {
        self.user_data_dir.join("update")
    }
}

/// The update pipeline.
pub struct UpdatePipeline {
    helper: Helper,
    paths: UpdatePaths,
    verifier: Arc<dyn MarVerifier>,
    pins: PinSet,
}

impl UpdatePipeline {
    /// Builds a pipeline.
    #[must_use]
    pub fn new(helper: Helper, paths: UpdatePaths, verifier: Arc<dyn MarVerifier>) -> Self {
        Self {
            helper,
            paths,
            verifier,
            pins: PinSet::builtin(),
        }
    }

    /// Overrides the certificate pin set (tests, mirrors).
    #[must_use]
    pub fn with_pins(mut self, pins: PinSet) -> Self {
        self.pins = pins;
        self
    }

    // =========================================================================
    // Check
    // =========================================================================

    /// Fetches and parses update metadata, trying each candidate URL until
    /// one works.
    ///
    /// # Errors
    ///
    /// When every candidate fails; the last failure wins.
    pub async fn check(
        &self,
        tor: &Tor,
        manifest: &Manifest,
        progress: &Progress,
        cancel: &mut CancelToken,
    ) -> Result<UpdateEntry> {
        progress.update("Checking for updates.");

        let urls = update_urls(manifest)?;
        let dialer = Arc::new(tor.dialer().await?);
        let client = HttpsClient::new(dialer, self.pins.clone());

        let mut last_err = Error::UpdateMetadata("no update URLs".into());
        for url in urls {
            debug!(%url, "fetching update metadata");
            let fetch = client.get(&url, MAX_METADATA_SIZE, cancel, None);
            let fetched = tokio::time::timeout(METADATA_FETCH_TIMEOUT, fetch)
                .await
                .unwrap_or(Err(Error::Timeout {
                    operation: format!("metadata fetch from {url}"),
                    duration: METADATA_FETCH_TIMEOUT,
                }));
            match fetched {
                Ok(raw) => match parse_update_xml(&raw) {
                    Ok(entry) => return Ok(entry),
                    Err(e) => {
                        warn!(%url, error = %e, "update metadata parse failed");
                        last_err = e;
                    }
                },
                Err(e) => {
                    if e.is_canceled() {
                        return Err(e);
                    }
                    warn!(%url, error = %e, "update metadata fetch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Runs the full pipeline: check, download, verify, apply, commit.
    ///
    /// The supervised tor is taken by value: it must be shut down before
    /// the updater runs, and is relaunched through `relauncher` once the
    /// manifest is committed. Cancellation is honored at every step until
    /// the updater itself starts; past that point the operation runs to
    /// completion and the progress channel says so.
    ///
    /// # Errors
    ///
    /// Everything §7 lists; on any error before the apply step the
    /// previous install is untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        mut tor: Tor,
        manifest: &mut Manifest,
        update_required: &mut bool,
        relauncher: &dyn TorLauncher,
        progress: &Progress,
        cancel: &mut CancelToken,
    ) -> Result<Option<Tor>> {
        let entry = self.check(&tor, manifest, progress, cancel).await?;
        ensure_upgrade(manifest, &entry)?;

        let patch = select_patch(&entry)?;
        info!(url = %patch.url, kind = %patch.patch_type, "downloading update");
        progress.update("Downloading Tor Browser Update.");

        let dialer = Arc::new(tor.dialer().await?);
        let client = HttpsClient::new(dialer, self.pins.clone());
        let report = {
            let progress = progress.clone();
            move |got: u64, total: Option<u64>| {
                let msg = match total {
                    Some(total) => format!(
                        "Downloading Tor Browser Update: {}%",
                        got * 100 / total.max(1)
                    ),
                    None => format!("Downloading Tor Browser Update: {got} bytes"),
                };
                progress.update(msg);
            }
        };
        let mar = client
            .get(&patch.url, MAX_MAR_SIZE, cancel, Some(&report))
            .await?;

        progress.update("Validating Tor Browser Update.");

        // Hash first, signature second; both must hold.
        if !patch.hash_function.eq_ignore_ascii_case("SHA512") {
            return Err(Error::UpdateMetadata(format!(
                "unsupported hash function '{}'",
                patch.hash_function
            )));
        }
        let expected = hex::decode(&patch.hash_value)
            .map_err(|_| Error::UpdateMetadata("undecodable hashValue".into()))?;
        let derived = Sha512::digest(&mar);
        if expected != derived.as_slice() {
            return Err(Error::HashMismatch {
                what: "update MAR".into(),
            });
        }
        self.verifier.verify(&mar)?;

        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        // The updater wants the network gone and the install quiescent.
        let was_system = tor.is_system();
        info!("shutting down tor for update");
        tor.shutdown().await;
        drop(tor);

        // Point of no return: the install directory is about to change.
        progress.update("Updating Tor Browser. This can no longer be canceled.");
        self.apply(&mar).await?;

        // Reinstall the autoconfig assets the updater clobbered.
        write_autoconfig(&self.paths.install_dir)?;

        // Commit.
        manifest.set_version(&entry.app_version);
        manifest.sync()?;
        *update_required = false;

        let tor = if was_system {
            None
        } else {
            info!("reconnecting to the tor network");
            progress.update("Reconnecting to the Tor network.");
            Some(relauncher.launch(progress, cancel).await?)
        };
        Ok(tor)
    }

    /// Stages the MAR and runs the updater in a fresh sandbox.
    async fn apply(&self, mar: &[u8]) -> Result<()> {
        let staging = self.paths.staging_dir();
        stage_update(&staging, &self.paths.install_dir, mar)?;

        let mut spec = SandboxSpec::new(format!("{UPDATE_SANDBOX_DIR}/updater"));
        spec.child_args([UPDATE_SANDBOX_DIR, BROWSER_HOME, BROWSER_HOME]);
        spec.bind(&self.paths.install_dir, INSTALL_SANDBOX_DIR, false)?;
        spec.bind(&staging, UPDATE_SANDBOX_DIR, false)?;
        spec.chdir(BROWSER_HOME);
        spec.setenv("LD_LIBRARY_PATH", BROWSER_HOME);
        spec.stdio(Stdio::null(), Stdio::null(), Stdio::null());
        spec.seccomp(Box::new(|fd| {
            let env = seccomp::SeccompEnvironment::default();
            let profile = seccomp::update_profile(&env)?;
            let mut fd = fd;
            profile.compile(&mut fd)
        }));

        let mut child = self.helper.spawn(spec).await?;
        let status = child.wait().await?;
        debug!(?status, "updater exited");

        // The exit code is not trusted; update.status is the contract.
        let status_file = staging.join("update.status");
        let raw = std::fs::read(&status_file)?;
        let trimmed = String::from_utf8_lossy(&raw);
        let trimmed = trimmed.trim();
        if trimmed != UPDATE_STATUS_SUCCEEDED {
            return Err(Error::UpdateMetadata(format!(
                "failed to apply update: '{trimmed}'"
            )));
        }

        // Success; the staging directory has served its purpose.
        let _ = std::fs::remove_dir_all(&staging);
        Ok(())
    }
}

/// Rejects offers that are not strictly newer than the installed
/// version. Runs before anything is downloaded or written.
///
/// # Errors
///
/// `UpdateMetadata` naming both versions.
pub fn ensure_upgrade(manifest: &Manifest, entry: &UpdateEntry) -> Result<()> {
    if manifest.is_newer_version(&entry.app_version) {
        return Ok(());
    }
    Err(Error::UpdateMetadata(format!(
        "update server offered '{}' against installed '{}'",
        entry.app_version, manifest.version
    )))
}

// =============================================================================
// Metadata URLs
// =============================================================================

/// Builds the candidate metadata URLs for the installed bundle, onion
/// service first.
///
/// # Errors
///
/// Unsupported architectures.
pub fn update_urls(manifest: &Manifest) -> Result<Vec<String>> {
    const CLEARNET_HOST: &str = "aus1.torproject.org";
    const ONION_HOST: &str =
        "aus1tp7kuwgu4ezkfkmhkhqo2mc2j7yaqbkqesjceqs3a5dzy4hm3did.onion";

    let build_target = match manifest.architecture.as_str() {
        "linux64" => "Linux_x86_64-gcc3",
        "linux32" => "Linux_x86-gcc3",
        other => {
            return Err(Error::UnsupportedPlatform(format!(
                "no update channel for architecture '{other}'"
            )))
        }
    };

    let tail = format!(
        "torbrowser/update_3/{}/{}/{}/{}/update.xml",
        manifest.channel, build_target, manifest.version, manifest.locale
    );
    Ok(vec![
        format!("https://{ONION_HOST}/{tail}"),
        format!("https://{CLEARNET_HOST}/{tail}"),
    ])
}

// =============================================================================
// Staging and Autoconfig
// =============================================================================

/// Prepares the outside staging directory the way the Mozilla updater
/// expects: a copy of `updater` (and its ini), plus the MAR as
/// `update.mar`.
fn stage_update(staging: &Path, install_dir: &Path, mar: &[u8]) -> Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    std::fs::create_dir_all(staging)?;

    let browser_dir = install_dir.join("Browser");
    for (name, required) in [("updater", true), ("updater.ini", false)] {
        let src = browser_dir.join(name);
        let dst = staging.join(name);
        let meta = match std::fs::metadata(&src) {
            Ok(meta) => meta,
            Err(_) if !required => continue,
            Err(e) => return Err(e.into()),
        };
        std::fs::copy(&src, &dst)?;
        std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(meta.mode()))?;
    }

    std::fs::write(staging.join("update.mar"), mar)?;
    let mode = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(staging.join("update.mar"), mode)?;
    Ok(())
}

/// Rewrites the browser autoconfig assets inside the install directory.
///
/// # Errors
///
/// I/O failures.
pub fn write_autoconfig(install_dir: &Path) -> Result<()> {
    let browser_dir = install_dir.join("Browser");
    let pref_dir = browser_dir.join("defaults/pref");
    std::fs::create_dir_all(&pref_dir)?;
    std::fs::write(pref_dir.join("autoconfig.js"), AUTOCONFIG_JS)?;
    std::fs::write(browser_dir.join("mozilla.cfg"), MOZILLA_CFG)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(version: &str, arch: &str) -> Manifest {
        Manifest::new("/nonexistent", version, arch, "release", "en-US")
    }

    #[test]
    fn test_update_urls_prefer_onion() {
        let urls = update_urls(&manifest("11.0.4", "linux64")).unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains(".onion/"));
        assert!(urls[1].starts_with("https://aus1.torproject.org/"));
        assert!(urls[0].contains("/release/Linux_x86_64-gcc3/11.0.4/en-US/update.xml"));
    }

    #[test]
    fn test_update_urls_linux32() {
        let urls = update_urls(&manifest("11.0.4", "linux32")).unwrap();
        assert!(urls[1].contains("/Linux_x86-gcc3/"));
    }

    #[test]
    fn test_update_urls_unknown_arch() {
        let err = update_urls(&manifest("11.0.4", "armhf")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform(_)));
    }

    #[test]
    fn test_stage_update_layout() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let install = root.path().join("tor-browser");
        std::fs::create_dir_all(install.join("Browser")).unwrap();
        std::fs::write(install.join("Browser/updater"), b"#!/bin/true\n").unwrap();
        std::fs::set_permissions(
            install.join("Browser/updater"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let staging = root.path().join("update");
        stage_update(&staging, &install, b"MAR1").unwrap();

        assert_eq!(std::fs::read(staging.join("update.mar")).unwrap(), b"MAR1");
        let mode = std::fs::metadata(staging.join("updater"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755, "updater must stay executable");
    }

    #[test]
    fn test_write_autoconfig() {
        let root = tempfile::tempdir().unwrap();
        write_autoconfig(root.path()).unwrap();
        let js = std::fs::read(root.path().join("Browser/defaults/pref/autoconfig.js")).unwrap();
        assert!(js.starts_with(b"//"));
        let cfg = std::fs::read(root.path().join("Browser/mozilla.cfg")).unwrap();
        assert!(cfg.starts_with(b"//"));
    }
}
