use std::path::Path;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::manifest::UpdateInfo;

/// What the host has to do once the installer has been handed the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallOutcome {
    /// The installer runs out of process and replaces the app; quit now.
    ExitForInstaller,
    /// The new build is in place; relaunch the app.
    RestartRequired,
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, artifact: &Path, info: &UpdateInfo)
    -> Result<InstallOutcome, UpdateError>;
}

/// Hands the verified artifact to the operating system. The NSIS installer
/// runs silently on Windows. A running AppImage is swapped in place. Disk
/// images and packages are opened with the desktop's default handler.
#[derive(Debug, Clone, Default)]
pub struct PlatformInstaller;

#[async_trait]
impl Installer for PlatformInstaller {
    async fn install(
        &self,
        artifact: &Path,
        info: &UpdateInfo,
    ) -> Result<InstallOutcome, UpdateError> {
        if !artifact.is_file() {
            return Err(UpdateError::install(
                format!("installer {} is missing", artifact.display()),
                None,
            ));
        }

        info!("Installing {} from {}", info.version, artifact.display());
        launch(artifact)
    }
}

#[cfg(target_os = "windows")]
fn launch(artifact: &Path) -> Result<InstallOutcome, UpdateError> {
    std::process::Command::new(artifact)
        .args(["--updated", "/S"])
        .spawn()
        .map_err(|error| UpdateError::install("failed to launch installer", Some(error)))?;

    Ok(InstallOutcome::ExitForInstaller)
}

#[cfg(target_os = "macos")]
fn launch(artifact: &Path) -> Result<InstallOutcome, UpdateError> {
    open::that_detached(artifact)
        .map_err(|error| UpdateError::install("failed to open installer", Some(error)))?;

    Ok(InstallOutcome::ExitForInstaller)
}

#[cfg(target_os = "linux")]
fn launch(artifact: &Path) -> Result<InstallOutcome, UpdateError> {
    if is_appimage(artifact)
        && let Some(target) = std::env::var_os("APPIMAGE")
    {
        replace_appimage(artifact, Path::new(&target))?;
        return Ok(InstallOutcome::RestartRequired);
    }

    open::that_detached(artifact)
        .map_err(|error| UpdateError::install("failed to open installer", Some(error)))?;

    Ok(InstallOutcome::ExitForInstaller)
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn launch(artifact: &Path) -> Result<InstallOutcome, UpdateError> {
    Err(UpdateError::install(
        format!(
            "no installer handoff on this platform for {}",
            artifact.display()
        ),
        None,
    ))
}

#[cfg(target_os = "linux")]
fn is_appimage(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("appimage"))
}

/// Swap the running AppImage for the downloaded one. The copy lands next to
/// the target first so the final rename stays on one filesystem.
#[cfg(target_os = "linux")]
fn replace_appimage(artifact: &Path, target: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;

    let staged = target.with_extension("AppImage.new");
    std::fs::copy(artifact, &staged)
        .map_err(|error| UpdateError::install("failed to stage AppImage", Some(error)))?;
    std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
        .map_err(|error| UpdateError::install("failed to mark AppImage executable", Some(error)))?;

    if let Err(error) = std::fs::rename(&staged, target) {
        let _ = std::fs::remove_file(&staged);
        return Err(UpdateError::install("failed to replace AppImage", Some(error)));
    }

    info!("Replaced AppImage at {}", target.display());
    Ok(())
}

#[cfg(target_os = "macos")]
fn current_app_bundle() -> Result<std::path::PathBuf, UpdateError> {
    let exe = std::env::current_exe()
        .map_err(|error| UpdateError::io("failed to get current executable", error))?;
    exe.ancestors()
        .find(|path| path.extension().is_some_and(|ext| ext == "app"))
        .map(Path::to_path_buf)
        .ok_or_else(|| UpdateError::install("not running from an app bundle", None))
}

#[cfg(target_os = "macos")]
/// Relaunch the current application bundle.
///
/// # Errors
/// Returns an error if the running app bundle cannot be located or reopened.
pub fn restart_app() -> Result<(), UpdateError> {
    let bundle = current_app_bundle()?;
    std::process::Command::new("open")
        .args(["-n", &bundle.to_string_lossy()])
        .spawn()
        .map_err(|error| UpdateError::io("failed to restart app", error))?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
/// Relaunch the current executable.
///
/// # Errors
/// Returns an error if the current executable path cannot be resolved or a new
/// process cannot be spawned.
pub fn restart_app() -> Result<(), UpdateError> {
    let exe = std::env::current_exe()
        .map_err(|error| UpdateError::io("failed to get current executable", error))?;

    // An installer that replaced the binary leaves /proc/self/exe pointing at
    // the deleted inode.
    #[cfg(target_os = "linux")]
    let exe = match exe.to_str().and_then(|path| path.strip_suffix(" (deleted)")) {
        Some(live) => std::path::PathBuf::from(live),
        None => exe,
    };

    info!("Restarting from: {}", exe.display());
    std::process::Command::new(&exe)
        .spawn()
        .map_err(|error| UpdateError::io("failed to restart app", error))?;
    Ok(())
}
