//! The on-disk boot-status protocol.
//!
//! A handful of small files under the metadata root tell the boot loader
//! whether to boot the original system, boot the installed image (maybe
//! only once), or reclaim a failed installation. The daemon writes them;
//! first-stage boot reads them and additionally maintains the `booted`
//! indicator that tells us which world we woke up in.

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::paths::{slot_name, Layout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Installed, not yet confirmed to have booted. The literal file
    /// contents are `"0"`.
    Installed,
    /// Installed and confirmed good.
    Ok,
    /// Retained on disk but not booted.
    Disabled,
    /// Cleanup pending at the next startup outside the installed image.
    Wipe,
}

impl InstallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallStatus::Installed => "0",
            InstallStatus::Ok => "ok",
            InstallStatus::Disabled => "disabled",
            InstallStatus::Wipe => "wipe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "0" => Some(InstallStatus::Installed),
            "ok" => Some(InstallStatus::Ok),
            "disabled" => Some(InstallStatus::Disabled),
            "wipe" => Some(InstallStatus::Wipe),
            _ => None,
        }
    }
}

/// Write `contents` to `path` and sync it; these files are boot
/// indicators, so they must be durable before we report success.
fn write_sync(path: &Utf8Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    let mut file = File::create(path).with_context(|| format!("Creating {path}"))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Writing {path}"))?;
    file.sync_all().with_context(|| format!("Syncing {path}"))?;
    Ok(())
}

fn remove_if_exists(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {path}")),
    }
}

#[derive(Debug, Clone)]
pub struct BootStatus {
    layout: Layout,
}

impl BootStatus {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn read_status(&self) -> Option<InstallStatus> {
        let contents = std::fs::read_to_string(self.layout.install_status_file()).ok()?;
        InstallStatus::parse(&contents)
    }

    /// The actual boot indicator; ordering matters, so callers write this
    /// file last.
    #[context("Writing install status")]
    pub fn write_status(&self, status: InstallStatus) -> Result<()> {
        write_sync(&self.layout.install_status_file(), status.as_str())
    }

    /// An installation exists iff the status file does.
    pub fn is_installed(&self) -> bool {
        self.layout.install_status_file().exists()
    }

    /// Whether we are currently booted into the installed image.
    pub fn is_running(&self) -> bool {
        self.layout.booted_indicator_file().exists()
    }

    pub fn one_shot_armed(&self) -> bool {
        self.layout.one_shot_file().exists()
    }

    /// Arm or disarm single-boot mode.
    #[context("Setting boot mode")]
    pub fn set_one_shot(&self, one_shot: bool) -> Result<()> {
        let path = self.layout.one_shot_file();
        if one_shot {
            write_sync(&path, "1")
        } else {
            remove_if_exists(&path)
        }
    }

    #[context("Recording install directory")]
    pub fn save_install_dir(&self, install_dir: &Utf8Path) -> Result<()> {
        write_sync(&self.layout.install_dir_file(), install_dir.as_str())
    }

    /// The directory recorded by the last `open_install`, if any.
    pub fn installed_image_dir(&self) -> Option<Utf8PathBuf> {
        let contents = std::fs::read_to_string(self.layout.install_dir_file()).ok()?;
        let trimmed = contents.trim();
        (!trimmed.is_empty()).then(|| Utf8PathBuf::from(trimmed))
    }

    /// Mark the install in `install_dir` as cleanly finished.
    #[context("Writing completion indication")]
    pub fn mark_complete(&self, install_dir: &Utf8Path) -> Result<()> {
        let slot = slot_name(install_dir)?;
        write_sync(&self.layout.complete_file(&slot), "OK")
    }

    pub fn is_complete(&self, install_dir: &Utf8Path) -> bool {
        let Ok(slot) = slot_name(install_dir) else {
            return false;
        };
        std::fs::read_to_string(self.layout.complete_file(&slot))
            .map(|s| s == "OK")
            .unwrap_or(false)
    }

    pub fn remove_complete(&self, install_dir: &Utf8Path) -> Result<()> {
        let slot = slot_name(install_dir)?;
        remove_if_exists(&self.layout.complete_file(&slot))
    }

    /// Delete every status file belonging to `install_dir`. Idempotent.
    #[context("Removing status files")]
    pub fn remove_status_files(&self, install_dir: &Utf8Path) -> Result<()> {
        remove_if_exists(&self.layout.install_status_file())?;
        remove_if_exists(&self.layout.one_shot_file())?;
        remove_if_exists(&self.layout.install_dir_file())?;
        self.remove_complete(install_dir)?;
        Ok(())
    }

    /// Test/bring-up hook for the indicator first-stage boot maintains.
    pub fn set_running_indicator(&self, running: bool) -> Result<()> {
        let path = self.layout.booted_indicator_file();
        if running {
            write_sync(&path, "1")
        } else {
            remove_if_exists(&path)
        }
    }
}

/// Ensure the metadata root exists; files appear as installs progress.
pub fn ensure_metadata_root(layout: &Layout) -> Result<()> {
    std::fs::create_dir_all(&layout.metadata_root)
        .with_context(|| format!("Creating {}", layout.metadata_root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, BootStatus) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let layout = Layout {
            metadata_root: root.join("metadata"),
            data_root: root.join("data"),
            media_root: root.join("media"),
        };
        std::fs::create_dir_all(&layout.metadata_root).unwrap();
        (dir, BootStatus::new(layout))
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(InstallStatus::parse("0"), Some(InstallStatus::Installed));
        assert_eq!(InstallStatus::parse("ok\n"), Some(InstallStatus::Ok));
        assert_eq!(InstallStatus::parse("disabled"), Some(InstallStatus::Disabled));
        assert_eq!(InstallStatus::parse("wipe"), Some(InstallStatus::Wipe));
        assert_eq!(InstallStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_roundtrip() {
        let (_dir, boot) = fixture();
        assert!(!boot.is_installed());
        assert_eq!(boot.read_status(), None);

        boot.write_status(InstallStatus::Installed).unwrap();
        assert!(boot.is_installed());
        assert_eq!(boot.read_status(), Some(InstallStatus::Installed));

        boot.write_status(InstallStatus::Disabled).unwrap();
        assert_eq!(boot.read_status(), Some(InstallStatus::Disabled));
    }

    #[test]
    fn test_one_shot() {
        let (_dir, boot) = fixture();
        assert!(!boot.one_shot_armed());
        boot.set_one_shot(true).unwrap();
        assert!(boot.one_shot_armed());
        boot.set_one_shot(false).unwrap();
        assert!(!boot.one_shot_armed());
        // Disarming twice is fine.
        boot.set_one_shot(false).unwrap();
    }

    #[test]
    fn test_install_dir_and_complete() {
        let (_dir, boot) = fixture();
        let install_dir = Utf8PathBuf::from("/data/gsi/dsu/");
        assert_eq!(boot.installed_image_dir(), None);
        boot.save_install_dir(&install_dir).unwrap();
        assert_eq!(boot.installed_image_dir(), Some(install_dir.clone()));

        assert!(!boot.is_complete(&install_dir));
        boot.mark_complete(&install_dir).unwrap();
        assert!(boot.is_complete(&install_dir));

        boot.remove_status_files(&install_dir).unwrap();
        assert!(!boot.is_installed());
        assert!(!boot.is_complete(&install_dir));
        assert_eq!(boot.installed_image_dir(), None);
        // Idempotent.
        boot.remove_status_files(&install_dir).unwrap();
    }
}
