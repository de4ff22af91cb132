//! The stable on-disk layout shared with the boot loader.

use camino::{Utf8Path, Utf8PathBuf};

/// Default socket the daemon listens on.
pub const DEFAULT_SOCKET: &str = "/run/dsid/dsid.sock";

/// Where installations live unless the caller picks removable storage.
pub const DEFAULT_IMAGE_DIR: &str = "/data/gsi/dsu/";

/// Metadata root holding the boot-status protocol files.
pub const DEFAULT_METADATA_ROOT: &str = "/metadata/gsi/dsu";

/// Parent of all installation directories on internal storage.
pub const DEFAULT_DATA_ROOT: &str = "/data/gsi";

/// Mount root for removable media; installs here are allowed when the
/// medium checks out.
pub const MEDIA_ROOT: &str = "/mnt/media_rw";

/// Name suffix of every backing image the installer owns. Cleanup paths
/// only ever touch images carrying this suffix.
pub const IMAGE_SUFFIX: &str = "_gsi";

/// Default size of the writable userdata image, used when the client
/// passes zero.
pub const DEFAULT_USERDATA_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// The filesystem locations the daemon reads and writes. Everything is
/// derived from three roots so tests can point the whole daemon at a
/// scratch directory.
#[derive(Debug, Clone)]
pub struct Layout {
    pub metadata_root: Utf8PathBuf,
    pub data_root: Utf8PathBuf,
    pub media_root: Utf8PathBuf,
}

impl Layout {
    pub fn system() -> Self {
        Self {
            metadata_root: DEFAULT_METADATA_ROOT.into(),
            data_root: DEFAULT_DATA_ROOT.into(),
            media_root: MEDIA_ROOT.into(),
        }
    }

    /// The default installation directory, with trailing slash.
    pub fn default_image_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}/dsu/", self.data_root))
    }

    /// `install_status` holds the boot indicator; see [`crate::status`].
    pub fn install_status_file(&self) -> Utf8PathBuf {
        self.metadata_root.join("install_status")
    }

    /// Presence of `one_shot` arms single-boot mode.
    pub fn one_shot_file(&self) -> Utf8PathBuf {
        self.metadata_root.join("one_shot")
    }

    /// `install_dir` records the active installation directory.
    pub fn install_dir_file(&self) -> Utf8PathBuf {
        self.metadata_root.join("install_dir")
    }

    /// Presence of `booted` means we are currently running the installed
    /// image; first-stage boot writes it, we only read it.
    pub fn booted_indicator_file(&self) -> Utf8PathBuf {
        self.metadata_root.join("booted")
    }

    /// Per-slot metadata directory, holding the partition-table blobs and
    /// the `complete` indication for that install.
    pub fn slot_metadata_dir(&self, slot: &str) -> Utf8PathBuf {
        self.metadata_root.join(slot)
    }

    /// `complete` contains `"OK"` once an install finished cleanly; its
    /// absence at startup marks the install as corrupt.
    pub fn complete_file(&self, slot: &str) -> Utf8PathBuf {
        self.slot_metadata_dir(slot).join("complete")
    }
}

/// The slot name of an installation directory is its final component,
/// e.g. `/data/gsi/dsu/` -> `dsu`.
pub fn slot_name(install_dir: &Utf8Path) -> anyhow::Result<String> {
    Ok(dsid_utils::dir_name(install_dir)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::system();
        assert_eq!(layout.default_image_dir(), "/data/gsi/dsu/");
        assert_eq!(
            layout.install_status_file(),
            "/metadata/gsi/dsu/install_status"
        );
        assert_eq!(layout.complete_file("dsu"), "/metadata/gsi/dsu/dsu/complete");
    }

    #[test]
    fn test_slot_name() {
        assert_eq!(slot_name("/data/gsi/dsu/".into()).unwrap(), "dsu");
        assert_eq!(slot_name("/mnt/media_rw/sd/custom".into()).unwrap(), "custom");
    }
}
