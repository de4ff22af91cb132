use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use dsid_utils::CommandRunExt;

/// Exposing a regular file as a block device without a device-mapper
/// layer. Used as the fallback mapping backend.
pub trait LoopBackend: Send + Sync {
    /// Attach `file` to a free loop device and return its path.
    fn attach(&self, file: &Utf8Path) -> Result<Utf8PathBuf>;

    /// Detach the loop device at `dev`.
    fn detach(&self, dev: &Utf8Path) -> Result<()>;

    /// The loop device currently backed by `file`, if any.
    fn find(&self, file: &Utf8Path) -> Result<Option<Utf8PathBuf>>;
}

/// Production loopback capability shelling out to `losetup`.
#[derive(Debug, Default)]
pub struct LosetupCli {}

#[derive(Debug, Deserialize)]
struct LosetupOutput {
    loopdevices: Vec<LosetupDevice>,
}

#[derive(Debug, Deserialize)]
struct LosetupDevice {
    name: String,
}

impl LoopBackend for LosetupCli {
    fn attach(&self, file: &Utf8Path) -> Result<Utf8PathBuf> {
        let dev = Command::new("losetup")
            .args(["--show", "--find"])
            .arg(file)
            .log_debug()
            .run_get_string()
            .with_context(|| format!("Attaching loopback for {file}"))?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev}");
        Ok(dev)
    }

    fn detach(&self, dev: &Utf8Path) -> Result<()> {
        Command::new("losetup")
            .arg("-d")
            .arg(dev)
            .run_capture_stderr()
            .with_context(|| format!("Detaching {dev}"))
    }

    fn find(&self, file: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
        let o: LosetupOutput = Command::new("losetup")
            .args(["-J", "-j"])
            .arg(file)
            .run_and_parse_json()
            .unwrap_or(LosetupOutput {
                loopdevices: Vec::new(),
            });
        Ok(o.loopdevices.into_iter().next().map(|d| d.name.into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_losetup() {
        let fixture = r#"{"loopdevices": [{"name":"/dev/loop7","back-file":"/data/gsi/dsu/system_gsi.img"}]}"#;
        let o: LosetupOutput = serde_json::from_str(fixture).unwrap();
        assert_eq!(o.loopdevices[0].name, "/dev/loop7");
    }
}
