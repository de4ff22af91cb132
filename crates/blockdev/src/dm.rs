use std::fmt::Write as _;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use dsid_utils::CommandRunExt;

use crate::Extent;

/// How long `destroy` waits for the kernel to release a busy device
/// before giving up.
pub const DESTROY_DEADLINE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Publishing a list of extents of an existing block device as a named
/// virtual block device. The ioctl layer is external; production wraps
/// `dmsetup`.
pub trait DeviceMapper: Send + Sync {
    /// Create device `name` mapping `extents` of `base` linearly, waiting
    /// up to `timeout` for the device node to appear. A zero timeout is a
    /// best-effort immediate return.
    fn create_linear(
        &self,
        name: &str,
        base: &Utf8Path,
        extents: &[Extent],
        timeout: Duration,
    ) -> Result<Utf8PathBuf>;

    /// Tear down device `name`, waiting up to [`DESTROY_DEADLINE`] for the
    /// kernel to release it. With `force`, failures are logged and
    /// swallowed; teardown paths must not error out.
    fn destroy(&self, name: &str, force: bool) -> Result<()>;

    /// The device node for `name`, if it is currently mapped.
    fn find(&self, name: &str) -> Result<Option<Utf8PathBuf>>;

    /// Whether this backend can map extents of `base` at all. False when
    /// `base` is not a block device or the mapper tooling is unavailable,
    /// in which case callers fall back to loopback.
    fn supports(&self, base: &Utf8Path) -> bool;

    /// Human-readable dump of every mapper device and its table.
    fn dump(&self) -> Result<String>;
}

/// Render a linear target table, one `<start> <len> linear <dev> <sector>`
/// line per extent.
pub fn render_linear_table(base: &Utf8Path, extents: &[Extent]) -> String {
    let mut table = String::new();
    let mut logical = 0u64;
    for extent in extents {
        let _ = writeln!(
            table,
            "{logical} {count} linear {base} {phys}",
            count = extent.sector_count,
            phys = extent.physical_sector
        );
        logical += extent.sector_count;
    }
    table
}

/// Production device-mapper capability shelling out to `dmsetup`.
#[derive(Debug, Default)]
pub struct DmCli {}

impl DmCli {
    fn device_node(name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/dev/mapper/{name}"))
    }

    #[context("Creating device-mapper table for {name}")]
    fn dmsetup_create(&self, name: &str, table: &str) -> Result<()> {
        let mut child = Command::new("dmsetup")
            .args(["create", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Spawning dmsetup")?;
        // SAFETY: Piped above
        child
            .stdin
            .take()
            .unwrap()
            .write_all(table.as_bytes())
            .context("Writing table to dmsetup")?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(anyhow!(
                "dmsetup create {name} failed: {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

impl DeviceMapper for DmCli {
    fn create_linear(
        &self,
        name: &str,
        base: &Utf8Path,
        extents: &[Extent],
        timeout: Duration,
    ) -> Result<Utf8PathBuf> {
        let table = render_linear_table(base, extents);
        tracing::debug!("mapping {name} over {base}:\n{table}");
        self.dmsetup_create(name, &table)?;
        let node = Self::device_node(name);
        let deadline = Instant::now() + timeout;
        while !node.exists() {
            if Instant::now() >= deadline {
                if timeout.is_zero() {
                    break;
                }
                self.destroy(name, true)?;
                return Err(anyhow!("timed out waiting for {node}"));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(node)
    }

    fn destroy(&self, name: &str, force: bool) -> Result<()> {
        let deadline = Instant::now() + DESTROY_DEADLINE;
        loop {
            let r = Command::new("dmsetup")
                .args(["remove", name])
                .log_debug()
                .run_capture_stderr();
            let e = match r {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.find(name)?.is_none() {
                // Whatever the removal race was, the device is gone.
                return Ok(());
            }
            if Instant::now() < deadline {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            if force {
                tracing::warn!("ignoring failure to remove {name}: {e}");
                return Ok(());
            }
            return Err(e.context(format!("Removing device {name}")));
        }
    }

    fn find(&self, name: &str) -> Result<Option<Utf8PathBuf>> {
        let node = Self::device_node(name);
        Ok(node.exists().then_some(node))
    }

    fn supports(&self, base: &Utf8Path) -> bool {
        use std::os::unix::fs::FileTypeExt;
        let is_blockdev = std::fs::metadata(base)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        is_blockdev
            && Command::new("dmsetup")
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
    }

    fn dump(&self) -> Result<String> {
        Command::new("dmsetup")
            .args(["table"])
            .run_get_string()
            .context("Listing device-mapper tables")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_linear_table() {
        let extents = [
            Extent {
                physical_sector: 34816,
                sector_count: 2048,
            },
            Extent {
                physical_sector: 98304,
                sector_count: 512,
            },
        ];
        let table = render_linear_table("/dev/sda2".into(), &extents);
        assert_eq!(
            table,
            "0 2048 linear /dev/sda2 34816\n2048 512 linear /dev/sda2 98304\n"
        );
    }
}
