//! The per-partition installation session.
//!
//! A session walks `Open -> Preallocated -> Streaming -> Finalized`,
//! aborting to `Aborted` from anywhere. It owns the mapped device while
//! streaming; dropping a session that did not finalize unwinds the whole
//! installation so a failed install leaves the host wipable-clean.

use std::io::Read;
use std::sync::Arc;

use anyhow::anyhow;
use camino::Utf8Path;
use fn_error_context::context;

use crate::imagestore::{Backends, ImageError, ImageResult, ImageStore, MAP_TIMEOUT};
use crate::paths::{slot_name, Layout, IMAGE_SUFFIX};
use crate::progress::{ProgressStatus, ProgressTracker};
use crate::status::BootStatus;
use crate::table::PartitionFlags;
use crate::writer::PartitionWriter;

/// We want the data filesystem to keep this much slack after an install.
const MIN_FREE_SPACE_PERCENT: u64 = 40;

/// Fixed block size for draining a client stream.
const STREAM_BLOCK_SIZE: usize = 4096;

/// Writable partitions get this much of their head zeroed so any stale
/// filesystem superblock is gone.
const FORMAT_HEAD_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct InstallParams {
    pub install_dir: camino::Utf8PathBuf,
    pub name: String,
    pub size: u64,
    pub read_only: bool,
    pub wipe: bool,
}

/// Session policy knobs owned by the service.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionOptions {
    pub min_free_percent: u64,
    /// Whether a failed install may also delete userdata. False when a
    /// userdata image predates this install and the caller did not ask
    /// for a wipe.
    pub wipe_userdata_on_failure: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            min_free_percent: MIN_FREE_SPACE_PERCENT,
            wipe_userdata_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Preallocated,
    Streaming,
    Finalized,
    Aborted,
}

pub(crate) struct InstallSession {
    layout: Layout,
    backends: Backends,
    boot: BootStatus,
    images: ImageStore,
    params: InstallParams,
    image_name: String,
    min_free_percent: u64,
    state: SessionState,
    bytes_written: u64,
    last_permille: u64,
    writer: Option<PartitionWriter>,
    progress: Arc<ProgressTracker>,
    wipe_on_failure: bool,
    succeeded: bool,
}

/// The free-space policy, separated out so the arithmetic is testable
/// with literal values.
pub(crate) fn check_free_space(
    free: u64,
    total: u64,
    needed: u64,
    min_percent: u64,
) -> ImageResult<()> {
    if free <= needed {
        tracing::error!("not enough free space (only {free} bytes available)");
        return Err(ImageError::NoSpace);
    }
    let percent = if total == 0 { 0 } else { free * 100 / total };
    if percent < min_percent {
        tracing::error!("free space {percent}% is below the minimum threshold of {min_percent}%");
        return Err(ImageError::Cluttered);
    }
    Ok(())
}

impl InstallSession {
    pub(crate) fn new(
        layout: Layout,
        backends: Backends,
        params: InstallParams,
        progress: Arc<ProgressTracker>,
        options: SessionOptions,
    ) -> ImageResult<Self> {
        let slot = slot_name(&params.install_dir).map_err(ImageError::Failed)?;
        let metadata_dir = layout.slot_metadata_dir(&slot);
        std::fs::create_dir_all(&metadata_dir)?;
        let images = ImageStore::open(metadata_dir, params.install_dir.clone(), backends.clone())?;
        let boot = BootStatus::new(layout.clone());
        let image_name = format!("{}{IMAGE_SUFFIX}", params.name);
        let wipe_on_failure = options.wipe_userdata_on_failure || params.wipe;
        Ok(Self {
            layout,
            backends,
            boot,
            images,
            params,
            image_name,
            min_free_percent: options.min_free_percent,
            state: SessionState::Open,
            bytes_written: 0,
            last_permille: 0,
            writer: None,
            progress,
            wipe_on_failure,
            succeeded: false,
        })
    }

    pub(crate) fn install_dir(&self) -> &Utf8Path {
        &self.params.install_dir
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state == SessionState::Finalized
    }

    /// Run the whole preamble: sanity checks, preallocation, and opening
    /// the writer. Read-only partitions come out in `Streaming`; writable
    /// ones are formatted and finish immediately.
    pub(crate) fn start(&mut self) -> ImageResult<()> {
        self.sanity_checks()?;
        self.preallocate()?;
        self.open_writer()?;
        // Clear the indicator; streaming restarts it.
        self.progress.update(ProgressStatus::NoOperation, 0);
        Ok(())
    }

    fn sanity_checks(&self) -> ImageResult<()> {
        if self.params.size == 0 {
            return Err(anyhow!("partition size must not be zero").into());
        }
        if self.boot.is_running() {
            return Err(anyhow!("cannot install an image inside a live installed image").into());
        }
        let stats = rustix::fs::statvfs(self.params.install_dir.as_std_path())
            .map_err(|e| anyhow!("statvfs of {}: {e}", self.params.install_dir))?;
        let free = stats.f_bavail * stats.f_frsize;
        let total = stats.f_blocks * stats.f_frsize;
        check_free_space(free, total, self.params.size, self.min_free_percent)
    }

    fn preallocate(&mut self) -> ImageResult<()> {
        let is_userdata = self.params.name == "userdata";
        if is_userdata && self.params.wipe {
            self.images.delete_backing_image(&self.image_name)?;
        }

        if self.images.backing_image_exists(&self.image_name) {
            if is_userdata {
                // Reuse the existing userdata; growing it in place is not
                // supported, wipe first to change the size.
                let existing = self.images.image_size(&self.image_name)?;
                if existing < self.params.size {
                    return Err(anyhow!(
                        "existing userdata image is {existing} bytes, {} requested; \
                         wipe to resize",
                        self.params.size
                    )
                    .into());
                }
                self.state = SessionState::Preallocated;
                return Ok(());
            }
            self.images.delete_backing_image(&self.image_name)?;
        }

        self.progress
            .start_operation(&format!("create {}", self.params.name), self.params.size);
        let progress = self.progress.clone();
        let mut on_progress = |done: u64, _total: u64| {
            progress.update(ProgressStatus::Working, done);
            !progress.should_abort()
        };
        let mut flags = PartitionFlags::default();
        if self.params.read_only {
            flags.insert(PartitionFlags::READONLY);
        }
        self.images
            .create_backing_image(&self.image_name, self.params.size, flags, &mut on_progress)?;
        self.progress.update(ProgressStatus::Complete, 0);
        self.state = SessionState::Preallocated;
        Ok(())
    }

    fn open_writer(&mut self) -> ImageResult<()> {
        let mut writer = self.images.open_partition_writer(&self.image_name, MAP_TIMEOUT)?;
        if self.params.read_only {
            self.writer = Some(writer);
            self.state = SessionState::Streaming;
            return Ok(());
        }
        // Writable partition: no byte stream follows. Knock out any stale
        // superblock and call the partition done.
        let head = FORMAT_HEAD_BYTES.min(writer.size());
        write_zeros(&mut writer, head)?;
        writer.flush()?;
        writer.close()?;
        self.state = SessionState::Finalized;
        self.succeeded = true;
        Ok(())
    }

    /// Append `data` to the streamed partition.
    pub(crate) fn write_chunk(&mut self, data: &[u8]) -> ImageResult<()> {
        if self.state != SessionState::Streaming {
            return Err(anyhow!("no partition is open for streaming").into());
        }
        if data.len() as u64 > self.params.size - self.bytes_written {
            return Err(anyhow!(
                "chunk of {} bytes exceeds remaining image size ({} expected, {} written)",
                data.len(),
                self.params.size,
                self.bytes_written
            )
            .into());
        }
        if self.progress.should_abort() {
            return Err(ImageError::Aborted);
        }
        // SAFETY: the writer exists in Streaming state
        self.writer.as_mut().unwrap().write(data)?;
        self.bytes_written += data.len() as u64;

        // Only bump the shared record when the permille changes.
        let permille = self.bytes_written * 1000 / self.params.size;
        if permille != self.last_permille {
            self.last_permille = permille;
            self.progress
                .update(ProgressStatus::Working, self.bytes_written);
        }
        Ok(())
    }

    /// Drain exactly `bytes` from `stream` into the partition, in fixed
    /// blocks. EOF before `bytes` is an error.
    pub(crate) fn commit_from_stream(
        &mut self,
        stream: &mut dyn Read,
        bytes: u64,
    ) -> ImageResult<()> {
        self.progress.start_operation("write gsi", self.params.size);
        self.progress
            .update(ProgressStatus::Working, self.bytes_written);
        let mut buffer = [0u8; STREAM_BLOCK_SIZE];
        let mut remaining = bytes;
        while remaining > 0 {
            let max_to_read = remaining.min(STREAM_BLOCK_SIZE as u64) as usize;
            let n = match stream.read(&mut buffer[..max_to_read]) {
                Ok(0) => return Err(anyhow!("no bytes left in stream").into()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_chunk(&buffer[..n])?;
            remaining -= n as u64;
        }
        if self.bytes_written == self.params.size {
            self.progress
                .update(ProgressStatus::Complete, self.params.size);
        }
        Ok(())
    }

    /// Make the streamed install bootable. Ordering is load-bearing: the
    /// status file is the actual boot indicator and is written last.
    pub(crate) fn finalize(&mut self, one_shot: bool) -> ImageResult<()> {
        if self.state != SessionState::Streaming || self.bytes_written != self.params.size {
            return Err(anyhow!(
                "image incomplete; expected {} bytes, got {}",
                self.params.size,
                self.bytes_written
            )
            .into());
        }
        // SAFETY: the writer exists in Streaming state
        let mut writer = self.writer.take().unwrap();
        writer.flush()?;
        writer.close()?;

        if !self.images.validate() {
            return Err(anyhow!("backing image extents moved after write").into());
        }

        self.boot
            .save_install_dir(&self.params.install_dir)
            .map_err(ImageError::Failed)?;
        self.boot.set_one_shot(one_shot).map_err(ImageError::Failed)?;
        self.boot
            .write_status(crate::status::InstallStatus::Installed)
            .map_err(ImageError::Failed)?;
        self.state = SessionState::Finalized;
        self.succeeded = true;
        Ok(())
    }

    fn unwind(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                tracing::warn!("releasing writer during unwind: {e}");
            }
        }
        if let Err(e) = remove_gsi_files(
            &self.layout,
            &self.backends,
            &self.params.install_dir,
            self.wipe_on_failure,
        ) {
            tracing::error!("unwinding failed install: {e}");
        }
        self.state = SessionState::Aborted;
    }
}

impl Drop for InstallSession {
    fn drop(&mut self) {
        if !self.succeeded {
            self.unwind();
        }
    }
}

fn write_zeros(writer: &mut PartitionWriter, bytes: u64) -> ImageResult<()> {
    let block = [0u8; STREAM_BLOCK_SIZE];
    let mut remaining = bytes;
    while remaining > 0 {
        let n = remaining.min(STREAM_BLOCK_SIZE as u64) as usize;
        writer.write(&block[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Remove the images and status files of the installation in
/// `install_dir`. Only images carrying the installer's name suffix are
/// touched; userdata survives unless `wipe_userdata` is set.
#[context("Removing installed files from {install_dir}")]
pub(crate) fn remove_gsi_files(
    layout: &Layout,
    backends: &Backends,
    install_dir: &Utf8Path,
    wipe_userdata: bool,
) -> anyhow::Result<()> {
    let slot = slot_name(install_dir)?;
    let metadata_dir = layout.slot_metadata_dir(&slot);
    let mut ok = true;
    if metadata_dir.is_dir() && install_dir.is_dir() {
        let images = ImageStore::open(metadata_dir, install_dir.to_owned(), backends.clone())?;
        for image in images.all_backing_images() {
            if !image.ends_with(IMAGE_SUFFIX) {
                continue;
            }
            if !wipe_userdata && image == format!("userdata{IMAGE_SUFFIX}") {
                continue;
            }
            if let Err(e) = images.delete_backing_image(&image) {
                tracing::error!("deleting {image}: {e}");
                ok = false;
            }
        }
    }
    let boot = BootStatus::new(layout.clone());
    if let Err(e) = boot.remove_status_files(install_dir) {
        tracing::error!("{e}");
        ok = false;
    }
    if !ok {
        anyhow::bail!("some installed files could not be removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsid_blockdev::testutil::FakeBlockWorld;

    const MIB: u64 = 1024 * 1024;

    fn fixture() -> (tempfile::TempDir, Layout, Backends, Arc<ProgressTracker>) {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let layout = Layout {
            metadata_root: root.join("metadata"),
            data_root: root.join("data"),
            media_root: root.join("media"),
        };
        std::fs::create_dir_all(&layout.metadata_root).unwrap();
        std::fs::create_dir_all(layout.data_root.join("dsu")).unwrap();
        let backends = Backends::fake(Arc::new(FakeBlockWorld::new()));
        (dir, layout, backends, Arc::new(ProgressTracker::new()))
    }

    fn session(
        layout: &Layout,
        backends: &Backends,
        progress: &Arc<ProgressTracker>,
        name: &str,
        size: u64,
        read_only: bool,
        wipe: bool,
    ) -> ImageResult<InstallSession> {
        InstallSession::new(
            layout.clone(),
            backends.clone(),
            InstallParams {
                install_dir: layout.data_root.join("dsu"),
                name: name.into(),
                size,
                read_only,
                wipe,
            },
            progress.clone(),
            SessionOptions {
                min_free_percent: 0,
                wipe_userdata_on_failure: false,
            },
        )
    }

    #[test]
    fn test_userdata_reuse_and_resize_refusal() {
        let (_dir, layout, backends, progress) = fixture();

        let mut s = session(&layout, &backends, &progress, "userdata", MIB, false, false).unwrap();
        s.start().unwrap();
        assert!(s.is_finalized());
        drop(s);
        let userdata = layout.data_root.join("dsu/userdata_gsi.img");
        assert!(userdata.exists());

        // Same size again: the existing image is reused.
        let mut s = session(&layout, &backends, &progress, "userdata", MIB, false, false).unwrap();
        s.start().unwrap();
        assert!(userdata.exists());

        // A larger request without a wipe is refused, not resized.
        let mut s =
            session(&layout, &backends, &progress, "userdata", 2 * MIB, false, false).unwrap();
        assert!(s.start().is_err());
        drop(s);

        // With a wipe the image is recreated at the new size.
        std::fs::create_dir_all(layout.data_root.join("dsu")).unwrap();
        let mut s = session(&layout, &backends, &progress, "userdata", 2 * MIB, false, true).unwrap();
        s.start().unwrap();
        assert_eq!(std::fs::metadata(&userdata).unwrap().len(), 2 * MIB);
    }

    #[test]
    fn test_partial_stream_unwinds_on_drop() {
        let (_dir, layout, backends, progress) = fixture();
        let mut s = session(&layout, &backends, &progress, "system", MIB, true, false).unwrap();
        s.start().unwrap();
        s.write_chunk(&[0xaa; 4096]).unwrap();
        assert_eq!(s.bytes_written(), 4096);
        assert!(!s.is_finalized());
        drop(s);
        assert!(!layout.data_root.join("dsu/system_gsi.img").exists());
        assert!(!layout.install_status_file().exists());
    }

    #[test]
    fn test_finalize_requires_all_bytes() {
        let (_dir, layout, backends, progress) = fixture();
        let mut s = session(&layout, &backends, &progress, "system", MIB, true, false).unwrap();
        s.start().unwrap();
        s.write_chunk(&[0u8; 4096]).unwrap();
        assert!(s.finalize(false).is_err());
    }

    #[test]
    fn test_check_free_space() {
        let gib = 1024 * 1024 * 1024;
        // Plenty of room.
        check_free_space(50 * gib, 100 * gib, gib, 40).unwrap();
        // Not enough bytes at all.
        assert!(matches!(
            check_free_space(gib, 100 * gib, 2 * gib, 40),
            Err(ImageError::NoSpace)
        ));
        // Enough bytes but the filesystem would end up too full: a
        // filesystem with 30% free refuses large images.
        assert!(matches!(
            check_free_space(30 * gib, 100 * gib, 10 * gib, 40),
            Err(ImageError::Cluttered)
        ));
        // Threshold of zero disables the percentage policy.
        check_free_space(30 * gib, 100 * gib, 10 * gib, 0).unwrap();
    }
}
