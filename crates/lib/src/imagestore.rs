//! The backing-image catalog.
//!
//! An [`ImageStore`] manages the images under one (metadata dir, data dir)
//! pair: extent-pinned data files, their partition-table blobs, and the
//! block-device mappings publishing them. Mapping prefers the
//! device-mapper backend and falls back to loopback when the host has no
//! usable device-mapper node over the data filesystem.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use dsid_blockdev::testutil::FakeBlockWorld;
use dsid_blockdev::{
    DeviceMapper, ExtentBackend, ExtentError, LoopBackend, MAX_EXTENTS, SECTOR_SIZE,
};

use crate::table::{ImagePart, PartitionEntry, PartitionFlags, PartitionTable};
use crate::writer::SplitFileWriter;

/// How long mapping and teardown helpers wait for device nodes by default.
pub const MAP_TIMEOUT: Duration = Duration::from_secs(10);

const ZERO_BLOCK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid path: {0}")]
    PathInvalid(Utf8PathBuf),
    #[error("not enough free space")]
    NoSpace,
    #[error("backing filesystem is too cluttered")]
    Cluttered,
    #[error("image already exists")]
    AlreadyExists,
    #[error("image not found")]
    NotFound,
    #[error("image is busy")]
    Busy,
    #[error("operation aborted")]
    Aborted,
    #[error("not supported on this host")]
    Unsupported,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<ExtentError> for ImageError {
    fn from(e: ExtentError) -> Self {
        match e {
            ExtentError::NoSpace => ImageError::NoSpace,
            ExtentError::Fragmented(_) => ImageError::Cluttered,
            ExtentError::Io(e) => ImageError::Failed(e.into()),
            ExtentError::Other(e) => ImageError::Failed(e),
        }
    }
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Failed(e.into())
    }
}

pub type ImageResult<T> = Result<T, ImageError>;

/// The block-layer capabilities the store operates through.
#[derive(Clone)]
pub struct Backends {
    pub extents: Arc<dyn ExtentBackend>,
    pub mapper: Arc<dyn DeviceMapper>,
    pub looper: Arc<dyn LoopBackend>,
}

impl Backends {
    /// The production stack: fallocate/filefrag, dmsetup, losetup.
    pub fn system() -> Self {
        Self {
            extents: Arc::new(dsid_blockdev::FilefragBackend::default()),
            mapper: Arc::new(dsid_blockdev::DmCli::default()),
            looper: Arc::new(dsid_blockdev::LosetupCli::default()),
        }
    }

    /// All three capabilities served by one shared fake world.
    pub fn fake(world: Arc<FakeBlockWorld>) -> Self {
        Self {
            extents: world.clone(),
            mapper: world.clone(),
            looper: world,
        }
    }
}

pub struct ImageStore {
    metadata_dir: Utf8PathBuf,
    data_dir: Utf8PathBuf,
    backends: Backends,
}

fn atomic_write(path: &Utf8Path, contents: &[u8]) -> ImageResult<()> {
    let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
    let mut file = File::create(&tmp).with_context(|| format!("Creating {tmp}"))?;
    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path).with_context(|| format!("Renaming {tmp} into place"))?;
    Ok(())
}

impl ImageStore {
    pub fn open(
        metadata_dir: impl Into<Utf8PathBuf>,
        data_dir: impl Into<Utf8PathBuf>,
        backends: Backends,
    ) -> ImageResult<Self> {
        let metadata_dir = metadata_dir.into();
        let data_dir = data_dir.into();
        for dir in [&metadata_dir, &data_dir] {
            if !dir.is_dir() {
                return Err(ImageError::PathInvalid(dir.clone()));
            }
        }
        Ok(Self {
            metadata_dir,
            data_dir,
            backends,
        })
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    fn table_file(&self, name: &str) -> Utf8PathBuf {
        self.metadata_dir.join(format!("{name}.lp"))
    }

    fn part_path(&self, name: &str, index: usize) -> Utf8PathBuf {
        if index == 0 {
            self.data_dir.join(format!("{name}.img"))
        } else {
            self.data_dir.join(format!("{name}.img.{index:04}"))
        }
    }

    fn read_table(&self, name: &str) -> ImageResult<PartitionTable> {
        let path = self.table_file(name);
        let blob = match std::fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        PartitionTable::decode(&blob)
            .map_err(|e| anyhow!(e).context(format!("Decoding table of {name}")).into())
    }

    fn write_table(&self, name: &str, table: &PartitionTable) -> ImageResult<()> {
        atomic_write(&self.table_file(name), &table.encode())
    }

    fn entry(&self, name: &str) -> ImageResult<PartitionEntry> {
        let table = self.read_table(name)?;
        table
            .find(name)
            .cloned()
            .ok_or_else(|| anyhow!("table of {name} has no matching partition").into())
    }

    /// Whether a data file for `name` exists.
    pub fn backing_image_exists(&self, name: &str) -> bool {
        self.part_path(name, 0).exists()
    }

    /// Metadata-only check: a decodable table with an entry for `name`.
    pub fn partition_exists(&self, name: &str) -> bool {
        self.entry(name).is_ok()
    }

    pub fn image_size(&self, name: &str) -> ImageResult<u64> {
        Ok(self.entry(name)?.size)
    }

    pub fn image_flags(&self, name: &str) -> ImageResult<PartitionFlags> {
        Ok(self.entry(name)?.flags)
    }

    /// Every image known to either the catalog or the data directory.
    pub fn all_backing_images(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        if let Ok(entries) = self.metadata_dir.read_dir_utf8() {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().strip_suffix(".lp") {
                    names.insert(name.to_string());
                }
            }
        }
        if let Ok(entries) = self.data_dir.read_dir_utf8() {
            for entry in entries.flatten() {
                if let Some((name, _)) = entry.file_name().split_once(".img") {
                    names.insert(name.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Reserve `size` bytes for `name`, pin the allocation, and persist
    /// its partition table. With `PartitionFlags::ZEROED` the whole image
    /// is zero-filled, reporting progress through `on_progress`; the
    /// callback may return `false` to abort, in which case (as with any
    /// failure) the partial image is deleted.
    pub fn create_backing_image(
        &self,
        name: &str,
        size: u64,
        flags: PartitionFlags,
        on_progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> ImageResult<()> {
        if size == 0 || size % SECTOR_SIZE != 0 {
            return Err(anyhow!("image size {size} is not sector aligned").into());
        }
        if self.backing_image_exists(name) || self.partition_exists(name) {
            return Err(ImageError::AlreadyExists);
        }
        let r = self.create_image_inner(name, size, flags, on_progress);
        if r.is_err() {
            // No partial artifacts survive a failed create.
            if let Err(e) = self.delete_backing_image(name) {
                tracing::warn!("cleanup of partial image {name} failed: {e}");
            }
        }
        r
    }

    fn create_image_inner(
        &self,
        name: &str,
        size: u64,
        flags: PartitionFlags,
        on_progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> ImageResult<()> {
        let raw_max = self.backends.extents.max_file_size(&self.data_dir);
        let max_file = (raw_max - raw_max % SECTOR_SIZE).max(SECTOR_SIZE);
        let mut parts = Vec::new();
        let mut remaining = size;
        let mut extent_total = 0usize;
        while remaining > 0 {
            let part_size = remaining.min(max_file);
            let index = parts.len();
            let path = self.part_path(name, index);
            let extents = self.backends.extents.allocate(&path, part_size)?;
            extent_total += extents.len();
            if extent_total > MAX_EXTENTS {
                return Err(ImageError::Cluttered);
            }
            parts.push(ImagePart {
                // SAFETY: part_path always produces a file name
                file: path.file_name().unwrap().to_string(),
                extents,
            });
            remaining -= part_size;
        }

        if flags.contains(PartitionFlags::ZEROED) {
            self.zero_fill(name, &parts, size, on_progress)?;
        }

        let table = PartitionTable {
            source_device: self.backends.extents.backing_device(&self.data_dir)?,
            sector_size: SECTOR_SIZE as u32,
            partitions: vec![PartitionEntry {
                name: name.to_string(),
                flags,
                size,
                parts,
            }],
        };
        self.write_table(name, &table)
    }

    fn zero_fill(
        &self,
        name: &str,
        parts: &[ImagePart],
        bytes: u64,
        on_progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> ImageResult<()> {
        let mut writer = self.split_writer(name, parts)?;
        let block = [0u8; ZERO_BLOCK];
        let mut done = 0u64;
        while done < bytes {
            let n = (bytes - done).min(ZERO_BLOCK as u64) as usize;
            writer.write(&block[..n])?;
            done += n as u64;
            if done % (1024 * 1024) == 0 || done == bytes {
                if !on_progress(done, bytes) {
                    return Err(ImageError::Aborted);
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn split_writer(&self, name: &str, parts: &[ImagePart]) -> ImageResult<SplitFileWriter> {
        let mut files = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            let path = self.part_path(name, index);
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("Opening {path}"))?;
            files.push((file, part.num_bytes()));
        }
        Ok(SplitFileWriter::new(files))
    }

    /// Unmaps first if needed, then removes the data files and the table
    /// blob. Deleting an image that does not exist is not an error.
    pub fn delete_backing_image(&self, name: &str) -> ImageResult<()> {
        self.unmap_image_device_impl(name, true)?;
        let table = self.table_file(name);
        if table.exists() {
            std::fs::remove_file(&table).with_context(|| format!("Removing {table}"))?;
        }
        if let Ok(entries) = self.data_dir.read_dir_utf8() {
            let prefix = format!("{name}.img");
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                if file_name == prefix || file_name.starts_with(&format!("{prefix}.")) {
                    let path = entry.path();
                    std::fs::remove_file(&path).with_context(|| format!("Removing {path}"))?;
                }
            }
        }
        Ok(())
    }

    /// Publish `name` as a block device, waiting up to `timeout` for the
    /// node to appear. Device-mapper over the backing device is tried
    /// first; hosts without one get a loopback device over the data file.
    pub fn map_image_device(&self, name: &str, timeout: Duration) -> ImageResult<Utf8PathBuf> {
        let entry = self.entry(name)?;
        if self.is_image_mapped(name)? {
            return Err(ImageError::Busy);
        }
        let table = self.read_table(name)?;
        if self.backends.mapper.supports(&table.source_device) {
            let path = self.backends.mapper.create_linear(
                name,
                &table.source_device,
                &entry.extents(),
                timeout,
            )?;
            return Ok(path);
        }
        tracing::debug!("no device-mapper over {}, using loopback", table.source_device);
        if entry.parts.len() > 1 {
            // Loopback cannot present split files as one device.
            return Err(ImageError::Unsupported);
        }
        let path = self.part_path(name, 0);
        Ok(self.backends.looper.attach(&path)?)
    }

    pub fn unmap_image_device(&self, name: &str) -> ImageResult<()> {
        self.unmap_image_device_impl(name, false)
    }

    /// Teardown flavor: failures are logged, not returned.
    pub fn unmap_image_device_force(&self, name: &str) {
        if let Err(e) = self.unmap_image_device_impl(name, true) {
            tracing::warn!("force unmap of {name} failed: {e}");
        }
    }

    fn unmap_image_device_impl(&self, name: &str, force: bool) -> ImageResult<()> {
        if self.backends.mapper.find(name)?.is_some() {
            self.backends.mapper.destroy(name, force)?;
            return Ok(());
        }
        let part0 = self.part_path(name, 0);
        if let Some(dev) = self.backends.looper.find(&part0)? {
            self.backends.looper.detach(&dev)?;
        }
        Ok(())
    }

    pub fn is_image_mapped(&self, name: &str) -> ImageResult<bool> {
        Ok(self.get_mapped_image_device(name)?.is_some())
    }

    pub fn get_mapped_image_device(&self, name: &str) -> ImageResult<Option<Utf8PathBuf>> {
        if let Some(dev) = self.backends.mapper.find(name)? {
            return Ok(Some(dev));
        }
        self.backends
            .looper
            .find(&self.part_path(name, 0))
            .map_err(Into::into)
    }

    /// Write `bytes` zero bytes to the head of a freshly created image.
    pub fn zero_fill_new_image(&self, name: &str, bytes: u64) -> ImageResult<()> {
        let entry = self.entry(name)?;
        let bytes = bytes.min(entry.size);
        self.zero_fill(name, &entry.parts, bytes, &mut |_, _| true)
    }

    pub fn remove_all_images(&self) -> ImageResult<()> {
        for name in self.all_backing_images() {
            self.delete_backing_image(&name)?;
        }
        Ok(())
    }

    /// Remove only images whose table carries the DISABLED attribute.
    pub fn remove_disabled_images(&self) -> ImageResult<()> {
        for name in self.all_backing_images() {
            match self.image_flags(&name) {
                Ok(flags) if flags.contains(PartitionFlags::DISABLED) => {
                    self.delete_backing_image(&name)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-read every image's extents and compare against the persisted
    /// tables. Catches a filesystem that moved blocks after allocation.
    pub fn validate(&self) -> bool {
        for name in self.all_backing_images() {
            let entry = match self.entry(&name) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("validate: no table for {name}: {e}");
                    return false;
                }
            };
            for (index, part) in entry.parts.iter().enumerate() {
                let path = self.part_path(&name, index);
                match self.backends.extents.verify_pinned(&path, &part.extents) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!("validate: extents of {path} moved");
                        return false;
                    }
                    Err(e) => {
                        tracing::error!("validate: cannot query {path}: {e}");
                        return false;
                    }
                }
            }
        }
        true
    }

    pub(crate) fn open_partition_writer(
        &self,
        name: &str,
        timeout: Duration,
    ) -> ImageResult<crate::writer::PartitionWriter> {
        let entry = self.entry(name)?;
        match MappedDevice::open(self, name, timeout) {
            Ok(device) => Ok(crate::writer::PartitionWriter::device(device, entry.size)),
            Err(ImageError::Unsupported) => {
                let writer = self.split_writer(name, &entry.parts)?;
                Ok(crate::writer::PartitionWriter::split(writer, entry.size))
            }
            Err(e) => Err(e),
        }
    }
}

/// An exclusively owned mapping of a backing image. The device is
/// guaranteed to be unmapped on every exit path, including drop.
pub struct MappedDevice {
    name: String,
    path: Utf8PathBuf,
    part0: Utf8PathBuf,
    file: Option<File>,
    backends: Backends,
}

impl MappedDevice {
    pub fn open(store: &ImageStore, name: &str, timeout: Duration) -> ImageResult<Self> {
        let path = store.map_image_device(name, timeout)?;
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                store.unmap_image_device_force(name);
                return Err(ImageError::Failed(
                    anyhow::Error::new(e).context(format!("Opening {path}")),
                ));
            }
        };
        Ok(Self {
            name: name.to_string(),
            path,
            part0: store.part_path(name, 0),
            file: Some(file),
            backends: store.backends.clone(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        // SAFETY: The option is only taken on close
        self.file.as_mut().unwrap()
    }

    /// Size of the device in bytes. Rewinds to the start afterwards.
    pub fn size(&mut self) -> ImageResult<u64> {
        use std::io::Seek;
        let file = self.file_mut();
        let size = file.seek(std::io::SeekFrom::End(0))?;
        file.seek(std::io::SeekFrom::Start(0))?;
        Ok(size)
    }

    fn impl_close(&mut self) -> ImageResult<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        drop(file);
        if self.backends.mapper.find(&self.name)?.is_some() {
            self.backends.mapper.destroy(&self.name, false)?;
        } else if let Some(dev) = self.backends.looper.find(&self.part0)? {
            self.backends.looper.detach(&dev)?;
        }
        Ok(())
    }

    /// Consume the handle, unmapping the device.
    pub fn close(mut self) -> ImageResult<()> {
        self.impl_close()
    }
}

impl Drop for MappedDevice {
    fn drop(&mut self) {
        // Best effort if we're dropped without an explicit close.
        if let Err(e) = self.impl_close() {
            tracing::warn!("unmapping {} on drop failed: {e}", self.name);
        }
    }
}
