//! In-memory implementations of the block capabilities.
//!
//! These back the unit and scenario tests: allocation creates real files
//! (so streamed bytes land somewhere observable) but physical extents are
//! synthesized, and "mapping" a device hands back the data file itself.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    DeviceMapper, Extent, ExtentBackend, ExtentError, LoopBackend, MAX_EXTENTS, SECTOR_SIZE,
};

#[derive(Debug, Default)]
struct WorldState {
    next_sector: u64,
    files: HashMap<Utf8PathBuf, Vec<Extent>>,
    dm_devices: HashMap<String, Utf8PathBuf>,
    loops: HashMap<Utf8PathBuf, Utf8PathBuf>,
}

/// A shared fake block layer. One instance implements all three
/// capabilities; hand out clones of a single [`std::sync::Arc`] so the
/// extent backend and the mappers agree on what exists.
#[derive(Debug)]
pub struct FakeBlockWorld {
    state: Mutex<WorldState>,
    max_file_size: u64,
    extents_per_file: usize,
    dm_supported: bool,
}

impl Default for FakeBlockWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBlockWorld {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorldState::default()),
            max_file_size: u64::MAX,
            extents_per_file: 1,
            dm_supported: true,
        }
    }

    /// Pretend the filesystem cannot hold files larger than `bytes`,
    /// forcing images past that size to be split.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Synthesize `n` extents per allocated file.
    pub fn with_extents_per_file(mut self, n: usize) -> Self {
        self.extents_per_file = n.max(1);
        self
    }

    /// Refuse device-mapper mappings, forcing the loopback fallback.
    pub fn without_device_mapper(mut self) -> Self {
        self.dm_supported = false;
        self
    }

    /// Simulate the filesystem moving `path`'s blocks out from under us.
    pub fn migrate_file(&self, path: &Utf8Path) {
        let mut state = self.state.lock().unwrap();
        if let Some(extents) = state.files.get_mut(path) {
            for extent in extents.iter_mut() {
                extent.physical_sector += 8;
            }
        }
    }

    pub fn mapped_device_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.dm_devices.len() + state.loops.len()
    }
}

impl ExtentBackend for FakeBlockWorld {
    fn allocate(&self, path: &Utf8Path, size: u64) -> Result<Vec<Extent>, ExtentError> {
        if self.extents_per_file > MAX_EXTENTS {
            return Err(ExtentError::Fragmented(self.extents_per_file));
        }
        let file = File::create(path)?;
        file.set_len(size)?;
        let total_sectors = size.div_ceil(SECTOR_SIZE);
        let mut state = self.state.lock().unwrap();
        let per_extent = total_sectors.div_ceil(self.extents_per_file as u64).max(1);
        let mut extents = Vec::new();
        let mut remaining = total_sectors;
        while remaining > 0 {
            let count = per_extent.min(remaining);
            extents.push(Extent {
                physical_sector: state.next_sector,
                sector_count: count,
            });
            // Leave a gap so consecutive extents are visibly discontiguous.
            state.next_sector += count + 16;
            remaining -= count;
        }
        state.files.insert(path.to_owned(), extents.clone());
        Ok(extents)
    }

    fn query(&self, path: &Utf8Path) -> Result<Vec<Extent>, ExtentError> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no extents recorded for {path}").into())
    }

    fn verify_pinned(&self, path: &Utf8Path, extents: &[Extent]) -> Result<bool, ExtentError> {
        Ok(self.query(path)? == extents)
    }

    fn backing_device(&self, _path: &Utf8Path) -> Result<Utf8PathBuf, ExtentError> {
        Ok("/dev/fake0".into())
    }

    fn max_file_size(&self, _dir: &Utf8Path) -> u64 {
        self.max_file_size
    }
}

impl DeviceMapper for FakeBlockWorld {
    fn create_linear(
        &self,
        name: &str,
        _base: &Utf8Path,
        extents: &[Extent],
        _timeout: Duration,
    ) -> Result<Utf8PathBuf> {
        let mut state = self.state.lock().unwrap();
        if state.dm_devices.contains_key(name) {
            return Err(anyhow!("device {name} already exists"));
        }
        let first = extents
            .first()
            .ok_or_else(|| anyhow!("empty table for {name}"))?;
        let file = state
            .files
            .iter()
            .find(|(_, v)| v.first() == Some(first))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| anyhow!("no backing file for table of {name}"))?;
        state.dm_devices.insert(name.to_string(), file.clone());
        Ok(file)
    }

    fn destroy(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.dm_devices.remove(name).is_none() && !force {
            return Err(anyhow!("device {name} is not mapped"));
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Result<Option<Utf8PathBuf>> {
        let state = self.state.lock().unwrap();
        Ok(state.dm_devices.get(name).cloned())
    }

    fn supports(&self, _base: &Utf8Path) -> bool {
        self.dm_supported
    }

    fn dump(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for (name, file) in &state.dm_devices {
            out.push_str(&format!("{name}: linear {file}\n"));
        }
        Ok(out)
    }
}

impl LoopBackend for FakeBlockWorld {
    fn attach(&self, file: &Utf8Path) -> Result<Utf8PathBuf> {
        let mut state = self.state.lock().unwrap();
        state.loops.insert(file.to_owned(), file.to_owned());
        Ok(file.to_owned())
    }

    fn detach(&self, dev: &Utf8Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.loops.retain(|_, v| v != dev);
        Ok(())
    }

    fn find(&self, file: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
        let state = self.state.lock().unwrap();
        Ok(state.loops.get(file).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fake_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let world = FakeBlockWorld::new().with_extents_per_file(3);
        let path = Utf8PathBuf::from_path_buf(dir.path().join("img")).unwrap();
        let extents = world.allocate(&path, 6 * SECTOR_SIZE).unwrap();
        assert_eq!(extents.len(), 3);
        assert_eq!(crate::extents_num_bytes(&extents), 6 * SECTOR_SIZE);
        assert!(world.verify_pinned(&path, &extents).unwrap());
        world.migrate_file(&path);
        assert!(!world.verify_pinned(&path, &extents).unwrap());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 6 * SECTOR_SIZE);
    }

    #[test]
    fn test_fake_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let world = FakeBlockWorld::new();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("img")).unwrap();
        let extents = world.allocate(&path, 4096).unwrap();
        let dev = world
            .create_linear("system_gsi", "/dev/fake0".into(), &extents, Duration::ZERO)
            .unwrap();
        assert_eq!(dev, path);
        assert_eq!(DeviceMapper::find(&world, "system_gsi").unwrap(), Some(path));
        world.destroy("system_gsi", false).unwrap();
        assert!(DeviceMapper::find(&world, "system_gsi").unwrap().is_none());
        assert!(world.destroy("system_gsi", false).is_err());
        world.destroy("system_gsi", true).unwrap();
    }
}
