//! The daemon service: single-writer serialization of client requests,
//! dispatch to the session/store/status layers, caller privilege tiers,
//! and startup recovery.

use std::fs::File;
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::imagestore::{Backends, ImageStore, MAP_TIMEOUT};
use crate::install::{remove_gsi_files, InstallParams, InstallSession, SessionOptions};
use crate::paths::{slot_name, Layout, DEFAULT_USERDATA_SIZE, IMAGE_SUFFIX};
use crate::progress::{Progress, ProgressTracker};
use crate::rpc::{status_code, Request, Response, INSTALL_ERROR_GENERIC, INSTALL_OK};
use crate::status::{BootStatus, InstallStatus};
use dsid_blockdev::SECTOR_SIZE;

/// Default free-space floor enforced before preallocating.
const MIN_FREE_SPACE_PERCENT: u64 = 40;

/// Head of a writable partition zeroed by `zero_partition`, destroying
/// both the first block and any superblock.
const ERASE_HEAD_BYTES: u64 = 1024 * 1024;

const UID_ROOT: u32 = 0;
const UID_SYSTEM: u32 = 1000;
const UID_SHELL: u32 = 2000;

/// Magic of a vfat filesystem as reported by statfs, the only medium we
/// accept for removable installs.
const MSDOS_SUPER_MAGIC: i64 = 0x4d44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    System,
    SystemOrShell,
    Root,
}

/// Which uids may call which tier. The production policy mirrors the
/// platform uids; tests substitute a permissive one.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allow_all: bool,
}

impl AccessPolicy {
    pub fn system() -> Self {
        Self { allow_all: false }
    }

    /// Every caller passes every tier; for tests and local bring-up.
    pub fn permissive() -> Self {
        Self { allow_all: true }
    }

    pub fn allows(&self, uid: u32, level: AccessLevel) -> bool {
        if self.allow_all {
            return true;
        }
        match level {
            AccessLevel::Root => uid == UID_ROOT,
            AccessLevel::System => [UID_ROOT, UID_SYSTEM].contains(&uid),
            AccessLevel::SystemOrShell => [UID_ROOT, UID_SYSTEM, UID_SHELL].contains(&uid),
        }
    }
}

/// The identity of an RPC caller, from the socket's peer credentials.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub uid: u32,
}

struct SharedBuffer {
    file: File,
    size: u64,
}

#[derive(Default)]
struct State {
    install_dir: Option<Utf8PathBuf>,
    installer: Option<InstallSession>,
    shared: Option<SharedBuffer>,
    /// Set once this install created (or was asked to wipe) userdata, so
    /// a later failure knows userdata is not a pre-existing image worth
    /// preserving.
    wipe_userdata_on_failure: bool,
}

pub struct Service {
    layout: Layout,
    backends: Backends,
    policy: AccessPolicy,
    min_free_percent: u64,
    progress: Arc<ProgressTracker>,
    // One coarse lock serializes every mutating request; only the
    // progress record lives outside it.
    state: Mutex<State>,
}

impl Service {
    pub fn new(layout: Layout, backends: Backends, policy: AccessPolicy) -> Self {
        Self::with_free_space_threshold(layout, backends, policy, MIN_FREE_SPACE_PERCENT)
    }

    pub fn with_free_space_threshold(
        layout: Layout,
        backends: Backends,
        policy: AccessPolicy,
        min_free_percent: u64,
    ) -> Self {
        Self {
            layout,
            backends,
            policy,
            min_free_percent,
            progress: Arc::new(ProgressTracker::new()),
            state: Mutex::new(State::default()),
        }
    }

    fn boot(&self) -> BootStatus {
        BootStatus::new(self.layout.clone())
    }

    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Route a request, enforcing the caller's privilege tier. The
    /// stream is consulted only by `commit_chunk_from_stream`, whose
    /// payload follows the request frame.
    pub fn dispatch(&self, peer: &Peer, request: Request, stream: &mut dyn Read) -> Response {
        use AccessLevel::*;
        let tier = match &request {
            Request::Enable { .. } => {
                // Finalizing an in-progress install is for the installer
                // flow only; re-enabling is also available to the shell.
                if self.is_in_progress() {
                    System
                } else {
                    SystemOrShell
                }
            }
            Request::OpenInstall { .. }
            | Request::CloseInstall
            | Request::CreatePartition { .. }
            | Request::CommitChunkFromStream { .. }
            | Request::CommitChunkFromMemory { .. }
            | Request::SetSharedBuffer { .. }
            | Request::CommitChunkFromShared { .. }
            | Request::GetInstallProgress
            | Request::CancelInstall
            | Request::GetInstalledImageDir => System,
            Request::OpenImageService { .. } => Root,
            _ => SystemOrShell,
        };
        if !self.policy.allows(peer.uid, tier) {
            tracing::warn!("UID {} denied for {request:?}", peer.uid);
            return Response::SecurityError {
                message: format!("UID {} is not allowed", peer.uid),
            };
        }

        match request {
            Request::OpenInstall { install_dir } => {
                Response::status(self.open_install(&install_dir))
            }
            Request::CloseInstall => Response::status(self.close_install()),
            Request::CreatePartition {
                name,
                size,
                read_only,
            } => Response::status(self.create_partition(&name, size, read_only)),
            Request::CommitChunkFromStream { bytes } => {
                Response::boolean(self.commit_chunk_from_stream(stream, bytes))
            }
            Request::CommitChunkFromMemory { data } => {
                Response::boolean(self.commit_chunk_from_memory(&data))
            }
            Request::SetSharedBuffer { path, size } => {
                Response::boolean(self.set_shared_buffer(Utf8Path::new(&path), size))
            }
            Request::CommitChunkFromShared { bytes } => {
                Response::boolean(self.commit_chunk_from_shared(bytes))
            }
            Request::GetInstallProgress => Response::Progress {
                progress: self.get_install_progress(),
            },
            Request::Enable { one_shot } => Response::status(self.enable(one_shot)),
            Request::IsEnabled => Response::boolean(self.is_enabled()),
            Request::Disable => Response::boolean(self.disable()),
            Request::Remove => Response::boolean(self.remove()),
            Request::CancelInstall => Response::boolean(self.cancel_install()),
            Request::IsInstalled => Response::boolean(self.is_installed()),
            Request::IsRunning => Response::boolean(self.is_running()),
            Request::IsInProgress => Response::boolean(self.is_in_progress()),
            Request::GetInstalledImageDir => Response::Text {
                value: self.get_installed_image_dir(),
            },
            Request::ZeroPartition { name } => Response::status(self.zero_partition(&name)),
            Request::OpenImageService { prefix } => match self.open_image_service(&prefix) {
                Ok((metadata_dir, data_dir)) => Response::ImageService {
                    metadata_dir: metadata_dir.into(),
                    data_dir: data_dir.into(),
                },
                Err(e) => Response::Error {
                    message: format!("{e:#}"),
                },
            },
            Request::DumpDeviceMapperDevices => match self.backends.mapper.dump() {
                Ok(value) => Response::Text { value },
                Err(e) => Response::Error {
                    message: format!("{e:#}"),
                },
            },
        }
    }

    pub fn open_install(&self, install_dir: &str) -> i32 {
        let mut state = self.state.lock().unwrap();
        let boot = self.boot();
        if boot.is_running() {
            tracing::error!("cannot start an install while the installed image is live");
            return INSTALL_ERROR_GENERIC;
        }
        let dir = match self.validate_install_params(install_dir) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!("{e:#}");
                return INSTALL_ERROR_GENERIC;
            }
        };
        if let Err(e) = boot.remove_complete(&dir) {
            tracing::error!("{e:#}");
        }
        // Remember the installation directory before allocating any
        // resource.
        if let Err(e) = boot.save_install_dir(&dir) {
            tracing::error!("{e:#}");
            return INSTALL_ERROR_GENERIC;
        }
        state.install_dir = Some(dir);
        state.wipe_userdata_on_failure = false;
        INSTALL_OK
    }

    pub fn close_install(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        let Some(dir) = state.install_dir.take() else {
            tracing::error!("no open install to close");
            return INSTALL_ERROR_GENERIC;
        };
        match self.boot().mark_complete(&dir) {
            Ok(()) => INSTALL_OK,
            Err(e) => {
                tracing::error!("{e:#}");
                INSTALL_ERROR_GENERIC
            }
        }
    }

    pub fn create_partition(&self, name: &str, size: i64, read_only: bool) -> i32 {
        let mut state = self.state.lock().unwrap();
        let Some(install_dir) = state.install_dir.clone() else {
            tracing::error!("open is required for create_partition");
            return INSTALL_ERROR_GENERIC;
        };

        // Make sure a pending interrupted installation is cleaned up.
        state.installer = None;

        if size < 0 {
            tracing::error!("partition size {size} is negative");
            return INSTALL_ERROR_GENERIC;
        }
        let mut size = size as u64;
        if size % SECTOR_SIZE != 0 {
            tracing::error!("size {size} is not a multiple of {SECTOR_SIZE}");
            return INSTALL_ERROR_GENERIC;
        }
        if size == 0 && name == "userdata" {
            size = DEFAULT_USERDATA_SIZE;
        }

        let userdata_preexists = install_dir
            .join(format!("userdata{IMAGE_SUFFIX}.img"))
            .exists();
        if name == "userdata" && !userdata_preexists {
            state.wipe_userdata_on_failure = true;
        }
        let params = InstallParams {
            install_dir,
            name: name.to_string(),
            size,
            read_only,
            wipe: false,
        };
        let session = InstallSession::new(
            self.layout.clone(),
            self.backends.clone(),
            params,
            self.progress.clone(),
            SessionOptions {
                min_free_percent: self.min_free_percent,
                wipe_userdata_on_failure: state.wipe_userdata_on_failure || !userdata_preexists,
            },
        );
        match session {
            Ok(mut session) => match session.start() {
                Ok(()) => {
                    state.installer = Some(session);
                    INSTALL_OK
                }
                Err(e) => {
                    tracing::error!("starting install of {name}: {e:#}");
                    status_code(&e)
                }
            },
            Err(e) => {
                tracing::error!("creating install session: {e:#}");
                status_code(&e)
            }
        }
    }

    pub fn commit_chunk_from_stream(&self, stream: &mut dyn Read, bytes: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(installer) = state.installer.as_mut() else {
            return false;
        };
        if bytes < 0 {
            tracing::error!("chunk size {bytes} is negative");
            return false;
        }
        match installer.commit_from_stream(stream, bytes as u64) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("commit from stream: {e:#}");
                false
            }
        }
    }

    pub fn commit_chunk_from_memory(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(installer) = state.installer.as_mut() else {
            return false;
        };
        match installer.write_chunk(data) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("commit from memory: {e:#}");
                false
            }
        }
    }

    pub fn set_shared_buffer(&self, path: &Utf8Path, size: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        if size <= 0 {
            tracing::error!("shared buffer size {size} is invalid");
            return false;
        }
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("open {path}: {e}");
                return false;
            }
        };
        match file.metadata() {
            Ok(m) if m.len() >= size as u64 => {}
            Ok(m) => {
                tracing::error!("shared buffer is {} bytes, {size} advertised", m.len());
                return false;
            }
            Err(e) => {
                tracing::error!("stat {path}: {e}");
                return false;
            }
        }
        state.shared = Some(SharedBuffer {
            file,
            size: size as u64,
        });
        true
    }

    pub fn commit_chunk_from_shared(&self, bytes: i64) -> bool {
        use std::os::unix::fs::FileExt;
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(shared) = state.shared.as_ref() else {
            tracing::error!("no shared buffer is set");
            return false;
        };
        let Some(installer) = state.installer.as_mut() else {
            return false;
        };
        if bytes < 0 || bytes as u64 > shared.size {
            tracing::error!("chunk of {bytes} bytes exceeds the shared buffer");
            return false;
        }
        let mut remaining = bytes as u64;
        let mut offset = 0u64;
        let mut buffer = [0u8; 65536];
        while remaining > 0 {
            let n = remaining.min(buffer.len() as u64) as usize;
            if let Err(e) = shared.file.read_exact_at(&mut buffer[..n], offset) {
                tracing::error!("read shared buffer: {e}");
                return false;
            }
            if let Err(e) = installer.write_chunk(&buffer[..n]) {
                tracing::error!("commit from shared buffer: {e:#}");
                return false;
            }
            offset += n as u64;
            remaining -= n as u64;
        }
        true
    }

    /// Reads only the progress lock, so it never waits behind a commit.
    pub fn get_install_progress(&self) -> Progress {
        self.progress.snapshot()
    }

    pub fn enable(&self, one_shot: bool) -> i32 {
        let mut state = self.state.lock().unwrap();
        if let Some(mut installer) = state.installer.take() {
            match installer.finalize(one_shot) {
                Ok(()) => INSTALL_OK,
                Err(e) => {
                    tracing::error!("finalize: {e:#}");
                    // Dropping the unfinalized session unwinds it.
                    status_code(&e)
                }
            }
        } else {
            self.reenable(one_shot)
        }
    }

    fn reenable(&self, one_shot: bool) -> i32 {
        let boot = self.boot();
        if !boot.is_installed() {
            tracing::error!("no install detected - cannot re-enable");
            return INSTALL_ERROR_GENERIC;
        }
        if boot.read_status() != Some(InstallStatus::Disabled) {
            tracing::error!("install is not currently disabled");
            return INSTALL_ERROR_GENERIC;
        }
        if boot.set_one_shot(one_shot).is_err()
            || boot.write_status(InstallStatus::Installed).is_err()
        {
            return INSTALL_ERROR_GENERIC;
        }
        INSTALL_OK
    }

    pub fn is_enabled(&self) -> bool {
        self.boot().read_status() == Some(InstallStatus::Ok)
    }

    pub fn disable(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.installer.is_some() {
            tracing::error!("cannot disable during an installation");
            return false;
        }
        let boot = self.boot();
        if !boot.is_installed() {
            tracing::error!("cannot disable - no install detected");
            return false;
        }
        boot.write_status(InstallStatus::Disabled).is_ok()
    }

    pub fn remove(&self) -> bool {
        let state = self.state.lock().unwrap();
        let dir = self.active_install_dir(&state);
        let boot = self.boot();
        if boot.is_running() {
            // Cannot delete the filesystem we are running from; ask the
            // next startup outside the image to do it.
            return boot.write_status(InstallStatus::Wipe).is_ok();
        }
        match remove_gsi_files(&self.layout, &self.backends, &dir, true) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("{e:#}");
                false
            }
        }
    }

    pub fn cancel_install(&self) -> bool {
        // Raise the flag before taking the big lock so an in-flight
        // commit observes it at its next chunk boundary.
        self.progress.request_abort();
        let mut state = self.state.lock().unwrap();
        self.progress.clear_abort();
        state.installer = None;
        true
    }

    pub fn is_installed(&self) -> bool {
        self.boot().is_installed()
    }

    pub fn is_running(&self) -> bool {
        self.boot().is_running()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.lock().unwrap().installer.is_some()
    }

    pub fn get_installed_image_dir(&self) -> String {
        let state = self.state.lock().unwrap();
        self.active_install_dir(&state).into()
    }

    fn active_install_dir(&self, state: &State) -> Utf8PathBuf {
        if let Some(installer) = state.installer.as_ref() {
            return installer.install_dir().to_owned();
        }
        self.boot()
            .installed_image_dir()
            .unwrap_or_else(|| self.layout.default_image_dir())
    }

    pub fn zero_partition(&self, name: &str) -> i32 {
        let state = self.state.lock().unwrap();
        let boot = self.boot();
        if boot.is_running() || !boot.is_installed() {
            tracing::error!("zero_partition needs an installed, non-live image");
            return INSTALL_ERROR_GENERIC;
        }
        let dir = self.active_install_dir(&state);
        match self.wipe_writable(&dir, name) {
            Ok(()) => INSTALL_OK,
            Err(e) => {
                tracing::error!("{e:#}");
                INSTALL_ERROR_GENERIC
            }
        }
    }

    #[context("Wiping {name} under {install_dir}")]
    fn wipe_writable(&self, install_dir: &Utf8Path, name: &str) -> Result<()> {
        let slot = slot_name(install_dir)?;
        let images = ImageStore::open(
            self.layout.slot_metadata_dir(&slot),
            install_dir.to_owned(),
            self.backends.clone(),
        )?;
        let image = format!("{name}{IMAGE_SUFFIX}");
        let mut writer = images.open_partition_writer(&image, MAP_TIMEOUT)?;
        let head = ERASE_HEAD_BYTES.min(writer.size());
        let block = [0u8; 4096];
        let mut remaining = head;
        while remaining > 0 {
            let n = remaining.min(block.len() as u64) as usize;
            writer.write(&block[..n])?;
            remaining -= n as u64;
        }
        writer.flush()?;
        writer.close()?;
        Ok(())
    }

    pub fn open_image_service(&self, prefix: &str) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
        let metadata_base = self
            .layout
            .metadata_root
            .parent()
            .unwrap_or(&self.layout.metadata_root)
            .to_owned();
        let metadata_dir = dsid_utils::canonicalized(metadata_base.join(prefix))?;
        let data_dir = dsid_utils::canonicalized(self.layout.data_root.join(prefix))?;
        if !metadata_dir.starts_with(&metadata_base) || !data_dir.starts_with(&self.layout.data_root)
        {
            anyhow::bail!("invalid image service prefix: {prefix}");
        }
        Ok((metadata_dir, data_dir))
    }

    /// Normalize and authorize an installation target. The result always
    /// carries a trailing slash.
    #[context("Validating install path")]
    fn validate_install_params(&self, install_dir: &str) -> Result<Utf8PathBuf> {
        let default_dir = self.layout.default_image_dir();
        let requested = if install_dir.is_empty()
            || Utf8Path::new(install_dir) == self.layout.data_root
        {
            // No explicit path, or the top-level folder: pick the proper
            // location underneath.
            std::fs::create_dir_all(&default_dir)
                .with_context(|| format!("Creating {default_dir}"))?;
            default_dir.clone()
        } else {
            Utf8PathBuf::from(install_dir)
        };
        if requested == default_dir {
            std::fs::create_dir_all(&default_dir)
                .with_context(|| format!("Creating {default_dir}"))?;
        }

        let resolved = dsid_utils::canonicalized(&requested)?;
        let normalized = Utf8PathBuf::from(dsid_utils::with_trailing_slash(&resolved));

        let canonical_default = dsid_utils::canonicalized(&default_dir)
            .map(|p| Utf8PathBuf::from(dsid_utils::with_trailing_slash(&p)))?;
        if normalized == canonical_default {
            return Ok(normalized);
        }
        if self.is_external_storage(&normalized)? {
            return Ok(normalized);
        }
        Err(anyhow!("cannot install to {normalized}"))
    }

    fn is_external_storage(&self, path: &Utf8Path) -> Result<bool> {
        if !path.starts_with(&self.layout.media_root) {
            return Ok(false);
        }
        let stats = rustix::fs::statfs(path.as_std_path())
            .map_err(|e| anyhow!("statfs of {path}: {e}"))?;
        Ok(stats.f_type == MSDOS_SUPER_MAGIC as rustix::fs::FsWord)
    }

    /// Startup recovery: reclaim corrupt or wiped installations, and
    /// confirm a first boot into the installed image.
    pub fn run_startup_tasks(&self) {
        let boot = self.boot();
        let dir = boot
            .installed_image_dir()
            .unwrap_or_else(|| self.layout.default_image_dir());

        // An install directory without a completion indication is a
        // leftover of a crashed install.
        if !boot.is_complete(&dir) {
            if let Err(e) = remove_gsi_files(&self.layout, &self.backends, &dir, true) {
                tracing::error!("cleaning corrupted installation in {dir}: {e:#}");
            }
        }

        let Some(status) = boot.read_status() else {
            return;
        };
        if !boot.is_running() {
            // Check if a wipe was requested from the installed image or
            // a recovery flow.
            if status == InstallStatus::Wipe {
                if let Err(e) = remove_gsi_files(&self.layout, &self.backends, &dir, true) {
                    tracing::error!("processing wipe request: {e:#}");
                }
            }
        } else if status == InstallStatus::Installed {
            // First boot into the installed image: consume one-shot mode
            // and mark the image as known good.
            if boot.one_shot_armed() {
                if let Err(e) = boot.set_one_shot(false) {
                    tracing::error!("{e:#}");
                }
            }
            if let Err(e) = boot.write_status(InstallStatus::Ok) {
                tracing::error!("{e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsid_blockdev::testutil::FakeBlockWorld;
    use std::io::Cursor;

    const SYSTEM_SIZE: u64 = 10485760;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        world: Arc<FakeBlockWorld>,
        service: Service,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_world(FakeBlockWorld::new())
        }

        fn with_world(world: FakeBlockWorld) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap();
            let layout = Layout {
                metadata_root: root.join("metadata/gsi/dsu"),
                data_root: root.join("data/gsi"),
                media_root: root.join("mnt/media_rw"),
            };
            std::fs::create_dir_all(&layout.metadata_root).unwrap();
            std::fs::create_dir_all(&layout.data_root).unwrap();
            let world = Arc::new(world);
            let service = Service::with_free_space_threshold(
                layout.clone(),
                Backends::fake(world.clone()),
                AccessPolicy::permissive(),
                0,
            );
            Fixture {
                _dir: dir,
                layout,
                world,
                service,
            }
        }

        fn boot(&self) -> BootStatus {
            BootStatus::new(self.layout.clone())
        }

        fn install_dir(&self) -> String {
            self.service.get_installed_image_dir()
        }

        fn data_dir(&self) -> Utf8PathBuf {
            Utf8PathBuf::from(self.install_dir())
        }

        /// S1 steps 1-4: open, create both partitions, stream the image.
        fn stream_install(&self, bytes: u64) {
            assert_eq!(self.service.open_install(""), INSTALL_OK);
            assert_eq!(self.service.create_partition("userdata", 0, false), INSTALL_OK);
            assert_eq!(
                self.service
                    .create_partition("system", SYSTEM_SIZE as i64, true),
                INSTALL_OK
            );
            let payload = vec![0xabu8; bytes as usize];
            assert!(self
                .service
                .commit_chunk_from_stream(&mut Cursor::new(payload), bytes as i64));
        }
    }

    #[test]
    fn test_happy_path() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);

        assert!(f.service.is_installed());
        assert!(!f.service.is_in_progress());
        let dir = f.install_dir();
        assert!(dir.ends_with('/'));
        assert!(dir.ends_with("gsi/dsu/"));
        let status = std::fs::read_to_string(f.layout.install_status_file()).unwrap();
        assert_eq!(status, "0");
        assert!(!f.layout.one_shot_file().exists());
        let recorded = std::fs::read_to_string(f.layout.install_dir_file()).unwrap();
        assert_eq!(recorded, dir);

        // The streamed bytes actually landed in the system image.
        let image = std::fs::read(f.data_dir().join("system_gsi.img")).unwrap();
        assert_eq!(image.len() as u64, SYSTEM_SIZE);
        assert!(image.iter().all(|&b| b == 0xab));
        // The userdata head was formatted to zeros; only read the head,
        // the default image is 2 GiB of sparse file.
        let mut head = [1u8; 4096];
        let userdata = File::open(f.data_dir().join("userdata_gsi.img")).unwrap();
        {
            use std::os::unix::fs::FileExt;
            userdata.read_exact_at(&mut head, 0).unwrap();
        }
        assert!(head.iter().all(|&b| b == 0));
        // Nothing is left mapped.
        assert_eq!(f.world.mapped_device_count(), 0);
    }

    #[test]
    fn test_size_mismatch_unwinds() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE - 1);
        assert_eq!(f.service.enable(false), INSTALL_ERROR_GENERIC);

        assert!(!f.service.is_installed());
        assert!(!f.data_dir().join("system_gsi.img").exists());
        assert!(!f.data_dir().join("userdata_gsi.img").exists());
        assert_eq!(f.world.mapped_device_count(), 0);
    }

    #[test]
    fn test_chunk_overflow_rejected() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        // One byte past the image size must be refused.
        assert!(!f
            .service
            .commit_chunk_from_stream(&mut Cursor::new(vec![0u8; 1]), 1));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let f = Fixture::new();
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service
                .create_partition("system", SYSTEM_SIZE as i64, true),
            INSTALL_OK
        );
        let mut last = 0u64;
        let chunk = vec![0u8; 1 << 20];
        for _ in 0..10 {
            assert!(f
                .service
                .commit_chunk_from_stream(&mut Cursor::new(chunk.clone()), chunk.len() as i64));
            let p = f.service.get_install_progress();
            assert!(p.bytes_processed >= last);
            assert!(p.bytes_processed <= p.total_bytes);
            last = p.bytes_processed;
        }
        assert_eq!(last, SYSTEM_SIZE);
    }

    #[test]
    fn test_cancel_mid_stream() {
        let f = Fixture::new();
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service
                .create_partition("system", SYSTEM_SIZE as i64, true),
            INSTALL_OK
        );
        // ~5 MiB in, the client cancels.
        let half = vec![0u8; 5 * 1024 * 1024];
        assert!(f
            .service
            .commit_chunk_from_stream(&mut Cursor::new(half.clone()), half.len() as i64));
        assert!(f.service.cancel_install());
        // The next commit fails and the partial install is gone.
        assert!(!f
            .service
            .commit_chunk_from_stream(&mut Cursor::new(half.clone()), half.len() as i64));
        assert!(!f.service.is_installed());
        assert!(!f.data_dir().join("system_gsi.img").exists());
        assert_eq!(f.world.mapped_device_count(), 0);
    }

    #[test]
    fn test_abort_flag_observed_at_chunk_boundary() {
        let f = Fixture::new();
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service
                .create_partition("system", SYSTEM_SIZE as i64, true),
            INSTALL_OK
        );
        f.service.progress_tracker().request_abort();
        assert!(!f
            .service
            .commit_chunk_from_stream(&mut Cursor::new(vec![0u8; 4096]), 4096));
    }

    #[test]
    fn test_one_shot_lifecycle() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(true), INSTALL_OK);
        assert!(f.layout.one_shot_file().exists());

        // Simulated boot into the installed image.
        f.boot().set_running_indicator(true).unwrap();
        f.service.run_startup_tasks();
        assert!(!f.layout.one_shot_file().exists());
        assert_eq!(
            std::fs::read_to_string(f.layout.install_status_file()).unwrap(),
            "ok"
        );
        assert!(f.service.is_enabled());

        // A second startup in the installed image changes nothing.
        f.service.run_startup_tasks();
        assert_eq!(
            std::fs::read_to_string(f.layout.install_status_file()).unwrap(),
            "ok"
        );
    }

    #[test]
    fn test_crash_recovery_removes_incomplete_install() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        // Crash before close_install: no completion indication.
        assert_eq!(f.service.enable(false), INSTALL_OK);
        assert!(f.service.is_installed());

        // Daemon restart.
        f.service.run_startup_tasks();
        assert!(!f.service.is_installed());
        assert!(!f.data_dir().join("system_gsi.img").exists());
    }

    #[test]
    fn test_wipe_while_running_is_deferred() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);

        f.boot().set_running_indicator(true).unwrap();
        assert!(f.service.remove());
        // Deferred: the image files survive until the next normal boot.
        assert_eq!(
            std::fs::read_to_string(f.layout.install_status_file()).unwrap(),
            "wipe"
        );
        assert!(f.data_dir().join("system_gsi.img").exists());

        f.boot().set_running_indicator(false).unwrap();
        f.service.run_startup_tasks();
        assert!(!f.service.is_installed());
        assert!(!f.data_dir().join("system_gsi.img").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);

        assert!(f.service.remove());
        assert!(f.service.remove());
        assert!(!f.service.is_installed());
        let leftovers: Vec<_> = std::fs::read_dir(f.data_dir())
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().contains(IMAGE_SUFFIX))
                    .collect()
            })
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_disable_and_reenable() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);

        assert!(f.service.disable());
        assert_eq!(
            std::fs::read_to_string(f.layout.install_status_file()).unwrap(),
            "disabled"
        );
        // Re-enable with one-shot armed.
        assert_eq!(f.service.enable(true), INSTALL_OK);
        assert_eq!(
            std::fs::read_to_string(f.layout.install_status_file()).unwrap(),
            "0"
        );
        assert!(f.layout.one_shot_file().exists());
    }

    #[test]
    fn test_disable_refused_during_install() {
        let f = Fixture::new();
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service
                .create_partition("system", SYSTEM_SIZE as i64, true),
            INSTALL_OK
        );
        assert!(f.service.is_in_progress());
        assert!(!f.service.disable());
    }

    #[test]
    fn test_unauthorized_caller_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let layout = Layout {
            metadata_root: root.join("metadata"),
            data_root: root.join("data"),
            media_root: root.join("media"),
        };
        std::fs::create_dir_all(&layout.metadata_root).unwrap();
        std::fs::create_dir_all(&layout.data_root).unwrap();
        let world = Arc::new(FakeBlockWorld::new());
        let service = Service::with_free_space_threshold(
            layout.clone(),
            Backends::fake(world),
            AccessPolicy::system(),
            0,
        );

        let peer = Peer { uid: 12345 };
        let response = service.dispatch(
            &peer,
            Request::OpenInstall {
                install_dir: String::new(),
            },
            &mut std::io::empty(),
        );
        assert!(matches!(response, Response::SecurityError { .. }));
        assert!(!layout.install_dir_file().exists());

        // Shell may query but not install.
        let shell = Peer { uid: UID_SHELL };
        let response = service.dispatch(&shell, Request::IsInstalled, &mut std::io::empty());
        assert_eq!(response, Response::Bool { value: false });
        let response = service.dispatch(
            &shell,
            Request::CreatePartition {
                name: "system".into(),
                size: 4096,
                read_only: true,
            },
            &mut std::io::empty(),
        );
        assert!(matches!(response, Response::SecurityError { .. }));
    }

    #[test]
    fn test_dispatch_stream_payload() {
        let f = Fixture::new();
        let peer = Peer { uid: UID_SYSTEM };
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service.create_partition("system", 8192, true),
            INSTALL_OK
        );
        let mut stream = Cursor::new(vec![0x5au8; 8192]);
        let response = f.service.dispatch(
            &peer,
            Request::CommitChunkFromStream { bytes: 8192 },
            &mut stream,
        );
        assert_eq!(response, Response::Bool { value: true });
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);
    }

    #[test]
    fn test_commit_from_memory_and_shared() {
        let f = Fixture::new();
        assert_eq!(f.service.open_install(""), INSTALL_OK);
        assert_eq!(
            f.service.create_partition("system", 8192, true),
            INSTALL_OK
        );
        assert!(f.service.commit_chunk_from_memory(&[0x11u8; 4096]));

        // The rest arrives through a shared buffer.
        let shared_path = Utf8Path::from_path(f._dir.path()).unwrap().join("shm");
        std::fs::write(&shared_path, vec![0x22u8; 4096]).unwrap();
        assert!(f.service.set_shared_buffer(&shared_path, 4096));
        assert!(f.service.commit_chunk_from_shared(4096));

        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);
        let image = std::fs::read(f.data_dir().join("system_gsi.img")).unwrap();
        assert!(image[..4096].iter().all(|&b| b == 0x11));
        assert!(image[4096..].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_validate_install_params() {
        let f = Fixture::new();
        // Empty and the data root both resolve to the default slot.
        let resolved = f.service.validate_install_params("").unwrap();
        assert!(resolved.as_str().ends_with("gsi/dsu/"));
        let resolved = f
            .service
            .validate_install_params(f.layout.data_root.as_str())
            .unwrap();
        assert!(resolved.as_str().ends_with("gsi/dsu/"));
        // Anywhere else on internal storage is refused.
        assert!(f.service.validate_install_params("/somewhere/else").is_err());
    }

    #[test]
    fn test_zero_partition() {
        let f = Fixture::new();
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);

        assert_eq!(f.service.zero_partition("userdata"), INSTALL_OK);
        let mut head = vec![1u8; 1024 * 1024];
        let userdata = File::open(f.data_dir().join("userdata_gsi.img")).unwrap();
        {
            use std::os::unix::fs::FileExt;
            userdata.read_exact_at(&mut head, 0).unwrap();
        }
        assert!(head.iter().all(|&b| b == 0));

        // Refused while the installed image is live.
        f.boot().set_running_indicator(true).unwrap();
        assert_eq!(f.service.zero_partition("userdata"), INSTALL_ERROR_GENERIC);
    }

    #[test]
    fn test_loopback_fallback_install() {
        let f = Fixture::with_world(FakeBlockWorld::new().without_device_mapper());
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);
        assert_eq!(f.world.mapped_device_count(), 0);
    }

    #[test]
    fn test_split_image_install() {
        // A 4 MiB file-size limit forces the 10 MiB image into parts and
        // the writer onto the split user-space path.
        let f = Fixture::with_world(
            FakeBlockWorld::new()
                .with_max_file_size(4 * 1024 * 1024)
                .without_device_mapper(),
        );
        f.stream_install(SYSTEM_SIZE);
        assert_eq!(f.service.close_install(), INSTALL_OK);
        assert_eq!(f.service.enable(false), INSTALL_OK);
        assert!(f.data_dir().join("system_gsi.img.0002").exists());
        let part = std::fs::read(f.data_dir().join("system_gsi.img.0001")).unwrap();
        assert!(part.iter().all(|&b| b == 0xab));
    }
}
