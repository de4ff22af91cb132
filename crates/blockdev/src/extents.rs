use std::fs::File;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use dsid_utils::CommandRunExt;

/// The alignment unit for extents; every extent starts and ends on a
/// 512-byte sector boundary of the backing device.
pub const SECTOR_SIZE: u64 = 512;

/// Upper bound on the number of extents a single backing file may have
/// before we refuse to use it. A file fragmented past this point would
/// produce an unreasonably large device-mapper table.
pub const MAX_EXTENTS: usize = 512;

/// A contiguous run of sectors on the backing block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub physical_sector: u64,
    pub sector_count: u64,
}

impl Extent {
    pub fn num_bytes(&self) -> u64 {
        self.sector_count * SECTOR_SIZE
    }
}

/// Total byte length covered by a run of extents.
pub fn extents_num_bytes(extents: &[Extent]) -> u64 {
    extents.iter().map(Extent::num_bytes).sum()
}

#[derive(Debug, thiserror::Error)]
pub enum ExtentError {
    #[error("not enough free space on the backing filesystem")]
    NoSpace,
    #[error("backing file has {0} extents, limit is {MAX_EXTENTS}")]
    Fragmented(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Allocation of extent-pinned files on the host filesystem, and queries
/// over their physical layout. FIEMAP itself lives behind this boundary.
pub trait ExtentBackend: Send + Sync {
    /// Create `path` with `size` bytes of pinned, zero-initialized-on-disk
    /// allocation, returning its extents sorted by logical offset.
    fn allocate(&self, path: &Utf8Path, size: u64) -> Result<Vec<Extent>, ExtentError>;

    /// The extents of an existing file, sorted by logical offset.
    fn query(&self, path: &Utf8Path) -> Result<Vec<Extent>, ExtentError>;

    /// Whether `path` still occupies exactly `extents`. Filesystems are
    /// not supposed to move pinned blocks; this catches the ones that do.
    fn verify_pinned(&self, path: &Utf8Path, extents: &[Extent]) -> Result<bool, ExtentError>;

    /// The block device hosting the filesystem that `path` resides on.
    fn backing_device(&self, path: &Utf8Path) -> Result<Utf8PathBuf, ExtentError>;

    /// Largest single file the filesystem under `dir` supports; backing
    /// images larger than this are split across multiple files.
    fn max_file_size(&self, _dir: &Utf8Path) -> u64 {
        u64::MAX
    }
}

/// Production backend: preallocate via fallocate(2), read the physical
/// layout back with `filefrag -v` and resolve the backing device with
/// `findmnt`.
#[derive(Debug, Default)]
pub struct FilefragBackend {}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<FindmntFilesystem>,
}

#[derive(Debug, Deserialize)]
struct FindmntFilesystem {
    source: String,
}

/// Parse one extent row of `filefrag -v -b512` output, e.g.
/// `   0:        0..    2047:      34816..     36863:   2048:             last,eof`
fn parse_filefrag_line(line: &str) -> Option<Extent> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(r"^\s*\d+:\s*(\d+)\.\.\s*\d+:\s*(\d+)\.\.\s*\d+:\s*(\d+):").unwrap()
    });
    let cap = regex.captures(line)?;
    Some(Extent {
        physical_sector: cap[2].parse().ok()?,
        sector_count: cap[3].parse().ok()?,
    })
}

impl FilefragBackend {
    fn filefrag(&self, path: &Utf8Path) -> Result<Vec<Extent>, ExtentError> {
        let output = Command::new("filefrag")
            .args(["-v", "-b512"])
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let extents: Vec<Extent> = output.lines().filter_map(parse_filefrag_line).collect();
        if extents.is_empty() {
            return Err(anyhow!("no extents reported for {path}").into());
        }
        if extents.len() > MAX_EXTENTS {
            return Err(ExtentError::Fragmented(extents.len()));
        }
        Ok(extents)
    }
}

impl ExtentBackend for FilefragBackend {
    fn allocate(&self, path: &Utf8Path, size: u64) -> Result<Vec<Extent>, ExtentError> {
        let file = File::create(path).with_context(|| format!("Creating {path}"))?;
        if let Err(e) = rustix::fs::fallocate(&file, rustix::fs::FallocateFlags::empty(), 0, size) {
            // The caller removes the partial file; we just classify.
            if e == rustix::io::Errno::NOSPC {
                return Err(ExtentError::NoSpace);
            }
            return Err(anyhow::Error::new(e)
                .context(format!("fallocate of {size} bytes for {path}"))
                .into());
        }
        file.sync_all()?;
        self.filefrag(path)
    }

    fn query(&self, path: &Utf8Path) -> Result<Vec<Extent>, ExtentError> {
        self.filefrag(path)
    }

    fn verify_pinned(&self, path: &Utf8Path, extents: &[Extent]) -> Result<bool, ExtentError> {
        let current = self.filefrag(path)?;
        Ok(current == extents)
    }

    fn backing_device(&self, path: &Utf8Path) -> Result<Utf8PathBuf, ExtentError> {
        let o: FindmntOutput = Command::new("findmnt")
            .args(["-J", "-T"])
            .arg(path)
            .run_and_parse_json()
            .with_context(|| format!("Resolving backing device of {path}"))?;
        let fs = o
            .filesystems
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("findmnt reported no filesystem for {path}"))?;
        Ok(fs.source.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_filefrag() {
        let fixture = indoc! {"
            Filesystem type is: ef53
            File size of userdata_gsi.img is 10485760 (20480 blocks of 512 bytes)
             ext:     logical_offset:        physical_offset: length:   expected: flags:
               0:        0..    8191:     278528..    286719:   8192:
               1:     8192..   20479:     417792..    430079:  12288:     286720: last,eof
            userdata_gsi.img: 2 extents found
        "};
        let extents: Vec<Extent> = fixture.lines().filter_map(parse_filefrag_line).collect();
        assert_eq!(
            extents,
            vec![
                Extent {
                    physical_sector: 278528,
                    sector_count: 8192
                },
                Extent {
                    physical_sector: 417792,
                    sector_count: 12288
                },
            ]
        );
        assert_eq!(extents_num_bytes(&extents), 20480 * 512);
    }

    #[test]
    fn test_parse_findmnt() {
        let fixture = r#"{"filesystems": [{"target":"/data","source":"/dev/sda2","fstype":"ext4","options":"rw"}]}"#;
        let o: FindmntOutput = serde_json::from_str(fixture).unwrap();
        assert_eq!(o.filesystems[0].source, "/dev/sda2");
    }
}
