//! Compact on-disk partition-table blobs.
//!
//! Each backing image persists a table describing where its bytes live on
//! the underlying block device, so first-stage boot can reconstruct the
//! device-mapper table without a filesystem driver. The format is a
//! little-endian binary blob with an adler-style checksum trailer.

use camino::Utf8PathBuf;
use dsid_blockdev::Extent;

const MAGIC: u32 = 0x5450_5344; // "DSPT"
const VERSION: u16 = 1;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("bad magic in table blob")]
    BadMagic,
    #[error("unsupported table version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated table blob")]
    Truncated,
    #[error("table checksum mismatch")]
    Checksum,
    #[error("malformed table: {0}")]
    Malformed(String),
}

/// Attributes persisted with a partition entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionFlags(u32);

impl PartitionFlags {
    /// Consumers should mount the partition read-only; mapping writable
    /// is still permitted (the installer itself writes the image).
    pub const READONLY: PartitionFlags = PartitionFlags(1 << 0);
    /// The image was zero-filled at creation.
    pub const ZEROED: PartitionFlags = PartitionFlags(1 << 1);
    /// Retained on disk but excluded from boot; reclaimable.
    pub const DISABLED: PartitionFlags = PartitionFlags(1 << 2);

    const ALL: u32 = 0b111;

    pub fn contains(self, other: PartitionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PartitionFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }
}

/// One file of a (possibly split) backing image and the extents it pins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    /// File name relative to the data directory.
    pub file: String,
    pub extents: Vec<Extent>,
}

impl ImagePart {
    pub fn num_bytes(&self) -> u64 {
        dsid_blockdev::extents_num_bytes(&self.extents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub flags: PartitionFlags,
    /// Requested logical size; the pinned capacity below may be larger
    /// due to block alignment.
    pub size: u64,
    pub parts: Vec<ImagePart>,
}

impl PartitionEntry {
    /// All extents in logical order, across split files.
    pub fn extents(&self) -> Vec<Extent> {
        self.parts.iter().flat_map(|p| p.extents.clone()).collect()
    }

    pub fn capacity(&self) -> u64 {
        self.parts.iter().map(ImagePart::num_bytes).sum()
    }

    pub fn extent_count(&self) -> usize {
        self.parts.iter().map(|p| p.extents.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// Block device hosting the data filesystem; the device the extents
    /// index into.
    pub source_device: Utf8PathBuf,
    pub sector_size: u32,
    pub partitions: Vec<PartitionEntry>,
}

// Adler-32, inlined; the blob is small and we want zero format deps.
fn checksum(data: &[u8]) -> u32 {
    let (mut a, mut b) = (1u32, 0u32);
    for &byte in data {
        a = (a + u32::from(byte)) % 65521;
        b = (b + a) % 65521;
    }
    (b << 16) | a
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TableError> {
        if self.buf.len() < n {
            return Err(TableError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, TableError> {
        // SAFETY: take() returned exactly two bytes
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, TableError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, TableError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, TableError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TableError::Malformed("non UTF-8 string".into()))
    }
}

impl PartitionTable {
    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&VERSION.to_le_bytes());
        put_str(&mut buf, self.source_device.as_str());
        buf.extend_from_slice(&self.sector_size.to_le_bytes());
        buf.extend_from_slice(&(self.partitions.len() as u16).to_le_bytes());
        for partition in &self.partitions {
            put_str(&mut buf, &partition.name);
            buf.extend_from_slice(&partition.flags.bits().to_le_bytes());
            buf.extend_from_slice(&partition.size.to_le_bytes());
            buf.extend_from_slice(&(partition.parts.len() as u16).to_le_bytes());
            for part in &partition.parts {
                put_str(&mut buf, &part.file);
                buf.extend_from_slice(&(part.extents.len() as u16).to_le_bytes());
                for extent in &part.extents {
                    buf.extend_from_slice(&extent.physical_sector.to_le_bytes());
                    buf.extend_from_slice(&extent.sector_count.to_le_bytes());
                }
            }
        }
        let sum = checksum(&buf);
        buf.extend_from_slice(&sum.to_le_bytes());
        buf
    }

    pub fn decode(blob: &[u8]) -> Result<Self, TableError> {
        if blob.len() < 4 {
            return Err(TableError::Truncated);
        }
        let (payload, trailer) = blob.split_at(blob.len() - 4);
        // SAFETY: split_at left exactly four bytes
        let stored = u32::from_le_bytes(trailer.try_into().unwrap());
        if checksum(payload) != stored {
            return Err(TableError::Checksum);
        }

        let mut r = Reader { buf: payload };
        if r.u32()? != MAGIC {
            return Err(TableError::BadMagic);
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(TableError::UnsupportedVersion(version));
        }
        let source_device = Utf8PathBuf::from(r.string()?);
        let sector_size = r.u32()?;
        let partition_count = r.u16()?;
        let mut partitions = Vec::with_capacity(partition_count as usize);
        for _ in 0..partition_count {
            let name = r.string()?;
            let flags = PartitionFlags::from_bits(r.u32()?);
            let size = r.u64()?;
            let part_count = r.u16()?;
            let mut parts = Vec::with_capacity(part_count as usize);
            for _ in 0..part_count {
                let file = r.string()?;
                let extent_count = r.u16()?;
                let mut extents = Vec::with_capacity(extent_count as usize);
                for _ in 0..extent_count {
                    extents.push(Extent {
                        physical_sector: r.u64()?,
                        sector_count: r.u64()?,
                    });
                }
                parts.push(ImagePart { file, extents });
            }
            if parts.is_empty() {
                return Err(TableError::Malformed(format!("partition {name} has no backing file")));
            }
            partitions.push(PartitionEntry {
                name,
                flags,
                size,
                parts,
            });
        }
        if !r.buf.is_empty() {
            return Err(TableError::Malformed("trailing bytes".into()));
        }
        Ok(Self {
            source_device,
            sector_size,
            partitions,
        })
    }
}
