//! Streaming sinks for partition contents.
//!
//! Writes target either the mapped block device directly, or a set of
//! split data files when the host cannot present the image as a single
//! device. Either way, short writes are retried to completion and a
//! flush durably syncs everything written so far.

use std::fs::File;
use std::io::Write;

use anyhow::anyhow;

use crate::imagestore::{ImageError, ImageResult, MappedDevice};

/// A file of a split image, with the capacity the extents pin for it.
struct SplitPart {
    file: File,
    capacity: u64,
    written: u64,
}

/// User-space writer over the data files of a (possibly split) image.
pub(crate) struct SplitFileWriter {
    parts: Vec<SplitPart>,
    current: usize,
}

impl SplitFileWriter {
    pub(crate) fn new(files: Vec<(File, u64)>) -> Self {
        let parts = files
            .into_iter()
            .map(|(file, capacity)| SplitPart {
                file,
                capacity,
                written: 0,
            })
            .collect();
        Self { parts, current: 0 }
    }

    pub(crate) fn write(&mut self, mut data: &[u8]) -> ImageResult<()> {
        while !data.is_empty() {
            let part = match self.parts.get_mut(self.current) {
                Some(part) if part.written < part.capacity => part,
                Some(_) => {
                    self.current += 1;
                    continue;
                }
                None => return Err(anyhow!("write past the end of the split image").into()),
            };
            let n = data.len().min((part.capacity - part.written) as usize);
            part.file.write_all(&data[..n])?;
            part.written += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> ImageResult<()> {
        for part in &self.parts {
            part.file.sync_all()?;
        }
        Ok(())
    }
}

/// The streaming sink handed to an install session: a block device over
/// the mapped image, or the split-file fallback.
pub(crate) enum PartitionWriter {
    Device { device: MappedDevice, size: u64 },
    Split { writer: SplitFileWriter, size: u64 },
}

impl PartitionWriter {
    pub(crate) fn device(device: MappedDevice, size: u64) -> Self {
        Self::Device { device, size }
    }

    pub(crate) fn split(writer: SplitFileWriter, size: u64) -> Self {
        Self::Split { writer, size }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> ImageResult<()> {
        match self {
            Self::Device { device, .. } => {
                device.file_mut().write_all(data).map_err(ImageError::from)
            }
            Self::Split { writer, .. } => writer.write(data),
        }
    }

    pub(crate) fn flush(&mut self) -> ImageResult<()> {
        match self {
            Self::Device { device, .. } => {
                device.file_mut().sync_all().map_err(ImageError::from)
            }
            Self::Split { writer, .. } => writer.flush(),
        }
    }

    /// The logical size of the partition being written.
    pub(crate) fn size(&self) -> u64 {
        match self {
            Self::Device { size, .. } | Self::Split { size, .. } => *size,
        }
    }

    /// Release the sink, unmapping the device if one was held.
    pub(crate) fn close(self) -> ImageResult<()> {
        match self {
            Self::Device { device, .. } => device.close(),
            Self::Split { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempfiles(sizes: &[u64]) -> (tempfile::TempDir, Vec<(File, u64)>) {
        let dir = tempfile::tempdir().unwrap();
        let files = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let path = dir.path().join(format!("part{i}"));
                let file = File::create(path).unwrap();
                file.set_len(size).unwrap();
                (File::options().write(true).open(dir.path().join(format!("part{i}"))).unwrap(), size)
            })
            .collect();
        (dir, files)
    }

    #[test]
    fn test_split_write_spans_parts() {
        let (dir, files) = tempfiles(&[8, 8]);
        let mut writer = SplitFileWriter::new(files);
        writer.write(b"0123456789ab").unwrap();
        writer.write(b"cdef").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read(dir.path().join("part0")).unwrap(), b"01234567");
        assert_eq!(std::fs::read(dir.path().join("part1")).unwrap(), b"89abcdef");
    }

    #[test]
    fn test_split_write_rejects_overflow() {
        let (_dir, files) = tempfiles(&[4]);
        let mut writer = SplitFileWriter::new(files);
        writer.write(b"1234").unwrap();
        assert!(writer.write(b"5").is_err());
    }
}
