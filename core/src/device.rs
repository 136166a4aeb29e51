// Block device abstraction for the filesystem drivers.
// Drivers see the device as an array of 512-byte sectors.

use crate::error::FsError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Sector size every driver in this workspace assumes.
pub const SECTOR_SIZE: usize = 512;

/// Synchronous sector-granular access to a volume.
///
/// Buffers must be a whole multiple of [`SECTOR_SIZE`]; access past the end
/// of the device is an error.
pub trait BlockDevice {
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError>;
    fn total_sectors(&self) -> u64;
}

fn check_range(lba: u64, len: usize, total: u64) -> Result<(), FsError> {
    if len % SECTOR_SIZE != 0 {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("buffer length {} is not sector aligned", len),
        )));
    }
    let count = (len / SECTOR_SIZE) as u64;
    if lba.checked_add(count).map_or(true, |end| end > total) {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("sector range {}+{} past end of device ({})", lba, count, total),
        )));
    }
    Ok(())
}

/// Vec-backed device, mainly for tests and image inspection.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryDevice { data }
    }

    pub fn zeroed(sectors: u64) -> Self {
        MemoryDevice {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        check_range(lba, buf.len(), self.total_sectors())?;
        let start = lba as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        check_range(lba, buf.len(), self.total_sectors())?;
        let start = lba as usize * SECTOR_SIZE;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }
}

/// Image-file-backed device.
pub struct FileDevice {
    file: File,
    sectors: u64,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        trace!("opened image {:?}: {} sectors", path.as_ref(), sectors);
        Ok(FileDevice { file, sectors })
    }
}

impl BlockDevice for FileDevice {
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        check_range(lba, buf.len(), self.sectors)?;
        self.file.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        check_range(lba, buf.len(), self.sectors)?;
        self.file.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.sectors
    }
}
