// Filesystem drivers for the bootloader file-system layer.
// NTFS is the only family implemented so far.

pub mod ntfs;

pub use ntfs::{DirEntryInfo, Extent, NtfsVolume, VolumeInfo};
