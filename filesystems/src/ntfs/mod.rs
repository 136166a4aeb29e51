// NTFS read/write driver.
// Read support covers resident, non-resident, sparse and LZ-compressed
// $DATA; write support is limited to resident attribute values.

pub mod attributes;
pub mod boot_sector;
pub mod compression;
pub mod data;
pub mod data_runs;
pub mod file;
pub mod fixup;
pub mod index;
pub mod mft;
pub mod structures;
pub mod volume;

pub use boot_sector::{BootSector, Geometry};
pub use data_runs::DataRun;
pub use index::DirEntryInfo;
pub use mft::{AttrInfo, MftRecord, RecordInfo};
pub use volume::{Extent, NtfsVolume, VolumeInfo};
