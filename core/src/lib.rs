pub mod device;
pub mod error;

pub use device::{BlockDevice, FileDevice, MemoryDevice, SECTOR_SIZE};
pub use error::FsError;
