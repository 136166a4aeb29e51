// NTFS boot sector parsing and mount-time geometry.

use log::debug;
use stagefs_core::{FsError, SECTOR_SIZE};
use static_assertions::assert_eq_size;

/// Sectors per MFT record the driver is willing to handle (1 KiB records).
pub const MAX_MFT_SECTORS: u32 = 2;
/// Sectors per INDX record the driver is willing to handle (4 KiB records).
pub const MAX_IDX_SECTORS: u32 = 8;

/// The NTFS BIOS parameter block, as laid out on disk.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub unused: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub clusters_per_mft_record: i8,
    pub reserved1: [u8; 3],
    pub clusters_per_index_record: i8,
    pub reserved2: [u8; 3],
    pub serial_number: u64,
    pub checksum: u32,
}

assert_eq_size!(BootSector, [u8; 0x54]);

impl BootSector {
    /// Read the BPB out of the first sector of the volume.
    pub fn parse(sector: &[u8]) -> Result<BootSector, FsError> {
        if sector.len() < std::mem::size_of::<BootSector>() {
            return Err(FsError::Corrupt("boot sector too short".to_string()));
        }
        let bs = unsafe { std::ptr::read_unaligned(sector.as_ptr() as *const BootSector) };
        if &bs.oem_id != b"NTFS    " {
            return Err(FsError::Unsupported("not an NTFS volume".to_string()));
        }
        Ok(bs)
    }

    /// Mount-time validation of the fields a real NTFS volume pins down.
    pub fn validate(&self) -> Result<(), FsError> {
        let bps = self.bytes_per_sector;
        if bps as usize != SECTOR_SIZE {
            return Err(FsError::Unsupported(format!(
                "sector size {} not supported",
                bps
            )));
        }
        if self.fat_count != 0
            || self.root_entries != 0
            || self.total_sectors_16 != 0
            || self.sectors_per_fat_16 != 0
            || self.total_sectors_32 != 0
        {
            return Err(FsError::Unsupported("boot sector has FAT fields set".to_string()));
        }
        let spt = self.sectors_per_track;
        if spt.wrapping_sub(1) > 62 {
            return Err(FsError::Unsupported(format!(
                "sectors per track {} out of range",
                spt
            )));
        }
        let heads = self.head_count;
        if heads.wrapping_sub(1) > 255 {
            return Err(FsError::Unsupported(format!("head count {} out of range", heads)));
        }
        Ok(())
    }

    fn record_sectors(&self, encoded: i8, spc: u32) -> Result<u32, FsError> {
        // Positive values count clusters, negative ones are log2 of a byte size.
        let sectors = if encoded > 0 {
            spc * encoded as u32
        } else {
            let shift = (-(encoded as i32)) as u32;
            if shift < 9 || shift >= 32 {
                return Err(FsError::Unsupported(format!(
                    "bad record size encoding {}",
                    encoded
                )));
            }
            1u32 << (shift - 9)
        };
        Ok(sectors)
    }

    /// Derive the geometry the rest of the driver runs on.
    pub fn geometry(&self) -> Result<Geometry, FsError> {
        self.validate()?;

        let spc = self.sectors_per_cluster as u32;
        if spc == 0 || 128 % spc != 0 {
            return Err(FsError::Unsupported(format!(
                "sectors per cluster {} must divide 128",
                spc
            )));
        }

        let mft_sectors = self.record_sectors(self.clusters_per_mft_record, spc)?;
        let idx_sectors = self.record_sectors(self.clusters_per_index_record, spc)?;
        if mft_sectors > MAX_MFT_SECTORS {
            return Err(FsError::Unsupported(format!(
                "MFT record size {} sectors too large",
                mft_sectors
            )));
        }
        if idx_sectors > MAX_IDX_SECTORS {
            return Err(FsError::Unsupported(format!(
                "INDX record size {} sectors too large",
                idx_sectors
            )));
        }

        let geom = Geometry {
            spc,
            log2_spc: spc.trailing_zeros(),
            mft_sectors,
            idx_sectors,
            mft_start: self.mft_lcn * spc as u64,
        };
        debug!(
            "geometry: spc={} mft={}s idx={}s mft_start={}",
            geom.spc, geom.mft_sectors, geom.idx_sectors, geom.mft_start
        );
        Ok(geom)
    }
}

/// Volume geometry, derived once at mount.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Sectors per cluster; a power of two dividing 128.
    pub spc: u32,
    pub log2_spc: u32,
    /// Sectors per MFT record.
    pub mft_sectors: u32,
    /// Sectors per INDX record.
    pub idx_sectors: u32,
    /// First sector of MFT record 0.
    pub mft_start: u64,
}

impl Geometry {
    pub fn cluster_bytes(&self) -> u64 {
        self.spc as u64 * SECTOR_SIZE as u64
    }

    pub fn log2_bpc(&self) -> u32 {
        self.log2_spc + 9
    }

    pub fn mft_record_bytes(&self) -> u64 {
        self.mft_sectors as u64 * SECTOR_SIZE as u64
    }

    pub fn idx_record_bytes(&self) -> u64 {
        self.idx_sectors as u64 * SECTOR_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_boot_sector() -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[0] = 0xEB;
        data[1] = 0x52;
        data[2] = 0x90;
        data[3..11].copy_from_slice(b"NTFS    ");
        data[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        data[0x0D] = 8; // sectors per cluster
        data[0x15] = 0xF8;
        data[0x18..0x1A].copy_from_slice(&63u16.to_le_bytes());
        data[0x1A..0x1C].copy_from_slice(&255u16.to_le_bytes());
        data[0x28..0x30].copy_from_slice(&1_000_000u64.to_le_bytes());
        data[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
        data[0x38..0x40].copy_from_slice(&1000u64.to_le_bytes());
        data[0x40] = 0xF6; // -10: 1024-byte MFT records
        data[0x44] = 0xF4; // -12: 4096-byte INDX records
        data[0x1FE] = 0x55;
        data[0x1FF] = 0xAA;
        data
    }

    #[test]
    fn test_geometry_derivation() {
        let bs = BootSector::parse(&sample_boot_sector()).unwrap();
        let geom = bs.geometry().unwrap();
        assert_eq!(geom.spc, 8);
        assert_eq!(geom.mft_sectors, 2);
        assert_eq!(geom.idx_sectors, 8);
        assert_eq!(geom.mft_start, 32);
        assert_eq!(geom.cluster_bytes(), 4096);
        assert_eq!(geom.log2_bpc(), 12);
    }

    #[test]
    fn test_one_sector_record_encoding() {
        let mut raw = sample_boot_sector();
        raw[0x40] = 0xF7; // -9: 512-byte MFT records
        raw[0x44] = 0xF7; // -9: 512-byte INDX records
        let geom = BootSector::parse(&raw).unwrap().geometry().unwrap();
        assert_eq!(geom.mft_sectors, 1);
        assert_eq!(geom.idx_sectors, 1);
        assert_eq!(geom.mft_record_bytes(), 512);
    }

    #[test]
    fn test_positive_record_encoding() {
        let mut raw = sample_boot_sector();
        raw[0x0D] = 2; // 1024-byte clusters
        raw[0x40] = 1; // 1 cluster per MFT record = 2 sectors
        raw[0x44] = 4; // 4 clusters per INDX record = 8 sectors
        let geom = BootSector::parse(&raw).unwrap().geometry().unwrap();
        assert_eq!(geom.mft_sectors, 2);
        assert_eq!(geom.idx_sectors, 8);
    }

    #[test]
    fn test_rejections() {
        let mut raw = sample_boot_sector();
        raw[3] = b'E'; // break OEM id
        assert!(BootSector::parse(&raw).is_err());

        let mut raw = sample_boot_sector();
        raw[0x0B..0x0D].copy_from_slice(&4096u16.to_le_bytes());
        assert!(BootSector::parse(&raw).unwrap().geometry().is_err());

        let mut raw = sample_boot_sector();
        raw[0x0D] = 3; // does not divide 128
        assert!(BootSector::parse(&raw).unwrap().geometry().is_err());

        let mut raw = sample_boot_sector();
        raw[0x10] = 2; // FAT count must be zero
        assert!(BootSector::parse(&raw).unwrap().geometry().is_err());

        let mut raw = sample_boot_sector();
        raw[0x40] = 0xF5; // -11: 2048-byte MFT records, over the cap
        assert!(BootSector::parse(&raw).unwrap().geometry().is_err());

        let mut raw = sample_boot_sector();
        raw[0x18..0x1A].copy_from_slice(&64u16.to_le_bytes());
        assert!(BootSector::parse(&raw).unwrap().geometry().is_err());
    }
}
