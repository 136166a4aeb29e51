// Multi-sector update-sequence (fix-up) handling for FILE and INDX records.

use crate::ntfs::structures::{le_u16, put_le_u16};
use log::debug;
use stagefs_core::{FsError, SECTOR_SIZE};

pub const MFT_MAGIC: &[u8; 4] = b"FILE";
pub const INDEX_MAGIC: &[u8; 4] = b"INDX";

/// Validate a multi-sector record in place.
///
/// Checks the magic, verifies that every protected sector ends with the
/// update-sequence number, and restores the original last two bytes of each
/// sector from the update-sequence array.
pub fn apply_fixup(buf: &mut [u8], magic: &[u8; 4]) -> Result<(), FsError> {
    let sectors = precheck(buf, magic)?;
    let usa_offset = le_u16(buf, 4) as usize;
    let usn = le_u16(buf, usa_offset);

    for i in 0..sectors {
        let tail = (i + 1) * SECTOR_SIZE - 2;
        if le_u16(buf, tail) != usn {
            debug!("fixup signature mismatch in sector {}", i);
            return Err(FsError::Corrupt("fixup signature mismatch".to_string()));
        }
        let original = le_u16(buf, usa_offset + 2 * (i + 1));
        put_le_u16(buf, tail, original);
    }
    Ok(())
}

/// Invert [`apply_fixup`] before writing a mutated record back to disk:
/// stash the current last two bytes of each sector into the array and stamp
/// the update-sequence number in their place.
pub fn stamp_fixup(buf: &mut [u8], magic: &[u8; 4]) -> Result<(), FsError> {
    let sectors = precheck(buf, magic)?;
    let usa_offset = le_u16(buf, 4) as usize;
    let usn = le_u16(buf, usa_offset);

    for i in 0..sectors {
        let tail = (i + 1) * SECTOR_SIZE - 2;
        let original = le_u16(buf, tail);
        put_le_u16(buf, usa_offset + 2 * (i + 1), original);
        put_le_u16(buf, tail, usn);
    }
    Ok(())
}

fn precheck(buf: &[u8], magic: &[u8; 4]) -> Result<usize, FsError> {
    if buf.len() < SECTOR_SIZE || buf.len() % SECTOR_SIZE != 0 {
        return Err(FsError::Corrupt("record is not a sector multiple".to_string()));
    }
    if &buf[..4] != magic {
        debug!(
            "{} label not found",
            String::from_utf8_lossy(magic)
        );
        return Err(FsError::Corrupt(format!(
            "{} label not found",
            String::from_utf8_lossy(magic)
        )));
    }

    let usa_offset = le_u16(buf, 4) as usize;
    let usa_count = le_u16(buf, 6) as usize;
    let sectors = buf.len() / SECTOR_SIZE;
    if usa_count == 0 || usa_count - 1 != sectors {
        debug!("fixup covers {} sectors, record has {}", usa_count.saturating_sub(1), sectors);
        return Err(FsError::Corrupt("fixup size mismatch".to_string()));
    }
    if usa_offset + 2 * usa_count > buf.len() || usa_offset + 2 * usa_count > SECTOR_SIZE - 2 {
        return Err(FsError::Corrupt("fixup array out of range".to_string()));
    }
    Ok(sectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_up_record() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[..4].copy_from_slice(b"FILE");
        data[4..6].copy_from_slice(&0x30u16.to_le_bytes()); // USA offset
        data[6..8].copy_from_slice(&3u16.to_le_bytes()); // USN + 2 entries

        // USN and the stashed originals
        data[0x30..0x32].copy_from_slice(&0x0001u16.to_le_bytes());
        data[0x32..0x34].copy_from_slice(&0xAABBu16.to_le_bytes());
        data[0x34..0x36].copy_from_slice(&0xCCDDu16.to_le_bytes());

        // Sector tails hold the USN on disk
        data[510..512].copy_from_slice(&0x0001u16.to_le_bytes());
        data[1022..1024].copy_from_slice(&0x0001u16.to_le_bytes());
        data
    }

    #[test]
    fn test_apply_restores_tails() {
        let mut data = fixed_up_record();
        apply_fixup(&mut data, MFT_MAGIC).unwrap();
        assert_eq!(&data[510..512], &0xAABBu16.to_le_bytes());
        assert_eq!(&data[1022..1024], &0xCCDDu16.to_le_bytes());
    }

    #[test]
    fn test_stamp_round_trip() {
        let mut data = fixed_up_record();
        let on_disk = data.clone();
        apply_fixup(&mut data, MFT_MAGIC).unwrap();
        stamp_fixup(&mut data, MFT_MAGIC).unwrap();
        assert_eq!(data, on_disk);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = fixed_up_record();
        data[0] = b'X';
        assert!(apply_fixup(&mut data, MFT_MAGIC).is_err());
    }

    #[test]
    fn test_corrupted_tail() {
        let mut data = fixed_up_record();
        data[510] = 0x55;
        assert!(apply_fixup(&mut data, MFT_MAGIC).is_err());
    }

    #[test]
    fn test_sector_count_mismatch() {
        let mut data = fixed_up_record();
        data[6..8].copy_from_slice(&2u16.to_le_bytes()); // claims one sector
        assert!(apply_fixup(&mut data, MFT_MAGIC).is_err());
    }
}
