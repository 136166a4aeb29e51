// MFT record handles and the record loader.

use std::fmt;

use log::debug;
use stagefs_core::{BlockDevice, FsError, SECTOR_SIZE};

use crate::ntfs::attributes::AttrForm;
use crate::ntfs::data_runs::{decode_data_runs, DataRun};
use crate::ntfs::fixup::{apply_fixup, MFT_MAGIC};
use crate::ntfs::structures::*;
use crate::ntfs::volume::NtfsVolume;

/// A fix-up-validated MFT record, owned by the caller.
#[derive(Debug, Clone)]
pub struct MftRecord {
    buf: Vec<u8>,
    /// Header bytes captured when the fix-up was applied; the resident
    /// write path refuses records whose identity no longer matches.
    snapshot: [u8; 0x30],
}

impl MftRecord {
    /// Wrap a buffer that already passed fix-up validation.
    pub(crate) fn from_validated(buf: Vec<u8>) -> Result<MftRecord, FsError> {
        if buf.len() < 0x30 {
            return Err(FsError::Corrupt("MFT record too short".to_string()));
        }
        let mut snapshot = [0u8; 0x30];
        snapshot.copy_from_slice(&buf[..0x30]);
        let rec = MftRecord { buf, snapshot };
        if rec.attrs_offset() >= rec.buf.len() {
            return Err(FsError::Corrupt("attribute offset out of range".to_string()));
        }
        Ok(rec)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn header(&self) -> MftRecordHeader {
        unsafe { std::ptr::read_unaligned(self.buf.as_ptr() as *const MftRecordHeader) }
    }

    pub fn flags(&self) -> u16 {
        self.header().flags
    }

    pub fn is_in_use(&self) -> bool {
        self.flags() & RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags() & RECORD_IS_DIRECTORY != 0
    }

    pub fn record_number(&self) -> u32 {
        self.header().record_number
    }

    pub fn base_record(&self) -> u64 {
        self.header().base_record
    }

    pub(crate) fn attrs_offset(&self) -> usize {
        self.header().attrs_offset as usize
    }

    /// Whether the record is still the one the snapshot was taken from.
    pub(crate) fn matches_snapshot(&self) -> bool {
        self.buf[..0x30] == self.snapshot
    }
}

/// Summary of one attribute, for the record dump.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub type_code: u32,
    pub name: String,
    pub resident: bool,
    pub compressed: bool,
    pub encrypted: bool,
    pub sparse: bool,
    pub size: u64,
    pub start_vcn: u64,
    /// Record the attribute actually lives in.
    pub from_record: u32,
    /// Decoded extents of a non-resident attribute held in the base record.
    pub runs: Option<Vec<DataRun>>,
}

/// Summary of the currently open MFT record.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub record_number: u32,
    pub is_directory: bool,
    pub base_record: u64,
    pub attrs: Vec<AttrInfo>,
}

pub(crate) fn attr_type_name(type_code: u32) -> &'static str {
    match type_code {
        ATTR_TYPE_STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        ATTR_TYPE_ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        ATTR_TYPE_FILE_NAME => "$FILE_NAME",
        ATTR_TYPE_OBJECT_ID => "$OBJECT_ID",
        ATTR_TYPE_SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        ATTR_TYPE_VOLUME_NAME => "$VOLUME_NAME",
        ATTR_TYPE_VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        ATTR_TYPE_DATA => "$DATA",
        ATTR_TYPE_INDEX_ROOT => "$INDEX_ROOT",
        ATTR_TYPE_INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        ATTR_TYPE_BITMAP => "$BITMAP",
        _ => "$UNKNOWN",
    }
}

impl fmt::Display for RecordInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Type: {}",
            if self.is_directory { "Directory" } else { "File" }
        )?;
        if self.base_record != 0 {
            writeln!(f, "Base: 0x{:X}", self.base_record)?;
        }
        writeln!(f, "Attr:")?;
        for a in &self.attrs {
            write!(
                f,
                "  {} (0x{:X}) ({}",
                attr_type_name(a.type_code),
                a.type_code,
                if a.resident { "r" } else { "nr" }
            )?;
            if a.compressed {
                write!(f, ",c")?;
            }
            if a.encrypted {
                write!(f, ",e")?;
            }
            if a.sparse {
                write!(f, ",s")?;
            }
            if a.from_record != self.record_number {
                write!(f, ",mft=0x{:X}", a.from_record)?;
                if !a.resident {
                    write!(f, ",vcn=0x{:X}", a.start_vcn)?;
                }
            }
            if !a.name.is_empty() {
                write!(f, ",nm={}", a.name)?;
            }
            writeln!(f, ",sz={})", a.size)?;
            if let Some(runs) = &a.runs {
                write!(f, "    ")?;
                for (i, run) in runs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match run.lcn {
                        Some(lcn) => write!(f, "{}+{}", lcn, run.length)?,
                        None => write!(f, "(+{})", run.length)?,
                    }
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Load MFT record `mftno` through the $MFT extent map and validate its
    /// fix-up.
    pub(crate) fn read_mft(&mut self, mftno: u64) -> Result<MftRecord, FsError> {
        let record_bytes = self.geom.mft_record_bytes();
        let base = mftno
            .checked_mul(record_bytes)
            .ok_or_else(|| FsError::Corrupt("MFT record number overflow".to_string()))?;
        if base + record_bytes > self.mft_data_size {
            debug!("read MFT 0x{:X} fails: past $MFT data", mftno);
            return Err(FsError::Corrupt(format!("MFT record {} out of range", mftno)));
        }

        let mut buf = vec![0u8; record_bytes as usize];
        // Records may straddle an extent boundary; resolve per sector.
        for k in 0..self.geom.mft_sectors as u64 {
            let sector = self.mft_map.sector_of(base + k * SECTOR_SIZE as u64, &self.geom)?;
            let start = (k as usize) * SECTOR_SIZE;
            self.devread(sector, 0, SECTOR_SIZE as u64, Some(&mut buf[start..start + SECTOR_SIZE]))?;
        }

        if let Err(err) = apply_fixup(&mut buf, MFT_MAGIC) {
            debug!("invalid MFT record 0x{:X}: {}", mftno, err);
            return Err(err);
        }
        let rec = MftRecord::from_validated(buf)?;
        self.fixup_snapshot = Some(rec.record_number());
        Ok(rec)
    }

    /// Attribute summary of the currently open record.
    pub fn record_info(&mut self) -> Result<RecordInfo, FsError> {
        let of = self
            .open
            .take()
            .ok_or_else(|| FsError::Corrupt("no open file".to_string()))?;

        let result = (|| {
            let mut info = RecordInfo {
                record_number: of.rec.record_number(),
                is_directory: of.rec.is_directory(),
                base_record: of.rec.base_record(),
                attrs: Vec::new(),
            };
            let mut cur = self.init_attr(&of.rec);
            while let Some(attr) = self.find_attr(&of.rec, &mut cur, None)? {
                let local = attr.source_record == of.rec.record_number();
                let runs = match (&attr.form, local) {
                    (AttrForm::NonResident { .. }, true) => {
                        Some(decode_data_runs(attr.run_data()?)?)
                    }
                    _ => None,
                };
                info.attrs.push(AttrInfo {
                    type_code: attr.type_code,
                    name: attr.name.clone(),
                    resident: attr.is_resident(),
                    compressed: attr.flags & ATTR_FLAG_COMPRESSED != 0,
                    encrypted: attr.flags & ATTR_FLAG_ENCRYPTED != 0,
                    sparse: attr.flags & ATTR_FLAG_SPARSE != 0,
                    size: attr.data_size(),
                    start_vcn: attr.start_vcn(),
                    from_record: attr.source_record,
                    runs,
                });
            }
            Ok(info)
        })();

        self.open = Some(of);
        result
    }

    /// Raw bytes of the currently open MFT record, fix-up applied.
    pub fn record_bytes(&self) -> Option<&[u8]> {
        self.open.as_ref().map(|of| of.rec.bytes())
    }
}
