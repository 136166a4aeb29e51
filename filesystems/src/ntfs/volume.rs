// Volume mount and the sector I/O adapter.

use std::fmt;

use log::{debug, trace};
use stagefs_core::{BlockDevice, FsError, SECTOR_SIZE};

use crate::ntfs::attributes::{AttrForm, Attribute, AttrListEntry};
use crate::ntfs::boot_sector::{BootSector, Geometry};
use crate::ntfs::data_runs::{decode_data_runs, ExtentMap};
use crate::ntfs::file::OpenFile;
use crate::ntfs::fixup::{apply_fixup, MFT_MAGIC};
use crate::ntfs::mft::MftRecord;
use crate::ntfs::structures::*;

/// Per-sector read-trace callback: `(sector, byte_offset, length)`.
/// Armed only while cached, uncompressed, unsparse $DATA is being read, so
/// a caller can collect the physical extent chain of the open file.
pub type ReadTrace = Box<dyn FnMut(u64, u32, u64)>;

/// One physical extent reported through the read trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub sector: u64,
    pub offset: u32,
    pub len: u64,
}

/// One-line block cache (the `sbuf`/`save_pos` pair).
#[derive(Debug)]
pub(crate) struct BlockCache {
    pub(crate) buf: Vec<u8>,
    /// Byte offset, within the open $DATA, of `buf[0]`.
    pub(crate) pos: u64,
    pub(crate) valid: bool,
}

/// A mounted NTFS volume.
///
/// One operation at a time: the open-file state, the block cache and the
/// trace hook are all per-volume.
pub struct NtfsVolume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) geom: Geometry,
    /// Materialized VCN mapping of $MFT's own $DATA.
    pub(crate) mft_map: ExtentMap,
    /// Real size of $MFT's $DATA.
    pub(crate) mft_data_size: u64,
    pub(crate) cache: BlockCache,
    pub(crate) trace: Option<ReadTrace>,
    pub(crate) trace_armed: bool,
    /// Record number of the most recently fix-up-validated FILE record;
    /// INDX validations clear it. Guards the resident write path.
    pub(crate) fixup_snapshot: Option<u32>,
    pub(crate) open: Option<OpenFile>,
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Parse the boot sector, derive the geometry and prime the $MFT
    /// mapping.
    pub fn mount(mut dev: D) -> Result<Self, FsError> {
        let mut sector0 = vec![0u8; SECTOR_SIZE];
        dev.read_sectors(0, &mut sector0)?;
        let bs = BootSector::parse(&sector0)?;
        let geom = bs.geometry()?;

        let mut buf = vec![0u8; geom.mft_record_bytes() as usize];
        dev.read_sectors(geom.mft_start, &mut buf)?;
        apply_fixup(&mut buf, MFT_MAGIC)?;
        let rec0 = MftRecord::from_validated(buf)?;

        let mut vol = NtfsVolume {
            dev,
            geom,
            mft_map: ExtentMap::new(),
            mft_data_size: 0,
            cache: BlockCache {
                buf: Vec::new(),
                pos: 0,
                valid: false,
            },
            trace: None,
            trace_armed: false,
            fixup_snapshot: None,
            open: None,
        };
        vol.bootstrap_mft_map(&rec0)?;
        debug!(
            "mounted: {} clusters of $MFT data mapped, {} bytes real",
            vol.mft_map.covered_clusters(),
            vol.mft_data_size
        );
        Ok(vol)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            block_size: SECTOR_SIZE as u32,
            sectors_per_cluster: self.geom.spc,
            mft_record_bytes: self.geom.mft_record_bytes() as u32,
            idx_record_bytes: self.geom.idx_record_bytes() as u32,
            mft_start_sector: self.geom.mft_start,
        }
    }

    /// Access the underlying block device.
    pub fn device_ref(&self) -> &D {
        &self.dev
    }

    /// Install or clear the read-trace hook.
    pub fn set_read_trace(&mut self, hook: Option<ReadTrace>) {
        self.trace = hook;
        self.trace_armed = false;
    }

    pub(crate) fn suspend_trace(&mut self) -> bool {
        std::mem::replace(&mut self.trace_armed, false)
    }

    pub(crate) fn restore_trace(&mut self, armed: bool) {
        self.trace_armed = armed;
    }

    /// Report a physical extent to the trace hook, bypassing arming (the
    /// resident path and the precise head/tail reports use this).
    pub(crate) fn report_extent(&mut self, sector: u64, offset: u32, len: u64) {
        if let Some(hook) = self.trace.as_mut() {
            hook(sector, offset, len);
        }
    }

    /// Read `len` bytes at `offset` bytes into `sector`. `dest = None`
    /// suppresses the device access but still reports the extent, which is
    /// how list-blocks traversals run.
    pub(crate) fn devread(
        &mut self,
        sector: u64,
        offset: u32,
        len: u64,
        dest: Option<&mut [u8]>,
    ) -> Result<(), FsError> {
        if self.trace_armed {
            self.report_extent(sector, offset, len);
        }
        let dest = match dest {
            Some(d) => d,
            None => return Ok(()),
        };
        debug_assert!(dest.len() as u64 >= len);

        if offset == 0 && len % SECTOR_SIZE as u64 == 0 {
            return self.dev.read_sectors(sector, &mut dest[..len as usize]);
        }
        let span = (offset as u64 + len + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64;
        let mut tmp = vec![0u8; (span as usize) * SECTOR_SIZE];
        self.dev.read_sectors(sector, &mut tmp)?;
        dest[..len as usize].copy_from_slice(&tmp[offset as usize..offset as usize + len as usize]);
        Ok(())
    }

    /// Build the extent map of $MFT's $DATA, following its attribute list
    /// when the runs are spread over child records. Child records are
    /// located through the map built so far, which is what makes the
    /// bootstrap terminate.
    fn bootstrap_mft_map(&mut self, rec0: &MftRecord) -> Result<(), FsError> {
        let mut local_data = None;
        let mut list_attr = None;
        let mut off = rec0.attrs_offset();
        while let Some(attr) = Attribute::parse(rec0.bytes(), off, rec0.record_number())? {
            off += attr.raw.len();
            match attr.type_code {
                ATTR_TYPE_DATA if attr.name.is_empty() && local_data.is_none() => {
                    local_data = Some(attr)
                }
                ATTR_TYPE_ATTRIBUTE_LIST => list_attr = Some(attr),
                _ => {}
            }
        }

        let list_attr = match list_attr {
            None => {
                // The common case: every $DATA run is in record 0.
                let data = local_data.ok_or_else(|| {
                    debug!("no $DATA in master MFT");
                    FsError::Corrupt("no $DATA in master MFT".to_string())
                })?;
                self.prime_from(&data, 0)?;
                return Ok(());
            }
            Some(a) => a,
        };

        // Collect the $DATA entries of the list, in order.
        let list = self.read_whole_list(rec0, &list_attr)?;
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while let Some(e) = AttrListEntry::parse(&list, pos)? {
            pos += e.length as usize;
            if e.type_code == ATTR_TYPE_DATA {
                entries.push(e);
            }
        }
        let first = entries.first().ok_or_else(|| {
            FsError::Corrupt("attribute list has no $DATA entries".to_string())
        })?;
        if first.start_vcn != 0 {
            return Err(FsError::Corrupt("first $MFT fragment does not start at VCN 0".to_string()));
        }

        // The primary fragment must be in the base record itself; its runs
        // are the only ones reachable before any mapping exists.
        let data0 = local_data
            .filter(|a| a.id == first.attr_id)
            .ok_or_else(|| {
                FsError::Corrupt("primary $MFT $DATA fragment not in record 0".to_string())
            })?;
        self.prime_from(&data0, 0)?;

        for entry in &entries[1..] {
            let rec = self.read_mft_bootstrap(entry.child_ref as u64)?;
            let mut off = rec.attrs_offset();
            let mut frag = None;
            while let Some(attr) = Attribute::parse(rec.bytes(), off, rec.record_number())? {
                off += attr.raw.len();
                if attr.type_code == ATTR_TYPE_DATA && attr.id == entry.attr_id {
                    frag = Some(attr);
                    break;
                }
            }
            let frag = frag.ok_or_else(|| {
                FsError::Corrupt(format!(
                    "$DATA fragment missing from MFT record {}",
                    entry.child_ref
                ))
            })?;
            match frag.form {
                AttrForm::NonResident { start_vcn, .. } => {
                    trace!(
                        "$MFT fragment at VCN {} from record {}",
                        start_vcn,
                        entry.child_ref
                    );
                    let runs = decode_data_runs(frag.run_data()?)?;
                    self.mft_map.push_runs(start_vcn, &runs)?;
                }
                AttrForm::Resident { .. } => {
                    return Err(FsError::Corrupt("$MFT $DATA should be non-resident".to_string()))
                }
            }
        }
        Ok(())
    }

    fn prime_from(&mut self, data: &Attribute, expect_vcn: u64) -> Result<(), FsError> {
        match data.form {
            AttrForm::NonResident {
                start_vcn,
                data_size,
                ..
            } => {
                if start_vcn != expect_vcn {
                    return Err(FsError::Corrupt(
                        "primary $MFT fragment does not start at VCN 0".to_string(),
                    ));
                }
                let runs = decode_data_runs(data.run_data()?)?;
                self.mft_map.push_runs(start_vcn, &runs)?;
                self.mft_data_size = data_size;
                Ok(())
            }
            AttrForm::Resident { .. } => {
                Err(FsError::Corrupt("$MFT $DATA should be non-resident".to_string()))
            }
        }
    }

    /// Whole-content read of $MFT's attribute list. The list is never
    /// itself listed, so its runs are complete in the base record.
    fn read_whole_list(
        &mut self,
        rec0: &MftRecord,
        list_attr: &Attribute,
    ) -> Result<Vec<u8>, FsError> {
        if list_attr.is_resident() {
            return Ok(list_attr.value()?.to_vec());
        }
        let total = list_attr.data_size();
        let read_len = (total + SECTOR_SIZE as u64 - 1) & !(SECTOR_SIZE as u64 - 1);
        let mut buf = vec![0u8; read_len as usize];
        self.read_data(rec0, None, list_attr, Some(&mut buf), 0, read_len, false)?;
        buf.truncate(total as usize);
        Ok(buf)
    }

    /// Record load used only while the map is being built: identical to
    /// `read_mft` except that the record merely has to be inside the
    /// mapped prefix.
    fn read_mft_bootstrap(&mut self, mftno: u64) -> Result<MftRecord, FsError> {
        let record_bytes = self.geom.mft_record_bytes();
        let base = mftno * record_bytes;
        let mut buf = vec![0u8; record_bytes as usize];
        for k in 0..self.geom.mft_sectors as u64 {
            let sector = self.mft_map.sector_of(base + k * SECTOR_SIZE as u64, &self.geom)?;
            let start = (k as usize) * SECTOR_SIZE;
            self.devread(sector, 0, SECTOR_SIZE as u64, Some(&mut buf[start..start + SECTOR_SIZE]))?;
        }
        apply_fixup(&mut buf, MFT_MAGIC)?;
        MftRecord::from_validated(buf)
    }
}

/// Mount-time facts, for display.
#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub block_size: u32,
    pub sectors_per_cluster: u32,
    pub mft_record_bytes: u32,
    pub idx_record_bytes: u32,
    pub mft_start_sector: u64,
}

impl fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "blocksize: {}", self.block_size)?;
        writeln!(f, "spc: {}", self.sectors_per_cluster)?;
        writeln!(f, "mft_size: {}", self.mft_record_bytes)?;
        writeln!(f, "idx_size: {}", self.idx_record_bytes)?;
        write!(f, "mft_start: 0x{:X}", self.mft_start_sector)
    }
}
