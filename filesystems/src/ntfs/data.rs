// Attribute content I/O: resident values, non-resident runs, sparse
// zero-fill and compressed units, plus the one-line block cache.

use log::debug;
use stagefs_core::{BlockDevice, FsError, SECTOR_SIZE};

use crate::ntfs::attributes::{AttrCursor, AttrForm, Attribute};
use crate::ntfs::compression::{decompress_block, SliceSource};
use crate::ntfs::data_runs::{decode_data_runs, RunWalk};
use crate::ntfs::fixup::{stamp_fixup, MFT_MAGIC};
use crate::ntfs::mft::MftRecord;
use crate::ntfs::structures::*;
use crate::ntfs::volume::NtfsVolume;

/// Run-walk state for one non-resident transfer.
struct ReadCtx {
    walk: RunWalk,
    /// Cluster index of the transfer position.
    target_vcn: u64,
    /// Sector within the cluster (uncompressed transfers only).
    vcn_offset: u64,
    /// (end VCN, end LCN) spans of the current compression unit.
    table: Vec<(u64, u64)>,
    head: usize,
    /// Compressed payload of the current unit and the decode position.
    input: Vec<u8>,
    input_pos: usize,
    unit_compressed: bool,
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Read `len` bytes of the attribute at byte offset `ofs`. When the
    /// cursor is iterating an attribute list, the fragment covering the
    /// target VCN is selected first. `dest = None` traverses without
    /// copying, reporting extents through the trace hook.
    pub(crate) fn read_attr(
        &mut self,
        rec: &MftRecord,
        cur: &AttrCursor,
        attr: &Attribute,
        dest: Option<&mut [u8]>,
        ofs: u64,
        len: u64,
        cached: bool,
    ) -> Result<(), FsError> {
        if cur.list.is_some() {
            let mut walk_cur = cur.clone();
            let vcn = ofs >> self.geom.log2_bpc();
            let frag = self
                .seek_fragment(rec, &mut walk_cur, attr.type_code, vcn)?
                .ok_or_else(|| FsError::Corrupt("attribute fragment missing".to_string()))?;
            self.read_data(rec, Some(&mut walk_cur), &frag, dest, ofs, len, cached)
        } else {
            self.read_data(rec, None, attr, dest, ofs, len, cached)
        }
    }

    /// Read from one attribute record (one fragment, when a list is in
    /// force; continuations are pulled through `cur`).
    pub(crate) fn read_data(
        &mut self,
        rec: &MftRecord,
        cur: Option<&mut AttrCursor>,
        attr: &Attribute,
        dest: Option<&mut [u8]>,
        ofs: u64,
        len: u64,
        cached: bool,
    ) -> Result<(), FsError> {
        if len == 0 {
            return Ok(());
        }
        match attr.form {
            AttrForm::Resident { value_length, .. } => {
                self.read_resident(attr, value_length, dest, ofs, len)
            }
            AttrForm::NonResident { .. } => {
                let res = self.read_nonresident(rec, cur, attr, dest, ofs, len, cached);
                // The trace hook is disarmed at the operation boundary no
                // matter how the transfer went.
                self.trace_armed = false;
                res
            }
        }
    }

    fn read_resident(
        &mut self,
        attr: &Attribute,
        value_length: u32,
        dest: Option<&mut [u8]>,
        ofs: u64,
        len: u64,
    ) -> Result<(), FsError> {
        if ofs + len > value_length as u64 {
            debug!("read out of range");
            return Err(FsError::Corrupt("read out of range".to_string()));
        }
        if let Some(d) = dest {
            let value = attr.value()?;
            d[..len as usize].copy_from_slice(&value[ofs as usize..(ofs + len) as usize]);
        }

        // Report where the bytes physically live, for list-blocks callers.
        if self.trace.is_some() {
            let value_offset = match attr.form {
                AttrForm::Resident { value_offset, .. } => value_offset as usize,
                AttrForm::NonResident { .. } => unreachable!(),
            };
            let in_record = attr.offset_in_record + value_offset + ofs as usize;
            let byte = attr.source_record as u64 * self.geom.mft_record_bytes() + in_record as u64;
            if let Ok(sector) = self.mft_map.sector_of(byte, &self.geom) {
                self.report_extent(sector, (in_record % SECTOR_SIZE) as u32, len);
            }
        }
        Ok(())
    }

    fn read_nonresident(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        attr: &Attribute,
        mut dest: Option<&mut [u8]>,
        mut ofs: u64,
        mut len: u64,
        cached: bool,
    ) -> Result<(), FsError> {
        let compressed = attr.flags & ATTR_FLAG_COMPRESSED != 0;
        let plain = attr.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) == 0;
        let blk: u64 = if compressed {
            COMPRESSION_BLOCK_SIZE as u64
        } else {
            SECTOR_SIZE as u64
        };

        if compressed && !cached {
            debug!("attribute can't be compressed");
            return Err(FsError::Corrupt("attribute cannot be compressed".to_string()));
        }

        // One-line cache: serve the leading portion when the offset lands
        // in the cached block.
        if cached
            && self.cache.valid
            && self.cache.buf.len() as u64 == blk
            && (ofs & !(blk - 1)) == self.cache.pos
        {
            let bofs = (ofs - self.cache.pos) as usize;
            let n = (blk - bofs as u64).min(len);
            if let Some(d) = dest.take() {
                let (head, rest) = d.split_at_mut(n as usize);
                head.copy_from_slice(&self.cache.buf[bofs..bofs + n as usize]);
                dest = Some(rest);
            }
            if n == len {
                return Ok(());
            }
            ofs += n;
            len -= n;
        }

        // Aim the run walk at the target VCN. Compressed content always
        // starts work at a compression-unit boundary.
        let vcn;
        let mut ctx = {
            let walk = RunWalk::new(attr.start_vcn(), decode_data_runs(attr.run_data()?)?);
            let (target_vcn, vcn_offset) = if compressed {
                vcn = (ofs & !(COMPRESSION_BLOCK_SIZE as u64 - 1)) >> self.geom.log2_bpc();
                (vcn & !(COMPRESSION_UNIT_CLUSTERS - 1), 0)
            } else {
                vcn = ofs >> self.geom.log2_bpc();
                (vcn, (ofs >> 9) & (self.geom.spc as u64 - 1))
            };
            ReadCtx {
                walk,
                target_vcn,
                vcn_offset,
                table: Vec::new(),
                head: 0,
                input: Vec::new(),
                input_pos: 0,
                unit_compressed: false,
            }
        };
        while ctx.walk.next_vcn <= ctx.target_vcn {
            self.advance_run(rec, cur.as_deref_mut(), attr.type_code, &mut ctx.walk)?;
        }

        // Decompress-and-discard up to the block the caller asked for.
        if compressed && vcn > ctx.target_vcn {
            let skip = ((vcn - ctx.target_vcn) << self.geom.log2_spc) >> 3;
            self.read_block(rec, cur.as_deref_mut(), attr.type_code, &mut ctx, None, skip, true)?;
        }

        if cached && plain && self.trace.is_some() {
            self.trace_armed = true;
        }
        self.transfer(rec, cur, attr, &mut ctx, dest, ofs, len, cached, compressed, blk)
    }

    /// Unaligned head, whole-block middle, unaligned tail.
    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        attr: &Attribute,
        ctx: &mut ReadCtx,
        mut dest: Option<&mut [u8]>,
        mut ofs: u64,
        mut len: u64,
        cached: bool,
        compressed: bool,
        blk: u64,
    ) -> Result<(), FsError> {
        let ty = attr.type_code;

        if ofs & (blk - 1) != 0 {
            if !cached {
                debug!("invalid range");
                return Err(FsError::Corrupt("unaligned read without cache".to_string()));
            }
            let o = (ofs & (blk - 1)) as usize;
            let n = (blk - o as u64).min(len);
            let block_start = ofs & !(blk - 1);
            self.block_through_cache(rec, cur.as_deref_mut(), ty, ctx, compressed, blk, block_start, o as u32, n)?;
            if let Some(d) = dest.take() {
                let (head, rest) = d.split_at_mut(n as usize);
                head.copy_from_slice(&self.cache.buf[o..o + n as usize]);
                dest = Some(rest);
            }
            if n == len {
                return Ok(());
            }
            ofs += n;
            len -= n;
        }

        let middle = len >> blk.trailing_zeros();
        if middle > 0 {
            let mid_bytes = (middle * blk) as usize;
            match dest.take() {
                Some(d) => {
                    let (body, rest) = d.split_at_mut(mid_bytes);
                    self.read_block(rec, cur.as_deref_mut(), ty, ctx, Some(body), middle, compressed)?;
                    dest = Some(rest);
                }
                None => {
                    self.read_block(rec, cur.as_deref_mut(), ty, ctx, None, middle, compressed)?
                }
            }
            ofs += middle * blk;
            len &= blk - 1;
        }

        if len > 0 {
            if !cached {
                debug!("invalid range");
                return Err(FsError::Corrupt("unaligned read without cache".to_string()));
            }
            self.block_through_cache(rec, cur.as_deref_mut(), ty, ctx, compressed, blk, ofs, 0, len)?;
            if let Some(d) = dest {
                d[..len as usize].copy_from_slice(&self.cache.buf[..len as usize]);
            }
        }
        Ok(())
    }

    /// Read the whole block at the current position into the cache line,
    /// reporting the byte-precise extent `(offset, len)` inside it.
    #[allow(clippy::too_many_arguments)]
    fn block_through_cache(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        ty: u32,
        ctx: &mut ReadCtx,
        compressed: bool,
        blk: u64,
        block_start: u64,
        offset: u32,
        len: u64,
    ) -> Result<(), FsError> {
        let report = if self.trace_armed && !compressed {
            while ctx.target_vcn >= ctx.walk.next_vcn {
                self.advance_run(rec, cur.as_deref_mut(), ty, &mut ctx.walk)?;
            }
            if ctx.walk.sparse {
                None
            } else {
                Some(ctx.walk.sector(ctx.target_vcn, ctx.vcn_offset, &self.geom))
            }
        } else {
            None
        };

        let armed = self.suspend_trace();
        let mut block = vec![0u8; blk as usize];
        let res = self.read_block(rec, cur, ty, ctx, Some(&mut block), 1, compressed);
        self.restore_trace(armed);
        res?;

        if let Some(sector) = report {
            if self.trace_armed {
                self.report_extent(sector, offset, len);
            }
        }
        self.cache.buf = block;
        self.cache.pos = block_start;
        self.cache.valid = true;
        Ok(())
    }

    /// Transfer `num` whole blocks at the context position.
    fn read_block(
        &mut self,
        rec: &MftRecord,
        cur: Option<&mut AttrCursor>,
        ty: u32,
        ctx: &mut ReadCtx,
        dest: Option<&mut [u8]>,
        num: u64,
        compressed: bool,
    ) -> Result<(), FsError> {
        if compressed {
            self.read_block_compressed(rec, cur, ty, ctx, dest, num)
        } else {
            self.read_block_plain(rec, cur, ty, ctx, dest, num)
        }
    }

    fn read_block_plain(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        ty: u32,
        ctx: &mut ReadCtx,
        mut dest: Option<&mut [u8]>,
        mut num: u64,
    ) -> Result<(), FsError> {
        let spc = self.geom.spc as u64;
        while num > 0 {
            let avail = (ctx.walk.next_vcn.saturating_sub(ctx.target_vcn)) * spc;
            let nn = avail.saturating_sub(ctx.vcn_offset).min(num);
            if nn > 0 {
                let bytes = nn * SECTOR_SIZE as u64;
                if ctx.walk.sparse {
                    if let Some(d) = dest.take() {
                        let (span, rest) = d.split_at_mut(bytes as usize);
                        span.fill(0);
                        dest = Some(rest);
                    }
                } else {
                    let sector = ctx.walk.sector(ctx.target_vcn, ctx.vcn_offset, &self.geom);
                    match dest.take() {
                        Some(d) => {
                            let (span, rest) = d.split_at_mut(bytes as usize);
                            self.devread(sector, 0, bytes, Some(span))?;
                            dest = Some(rest);
                        }
                        None => self.devread(sector, 0, bytes, None)?,
                    }
                }
                let pos = (ctx.target_vcn << self.geom.log2_spc) + ctx.vcn_offset + nn;
                ctx.target_vcn = pos >> self.geom.log2_spc;
                ctx.vcn_offset = pos & (spc - 1);
                num -= nn;
                if num == 0 {
                    break;
                }
            }
            if ctx.target_vcn >= ctx.walk.next_vcn {
                self.advance_run(rec, cur.as_deref_mut(), ty, &mut ctx.walk)?;
            }
        }
        Ok(())
    }

    fn read_block_compressed(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        ty: u32,
        ctx: &mut ReadCtx,
        mut dest: Option<&mut [u8]>,
        mut num: u64,
    ) -> Result<(), FsError> {
        let spc = self.geom.spc as u64;
        let cpb = 8 / spc; // clusters per 4 KiB compression block
        if cpb == 0 {
            return Err(FsError::Corrupt(
                "compression with clusters larger than 4 KiB".to_string(),
            ));
        }

        while num > 0 {
            if ctx.target_vcn & (COMPRESSION_UNIT_CLUSTERS - 1) == 0 {
                self.open_unit(rec, cur.as_deref_mut(), ty, ctx)?;
            }

            let blocks_left =
                (COMPRESSION_UNIT_CLUSTERS - (ctx.target_vcn & (COMPRESSION_UNIT_CLUSTERS - 1))) / cpb;
            let nn = blocks_left.min(num);
            num -= nn;

            if ctx.unit_compressed {
                ctx.target_vcn += nn * cpb;
                if ctx.table.is_empty() {
                    // A wholly sparse unit reads as zeros.
                    if let Some(d) = dest.take() {
                        let (span, rest) = d.split_at_mut(nn as usize * COMPRESSION_BLOCK_SIZE);
                        span.fill(0);
                        dest = Some(rest);
                    }
                } else {
                    for _ in 0..nn {
                        let mut block = vec![0u8; COMPRESSION_BLOCK_SIZE];
                        let consumed = {
                            let mut src = SliceSource::new(&ctx.input[ctx.input_pos..]);
                            decompress_block(|| src.next_byte(), &mut block)?;
                            src.consumed()
                        };
                        ctx.input_pos += consumed;
                        if let Some(d) = dest.take() {
                            let (span, rest) = d.split_at_mut(COMPRESSION_BLOCK_SIZE);
                            span.copy_from_slice(&block);
                            dest = Some(rest);
                        }
                    }
                }
            } else {
                // Stored unit: the clusters hold the data verbatim.
                let mut clusters = nn * cpb;
                while ctx.head < ctx.table.len() && clusters > 0 {
                    let (vcn_end, lcn_end) = ctx.table[ctx.head];
                    let tt = (vcn_end - ctx.target_vcn).min(clusters);
                    let sector = (lcn_end - (vcn_end - ctx.target_vcn)) * spc;
                    self.copy_clusters(sector, tt, &mut dest)?;
                    ctx.target_vcn += tt;
                    clusters -= tt;
                    if ctx.target_vcn >= vcn_end {
                        ctx.head += 1;
                    }
                }
                if clusters > 0 {
                    let sector = ctx.walk.sector(ctx.target_vcn, 0, &self.geom);
                    self.copy_clusters(sector, clusters, &mut dest)?;
                    ctx.target_vcn += clusters;
                }
            }
        }
        Ok(())
    }

    /// Gather the (VCN, LCN) table of the compression unit starting at the
    /// context position and classify it: fully mapped means stored, a
    /// trailing sparse run means compressed, an empty table means a hole.
    fn open_unit(
        &mut self,
        rec: &MftRecord,
        mut cur: Option<&mut AttrCursor>,
        ty: u32,
        ctx: &mut ReadCtx,
    ) -> Result<(), FsError> {
        if ctx.head != ctx.table.len() {
            debug!("compression unit desync");
            return Err(FsError::Corrupt("compression unit desync".to_string()));
        }
        ctx.table.clear();
        ctx.head = 0;
        ctx.input.clear();
        ctx.input_pos = 0;

        if ctx.target_vcn >= ctx.walk.next_vcn {
            self.advance_run(rec, cur.as_deref_mut(), ty, &mut ctx.walk)?;
        }
        while ctx.target_vcn + COMPRESSION_UNIT_CLUSTERS > ctx.walk.next_vcn {
            if ctx.walk.sparse {
                break;
            }
            ctx.table.push((
                ctx.walk.next_vcn,
                ctx.walk.curr_lcn + (ctx.walk.next_vcn - ctx.walk.curr_vcn),
            ));
            self.advance_run(rec, cur.as_deref_mut(), ty, &mut ctx.walk)?;
        }
        ctx.unit_compressed = ctx.walk.sparse;

        if ctx.unit_compressed && !ctx.table.is_empty() {
            // Pull the unit's mapped clusters; the decoder streams from
            // this payload block by block.
            let mut vcn = ctx.target_vcn;
            let mut input = Vec::new();
            for &(vcn_end, lcn_end) in &ctx.table {
                let clusters = vcn_end - vcn;
                let bytes = clusters * self.geom.cluster_bytes();
                let start = input.len();
                input.resize(start + bytes as usize, 0);
                let sector = (lcn_end - (vcn_end - vcn)) * self.geom.spc as u64;
                self.devread(sector, 0, bytes, Some(&mut input[start..]))?;
                vcn = vcn_end;
            }
            ctx.input = input;
            ctx.head = ctx.table.len();
        }
        Ok(())
    }

    fn copy_clusters(
        &mut self,
        sector: u64,
        clusters: u64,
        dest: &mut Option<&mut [u8]>,
    ) -> Result<(), FsError> {
        let bytes = clusters * self.geom.cluster_bytes();
        if let Some(d) = dest.take() {
            let (span, rest) = d.split_at_mut(bytes as usize);
            self.devread(sector, 0, bytes, Some(span))?;
            *dest = Some(rest);
        }
        Ok(())
    }

    fn advance_run(
        &mut self,
        rec: &MftRecord,
        cur: Option<&mut AttrCursor>,
        ty: u32,
        walk: &mut RunWalk,
    ) -> Result<(), FsError> {
        if walk.advance() {
            return Ok(());
        }
        // The fragment is spent; with an attribute list in force the same
        // attribute continues in the next listed child record.
        if let Some(c) = cur {
            let armed = self.suspend_trace();
            let frag = self.find_attr(rec, c, Some(ty));
            self.restore_trace(armed);
            if let Some(frag) = frag? {
                if frag.is_resident() {
                    debug!("$DATA should be non-resident");
                    return Err(FsError::Corrupt("continuation fragment is resident".to_string()));
                }
                walk.feed(decode_data_runs(frag.run_data()?)?);
                if walk.advance() {
                    return Ok(());
                }
            }
        }
        debug!("run list overflow");
        Err(FsError::Corrupt("run list overflow".to_string()))
    }

    /// Overwrite part of a resident attribute value and push the whole MFT
    /// record back to disk, fix-ups restamped. The only mutation path the
    /// driver offers.
    pub(crate) fn write_resident(
        &mut self,
        rec: &mut MftRecord,
        mftno: u64,
        attr: &Attribute,
        src: &[u8],
        ofs: u64,
    ) -> Result<(), FsError> {
        let (value_length, value_offset) = match attr.form {
            AttrForm::Resident {
                value_length,
                value_offset,
            } => (value_length, value_offset),
            AttrForm::NonResident { .. } => {
                return Err(FsError::WriteRejected("cannot write non-resident data".to_string()))
            }
        };
        if attr.source_record != rec.record_number() {
            return Err(FsError::WriteRejected(
                "cannot write through an attribute list".to_string(),
            ));
        }
        // Only the very record we last read and fix-up-validated may be
        // written back.
        if self.fixup_snapshot != Some(rec.record_number()) || !rec.matches_snapshot() {
            return Err(FsError::WriteRejected(
                "record is not the most recently validated".to_string(),
            ));
        }
        if ofs + src.len() as u64 > value_length as u64 {
            return Err(FsError::WriteRejected(
                "write past end of resident value".to_string(),
            ));
        }

        let start = attr.offset_in_record + value_offset as usize + ofs as usize;
        rec.bytes_mut()[start..start + src.len()].copy_from_slice(src);

        // Stamp a scratch copy for disk; the in-memory record keeps its
        // fix-up-applied form.
        let mut disk = rec.bytes().to_vec();
        stamp_fixup(&mut disk, MFT_MAGIC)?;
        let record_bytes = self.geom.mft_record_bytes();
        let base = mftno * record_bytes;
        for k in 0..self.geom.mft_sectors as u64 {
            let sector = self.mft_map.sector_of(base + k * SECTOR_SIZE as u64, &self.geom)?;
            let s = (k as usize) * SECTOR_SIZE;
            self.dev.write_sectors(sector, &disk[s..s + SECTOR_SIZE])?;
        }
        self.cache.valid = false;
        Ok(())
    }
}
