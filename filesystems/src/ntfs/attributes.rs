// Attribute records and the attribute iterator.
//
// The iterator walks the packed attribute sequence of an MFT record and
// transparently follows an $ATTRIBUTE_LIST into child MFT records,
// including non-resident lists paged through a scratch buffer. Attribute
// bytes are copied out of the record so callers never hold borrows into
// the shared record buffers.

use log::{debug, trace};
use stagefs_core::{BlockDevice, FsError, SECTOR_SIZE};

use crate::ntfs::mft::MftRecord;
use crate::ntfs::structures::*;
use crate::ntfs::volume::NtfsVolume;

/// How large a window of a non-resident attribute list is held in memory.
const LIST_PAGE_BYTES: usize = 4096;

/// Storage form of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrForm {
    Resident {
        value_length: u32,
        value_offset: u16,
    },
    NonResident {
        start_vcn: u64,
        last_vcn: u64,
        run_offset: u16,
        allocated_size: u64,
        data_size: u64,
    },
}

/// One attribute record, copied out of the MFT record holding it.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    pub name: String,
    pub flags: u16,
    pub id: u16,
    pub form: AttrForm,
    /// The whole attribute record.
    pub raw: Vec<u8>,
    /// Record number the bytes were copied from.
    pub source_record: u32,
    /// Byte offset of the record inside that MFT record.
    pub offset_in_record: usize,
}

impl Attribute {
    /// Parse the attribute record at `offset`. `Ok(None)` at the
    /// end-of-attributes sentinel.
    pub fn parse(
        buf: &[u8],
        offset: usize,
        source_record: u32,
    ) -> Result<Option<Attribute>, FsError> {
        if offset + 4 > buf.len() {
            return Err(FsError::Corrupt("attribute walk ran off the record".to_string()));
        }
        let type_code = le_u32(buf, offset);
        if type_code == ATTR_END_MARKER {
            return Ok(None);
        }
        if offset + 0x18 > buf.len() {
            return Err(FsError::Corrupt("truncated attribute header".to_string()));
        }

        let length = le_u32(buf, offset + 4) as usize;
        if length < 0x18 || offset + length > buf.len() {
            return Err(FsError::Corrupt(format!(
                "bad attribute length {} at offset {}",
                length, offset
            )));
        }

        let non_resident = buf[offset + 8] != 0;
        let name_length = buf[offset + 9] as usize;
        let name_offset = le_u16(buf, offset + 0xA) as usize;
        let flags = le_u16(buf, offset + 0xC);
        let id = le_u16(buf, offset + 0xE);

        let name = if name_length > 0 {
            if name_offset + 2 * name_length > length {
                return Err(FsError::Corrupt("attribute name out of range".to_string()));
            }
            let start = offset + name_offset;
            utf16le_to_string(&buf[start..start + 2 * name_length])?
        } else {
            String::new()
        };

        let form = if non_resident {
            if length < 0x40 {
                return Err(FsError::Corrupt("non-resident header too short".to_string()));
            }
            let run_offset = le_u16(buf, offset + 0x20);
            if run_offset as usize >= length {
                return Err(FsError::Corrupt("run list offset out of range".to_string()));
            }
            AttrForm::NonResident {
                start_vcn: le_u64(buf, offset + 0x10),
                last_vcn: le_u64(buf, offset + 0x18),
                run_offset,
                allocated_size: le_u64(buf, offset + 0x28),
                data_size: le_u64(buf, offset + 0x30),
            }
        } else {
            let value_length = le_u32(buf, offset + 0x10);
            let value_offset = le_u16(buf, offset + 0x14);
            if value_offset as usize + value_length as usize > length {
                return Err(FsError::Corrupt("resident value out of range".to_string()));
            }
            AttrForm::Resident {
                value_length,
                value_offset,
            }
        };

        Ok(Some(Attribute {
            type_code,
            name,
            flags,
            id,
            form,
            raw: buf[offset..offset + length].to_vec(),
            source_record,
            offset_in_record: offset,
        }))
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.form, AttrForm::Resident { .. })
    }

    /// Resident value bytes.
    pub fn value(&self) -> Result<&[u8], FsError> {
        match self.form {
            AttrForm::Resident {
                value_length,
                value_offset,
            } => {
                let start = value_offset as usize;
                Ok(&self.raw[start..start + value_length as usize])
            }
            AttrForm::NonResident { .. } => Err(FsError::Corrupt(format!(
                "attribute 0x{:X} should be resident",
                self.type_code
            ))),
        }
    }

    /// Packed run list of a non-resident attribute.
    pub fn run_data(&self) -> Result<&[u8], FsError> {
        match self.form {
            AttrForm::NonResident { run_offset, .. } => Ok(&self.raw[run_offset as usize..]),
            AttrForm::Resident { .. } => Err(FsError::Corrupt(format!(
                "attribute 0x{:X} should be non-resident",
                self.type_code
            ))),
        }
    }

    /// Content size: value length when resident, real size when not.
    pub fn data_size(&self) -> u64 {
        match self.form {
            AttrForm::Resident { value_length, .. } => value_length as u64,
            AttrForm::NonResident { data_size, .. } => data_size,
        }
    }

    /// Starting VCN of a non-resident fragment, 0 for resident values.
    pub fn start_vcn(&self) -> u64 {
        match self.form {
            AttrForm::NonResident { start_vcn, .. } => start_vcn,
            AttrForm::Resident { .. } => 0,
        }
    }
}

/// One $ATTRIBUTE_LIST entry.
#[derive(Debug, Clone)]
pub struct AttrListEntry {
    pub type_code: u32,
    pub length: u16,
    pub start_vcn: u64,
    pub child_ref: u32,
    pub attr_id: u16,
}

impl AttrListEntry {
    /// Parse the entry at `offset`, or `None` if a whole entry does not fit
    /// in the window.
    pub fn parse(buf: &[u8], offset: usize) -> Result<Option<AttrListEntry>, FsError> {
        if offset + 0x1A > buf.len() {
            return Ok(None);
        }
        let length = le_u16(buf, offset + 4);
        if length < 0x1A {
            return Err(FsError::Corrupt("attribute list entry too short".to_string()));
        }
        if offset + length as usize > buf.len() {
            return Ok(None);
        }
        Ok(Some(AttrListEntry {
            type_code: le_u32(buf, offset),
            length,
            start_vcn: le_u64(buf, offset + 8),
            child_ref: le_u32(buf, offset + 0x10),
            attr_id: le_u16(buf, offset + 0x18),
        }))
    }
}

/// Iterator state over one MFT record's attributes.
#[derive(Debug, Clone)]
pub struct AttrCursor {
    /// Offset of the next local attribute.
    next: usize,
    /// Offset of an $ATTRIBUTE_LIST met during the local walk.
    list_attr_off: Option<usize>,
    pub(crate) list: Option<ListState>,
}

/// Attribute-list iteration state; pages a non-resident list through a
/// sliding window.
#[derive(Debug, Clone)]
pub(crate) struct ListState {
    page: Vec<u8>,
    /// Offset within the list value corresponding to `page[0]`.
    value_ofs: u64,
    /// Next entry, relative to `page`.
    pos: usize,
    /// Entry most recently returned, relative to `page`.
    cur: usize,
    /// Total list value size.
    total: u64,
    non_resident: bool,
    /// The $ATTRIBUTE_LIST attribute itself, for paging reads.
    list_attr: Attribute,
}

impl ListState {
    fn bytes_left(&self) -> u64 {
        self.total - self.value_ofs - self.page.len() as u64
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    pub(crate) fn init_attr(&self, rec: &MftRecord) -> AttrCursor {
        AttrCursor {
            next: rec.attrs_offset(),
            list_attr_off: None,
            list: None,
        }
    }

    /// Advance to the next attribute of type `want` (any type when `None`).
    ///
    /// Local attributes are returned first; once the record is exhausted
    /// and an $ATTRIBUTE_LIST was seen, iteration continues over the list,
    /// fetching each matching entry's attribute from its child MFT record.
    pub(crate) fn find_attr(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
        want: Option<u32>,
    ) -> Result<Option<Attribute>, FsError> {
        loop {
            if cur.list.is_some() {
                if let Some(entry) = self.next_list_entry(rec, cur, want)? {
                    return Ok(Some(self.fetch_list_child(&entry)?));
                }
                return Ok(None);
            }

            while let Some(attr) = Attribute::parse(rec.bytes(), cur.next, rec.record_number())? {
                cur.next += attr.raw.len();
                if attr.type_code == ATTR_TYPE_ATTRIBUTE_LIST {
                    cur.list_attr_off = Some(attr.offset_in_record);
                }
                if want.map_or(true, |t| t == attr.type_code) {
                    return Ok(Some(attr));
                }
            }

            match cur.list_attr_off.take() {
                Some(off) => self.enter_list(rec, cur, off)?,
                None => return Ok(None),
            }
        }
    }

    fn enter_list(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
        off: usize,
    ) -> Result<(), FsError> {
        let list_attr = Attribute::parse(rec.bytes(), off, rec.record_number())?
            .ok_or_else(|| FsError::Corrupt("attribute list vanished".to_string()))?;
        trace!(
            "entering attribute list of record {} ({} bytes, {})",
            rec.record_number(),
            list_attr.data_size(),
            if list_attr.is_resident() { "resident" } else { "non-resident" }
        );

        let mut st = ListState {
            page: Vec::new(),
            value_ofs: 0,
            pos: 0,
            cur: 0,
            total: list_attr.data_size(),
            non_resident: !list_attr.is_resident(),
            list_attr,
        };
        if st.non_resident {
            self.load_list_page(rec, &mut st, 0, 0)?;
        } else {
            st.page = st.list_attr.value()?.to_vec();
        }
        cur.list = Some(st);
        Ok(())
    }

    /// Pull the window so that the entry at list offset `value_ofs + pos`
    /// starts inside it.
    fn load_list_page(
        &mut self,
        rec: &MftRecord,
        st: &mut ListState,
        value_ofs: u64,
        pos: usize,
    ) -> Result<(), FsError> {
        let entry_start = value_ofs + pos as u64;
        // Window loads stay sector aligned.
        let window_start = entry_start & !(SECTOR_SIZE as u64 - 1);
        let want = (st.total - window_start).min(LIST_PAGE_BYTES as u64);
        let read_len = (want + SECTOR_SIZE as u64 - 1) & !(SECTOR_SIZE as u64 - 1);

        let mut buf = vec![0u8; read_len as usize];
        let list_attr = st.list_attr.clone();
        let armed = self.suspend_trace();
        let res = self.read_data(rec, None, &list_attr, Some(&mut buf), window_start, read_len, false);
        self.restore_trace(armed);
        if let Err(err) = res {
            debug!("failed to read non-resident attribute list: {}", err);
            return Err(err);
        }

        buf.truncate(want as usize);
        st.page = buf;
        st.value_ofs = window_start;
        st.pos = (entry_start - window_start) as usize;
        st.cur = st.pos;
        Ok(())
    }

    /// Parse the entry at the window position, sliding the window when the
    /// entry straddles it. Does not advance the position.
    fn peek_list_entry(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
    ) -> Result<Option<AttrListEntry>, FsError> {
        loop {
            let st = cur.list.as_mut().expect("cursor is in list mode");
            if let Some(entry) = AttrListEntry::parse(&st.page, st.pos)? {
                return Ok(Some(entry));
            }
            if !st.non_resident
                || st.pos as u64 + st.value_ofs >= st.total
                || st.bytes_left() == 0
            {
                return Ok(None);
            }
            // The next entry straddles the window; slide it.
            let (value_ofs, pos) = (st.value_ofs, st.pos);
            let mut next = cur.list.take().expect("cursor is in list mode");
            let res = self.load_list_page(rec, &mut next, value_ofs, pos);
            cur.list = Some(next);
            res?;
        }
    }

    /// Next list entry matching `want`, paging the window forward as needed.
    fn next_list_entry(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
        want: Option<u32>,
    ) -> Result<Option<AttrListEntry>, FsError> {
        loop {
            match self.peek_list_entry(rec, cur)? {
                Some(entry) => {
                    let st = cur.list.as_mut().expect("cursor is in list mode");
                    st.cur = st.pos;
                    st.pos += entry.length as usize;
                    if want.map_or(true, |t| t == entry.type_code) {
                        return Ok(Some(entry));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Put the window back at the head of the list.
    fn rewind_list(&mut self, rec: &MftRecord, cur: &mut AttrCursor) -> Result<(), FsError> {
        let st = cur.list.as_mut().expect("cursor is in list mode");
        if st.value_ofs == 0 {
            st.pos = 0;
            st.cur = 0;
            return Ok(());
        }
        let mut head = cur.list.take().expect("cursor is in list mode");
        let res = self.load_list_page(rec, &mut head, 0, 0);
        cur.list = Some(head);
        res
    }

    /// Position the window on the entry at absolute list offset `at`.
    fn seat_list_at(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
        at: u64,
    ) -> Result<(), FsError> {
        let st = cur.list.as_mut().expect("cursor is in list mode");
        if at >= st.value_ofs && (at - st.value_ofs) as usize <= st.page.len() {
            st.pos = (at - st.value_ofs) as usize;
            st.cur = st.pos;
            return Ok(());
        }
        let mut seated = cur.list.take().expect("cursor is in list mode");
        let res = self.load_list_page(rec, &mut seated, at, 0);
        cur.list = Some(seated);
        res
    }

    /// Read the child MFT record an attribute-list entry points at and copy
    /// out the attribute with the entry's (type, id).
    fn fetch_list_child(&mut self, entry: &AttrListEntry) -> Result<Attribute, FsError> {
        let armed = self.suspend_trace();
        let child = self.read_mft(entry.child_ref as u64);
        self.restore_trace(armed);
        let child = child?;

        let mut off = child.attrs_offset();
        while let Some(attr) = Attribute::parse(child.bytes(), off, child.record_number())? {
            off += attr.raw.len();
            if attr.type_code == entry.type_code && attr.id == entry.attr_id {
                return Ok(attr);
            }
        }
        debug!(
            "can't find attribute 0x{:X} (id {}) in MFT record {}",
            entry.type_code, entry.attr_id, entry.child_ref
        );
        Err(FsError::Corrupt(format!(
            "attribute 0x{:X} missing from MFT record {}",
            entry.type_code, entry.child_ref
        )))
    }

    /// Locate an attribute for sustained I/O, preferring the attribute-list
    /// view when the record has one so that fragment selection works.
    pub(crate) fn locate_attr(
        &mut self,
        rec: &MftRecord,
        want: u32,
    ) -> Result<Option<(AttrCursor, Attribute)>, FsError> {
        let mut cur = self.init_attr(rec);
        let first = match self.find_attr(rec, &mut cur, Some(want))? {
            Some(attr) => attr,
            None => return Ok(None),
        };
        if cur.list.is_some() {
            return Ok(Some((cur, first)));
        }
        loop {
            match self.find_attr(rec, &mut cur, Some(want))? {
                Some(attr) if cur.list.is_some() => return Ok(Some((cur, attr))),
                Some(_) => continue,
                None => break,
            }
        }
        let mut cur = self.init_attr(rec);
        let attr = self.find_attr(rec, &mut cur, Some(want))?;
        Ok(attr.map(|a| (cur, a)))
    }

    /// Position a list-mode cursor on the fragment covering `target_vcn`
    /// and fetch its attribute. The scan re-anchors at the head of the
    /// list every time, so a target behind the previously selected
    /// fragment resolves just as well as one ahead of it. Attribute
    /// records are ordered by starting VCN, so the scan stops at the
    /// first entry past the target.
    pub(crate) fn seek_fragment(
        &mut self,
        rec: &MftRecord,
        cur: &mut AttrCursor,
        ty: u32,
        target_vcn: u64,
    ) -> Result<Option<Attribute>, FsError> {
        if cur.list.is_some() {
            self.rewind_list(rec, cur)?;
            let mut selected = None;
            loop {
                let entry = match self.peek_list_entry(rec, cur)? {
                    Some(e) => e,
                    None => break,
                };
                let st = cur.list.as_mut().expect("cursor is in list mode");
                let at = st.value_ofs + st.pos as u64;
                if entry.type_code == ty {
                    if selected.is_none() || entry.start_vcn <= target_vcn {
                        selected = Some(at);
                    } else {
                        break;
                    }
                } else if selected.is_some() {
                    break;
                }
                st.pos += entry.length as usize;
            }
            match selected {
                Some(at) => self.seat_list_at(rec, cur, at)?,
                None => return Ok(None),
            }
        }
        self.find_attr(rec, cur, Some(ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_resident_attr(type_code: u32, name: &str, value: &[u8]) -> Vec<u8> {
        let name_bytes: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let name_offset = 0x18usize;
        let value_offset = name_offset + name_bytes.len();
        let total = (value_offset + value.len() + 7) & !7;

        let mut attr = vec![0u8; total];
        attr[0..4].copy_from_slice(&type_code.to_le_bytes());
        attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
        attr[8] = 0;
        attr[9] = name.encode_utf16().count() as u8;
        attr[0xA..0xC].copy_from_slice(&(name_offset as u16).to_le_bytes());
        attr[0x10..0x14].copy_from_slice(&(value.len() as u32).to_le_bytes());
        attr[0x14..0x16].copy_from_slice(&(value_offset as u16).to_le_bytes());
        attr[name_offset..name_offset + name_bytes.len()].copy_from_slice(&name_bytes);
        attr[value_offset..value_offset + value.len()].copy_from_slice(value);
        attr
    }

    #[test]
    fn test_parse_resident_attribute() {
        let mut buf = build_resident_attr(ATTR_TYPE_DATA, "", b"hello world");
        buf.extend_from_slice(&ATTR_END_MARKER.to_le_bytes());

        let attr = Attribute::parse(&buf, 0, 7).unwrap().unwrap();
        assert_eq!(attr.type_code, ATTR_TYPE_DATA);
        assert!(attr.is_resident());
        assert_eq!(attr.value().unwrap(), b"hello world");
        assert_eq!(attr.data_size(), 11);
        assert_eq!(attr.source_record, 7);

        let end = Attribute::parse(&buf, attr.raw.len(), 7).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_parse_named_attribute() {
        let buf = build_resident_attr(ATTR_TYPE_INDEX_ROOT, "$I30", &[0u8; 16]);
        let attr = Attribute::parse(&buf, 0, 5).unwrap().unwrap();
        assert_eq!(attr.name, "$I30");
    }

    #[test]
    fn test_parse_non_resident_attribute() {
        let mut attr = vec![0u8; 0x48];
        attr[0..4].copy_from_slice(&ATTR_TYPE_DATA.to_le_bytes());
        attr[4..8].copy_from_slice(&0x48u32.to_le_bytes());
        attr[8] = 1;
        attr[0x10..0x18].copy_from_slice(&0u64.to_le_bytes()); // start VCN
        attr[0x18..0x20].copy_from_slice(&15u64.to_le_bytes()); // last VCN
        attr[0x20..0x22].copy_from_slice(&0x40u16.to_le_bytes()); // run offset
        attr[0x28..0x30].copy_from_slice(&65536u64.to_le_bytes());
        attr[0x30..0x38].copy_from_slice(&60000u64.to_le_bytes());
        attr[0x40..0x45].copy_from_slice(&[0x21, 0x10, 0x64, 0x00, 0x00]);

        let parsed = Attribute::parse(&attr, 0, 0).unwrap().unwrap();
        assert!(!parsed.is_resident());
        assert_eq!(parsed.data_size(), 60000);
        assert_eq!(parsed.start_vcn(), 0);
        assert_eq!(parsed.run_data().unwrap()[0], 0x21);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let mut buf = build_resident_attr(ATTR_TYPE_DATA, "", b"x");
        buf[4..8].copy_from_slice(&0x8000u32.to_le_bytes());
        assert!(Attribute::parse(&buf, 0, 0).is_err());
    }

    #[test]
    fn test_attr_list_entry_parse() {
        let mut buf = vec![0u8; 0x40];
        buf[0..4].copy_from_slice(&ATTR_TYPE_DATA.to_le_bytes());
        buf[4..6].copy_from_slice(&0x20u16.to_le_bytes());
        buf[8..16].copy_from_slice(&16u64.to_le_bytes()); // starting VCN
        buf[0x10..0x14].copy_from_slice(&23u32.to_le_bytes()); // child record
        buf[0x18..0x1A].copy_from_slice(&4u16.to_le_bytes()); // attribute id

        let entry = AttrListEntry::parse(&buf, 0).unwrap().unwrap();
        assert_eq!(entry.type_code, ATTR_TYPE_DATA);
        assert_eq!(entry.start_vcn, 16);
        assert_eq!(entry.child_ref, 23);
        assert_eq!(entry.attr_id, 4);

        // An entry that does not fit the window reports None, not an error.
        assert!(AttrListEntry::parse(&buf[..0x30], 0x20).unwrap().is_none());
    }
}
