// Directory lookup over $INDEX_ROOT and $INDEX_ALLOCATION, guided by
// $BITMAP. Matching is case-insensitive (ASCII fold), one path component
// at a time; enumeration reports every entry the target prefixes.

use log::{debug, trace};
use stagefs_core::{BlockDevice, FsError};

use crate::ntfs::attributes::AttrForm;
use crate::ntfs::fixup::{apply_fixup, INDEX_MAGIC};
use crate::ntfs::mft::MftRecord;
use crate::ntfs::structures::*;
use crate::ntfs::volume::NtfsVolume;

/// The hosting arena caps directory bitmaps at one page.
const MAX_BITMAP_BYTES: u64 = 4096;

/// A directory entry, as reported to enumeration sinks.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub mft: u32,
    pub size: u64,
    pub attributes: u32,
    pub is_directory: bool,
}

/// What a directory scan is trying to do.
pub(crate) enum Lookup<'a> {
    /// Resolve exactly one component.
    Find(&'a str),
    /// Report every entry the prefix matches (directories flagged for
    /// highlighting); DOS short names are suppressed.
    Complete {
        prefix: &'a str,
        sink: &'a mut dyn FnMut(&DirEntryInfo),
        matched: usize,
    },
}

/// Walk a null-flag-terminated index entry sequence. Returns the matched
/// MFT number in find mode.
pub(crate) fn scan_entries(entries: &[u8], lookup: &mut Lookup) -> Result<Option<u32>, FsError> {
    let mut pos = 0usize;
    loop {
        if pos + 0x10 > entries.len() {
            return Err(FsError::Corrupt("index entry out of range".to_string()));
        }
        if le_u16(entries, pos + 0xC) & INDEX_ENTRY_END != 0 {
            return Ok(None);
        }
        let length = le_u16(entries, pos + 8) as usize;
        if length < 0x52 || pos + length > entries.len() {
            return Err(FsError::Corrupt("bad index entry length".to_string()));
        }

        let name_len = entries[pos + 0x50] as usize;
        let name_type = entries[pos + 0x51];
        if pos + 0x52 + 2 * name_len > entries.len() {
            return Err(FsError::Corrupt("index entry name out of range".to_string()));
        }
        let name = utf16le_to_string(&entries[pos + 0x52..pos + 0x52 + 2 * name_len])?;

        match lookup {
            Lookup::Find(target) => {
                if name.len() == target.len()
                    && name.as_bytes().eq_ignore_ascii_case(target.as_bytes())
                {
                    if le_u16(entries, pos + 4) != 0 {
                        debug!("64-bit MFT number for {}", name);
                        return Err(FsError::Corrupt("64-bit MFT reference".to_string()));
                    }
                    return Ok(Some(le_u32(entries, pos)));
                }
            }
            Lookup::Complete {
                prefix,
                sink,
                matched,
            } => {
                // Skip DOS 8.3 aliases of long names.
                let is_dos_alias = name_type == FILE_NAME_DOS && name_len <= 12;
                let hit = name.len() >= prefix.len()
                    && name.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes());
                if hit && !is_dos_alias {
                    let attributes = le_u32(entries, pos + 0x48);
                    let info = DirEntryInfo {
                        name,
                        mft: le_u32(entries, pos),
                        size: le_u64(entries, pos + 0x40),
                        attributes,
                        is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
                    };
                    sink(&info);
                    *matched += 1;
                }
            }
        }
        pos += length;
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Search one directory record for a component (or enumerate it).
    /// `Ok(None)` means the scan completed without a match.
    pub(crate) fn scan_dir(
        &mut self,
        rec: &MftRecord,
        lookup: &mut Lookup,
    ) -> Result<Option<u32>, FsError> {
        if !rec.is_directory() {
            return Err(FsError::NotFound("not a directory".to_string()));
        }

        // $INDEX_ROOT "$I30" over file names.
        let mut cur = self.init_attr(rec);
        let root = loop {
            match self.find_attr(rec, &mut cur, Some(ATTR_TYPE_INDEX_ROOT))? {
                Some(a) if a.name == INDEX_I30 && a.is_resident() => {
                    let v = a.value()?;
                    if v.len() < 0x20 {
                        return Err(FsError::Corrupt("index root too small".to_string()));
                    }
                    if le_u32(v, 0) != ATTR_TYPE_FILE_NAME {
                        continue; // not a file-name index
                    }
                    break a;
                }
                Some(_) => continue,
                None => {
                    debug!("no $INDEX_ROOT");
                    return Err(FsError::Corrupt("no $INDEX_ROOT".to_string()));
                }
            }
        };
        let value = root.value()?;
        // Skip the index-root header; the node header gives the entry
        // offset relative to itself.
        let node = &value[0x10..];
        let entries_ofs = le_u32(node, 0) as usize;
        if entries_ofs >= node.len() {
            return Err(FsError::Corrupt("index entries out of range".to_string()));
        }
        if let Some(hit) = scan_entries(&node[entries_ofs..], lookup)? {
            return Ok(Some(hit));
        }

        // $BITMAP "$I30" selects the in-use INDX blocks.
        let mut bitmap: Option<Vec<u8>> = None;
        let mut cur = self.init_attr(rec);
        while let Some(a) = self.find_attr(rec, &mut cur, Some(ATTR_TYPE_BITMAP))? {
            if a.name != INDEX_I30 {
                continue;
            }
            match a.form {
                AttrForm::Resident { value_length, .. } => {
                    if value_length as u64 > MAX_BITMAP_BYTES {
                        debug!("resident $BITMAP too large");
                        return Err(FsError::Corrupt("resident $BITMAP too large".to_string()));
                    }
                    bitmap = Some(a.value()?.to_vec());
                }
                AttrForm::NonResident {
                    allocated_size,
                    data_size,
                    ..
                } => {
                    if allocated_size > MAX_BITMAP_BYTES {
                        debug!("non-resident $BITMAP too large");
                        return Err(FsError::Corrupt("non-resident $BITMAP too large".to_string()));
                    }
                    let mut buf = vec![0u8; allocated_size as usize];
                    let mut walk_cur = cur.clone();
                    self.read_data(rec, Some(&mut walk_cur), &a, Some(&mut buf), 0, allocated_size, false)?;
                    buf.truncate(data_size as usize);
                    bitmap = Some(buf);
                }
            }
            break;
        }

        // $INDEX_ALLOCATION "$I30".
        let mut alloc = None;
        if let Some((mut acur, first)) = self.locate_attr(rec, ATTR_TYPE_INDEX_ALLOCATION)? {
            let mut candidate = Some(first);
            while let Some(a) = candidate {
                if a.name == INDEX_I30 && !a.is_resident() {
                    alloc = Some((acur, a));
                    break;
                }
                candidate = self.find_attr(rec, &mut acur, Some(ATTR_TYPE_INDEX_ALLOCATION))?;
            }
        }

        let bitmap = match (bitmap, alloc.as_ref()) {
            (Some(_), None) => {
                debug!("$BITMAP without $INDEX_ALLOCATION");
                return Err(FsError::Corrupt("$BITMAP without $INDEX_ALLOCATION".to_string()));
            }
            (Some(bm), Some(_)) => bm,
            (None, _) => return Ok(None),
        };
        let (acur, alloc) = alloc.expect("checked above");

        let idx_bytes = self.geom.idx_record_bytes();
        for bit in 0..bitmap.len() * 8 {
            if bitmap[bit / 8] & (1 << (bit % 8)) == 0 {
                continue;
            }
            trace!("scanning INDX block {}", bit);
            let mut block = vec![0u8; idx_bytes as usize];
            self.read_attr(
                rec,
                &acur,
                &alloc,
                Some(&mut block),
                bit as u64 * idx_bytes,
                idx_bytes,
                false,
            )?;
            apply_fixup(&mut block, INDEX_MAGIC)?;
            // An INDX validation makes the fix-up snapshot stale.
            self.fixup_snapshot = None;

            let entries_ofs = 0x18 + le_u16(&block, 0x18) as usize;
            if entries_ofs >= block.len() {
                return Err(FsError::Corrupt("INDX entries out of range".to_string()));
            }
            if let Some(hit) = scan_entries(&block[entries_ofs..], lookup)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(buf: &mut Vec<u8>, mft: u32, name: &str, name_type: u8, attrs: u32, size: u64) {
        let name_units: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let length = (0x52 + name_units.len() + 7) & !7;
        let base = buf.len();
        buf.resize(base + length, 0);
        buf[base..base + 4].copy_from_slice(&mft.to_le_bytes());
        buf[base + 8..base + 10].copy_from_slice(&(length as u16).to_le_bytes());
        buf[base + 0x40..base + 0x48].copy_from_slice(&size.to_le_bytes());
        buf[base + 0x48..base + 0x4C].copy_from_slice(&attrs.to_le_bytes());
        buf[base + 0x50] = name.encode_utf16().count() as u8;
        buf[base + 0x51] = name_type;
        buf[base + 0x52..base + 0x52 + name_units.len()].copy_from_slice(&name_units);
    }

    fn push_end(buf: &mut Vec<u8>) {
        let base = buf.len();
        buf.resize(base + 0x10, 0);
        buf[base + 8..base + 10].copy_from_slice(&0x10u16.to_le_bytes());
        buf[base + 0xC..base + 0xE].copy_from_slice(&INDEX_ENTRY_END.to_le_bytes());
    }

    fn sample_entries() -> Vec<u8> {
        let mut buf = Vec::new();
        push_entry(&mut buf, 64, "README.TXT", 1, 0x20, 500);
        push_entry(&mut buf, 64, "README~1.TXT", FILE_NAME_DOS, 0x20, 500);
        push_entry(&mut buf, 65, "ReadMe.md", 1, 0x20, 120);
        push_entry(&mut buf, 66, "src", 3, FILE_ATTRIBUTE_DIRECTORY, 0);
        push_end(&mut buf);
        buf
    }

    #[test]
    fn test_find_case_insensitive() {
        let entries = sample_entries();
        let hit = scan_entries(&entries, &mut Lookup::Find("readme.txt")).unwrap();
        assert_eq!(hit, Some(64));
        let hit = scan_entries(&entries, &mut Lookup::Find("SRC")).unwrap();
        assert_eq!(hit, Some(66));
        let miss = scan_entries(&entries, &mut Lookup::Find("missing")).unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn test_complete_prefix_skips_dos_names() {
        let entries = sample_entries();
        let mut seen = Vec::new();
        let mut sink = |e: &DirEntryInfo| seen.push((e.name.clone(), e.is_directory));
        let mut lookup = Lookup::Complete {
            prefix: "read",
            sink: &mut sink,
            matched: 0,
        };
        scan_entries(&entries, &mut lookup).unwrap();
        let matched = match lookup {
            Lookup::Complete { matched, .. } => matched,
            _ => unreachable!(),
        };
        assert_eq!(matched, 2);
        assert_eq!(
            seen,
            vec![("README.TXT".to_string(), false), ("ReadMe.md".to_string(), false)]
        );
    }

    #[test]
    fn test_complete_empty_prefix_lists_everything() {
        let entries = sample_entries();
        let mut names = Vec::new();
        let mut sink = |e: &DirEntryInfo| names.push(e.name.clone());
        let mut lookup = Lookup::Complete {
            prefix: "",
            sink: &mut sink,
            matched: 0,
        };
        scan_entries(&entries, &mut lookup).unwrap();
        assert_eq!(names, vec!["README.TXT", "ReadMe.md", "src"]);
    }

    #[test]
    fn test_64bit_reference_rejected() {
        let mut buf = Vec::new();
        push_entry(&mut buf, 64, "big", 1, 0x20, 0);
        buf[4] = 1; // upper part of the MFT reference
        push_end(&mut buf);
        assert!(scan_entries(&buf, &mut Lookup::Find("big")).is_err());
    }

    #[test]
    fn test_truncated_entries_are_corrupt() {
        let mut buf = Vec::new();
        push_entry(&mut buf, 64, "file", 1, 0x20, 0);
        // No end marker, then a short tail.
        buf.truncate(buf.len() - 4);
        assert!(scan_entries(&buf, &mut Lookup::Find("other")).is_err());
    }
}
