// Public file API: mount-relative path resolution, sequential read/write
// on the open file, and completion enumeration.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};
use stagefs_core::{BlockDevice, FsError};

use crate::ntfs::attributes::{AttrCursor, Attribute};
use crate::ntfs::index::{DirEntryInfo, Lookup};
use crate::ntfs::mft::MftRecord;
use crate::ntfs::structures::*;
use crate::ntfs::volume::{Extent, NtfsVolume};

/// State of the currently open file or directory.
pub(crate) struct OpenFile {
    pub(crate) rec: MftRecord,
    pub(crate) mftno: u64,
    /// Cursor + attribute of $DATA; absent for directories.
    pub(crate) data: Option<(AttrCursor, Attribute)>,
    pub(crate) size: u64,
    pub(crate) pos: u64,
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Resolve a path and make its target the open file. A leading '/' is
    /// optional; `#N` opens MFT record N directly. Every intermediate
    /// component must be a directory.
    pub fn open_path(&mut self, path: &str) -> Result<(), FsError> {
        self.open = None;
        let rel = path.strip_prefix('/').unwrap_or(path);

        if let Some(number) = rel.strip_prefix('#') {
            let mftno: u64 = number
                .parse()
                .map_err(|_| FsError::NotFound(format!("bad record number in {}", path)))?;
            return self.open_record(mftno);
        }

        let mut of = self.init_file(MFT_RECORD_ROOT)?;
        if !rel.is_empty() {
            for component in rel.split('/') {
                let hit = self
                    .scan_dir(&of.rec, &mut Lookup::Find(component))?
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                of = self.init_file(hit as u64)?;
            }
        }
        trace!("opened {} as MFT record {}", path, of.mftno);
        self.open = Some(of);
        Ok(())
    }

    /// Open an MFT record directly, metadata files included.
    pub fn open_record(&mut self, mftno: u64) -> Result<(), FsError> {
        self.open = None;
        let of = self.init_file(mftno)?;
        self.open = Some(of);
        Ok(())
    }

    fn init_file(&mut self, mftno: u64) -> Result<OpenFile, FsError> {
        let rec = self.read_mft(mftno)?;
        if !rec.is_in_use() {
            debug!("MFT 0x{:X} is not in use", mftno);
            return Err(FsError::Corrupt(format!("MFT record {} is not in use", mftno)));
        }

        let (data, size) = if rec.is_directory() {
            (None, 0)
        } else {
            let (cur, attr) = self
                .locate_attr(&rec, ATTR_TYPE_DATA)?
                .ok_or_else(|| {
                    debug!("no $DATA in MFT 0x{:X}", mftno);
                    FsError::Corrupt(format!("no $DATA in MFT record {}", mftno))
                })?;
            let size = attr.data_size();
            (Some((cur, attr)), size)
        };

        self.cache.valid = false;
        Ok(OpenFile {
            rec,
            mftno,
            data,
            size,
            pos: 0,
        })
    }

    /// Size of the open file (0 for directories).
    pub fn file_size(&self) -> Option<u64> {
        self.open.as_ref().map(|of| of.size)
    }

    pub fn file_position(&self) -> Option<u64> {
        self.open.as_ref().map(|of| of.pos)
    }

    pub fn is_directory(&self) -> Option<bool> {
        self.open.as_ref().map(|of| of.rec.is_directory())
    }

    /// Move the read/write position of the open file.
    pub fn seek(&mut self, pos: u64) -> Result<(), FsError> {
        let of = self
            .open
            .as_mut()
            .ok_or_else(|| FsError::Corrupt("no open file".to_string()))?;
        of.pos = pos;
        Ok(())
    }

    /// Read at the current position, advancing it. Returns the number of
    /// bytes read, clamped at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<u64, FsError> {
        let mut of = self
            .open
            .take()
            .ok_or_else(|| FsError::Corrupt("no open file".to_string()))?;
        let result = self.read_open(&mut of, buf);
        self.trace_armed = false;
        self.open = Some(of);
        result
    }

    fn read_open(&mut self, of: &mut OpenFile, buf: &mut [u8]) -> Result<u64, FsError> {
        if of.rec.is_directory() {
            return Err(FsError::Corrupt("cannot read a directory".to_string()));
        }
        let (cur, attr) = of.data.as_ref().expect("files always carry $DATA");

        let len = (buf.len() as u64).min(of.size.saturating_sub(of.pos));
        if len == 0 {
            return Ok(0);
        }
        self.read_attr(&of.rec, cur, attr, Some(&mut buf[..len as usize]), of.pos, len, true)?;
        of.pos += len;
        Ok(len)
    }

    /// Write at the current position, advancing it. Only resident $DATA of
    /// the most recently validated record is writable; everything else is
    /// rejected with an explicit message.
    pub fn write(&mut self, buf: &[u8]) -> Result<u64, FsError> {
        let mut of = self
            .open
            .take()
            .ok_or_else(|| FsError::Corrupt("no open file".to_string()))?;
        let result = self.write_open(&mut of, buf);
        self.trace_armed = false;
        self.open = Some(of);
        result
    }

    fn write_open(&mut self, of: &mut OpenFile, buf: &[u8]) -> Result<u64, FsError> {
        if of.rec.is_directory() {
            return Err(FsError::Corrupt("cannot write a directory".to_string()));
        }
        let attr = of.data.as_ref().expect("files always carry $DATA").1.clone();
        if !attr.is_resident() {
            if attr.flags & ATTR_FLAG_COMPRESSED != 0 {
                return Err(FsError::WriteRejected("cannot write compressed data".to_string()));
            }
            if attr.flags & ATTR_FLAG_SPARSE != 0 {
                return Err(FsError::WriteRejected("cannot write sparse data".to_string()));
            }
            return Err(FsError::WriteRejected("cannot write non-resident data".to_string()));
        }

        let (mftno, pos) = (of.mftno, of.pos);
        self.write_resident(&mut of.rec, mftno, &attr, buf, pos)?;

        // The value bytes moved under the stored attribute copy; re-locate
        // so subsequent reads see the new content.
        let (cur, attr) = self
            .locate_attr(&of.rec, ATTR_TYPE_DATA)?
            .ok_or_else(|| FsError::Corrupt("$DATA vanished after write".to_string()))?;
        of.size = attr.data_size();
        of.data = Some((cur, attr));
        of.pos += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    /// Enumerate the final path component as a completion prefix: every
    /// entry it prefixes (case-insensitively) is handed to `sink`.
    /// Returns the match count; zero matches is "file not found".
    pub fn complete_path(
        &mut self,
        path: &str,
        sink: &mut dyn FnMut(&DirEntryInfo),
    ) -> Result<usize, FsError> {
        let rel = path.strip_prefix('/').unwrap_or(path);
        let (dir_part, prefix) = match rel.rfind('/') {
            Some(split) => (&rel[..split], &rel[split + 1..]),
            None => ("", rel),
        };

        let mut of = self.init_file(MFT_RECORD_ROOT)?;
        if !dir_part.is_empty() {
            for component in dir_part.split('/') {
                let hit = self
                    .scan_dir(&of.rec, &mut Lookup::Find(component))?
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                of = self.init_file(hit as u64)?;
            }
        }

        let mut lookup = Lookup::Complete {
            prefix,
            sink,
            matched: 0,
        };
        self.scan_dir(&of.rec, &mut lookup)?;
        let matched = match lookup {
            Lookup::Complete { matched, .. } => matched,
            _ => unreachable!(),
        };
        if matched == 0 {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(matched)
    }

    /// List a directory: every entry, DOS aliases suppressed.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let mut entries = Vec::new();
        let dir = if path == "/" || path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        self.complete_path(&dir, &mut |e| entries.push(e.clone()))
            .or_else(|err| match err {
                // An empty directory is not an error for a listing.
                FsError::NotFound(_) => Ok(0),
                other => Err(other),
            })?;
        Ok(entries)
    }

    /// Materialize the physical extent chain of the open file through the
    /// read-trace hook, without copying any payload.
    pub fn file_extents(&mut self) -> Result<Vec<Extent>, FsError> {
        let mut of = self
            .open
            .take()
            .ok_or_else(|| FsError::Corrupt("no open file".to_string()))?;

        let collected = Rc::new(RefCell::new(Vec::new()));
        let hook = collected.clone();
        let saved = self.trace.take();
        self.trace = Some(Box::new(move |sector, offset, len| {
            hook.borrow_mut().push(Extent {
                sector,
                offset,
                len,
            })
        }));
        self.cache.valid = false;

        let result = (|| {
            if of.rec.is_directory() {
                return Err(FsError::Corrupt("cannot read a directory".to_string()));
            }
            let (cur, attr) = of.data.as_ref().expect("files always carry $DATA");
            if of.size > 0 {
                self.read_attr(&of.rec, cur, attr, None, 0, of.size, true)?;
            }
            Ok(())
        })();

        self.trace = saved;
        self.trace_armed = false;
        self.open = Some(of);
        result?;

        let extents = Rc::try_unwrap(collected)
            .expect("trace hook dropped")
            .into_inner();
        Ok(extents)
    }
}
