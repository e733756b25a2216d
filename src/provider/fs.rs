//! The local filesystem back-end.
//!
//! An endpoint maps a subtree of the host filesystem.  Containment is
//! enforced on every path the back-end touches: the canonical path
//! must stay below the canonical base of the endpoint, otherwise the
//! operation is refused with NO_PERMISSION.
//!
//! REL files are emulated on plain files: positioning past the end is
//! remembered and the next write extends the file with 0xFF record
//! markers, following the expansion schedule of the disk-image
//! back-end.  Block commands are not supported on this provider.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::cell::Cell;
use std::fs::{File, OpenOptions, ReadDir};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::charset::Charset;
use crate::config::Config;
use crate::error::{cbm_error_from_io, CbmError};
use crate::name::OpenParams;
use crate::wildcard::match_pattern;
use crate::wire::{self, DirEntry, DirMode, FileType};

use super::{CloseStatus, Endpoint, EndpointRef, FileMeta, OpenMode, Provider, ServerFile};

/// Free-space figure reported in the blocks-free trailer.  The host
/// only displays it, so a capped estimate is good enough.
const FREE_ESTIMATE: u64 = 65535 * 254;

/// Convert a modification time to the wire date format
/// (year-1900, month, day, hour, minute, second).
pub(crate) fn wire_date(mtime: SystemTime) -> [u8; 6] {
    let secs = match mtime.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    };
    let days = secs.div_euclid(86400);
    let tod = secs.rem_euclid(86400);

    // civil-from-days, Gregorian
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };

    [
        (year - 1900).clamp(0, 255) as u8,
        m as u8,
        d as u8,
        (tod / 3600) as u8,
        ((tod / 60) % 60) as u8,
        (tod % 60) as u8,
    ]
}

/// An endpoint mapping one directory subtree.
pub struct FsEndpoint {
    weak: Weak<FsEndpoint>,
    base: PathBuf,
    is_assigned: Cell<u32>,
    open_files: Cell<usize>,
}

impl FsEndpoint {
    fn new(base: PathBuf) -> Rc<FsEndpoint> {
        Rc::new_cyclic(|weak| FsEndpoint {
            weak: weak.clone(),
            base,
            is_assigned: Cell::new(0),
            open_files: Cell::new(0),
        })
    }

    fn rc(&self) -> Rc<FsEndpoint> {
        self.weak.upgrade().expect("endpoint already dropped")
    }

    /// Check that a candidate path stays below the endpoint base.
    /// For a path that does not exist yet the parent directory is
    /// checked instead.
    fn contained(&self, candidate: &Path) -> Result<PathBuf, CbmError> {
        let real = match candidate.canonicalize() {
            Ok(p) => p,
            Err(_) => {
                let parent = candidate.parent().ok_or(CbmError::NoPermission)?;
                let file = candidate.file_name().ok_or(CbmError::NoPermission)?;
                let mut p = parent
                    .canonicalize()
                    .map_err(|e| cbm_error_from_io(&e))?;
                p.push(file);
                p
            }
        };
        if real == self.base || real.starts_with(&self.base) {
            Ok(real)
        } else {
            warn!(
                "path {} is not below base {}",
                real.display(),
                self.base.display()
            );
            Err(CbmError::NoPermission)
        }
    }
}

impl Endpoint for FsEndpoint {
    fn provider_name(&self) -> &'static str {
        "fs"
    }

    fn charset(&self) -> Charset {
        Charset::Ascii
    }

    fn root(&self) -> Result<Box<dyn ServerFile>, CbmError> {
        Ok(Box::new(FsFile::new_dir(self.rc(), self.base.clone())))
    }

    fn assign(&self) {
        self.is_assigned.set(self.is_assigned.get() + 1);
    }

    fn unassign(&self) -> bool {
        let n = self.is_assigned.get();
        if n > 0 {
            self.is_assigned.set(n - 1);
        }
        self.is_assigned.get() == 0 && self.open_files.get() == 0
    }

    fn open_files(&self) -> usize {
        self.open_files.get()
    }

    fn root_os_path(&self) -> Option<PathBuf> {
        Some(self.base.clone())
    }

    // block I/O stays unsupported on the local filesystem; the drive
    // reports itself not ready for it
}

/// Directory read progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DirState {
    None,
    First,
    Entries,
    End,
}

/// A file or directory handle below an FsEndpoint.
pub(crate) struct FsFile {
    ep: Rc<FsEndpoint>,
    path: PathBuf,
    meta: FileMeta,
    file: Option<File>,
    access: Option<OpenMode>,
    lastpos: u64,
    dir_state: DirState,
    dir_iter: Option<ReadDir>,
    pattern: Vec<u8>,
    written: bool,
    closed: bool,
}

impl FsFile {
    fn register(ep: &Rc<FsEndpoint>) {
        ep.open_files.set(ep.open_files.get() + 1);
    }

    fn name_bytes(path: &Path) -> Vec<u8> {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_else(|| b"/".to_vec())
    }

    fn new_dir(ep: Rc<FsEndpoint>, path: PathBuf) -> FsFile {
        Self::register(&ep);
        let name = Self::name_bytes(&path);
        FsFile {
            ep,
            meta: FileMeta {
                name,
                cset: Charset::Ascii,
                ftype: FileType::Dir,
                attr: 0,
                size: 0,
                date: [0; 6],
                recordlen: 0,
                writable: true,
                seekable: false,
                is_dir: true,
            },
            path,
            file: None,
            access: None,
            lastpos: 0,
            dir_state: DirState::None,
            dir_iter: None,
            pattern: b"*".to_vec(),
            written: false,
            closed: false,
        }
    }

    fn from_path(ep: Rc<FsEndpoint>, path: PathBuf) -> Result<FsFile, CbmError> {
        Self::register(&ep);
        let md = path.metadata().map_err(|e| cbm_error_from_io(&e))?;
        let is_dir = md.is_dir();
        let date = md.modified().map(wire_date).unwrap_or([0; 6]);
        let writable = !md.permissions().readonly();
        let name = Self::name_bytes(&path);
        Ok(FsFile {
            ep,
            meta: FileMeta {
                name,
                cset: Charset::Ascii,
                ftype: if is_dir { FileType::Dir } else { FileType::Prg },
                attr: if writable { 0 } else { wire::ATTR_LOCKED },
                size: md.len(),
                date,
                recordlen: 0,
                writable,
                seekable: true,
                is_dir,
            },
            path,
            file: None,
            access: None,
            lastpos: 0,
            dir_state: DirState::None,
            dir_iter: None,
            pattern: b"*".to_vec(),
            written: false,
            closed: false,
        })
    }

    fn handle(&mut self) -> Result<&mut File, CbmError> {
        self.file.as_mut().ok_or(CbmError::FileNotOpen)
    }

    /// Extend the file so the record in `lastpos` exists, writing a
    /// 0xFF marker at the start of each new record.
    fn expand_records(&mut self) -> Result<(), CbmError> {
        let reclen = self.meta.recordlen as u64;
        if reclen == 0 || self.lastpos == 0 {
            return Ok(());
        }
        let target = self.lastpos;
        self.lastpos = 0;
        let f = self.handle()?;
        let len = f.metadata().map_err(|e| cbm_error_from_io(&e))?.len();
        let cur_records = len / reclen;
        if cur_records >= target {
            return Ok(());
        }
        f.seek(SeekFrom::End(0)).map_err(|e| cbm_error_from_io(&e))?;
        // start on a record boundary
        let tail = len % reclen;
        if tail != 0 {
            let pad = vec![0u8; (reclen - tail) as usize];
            f.write_all(&pad).map_err(|e| cbm_error_from_io(&e))?;
        }
        let mut record = vec![0u8; reclen as usize];
        record[0] = 0xff;
        for _ in cur_records..target {
            f.write_all(&record).map_err(|e| cbm_error_from_io(&e))?;
        }
        self.written = true;
        debug!("expanded {} to {} records", self.path.display(), target);
        Ok(())
    }

    fn read_dir_entry(&mut self) -> Result<(Option<DirEntry>, bool), CbmError> {
        match self.dir_state {
            DirState::None => Err(CbmError::FileTypeMismatch),
            DirState::First => {
                self.dir_state = DirState::Entries;
                self.dir_iter = Some(
                    std::fs::read_dir(&self.path).map_err(|e| cbm_error_from_io(&e))?,
                );
                Ok((
                    Some(DirEntry {
                        name: self.meta.name.clone(),
                        cset: Charset::Ascii,
                        size: 0,
                        date: [0; 6],
                        mode: DirMode::Name,
                        ftype: FileType::Del,
                        attr: 0,
                        recordlen: 0,
                    }),
                    false,
                ))
            }
            DirState::Entries => {
                while let Some(iter) = self.dir_iter.as_mut() {
                    let entry = match iter.next() {
                        Some(e) => e.map_err(|e| cbm_error_from_io(&e))?,
                        None => break,
                    };
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !match_pattern(
                        &self.pattern,
                        Charset::Ascii,
                        name.as_bytes(),
                        Charset::Ascii,
                        true,
                    ) {
                        continue;
                    }
                    let md = match entry.metadata() {
                        Ok(md) => md,
                        Err(_) => continue,
                    };
                    let date = md.modified().map(wire_date).unwrap_or([0; 6]);
                    return Ok((
                        Some(DirEntry {
                            name: name.into_bytes(),
                            cset: Charset::Ascii,
                            size: md.len(),
                            date,
                            mode: if md.is_dir() { DirMode::Dir } else { DirMode::File },
                            ftype: if md.is_dir() { FileType::Dir } else { FileType::Prg },
                            attr: 0,
                            recordlen: 0,
                        }),
                        false,
                    ));
                }
                self.dir_state = DirState::End;
                Ok((
                    Some(DirEntry {
                        name: Vec::new(),
                        cset: Charset::Ascii,
                        size: FREE_ESTIMATE,
                        date: [0; 6],
                        mode: DirMode::Free,
                        ftype: FileType::Del,
                        attr: wire::ATTR_ESTIMATE,
                        recordlen: 0,
                    }),
                    true,
                ))
            }
            DirState::End => Ok((None, true)),
        }
    }
}

impl Drop for FsFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
        self.ep.open_files.set(self.ep.open_files.get() - 1);
    }
}

impl ServerFile for FsFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    fn os_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn open(&mut self, pars: &OpenParams, mode: OpenMode) -> Result<CbmError, CbmError> {
        if mode == OpenMode::Directory {
            if !self.meta.is_dir {
                return Err(CbmError::FileTypeMismatch);
            }
            self.dir_state = DirState::First;
            self.access = Some(mode);
            return Ok(CbmError::Ok);
        }
        if self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }

        // containment of the final path
        let path = self.ep.contained(&self.path)?;

        let is_rel = pars.filetype == FileType::Rel || self.meta.recordlen > 0;
        if is_rel {
            if self.meta.recordlen == 0 {
                // a plain file opened as REL adopts the requested length
                self.meta.recordlen = pars.recordlen;
            } else if pars.recordlen != 0 && pars.recordlen != self.meta.recordlen {
                return Err(CbmError::RecordNotPresent);
            }
            if self.meta.recordlen == 0 {
                return Err(CbmError::RecordNotPresent);
            }
        }

        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&path),
            OpenMode::Write => OpenOptions::new().write(true).create_new(true).open(&path),
            OpenMode::Overwrite => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path),
            OpenMode::Append => OpenOptions::new().append(true).open(&path),
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path),
            OpenMode::Directory => unreachable!(),
        }
        .map_err(|e| cbm_error_from_io(&e))?;

        self.file = Some(file);
        self.access = Some(mode);
        debug!("fs open {} mode {:?}", path.display(), mode);

        Ok(if is_rel { CbmError::OpenRel } else { CbmError::Ok })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CbmError> {
        if self.dir_state != DirState::None {
            let (entry, eof) = self.read_dir_entry()?;
            return match entry {
                Some(e) => {
                    let bytes = e.to_wire();
                    if bytes.len() > buf.len() {
                        return Err(CbmError::Fault);
                    }
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok((bytes.len(), eof))
                }
                None => Ok((0, true)),
            };
        }

        let f = self.handle()?;
        let n = f.read(buf).map_err(|e| cbm_error_from_io(&e))?;
        if n == 0 {
            return Ok((0, true));
        }
        let pos = f
            .stream_position()
            .map_err(|e| cbm_error_from_io(&e))?;
        let len = f.metadata().map_err(|e| cbm_error_from_io(&e))?.len();
        Ok((n, pos >= len))
    }

    fn write(&mut self, data: &[u8], _eof: bool) -> Result<(), CbmError> {
        match self.access {
            Some(mode) if mode.writes() => {}
            _ => return Err(CbmError::FileNotOpen),
        }
        if self.lastpos > 0 {
            let target = self.lastpos;
            self.expand_records()?;
            let reclen = self.meta.recordlen as u64;
            let f = self.handle()?;
            f.seek(SeekFrom::Start((target - 1) * reclen))
                .map_err(|e| cbm_error_from_io(&e))?;
        }
        let f = self.handle()?;
        f.write_all(data).map_err(|e| cbm_error_from_io(&e))?;
        self.written = true;
        Ok(())
    }

    fn position(&mut self, record: u16) -> Result<(), CbmError> {
        let reclen = self.meta.recordlen as u64;
        let factor = reclen.max(1);
        let offset = record as u64 * factor;
        self.lastpos = 0;

        let f = self.handle()?;
        let len = f.metadata().map_err(|e| cbm_error_from_io(&e))?.len();
        if reclen > 0 {
            if offset + reclen > len {
                // remembered, the next write expands the file
                self.lastpos = record as u64 + 1;
                return Err(CbmError::RecordNotPresent);
            }
        } else if offset > len {
            return Err(CbmError::RecordNotPresent);
        }
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| cbm_error_from_io(&e))?;
        Ok(())
    }

    fn seek_bytes(&mut self, offset: u64) -> Result<(), CbmError> {
        let f = self.handle()?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| cbm_error_from_io(&e))?;
        Ok(())
    }

    fn close(&mut self) -> CloseStatus {
        if self.closed {
            return CloseStatus::ok();
        }
        self.closed = true;
        if self.written {
            if let Some(f) = self.file.as_mut() {
                if let Err(e) = f.sync_all() {
                    return CloseStatus {
                        code: cbm_error_from_io(&e),
                        extra: Vec::new(),
                    };
                }
            }
        }
        self.file = None;
        CloseStatus::ok()
    }

    fn next_entry(&mut self) -> Result<Option<Box<dyn ServerFile>>, CbmError> {
        if !self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }
        if self.dir_iter.is_none() {
            self.dir_iter =
                Some(std::fs::read_dir(&self.path).map_err(|e| cbm_error_from_io(&e))?);
        }
        let iter = self.dir_iter.as_mut().unwrap();
        loop {
            let entry = match iter.next() {
                Some(e) => e.map_err(|e| cbm_error_from_io(&e))?,
                None => return Ok(None),
            };
            match FsFile::from_path(self.ep.clone(), entry.path()) {
                Ok(f) => return Ok(Some(Box::new(f))),
                Err(_) => continue,
            }
        }
    }

    fn read_entry(&mut self) -> Result<(Option<DirEntry>, bool), CbmError> {
        self.read_dir_entry()
    }

    fn set_pattern(&mut self, pattern: &[u8], cset: Charset) {
        if !pattern.is_empty() {
            self.pattern = crate::charset::convert(pattern, cset, Charset::Ascii);
        }
    }

    fn create_child(
        &mut self,
        name: &[u8],
        pars: &OpenParams,
        mode: OpenMode,
    ) -> Result<Box<dyn ServerFile>, CbmError> {
        if !self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }
        let name = String::from_utf8_lossy(name).into_owned();
        if name.is_empty() || name.contains('/') {
            return Err(CbmError::SyntaxPattern);
        }
        let candidate = self.path.join(&name);
        let path = self.ep.contained(&candidate)?;

        FsFile::register(&self.ep);
        let mut file = FsFile {
            ep: self.ep.clone(),
            meta: FileMeta {
                name: name.into_bytes(),
                cset: Charset::Ascii,
                ftype: if pars.filetype == FileType::Unknown {
                    FileType::Prg
                } else {
                    pars.filetype
                },
                attr: 0,
                size: 0,
                date: [0; 6],
                recordlen: pars.recordlen,
                writable: true,
                seekable: true,
                is_dir: false,
            },
            path,
            file: None,
            access: None,
            lastpos: 0,
            dir_state: DirState::None,
            dir_iter: None,
            pattern: b"*".to_vec(),
            written: false,
            closed: false,
        };
        file.open(pars, mode)?;
        Ok(Box::new(file))
    }

    fn mkdir(&mut self, name: &[u8]) -> Result<(), CbmError> {
        if !self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }
        let name = String::from_utf8_lossy(name).into_owned();
        let path = self.ep.contained(&self.path.join(&name))?;
        std::fs::create_dir(&path).map_err(|e| cbm_error_from_io(&e))
    }

    fn rmdir(&mut self) -> Result<(), CbmError> {
        if !self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }
        let path = self.ep.contained(&self.path)?;
        if path == self.ep.base {
            return Err(CbmError::NoPermission);
        }
        self.closed = true;
        std::fs::remove_dir(&path).map_err(|e| cbm_error_from_io(&e))
    }

    fn scratch(&mut self) -> Result<(), CbmError> {
        let path = self.ep.contained(&self.path)?;
        self.closed = true;
        if self.meta.is_dir {
            std::fs::remove_dir(&path).map_err(|e| cbm_error_from_io(&e))
        } else {
            std::fs::remove_file(&path).map_err(|e| cbm_error_from_io(&e))
        }
    }

    fn rename(&mut self, new_name: &[u8], cset: Charset) -> Result<(), CbmError> {
        let name = crate::charset::convert(new_name, cset, Charset::Ascii);
        let name = String::from_utf8_lossy(&name).into_owned();
        if name.is_empty() || name.contains('/') {
            return Err(CbmError::SyntaxPattern);
        }
        let parent = self.path.parent().ok_or(CbmError::NoPermission)?;
        let target = self.ep.contained(&parent.join(&name))?;
        if target.exists() {
            return Err(CbmError::FileExists);
        }
        self.closed = true;
        std::fs::rename(&self.path, &target).map_err(|e| cbm_error_from_io(&e))
    }
}

/// The local-filesystem provider.
pub struct FsProvider;

impl FsProvider {
    /// Create the provider.
    pub fn new() -> FsProvider {
        FsProvider
    }
}

impl Default for FsProvider {
    fn default() -> Self {
        FsProvider::new()
    }
}

impl Provider for FsProvider {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn charset(&self) -> Charset {
        Charset::Ascii
    }

    fn endpoint(&self, path: &str, _cfg: &Config) -> Result<EndpointRef, CbmError> {
        let base = Path::new(path)
            .canonicalize()
            .map_err(|e| cbm_error_from_io(&e))?;
        if !base.is_dir() {
            return Err(CbmError::FileTypeMismatch);
        }
        debug!("fs endpoint at {}", base.display());
        Ok(FsEndpoint::new(base))
    }
}

#[cfg(test)]
mod tests {
    use super::{wire_date, FsProvider};
    use crate::config::Config;
    use crate::name::OpenParams;
    use crate::provider::{OpenMode, Provider};
    use std::time::{Duration, UNIX_EPOCH};

    fn test_base(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn wire_date_epoch() {
        let d = wire_date(UNIX_EPOCH);
        assert_eq!(d, [70, 1, 1, 0, 0, 0]);
        // 2000-01-02 03:04:05
        let t = UNIX_EPOCH + Duration::from_secs(946782245);
        let d = wire_date(t);
        assert_eq!(d, [100, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn write_then_read_round_trip() {
        let base = test_base("cbmfs-fs-roundtrip");
        let cfg = Config::default();
        let provider = FsProvider::new();
        let ep = provider.endpoint(base.to_str().unwrap(), &cfg).unwrap();

        let mut root = ep.root().unwrap();
        let pars = OpenParams::default();
        let mut f = root
            .create_child(b"data.bin", &pars, OpenMode::Write)
            .unwrap();
        f.write(b"hello world", true).unwrap();
        drop(f);

        // OPEN_WR refuses an existing file
        match root.create_child(b"data.bin", &pars, OpenMode::Write) {
            Err(err) => assert_eq!(err, crate::error::CbmError::FileExists),
            Ok(_) => panic!("expected create_child() to fail"),
        }

        // find the entry again and read the bytes back
        let mut root2 = ep.root().unwrap();
        let mut found = None;
        while let Some(e) = root2.next_entry().unwrap() {
            if e.meta().name == b"data.bin".to_vec() {
                found = Some(e);
                break;
            }
        }
        let mut entry = found.expect("entry not listed");
        entry.open(&pars, OpenMode::Read).unwrap();
        let mut buf = [0u8; 32];
        let (n, eof) = entry.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert!(eof);

        std::fs::remove_dir_all(base).unwrap();
    }

    #[test]
    fn names_with_separators_are_refused() {
        let base = test_base("cbmfs-fs-containment");
        let cfg = Config::default();
        let provider = FsProvider::new();
        let ep = provider.endpoint(base.to_str().unwrap(), &cfg).unwrap();

        let mut root = ep.root().unwrap();
        let pars = OpenParams::default();
        match root.create_child(b"../escape.bin", &pars, OpenMode::Write) {
            Err(err) => assert_eq!(err, crate::error::CbmError::SyntaxPattern),
            Ok(_) => panic!("expected create_child() to fail"),
        }

        std::fs::remove_dir_all(base).unwrap();
    }
}
