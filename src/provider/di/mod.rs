//! The disk-image back-end.
//!
//! An endpoint of this provider is a mounted `.d64/.d71/.d80/.d81/
//! .d82` image file.  It reproduces the on-disk structures of the
//! respective Commodore DOS: BAM allocation, directory slots, linked
//! data-block chains and REL side sectors, with the documented DOS
//! bugs behind runtime switches.
//!
//! The endpoint owns the image file handle, the resident BAM and
//! directory buffers and the direct-channel buffers; every file open
//! on the endpoint owns its data/side/super buffers.  All files of
//! one endpoint share the resident buffers, which are flushed before
//! an operation returns so no cross-file staleness is observable.
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod bam;
pub mod buffer;
pub mod dir;
pub mod format;
pub mod geometry;
pub mod rel;

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use log::{debug, info, warn};

use crate::charset::{convert, Charset};
use crate::config::{Config, DosBugs};
use crate::error::{cbm_error_from_io, CbmError};
use crate::name::OpenParams;
use crate::wildcard::match_pattern;
use crate::wire::{self, block, DirEntry, DirMode, FileType};

use crate::provider::{
    CloseStatus, DirectResult, Endpoint, EndpointRef, FileMeta, OpenMode, Provider, ServerFile,
};

use self::buffer::{Block, ImageDev};
use self::dir::{Slot, TYPE_CLOSED, TYPE_LOCKED};
use self::geometry::{SECTOR_DATA, SECTOR_SIZE};

/// Number of direct-channel buffers per endpoint.
const DIRECT_BUFFERS: usize = 5;

/// One direct-channel buffer (U1/U2).
pub(crate) struct DirectBuf {
    pub(crate) buf: Block,
    pub(crate) chan: Option<u8>,
    pub(crate) bp: u16,
    /// write-back target of a pending U2
    pub(crate) u2: Option<(u8, u8)>,
}

impl DirectBuf {
    fn new() -> DirectBuf {
        DirectBuf {
            buf: Block::new(),
            chan: None,
            bp: 0,
            u2: None,
        }
    }
}

/// The mutable state of a mounted image.
pub(crate) struct DiImage {
    pub(crate) dev: ImageDev,
    pub(crate) bam1: Block,
    pub(crate) bam2: Block,
    pub(crate) dir: Block,
    pub(crate) direct: [DirectBuf; DIRECT_BUFFERS],
    pub(crate) bugs: DosBugs,
    pub(crate) advanced: bool,
    pub(crate) current_track: u8,
}

impl DiImage {
    fn new(dev: ImageDev, cfg: &Config) -> DiImage {
        DiImage {
            dev,
            bam1: Block::new(),
            bam2: Block::new(),
            dir: Block::new(),
            direct: [
                DirectBuf::new(),
                DirectBuf::new(),
                DirectBuf::new(),
                DirectBuf::new(),
                DirectBuf::new(),
            ],
            bugs: cfg.dos_bugs,
            advanced: cfg.advanced_wildcards,
            current_track: 0,
        }
    }

    /// Pick the direct buffer for a channel: an existing binding is
    /// reused, otherwise the first free buffer is taken.
    fn bind_direct(&mut self, chan: u8) -> usize {
        if let Some(i) = self.direct.iter().position(|d| d.chan == Some(chan)) {
            return i;
        }
        self.direct
            .iter()
            .position(|d| d.chan.is_none())
            .unwrap_or(0)
    }
}

/// A mounted disk image endpoint.
pub struct DiEndpoint {
    weak: Weak<DiEndpoint>,
    inner: RefCell<DiImage>,
    path: PathBuf,
    is_assigned: Cell<u32>,
    is_temporary: Cell<bool>,
    open_files: Cell<usize>,
}

impl DiEndpoint {
    fn new(dev: ImageDev, path: PathBuf, cfg: &Config) -> Rc<DiEndpoint> {
        Rc::new_cyclic(|weak| DiEndpoint {
            weak: weak.clone(),
            inner: RefCell::new(DiImage::new(dev, cfg)),
            path,
            is_assigned: Cell::new(0),
            is_temporary: Cell::new(false),
            open_files: Cell::new(0),
        })
    }

    fn rc(&self) -> Rc<DiEndpoint> {
        self.weak.upgrade().expect("endpoint already dropped")
    }

    /// Whether the endpoint was created by wrapping an image file
    /// during path resolution; such endpoints go away with their last
    /// open file instead of staying mounted.
    pub fn is_temporary(&self) -> bool {
        self.is_temporary.get()
    }
}

impl Endpoint for DiEndpoint {
    fn provider_name(&self) -> &'static str {
        "di"
    }

    fn charset(&self) -> Charset {
        Charset::Petscii
    }

    fn root(&self) -> Result<Box<dyn ServerFile>, CbmError> {
        let img = self.inner.borrow();
        let cursor = img.first_slot();
        let writable = img.dev.writable();
        drop(img);
        Ok(Box::new(DiFile::root(self.rc(), cursor, writable)))
    }

    fn assign(&self) {
        self.is_assigned.set(self.is_assigned.get() + 1);
    }

    fn unassign(&self) -> bool {
        let n = self.is_assigned.get();
        if n > 0 {
            self.is_assigned.set(n - 1);
        }
        if self.is_assigned.get() == 0 && self.open_files.get() > 0 {
            warn!(
                "unassigning image endpoint {} with {} open files",
                self.path.display(),
                self.open_files.get()
            );
        }
        self.is_assigned.get() == 0 && self.open_files.get() == 0
    }

    fn open_files(&self) -> usize {
        self.open_files.get()
    }

    fn root_os_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn format(&self, name: &[u8]) -> Result<(), CbmError> {
        let mut img = self.inner.borrow_mut();
        if !img.dev.writable() {
            return Err(CbmError::WriteProtect);
        }
        img.format(name)
    }

    fn direct(&self, payload: &[u8]) -> Result<DirectResult, CbmError> {
        if payload.len() < 6 {
            return Err(CbmError::SyntaxInval);
        }
        let cmd = payload[wire::block_par::CMD];
        let track = payload[wire::block_par::TRACK];
        let track_hi = payload[wire::block_par::TRACK + 1];
        let sector = payload[wire::block_par::SECTOR];
        let sector_hi = payload[wire::block_par::SECTOR + 1];
        let chan = payload[wire::block_par::CHANNEL];

        let mut img = self.inner.borrow_mut();
        debug!(
            "direct(cmd={}, t={}, s={}, chan={})",
            cmd, track, sector, chan
        );

        if track_hi != 0 || sector_hi != 0 || img.dev.assert_ts(track, sector).is_err() {
            return Ok(DirectResult {
                code: CbmError::IllegalTrackOrSector,
                payload: vec![track, track_hi, sector, sector_hi],
                file: None,
            });
        }

        let echo = vec![track, 0, sector, 0];
        match cmd {
            block::U1 => {
                let idx = img.bind_direct(chan);
                let DiImage { dev, direct, .. } = &mut *img;
                direct[idx].buf.map(dev, track, sector)?;
                direct[idx].chan = Some(chan);
                direct[idx].bp = 0;
                direct[idx].u2 = None;
                drop(img);
                let file = DiBlockFile::new(self.rc(), idx, false);
                Ok(DirectResult {
                    code: CbmError::Ok,
                    payload: echo,
                    file: Some(Box::new(file)),
                })
            }
            block::U2 => {
                let idx = img.bind_direct(chan);
                img.direct[idx].buf = Block::new();
                img.direct[idx].chan = Some(chan);
                img.direct[idx].bp = 0;
                img.direct[idx].u2 = Some((track, sector));
                drop(img);
                let file = DiBlockFile::new(self.rc(), idx, true);
                Ok(DirectResult {
                    code: CbmError::Ok,
                    payload: echo,
                    file: Some(Box::new(file)),
                })
            }
            block::BA => {
                let (code, ts) = img.block_alloc(track, sector)?;
                img.flush_bam()?;
                Ok(DirectResult {
                    code,
                    payload: vec![ts.0, 0, ts.1, 0],
                    file: None,
                })
            }
            block::BF => {
                img.block_free(track, sector)?;
                img.flush_bam()?;
                Ok(DirectResult {
                    code: CbmError::Ok,
                    payload: echo,
                    file: None,
                })
            }
            _ => Err(CbmError::SyntaxInval),
        }
    }
}

/// Directory read state of a file handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DirState {
    /// not a directory read
    None,
    /// next read returns the disk header
    First,
    /// reading entries
    Entries,
    /// the blocks-free trailer was delivered
    End,
}

/// A file open on a disk-image endpoint.
pub(crate) struct DiFile {
    ep: Rc<DiEndpoint>,
    meta: FileMeta,
    pub(crate) slot: Slot,
    pub(crate) data: Block,
    pub(crate) side: Block,
    pub(crate) super_: Block,
    pub(crate) chp: u8,
    access: Option<OpenMode>,
    pub(crate) lastpos: u32,
    pub(crate) maxrecord: u32,
    dir_state: DirState,
    dir_cursor: Slot,
    pattern: Vec<u8>,
    closed: bool,
}

impl DiFile {
    fn register(ep: &Rc<DiEndpoint>) {
        ep.open_files.set(ep.open_files.get() + 1);
    }

    fn root(ep: Rc<DiEndpoint>, cursor: Slot, writable: bool) -> DiFile {
        Self::register(&ep);
        DiFile {
            ep,
            meta: FileMeta {
                name: b"$".to_vec(),
                cset: Charset::Petscii,
                ftype: FileType::Dir,
                attr: 0,
                size: 0,
                date: [0; 6],
                recordlen: 0,
                writable,
                seekable: false,
                is_dir: true,
            },
            slot: Slot::default(),
            data: Block::new(),
            side: Block::new(),
            super_: Block::new(),
            chp: 0,
            access: None,
            lastpos: 0,
            maxrecord: 0,
            dir_state: DirState::None,
            dir_cursor: cursor,
            pattern: b"*".to_vec(),
            closed: false,
        }
    }

    fn from_slot(ep: Rc<DiEndpoint>, slot: Slot, writable: bool) -> DiFile {
        Self::register(&ep);
        let ftype = slot.file_type();
        let mut attr = 0;
        if slot.type_byte & TYPE_CLOSED == 0 {
            attr |= wire::ATTR_SPLAT;
        }
        if slot.type_byte & TYPE_LOCKED != 0 || !writable {
            attr |= wire::ATTR_LOCKED;
        }
        let meta = FileMeta {
            name: slot.filename.clone(),
            cset: Charset::Petscii,
            ftype,
            attr,
            size: slot.size as u64 * SECTOR_DATA as u64,
            date: [0; 6],
            recordlen: slot.recordlen,
            writable,
            seekable: ftype == FileType::Rel,
            is_dir: false,
        };
        DiFile {
            ep,
            meta,
            slot,
            data: Block::new(),
            side: Block::new(),
            super_: Block::new(),
            chp: 0,
            access: None,
            lastpos: 0,
            maxrecord: 0,
            dir_state: DirState::None,
            dir_cursor: Slot::default(),
            pattern: b"*".to_vec(),
            closed: false,
        }
    }

    /// Bind the data buffer to the first data block.
    fn pos_start(&mut self, img: &mut DiImage, read: bool) -> Result<(), CbmError> {
        let (t, s) = (self.slot.start_track, self.slot.start_sector);
        if read || self.meta.recordlen > 0 {
            self.data.map(&mut img.dev, t, s)?;
        } else {
            self.data.set(t, s);
        }
        self.chp = 0;
        debug!("pos_start ({},{})", t, s);
        Ok(())
    }

    /// Walk the chain to the last block for appending.
    fn pos_append(&mut self, img: &mut DiImage) -> Result<(), CbmError> {
        let (mut t, mut s) = (self.slot.start_track, self.slot.start_sector);
        loop {
            self.data.map(&mut img.dev, t, s)?;
            let (nt, ns) = self.data.link();
            if nt == 0 {
                break;
            }
            t = nt;
            s = ns;
        }
        // continue behind the last used byte
        self.chp = self.data.link().1.saturating_sub(1);
        debug!("pos_append ({},{}) chp={}", t, s, self.chp);
        Ok(())
    }

    /// Absolute byte seek following the block chain (sequential
    /// files).
    fn seek_chain(&mut self, img: &mut DiImage, mut position: u64) -> Result<(), CbmError> {
        self.lastpos = 0;
        let (mut t, mut s) = (self.slot.start_track, self.slot.start_sector);
        loop {
            self.data.reuse_or_map(&mut img.dev, t, s)?;
            let (nt, ns) = self.data.link();
            if nt == 0 || position < SECTOR_DATA as u64 {
                break;
            }
            position -= SECTOR_DATA as u64;
            t = nt;
            s = ns;
        }
        if position >= SECTOR_DATA as u64 {
            // seek behind the end of the file; the DOS answers with
            // the REL code even for sequential files
            return Err(CbmError::RecordNotPresent);
        }
        self.chp = position as u8;
        Ok(())
    }

    fn read_seq(&mut self, img: &mut DiImage, out: &mut [u8]) -> Result<(usize, bool), CbmError> {
        let mut i = 0;
        loop {
            let (nt, ns) = self.data.link();
            if nt == 0 && self.chp as u16 + 1 >= ns as u16 {
                return Ok((i, true));
            }
            if i >= out.len() {
                return Ok((i, false));
            }
            out[i] = self.data.data[self.chp as usize + 2];
            i += 1;
            self.chp += 1;
            if nt != 0 && self.chp as u16 + 1 >= 255 {
                self.data.reuse_or_map(&mut img.dev, nt, ns)?;
                self.chp = 0;
            }
        }
    }

    fn write_seq(&mut self, img: &mut DiImage, buf: &[u8]) -> Result<(), CbmError> {
        self.data.mark_dirty();
        for &b in buf {
            if self.chp > 253 {
                self.chp = 0;
                let (t, _) = self.data.link();
                if t == 0 {
                    if self.meta.recordlen > 0 {
                        // a REL file never grows through plain writes;
                        // expansion happens via POSITION
                        return Err(CbmError::OverflowInRecord);
                    }
                    // appending: allocate and link the next block
                    let (pt, ps) = self.data.ts();
                    let (nt, ns) = img.find_free_block_nxtts(pt, ps)?;
                    self.data.data[0] = nt;
                    self.data.data[1] = ns;
                    self.data.write(&mut img.dev)?;
                    // double buffering: the written block stays
                    // resident while the next one fills
                    std::mem::swap(&mut self.data, &mut self.side);
                    self.data.set(nt, ns);
                    self.data.data = [0; SECTOR_SIZE];
                    self.slot.size += 1;
                } else {
                    let (t, s) = self.data.link();
                    self.data.reuse_or_map(&mut img.dev, t, s)?;
                }
                self.data.mark_dirty();
            }
            self.data.data[self.chp as usize + 2] = b;
            self.chp += 1;
        }
        Ok(())
    }

    fn header_entry(&mut self, img: &mut DiImage) -> Result<DirEntry, CbmError> {
        let g = img.dev.geometry();
        let (t, s) = (g.dir_track, g.hdr_sector);
        let off = g.hdr_offset;
        img.dir.reuse_or_map(&mut img.dev, t, s)?;
        let mut name = Vec::with_capacity(21);
        name.extend_from_slice(&img.dir.data[off..off + 16]);
        name.extend_from_slice(&img.dir.data[off + 18..off + 23]);
        for b in name.iter_mut() {
            if *b == 0xa0 {
                *b = 0x20;
            }
        }
        Ok(DirEntry {
            name,
            cset: Charset::Petscii,
            size: 0,
            date: [0; 6],
            mode: DirMode::Name,
            ftype: FileType::Del,
            attr: 0,
            recordlen: 0,
        })
    }

    fn free_entry(&mut self, img: &mut DiImage) -> Result<DirEntry, CbmError> {
        let free = img.blocks_free_total()?;
        Ok(DirEntry {
            name: Vec::new(),
            cset: Charset::Petscii,
            size: free as u64 * SECTOR_SIZE as u64,
            date: [0; 6],
            mode: DirMode::Free,
            ftype: FileType::Del,
            attr: wire::ATTR_ESTIMATE,
            recordlen: 0,
        })
    }

    fn close_inner(&mut self) -> CloseStatus {
        if self.closed {
            return CloseStatus::ok();
        }
        self.closed = true;
        let needs_flush = matches!(
            self.access,
            Some(OpenMode::Write)
                | Some(OpenMode::Overwrite)
                | Some(OpenMode::Append)
                | Some(OpenMode::ReadWrite)
        );
        if !needs_flush {
            debug!("closing read-only file, no sync required");
            return CloseStatus::ok();
        }
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();

        let mut status = CloseStatus::ok();
        let res = (|| -> Result<(), CbmError> {
            match self.access {
                Some(OpenMode::Write) | Some(OpenMode::Overwrite) | Some(OpenMode::Append) => {
                    self.data.data[0] = 0;
                    self.data.data[1] = self.chp + 1;
                    self.data.write(&mut img.dev)?;
                    self.side.flush(&mut img.dev)?;
                    self.super_.flush(&mut img.dev)?;

                    if img.bugs.file254
                        && self.chp as u16 + 1 == 255
                        && img.dev.geometry().id != 80
                        && img.dev.geometry().id != 82
                    {
                        // the DOS allocates a bogus block when a file
                        // ends exactly on a sector boundary; it is
                        // never linked and never freed
                        let (t, s) = self.data.ts();
                        if let Ok(bogus) = img.find_free_block_nxtts(t, s) {
                            debug!("bogus end-of-file block at {}/{}", bogus.0, bogus.1);
                        }
                    }

                    img.flush_bam()?;
                    let slot = self.slot.clone();
                    img.write_slot(&slot)?;
                    img.dev.sync()?;

                    if img.blocks_free_total()? == 0 {
                        let (t, s) = self.data.ts();
                        status = CloseStatus {
                            code: CbmError::DiskFull,
                            extra: vec![t, s],
                        };
                    }
                }
                Some(OpenMode::ReadWrite) => {
                    let p = self.chp + 1;
                    let (t, s) = self.data.link();
                    if t == 0 && p > s {
                        // extend the last-byte marker, never shrink a
                        // record area written in the middle
                        self.data.data[1] = p;
                        self.data.mark_dirty();
                    }
                    self.data.flush(&mut img.dev)?;
                    self.side.flush(&mut img.dev)?;
                    self.super_.flush(&mut img.dev)?;
                    img.flush_bam()?;
                    let slot = self.slot.clone();
                    img.write_slot(&slot)?;
                    img.dev.sync()?;
                }
                _ => {}
            }
            Ok(())
        })();

        if let Err(e) = res {
            status = CloseStatus {
                code: e,
                extra: Vec::new(),
            };
        }
        status
    }
}

impl Drop for DiFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_inner();
        }
        self.ep.open_files.set(self.ep.open_files.get() - 1);
    }
}

impl ServerFile for DiFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    fn open(&mut self, pars: &OpenParams, mode: OpenMode) -> Result<CbmError, CbmError> {
        let mut pars = *pars;
        if pars.recordlen == 255 {
            return Err(CbmError::OverflowInRecord);
        }

        if mode == OpenMode::Directory {
            if !self.meta.is_dir {
                return Err(CbmError::FileTypeMismatch);
            }
            self.dir_state = DirState::First;
            self.access = Some(mode);
            return Ok(CbmError::Ok);
        }

        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();

        if mode.writes() && !img.dev.writable() {
            return Err(CbmError::WriteProtect);
        }

        if self.meta.is_dir {
            if mode == OpenMode::Read {
                // reading "$" as a file returns the raw directory
                // chain starting at the header block
                let g = img.dev.geometry();
                self.slot.start_track = g.dir_track;
                self.slot.start_sector = g.hdr_sector;
                self.pos_start(&mut img, true)?;
                self.access = Some(mode);
                return Ok(CbmError::Ok);
            }
            return Err(CbmError::FileTypeMismatch);
        }

        let entry_type = self.slot.file_type();
        if pars.filetype == FileType::Rel || entry_type == FileType::Rel {
            pars.filetype = FileType::Rel;
            if entry_type != FileType::Rel {
                return Err(CbmError::FileTypeMismatch);
            }
            if pars.recordlen == 0 {
                // adopt the on-disk record length
                pars.recordlen = self.slot.recordlen;
            } else if pars.recordlen != self.slot.recordlen {
                return Err(CbmError::RecordNotPresent);
            }
            self.meta.recordlen = pars.recordlen;
            self.maxrecord = self.rel_record_max(&mut img)?;
        } else {
            if mode == OpenMode::ReadWrite {
                warn!("read/write access is only supported for REL files on disk images");
                return Err(CbmError::Fault);
            }
            if pars.filetype != FileType::Unknown && pars.filetype != entry_type {
                return Err(CbmError::FileTypeMismatch);
            }
        }

        match mode {
            OpenMode::Append => self.pos_append(&mut img)?,
            OpenMode::Read | OpenMode::ReadWrite => self.pos_start(&mut img, true)?,
            _ => self.pos_start(&mut img, false)?,
        }
        self.access = Some(mode);

        info!(
            "open {:?} mode {:?} type {:?} reclen {}",
            String::from_utf8_lossy(&convert(&self.meta.name, Charset::Petscii, Charset::Ascii)),
            mode,
            pars.filetype,
            pars.recordlen
        );

        Ok(if pars.filetype == FileType::Rel {
            CbmError::OpenRel
        } else {
            CbmError::Ok
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();

        if self.dir_state != DirState::None {
            drop(img);
            let (entry, eof) = self.read_entry()?;
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

        self.read_seq(&mut img, buf)
    }

    fn write(&mut self, data: &[u8], _eof: bool) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();

        if self.lastpos > 0 {
            // a failed POSITION is satisfied by the next write
            let target = self.lastpos;
            self.expand_rel(&mut img, target)?;
            self.rel_position(&mut img, target - 1)?;
        }

        self.write_seq(&mut img, data)
    }

    fn position(&mut self, record: u16) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();

        if self.meta.recordlen > 0 {
            self.rel_position(&mut img, record as u32)
        } else {
            self.seek_chain(&mut img, record as u64)
        }
    }

    fn close(&mut self) -> CloseStatus {
        self.close_inner()
    }

    fn next_entry(&mut self) -> Result<Option<Box<dyn ServerFile>>, CbmError> {
        if !self.meta.is_dir {
            return Err(CbmError::FileTypeMismatch);
        }
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        loop {
            if self.dir_cursor.eod {
                return Ok(None);
            }
            img.read_slot(&mut self.dir_cursor)?;
            let slot = self.dir_cursor.clone();
            let more = img.next_slot(&mut self.dir_cursor)?;
            if slot.type_byte != 0 {
                let writable = img.dev.writable();
                return Ok(Some(Box::new(DiFile::from_slot(ep.clone(), slot, writable))));
            }
            if !more {
                return Ok(None);
            }
        }
    }

    fn set_pattern(&mut self, pattern: &[u8], cset: Charset) {
        if !pattern.is_empty() {
            self.pattern = convert(pattern, cset, Charset::Petscii);
        }
    }

    fn read_entry(&mut self) -> Result<(Option<DirEntry>, bool), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        match self.dir_state {
            DirState::None => Err(CbmError::FileTypeMismatch),
            DirState::First => {
                self.dir_state = DirState::Entries;
                self.dir_cursor = img.first_slot();
                let header = self.header_entry(&mut img)?;
                Ok((Some(header), false))
            }
            DirState::Entries => {
                while !self.dir_cursor.eod {
                    img.read_slot(&mut self.dir_cursor)?;
                    let slot = self.dir_cursor.clone();
                    let more = img.next_slot(&mut self.dir_cursor)?;
                    if slot.type_byte != 0
                        && match_pattern(
                            &self.pattern,
                            Charset::Petscii,
                            &slot.filename,
                            Charset::Petscii,
                            img.advanced,
                        )
                    {
                        let writable = img.dev.writable();
                        let entry = DiFile::from_slot(ep.clone(), slot, writable);
                        let de = entry.meta.dir_entry();
                        return Ok((Some(de), false));
                    }
                    if !more {
                        break;
                    }
                }
                self.dir_state = DirState::End;
                let free = self.free_entry(&mut img)?;
                Ok((Some(free), true))
            }
            DirState::End => Ok((None, true)),
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
        // CBM drives happily create files with '/' in the name, but
        // the reserved syntax characters are refused
        if name
            .iter()
            .any(|c| matches!(*c, b':' | b'*' | b'?' | b','))
        {
            return Err(CbmError::SyntaxPattern);
        }
        if name.is_empty() || name.len() > 16 {
            return Err(CbmError::SyntaxNameTooLong);
        }

        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        if !img.dev.writable() {
            return Err(CbmError::WriteProtect);
        }

        let ftype = if pars.filetype == FileType::Unknown {
            FileType::Prg
        } else {
            pars.filetype
        };

        let mut slot = Slot::default();
        img.find_free_slot(&mut slot)?;
        slot.filename = name[..name.len().min(16)].to_vec();
        slot.type_byte = TYPE_CLOSED | ftype as u8;
        slot.recordlen = pars.recordlen;

        let writable = img.dev.writable();
        let mut file = DiFile::from_slot(ep.clone(), slot, writable);
        file.meta.ftype = ftype;

        if ftype != FileType::Rel {
            let (t, s) = img.find_free_block_intts()?;
            file.slot.start_track = t;
            file.slot.start_sector = s;
            file.data.set(t, s);
            file.data.data = [0; SECTOR_SIZE];
            file.data.write(&mut img.dev)?;
            file.slot.size = 1;
            let slot = file.slot.clone();
            img.write_slot(&slot)?;
        } else {
            if pars.recordlen == 0 {
                return Err(CbmError::RecordNotPresent);
            }
            file.meta.recordlen = pars.recordlen;
            file.meta.seekable = true;
            // a fresh REL file always contains record 0
            file.expand_rel(&mut img, 1)?;
            let slot = file.slot.clone();
            img.write_slot(&slot)?;
        }
        img.dev.sync()?;

        file.pos_start(&mut img, ftype == FileType::Rel)?;
        file.access = Some(mode);
        file.meta.name = file.slot.filename.clone();
        file.meta.writable = true;

        debug!(
            "created entry {:?} type {:?}",
            String::from_utf8_lossy(&convert(&file.meta.name, Charset::Petscii, Charset::Ascii)),
            ftype
        );

        Ok(Box::new(file))
    }

    fn scratch(&mut self) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        if !img.dev.writable() {
            return Err(CbmError::WriteProtect);
        }
        if self.meta.attr & wire::ATTR_LOCKED != 0 {
            return Err(CbmError::WriteProtect);
        }

        debug!(
            "scratch {:?}",
            String::from_utf8_lossy(&self.slot.filename)
        );

        self.slot.type_byte = 0;
        let slot = self.slot.clone();
        img.write_slot(&slot)?;

        // free the data chain
        let mut b = Block::new();
        let (mut t, mut s) = (self.slot.start_track, self.slot.start_sector);
        while t != 0 {
            img.block_free(t, s)?;
            b.map(&mut img.dev, t, s)?;
            let link = b.link();
            t = link.0;
            s = link.1;
        }

        // free the side-sector structure of a REL file
        let (mut t, mut s) = (self.slot.ss_track, self.slot.ss_sector);
        if t != 0 {
            b.map(&mut img.dev, t, s)?;
            if b.data[rel::SSS_OFFSET_SUPER_254] == 0xfe {
                img.block_free(t, s)?;
                let link = b.link();
                t = link.0;
                s = link.1;
                if t != 0 {
                    b.map(&mut img.dev, t, s)?;
                }
            }
            while t != 0 {
                img.block_free(t, s)?;
                let link = b.link();
                t = link.0;
                s = link.1;
                if t != 0 {
                    b.map(&mut img.dev, t, s)?;
                }
            }
        }

        img.flush_bam()?;
        img.dev.sync()?;
        self.closed = true;
        Ok(())
    }

    fn rename(&mut self, new_name: &[u8], cset: Charset) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        if !img.dev.writable() {
            return Err(CbmError::WriteProtect);
        }

        let name = convert(new_name, cset, Charset::Petscii);
        if name.is_empty() || name.len() > 16 {
            return Err(CbmError::SyntaxNameTooLong);
        }

        // the target name must not exist
        let mut probe = img.first_slot();
        if img.match_slot(&mut probe, &name, FileType::Unknown, false)? {
            return Err(CbmError::FileExists);
        }

        self.slot.filename = name;
        let slot = self.slot.clone();
        img.write_slot(&slot)?;
        self.meta.name = self.slot.filename.clone();
        self.closed = true;
        Ok(())
    }
}

/// A U1/U2 block channel bound to a direct buffer of the endpoint.
pub(crate) struct DiBlockFile {
    ep: Rc<DiEndpoint>,
    idx: usize,
    meta: FileMeta,
    write_mode: bool,
    closed: bool,
}

impl DiBlockFile {
    fn new(ep: Rc<DiEndpoint>, idx: usize, write_mode: bool) -> DiBlockFile {
        DiFile::register(&ep);
        DiBlockFile {
            ep,
            idx,
            meta: FileMeta {
                name: b"#".to_vec(),
                cset: Charset::Petscii,
                ftype: FileType::Usr,
                attr: 0,
                size: SECTOR_SIZE as u64,
                date: [0; 6],
                recordlen: 0,
                writable: write_mode,
                seekable: false,
                is_dir: false,
            },
            write_mode,
            closed: false,
        }
    }

    fn write_back(&mut self) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        let idx = self.idx;
        if let Some((t, s)) = img.direct[idx].u2.take() {
            let DiImage { dev, direct, .. } = &mut *img;
            direct[idx].buf.set(t, s);
            direct[idx].buf.write(dev)?;
            dev.sync()?;
            debug!("U2 buffer written back to ({},{})", t, s);
        }
        Ok(())
    }
}

impl Drop for DiBlockFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
        self.ep.open_files.set(self.ep.open_files.get() - 1);
    }
}

impl ServerFile for DiBlockFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    fn open(&mut self, _pars: &OpenParams, _mode: OpenMode) -> Result<CbmError, CbmError> {
        Ok(CbmError::Ok)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        let d = &mut img.direct[self.idx];
        let avail = (SECTOR_SIZE as u16 - d.bp) as usize;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&d.buf.data[d.bp as usize..d.bp as usize + n]);
        d.bp += n as u16;
        Ok((n, d.bp as usize >= SECTOR_SIZE))
    }

    fn write(&mut self, data: &[u8], eof: bool) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        {
            let mut img = ep.inner.borrow_mut();
            let d = &mut img.direct[self.idx];
            let avail = (SECTOR_SIZE as u16 - d.bp) as usize;
            let n = data.len().min(avail);
            d.buf.data[d.bp as usize..d.bp as usize + n].copy_from_slice(&data[..n]);
            d.bp += n as u16;
        }
        if eof && self.write_mode {
            self.write_back()?;
        }
        Ok(())
    }

    fn position(&mut self, record: u16) -> Result<(), CbmError> {
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        img.direct[self.idx].bp = (record & 0xff).min(SECTOR_SIZE as u16 - 1);
        Ok(())
    }

    fn close(&mut self) -> CloseStatus {
        if self.closed {
            return CloseStatus::ok();
        }
        self.closed = true;
        let res = if self.write_mode {
            self.write_back()
        } else {
            Ok(())
        };
        let ep = self.ep.clone();
        let mut img = ep.inner.borrow_mut();
        img.direct[self.idx].chan = None;
        match res {
            Ok(()) => CloseStatus::ok(),
            Err(e) => CloseStatus {
                code: e,
                extra: Vec::new(),
            },
        }
    }

    fn scratch(&mut self) -> Result<(), CbmError> {
        Err(CbmError::Fault)
    }
}

/// The disk-image provider: mounts image files as endpoints and keeps
/// a registry so two access paths to the same image share one
/// endpoint.
pub struct DiProvider {
    endpoints: RefCell<Vec<Weak<DiEndpoint>>>,
}

impl DiProvider {
    /// An empty provider.
    pub fn new() -> DiProvider {
        DiProvider {
            endpoints: RefCell::new(Vec::new()),
        }
    }

    fn mount(&self, path: &Path, cfg: &Config) -> Result<Rc<DiEndpoint>, CbmError> {
        let canon = path
            .canonicalize()
            .map_err(|e| cbm_error_from_io(&e))?;

        let mut reg = self.endpoints.borrow_mut();
        reg.retain(|w| w.strong_count() > 0);
        for weak in reg.iter() {
            if let Some(ep) = weak.upgrade() {
                if ep.path == canon {
                    debug!("reusing image endpoint for {}", canon.display());
                    return Ok(ep);
                }
            }
        }

        let dev = ImageDev::open(&canon)?;
        let ep = DiEndpoint::new(dev, canon, cfg);
        reg.push(Rc::downgrade(&ep));
        Ok(ep)
    }
}

impl Default for DiProvider {
    fn default() -> Self {
        DiProvider::new()
    }
}

/// image file extensions this provider mounts
const IMAGE_EXTENSIONS: [&str; 5] = ["d64", "d71", "d80", "d81", "d82"];

impl Provider for DiProvider {
    fn name(&self) -> &'static str {
        "di"
    }

    fn charset(&self) -> Charset {
        Charset::Petscii
    }

    fn endpoint(&self, path: &str, cfg: &Config) -> Result<EndpointRef, CbmError> {
        let ep = self.mount(Path::new(path), cfg)?;
        Ok(ep)
    }

    fn wrap_endpoint(
        &self,
        file: &dyn ServerFile,
        cfg: &Config,
    ) -> Result<Option<EndpointRef>, CbmError> {
        let path = match file.os_path() {
            Some(p) => p,
            None => return Ok(None),
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext {
            Some(e) if IMAGE_EXTENSIONS.contains(&e.as_str()) => {}
            _ => return Ok(None),
        }
        match self.mount(&path, cfg) {
            Ok(ep) => {
                if ep.is_assigned.get() == 0 {
                    ep.is_temporary.set(true);
                }
                Ok(Some(ep))
            }
            // a file of the wrong length is not an image after all
            Err(CbmError::FileTypeMismatch) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
