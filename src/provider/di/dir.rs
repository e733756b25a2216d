//! Directory slot handling.
//!
//! The directory is a linked chain of sectors starting at the
//! geometry's directory track/sector, each holding eight 32-byte
//! slots.  A [`Slot`] is the in-memory image of one entry together
//! with a cursor (track, sector, index) so it can be written back to
//! the place it came from.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::debug;
use nom::{
    bytes::complete::take,
    number::complete::{le_u16, le_u8},
    IResult,
};

use crate::error::CbmError;
use crate::wildcard::match_pattern;
use crate::charset::Charset;
use crate::wire::FileType;

use super::geometry::{SLOTS_PER_SECTOR, SLOT_SIZE};
use super::DiImage;

/// Slot type bit: the file was closed properly.
pub const TYPE_CLOSED: u8 = 0x80;
/// Slot type bit: the file is locked.
pub const TYPE_LOCKED: u8 = 0x40;
/// Mask of the file type bits in the slot type byte.
pub const TYPE_MASK: u8 = 0x07;

/// A directory slot with its cursor position.
#[derive(Clone, Debug, Default)]
pub struct Slot {
    /// slot index within the directory sector (0..7)
    pub in_sector: u8,
    /// track of the directory sector holding the slot
    pub dir_track: u8,
    /// sector of the directory sector holding the slot
    pub dir_sector: u8,
    /// the cursor ran off the end of the directory chain
    pub eod: bool,
    /// file size in 254-byte blocks
    pub size: u16,
    /// file name, PETSCII, $A0 padding stripped
    pub filename: Vec<u8>,
    /// raw type byte (closed/locked bits plus type)
    pub type_byte: u8,
    /// first data block
    pub start_track: u8,
    /// first data block
    pub start_sector: u8,
    /// first side sector (REL)
    pub ss_track: u8,
    /// first side sector (REL)
    pub ss_sector: u8,
    /// REL record length
    pub recordlen: u8,
}

impl Slot {
    /// The CBM file type stored in the slot.
    pub fn file_type(&self) -> FileType {
        FileType::from(self.type_byte & TYPE_MASK)
    }
}

/// Fields of the on-disk slot image, in disk order.
struct SlotImage<'a> {
    type_byte: u8,
    start_track: u8,
    start_sector: u8,
    name: &'a [u8],
    ss_track: u8,
    ss_sector: u8,
    recordlen: u8,
    size: u16,
}

/// Parse the 30 payload bytes of a directory slot (offsets 2..31 of
/// the 32-byte entry).
fn slot_image_parser(i: &[u8]) -> IResult<&[u8], SlotImage<'_>> {
    let (i, type_byte) = le_u8(i)?;
    let (i, start_track) = le_u8(i)?;
    let (i, start_sector) = le_u8(i)?;
    let (i, name) = take(16usize)(i)?;
    let (i, ss_track) = le_u8(i)?;
    let (i, ss_sector) = le_u8(i)?;
    let (i, recordlen) = le_u8(i)?;
    let (i, _unused) = take(6usize)(i)?;
    let (i, size) = le_u16(i)?;

    Ok((
        i,
        SlotImage {
            type_byte,
            start_track,
            start_sector,
            name,
            ss_track,
            ss_sector,
            recordlen,
            size,
        },
    ))
}

impl DiImage {
    /// Position a slot cursor on the first directory slot.
    pub(crate) fn first_slot(&self) -> Slot {
        let g = self.dev.geometry();
        Slot {
            in_sector: 0,
            dir_track: g.dir_track,
            dir_sector: g.dir_sector,
            eod: false,
            ..Slot::default()
        }
    }

    /// Advance the cursor to the next slot, following the directory
    /// chain across sectors.  Returns false at the end of the
    /// directory.
    pub(crate) fn next_slot(&mut self, slot: &mut Slot) -> Result<bool, CbmError> {
        slot.in_sector += 1;
        if slot.in_sector >= SLOTS_PER_SECTOR {
            slot.in_sector = 0;
            let (dt, ds) = (slot.dir_track, slot.dir_sector);
            let dir = &mut self.dir;
            dir.reuse_or_map(&mut self.dev, dt, ds)?;
            let (t, s) = dir.link();
            debug!("next dir sector ({},{})", t, s);
            if t == 0 {
                slot.eod = true;
                return Ok(false);
            }
            slot.dir_track = t;
            slot.dir_sector = s;
        }
        Ok(true)
    }

    /// Read the slot under the cursor from the directory buffer.
    pub(crate) fn read_slot(&mut self, slot: &mut Slot) -> Result<(), CbmError> {
        let (dt, ds) = (slot.dir_track, slot.dir_sector);
        self.dir.reuse_or_map(&mut self.dev, dt, ds)?;
        let off = slot.in_sector as usize * SLOT_SIZE + 2;
        let image = &self.dir.data[off..off + SLOT_SIZE - 2];
        let (_, parsed) = slot_image_parser(image).map_err(|_| CbmError::Fault)?;

        slot.type_byte = parsed.type_byte;
        slot.start_track = parsed.start_track;
        slot.start_sector = parsed.start_sector;
        slot.ss_track = parsed.ss_track;
        slot.ss_sector = parsed.ss_sector;
        slot.recordlen = parsed.recordlen;
        slot.size = parsed.size;
        slot.filename = parsed
            .name
            .iter()
            .take_while(|c| **c != 0xa0)
            .copied()
            .collect();
        Ok(())
    }

    /// Write the slot image under the cursor, name $A0-padded.
    pub(crate) fn write_slot(&mut self, slot: &Slot) -> Result<(), CbmError> {
        let (dt, ds) = (slot.dir_track, slot.dir_sector);
        self.dir.reuse_or_map(&mut self.dev, dt, ds)?;
        let off = slot.in_sector as usize * SLOT_SIZE;
        let p = &mut self.dir.data[off..off + SLOT_SIZE];

        debug!(
            "write_slot {} in ({},{})",
            slot.in_sector, slot.dir_track, slot.dir_sector
        );

        for b in p[2..].iter_mut() {
            *b = 0;
        }
        p[2] = slot.type_byte;
        p[3] = slot.start_track;
        p[4] = slot.start_sector;
        for (i, b) in p[5..21].iter_mut().enumerate() {
            *b = slot.filename.get(i).copied().unwrap_or(0xa0);
        }
        p[21] = slot.ss_track;
        p[22] = slot.ss_sector;
        p[23] = slot.recordlen;
        p[30] = (slot.size & 0xff) as u8;
        p[31] = (slot.size >> 8) as u8;

        self.dir.write(&mut self.dev)
    }

    /// Iterate slots from the cursor until one matches the pattern
    /// (and the type, unless Unknown).  Returns true with the cursor
    /// on the match.
    pub(crate) fn match_slot(
        &mut self,
        slot: &mut Slot,
        pattern: &[u8],
        ftype: FileType,
        advanced: bool,
    ) -> Result<bool, CbmError> {
        loop {
            self.read_slot(slot)?;
            if slot.type_byte != 0
                && (ftype == FileType::Unknown || slot.file_type() == ftype)
                && match_pattern(
                    pattern,
                    Charset::Petscii,
                    &slot.filename,
                    Charset::Petscii,
                    advanced,
                )
            {
                return Ok(true);
            }
            if !self.next_slot(slot)? {
                return Ok(false);
            }
        }
    }

    /// Link a fresh directory sector into the chain and point the
    /// cursor at its first slot.
    fn allocate_new_dir_block(&mut self, slot: &mut Slot) -> Result<(), CbmError> {
        let (t, s) = self.find_free_block_nxtts(slot.dir_track, slot.dir_sector)?;

        let (dt, ds) = (slot.dir_track, slot.dir_sector);
        self.dir.reuse_or_map(&mut self.dev, dt, ds)?;
        self.dir.data[0] = t;
        self.dir.data[1] = s;
        self.dir.write(&mut self.dev)?;

        self.dir.set(t, s);
        self.dir.data = [0; super::geometry::SECTOR_SIZE];
        self.dir.data[1] = 255;
        self.dir.write(&mut self.dev)?;

        slot.dir_track = t;
        slot.dir_sector = s;
        slot.in_sector = 0;
        slot.eod = false;

        debug!("allocate_new_dir_block ({},{})", t, s);
        Ok(())
    }

    /// Find a free slot, extending the directory by one sector when
    /// the chain is exhausted.
    pub(crate) fn find_free_slot(&mut self, slot: &mut Slot) -> Result<(), CbmError> {
        *slot = self.first_slot();
        loop {
            self.read_slot(slot)?;
            if slot.type_byte == 0 {
                return Ok(());
            }
            if !self.next_slot(slot)? {
                return self.allocate_new_dir_block(slot);
            }
        }
    }
}
