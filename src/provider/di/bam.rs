//! Block Availability Map handling.
//!
//! The allocator reproduces the CBM DOS algorithms: GETSEC scans a
//! track bitmap upward only, INTTS picks the first track of a new
//! file alternating outward from the directory track, NXTTS advances
//! along a file chain by the interleave.  Every successful allocation
//! clears the sector's bit and decrements the track's free count in
//! the same step, keeping the two coherent.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::debug;

use crate::error::CbmError;

use super::DiImage;

/// Which resident BAM buffer a byte lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BamBuf {
    /// the primary BAM buffer
    One,
    /// the second BAM buffer (D71 second side bitmaps)
    Two,
}

/// Location of a track's BAM entry: free-count byte and bitmap bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BamLoc {
    free: (BamBuf, usize),
    bits: (BamBuf, usize),
    /// number of bitmap bytes
    bits_len: usize,
}

impl DiImage {
    fn bam_buf(&self, which: BamBuf) -> &[u8] {
        match which {
            BamBuf::One => &self.bam1.data,
            BamBuf::Two => &self.bam2.data,
        }
    }

    fn bam_buf_mut(&mut self, which: BamBuf) -> &mut [u8] {
        match which {
            BamBuf::One => &mut self.bam1.data,
            BamBuf::Two => &mut self.bam2.data,
        }
    }

    /// Load the BAM sector(s) covering the given track and return the
    /// position of its entry.
    ///
    /// On the D71 the second side splits the entry: the free count
    /// stays in the first BAM sector at offset 221 while the bitmap
    /// lives in the second BAM sector with a stride of 3.
    pub(crate) fn bam_entry(&mut self, track: u8) -> Result<BamLoc, CbmError> {
        let g = self.dev.geometry();
        if track == 0 || track > g.last_track() {
            return Err(CbmError::IllegalTrackOrSector);
        }
        if g.id == 71 && track > g.tracks {
            let (t1, s1) = g.bam_ts[0];
            let (t2, s2) = g.bam_ts[1];
            self.bam1.reuse_or_map(&mut self.dev, t1, s1)?;
            self.bam2.reuse_or_map(&mut self.dev, t2, s2)?;
            let idx = (track - g.tracks - 1) as usize;
            Ok(BamLoc {
                free: (BamBuf::One, 221 + idx),
                bits: (BamBuf::Two, 3 * idx),
                bits_len: 3,
            })
        } else {
            let number = ((track - 1) / g.tracks_per_bam) as usize;
            let (t, s) = g.bam_ts[number];
            self.bam1.reuse_or_map(&mut self.dev, t, s)?;
            let stride = g.bam_stride();
            let off = g.bam_offset + ((track - 1) % g.tracks_per_bam) as usize * stride;
            Ok(BamLoc {
                free: (BamBuf::One, off),
                bits: (BamBuf::One, off + 1),
                bits_len: stride - 1,
            })
        }
    }

    /// The free-block count of a track.
    pub(crate) fn free_count(&mut self, track: u8) -> Result<u8, CbmError> {
        let loc = self.bam_entry(track)?;
        Ok(self.bam_buf(loc.free.0)[loc.free.1])
    }

    /// Whether a sector's BAM bit marks it free.
    pub(crate) fn is_free(&mut self, track: u8, sector: u8) -> Result<bool, CbmError> {
        let loc = self.bam_entry(track)?;
        let bits = &self.bam_buf(loc.bits.0)[loc.bits.1..loc.bits.1 + loc.bits_len];
        let byte = (sector >> 3) as usize;
        Ok(byte < bits.len() && bits[byte] & (1 << (sector & 7)) != 0)
    }

    /// GETSEC: scan the track bitmap upward from `from`, returning the
    /// first free sector.  Never looks below `from`; the caller
    /// retries from 0 where the DOS does.
    fn scan_getsec(&mut self, track: u8, from: u8) -> Result<Option<u8>, CbmError> {
        let g = self.dev.geometry();
        let last = g.sectors_in_track(track).ok_or(CbmError::IllegalTrackOrSector)?;
        let loc = self.bam_entry(track)?;
        if self.bam_buf(loc.free.0)[loc.free.1] == 0 {
            return Ok(None);
        }
        let bits = &self.bam_buf(loc.bits.0)[loc.bits.1..loc.bits.1 + loc.bits_len];
        let mut s = from;
        // the DOS scans one bit past the track end; bits outside the
        // bitmap bytes count as allocated
        while s <= last {
            let byte = (s >> 3) as usize;
            if byte < bits.len() && bits[byte] & (1 << (s & 7)) != 0 {
                return Ok(Some(s));
            }
            s += 1;
        }
        Ok(None)
    }

    /// Allocate a specific sector: clear its bit, decrement the free
    /// count, mark both BAM buffers dirty.
    pub(crate) fn allocate_sector(&mut self, track: u8, sector: u8) -> Result<(), CbmError> {
        let loc = self.bam_entry(track)?;
        self.bam_buf_mut(loc.free.0)[loc.free.1] -= 1;
        let bits = self.bam_buf_mut(loc.bits.0);
        bits[loc.bits.1 + (sector >> 3) as usize] &= !(1 << (sector & 7));
        self.dirty_bam();
        Ok(())
    }

    /// Free a sector: set its bit and increment the free count.  A
    /// sector that is already free is left untouched.
    pub(crate) fn block_free(&mut self, track: u8, sector: u8) -> Result<(), CbmError> {
        debug!("block_free({},{})", track, sector);
        if self.is_free(track, sector)? {
            return Ok(());
        }
        let loc = self.bam_entry(track)?;
        self.bam_buf_mut(loc.free.0)[loc.free.1] += 1;
        let bits = self.bam_buf_mut(loc.bits.0);
        bits[loc.bits.1 + (sector >> 3) as usize] |= 1 << (sector & 7);
        self.dirty_bam();
        Ok(())
    }

    /// INTTS: find and allocate the first data sector of a new file,
    /// alternating outward from the directory track.
    pub(crate) fn find_free_block_intts(&mut self) -> Result<(u8, u8), CbmError> {
        let g = self.dev.geometry();
        let dir_track = g.dir_track;
        let last_track = g.last_track();

        let mut counter = 1u8;
        loop {
            let below = dir_track.checked_sub(counter).filter(|t| *t > 0);
            let above = dir_track.checked_add(counter).filter(|t| *t <= last_track);
            if below.is_none() && above.is_none() {
                return Err(CbmError::DiskFull);
            }
            for track in [below, above].into_iter().flatten() {
                if self.free_count(track)? > 0 {
                    let sector = self
                        .scan_getsec(track, 0)?
                        .ok_or(CbmError::DiskFull)?;
                    self.allocate_sector(track, sector)?;
                    self.current_track = track;
                    debug!("find_free_block_intts -> ({},{})", track, sector);
                    return Ok((track, sector));
                }
            }
            counter += 1;
        }
    }

    /// NXTTS: find and allocate the next data sector of a file,
    /// advancing by the interleave from the previous block.
    pub(crate) fn find_free_block_nxtts(
        &mut self,
        prev_track: u8,
        prev_sector: u8,
    ) -> Result<(u8, u8), CbmError> {
        let g = self.dev.geometry();
        let dir_track = g.dir_track;
        let last_track = g.last_track();
        let (interleave, mut counter) = if prev_track == dir_track {
            (g.dir_interleave, 1i8)
        } else {
            (g.dat_interleave, 3i8)
        };

        let mut track = prev_track;
        let mut sector = prev_sector;

        // search from the current position out, then from the
        // directory track into the other direction, then back
        loop {
            if self.free_count(track)? > 0 {
                break;
            }
            if track == dir_track {
                // the directory never leaves its track
                counter = 0;
                break;
            }
            if track < dir_track {
                track -= 1;
                if track == 0 {
                    sector = 0;
                    track = dir_track + 1;
                    counter -= 1;
                }
            } else {
                track += 1;
                if track > last_track {
                    sector = 0;
                    track = dir_track - 1;
                    counter -= 1;
                }
            }
            if counter <= 0 {
                break;
            }
        }
        if counter <= 0 {
            return Err(CbmError::DiskFull);
        }

        let last = g
            .sectors_in_track(track)
            .ok_or(CbmError::IllegalTrackOrSector)?;
        let mut s = sector as u16 + interleave as u16;
        if s > last as u16 {
            s -= last as u16;
            if s > 0 {
                s -= 1;
            }
        }
        let found = match self.scan_getsec(track, s as u8)? {
            Some(f) => f,
            None => self.scan_getsec(track, 0)?.ok_or(CbmError::DiskFull)?,
        };
        self.allocate_sector(track, found)?;
        self.current_track = track;

        debug!(
            "find_free_block_nxtts ({},{}) intrlv={} -> ({},{})",
            prev_track, prev_sector, interleave, track, found
        );

        Ok((track, found))
    }

    /// B-A: allocate the requested block if it is free.  Otherwise
    /// scan linearly forward and report the next free block with
    /// NO_BLOCK, or (0,0) when the rest of the disk is full.
    pub(crate) fn block_alloc(
        &mut self,
        req_track: u8,
        req_sector: u8,
    ) -> Result<(CbmError, (u8, u8)), CbmError> {
        let g = self.dev.geometry();
        let last_track = g.last_track();
        if req_track == 0 || req_track > last_track {
            return Err(CbmError::IllegalTrackOrSector);
        }

        let mut sector = req_sector;
        for track in req_track..=last_track {
            if let Some(found) = self.scan_getsec(track, sector)? {
                if track == req_track && found == req_sector {
                    self.allocate_sector(track, found)?;
                    return Ok((CbmError::Ok, (track, found)));
                }
                return Ok((CbmError::NoBlock, (track, found)));
            }
            sector = 0;
        }
        Ok((CbmError::NoBlock, (0, 0)))
    }

    /// Total free blocks of the medium, excluding the directory track.
    pub(crate) fn blocks_free_total(&mut self) -> Result<u32, CbmError> {
        let g = self.dev.geometry();
        let dir_track = g.dir_track;
        let mut free = 0u32;
        for track in 1..=g.last_track() {
            if track == dir_track {
                continue;
            }
            free += self.free_count(track)? as u32;
        }
        debug!("blocks_free_total: {}", free);
        Ok(free)
    }

    /// Mark the resident BAM buffers dirty.
    pub(crate) fn dirty_bam(&mut self) {
        if self.bam1.ts().0 != 0 {
            self.bam1.mark_dirty();
        }
        if self.bam2.ts().0 != 0 {
            self.bam2.mark_dirty();
        }
    }

    /// Write back dirty BAM buffers.
    pub(crate) fn flush_bam(&mut self) -> Result<(), CbmError> {
        self.bam1.flush(&mut self.dev)?;
        if self.bam2.ts().0 != 0 {
            self.bam2.flush(&mut self.dev)?;
        }
        Ok(())
    }
}
