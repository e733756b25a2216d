//! Formatting a mounted image (the `N:name,id` command).
//!
//! A format with an ID wipes every sector first; without one only the
//! header, BAM and first directory sector are rebuilt and the old ID
//! is preserved.  The BAM is written the way the respective drive
//! firmware lays it out, including the split second-side layout of
//! the 1571 and the ID/autoboot bytes of the 1581.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::debug;

use crate::error::CbmError;

use super::buffer::Block;
use super::geometry::SECTOR_SIZE;
use super::DiImage;

impl DiImage {
    /// Format the image.  `raw` is the host-supplied `name[,id]`
    /// string in PETSCII.
    pub(crate) fn format(&mut self, raw: &[u8]) -> Result<(), CbmError> {
        let g = self.dev.geometry();
        let (name, id) = match raw.iter().position(|c| *c == b',') {
            Some(p) => (&raw[..p], Some(&raw[p + 1..])),
            None => (raw, None),
        };
        let id = id.filter(|i| !i.is_empty());

        debug!("format: name={:?} id={:?}", name, id);

        // keep the original ID bytes before anything is overwritten
        let mut bp = Block::new();
        bp.map(&mut self.dev, g.dir_track, g.hdr_sector)?;
        let mut idbuffer = [0u8; 5];
        idbuffer.copy_from_slice(&bp.data[g.hdr_offset + 18..g.hdr_offset + 23]);

        // a format with an ID clears the whole medium
        if id.is_some() {
            bp.data = [0; SECTOR_SIZE];
            for track in 1..=g.last_track() {
                let sectors = g
                    .sectors_in_track(track)
                    .ok_or(CbmError::IllegalTrackOrSector)?;
                for sector in 0..sectors {
                    bp.set(track, sector);
                    bp.write(&mut self.dev)?;
                }
            }
        }

        // the disk-name block
        bp.set(g.dir_track, g.hdr_sector);
        bp.data = [0; SECTOR_SIZE];
        let buf = &mut bp.data;
        if g.id == 81 {
            buf[0] = g.dir_track;
            buf[1] = g.dir_sector;
        } else {
            buf[0] = g.bam_ts[0].0;
            buf[1] = g.bam_ts[0].1;
        }
        let pad = if g.id == 81 { 25 } else { 27 };
        for b in buf[g.hdr_offset..g.hdr_offset + pad].iter_mut() {
            *b = 0xa0;
        }
        let namelen = name.len().min(16);
        if namelen == 0 {
            buf[g.hdr_offset] = if id.is_some() { b',' } else { 0x0d };
        } else {
            buf[g.hdr_offset..g.hdr_offset + namelen].copy_from_slice(&name[..namelen]);
        }
        // the ID: keep the old one unless a new one was supplied
        buf[g.hdr_offset + 18] = idbuffer[0];
        buf[g.hdr_offset + 19] = idbuffer[1];
        if let Some(id) = id {
            let idlen = id.len().min(2);
            buf[g.hdr_offset + 18..g.hdr_offset + 18 + idlen].copy_from_slice(&id[..idlen]);
            if idlen == 1 {
                buf[g.hdr_offset + 19] = 0x0d;
            }
        }
        let new_id = [buf[g.hdr_offset + 18], buf[g.hdr_offset + 19]];
        buf[2] = g.dos_version[1];
        buf[g.hdr_offset + 21] = g.dos_version[0];
        buf[g.hdr_offset + 22] = g.dos_version[1];

        if g.dir_track != g.bam_ts[0].0 || g.hdr_sector != g.bam_ts[0].1 {
            // the header has its own block, save it; on the D64 family
            // it shares the first BAM block and is written below
            bp.write(&mut self.dev)?;
            bp.data = [0; SECTOR_SIZE];
        }

        // the BAM chain
        let stride = g.bam_stride();
        let mut bam_offset = g.bam_offset;
        let mut bam_increment = stride;
        let mut track: u8 = 1;

        for (bam_number, &(bt, bs)) in g.bam_ts.iter().enumerate() {
            let first_track = track;
            let buf = &mut bp.data;

            // chain link of the BAM block
            if bam_number == g.bam_ts.len() - 1 || g.id == 71 {
                if g.id == 81 {
                    buf[0] = 0;
                    buf[1] = 0xff;
                } else {
                    buf[0] = g.dir_track;
                    buf[1] = g.dir_sector;
                }
            } else {
                buf[0] = g.bam_ts[bam_number + 1].0;
                buf[1] = g.bam_ts[bam_number + 1].1;
            }
            buf[2] = g.dos_version[1];

            if g.id == 71 && bam_number == 1 {
                // second-side bitmaps use a packed 3-byte stride
                bam_increment = 3;
                bam_offset = 0;
            }

            // free count and bitmap per track
            let mut cnt = 0u8;
            while cnt < g.tracks_per_bam && track <= g.last_track() {
                let mut idx = cnt as usize * bam_increment + bam_offset;
                let mut maxsec = g
                    .sectors_in_track(track)
                    .ok_or(CbmError::IllegalTrackOrSector)?;
                if !(g.id == 71 && bam_number == 1) {
                    buf[idx] = maxsec;
                    idx += 1;
                }
                if g.id == 71 && bam_number == 1 && track == 53 {
                    // the directory's second-side twin stays allocated
                } else {
                    while maxsec > 7 {
                        buf[idx] = 0xff;
                        idx += 1;
                        maxsec -= 8;
                    }
                    if maxsec > 0 {
                        buf[idx] = 0;
                        while maxsec > 0 {
                            buf[idx] = 1 + (buf[idx] << 1);
                            maxsec -= 1;
                        }
                    }
                }
                cnt += 1;
                track += 1;
            }

            if g.id == 71 && bam_number == 0 {
                // second-side free counts live at 221.. of the first block
                let mut cnt = 0usize;
                while track <= g.last_track() {
                    buf[221 + cnt] = if track == 53 {
                        0
                    } else {
                        g.sectors_in_track(track)
                            .ok_or(CbmError::IllegalTrackOrSector)?
                    };
                    cnt += 1;
                    track += 1;
                }
                // the second BAM block restarts at the second side
                track = g.tracks + 1;
            }

            // mask out the directory, header and BAM blocks themselves
            let mask =
                |buf: &mut [u8; SECTOR_SIZE], t: u8, s: u8| {
                    let idx = (t - 1) as usize * bam_increment + g.bam_offset;
                    buf[idx] -= 1;
                    buf[idx + 1 + (s >> 3) as usize] &= !(1 << (s & 7));
                };
            if g.dir_track >= first_track && g.dir_track < track {
                mask(buf, g.dir_track, g.dir_sector);
                if g.dir_track != g.bam_ts[0].0 || g.hdr_sector != g.bam_ts[0].1 {
                    mask(buf, g.dir_track, g.hdr_sector);
                }
            }
            if !(g.id == 71 && bam_number == 1) {
                for &(t, s) in g.bam_ts {
                    if t >= first_track && t < track {
                        mask(buf, t, s);
                    }
                }
            }

            if g.bam_offset >= 6 {
                if g.id == 81 {
                    buf[3] = !buf[2];
                    buf[4] = new_id[0];
                    buf[5] = new_id[1];
                    // I/O byte: verify on, header CRC check on
                    buf[6] = 0xc0;
                    buf[7] = 0x00;
                } else {
                    buf[4] = first_track;
                    buf[5] = track;
                }
            }

            bp.set(bt, bs);
            bp.write(&mut self.dev)?;
            bp.data = [0; SECTOR_SIZE];
        }

        // an empty first directory block
        bp.set(g.dir_track, g.dir_sector);
        bp.data = [0; SECTOR_SIZE];
        bp.data[1] = 0xff;
        bp.write(&mut self.dev)?;

        self.dev.sync()?;

        // resident buffers may hold pre-format contents
        self.bam1 = Block::new();
        self.bam2 = Block::new();
        self.dir = Block::new();

        Ok(())
    }
}
