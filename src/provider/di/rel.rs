//! REL file machinery: side sectors, super side sector, record
//! expansion and positioning.
//!
//! A REL file is a chain of data blocks indexed by up to six side
//! sectors per group, each holding 120 data-block pointers; on
//! formats with a super side sector (1581, 8250) up to 126 groups are
//! reachable.  Records are fixed length, created by expansion: a new
//! record begins with a 0xFF marker byte followed by zeros.
//!
//! Expansion keeps every structure coherent in one pass: data chain,
//! side-sector group table (replicated into every member of the
//! group), super side sector and BAM.  The documented DOS leaks are
//! reproduced behind the endpoint's bug switches.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::{debug, warn};

use crate::error::CbmError;

use super::geometry::{SECTOR_DATA, SECTOR_SIZE};
use super::{DiFile, DiImage};

/// next-pointer track offset in any chained block
pub const BLK_NEXT_TRACK: usize = 0;
/// next-pointer sector offset; doubles as the high-water byte in a
/// side sector
pub const BLK_NEXT_SECTOR: usize = 1;
/// side sector: index of this sector within its group
pub const SSB_OFFSET_SECTOR_NUM: usize = 2;
/// side sector: REL record length
pub const SSB_OFFSET_RECORD_LEN: usize = 3;
/// side sector: table of the group's side sector addresses
pub const SSB_OFFSET_SSG: usize = 4;
/// side sector: first data-block pointer
pub const SSB_OFFSET_SECTOR: usize = 16;
/// super side sector: 0xFE marker offset
pub const SSS_OFFSET_SUPER_254: usize = 2;
/// super side sector: first group pointer
pub const SSS_OFFSET_SSB_POINTER: usize = 4;
/// side sectors per group
pub const SSG_SIDE_SECTORS_MAX: usize = 6;
/// data-block pointers per side sector
pub const SSB_INDEX_SECTOR_MAX: usize = 120;
/// group pointers in a super side sector
pub const SSS_INDEX_SSB_MAX: usize = 126;

/// What a navigation/expansion pass found or built.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Nav {
    /// head of the side-sector structure: the super side sector where
    /// the format has one, the first side sector of the group
    /// otherwise
    pub ss: (u8, u8),
    /// first data block, for freshly created files
    pub first_data: Option<(u8, u8)>,
    /// number of complete records present
    pub numrecords: u32,
    /// total allocated blocks (data + side + super)
    pub blocks: u32,
}

/// Fill `len` bytes of record pattern (0xFF at each record start,
/// zeros inside) starting at the given payload offset.
fn fill_records(
    block: &mut super::buffer::Block,
    payload_off: usize,
    len: usize,
    rec_pos: &mut u32,
    reclen: u32,
    numrecords: &mut u32,
) {
    for i in 0..len {
        block.data[2 + payload_off + i] = if *rec_pos == 0 { 0xff } else { 0x00 };
        *rec_pos += 1;
        if *rec_pos == reclen {
            *rec_pos = 0;
            *numrecords += 1;
        }
    }
    block.mark_dirty();
}

fn pair(buf: &[u8], off: usize) -> (u8, u8) {
    (buf[off], buf[off + 1])
}

fn put_pair(buf: &mut [u8], off: usize, ts: (u8, u8)) {
    buf[off] = ts.0;
    buf[off + 1] = ts.1;
}

impl DiFile {
    /// Navigate the super/side sector structures, count the records
    /// present, and expand the file until `targetrec` records exist.
    ///
    /// With `targetrec` 0 this is a pure record count.  The caller is
    /// responsible for writing the directory slot afterwards.
    pub(crate) fn rel_navigate(
        &mut self,
        img: &mut DiImage,
        targetrec: u32,
    ) -> Result<Nav, CbmError> {
        let reclen = self.meta.recordlen as u32;
        if reclen == 0 {
            return Err(CbmError::FileTypeMismatch);
        }
        let has_ssb = img.dev.geometry().has_ssb;

        debug!(
            "rel_navigate ss {}/{}, reclen={}, target={}",
            self.slot.ss_track, self.slot.ss_sector, reclen, targetrec
        );

        // flush everything so plain maps are safe below
        self.data.flush(&mut img.dev)?;
        self.side.flush(&mut img.dev)?;
        self.super_.flush(&mut img.dev)?;

        let mut super_ts: (u8, u8) = (0, 0);
        let mut super_pos: usize = 0; // used group pointers
        let mut side: usize = 0; // side sectors in the current group
        let mut side_pos: usize = 0; // data pointers in the current side sector
        let mut data_ts: (u8, u8) = (0, 0);
        let mut data_pos: u32 = 0; // payload bytes in the last block
        let mut first_data: Option<(u8, u8)> = None;

        let ss = (self.slot.ss_track, self.slot.ss_sector);
        if ss.0 != 0 {
            let side_head = if has_ssb {
                super_ts = ss;
                self.super_.map(&mut img.dev, ss.0, ss.1)?;
                while super_pos < SSS_INDEX_SSB_MAX
                    && self.super_.data[SSS_OFFSET_SSB_POINTER + 2 * super_pos] != 0
                {
                    super_pos += 1;
                }
                if super_pos == 0 {
                    None
                } else {
                    Some(pair(
                        &self.super_.data,
                        SSS_OFFSET_SSB_POINTER + 2 * (super_pos - 1),
                    ))
                }
            } else {
                super_pos = 1;
                Some(ss)
            };

            if let Some(head) = side_head {
                self.side.map(&mut img.dev, head.0, head.1)?;
                while side < SSG_SIDE_SECTORS_MAX
                    && self.side.data[SSB_OFFSET_SSG + 2 * side] != 0
                {
                    side += 1;
                }
                if side > 1 {
                    let last = pair(&self.side.data, SSB_OFFSET_SSG + 2 * (side - 1));
                    self.side.map(&mut img.dev, last.0, last.1)?;
                }
                side_pos = (self.side.data[BLK_NEXT_SECTOR] as usize + 1)
                    .saturating_sub(SSB_OFFSET_SECTOR)
                    / 2;
                if side_pos > 0 {
                    data_ts = pair(&self.side.data, SSB_OFFSET_SECTOR + 2 * (side_pos - 1));
                    self.data.map(&mut img.dev, data_ts.0, data_ts.1)?;
                }
            }
        }

        // total allocated blocks from the structure counts
        let mut data_blocks: u32 = 0;
        let mut side_blocks: u32 = 0;
        if has_ssb && super_ts.0 != 0 {
            side_blocks += 1;
            if super_pos > 0 {
                side_blocks += (super_pos as u32 - 1) * SSG_SIDE_SECTORS_MAX as u32;
                data_blocks += (super_pos as u32 - 1)
                    * SSG_SIDE_SECTORS_MAX as u32
                    * SSB_INDEX_SECTOR_MAX as u32;
            }
        }
        if side > 0 {
            data_blocks += (side as u32 - 1) * SSB_INDEX_SECTOR_MAX as u32;
            side_blocks += side as u32 - 1;
            data_blocks += side_pos as u32;
            side_blocks += 1;
        }
        let mut blocks = side_blocks + data_blocks;

        // an orphaned follow-up pointer in the last data block is a
        // known DOS inconsistency; truncate it the way the DOS does
        if data_ts.0 != 0 {
            if self.data.data[BLK_NEXT_TRACK] != 0 {
                debug!(
                    "discarding orphaned chain pointer in last data block at {}/{}",
                    data_ts.0, data_ts.1
                );
                data_pos = SECTOR_DATA as u32 - (data_blocks * SECTOR_DATA as u32) % reclen;
                self.data.data[BLK_NEXT_TRACK] = 0;
                self.data.data[BLK_NEXT_SECTOR] = (data_pos + 1) as u8;
                self.data.mark_dirty();
            } else {
                data_pos = self.data.data[BLK_NEXT_SECTOR] as u32 - 1;
            }
        }

        // total bytes from the structure counts, then records
        let mut file_size: u32 = 0;
        if super_pos > 0 {
            file_size = super_pos as u32 - 1;
        }
        file_size *= SSG_SIDE_SECTORS_MAX as u32;
        if side > 0 {
            file_size += side as u32 - 1;
        }
        file_size *= SSB_INDEX_SECTOR_MAX as u32;
        if side_pos > 0 {
            file_size += side_pos as u32 - 1;
        }
        file_size *= SECTOR_DATA as u32;
        file_size += data_pos;

        let mut numrecords = file_size / reclen;
        let mut rec_pos = file_size % reclen;

        debug!(
            "rel_navigate: super_pos={} side={} side_pos={} data_pos={} -> size={} blocks={} records={}",
            super_pos, side, side_pos, data_pos, file_size, blocks, numrecords
        );

        // expansion loop
        while numrecords < targetrec {
            if side == SSG_SIDE_SECTORS_MAX
                && side_pos == SSB_INDEX_SECTOR_MAX
                && (!has_ssb || super_pos == SSS_INDEX_SSB_MAX)
            {
                return Err(CbmError::DiskFull);
            }

            let remaining = targetrec - numrecords;
            // bytes to the end of the target record, counting a
            // record already straddling into this block
            let need = remaining * reclen - rec_pos;

            if data_ts.0 != 0 && need <= SECTOR_DATA as u32 - data_pos {
                // the records fit into the tail of the current block
                fill_records(
                    &mut self.data,
                    data_pos as usize,
                    need as usize,
                    &mut rec_pos,
                    reclen,
                    &mut numrecords,
                );
                data_pos += need;
                self.data.data[BLK_NEXT_TRACK] = 0;
                self.data.data[BLK_NEXT_SECTOR] = (data_pos + 1) as u8;
                continue;
            }

            // a new data sector is needed
            let new_ts = if side == 0 {
                img.find_free_block_intts()?
            } else {
                img.find_free_block_nxtts(data_ts.0, data_ts.1)?
            };
            blocks += 1;

            if side == 0 {
                // first side sector of the file
                let ss_ts = img.find_free_block_nxtts(new_ts.0, new_ts.1)?;
                blocks += 1;

                self.side.set(ss_ts.0, ss_ts.1);
                self.side.data = [0; SECTOR_SIZE];
                self.side.data[BLK_NEXT_SECTOR] = (SSB_OFFSET_SECTOR - 1) as u8;
                self.side.data[SSB_OFFSET_RECORD_LEN] = reclen as u8;
                put_pair(&mut self.side.data, SSB_OFFSET_SSG, ss_ts);
                self.side.mark_dirty();

                side = 1;
                side_pos = 0;
            }

            if has_ssb && super_ts.0 == 0 {
                // the format keeps a super side sector; create it
                let sup = img.find_free_block_nxtts(new_ts.0, new_ts.1)?;
                blocks += 1;
                super_ts = sup;

                let group_head = pair(&self.side.data, SSB_OFFSET_SSG);
                self.super_.set(sup.0, sup.1);
                self.super_.data = [0; SECTOR_SIZE];
                self.super_.data[SSS_OFFSET_SUPER_254] = 254;
                put_pair(&mut self.super_.data, BLK_NEXT_TRACK, group_head);
                put_pair(&mut self.super_.data, SSS_OFFSET_SSB_POINTER, group_head);
                self.super_.mark_dirty();
                super_pos = 1;
            }

            let mut data2: Option<(u8, u8)> = None;
            let mut bug_leak = false;
            if side_pos == SSB_INDEX_SECTOR_MAX {
                // the current side sector is full; the DOS allocates a
                // spare data block alongside the new side sector
                bug_leak = img.bugs.new_side_sector
                    && remaining * reclen + data_pos <= 2 * SECTOR_DATA as u32;

                let d2 = img.find_free_block_nxtts(new_ts.0, new_ts.1)?;
                if !bug_leak {
                    blocks += 1;
                }
                data2 = Some(d2);

                let new_side_ts = img.find_free_block_nxtts(new_ts.0, new_ts.1)?;
                blocks += 1;

                // chain the old last side sector to the new one
                put_pair(&mut self.side.data, BLK_NEXT_TRACK, new_side_ts);
                self.side.mark_dirty();

                let group_index;
                let mut group_table = [0u8; 2 * SSG_SIDE_SECTORS_MAX];
                if side == SSG_SIDE_SECTORS_MAX {
                    // the group is full; start a new one
                    group_index = 0;
                    self.side.flush(&mut img.dev)?;
                    self.super_.data
                        [SSS_OFFSET_SSB_POINTER + 2 * super_pos..SSS_OFFSET_SSB_POINTER + 2 * super_pos + 2]
                        .copy_from_slice(&[new_side_ts.0, new_side_ts.1]);
                    self.super_.mark_dirty();
                    super_pos += 1;
                } else {
                    // extend the current group: every member carries
                    // the full group table, so update them all
                    group_index = side;
                    put_pair(&mut self.side.data, SSB_OFFSET_SSG + 2 * group_index, new_side_ts);
                    group_table
                        .copy_from_slice(&self.side.data[SSB_OFFSET_SSG..SSB_OFFSET_SSG + 12]);
                    self.side.flush(&mut img.dev)?;
                    for member in 0..group_index {
                        let ts = pair(&group_table, 2 * member);
                        if ts == self.side.ts() || ts.0 == 0 {
                            continue;
                        }
                        self.side.reuse_or_map(&mut img.dev, ts.0, ts.1)?;
                        put_pair(
                            &mut self.side.data,
                            SSB_OFFSET_SSG + 2 * group_index,
                            new_side_ts,
                        );
                        self.side.write(&mut img.dev)?;
                    }
                }

                // initialise the new side sector
                self.side.set(new_side_ts.0, new_side_ts.1);
                self.side.data = [0; SECTOR_SIZE];
                self.side.data[SSB_OFFSET_SECTOR_NUM] = group_index as u8;
                self.side.data[SSB_OFFSET_RECORD_LEN] = reclen as u8;
                if group_index == 0 {
                    put_pair(&mut self.side.data, SSB_OFFSET_SSG, new_side_ts);
                } else {
                    self.side.data[SSB_OFFSET_SSG..SSB_OFFSET_SSG + 12]
                        .copy_from_slice(&group_table);
                }
                self.side.mark_dirty();

                side = group_index + 1;
                side_pos = 0;
            }

            // record the new data block in the side sector
            put_pair(&mut self.side.data, SSB_OFFSET_SECTOR + 2 * side_pos, new_ts);
            self.side.data[BLK_NEXT_SECTOR] = (SSB_OFFSET_SECTOR + 2 * side_pos + 1) as u8;
            side_pos += 1;
            if let Some(d2) = data2 {
                if !bug_leak {
                    put_pair(&mut self.side.data, SSB_OFFSET_SECTOR + 2 * side_pos, d2);
                    self.side.data[BLK_NEXT_SECTOR] =
                        (SSB_OFFSET_SECTOR + 2 * side_pos + 1) as u8;
                    side_pos += 1;
                }
            }
            self.side.mark_dirty();

            // complete the tail of the previous block and link it
            if data_ts.0 != 0 {
                let tail = SECTOR_DATA - data_pos as usize;
                fill_records(
                    &mut self.data,
                    data_pos as usize,
                    tail,
                    &mut rec_pos,
                    reclen,
                    &mut numrecords,
                );
                put_pair(&mut self.data.data, BLK_NEXT_TRACK, new_ts);
            } else {
                first_data = Some(new_ts);
            }

            // switch to the fresh block
            self.data.reuse_or_map(&mut img.dev, new_ts.0, new_ts.1)?;
            self.data.data = [0; SECTOR_SIZE];
            self.data.data[BLK_NEXT_SECTOR] = 1;
            self.data.mark_dirty();
            data_ts = new_ts;
            data_pos = 0;

            if let Some(d2) = data2 {
                // fill the block before the spare completely and chain
                // it to the spare
                fill_records(
                    &mut self.data,
                    0,
                    SECTOR_DATA,
                    &mut rec_pos,
                    reclen,
                    &mut numrecords,
                );
                put_pair(&mut self.data.data, BLK_NEXT_TRACK, d2);
                data_pos = SECTOR_DATA as u32;
                if bug_leak {
                    // the DOS forgets the spare: the chain points at
                    // it, the side sector does not, the BAM keeps it
                    // allocated
                    debug!("leaking spare data block {}/{} behind new side sector", d2.0, d2.1);
                    continue;
                }
                self.data.reuse_or_map(&mut img.dev, d2.0, d2.1)?;
                self.data.data = [0; SECTOR_SIZE];
                self.data.data[BLK_NEXT_SECTOR] = 1;
                self.data.mark_dirty();
                data_ts = d2;
                data_pos = 0;
            }
        }

        // write back in chain order: data, side, super, BAM
        self.data.flush(&mut img.dev)?;
        self.side.flush(&mut img.dev)?;
        self.super_.flush(&mut img.dev)?;
        img.flush_bam()?;

        let ss_out = if has_ssb {
            super_ts
        } else if self.side.ts().0 != 0 {
            pair(&self.side.data, SSB_OFFSET_SSG)
        } else {
            (self.slot.ss_track, self.slot.ss_sector)
        };

        Ok(Nav {
            ss: ss_out,
            first_data,
            numrecords,
            blocks,
        })
    }

    /// Expand the file so the given number of records exists, and
    /// bring the directory slot up to date.
    pub(crate) fn expand_rel(&mut self, img: &mut DiImage, records: u32) -> Result<(), CbmError> {
        debug!(
            "expand_rel to {} records (maxrecord={}, ss={}/{})",
            records, self.maxrecord, self.slot.ss_track, self.slot.ss_sector
        );

        let nav = self.rel_navigate(img, records)?;
        self.maxrecord = nav.numrecords;

        let mut dirty = self.slot.size != nav.blocks as u16;
        self.slot.size = nav.blocks as u16;
        if (self.slot.ss_track, self.slot.ss_sector) != nav.ss {
            self.slot.ss_track = nav.ss.0;
            self.slot.ss_sector = nav.ss.1;
            dirty = true;
        }
        if self.slot.start_track == 0 {
            if let Some(first) = nav.first_data {
                self.slot.start_track = first.0;
                self.slot.start_sector = first.1;
            }
            if img.bugs.new_rel_size {
                self.slot.size = 0;
            }
            dirty = true;
        }

        if dirty {
            let slot = self.slot.clone();
            img.write_slot(&slot)?;
        }
        Ok(())
    }

    /// Count the records of an existing REL file.
    pub(crate) fn rel_record_max(&mut self, img: &mut DiImage) -> Result<u32, CbmError> {
        let nav = self.rel_navigate(img, 0)?;
        Ok(nav.numrecords)
    }

    /// Position to a record.  On failure the requested position is
    /// retained in `lastpos`, so the next write expands the file to
    /// make the record present.
    pub(crate) fn rel_position(&mut self, img: &mut DiImage, recordno: u32) -> Result<(), CbmError> {
        // record 0 always exists, so lastpos can double as a flag
        self.lastpos = recordno + 1;

        let reclen = self.slot.recordlen as u32;
        if reclen == 0 {
            return Err(CbmError::FileTypeMismatch);
        }

        let rec_long = recordno * reclen;
        let rec_start = rec_long % SECTOR_DATA as u32;

        let per_group = SECTOR_DATA as u32 * SSB_INDEX_SECTOR_MAX as u32 * SSG_SIDE_SECTORS_MAX as u32;
        let super_index = (rec_long / per_group) as usize;
        let mut rest = rec_long % per_group;

        let per_side = SECTOR_DATA as u32 * SSB_INDEX_SECTOR_MAX as u32;
        let side_index = (rest / per_side) as usize;
        rest %= per_side;

        let block_index = (rest / SECTOR_DATA as u32) as usize;

        debug!(
            "rel_position: record {} -> super={} side={} block={} byte={}",
            recordno, super_index, side_index, block_index, rec_start
        );

        let (sst, sss) = (self.slot.ss_track, self.slot.ss_sector);
        if sst == 0 {
            warn!("rel_position on a non-REL file");
            return Err(CbmError::FileTypeMismatch);
        }

        self.data.reuse_or_map(&mut img.dev, sst, sss)?;

        if self.data.data[SSS_OFFSET_SUPER_254] == 0xfe {
            let head = pair(&self.data.data, SSS_OFFSET_SSB_POINTER + 2 * super_index);
            if head.0 == 0 {
                return Err(CbmError::RecordNotPresent);
            }
            self.data.map(&mut img.dev, head.0, head.1)?;
        } else if super_index > 0 {
            return Err(CbmError::RecordNotPresent);
        }

        if side_index > 0 {
            let ts = pair(&self.data.data, SSB_OFFSET_SSG + 2 * side_index);
            if ts.0 == 0 {
                return Err(CbmError::RecordNotPresent);
            }
            self.data.map(&mut img.dev, ts.0, ts.1)?;
        }

        let ts = pair(&self.data.data, SSB_OFFSET_SECTOR + 2 * block_index);
        if ts.0 == 0 {
            return Err(CbmError::RecordNotPresent);
        }
        self.data.map(&mut img.dev, ts.0, ts.1)?;

        // the full record must fit in front of the last-byte marker
        if self.data.data[BLK_NEXT_TRACK] == 0
            && (self.data.data[BLK_NEXT_SECTOR] as u32) < rec_start + reclen + 1
        {
            return Err(CbmError::RecordNotPresent);
        }

        self.chp = rec_start as u8;
        self.lastpos = 0;
        Ok(())
    }
}
