//! Disk geometries of the supported Commodore image formats.
//!
//! A mounted image is identified by its exact file length.  Each
//! geometry describes the track/sector layout, the directory and BAM
//! positions and the DOS version bytes the way the respective drive
//! firmware formats a disk.
//!
//! Track numbers are 1-based, sector numbers 0-based, every sector is
//! 256 bytes.
#![warn(missing_docs)]
#![warn(unsafe_code)]

/// Sector size of all supported formats.
pub const SECTOR_SIZE: usize = 256;
/// Payload bytes per data sector (two bytes are the chain link).
pub const SECTOR_DATA: usize = 254;
/// Directory slots per directory sector.
pub const SLOTS_PER_SECTOR: u8 = 8;
/// Size of one directory slot.
pub const SLOT_SIZE: usize = 32;

/// A zone of tracks sharing a sector count: (first track, sectors).
type Zone = (u8, u8);

/// The layout of one disk image format.
pub struct Geometry {
    /// format id: 64, 71, 80, 81 or 82
    pub id: u8,
    /// tracks per side
    pub tracks: u8,
    /// number of sides
    pub sides: u8,
    /// largest sector count of any track, determines the BAM stride
    pub sectors_max: u8,
    /// track holding the directory
    pub dir_track: u8,
    /// first directory sector on the directory track
    pub dir_sector: u8,
    /// sector of the disk header on the directory track
    pub hdr_sector: u8,
    /// offset of the disk name within the header sector
    pub hdr_offset: usize,
    /// the BAM block chain (1..4 sectors)
    pub bam_ts: &'static [(u8, u8)],
    /// offset of the first per-track BAM entry in a BAM sector
    pub bam_offset: usize,
    /// tracks covered by one BAM sector
    pub tracks_per_bam: u8,
    /// interleave used on the directory track
    pub dir_interleave: u8,
    /// interleave used on data tracks
    pub dat_interleave: u8,
    /// DOS version bytes, e.g. "2A"
    pub dos_version: [u8; 2],
    /// format keeps a super side sector for REL files
    pub has_ssb: bool,
    /// sector counts per track zone, for one side
    zones: &'static [Zone],
}

/// VIC 1541 and compatibles, 35 tracks single sided.
pub static D64: Geometry = Geometry {
    id: 64,
    tracks: 35,
    sides: 1,
    sectors_max: 21,
    dir_track: 18,
    dir_sector: 1,
    hdr_sector: 0,
    hdr_offset: 0x90,
    bam_ts: &[(18, 0)],
    bam_offset: 4,
    tracks_per_bam: 35,
    dir_interleave: 3,
    dat_interleave: 10,
    dos_version: *b"2A",
    has_ssb: false,
    zones: &[(1, 21), (18, 19), (25, 18), (31, 17)],
};

/// 1571, a 1541 layout mirrored on a second side.
pub static D71: Geometry = Geometry {
    id: 71,
    tracks: 35,
    sides: 2,
    sectors_max: 21,
    dir_track: 18,
    dir_sector: 1,
    hdr_sector: 0,
    hdr_offset: 0x90,
    bam_ts: &[(18, 0), (53, 0)],
    bam_offset: 4,
    tracks_per_bam: 35,
    dir_interleave: 3,
    dat_interleave: 10,
    dos_version: *b"2A",
    has_ssb: false,
    zones: &[(1, 21), (18, 19), (25, 18), (31, 17)],
};

/// 8050, 77 tracks single sided.
pub static D80: Geometry = Geometry {
    id: 80,
    tracks: 77,
    sides: 1,
    sectors_max: 29,
    dir_track: 39,
    dir_sector: 1,
    hdr_sector: 0,
    hdr_offset: 6,
    bam_ts: &[(38, 0), (38, 3)],
    bam_offset: 6,
    tracks_per_bam: 50,
    dir_interleave: 3,
    dat_interleave: 10,
    dos_version: *b"2C",
    has_ssb: false,
    zones: &[(1, 29), (40, 27), (54, 25), (65, 23)],
};

/// 1581, 80 tracks of 40 sectors.
pub static D81: Geometry = Geometry {
    id: 81,
    tracks: 80,
    sides: 1,
    sectors_max: 40,
    dir_track: 40,
    dir_sector: 3,
    hdr_sector: 0,
    hdr_offset: 4,
    bam_ts: &[(40, 1), (40, 2)],
    bam_offset: 16,
    tracks_per_bam: 40,
    dir_interleave: 1,
    dat_interleave: 1,
    dos_version: *b"3D",
    has_ssb: true,
    zones: &[(1, 40)],
};

/// 8250, an 8050 layout on two sides.
pub static D82: Geometry = Geometry {
    id: 82,
    tracks: 77,
    sides: 2,
    sectors_max: 29,
    dir_track: 39,
    dir_sector: 1,
    hdr_sector: 0,
    hdr_offset: 6,
    bam_ts: &[(38, 0), (38, 3), (38, 6), (38, 9)],
    bam_offset: 6,
    tracks_per_bam: 50,
    dir_interleave: 3,
    dat_interleave: 10,
    dos_version: *b"2C",
    has_ssb: true,
    zones: &[(1, 29), (40, 27), (54, 25), (65, 23)],
};

static GEOMETRIES: [&Geometry; 5] = [&D64, &D71, &D80, &D81, &D82];

impl Geometry {
    /// The last valid track number (both sides).
    pub fn last_track(&self) -> u8 {
        self.tracks * self.sides
    }

    /// Number of sectors on the given track (LSEC), or None for an
    /// invalid track number.
    pub fn sectors_in_track(&self, track: u8) -> Option<u8> {
        if track == 0 || track > self.last_track() {
            return None;
        }
        // second side repeats the zone layout
        let t = if track > self.tracks {
            track - self.tracks
        } else {
            track
        };
        let mut sectors = self.zones[0].1;
        for (first, count) in self.zones {
            if t >= *first {
                sectors = *count;
            }
        }
        Some(sectors)
    }

    /// Linear block address of a track/sector pair, or None when the
    /// address is outside the medium.
    pub fn lba(&self, track: u8, sector: u8) -> Option<u32> {
        let in_track = self.sectors_in_track(track)?;
        if sector >= in_track {
            return None;
        }
        let mut blocks: u32 = 0;
        for t in 1..track {
            blocks += self.sectors_in_track(t)? as u32;
        }
        Some(blocks + sector as u32)
    }

    /// Total number of blocks on the medium.
    pub fn total_blocks(&self) -> u32 {
        (1..=self.last_track())
            .map(|t| self.sectors_in_track(t).unwrap_or(0) as u32)
            .sum()
    }

    /// The exact image file size of this geometry.
    pub fn image_size(&self) -> u64 {
        self.total_blocks() as u64 * SECTOR_SIZE as u64
    }

    /// Byte stride of one track's BAM entry in its BAM sector.
    pub fn bam_stride(&self) -> usize {
        1 + ((self.sectors_max as usize + 7) >> 3)
    }

    /// Identify a geometry by the exact image file length.
    pub fn identify(filesize: u64) -> Option<&'static Geometry> {
        GEOMETRIES.iter().find(|g| g.image_size() == filesize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::{Geometry, D64, D71, D80, D81, D82};
    use pretty_assertions::assert_eq;

    #[test]
    fn block_counts_match_the_formats() {
        assert_eq!(D64.total_blocks(), 683);
        assert_eq!(D71.total_blocks(), 1366);
        assert_eq!(D80.total_blocks(), 2083);
        assert_eq!(D81.total_blocks(), 3200);
        assert_eq!(D82.total_blocks(), 4166);
    }

    #[test]
    fn image_sizes_identify_uniquely() {
        assert_eq!(Geometry::identify(174848).map(|g| g.id), Some(64));
        assert_eq!(Geometry::identify(349696).map(|g| g.id), Some(71));
        assert_eq!(Geometry::identify(533248).map(|g| g.id), Some(80));
        assert_eq!(Geometry::identify(819200).map(|g| g.id), Some(81));
        assert_eq!(Geometry::identify(1066496).map(|g| g.id), Some(82));
        assert_eq!(Geometry::identify(12345).map(|g| g.id), None);
    }

    #[test]
    fn d64_zone_table() {
        assert_eq!(D64.sectors_in_track(1), Some(21));
        assert_eq!(D64.sectors_in_track(17), Some(21));
        assert_eq!(D64.sectors_in_track(18), Some(19));
        assert_eq!(D64.sectors_in_track(24), Some(19));
        assert_eq!(D64.sectors_in_track(25), Some(18));
        assert_eq!(D64.sectors_in_track(30), Some(18));
        assert_eq!(D64.sectors_in_track(31), Some(17));
        assert_eq!(D64.sectors_in_track(35), Some(17));
        assert_eq!(D64.sectors_in_track(0), None);
        assert_eq!(D64.sectors_in_track(36), None);
    }

    #[test]
    fn d71_second_side_mirrors_the_zones() {
        assert_eq!(D71.sectors_in_track(36), Some(21));
        assert_eq!(D71.sectors_in_track(53), Some(19));
        assert_eq!(D71.sectors_in_track(70), Some(17));
        assert_eq!(D71.sectors_in_track(71), None);
    }

    #[test]
    fn lba_is_linear() {
        assert_eq!(D64.lba(1, 0), Some(0));
        assert_eq!(D64.lba(1, 20), Some(20));
        assert_eq!(D64.lba(2, 0), Some(21));
        // track 18 starts after 17 tracks of 21 sectors
        assert_eq!(D64.lba(18, 0), Some(17 * 21));
        assert_eq!(D64.lba(18, 21), None);
        assert_eq!(D64.lba(0, 0), None);
        // D71 second side continues linearly
        assert_eq!(D71.lba(36, 0), Some(683));
    }

    #[test]
    fn bam_strides() {
        assert_eq!(D64.bam_stride(), 4);
        assert_eq!(D80.bam_stride(), 5);
        assert_eq!(D81.bam_stride(), 6);
    }
}
