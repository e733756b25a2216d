//! The packet protocol spoken with the host.
//!
//! Each packet is `cmd(1) | len(1) | channel(1) | payload(len-3)`, the
//! length counting the three header bytes.  `FS_SYNC` (0xff) is sent
//! out of band to re-synchronise; a frame parser must swallow stray
//! sync bytes.  Replies use [`FS_REPLY`] with the CBM error code in
//! payload byte 0, read replies use [`FS_DATA`] / [`FS_DATA_EOF`].
#![warn(missing_docs)]
#![warn(unsafe_code)]

use nom::{
    bytes::complete::take,
    number::complete::le_u8,
    IResult,
};

/// diagnostic text from the device
pub const FS_TERM: u8 = 0;
/// open for reading (file must exist)
pub const FS_OPEN_RD: u8 = 1;
/// open for writing (file must not exist)
pub const FS_OPEN_WR: u8 = 2;
/// open for read/write access (REL files)
pub const FS_OPEN_RW: u8 = 3;
/// open for appending (file must exist)
pub const FS_OPEN_AP: u8 = 4;
/// open for writing, overwriting an existing file
pub const FS_OPEN_OW: u8 = 5;
/// open a directory for reading
pub const FS_OPEN_DR: u8 = 6;
/// read from a channel
pub const FS_READ: u8 = 7;
/// write to a channel
pub const FS_WRITE: u8 = 8;
/// write to a channel, closing the data stream
pub const FS_WRITE_EOF: u8 = 9;
/// reply with a CBM error code
pub const FS_REPLY: u8 = 10;
/// data reply
pub const FS_DATA: u8 = 11;
/// data reply carrying the last bytes of the stream
pub const FS_DATA_EOF: u8 = 12;
/// position a channel to a record
pub const FS_POSITION: u8 = 13;
/// close a channel
pub const FS_CLOSE: u8 = 14;
/// rename a file
pub const FS_MOVE: u8 = 15;
/// scratch files matching a pattern
pub const FS_DELETE: u8 = 16;
/// format the medium
pub const FS_FORMAT: u8 = 17;
/// remove a directory
pub const FS_RMDIR: u8 = 18;
/// create a directory
pub const FS_MKDIR: u8 = 19;
/// change the current directory of a drive
pub const FS_CHDIR: u8 = 20;
/// assign a provider to a drive
pub const FS_ASSIGN: u8 = 21;
/// set a server option
pub const FS_SETOPT: u8 = 22;
/// reset the server state
pub const FS_RESET: u8 = 23;
/// direct block commands (U1/U2/B-A/B-F)
pub const FS_BLOCK: u8 = 24;
/// get date and time
pub const FS_GETDATIM: u8 = 25;
/// select the wire charset
pub const FS_CHARSET: u8 = 26;
/// copy files into a target file
pub const FS_COPY: u8 = 27;
/// re-read the disk status
pub const FS_INITIALIZE: u8 = 28;
/// server information (human readable)
pub const FS_INFO: u8 = 29;
/// out-of-band resynchronisation byte
pub const FS_SYNC: u8 = 0xff;

/// reserved channel for the command channel
pub const FSFD_CMD: u8 = 0xff;
/// reserved channel for SETOPT configuration
pub const FSFD_SETOPT: u8 = 0xfe;

/// sub-commands of FS_BLOCK, payload byte 0
pub mod block {
    /// U1: read a block into a channel buffer
    pub const U1: u8 = 1;
    /// U2: write a channel buffer to a block
    pub const U2: u8 = 2;
    /// B-A: allocate a block
    pub const BA: u8 = 3;
    /// B-F: free a block
    pub const BF: u8 = 4;
}

/// Offsets of the FS_BLOCK payload: cmd, track (2 bytes le),
/// sector (2 bytes le), channel.
pub mod block_par {
    /// sub-command offset
    pub const CMD: usize = 0;
    /// track, low byte
    pub const TRACK: usize = 1;
    /// sector, low byte
    pub const SECTOR: usize = 3;
    /// channel number the buffer binds to
    pub const CHANNEL: usize = 5;
}

/// CBM file types as found in a directory slot's low type bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FileType {
    /// scratched or deleted
    Del = 0,
    /// sequential file
    Seq = 1,
    /// program
    Prg = 2,
    /// user file
    Usr = 3,
    /// relative (record) file
    Rel = 4,
    /// 1581 partition / CBM file
    Cbm = 5,
    /// directory (host filesystem)
    Dir = 6,
    /// unknown - any type matches
    Unknown = 255,
}

impl From<u8> for FileType {
    fn from(num: u8) -> FileType {
        match num & 0x07 {
            0 => FileType::Del,
            1 => FileType::Seq,
            2 => FileType::Prg,
            3 => FileType::Usr,
            4 => FileType::Rel,
            5 => FileType::Cbm,
            6 => FileType::Dir,
            _ => FileType::Unknown,
        }
    }
}

impl FileType {
    /// The three-letter directory listing name of this type.
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Del => "DEL",
            FileType::Seq => "SEQ",
            FileType::Prg => "PRG",
            FileType::Usr => "USR",
            FileType::Rel => "REL",
            FileType::Cbm => "CBM",
            FileType::Dir => "DIR",
            FileType::Unknown => "???",
        }
    }
}

/// What a directory entry record describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DirMode {
    /// the disk header (name of the medium)
    Name = 0,
    /// a file
    File = 1,
    /// a sub-directory
    Dir = 2,
    /// the blocks-free trailer
    Free = 3,
}

/// attribute flag: file was not closed properly (splat file)
pub const ATTR_SPLAT: u8 = 0x80;
/// attribute flag: file is locked against deletion
pub const ATTR_LOCKED: u8 = 0x40;
/// attribute flag: the length field is an estimate
pub const ATTR_ESTIMATE: u8 = 0x20;
/// attribute flag: the file supports seeking
pub const ATTR_SEEK: u8 = 0x10;

/// mask of the file type bits within the attribute byte
pub const ATTR_TYPEMASK: u8 = 0x07;

/// A directory entry as produced by a directory read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// entry name in the charset of `cset`
    pub name: Vec<u8>,
    /// charset of the name bytes
    pub cset: crate::charset::Charset,
    /// file size in bytes
    pub size: u64,
    /// modification date (year-1900, month, day, hour, minute, second)
    pub date: [u8; 6],
    /// what the entry describes
    pub mode: DirMode,
    /// the CBM file type
    pub ftype: FileType,
    /// attribute flags (ATTR_*)
    pub attr: u8,
    /// REL record length, 0 otherwise
    pub recordlen: u8,
}

impl DirEntry {
    /// Byte offset of the name field in the wire record.
    pub const NAME_OFFSET: usize = 12;

    /// Serialize the entry into the payload format of a directory
    /// read reply: length(4 le) | date(6) | mode(1) | attr(1) |
    /// name | NUL.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::NAME_OFFSET + self.name.len() + 1);
        out.extend_from_slice(&(self.size as u32).to_le_bytes());
        out.extend_from_slice(&self.date);
        out.push(self.mode as u8);
        out.push(self.attr | (self.ftype as u8 & ATTR_TYPEMASK));
        out.extend_from_slice(&self.name);
        out.push(0);
        out
    }
}

/// One protocol frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    /// the command byte
    pub cmd: u8,
    /// the channel the packet belongs to
    pub channel: u8,
    /// payload bytes
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet.
    pub fn new(cmd: u8, channel: u8, payload: Vec<u8>) -> Packet {
        Packet {
            cmd,
            channel,
            payload,
        }
    }

    /// Build an FS_REPLY carrying a CBM error code and optional
    /// extra payload bytes.
    pub fn reply(channel: u8, code: crate::error::CbmError, extra: &[u8]) -> Packet {
        let mut payload = Vec::with_capacity(1 + extra.len());
        payload.push(code.code());
        payload.extend_from_slice(extra);
        Packet::new(FS_REPLY, channel, payload)
    }

    /// Build an FS_DATA / FS_DATA_EOF reply.
    pub fn data(channel: u8, bytes: Vec<u8>, eof: bool) -> Packet {
        Packet::new(if eof { FS_DATA_EOF } else { FS_DATA }, channel, bytes)
    }

    /// Serialize the packet to wire bytes.
    pub fn to_wire(&self) -> Vec<u8> {
        let len = 3 + self.payload.len();
        debug_assert!(len <= 255, "packet too long");
        let mut out = Vec::with_capacity(len);
        out.push(self.cmd);
        out.push(len as u8);
        out.push(self.channel);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Parse one packet frame from the input, skipping stray FS_SYNC
/// bytes in front of it.
pub fn packet_parser(i: &[u8]) -> IResult<&[u8], Packet> {
    let mut i = i;
    while i.first() == Some(&FS_SYNC) {
        i = &i[1..];
    }
    let (i, cmd) = le_u8(i)?;
    let (i, len) = le_u8(i)?;
    let (i, channel) = le_u8(i)?;
    let paylen = (len as usize).saturating_sub(3);
    let (i, payload) = take(paylen)(i)?;

    Ok((
        i,
        Packet {
            cmd,
            channel,
            payload: payload.to_vec(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::{packet_parser, DirEntry, DirMode, FileType, Packet, FS_OPEN_RD, FS_SYNC};
    use crate::charset::Charset;
    use crate::error::CbmError;
    use pretty_assertions::assert_eq;

    #[test]
    fn packet_round_trip() {
        let p = Packet::new(FS_OPEN_RD, 2, b"0:TESTFILE".to_vec());
        let wire = p.to_wire();
        assert_eq!(wire[1] as usize, wire.len());
        let (rest, q) = packet_parser(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p, q);
    }

    #[test]
    fn sync_bytes_are_skipped() {
        let p = Packet::reply(0, CbmError::Ok, &[]);
        let mut wire = vec![FS_SYNC, FS_SYNC];
        wire.extend_from_slice(&p.to_wire());
        let (_, q) = packet_parser(&wire).unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn reply_carries_the_code_first() {
        let p = Packet::reply(5, CbmError::DiskFull, &[18, 1]);
        assert_eq!(p.payload, vec![72, 18, 1]);
    }

    #[test]
    fn direntry_wire_format() {
        let e = DirEntry {
            name: b"BAR".to_vec(),
            cset: Charset::Petscii,
            size: 508,
            date: [0; 6],
            mode: DirMode::File,
            ftype: FileType::Prg,
            attr: 0,
            recordlen: 0,
        };
        let wire = e.to_wire();
        assert_eq!(&wire[0..4], &508u32.to_le_bytes());
        assert_eq!(wire[10], DirMode::File as u8);
        assert_eq!(wire[11] & 0x07, FileType::Prg as u8);
        assert_eq!(&wire[12..15], b"BAR");
        assert_eq!(wire[15], 0);
    }
}
