//! End-to-end scenarios against mounted disk images: format, file
//! round trips, scratch, REL record handling and block channel
//! access, with raw-image checks of the BAM and chain structures.

use std::collections::BTreeSet;
use std::path::PathBuf;

use pretty_assertions::assert_eq;

use cbmfs::config::{Config, DosBugs};
use cbmfs::dispatch::{dispatch, ServerContext};
use cbmfs::error::CbmError;
use cbmfs::name::OpenParams;
use cbmfs::provider::di::geometry::D64;
use cbmfs::provider::di::DiProvider;
use cbmfs::provider::{OpenMode, Provider};
use cbmfs::wire::{self, FileType, Packet};

fn blank_d64(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, vec![0u8; D64.image_size() as usize]).unwrap();
    path
}

fn reply_code(reply: &Option<Packet>) -> u8 {
    let p = reply.as_ref().expect("expected a reply");
    assert_eq!(p.cmd, wire::FS_REPLY);
    p.payload[0]
}

fn send(ctx: &mut ServerContext, cmd: u8, chan: u8, payload: Vec<u8>) -> Option<Packet> {
    dispatch(ctx, &Packet::new(cmd, chan, payload))
}

fn open_payload(drive: u8, name: &[u8]) -> Vec<u8> {
    let mut p = vec![drive];
    p.extend_from_slice(name);
    p.push(0);
    p
}

/// One wire directory record, decoded.
struct Entry {
    size: u32,
    mode: u8,
    name: Vec<u8>,
}

fn read_directory(ctx: &mut ServerContext, chan: u8) -> Vec<Entry> {
    let mut entries = Vec::new();
    loop {
        let reply = send(ctx, wire::FS_READ, chan, vec![]).unwrap();
        assert!(reply.cmd == wire::FS_DATA || reply.cmd == wire::FS_DATA_EOF);
        if !reply.payload.is_empty() {
            let size = u32::from_le_bytes(reply.payload[0..4].try_into().unwrap());
            let mode = reply.payload[10];
            let name: Vec<u8> = reply.payload[12..]
                .iter()
                .take_while(|c| **c != 0)
                .copied()
                .collect();
            entries.push(Entry { size, mode, name });
        }
        if reply.cmd == wire::FS_DATA_EOF {
            break;
        }
    }
    entries
}

/// Scenario: mount an empty D64, format it, write two files,
/// scratch one, and check the directory and the blocks-free count.
#[test]
fn format_write_scratch_directory() {
    let path = blank_d64("cbmfs-scenario1.d64");
    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, &format!("di:{}", path.display())).unwrap();

    let reply = send(&mut ctx, wire::FS_FORMAT, 15, open_payload(0, b"TEST,01"));
    assert_eq!(reply_code(&reply), 0);

    // FOO: 100 bytes of 0x41
    let reply = send(&mut ctx, wire::FS_OPEN_WR, 1, open_payload(0, b"FOO"));
    assert_eq!(reply_code(&reply), 0);
    let reply = send(&mut ctx, wire::FS_WRITE_EOF, 1, vec![0x41; 100]);
    assert_eq!(reply_code(&reply), 0);
    let reply = send(&mut ctx, wire::FS_CLOSE, 1, vec![]);
    assert_eq!(reply_code(&reply), 0);

    // BAR: 300 bytes of 0x42, written in two wire-sized chunks
    let reply = send(&mut ctx, wire::FS_OPEN_WR, 1, open_payload(0, b"BAR"));
    assert_eq!(reply_code(&reply), 0);
    let reply = send(&mut ctx, wire::FS_WRITE, 1, vec![0x42; 150]);
    assert_eq!(reply_code(&reply), 0);
    let reply = send(&mut ctx, wire::FS_WRITE_EOF, 1, vec![0x42; 150]);
    assert_eq!(reply_code(&reply), 0);
    let reply = send(&mut ctx, wire::FS_CLOSE, 1, vec![]);
    assert_eq!(reply_code(&reply), 0);

    // scratch FOO
    let reply = send(&mut ctx, wire::FS_DELETE, 15, open_payload(0, b"FOO"));
    let p = reply.unwrap();
    assert_eq!(p.payload[0], CbmError::Scratched.code());
    assert_eq!(p.payload[1], 1, "one file scratched");

    // directory: header, BAR as a 2-block PRG, blocks-free trailer
    let reply = send(&mut ctx, wire::FS_OPEN_DR, 0, open_payload(0, b"$"));
    assert_eq!(reply_code(&reply), 0);
    let entries = read_directory(&mut ctx, 0);
    send(&mut ctx, wire::FS_CLOSE, 0, vec![]);

    assert_eq!(entries[0].mode, 0, "disk header first");
    assert_eq!(&entries[0].name[..4], b"TEST");

    let files: Vec<&Entry> = entries.iter().filter(|e| e.mode == 1).collect();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, b"BAR".to_vec());
    assert_eq!(files[0].size, 2 * 254);

    let free = entries.last().unwrap();
    assert_eq!(free.mode, 3, "blocks-free trailer last");
    // 664 usable blocks after format, two taken by BAR
    assert_eq!(free.size, 662 * 256);
}

/// Scenario: REL create, position out of range, write, re-open and
/// read the records back.
#[test]
fn rel_create_position_write_read() {
    let path = blank_d64("cbmfs-scenario2.d64");
    let cfg = Config::default();
    let provider = DiProvider::new();
    let ep = provider.endpoint(path.to_str().unwrap(), &cfg).unwrap();
    ep.format(b"REL TEST,02").unwrap();

    let pars = OpenParams {
        filetype: FileType::Rel,
        recordlen: 10,
    };

    {
        let mut root = ep.root().unwrap();
        let mut f = root.create_child(b"REC", &pars, OpenMode::ReadWrite).unwrap();
        assert_eq!(f.meta().recordlen, 10);

        // record 5 does not exist yet
        assert_eq!(f.position(5), Err(CbmError::RecordNotPresent));
        // but the failed position is satisfied by the next write
        f.write(b"HELLO", true).unwrap();
        let status = f.close();
        assert!(status.code.is_success(), "close reported {:?}", status.code);
    }

    // re-open and verify the record contents
    let mut root = ep.root().unwrap();
    let mut file = None;
    while let Some(e) = root.next_entry().unwrap() {
        if e.meta().name == b"REC".to_vec() {
            file = Some(e);
            break;
        }
    }
    let mut f = file.expect("REC not in directory");
    let code = f.open(&pars, OpenMode::ReadWrite).unwrap();
    assert_eq!(code, CbmError::OpenRel);

    f.position(5).unwrap();
    let mut buf = [0u8; 10];
    let (n, _) = f.read(&mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf[..5], b"HELLO");
    assert_eq!(&buf[5..], &[0u8; 5]);

    // record 0 was created with the file: a fill marker and zeros
    f.position(0).unwrap();
    let (n, _) = f.read(&mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(buf[0], 0xff);
    assert_eq!(&buf[1..], &[0u8; 9]);
}

/// Scenario: U1 block read of the BAM sector of a freshly formatted
/// D64.
#[test]
fn block_read_of_fresh_bam() {
    let path = blank_d64("cbmfs-scenario3.d64");
    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, &format!("di:{}", path.display())).unwrap();

    let reply = send(&mut ctx, wire::FS_FORMAT, 15, open_payload(0, b"TEST,01"));
    assert_eq!(reply_code(&reply), 0);

    // U1: read track 18 sector 0 into the channel 2 buffer
    let payload = vec![0u8, wire::block::U1, 18, 0, 0, 0, 2];
    let reply = send(&mut ctx, wire::FS_BLOCK, 15, payload);
    let p = reply.unwrap();
    assert_eq!(p.payload[0], 0);
    assert_eq!(&p.payload[1..], &[18, 0, 0, 0]);

    let reply = send(&mut ctx, wire::FS_READ, 2, vec![]).unwrap();
    let block = &reply.payload;
    assert_eq!(block[0], 18, "link track to the first directory sector");
    assert_eq!(block[1], 1, "link sector to the first directory sector");
    assert_eq!(block[2], 0x41, "DOS version byte 'A'");
    // track 1 BAM entry: 21 free sectors, all bits set
    assert_eq!(&block[4..8], &[21, 0xff, 0xff, 0x1f]);
    // track 18 entry: BAM and first directory sector allocated
    assert_eq!(&block[72..76], &[17, 0xfc, 0xff, 0x07]);
}

/// B-A allocates the requested block or reports the next free one.
#[test]
fn block_allocate_and_free() {
    let path = blank_d64("cbmfs-blockalloc.d64");
    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, &format!("di:{}", path.display())).unwrap();
    send(&mut ctx, wire::FS_FORMAT, 15, open_payload(0, b"T,01"));

    // allocate 1/0
    let payload = vec![0u8, wire::block::BA, 1, 0, 0, 0, 0];
    let p = send(&mut ctx, wire::FS_BLOCK, 15, payload).unwrap();
    assert_eq!(p.payload[0], 0);
    assert_eq!(&p.payload[1..], &[1, 0, 0, 0]);

    // allocating it again reports the next free block
    let payload = vec![0u8, wire::block::BA, 1, 0, 0, 0, 0];
    let p = send(&mut ctx, wire::FS_BLOCK, 15, payload).unwrap();
    assert_eq!(p.payload[0], CbmError::NoBlock.code());
    assert_eq!(&p.payload[1..], &[1, 0, 1, 0]);

    // free it again
    let payload = vec![0u8, wire::block::BF, 1, 0, 0, 0, 0];
    let p = send(&mut ctx, wire::FS_BLOCK, 15, payload).unwrap();
    assert_eq!(p.payload[0], 0);

    // an illegal address echoes the offending track/sector
    let payload = vec![0u8, wire::block::U1, 99, 0, 3, 0, 2];
    let p = send(&mut ctx, wire::FS_BLOCK, 15, payload).unwrap();
    assert_eq!(p.payload[0], CbmError::IllegalTrackOrSector.code());
    assert_eq!(&p.payload[1..], &[99, 0, 3, 0]);
}

/// Round trip: any byte sequence written to a file reads back
/// identically and occupies the expected number of blocks.
#[test]
fn sequential_round_trip() {
    let path = blank_d64("cbmfs-roundtrip.d64");
    let cfg = Config::default();
    let provider = DiProvider::new();
    let ep = provider.endpoint(path.to_str().unwrap(), &cfg).unwrap();
    ep.format(b"RT,03").unwrap();

    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    {
        let mut root = ep.root().unwrap();
        let mut f = root
            .create_child(b"BLOB", &OpenParams::default(), OpenMode::Write)
            .unwrap();
        f.write(&data, true).unwrap();
        assert!(f.close().code.is_success());
    }

    let mut root = ep.root().unwrap();
    let mut entry = None;
    while let Some(e) = root.next_entry().unwrap() {
        if e.meta().name == b"BLOB".to_vec() {
            entry = Some(e);
        }
    }
    let mut f = entry.expect("BLOB missing");
    // 1000 bytes fill ceil(1000/254) = 4 blocks
    assert_eq!(f.meta().size, 4 * 254);

    f.open(&OpenParams::default(), OpenMode::Read).unwrap();
    let mut back = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let (n, eof) = f.read(&mut buf).unwrap();
        back.extend_from_slice(&buf[..n]);
        if eof {
            break;
        }
    }
    assert_eq!(back, data);
}

// ---------------------------------------------------------------
// raw image inspection for the structural invariants

struct RawImage {
    bytes: Vec<u8>,
}

impl RawImage {
    fn load(path: &PathBuf) -> RawImage {
        RawImage {
            bytes: std::fs::read(path).unwrap(),
        }
    }

    fn sector(&self, t: u8, s: u8) -> &[u8] {
        let lba = D64.lba(t, s).unwrap() as usize;
        &self.bytes[lba * 256..(lba + 1) * 256]
    }

    fn bam_entry(&self, track: u8) -> (u8, u32) {
        let bam = self.sector(18, 0);
        let off = 4 + (track as usize - 1) * 4;
        let count = bam[off];
        let sectors = D64.sectors_in_track(track).unwrap();
        let mut bits = 0;
        for s in 0..sectors {
            if bam[off + 1 + (s >> 3) as usize] & (1 << (s & 7)) != 0 {
                bits += 1;
            }
        }
        (count, bits)
    }

    fn allocated(&self) -> BTreeSet<(u8, u8)> {
        let mut set = BTreeSet::new();
        for t in 1..=35u8 {
            let bam = self.sector(18, 0);
            let off = 4 + (t as usize - 1) * 4;
            for s in 0..D64.sectors_in_track(t).unwrap() {
                if bam[off + 1 + (s >> 3) as usize] & (1 << (s & 7)) == 0 {
                    set.insert((t, s));
                }
            }
        }
        set
    }

    fn chain(&self, mut t: u8, mut s: u8) -> Vec<(u8, u8)> {
        let mut out = Vec::new();
        while t != 0 {
            out.push((t, s));
            let sec = self.sector(t, s);
            t = sec[0];
            s = sec[1];
        }
        out
    }
}

/// BAM coherence: after create/delete sequences the free counts
/// equal the bitmap popcount and every allocated sector is reachable
/// from exactly one chain.
#[test]
fn bam_coherence_after_create_delete() {
    let path = blank_d64("cbmfs-coherence.d64");
    // strict structural accounting: DOS leak emulation off
    let cfg = Config::with_flags(
        false,
        DosBugs {
            file254: false,
            new_rel_size: false,
            new_side_sector: false,
        },
    );
    let provider = DiProvider::new();
    let ep = provider.endpoint(path.to_str().unwrap(), &cfg).unwrap();
    ep.format(b"COH,04").unwrap();

    {
        let mut root = ep.root().unwrap();
        let mut a = root
            .create_child(b"AAA", &OpenParams::default(), OpenMode::Write)
            .unwrap();
        a.write(&vec![1u8; 600], true).unwrap();
        a.close();
        drop(a);

        let mut b = root
            .create_child(b"BBB", &OpenParams::default(), OpenMode::Write)
            .unwrap();
        b.write(&vec![2u8; 100], true).unwrap();
        b.close();
        drop(b);

        let rel = OpenParams {
            filetype: FileType::Rel,
            recordlen: 50,
        };
        let mut r = root.create_child(b"RRR", &rel, OpenMode::ReadWrite).unwrap();
        assert_eq!(r.position(9), Err(CbmError::RecordNotPresent));
        r.write(b"X", true).unwrap();
        r.close();
        drop(r);

        // scratch AAA again
        let mut root2 = ep.root().unwrap();
        while let Some(mut e) = root2.next_entry().unwrap() {
            if e.meta().name == b"AAA".to_vec() {
                e.scratch().unwrap();
            }
        }
    }
    drop(ep);

    let img = RawImage::load(&path);

    // free counts match the bitmaps
    for t in 1..=35u8 {
        let (count, bits) = img.bam_entry(t);
        assert_eq!(count, bits as u8, "track {} count mismatch", t);
    }

    // reachability: directory chain, file chains, side sectors
    let mut expected: BTreeSet<(u8, u8)> = BTreeSet::new();
    expected.insert((18, 0));
    let mut slots = Vec::new();
    for (t, s) in img.chain(18, 1) {
        expected.insert((t, s));
        let sec = img.sector(t, s).to_vec();
        for i in 0..8 {
            let slot = &sec[i * 32..(i + 1) * 32];
            if slot[2] != 0 {
                slots.push((slot[2], slot[3], slot[4], slot[21], slot[22]));
            }
        }
    }
    for (_type, st, ss, sst, sss) in slots {
        for ts in img.chain(st, ss) {
            expected.insert(ts);
        }
        if sst != 0 {
            for ts in img.chain(sst, sss) {
                expected.insert(ts);
            }
        }
    }

    assert_eq!(img.allocated(), expected);
}

/// REL expansion arithmetic: expanding an empty REL file to record N
/// allocates the computed number of data blocks and side sectors.
#[test]
fn rel_expansion_block_arithmetic() {
    let path = blank_d64("cbmfs-relexpand.d64");
    let cfg = Config::default();
    let provider = DiProvider::new();
    let ep = provider.endpoint(path.to_str().unwrap(), &cfg).unwrap();
    ep.format(b"EXP,05").unwrap();

    let rel = OpenParams {
        filetype: FileType::Rel,
        recordlen: 100,
    };
    {
        let mut root = ep.root().unwrap();
        let mut r = root.create_child(b"BIG", &rel, OpenMode::ReadWrite).unwrap();
        // records 0..19: 20 * 100 bytes = 2000 bytes
        assert_eq!(r.position(19), Err(CbmError::RecordNotPresent));
        r.write(b"Z", true).unwrap();
        r.close();
    }
    drop(ep);

    let img = RawImage::load(&path);
    // ceil(2000/254) = 8 data blocks, one side sector
    let mut data_blocks = 0;
    let mut ss = (0u8, 0u8);
    for (t, s) in img.chain(18, 1) {
        let sec = img.sector(t, s).to_vec();
        for i in 0..8 {
            let slot = &sec[i * 32..(i + 1) * 32];
            if slot[2] != 0 {
                data_blocks = img.chain(slot[3], slot[4]).len();
                ss = (slot[21], slot[22]);
            }
        }
    }
    assert_eq!(data_blocks, 8);
    assert_ne!(ss.0, 0);
    let side = img.sector(ss.0, ss.1);
    assert_eq!(side[2], 0, "first side sector has group index 0");
    assert_eq!(side[3], 100, "record length recorded in the side sector");
    // eight data pointers -> high-water byte 16 + 2*8 - 1
    assert_eq!(side[1], 16 + 2 * 8 - 1);
}
