//! Dispatcher-level tests of the command surface against a local
//! filesystem drive: assign, chdir, open/write/close, rename, copy
//! and the error replies for unassigned drives.

use std::path::PathBuf;

use pretty_assertions::assert_eq;

use cbmfs::config::Config;
use cbmfs::dispatch::{dispatch, ServerContext};
use cbmfs::error::CbmError;
use cbmfs::wire::{self, Packet};

fn test_base(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn send(ctx: &mut ServerContext, cmd: u8, chan: u8, payload: Vec<u8>) -> Packet {
    dispatch(ctx, &Packet::new(cmd, chan, payload)).expect("expected a reply")
}

fn named_payload(drive: u8, name: &[u8]) -> Vec<u8> {
    let mut p = vec![drive];
    p.extend_from_slice(name);
    p.push(0);
    p
}

#[test]
fn assign_chdir_open_inside_base() {
    let base = test_base("cbmfs-cmd-assign");
    std::fs::create_dir_all(base.join("sub")).unwrap();

    let mut ctx = ServerContext::new(Config::default());

    // ASSIGN 5 fs:<base>
    let spec = format!("fs:{}", base.display());
    let reply = send(
        &mut ctx,
        wire::FS_ASSIGN,
        wire::FSFD_CMD,
        named_payload(5, spec.as_bytes()),
    );
    assert_eq!(reply.payload[0], 0);

    // CHDIR 5:SUB (PETSCII folds onto the lowercase OS name)
    let reply = send(
        &mut ctx,
        wire::FS_CHDIR,
        wire::FSFD_CMD,
        named_payload(5, b"SUB"),
    );
    assert_eq!(reply.payload[0], 0);

    // OPEN 5:F for writing, then write and close
    let reply = send(&mut ctx, wire::FS_OPEN_WR, 3, named_payload(5, b"F"));
    assert_eq!(reply.payload[0], 0);
    let reply = send(&mut ctx, wire::FS_WRITE_EOF, 3, b"payload".to_vec());
    assert_eq!(reply.payload[0], 0);
    let reply = send(&mut ctx, wire::FS_CLOSE, 3, vec![]);
    assert_eq!(reply.payload[0], 0);

    // the file landed below the base, inside sub/
    let written = std::fs::read(base.join("sub").join("f")).unwrap();
    assert_eq!(written, b"payload".to_vec());

    std::fs::remove_dir_all(base).unwrap();
}

#[test]
fn unassigned_drive_is_not_ready() {
    let mut ctx = ServerContext::new(Config::default());
    let reply = send(&mut ctx, wire::FS_OPEN_RD, 2, named_payload(7, b"ANY"));
    assert_eq!(reply.payload[0], CbmError::DriveNotReady.code());
}

#[test]
fn external_provider_assignment_is_refused() {
    let mut ctx = ServerContext::new(Config::default());
    let reply = send(
        &mut ctx,
        wire::FS_ASSIGN,
        wire::FSFD_CMD,
        named_payload(3, b"tcp:localhost:6400"),
    );
    assert_eq!(reply.payload[0], CbmError::DriveNotReady.code());
}

#[test]
fn move_and_copy_files() {
    let base = test_base("cbmfs-cmd-move");
    std::fs::write(base.join("one"), b"first").unwrap();
    std::fs::write(base.join("two"), b"second").unwrap();

    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, base.to_str().unwrap()).unwrap();

    // RENAME: renamed\0one
    let mut payload = vec![0u8];
    payload.extend_from_slice(b"RENAMED");
    payload.push(0);
    payload.extend_from_slice(b"ONE");
    payload.push(0);
    let reply = send(&mut ctx, wire::FS_MOVE, wire::FSFD_CMD, payload);
    assert_eq!(reply.payload[0], 0);
    assert!(base.join("renamed").exists());
    assert!(!base.join("one").exists());

    // COPY: both=renamed,two
    let mut payload = vec![0u8];
    payload.extend_from_slice(b"BOTH");
    payload.push(0);
    payload.extend_from_slice(b"RENAMED");
    payload.push(0);
    payload.extend_from_slice(b"TWO");
    payload.push(0);
    let reply = send(&mut ctx, wire::FS_COPY, wire::FSFD_CMD, payload);
    assert_eq!(reply.payload[0], 0);
    let both = std::fs::read(base.join("both")).unwrap();
    assert_eq!(both, b"firstsecond".to_vec());

    std::fs::remove_dir_all(base).unwrap();
}

#[test]
fn delete_reports_the_count() {
    let base = test_base("cbmfs-cmd-delete");
    std::fs::write(base.join("a.tmp"), b"x").unwrap();
    std::fs::write(base.join("b.tmp"), b"y").unwrap();
    std::fs::write(base.join("keep"), b"z").unwrap();

    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, base.to_str().unwrap()).unwrap();

    let reply = send(
        &mut ctx,
        wire::FS_DELETE,
        wire::FSFD_CMD,
        named_payload(0, b"?.TMP"),
    );
    assert_eq!(reply.payload[0], CbmError::Scratched.code());
    assert_eq!(reply.payload[1], 2);
    assert!(base.join("keep").exists());
    assert!(!base.join("a.tmp").exists());

    std::fs::remove_dir_all(base).unwrap();
}

#[test]
fn mkdir_rmdir_round_trip() {
    let base = test_base("cbmfs-cmd-mkdir");
    let mut ctx = ServerContext::new(Config::default());
    ctx.assign_spec(0, base.to_str().unwrap()).unwrap();

    let reply = send(
        &mut ctx,
        wire::FS_MKDIR,
        wire::FSFD_CMD,
        named_payload(0, b"NEWDIR"),
    );
    assert_eq!(reply.payload[0], 0);
    assert!(base.join("newdir").is_dir());

    let reply = send(
        &mut ctx,
        wire::FS_RMDIR,
        wire::FSFD_CMD,
        named_payload(0, b"NEWDIR"),
    );
    assert_eq!(reply.payload[0], CbmError::Scratched.code());
    assert!(!base.join("newdir").exists());

    std::fs::remove_dir_all(base).unwrap();
}

#[test]
fn charset_switch_and_reset() {
    let mut ctx = ServerContext::new(Config::default());

    let mut payload = b"ASCII".to_vec();
    payload.push(0);
    let reply = send(&mut ctx, wire::FS_CHARSET, wire::FSFD_CMD, payload);
    assert_eq!(reply.payload[0], 0);

    let reply = send(&mut ctx, wire::FS_CHARSET, wire::FSFD_CMD, b"EBCDIC\0".to_vec());
    assert_eq!(reply.payload[0], CbmError::SyntaxInval.code());

    let reply = send(&mut ctx, wire::FS_RESET, wire::FSFD_CMD, vec![]);
    assert_eq!(reply.payload[0], 0);
}
