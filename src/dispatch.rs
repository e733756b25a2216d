//! The command dispatcher: one routine per wire opcode.
//!
//! Every routine receives the server context and the request packet
//! and produces a reply packet.  Errors never propagate further than
//! this layer; they become the CBM error code in the reply.
//!
//! Payload layouts (after the three header bytes):
//! open family   `drive | name NUL | options`
//! DELETE/RMDIR  `drive | pattern NUL [pattern NUL ...]`
//! MOVE          `drive | newname NUL | oldname NUL`
//! COPY          `drive | target NUL | source NUL [source NUL ...]`
//! CHDIR/MKDIR   `drive | path NUL`
//! FORMAT        `drive | name[,id] NUL`
//! BLOCK         `drive | cmd | track lo,hi | sector lo,hi | channel`
//! ASSIGN        `drive | [provider:]path NUL`
//! POSITION      `record lo,hi`
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::{debug, info, warn};

use crate::channel::ChannelTable;
use crate::charset::{convert, Charset};
use crate::config::Config;
use crate::drive::{DriveTable, MAX_DRIVE};
use crate::error::CbmError;
use crate::handler::HandlerRegistry;
use crate::name::{parse_filename, OpenParams, ParseHint};
use crate::provider::{EndpointRef, OpenMode, ProviderRegistry, ServerFile};
use crate::resolver::{resolve_path, scan_dir, Resolved};
use crate::wire::{self, Packet};

/// Payload bytes of a READ reply chunk.
const READ_CHUNK: usize = 224;
/// The COPY shuttle buffer size.
const COPY_SHUTTLE: usize = 8192;

/// Everything the dispatcher operates on: registries, drive table,
/// channel table and settings.  Initialised at startup, torn down at
/// shutdown.
pub struct ServerContext {
    /// the provider catalogue
    pub providers: ProviderRegistry,
    /// the filename-wrapping handler chain
    pub handlers: HandlerRegistry,
    /// drive number to endpoint mapping
    pub drives: DriveTable,
    /// channel number to open file mapping
    pub channels: ChannelTable,
    /// server settings
    pub config: Config,
    /// current wire charset
    pub charset: Charset,
}

impl ServerContext {
    /// A context with the standard providers and handlers.
    pub fn new(config: Config) -> ServerContext {
        ServerContext {
            providers: ProviderRegistry::standard(),
            handlers: HandlerRegistry::standard(),
            drives: DriveTable::new(),
            channels: ChannelTable::new(),
            config,
            charset: Charset::Petscii,
        }
    }

    /// Assign a drive from a `[provider:]path` specification, as used
    /// by the ASSIGN command and the `-A` command line flag.
    pub fn assign_spec(&mut self, drive: u8, spec: &str) -> Result<(), CbmError> {
        let (provider_name, path) = match spec.split_once(':') {
            Some((p, rest)) if self.providers.by_name(p).is_some() => (p, rest),
            _ => ("fs", spec),
        };
        let provider = self
            .providers
            .by_name(provider_name)
            .ok_or(CbmError::DriveNotReady)?;
        let ep = provider.endpoint(path, &self.config)?;
        self.drives.assign(drive, ep)?;
        info!("drive {} assigned to {}:{}", drive, provider_name, path);
        Ok(())
    }
}

/// Split a NUL-separated payload into its fields.
fn split_nul(payload: &[u8]) -> Vec<&[u8]> {
    let mut fields: Vec<&[u8]> = payload.split(|c| *c == 0).collect();
    while fields.last().map_or(false, |f| f.is_empty()) {
        fields.pop();
    }
    fields
}

/// The endpoint and current directory of a drive.
fn drive_info(ctx: &ServerContext, drive: Option<u8>) -> Result<(EndpointRef, Vec<u8>), CbmError> {
    let n = drive.ok_or(CbmError::DriveNotReady)?;
    let d = ctx.drives.find(n).ok_or(CbmError::DriveNotReady)?;
    Ok((d.endpoint.clone(), d.cdpath.clone()))
}

fn effective_drive(payload_drive: u8, parsed: Option<u8>) -> Option<u8> {
    parsed.or(if payload_drive <= MAX_DRIVE {
        Some(payload_drive)
    } else {
        None
    })
}

/// Resolve a raw name against its drive.
fn resolve_name(
    ctx: &ServerContext,
    payload_drive: u8,
    raw: &[u8],
    hint: ParseHint,
) -> Result<(Resolved, OpenParams, Option<u8>), CbmError> {
    let parsed = parse_filename(raw, hint)?;
    let pars = OpenParams::from_nameinfo(&parsed);
    let drive = effective_drive(payload_drive, parsed.drive);
    let (ep, cdpath) = drive_info(ctx, drive)?;
    let resolved = resolve_path(
        &ctx.providers,
        &ctx.handlers,
        &ctx.config,
        &ep,
        &cdpath,
        &parsed.name,
        ctx.charset,
    )?;
    Ok((resolved, pars, drive))
}

/// Open a file for the given mode, applying the existence rules.
/// Returns the open file and the status code for the reply.
fn open_file(
    ctx: &ServerContext,
    payload_drive: u8,
    raw_name: &[u8],
    options: Option<&[u8]>,
    mode: OpenMode,
) -> Result<(Box<dyn ServerFile>, CbmError), CbmError> {
    let parsed = parse_filename(raw_name, ParseHint::File)?;
    let mut pars = OpenParams::from_nameinfo(&parsed);
    if let Some(opts) = options {
        if !opts.is_empty() {
            let o = OpenParams::parse(opts);
            if o.filetype != crate::wire::FileType::Unknown {
                pars.filetype = o.filetype;
            }
            if o.recordlen != 0 {
                pars.recordlen = o.recordlen;
            }
        }
    }

    let drive = effective_drive(payload_drive, parsed.drive);
    let (ep, cdpath) = drive_info(ctx, drive)?;
    let resolved = resolve_path(
        &ctx.providers,
        &ctx.handlers,
        &ctx.config,
        &ep,
        &cdpath,
        &parsed.name,
        ctx.charset,
    )?;
    let mut dir = resolved.dir;
    let pattern = resolved.pattern;

    let advanced = ctx.config.advanced_wildcards;
    let found = scan_dir(&ctx.handlers, &mut dir, &pattern, ctx.charset, advanced)?;

    let has_wildcard = pattern.contains(&b'*') || pattern.contains(&b'?');
    let create = |dir: &mut Box<dyn ServerFile>| -> Result<Box<dyn ServerFile>, CbmError> {
        if has_wildcard {
            return Err(CbmError::SyntaxPattern);
        }
        let name = convert(&pattern, ctx.charset, dir.meta().cset);
        dir.create_child(&name, &pars, mode)
    };

    let (file, code) = match found {
        Some(mut f) => match mode {
            OpenMode::Write => return Err(CbmError::FileExists),
            OpenMode::Overwrite => {
                f.scratch()?;
                let f = create(&mut dir)?;
                (f, CbmError::Ok)
            }
            _ => {
                let code = f.open(&pars, mode)?;
                (f, code)
            }
        },
        None => {
            if mode.requires_existing() {
                warn!("unable to open {:?}: file not found", raw_name);
                return Err(CbmError::FileNotFound);
            }
            if mode == OpenMode::Directory {
                return Err(CbmError::DirNotFound);
            }
            let f = create(&mut dir)?;
            (f, CbmError::Ok)
        }
    };

    // REL opens report the record length
    let code = if code == CbmError::Ok && file.meta().recordlen > 0 {
        CbmError::OpenRel
    } else {
        code
    };
    Ok((file, code))
}

fn cmd_open(ctx: &mut ServerContext, packet: &Packet, mode: OpenMode) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(CbmError, Vec<u8>), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        let mut name: &[u8] = fields.first().copied().unwrap_or(&[]);
        let options = fields.get(1).copied();

        if mode == OpenMode::Directory {
            // "$", "$0:pattern"
            if name.first() == Some(&b'$') {
                name = &name[1..];
            }
            let (resolved, pars, _) = resolve_name(ctx, *drv, name, ParseHint::File)?;
            let mut dir = resolved.dir;
            dir.set_pattern(&resolved.pattern, ctx.charset);
            dir.open(&pars, OpenMode::Directory)?;
            ctx.channels.set(chan, dir)?;
            return Ok((CbmError::Ok, Vec::new()));
        }

        let (file, code) = open_file(ctx, *drv, name, options, mode)?;
        let extra = if code == CbmError::OpenRel {
            vec![file.meta().recordlen, 0]
        } else {
            Vec::new()
        };
        ctx.channels.set(chan, file)?;
        Ok((code, extra))
    })();

    match res {
        Ok((code, extra)) => Packet::reply(chan, code, &extra),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_read(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    match ctx.channels.get_mut(chan) {
        Ok(file) => {
            let mut buf = [0u8; READ_CHUNK];
            match file.read(&mut buf) {
                Ok((n, eof)) => Packet::data(chan, buf[..n].to_vec(), eof),
                Err(e) => Packet::reply(chan, e, &[]),
            }
        }
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_write(ctx: &mut ServerContext, packet: &Packet, eof: bool) -> Packet {
    let chan = packet.channel;
    let res = match ctx.channels.get_mut(chan) {
        Ok(file) => file.write(&packet.payload, eof),
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => {
            // a failed write leaves the file in an ambiguous state;
            // close it server-side
            if let Ok(mut file) = ctx.channels.take(chan) {
                file.close();
            }
            Packet::reply(chan, e, &[])
        }
    }
}

fn cmd_position(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        if packet.payload.len() < 2 {
            return Err(CbmError::SyntaxInval);
        }
        let record = u16::from_le_bytes([packet.payload[0], packet.payload[1]]);
        ctx.channels.get_mut(chan)?.position(record)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_close(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    match ctx.channels.take(chan) {
        Ok(mut file) => {
            let status = file.close();
            Packet::reply(chan, status.code, &status.extra)
        }
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_delete(ctx: &mut ServerContext, packet: &Packet, rmdir: bool) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<u8, CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let mut count: u32 = 0;
        for raw in split_nul(rest) {
            if raw.is_empty() {
                continue;
            }
            let (resolved, _, _) = resolve_name(ctx, *drv, raw, ParseHint::Command)?;
            let mut dir = resolved.dir;
            loop {
                let found = scan_dir(
                    &ctx.handlers,
                    &mut dir,
                    &resolved.pattern,
                    ctx.charset,
                    ctx.config.advanced_wildcards,
                )?;
                let mut entry = match found {
                    Some(e) => e,
                    None => break,
                };
                if rmdir != entry.meta().is_dir {
                    continue;
                }
                if rmdir {
                    entry.rmdir()?;
                } else {
                    entry.scratch()?;
                }
                count += 1;
            }
        }
        Ok(count.min(99) as u8)
    })();
    match res {
        Ok(count) => Packet::reply(chan, CbmError::Scratched, &[count]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_move(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        if fields.len() < 2 {
            return Err(CbmError::SyntaxInval);
        }
        let new_info = parse_filename(fields[0], ParseHint::File)?;
        let old_info = parse_filename(fields[1], ParseHint::File)?;

        let new_drive = effective_drive(*drv, new_info.drive);
        let old_drive = effective_drive(*drv, old_info.drive);
        if new_drive != old_drive {
            // a rename never crosses drives
            return Err(CbmError::DriveNotReady);
        }

        if new_info.name.iter().any(|c| matches!(*c, b'*' | b'?')) {
            return Err(CbmError::SyntaxPattern);
        }

        let (ep, cdpath) = drive_info(ctx, old_drive)?;
        let resolved = resolve_path(
            &ctx.providers,
            &ctx.handlers,
            &ctx.config,
            &ep,
            &cdpath,
            &old_info.name,
            ctx.charset,
        )?;
        let mut dir = resolved.dir;
        let mut file = scan_dir(
            &ctx.handlers,
            &mut dir,
            &resolved.pattern,
            ctx.charset,
            ctx.config.advanced_wildcards,
        )?
        .ok_or(CbmError::FileNotFound)?;

        debug!(
            "rename {:?} to {:?}",
            String::from_utf8_lossy(&old_info.name),
            String::from_utf8_lossy(&new_info.name)
        );
        file.rename(&new_info.name, ctx.charset)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_copy(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        if fields.len() < 2 {
            return Err(CbmError::SyntaxInval);
        }

        let (mut target, _) = open_file(ctx, *drv, fields[0], None, OpenMode::Overwrite)?;

        let mut shuttle = vec![0u8; COPY_SHUTTLE];
        let sources = &fields[1..];
        for (si, source) in sources.iter().enumerate() {
            let (mut src, _) = open_file(ctx, *drv, source, None, OpenMode::Read)?;
            let last_source = si + 1 == sources.len();
            loop {
                let (n, eof) = src.read(&mut shuttle)?;
                if n > 0 || (eof && last_source) {
                    target.write(&shuttle[..n], eof && last_source)?;
                }
                if eof {
                    break;
                }
            }
            src.close();
        }
        let status = target.close();
        if status.code.is_success() {
            Ok(())
        } else {
            Err(status.code)
        }
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_chdir(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        let raw = fields.first().copied().unwrap_or(&[]);
        let info = parse_filename(raw, ParseHint::Command)?;
        let drive = effective_drive(*drv, info.drive).ok_or(CbmError::DriveNotReady)?;
        let (ep, cdpath) = drive_info(ctx, Some(drive))?;

        // walking the full path proves every component is a directory
        let mut walk = info.name.clone();
        if walk.last() != Some(&b'/') {
            walk.push(b'/');
        }
        resolve_path(
            &ctx.providers,
            &ctx.handlers,
            &ctx.config,
            &ep,
            &cdpath,
            &walk,
            ctx.charset,
        )?;

        let new_cd = if info.name.first() == Some(&b'/') {
            info.name.clone()
        } else {
            let mut cd = cdpath;
            if cd.last() != Some(&b'/') {
                cd.push(b'/');
            }
            cd.extend_from_slice(&info.name);
            cd
        };
        ctx.drives.set_cdpath(drive, new_cd)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_mkdir(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        let raw = fields.first().copied().unwrap_or(&[]);
        let (resolved, _, _) = resolve_name(ctx, *drv, raw, ParseHint::Command)?;
        if resolved
            .pattern
            .iter()
            .any(|c| matches!(*c, b'*' | b'?'))
        {
            return Err(CbmError::SyntaxPattern);
        }
        let mut dir = resolved.dir;
        let name = convert(&resolved.pattern, ctx.charset, dir.meta().cset);
        dir.mkdir(&name)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_block(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(CbmError, Vec<u8>), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let (ep, _) = drive_info(ctx, effective_drive(*drv, None))?;
        let result = ep.direct(rest)?;
        if let Some(file) = result.file {
            let bind = rest
                .get(wire::block_par::CHANNEL)
                .copied()
                .unwrap_or(chan);
            ctx.channels.set(bind, file)?;
        }
        Ok((result.code, result.payload))
    })();
    match res {
        Ok((code, payload)) => Packet::reply(chan, code, &payload),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_format(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        let fields = split_nul(rest);
        let raw = fields.first().copied().unwrap_or(&[]);
        // the format argument keeps its comma-separated ID, so only
        // the command/drive prefix in front of the colon is stripped
        let (prefix, name) = match raw.iter().position(|c| *c == b':') {
            Some(i) => (&raw[..i], &raw[i + 1..]),
            None => (&raw[..0], raw),
        };
        let parsed_drive = {
            let digits: &[u8] = &prefix
                [prefix.iter().position(|c| c.is_ascii_digit()).unwrap_or(prefix.len())..];
            if digits.is_empty() || !digits.iter().all(|c| c.is_ascii_digit()) || digits.len() > 2 {
                None
            } else {
                let v = digits.iter().fold(0u16, |a, d| a * 10 + (*d - b'0') as u16);
                if v <= MAX_DRIVE as u16 { Some(v as u8) } else { None }
            }
        };
        let (ep, _) = drive_info(ctx, effective_drive(*drv, parsed_drive))?;
        ep.format(name)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_assign(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let res = (|| -> Result<(), CbmError> {
        let (drv, rest) = packet
            .payload
            .split_first()
            .ok_or(CbmError::SyntaxInval)?;
        if *drv > MAX_DRIVE {
            return Err(CbmError::SyntaxInval);
        }
        let fields = split_nul(rest);
        let spec = fields.first().copied().unwrap_or(&[]);
        let spec = String::from_utf8_lossy(&convert(spec, ctx.charset, Charset::Ascii))
            .into_owned();
        ctx.assign_spec(*drv, &spec)
    })();
    match res {
        Ok(()) => Packet::reply(chan, CbmError::Ok, &[]),
        Err(e) => Packet::reply(chan, e, &[]),
    }
}

fn cmd_charset(ctx: &mut ServerContext, packet: &Packet) -> Packet {
    let chan = packet.channel;
    let fields = split_nul(&packet.payload);
    let name = String::from_utf8_lossy(fields.first().copied().unwrap_or(&[])).into_owned();
    match Charset::by_name(&name) {
        Some(cs) => {
            ctx.charset = cs;
            Packet::reply(chan, CbmError::Ok, &[])
        }
        None => Packet::reply(chan, CbmError::SyntaxInval, &[]),
    }
}

/// Dispatch one request packet.  Returns None for packets that take
/// no reply (TERM diagnostics, stray syncs).
pub fn dispatch(ctx: &mut ServerContext, packet: &Packet) -> Option<Packet> {
    debug!("dispatch cmd={} chan={}", packet.cmd, packet.channel);
    let reply = match packet.cmd {
        wire::FS_TERM => {
            info!(
                "device: {}",
                String::from_utf8_lossy(&packet.payload).trim_end()
            );
            return None;
        }
        wire::FS_SYNC => return None,
        wire::FS_OPEN_RD => cmd_open(ctx, packet, OpenMode::Read),
        wire::FS_OPEN_WR => cmd_open(ctx, packet, OpenMode::Write),
        wire::FS_OPEN_RW => cmd_open(ctx, packet, OpenMode::ReadWrite),
        wire::FS_OPEN_AP => cmd_open(ctx, packet, OpenMode::Append),
        wire::FS_OPEN_OW => cmd_open(ctx, packet, OpenMode::Overwrite),
        wire::FS_OPEN_DR => cmd_open(ctx, packet, OpenMode::Directory),
        wire::FS_READ => cmd_read(ctx, packet),
        wire::FS_WRITE => cmd_write(ctx, packet, false),
        wire::FS_WRITE_EOF => cmd_write(ctx, packet, true),
        wire::FS_POSITION => cmd_position(ctx, packet),
        wire::FS_CLOSE => cmd_close(ctx, packet),
        wire::FS_DELETE => cmd_delete(ctx, packet, false),
        wire::FS_RMDIR => cmd_delete(ctx, packet, true),
        wire::FS_MOVE => cmd_move(ctx, packet),
        wire::FS_COPY => cmd_copy(ctx, packet),
        wire::FS_CHDIR => cmd_chdir(ctx, packet),
        wire::FS_MKDIR => cmd_mkdir(ctx, packet),
        wire::FS_BLOCK => cmd_block(ctx, packet),
        wire::FS_FORMAT => cmd_format(ctx, packet),
        wire::FS_ASSIGN => cmd_assign(ctx, packet),
        wire::FS_CHARSET => cmd_charset(ctx, packet),
        wire::FS_INITIALIZE => Packet::reply(packet.channel, CbmError::Ok, &[]),
        wire::FS_RESET => {
            ctx.channels.close_all();
            ctx.charset = Charset::Petscii;
            Packet::reply(packet.channel, CbmError::Ok, &[])
        }
        wire::FS_GETDATIM => {
            let date = crate::provider::fs::wire_date(std::time::SystemTime::now());
            Packet::reply(packet.channel, CbmError::Ok, &date)
        }
        wire::FS_INFO => {
            let text = format!("cbmfs {}", env!("CARGO_PKG_VERSION"));
            Packet::reply(packet.channel, CbmError::Ok, text.as_bytes())
        }
        wire::FS_SETOPT => Packet::reply(packet.channel, CbmError::Ok, &[]),
        other => {
            warn!("unknown command {}", other);
            Packet::reply(packet.channel, CbmError::Fault, &[])
        }
    };
    Some(reply)
}
