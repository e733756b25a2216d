//! Host file name and command parsing.
//!
//! A raw name from the wire has the general shape
//! `[COMMAND][drive][:]name[,option[,option]]`.  The drive is a
//! decimal number 0..15; commands are matched against a closed table
//! by a prefix of at least one character, and trailing letters after a
//! fully matched command word are ignored (`INITIALIZEXYZ` still
//! parses as INITIALIZE).  The `,R/W/A/M` option selects the access
//! mode, `,P/S/U/L` the file type, and an `,L` type may be followed by
//! the record length, either as decimal digits or as a single raw
//! byte.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use nom::{
    bytes::complete::take_while,
    character::is_digit,
    IResult,
};

use crate::error::CbmError;
use crate::wire::FileType;

/// Whether the buffer being parsed came from a command channel or
/// from an OPEN.  Only command-channel names are matched against the
/// command table, so a file named `I` stays openable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseHint {
    /// The name belongs to an OPEN; never match commands.
    File,
    /// The name is a command string; match the command table first.
    Command,
}

/// The closed set of commands understood in a name buffer.  A plain
/// file name parses to no command at all.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// I - re-read the disk status
    Initialize,
    /// V - validate/collect the BAM
    Validate,
    /// S - scratch files
    Scratch,
    /// R - rename a file
    Rename,
    /// C - copy files
    Copy,
    /// CD - change the current directory of a drive
    Chdir,
    /// MD - create a directory
    Mkdir,
    /// RD - remove a directory
    Rmdir,
    /// A - assign a provider to a drive
    Assign,
    /// U1 - block read into a channel buffer
    BlockU1,
    /// U2 - block write from a channel buffer
    BlockU2,
    /// B-A - allocate a block
    BlockAllocate,
    /// B-F - free a block
    BlockFree,
}

/// word/command pairs, first match wins
const COMMANDS: &[(&[u8], Command)] = &[
    (b"INITIALIZE", Command::Initialize),
    (b"VALIDATE", Command::Validate),
    (b"SCRATCH", Command::Scratch),
    (b"RENAME", Command::Rename),
    (b"COPY", Command::Copy),
    (b"CD", Command::Chdir),
    (b"CHDIR", Command::Chdir),
    (b"MD", Command::Mkdir),
    (b"MKDIR", Command::Mkdir),
    (b"RD", Command::Rmdir),
    (b"RMDIR", Command::Rmdir),
    (b"ASSIGN", Command::Assign),
];

/// The result of parsing a raw host name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NameInfo {
    /// Drive number 0..15, or None when the name carried none
    pub drive: Option<u8>,
    /// Parsed command, None for plain names
    pub cmd: Option<Command>,
    /// Access mode letter (`R`, `W`, `A`, `M`), 0 when absent
    pub access: u8,
    /// File type from the `,P/S/U/L` option
    pub filetype: Option<FileType>,
    /// Record length from an `,L` option
    pub recordlen: Option<u8>,
    /// The remaining file name or pattern
    pub name: Vec<u8>,
}

impl NameInfo {
    fn empty() -> NameInfo {
        NameInfo {
            drive: None,
            cmd: None,
            access: 0,
            filetype: None,
            recordlen: None,
            name: Vec::new(),
        }
    }
}

fn is_letter(c: u8) -> bool {
    c.is_ascii_alphabetic()
}

/// Match the input prefix against the command table.
///
/// A command matches when at least one character agrees and either the
/// input stops being a letter or the command word is exhausted.  Any
/// further letters behind an exhausted command word are skipped.
/// Returns the command and the rest of the input.
fn match_command(input: &[u8]) -> Option<(Command, &[u8])> {
    for (word, cmd) in COMMANDS {
        let mut i = 0;
        while i < input.len() && i < word.len() && input[i].to_ascii_uppercase() == word[i] {
            i += 1;
        }
        if i == 0 {
            continue;
        }
        if i == word.len() {
            // command word exhausted: skip trailing letters
            let mut rest = i;
            while rest < input.len() && is_letter(input[rest]) {
                rest += 1;
            }
            return Some((*cmd, &input[rest..]));
        }
        if i == input.len() || !is_letter(input[i]) {
            return Some((*cmd, &input[i..]));
        }
    }
    None
}

/// Match the block command family (`U1`, `U2`, `B-A`, `B-F`).
fn match_block_command(input: &[u8]) -> Option<(Command, &[u8])> {
    match input {
        [b'U' | b'u', b'1', rest @ ..] => Some((Command::BlockU1, rest)),
        [b'U' | b'u', b'2', rest @ ..] => Some((Command::BlockU2, rest)),
        [b'B' | b'b', b'-', b'A' | b'a', rest @ ..] => Some((Command::BlockAllocate, rest)),
        [b'B' | b'b', b'-', b'F' | b'f', rest @ ..] => Some((Command::BlockFree, rest)),
        _ => None,
    }
}

fn drive_number(input: &[u8]) -> IResult<&[u8], Option<u8>> {
    let (rest, digits) = take_while(is_digit)(input)?;
    if digits.is_empty() || digits.len() > 2 {
        return Ok((input, None));
    }
    let mut v: u16 = 0;
    for d in digits {
        v = v * 10 + (d - b'0') as u16;
    }
    if v > 15 {
        return Ok((input, None));
    }
    Ok((rest, Some(v as u8)))
}

/// Parse one `,X` option part into the NameInfo.
fn apply_option(info: &mut NameInfo, part: &[u8], last_was_rel: bool) -> Result<bool, CbmError> {
    if part.is_empty() {
        return Ok(false);
    }
    if last_was_rel {
        // record length: decimal digits or one raw byte
        if part.iter().all(|c| c.is_ascii_digit()) {
            let mut v: u32 = 0;
            for d in part {
                v = v * 10 + (*d - b'0') as u32;
            }
            if v == 0 || v > 254 {
                return Err(CbmError::OverflowInRecord);
            }
            info.recordlen = Some(v as u8);
            return Ok(false);
        }
        if part.len() == 1 {
            info.recordlen = Some(part[0]);
            return Ok(false);
        }
        return Err(CbmError::SyntaxInval);
    }
    match part[0].to_ascii_uppercase() {
        b'R' if part.len() == 1 => info.access = b'R',
        b'W' if part.len() == 1 => info.access = b'W',
        b'A' if part.len() == 1 => info.access = b'A',
        b'M' if part.len() == 1 => info.access = b'M',
        b'P' => info.filetype = Some(FileType::Prg),
        b'S' => info.filetype = Some(FileType::Seq),
        b'U' => info.filetype = Some(FileType::Usr),
        b'L' => {
            info.filetype = Some(FileType::Rel);
            return Ok(true);
        }
        _ => return Err(CbmError::SyntaxInval),
    }
    Ok(false)
}

/// Split a raw host name into drive, command, access mode, file type
/// options and the residual file name.
pub fn parse_filename(raw: &[u8], hint: ParseHint) -> Result<NameInfo, CbmError> {
    // names are NUL-terminated on the wire; stop at the first NUL
    let raw = match raw.iter().position(|c| *c == 0) {
        Some(p) => &raw[..p],
        None => raw,
    };

    let mut info = NameInfo::empty();
    let mut rest = raw;

    if hint == ParseHint::Command {
        if let Some((cmd, r)) = match_block_command(rest) {
            info.cmd = Some(cmd);
            rest = r;
        } else if let Some((cmd, r)) = match_command(rest) {
            info.cmd = Some(cmd);
            rest = r;
        }
    }

    // optional drive number, only consumed when followed by ':' or
    // (for commands) the end of the buffer
    if let Ok((r, Some(drv))) = drive_number(rest) {
        if r.first() == Some(&b':') {
            info.drive = Some(drv);
            rest = &r[1..];
        } else if r.is_empty() && info.cmd.is_some() {
            info.drive = Some(drv);
            rest = r;
        }
    }
    if rest.first() == Some(&b':') {
        // drive-less colon form, "X:name"
        rest = &rest[1..];
    }

    // split the remainder at commas
    let mut parts = rest.split(|c| *c == b',');
    info.name = parts.next().unwrap_or(&[]).to_vec();
    let mut last_was_rel = false;
    for part in parts {
        last_was_rel = apply_option(&mut info, part, last_was_rel)?;
    }

    if info.name.len() > 16 && info.cmd.is_none() {
        // a single CBM name cannot be longer than a slot name; paths
        // with separators may well be
        if !info.name.contains(&crate::wildcard::PATH_SEPARATOR) {
            return Err(CbmError::SyntaxNameTooLong);
        }
    }

    Ok(info)
}

/// Open parameters carried in the option string of an OPEN request
/// (`T=P`, `T=S`, `T=L123`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenParams {
    /// The requested file type, Unknown when any type may match
    pub filetype: FileType,
    /// REL record length, 0 unless the file is opened as REL
    pub recordlen: u8,
}

impl Default for OpenParams {
    fn default() -> Self {
        OpenParams {
            filetype: FileType::Unknown,
            recordlen: 0,
        }
    }
}

impl OpenParams {
    /// Parse an option string.  Unknown options are logged and
    /// skipped, matching the forgiving behaviour of the DOS.
    pub fn parse(opts: &[u8]) -> OpenParams {
        let mut pars = OpenParams::default();
        let mut p = opts.iter().peekable();
        while let Some(c) = p.next() {
            match *c {
                b't' | b'T' => {
                    if p.next() != Some(&b'=') {
                        continue;
                    }
                    match p.next().map(|c| c.to_ascii_uppercase()) {
                        Some(b'P') => pars.filetype = FileType::Prg,
                        Some(b'S') => pars.filetype = FileType::Seq,
                        Some(b'U') => pars.filetype = FileType::Usr,
                        Some(b'L') => {
                            pars.filetype = FileType::Rel;
                            let mut v: u32 = 0;
                            while let Some(d) = p.peek() {
                                if !d.is_ascii_digit() {
                                    break;
                                }
                                v = v * 10 + (**d - b'0') as u32;
                                p.next();
                            }
                            if v > 0 && v < 255 {
                                pars.recordlen = v as u8;
                            }
                        }
                        other => {
                            log::warn!("unknown open file type option {:?}", other);
                        }
                    }
                }
                b',' => {}
                other => {
                    log::warn!("error parsing file open options at {:02x}", other);
                    return pars;
                }
            }
        }
        pars
    }

    /// Merge the comma-options of a parsed name into open parameters.
    pub fn from_nameinfo(info: &NameInfo) -> OpenParams {
        OpenParams {
            filetype: info.filetype.unwrap_or(FileType::Unknown),
            recordlen: info.recordlen.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_filename, Command, OpenParams, ParseHint};
    use crate::error::CbmError;
    use crate::wire::FileType;
    use pretty_assertions::assert_eq;

    #[test]
    fn name_without_anything() {
        let info = parse_filename(b"testname", ParseHint::File).unwrap();
        assert_eq!(info.drive, None);
        assert_eq!(info.name, b"testname".to_vec());
        assert_eq!(info.access, 0);
        assert_eq!(info.cmd, None);
    }

    #[test]
    fn name_with_drive() {
        let info = parse_filename(b"3:testname", ParseHint::File).unwrap();
        assert_eq!(info.drive, Some(3));
        assert_eq!(info.name, b"testname".to_vec());
    }

    #[test]
    fn name_with_access_mode() {
        let info = parse_filename(b"testname,r", ParseHint::File).unwrap();
        assert_eq!(info.drive, None);
        assert_eq!(info.name, b"testname".to_vec());
        assert_eq!(info.access, b'R');
    }

    #[test]
    fn open_with_type_and_mode() {
        let info = parse_filename(b"1:TEST.PRG,P,W", ParseHint::File).unwrap();
        assert_eq!(info.drive, Some(1));
        assert_eq!(info.name, b"TEST.PRG".to_vec());
        assert_eq!(info.filetype, Some(FileType::Prg));
        assert_eq!(info.access, b'W');
    }

    #[test]
    fn scratch_with_drive_and_pattern() {
        let info = parse_filename(b"S0:*", ParseHint::Command).unwrap();
        assert_eq!(info.cmd, Some(Command::Scratch));
        assert_eq!(info.drive, Some(0));
        assert_eq!(info.name, b"*".to_vec());
    }

    #[test]
    fn command_prefixes() {
        for name in [&b"I"[..], b"INITIA", b"INITIALIZE", b"INITIALIZEXYZ"] {
            let info = parse_filename(name, ParseHint::Command).unwrap();
            assert_eq!(info.cmd, Some(Command::Initialize), "input {:?}", name);
            assert_eq!(info.name, Vec::<u8>::new());
            assert_eq!(info.drive, None);
        }
    }

    #[test]
    fn command_with_trailing_drive() {
        let info = parse_filename(b"I0", ParseHint::Command).unwrap();
        assert_eq!(info.cmd, Some(Command::Initialize));
        assert_eq!(info.drive, Some(0));
        assert_eq!(info.name, Vec::<u8>::new());
    }

    #[test]
    fn file_hint_never_matches_commands() {
        let info = parse_filename(b"I", ParseHint::File).unwrap();
        assert_eq!(info.cmd, None);
        assert_eq!(info.name, b"I".to_vec());
    }

    #[test]
    fn block_commands() {
        let info = parse_filename(b"U1:2 0 18 0", ParseHint::Command).unwrap();
        assert_eq!(info.cmd, Some(Command::BlockU1));
        let info = parse_filename(b"B-A:0 18 0", ParseHint::Command).unwrap();
        assert_eq!(info.cmd, Some(Command::BlockAllocate));
    }

    #[test]
    fn rel_record_length_as_digits_and_raw_byte() {
        let info = parse_filename(b"REC,L,10", ParseHint::File).unwrap();
        assert_eq!(info.filetype, Some(FileType::Rel));
        assert_eq!(info.recordlen, Some(10));

        let info = parse_filename(b"REC,L,\x7f", ParseHint::File).unwrap();
        assert_eq!(info.recordlen, Some(127));
    }

    #[test]
    fn overlong_plain_name_is_rejected() {
        let err = parse_filename(b"THISNAMEISWAYTOOLONGFORCBM", ParseHint::File).unwrap_err();
        assert_eq!(err, CbmError::SyntaxNameTooLong);
        // but paths may exceed 16 chars
        assert!(parse_filename(b"SUBDIR/LONG/NAME.PRG", ParseHint::File).is_ok());
    }

    #[test]
    fn open_params_from_option_string() {
        let pars = OpenParams::parse(b"T=L100");
        assert_eq!(pars.filetype, FileType::Rel);
        assert_eq!(pars.recordlen, 100);

        let pars = OpenParams::parse(b"T=P");
        assert_eq!(pars.filetype, FileType::Prg);
        assert_eq!(pars.recordlen, 0);
    }
}
