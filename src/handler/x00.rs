//! The x00 handler: P00/S00/U00/R00 container files.
//!
//! An x00 file carries a 26-byte header: the magic `C64File` plus a
//! NUL, the original PETSCII file name (16 bytes, zero padded), a
//! reserved byte and the REL record length.  The wrapped file exposes
//! the embedded name and type and hides the header from the data
//! stream.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::io::Read;

use log::{debug, info};
use nom::{bytes::complete::{tag, take}, number::complete::le_u8, IResult};

use crate::charset::Charset;
use crate::error::CbmError;
use crate::name::OpenParams;
use crate::provider::{CloseStatus, FileMeta, OpenMode, ServerFile};
use crate::wire::FileType;

use super::{Handler, Wrap};

/// Size of the x00 header.
pub const X00_HEADER_LEN: u64 = 26;

struct X00Header {
    name: Vec<u8>,
    recordlen: u8,
}

fn x00_header_parser(i: &[u8]) -> IResult<&[u8], X00Header> {
    let (i, _magic) = tag(b"C64File\0")(i)?;
    let (i, name) = take(16usize)(i)?;
    let (i, _reserved) = le_u8(i)?;
    let (i, recordlen) = le_u8(i)?;
    Ok((
        i,
        X00Header {
            name: name.iter().take_while(|c| **c != 0).copied().collect(),
            recordlen,
        },
    ))
}

/// Map the extension letter to the exposed file type.
fn type_from_extension(ext: &str) -> Option<FileType> {
    let mut chars = ext.chars();
    let letter = chars.next()?;
    if !chars.all(|c| c.is_ascii_digit()) || ext.len() != 3 {
        return None;
    }
    match letter.to_ascii_uppercase() {
        'P' => Some(FileType::Prg),
        'S' => Some(FileType::Seq),
        'U' => Some(FileType::Usr),
        'R' => Some(FileType::Rel),
        _ => None,
    }
}

/// The x00 handler.
pub struct X00Handler;

impl Handler for X00Handler {
    fn name(&self) -> &'static str {
        "x00"
    }

    fn resolve(&self, infile: Box<dyn ServerFile>) -> Result<Wrap, CbmError> {
        let path = match infile.os_path() {
            Some(p) if !infile.meta().is_dir => p,
            _ => return Ok(Wrap::No(infile)),
        };
        let ftype = match path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(type_from_extension)
        {
            Some(t) => t,
            None => return Ok(Wrap::No(infile)),
        };

        // the header decides; a stray .P00 name without magic stays
        // a plain file
        let mut header = [0u8; X00_HEADER_LEN as usize];
        match std::fs::File::open(&path).and_then(|mut f| f.read_exact(&mut header)) {
            Ok(()) => {}
            Err(_) => return Ok(Wrap::No(infile)),
        }
        let parsed = match x00_header_parser(&header) {
            Ok((_, h)) => h,
            Err(_) => return Ok(Wrap::No(infile)),
        };

        info!(
            "found {:?} x00 file {:?} addressed as {}",
            ftype,
            String::from_utf8_lossy(&parsed.name),
            path.display()
        );

        let inner_meta = infile.meta();
        let meta = FileMeta {
            name: parsed.name,
            cset: Charset::Petscii,
            ftype,
            attr: inner_meta.attr,
            size: inner_meta.size.saturating_sub(X00_HEADER_LEN),
            date: inner_meta.date,
            recordlen: if ftype == FileType::Rel {
                parsed.recordlen
            } else {
                0
            },
            writable: inner_meta.writable,
            seekable: true,
            is_dir: false,
        };

        Ok(Wrap::Wrapped(Box::new(X00File {
            meta,
            inner: infile,
        })))
    }
}

/// A file wrapped by the x00 handler; owns the inner file.
struct X00File {
    meta: FileMeta,
    inner: Box<dyn ServerFile>,
}

impl ServerFile for X00File {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    fn os_path(&self) -> Option<std::path::PathBuf> {
        self.inner.os_path()
    }

    fn open(&mut self, pars: &OpenParams, mode: OpenMode) -> Result<CbmError, CbmError> {
        if pars.filetype != FileType::Unknown && pars.filetype != self.meta.ftype {
            debug!(
                "expected file type {:?}, found {:?}",
                pars.filetype, self.meta.ftype
            );
            return Err(CbmError::FileTypeMismatch);
        }
        if self.meta.ftype == FileType::Rel
            && pars.recordlen != 0
            && pars.recordlen != self.meta.recordlen
        {
            return Err(CbmError::RecordNotPresent);
        }

        let mut inner_pars = *pars;
        inner_pars.filetype = FileType::Unknown;
        inner_pars.recordlen = 0;
        let rv = self.inner.open(&inner_pars, mode)?;
        if matches!(mode, OpenMode::Write | OpenMode::Overwrite) {
            // a truncating open starts with a fresh header
            let mut header = Vec::with_capacity(X00_HEADER_LEN as usize);
            header.extend_from_slice(b"C64File\0");
            let mut name = [0u8; 16];
            let n = self.meta.name.len().min(16);
            name[..n].copy_from_slice(&self.meta.name[..n]);
            header.extend_from_slice(&name);
            header.push(0);
            header.push(self.meta.recordlen);
            self.inner.write(&header, false)?;
        } else if mode != OpenMode::Append {
            // the payload begins behind the header
            self.inner.seek_bytes(X00_HEADER_LEN)?;
        }
        Ok(if self.meta.ftype == FileType::Rel {
            CbmError::OpenRel
        } else {
            rv
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CbmError> {
        self.inner.read(buf)
    }

    fn write(&mut self, data: &[u8], eof: bool) -> Result<(), CbmError> {
        self.inner.write(data, eof)
    }

    fn position(&mut self, record: u16) -> Result<(), CbmError> {
        let factor = (self.meta.recordlen as u64).max(1);
        self.inner
            .seek_bytes(X00_HEADER_LEN + record as u64 * factor)
    }

    fn seek_bytes(&mut self, offset: u64) -> Result<(), CbmError> {
        self.inner.seek_bytes(X00_HEADER_LEN + offset)
    }

    fn close(&mut self) -> CloseStatus {
        self.inner.close()
    }

    fn scratch(&mut self) -> Result<(), CbmError> {
        self.inner.scratch()
    }

    fn rename(&mut self, new_name: &[u8], cset: Charset) -> Result<(), CbmError> {
        self.inner.rename(new_name, cset)
    }
}

#[cfg(test)]
mod tests {
    use super::{type_from_extension, x00_header_parser};
    use crate::wire::FileType;
    use pretty_assertions::assert_eq;

    #[test]
    fn extension_mapping() {
        assert_eq!(type_from_extension("P00"), Some(FileType::Prg));
        assert_eq!(type_from_extension("p42"), Some(FileType::Prg));
        assert_eq!(type_from_extension("R00"), Some(FileType::Rel));
        assert_eq!(type_from_extension("PRG"), None);
        assert_eq!(type_from_extension("P0"), None);
        assert_eq!(type_from_extension("X00"), None);
    }

    #[test]
    fn header_parse() {
        let mut header = Vec::new();
        header.extend_from_slice(b"C64File\0");
        let mut name = [0u8; 16];
        name[..4].copy_from_slice(b"DEMO");
        header.extend_from_slice(&name);
        header.push(0);
        header.push(100);

        let (_, h) = x00_header_parser(&header).unwrap();
        assert_eq!(h.name, b"DEMO".to_vec());
        assert_eq!(h.recordlen, 100);
    }

    #[test]
    fn bad_magic_is_no_match() {
        let mut header = vec![0u8; 26];
        header[..8].copy_from_slice(b"NotC64Fi");
        assert!(x00_header_parser(&header).is_err());
    }
}
