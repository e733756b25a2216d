//! The typed handler: `,P` / `,S` / `,U` / `,L<n>` name suffixes.
//!
//! A file whose underlying name carries a comma-type suffix is
//! exposed without the suffix and with the corresponding CBM file
//! type.  `,L` suffixes carry the record length, which makes REL
//! files usable on media that cannot store the type themselves.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::info;

use crate::charset::Charset;
use crate::error::CbmError;
use crate::name::OpenParams;
use crate::provider::{CloseStatus, FileMeta, OpenMode, ServerFile};
use crate::wire::FileType;

use super::{Handler, Wrap};

/// Split `NAME,X[nnn]` into the exposed name, the type and the
/// record length.
fn split_typed(name: &[u8]) -> Option<(Vec<u8>, FileType, u8)> {
    let comma = name.iter().rposition(|c| *c == b',')?;
    if comma == 0 {
        return None;
    }
    let (stem, suffix) = (&name[..comma], &name[comma + 1..]);
    let letter = *suffix.first()?;
    let rest = &suffix[1..];
    let ftype = match letter.to_ascii_uppercase() {
        b'P' => FileType::Prg,
        b'S' => FileType::Seq,
        b'U' => FileType::Usr,
        b'L' | b'R' => FileType::Rel,
        _ => return None,
    };
    let mut recordlen = 0u32;
    if ftype == FileType::Rel {
        for d in rest {
            if !d.is_ascii_digit() {
                return None;
            }
            recordlen = recordlen * 10 + (*d - b'0') as u32;
        }
        if recordlen == 0 || recordlen > 254 {
            return None;
        }
    } else if !rest.is_empty() {
        return None;
    }
    Some((stem.to_vec(), ftype, recordlen as u8))
}

/// The typed handler.
pub struct TypedHandler;

impl Handler for TypedHandler {
    fn name(&self) -> &'static str {
        "typed"
    }

    fn resolve(&self, infile: Box<dyn ServerFile>) -> Result<Wrap, CbmError> {
        if infile.meta().is_dir {
            return Ok(Wrap::No(infile));
        }
        let (stem, ftype, recordlen) = match split_typed(&infile.meta().name) {
            Some(parts) => parts,
            None => return Ok(Wrap::No(infile)),
        };

        info!(
            "found {:?} typed file {:?} addressed as {:?}",
            ftype,
            String::from_utf8_lossy(&stem),
            String::from_utf8_lossy(&infile.meta().name)
        );

        let inner_meta = infile.meta();
        let meta = FileMeta {
            name: stem,
            cset: inner_meta.cset,
            ftype,
            attr: inner_meta.attr,
            size: inner_meta.size,
            date: inner_meta.date,
            recordlen,
            writable: inner_meta.writable,
            seekable: true,
            is_dir: false,
        };

        Ok(Wrap::Wrapped(Box::new(TypedFile {
            meta,
            inner: infile,
        })))
    }
}

/// A file wrapped by the typed handler; owns the inner file.
struct TypedFile {
    meta: FileMeta,
    inner: Box<dyn ServerFile>,
}

impl ServerFile for TypedFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    fn os_path(&self) -> Option<std::path::PathBuf> {
        self.inner.os_path()
    }

    fn open(&mut self, pars: &OpenParams, mode: OpenMode) -> Result<CbmError, CbmError> {
        if pars.filetype != FileType::Unknown && pars.filetype != self.meta.ftype {
            return Err(CbmError::FileTypeMismatch);
        }
        if self.meta.ftype == FileType::Rel
            && pars.recordlen != 0
            && pars.recordlen != self.meta.recordlen
        {
            return Err(CbmError::RecordNotPresent);
        }

        let mut inner_pars = *pars;
        inner_pars.filetype = if self.meta.ftype == FileType::Rel {
            FileType::Rel
        } else {
            FileType::Unknown
        };
        inner_pars.recordlen = self.meta.recordlen;
        let rv = self.inner.open(&inner_pars, mode)?;
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
        self.inner.position(record)
    }

    fn seek_bytes(&mut self, offset: u64) -> Result<(), CbmError> {
        self.inner.seek_bytes(offset)
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
    use super::split_typed;
    use crate::wire::FileType;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_suffixes() {
        assert_eq!(
            split_typed(b"FOO,P"),
            Some((b"FOO".to_vec(), FileType::Prg, 0))
        );
        assert_eq!(
            split_typed(b"NOTES,s"),
            Some((b"NOTES".to_vec(), FileType::Seq, 0))
        );
        assert_eq!(split_typed(b"FOO"), None);
        assert_eq!(split_typed(b",P"), None);
        assert_eq!(split_typed(b"FOO,X"), None);
        assert_eq!(split_typed(b"FOO,PX"), None);
    }

    #[test]
    fn rel_suffix_with_record_length() {
        assert_eq!(
            split_typed(b"DATA,L100"),
            Some((b"DATA".to_vec(), FileType::Rel, 100))
        );
        assert_eq!(split_typed(b"DATA,L0"), None);
        assert_eq!(split_typed(b"DATA,L999"), None);
        assert_eq!(split_typed(b"DATA,L1x"), None);
    }
}
