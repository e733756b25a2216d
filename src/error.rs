//! Error results for the filesystem server
//!
//! Every provider operation resolves to a CBM DOS error code that is
//! returned to the host in the first payload byte of the reply packet.
//! The [`Error`] type wraps the code together with the non-protocol
//! error kinds (I/O, parse) that can occur on the server side.
#![warn(missing_docs)]
#![warn(unsafe_code)]
use std::{
    fmt::{Debug, Display, Formatter, Result},
    io,
};

/// CBM DOS error codes as sent to the host.
///
/// The numeric values 2x..7x follow the classic Commodore DOS error
/// channel numbers.  Codes above 74 are server extensions for
/// conditions the DOS never had to report (host-filesystem permission
/// checks, internal faults).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CbmError {
    /// 00, OK
    Ok = 0,
    /// 01, FILES SCRATCHED - successful, count in the first reply byte
    Scratched = 1,
    /// 02, successful open of a REL file, record length in the reply
    OpenRel = 2,
    /// 26, WRITE PROTECT ON
    WriteProtect = 26,
    /// 30, generic SYNTAX ERROR
    SyntaxInval = 30,
    /// 32, command line too long / file name too long
    SyntaxNameTooLong = 32,
    /// 33, invalid file name (wildcards where none are allowed)
    SyntaxPattern = 33,
    /// 34, missing or misplaced path separator
    SyntaxDirSeparator = 34,
    /// 39, a path component did not match a directory
    DirNotFound = 39,
    /// 50, RECORD NOT PRESENT
    RecordNotPresent = 50,
    /// 51, OVERFLOW IN RECORD
    OverflowInRecord = 51,
    /// 60, WRITE FILE OPEN
    WriteFileOpen = 60,
    /// 61, FILE NOT OPEN
    FileNotOpen = 61,
    /// 62, FILE NOT FOUND
    FileNotFound = 62,
    /// 63, FILE EXISTS
    FileExists = 63,
    /// 64, FILE TYPE MISMATCH
    FileTypeMismatch = 64,
    /// 65, NO BLOCK - B-A found the block allocated, next free in reply
    NoBlock = 65,
    /// 66, ILLEGAL TRACK OR SECTOR
    IllegalTrackOrSector = 66,
    /// 70, NO CHANNEL
    NoChannel = 70,
    /// 71, directory error (inconsistent directory chain)
    DirError = 71,
    /// 72, DISK FULL
    DiskFull = 72,
    /// 74, DRIVE NOT READY
    DriveNotReady = 74,
    /// 75, server extension: operation outside the endpoint base path
    NoPermission = 75,
    /// 76, server extension: RMDIR on a non-empty directory
    DirNotEmpty = 76,
    /// 96, server extension: internal fault / consistency violation
    Fault = 96,
}

impl CbmError {
    /// True for the codes that report success with extra meaning
    /// (SCRATCHED, OPEN_REL) rather than a failure.
    pub fn is_success(self) -> bool {
        matches!(self, CbmError::Ok | CbmError::Scratched | CbmError::OpenRel)
    }

    /// The wire representation of the code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Display for CbmError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{:?} ({:02})", self, *self as u8)
    }
}

/// Map an OS error to the CBM code reported to the host.
///
/// The table is fixed; everything unknown degrades to FAULT.
pub fn cbm_error_from_io(e: &io::Error) -> CbmError {
    match e.kind() {
        io::ErrorKind::NotFound => CbmError::FileNotFound,
        io::ErrorKind::PermissionDenied => CbmError::NoPermission,
        io::ErrorKind::AlreadyExists => CbmError::FileExists,
        io::ErrorKind::InvalidInput => CbmError::SyntaxInval,
        _ => match e.raw_os_error() {
            // ENOSPC, EISDIR/ENOTDIR, ENOTEMPTY, EMFILE
            Some(28) => CbmError::DiskFull,
            Some(21) | Some(20) => CbmError::FileTypeMismatch,
            Some(39) => CbmError::DirNotEmpty,
            Some(24) => CbmError::NoChannel,
            _ => CbmError::Fault,
        },
    }
}

/// An error that can occur while serving host requests.
#[derive(PartialEq)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Create a new Error with a given ErrorKind variant
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    /// The CBM error code this error maps to on the wire.
    pub fn cbm(&self) -> CbmError {
        match &self.kind {
            ErrorKind::Cbm(e) => *e,
            ErrorKind::Message(_) => CbmError::Fault,
            ErrorKind::Parse(_) => CbmError::SyntaxInval,
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

/// The kinds of errors that can occur while serving host requests.
#[derive(PartialEq)]
pub enum ErrorKind {
    /// Generic error type
    Message(String),

    /// A protocol-level error carrying the CBM DOS code
    Cbm(CbmError),

    /// A parse error from the wire or name layer
    Parse(String),
}

impl ErrorKind {
    /// Return a new generic ErrorKind::Message with a given string message.
    pub fn new(message: &str) -> ErrorKind {
        ErrorKind::Message(message.to_string())
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            ErrorKind::Message(message) => write!(f, "An error occurred: {}", message),
            ErrorKind::Cbm(e) => write!(f, "{}", e),
            ErrorKind::Parse(message) => write!(f, "Parse error: {}", message),
        }
    }
}

impl From<CbmError> for Error {
    fn from(e: CbmError) -> Self {
        Error::new(ErrorKind::Cbm(e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::Cbm(cbm_error_from_io(&e)))
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(e: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::new(ErrorKind::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{cbm_error_from_io, CbmError};
    use std::io;

    #[test]
    fn io_error_mapping_follows_the_table() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(cbm_error_from_io(&e), CbmError::FileNotFound);

        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(cbm_error_from_io(&e), CbmError::NoPermission);

        let e = io::Error::from_raw_os_error(28);
        assert_eq!(cbm_error_from_io(&e), CbmError::DiskFull);
    }

    #[test]
    fn success_codes() {
        assert!(CbmError::Ok.is_success());
        assert!(CbmError::Scratched.is_success());
        assert!(CbmError::OpenRel.is_success());
        assert!(!CbmError::DiskFull.is_success());
    }
}
