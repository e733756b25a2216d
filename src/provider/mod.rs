//! Back-end providers and the contracts they implement.
//!
//! A *provider* is a family of back-ends addressed by name in an
//! ASSIGN (`fs`, `di`, `http`, `ftp`, `tcp`).  An *endpoint* is an
//! instance of a provider bound to a concrete root: a directory of
//! the host filesystem, a mounted disk image.  Files are live handles
//! registered with their endpoint; an endpoint refuses to go away
//! while it is assigned to a drive or has files open.
//!
//! Dynamic dispatch happens only at these registry boundaries; inside
//! a back-end everything is concrete.
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod di;
pub mod fs;

use std::path::PathBuf;
use std::rc::Rc;

use crate::charset::Charset;
use crate::error::CbmError;
use crate::name::OpenParams;
use crate::wire::{self, DirEntry, DirMode, FileType};

/// File access modes from the OPEN family of opcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// FS_OPEN_RD - the file must exist
    Read,
    /// FS_OPEN_WR - the file must not exist
    Write,
    /// FS_OPEN_RW - read/write, REL files only on disk images
    ReadWrite,
    /// FS_OPEN_AP - append, the file must exist
    Append,
    /// FS_OPEN_OW - write, overwriting an existing file
    Overwrite,
    /// FS_OPEN_DR - directory read
    Directory,
}

impl OpenMode {
    /// Map an FS_OPEN_* opcode to the access mode.
    pub fn from_opcode(cmd: u8) -> Option<OpenMode> {
        match cmd {
            wire::FS_OPEN_RD => Some(OpenMode::Read),
            wire::FS_OPEN_WR => Some(OpenMode::Write),
            wire::FS_OPEN_RW => Some(OpenMode::ReadWrite),
            wire::FS_OPEN_AP => Some(OpenMode::Append),
            wire::FS_OPEN_OW => Some(OpenMode::Overwrite),
            wire::FS_OPEN_DR => Some(OpenMode::Directory),
            _ => None,
        }
    }

    /// True when the mode needs an existing file.
    pub fn requires_existing(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::Append)
    }

    /// True when the mode refuses an existing file.
    pub fn requires_new(self) -> bool {
        matches!(self, OpenMode::Write)
    }

    /// True when the mode writes to the file.
    pub fn writes(self) -> bool {
        matches!(
            self,
            OpenMode::Write | OpenMode::ReadWrite | OpenMode::Append | OpenMode::Overwrite
        )
    }
}

/// Metadata of a file handle, in the provider's native charset.
#[derive(Clone, Debug)]
pub struct FileMeta {
    /// file name as the provider stores it
    pub name: Vec<u8>,
    /// charset of the name bytes
    pub cset: Charset,
    /// CBM file type
    pub ftype: FileType,
    /// attribute flags (wire::ATTR_*)
    pub attr: u8,
    /// file size in bytes
    pub size: u64,
    /// modification date, zeroed when unknown
    pub date: [u8; 6],
    /// REL record length, 0 otherwise
    pub recordlen: u8,
    /// writes allowed
    pub writable: bool,
    /// positioning allowed
    pub seekable: bool,
    /// the handle is a directory
    pub is_dir: bool,
}

impl FileMeta {
    /// A directory-entry record for this file.
    pub fn dir_entry(&self) -> DirEntry {
        let mut attr = self.attr;
        if self.seekable {
            attr |= wire::ATTR_SEEK;
        }
        DirEntry {
            name: self.name.clone(),
            cset: self.cset,
            size: self.size,
            date: self.date,
            mode: if self.is_dir { DirMode::Dir } else { DirMode::File },
            ftype: self.ftype,
            attr,
            recordlen: self.recordlen,
        }
    }
}

/// What a close left behind: the reply code and extra payload bytes
/// (the T/S of the overflow point on DISK FULL).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseStatus {
    /// the CBM code for the reply
    pub code: CbmError,
    /// extra payload behind the code byte
    pub extra: Vec<u8>,
}

impl CloseStatus {
    /// A plain OK close.
    pub fn ok() -> CloseStatus {
        CloseStatus {
            code: CbmError::Ok,
            extra: Vec::new(),
        }
    }
}

/// A live handle to a resource at an endpoint.
///
/// Files form an owning chain through handler wrapping: the outermost
/// handle owns the next inner one and closing releases the chain
/// recursively.
pub trait ServerFile {
    /// The file's metadata.
    fn meta(&self) -> &FileMeta;

    /// The OS path of the backing file, if it has one.  Used by the
    /// resolver to wrap container files into image endpoints.
    fn os_path(&self) -> Option<PathBuf> {
        None
    }

    /// Open the handle for the given access.  Returns the status code
    /// for the reply: OK, or OPEN_REL for REL files.
    fn open(&mut self, pars: &OpenParams, mode: OpenMode) -> Result<CbmError, CbmError>;

    /// Read up to `buf.len()` bytes.  Returns the count and the EOF
    /// flag; on a directory channel this yields wire-formatted
    /// directory entries, one per call.
    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CbmError>;

    /// Write a chunk of data; `eof` marks the end of the host's data
    /// stream.
    fn write(&mut self, data: &[u8], eof: bool) -> Result<(), CbmError>;

    /// Position to a record (REL) or byte block (sequential).  An
    /// out-of-file position is remembered so the next write expands
    /// the file.
    fn position(&mut self, record: u16) -> Result<(), CbmError>;

    /// Absolute byte seek, used by wrapping handlers to skip their
    /// header.  Only byte-addressable back-ends support it.
    fn seek_bytes(&mut self, _offset: u64) -> Result<(), CbmError> {
        Err(CbmError::Fault)
    }

    /// Close the handle, flushing all state.
    fn close(&mut self) -> CloseStatus;

    /// Produce the next raw child of a directory handle, or None at
    /// the end of the directory.
    fn next_entry(&mut self) -> Result<Option<Box<dyn ServerFile>>, CbmError> {
        Err(CbmError::FileTypeMismatch)
    }

    /// Produce the next host-visible directory record (header,
    /// entries, blocks-free trailer).  Returns the record and the EOF
    /// flag.
    fn read_entry(&mut self) -> Result<(Option<DirEntry>, bool), CbmError> {
        Err(CbmError::FileTypeMismatch)
    }

    /// Remember the listing pattern of a directory read.  The pattern
    /// arrives in the wire charset.
    fn set_pattern(&mut self, _pattern: &[u8], _cset: Charset) {}

    /// Create a child file in a directory handle and open it.
    fn create_child(
        &mut self,
        _name: &[u8],
        _pars: &OpenParams,
        _mode: OpenMode,
    ) -> Result<Box<dyn ServerFile>, CbmError> {
        Err(CbmError::FileTypeMismatch)
    }

    /// Create a sub-directory in a directory handle.
    fn mkdir(&mut self, _name: &[u8]) -> Result<(), CbmError> {
        Err(CbmError::Fault)
    }

    /// Remove the directory this handle points to.
    fn rmdir(&mut self) -> Result<(), CbmError> {
        Err(CbmError::Fault)
    }

    /// Delete the file this handle points to.
    fn scratch(&mut self) -> Result<(), CbmError>;

    /// Rename the file within its directory.  The new name is in the
    /// wire charset.
    fn rename(&mut self, _new_name: &[u8], _cset: Charset) -> Result<(), CbmError> {
        Err(CbmError::Fault)
    }
}

/// Outcome of a direct (block) command.
pub struct DirectResult {
    /// reply code
    pub code: CbmError,
    /// reply payload (track/sector echo)
    pub payload: Vec<u8>,
    /// a buffer file to bind to the channel (U1/U2)
    pub file: Option<Box<dyn ServerFile>>,
}

/// An instance of a provider bound to a concrete root.
pub trait Endpoint {
    /// The provider this endpoint belongs to.
    fn provider_name(&self) -> &'static str;

    /// The charset file names at this endpoint are stored in.
    fn charset(&self) -> Charset;

    /// A fresh handle on the root directory.
    fn root(&self) -> Result<Box<dyn ServerFile>, CbmError>;

    /// Count a drive-table reference.
    fn assign(&self);

    /// Drop a drive-table reference; returns true when the endpoint
    /// was fully released.
    fn unassign(&self) -> bool;

    /// Number of open files registered with the endpoint.
    fn open_files(&self) -> usize;

    /// The canonical OS path of the endpoint's root object, used to
    /// detect two access paths to the same image file.
    fn root_os_path(&self) -> Option<PathBuf> {
        None
    }

    /// Format the medium (N:name,id).
    fn format(&self, _name: &[u8]) -> Result<(), CbmError> {
        Err(CbmError::DriveNotReady)
    }

    /// Direct block access (U1/U2/B-A/B-F).
    fn direct(&self, _payload: &[u8]) -> Result<DirectResult, CbmError> {
        Err(CbmError::DriveNotReady)
    }
}

/// Shared endpoint reference.
pub type EndpointRef = Rc<dyn Endpoint>;

/// A named back-end family.
pub trait Provider {
    /// The registry name (`fs`, `di`, ...).
    fn name(&self) -> &'static str;

    /// The native charset of this provider's names.
    fn charset(&self) -> Charset;

    /// Create an endpoint for an ASSIGN target path.
    fn endpoint(&self, path: &str, cfg: &crate::config::Config)
        -> Result<EndpointRef, CbmError>;

    /// Try to wrap a directory entry (a container file such as a
    /// mounted image) into a temporary endpoint.  Returns None when
    /// the entry is not a container of this provider.
    fn wrap_endpoint(
        &self,
        _file: &dyn ServerFile,
        _cfg: &crate::config::Config,
    ) -> Result<Option<EndpointRef>, CbmError> {
        Ok(None)
    }
}

/// Catalogue of the registered providers.
pub struct ProviderRegistry {
    providers: Vec<Rc<dyn Provider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> ProviderRegistry {
        ProviderRegistry {
            providers: Vec::new(),
        }
    }

    /// A registry with the standard provider set.
    pub fn standard() -> ProviderRegistry {
        let mut reg = ProviderRegistry::new();
        reg.register(Rc::new(fs::FsProvider::new()));
        reg.register(Rc::new(di::DiProvider::new()));
        for name in ["http", "ftp", "tcp"] {
            reg.register(Rc::new(ExternalProvider { name }));
        }
        reg
    }

    /// Register a provider, usually at startup.
    pub fn register(&mut self, provider: Rc<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Look a provider up by its registry name.
    pub fn by_name(&self, name: &str) -> Option<Rc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// Iterate the registered providers.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn Provider>> {
        self.providers.iter()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        ProviderRegistry::standard()
    }
}

/// A provider that exists in the name space but is served by an
/// external collaborator (http, ftp, tcp).  Assigning it reports the
/// drive as not ready.
struct ExternalProvider {
    name: &'static str,
}

impl Provider for ExternalProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn charset(&self) -> Charset {
        Charset::Ascii
    }

    fn endpoint(
        &self,
        _path: &str,
        _cfg: &crate::config::Config,
    ) -> Result<EndpointRef, CbmError> {
        Err(CbmError::DriveNotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::{OpenMode, ProviderRegistry};
    use crate::error::CbmError;

    #[test]
    fn standard_registry_knows_the_names() {
        let reg = ProviderRegistry::standard();
        for name in ["fs", "di", "http", "ftp", "tcp"] {
            assert!(reg.by_name(name).is_some(), "{} missing", name);
        }
        assert!(reg.by_name("gopher").is_none());
    }

    #[test]
    fn external_providers_are_not_ready() {
        let reg = ProviderRegistry::standard();
        let p = reg.by_name("tcp").unwrap();
        match p.endpoint("localhost:23", &crate::config::Config::default()) {
            Err(err) => assert_eq!(err, CbmError::DriveNotReady),
            Ok(_) => panic!("expected endpoint() to fail"),
        }
    }

    #[test]
    fn open_mode_requirements() {
        assert!(OpenMode::Read.requires_existing());
        assert!(OpenMode::Append.requires_existing());
        assert!(OpenMode::Write.requires_new());
        assert!(!OpenMode::Overwrite.requires_new());
        assert!(OpenMode::Overwrite.writes());
        assert!(!OpenMode::Directory.writes());
    }
}
