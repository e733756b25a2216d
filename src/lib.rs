#![warn(missing_docs)]
#![warn(unsafe_code)]
//! cbmfs is a file server exposing Commodore-style filesystem
//! semantics to an 8-bit host over a serial packet transport.
//!
//! The host addresses resources by a drive number plus a CBM file
//! name; the server resolves each request through a provider stack
//! and performs the I/O against a local directory tree or a mounted
//! disk image.  The disk-image back-end in
//! [`provider::di`](crate::provider::di) is a faithful emulation of
//! the Commodore DOS on-disk structures: BAM allocation, directory
//! slots, chained data blocks and REL side sectors.
//!
//! The entry point for serving requests is
//! [`dispatch::dispatch`](crate::dispatch::dispatch), fed with
//! packets framed as in [`wire`](crate::wire).
use log::error;

pub mod channel;
pub mod charset;
pub mod config;
pub mod dispatch;
pub mod drive;
pub mod error;
pub mod handler;
pub mod name;
pub mod provider;
pub mod resolver;
pub mod wildcard;
pub mod wire;

/// Initialize the module.
/// This should be called before any serving is performed.
/// Panics on failure or if there are any incompatibilities.
pub fn init() {
    // Disk images are addressed with usize offsets computed from
    // 32-bit linear block addresses; a 16-bit platform cannot hold
    // them.
    if usize::BITS < 32 {
        error!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
        panic!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
    }
}
