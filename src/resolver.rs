//! Path resolution: from a drive's endpoint and a slash-separated
//! pattern to the final directory and the residual file pattern.
//!
//! Every path component is matched against the directory entries with
//! the handler chain applied, so a `FOO.P00` matches the component
//! `FOO`, and a matched container file (a mounted image) is wrapped
//! into a temporary endpoint whose root replaces the current
//! directory.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::debug;

use crate::charset::Charset;
use crate::config::Config;
use crate::error::CbmError;
use crate::handler::HandlerRegistry;
use crate::provider::{EndpointRef, ProviderRegistry, ServerFile};
use crate::wildcard::{match_pattern, PATH_SEPARATOR};

/// The outcome of a path resolution.
pub struct Resolved {
    /// the directory the residual pattern applies to
    pub dir: Box<dyn ServerFile>,
    /// the residual file pattern, wire charset
    pub pattern: Vec<u8>,
}

/// Canonicalise a pattern: empty patterns become `*`, a trailing
/// separator gets a `*` appended.
fn canonicalize(pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return b"*".to_vec();
    }
    let mut p = pattern.to_vec();
    if p.last() == Some(&PATH_SEPARATOR) {
        p.push(b'*');
    }
    p
}

/// Join the drive's current directory with a pattern.  An absolute
/// pattern (leading `/`) resolves from the endpoint root.
fn apply_cdpath(cdpath: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.first() == Some(&PATH_SEPARATOR) {
        return pattern[1..].to_vec();
    }
    let mut full = Vec::new();
    for part in cdpath.split(|c| *c == PATH_SEPARATOR) {
        if !part.is_empty() {
            full.extend_from_slice(part);
            full.push(PATH_SEPARATOR);
        }
    }
    full.extend_from_slice(pattern);
    full
}

/// Scan a directory for the first entry matching one pattern
/// component, handler chain applied.
pub fn scan_dir(
    handlers: &HandlerRegistry,
    dir: &mut Box<dyn ServerFile>,
    pattern: &[u8],
    cset: Charset,
    advanced: bool,
) -> Result<Option<Box<dyn ServerFile>>, CbmError> {
    loop {
        let entry = match dir.next_entry()? {
            Some(e) => e,
            None => return Ok(None),
        };
        let wrapped = handlers.wrap(entry)?;
        let meta = wrapped.meta();
        if match_pattern(pattern, cset, &meta.name, meta.cset, advanced) {
            return Ok(Some(wrapped));
        }
    }
}

/// Resolve a pattern against an endpoint, walking directory
/// components and wrapping container files, and return the final
/// directory plus the residual pattern.
pub fn resolve_path(
    providers: &ProviderRegistry,
    handlers: &HandlerRegistry,
    cfg: &Config,
    endpoint: &EndpointRef,
    cdpath: &[u8],
    pattern: &[u8],
    cset: Charset,
) -> Result<Resolved, CbmError> {
    let full = canonicalize(&apply_cdpath(cdpath, pattern));

    let mut dir = endpoint.root()?;

    let mut components: Vec<&[u8]> = full.split(|c| *c == PATH_SEPARATOR).collect();
    let residual = components.pop().unwrap_or(&[]).to_vec();

    for component in components {
        if component.is_empty() {
            continue;
        }
        debug!(
            "resolving component {:?}",
            String::from_utf8_lossy(component)
        );
        // directory components are matched with classic wildcards
        let matched = scan_dir(handlers, &mut dir, component, cset, false)?
            .ok_or(CbmError::DirNotFound)?;

        if matched.meta().is_dir {
            dir = matched;
            continue;
        }

        // not a directory: maybe a container file an endpoint provider
        // can wrap (an image inside the tree)
        let mut wrapped = None;
        for provider in providers.iter() {
            if let Some(ep) = provider.wrap_endpoint(matched.as_ref(), cfg)? {
                wrapped = Some(ep.root()?);
                break;
            }
        }
        dir = wrapped.ok_or(CbmError::DirNotFound)?;
    }

    if residual.is_empty() {
        return Err(CbmError::SyntaxDirSeparator);
    }

    Ok(Resolved {
        dir,
        pattern: residual,
    })
}

#[cfg(test)]
mod tests {
    use super::{apply_cdpath, canonicalize};
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_patterns() {
        assert_eq!(canonicalize(b""), b"*".to_vec());
        assert_eq!(canonicalize(b"SUB/"), b"SUB/*".to_vec());
        assert_eq!(canonicalize(b"FILE"), b"FILE".to_vec());
    }

    #[test]
    fn cdpath_prefixing() {
        assert_eq!(apply_cdpath(b"/", b"FILE"), b"FILE".to_vec());
        assert_eq!(apply_cdpath(b"/sub", b"FILE"), b"sub/FILE".to_vec());
        assert_eq!(apply_cdpath(b"/a/b", b"F"), b"a/b/F".to_vec());
        // absolute patterns ignore the current directory
        assert_eq!(apply_cdpath(b"/sub", b"/FILE"), b"FILE".to_vec());
    }
}
