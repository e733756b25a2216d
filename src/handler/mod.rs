//! Filename-wrapping handlers.
//!
//! A handler virtualises file-type metadata that sits on top of any
//! provider: a `FOO.P00` on the host filesystem appears to the host
//! as a PRG named `FOO`, a `DATA,L100` as a REL file with record
//! length 100.  The resolver offers every directory entry to the
//! handler chain; the first handler that recognises an entry wraps
//! it, and the wrapped file owns the inner one.
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod typed;
pub mod x00;

use std::rc::Rc;

use crate::error::CbmError;
use crate::provider::ServerFile;

/// Result of offering a file to a handler.
pub enum Wrap {
    /// the handler does not apply; the file is given back
    No(Box<dyn ServerFile>),
    /// the file was wrapped
    Wrapped(Box<dyn ServerFile>),
}

/// A filename-wrapping layer.
pub trait Handler {
    /// The handler name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Inspect a directory entry and wrap it when it matches this
    /// handler's naming convention.
    fn resolve(&self, infile: Box<dyn ServerFile>) -> Result<Wrap, CbmError>;
}

/// The registered handler chain.
pub struct HandlerRegistry {
    handlers: Vec<Rc<dyn Handler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: Vec::new(),
        }
    }

    /// The standard chain: x00 before typed, as the x00 magic check
    /// is the more specific one.
    pub fn standard() -> HandlerRegistry {
        let mut reg = HandlerRegistry::new();
        reg.register(Rc::new(x00::X00Handler));
        reg.register(Rc::new(typed::TypedHandler));
        reg
    }

    /// Register a handler at the end of the chain.
    pub fn register(&mut self, handler: Rc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Offer a file to the chain; the first matching handler wraps
    /// it, otherwise the original is returned.
    pub fn wrap(&self, mut file: Box<dyn ServerFile>) -> Result<Box<dyn ServerFile>, CbmError> {
        for handler in &self.handlers {
            match handler.resolve(file)? {
                Wrap::Wrapped(wrapped) => return Ok(wrapped),
                Wrap::No(original) => file = original,
            }
        }
        Ok(file)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::standard()
    }
}
