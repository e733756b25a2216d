//! The drive table: drive numbers 0..15 mapped to endpoints.
//!
//! Assigning a drive reference-counts the endpoint; the current
//! directory is tracked per drive as a path string in the wire
//! charset.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::{debug, info};

use crate::error::CbmError;
use crate::provider::EndpointRef;

/// Highest valid drive number.
pub const MAX_DRIVE: u8 = 15;

/// One assigned drive.
pub struct Drive {
    /// the drive number
    pub number: u8,
    /// the endpoint serving the drive
    pub endpoint: EndpointRef,
    /// current directory, wire charset, '/'-separated
    pub cdpath: Vec<u8>,
}

/// The table of assigned drives.
pub struct DriveTable {
    drives: Vec<Drive>,
}

impl DriveTable {
    /// An empty table.
    pub fn new() -> DriveTable {
        DriveTable { drives: Vec::new() }
    }

    /// Look up a drive.
    pub fn find(&self, number: u8) -> Option<&Drive> {
        let found = self.drives.iter().find(|d| d.number == number);
        if found.is_none() {
            info!("drive {} is not assigned", number);
        }
        found
    }

    fn find_mut(&mut self, number: u8) -> Option<&mut Drive> {
        self.drives.iter_mut().find(|d| d.number == number)
    }

    /// Assign an endpoint to a drive, replacing any previous
    /// assignment.
    pub fn assign(&mut self, number: u8, endpoint: EndpointRef) -> Result<(), CbmError> {
        if number > MAX_DRIVE {
            return Err(CbmError::SyntaxInval);
        }
        let _ = self.unassign(number);
        endpoint.assign();
        debug!("assigning drive {} to {}", number, endpoint.provider_name());
        self.drives.push(Drive {
            number,
            endpoint,
            cdpath: b"/".to_vec(),
        });
        Ok(())
    }

    /// Remove a drive assignment.
    pub fn unassign(&mut self, number: u8) -> Result<(), CbmError> {
        match self.drives.iter().position(|d| d.number == number) {
            Some(i) => {
                let drive = self.drives.remove(i);
                drive.endpoint.unassign();
                Ok(())
            }
            None => Err(CbmError::DriveNotReady),
        }
    }

    /// Change the current directory of a drive.
    pub fn set_cdpath(&mut self, number: u8, cdpath: Vec<u8>) -> Result<(), CbmError> {
        let drive = self.find_mut(number).ok_or(CbmError::DriveNotReady)?;
        drive.cdpath = cdpath;
        Ok(())
    }

    /// Iterate the assigned drives.
    pub fn iter(&self) -> impl Iterator<Item = &Drive> {
        self.drives.iter()
    }
}

impl Default for DriveTable {
    fn default() -> Self {
        DriveTable::new()
    }
}
