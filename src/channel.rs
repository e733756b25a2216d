//! The channel-to-file map, global to the host session.
//!
//! One channel number binds to one open file.  Channels 0..15 are
//! data channels; 0xfe and 0xff are reserved for configuration and
//! the command channel.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::error::CbmError;
use crate::provider::ServerFile;

/// Number of data channels.
pub const NUM_CHANNELS: usize = 16;

/// The channel table.
pub struct ChannelTable {
    slots: Vec<Option<Box<dyn ServerFile>>>,
}

impl ChannelTable {
    /// An empty table.
    pub fn new() -> ChannelTable {
        let mut slots = Vec::with_capacity(NUM_CHANNELS);
        slots.resize_with(NUM_CHANNELS, || None);
        ChannelTable { slots }
    }

    fn index(channel: u8) -> Result<usize, CbmError> {
        let i = channel as usize;
        if i >= NUM_CHANNELS {
            return Err(CbmError::NoChannel);
        }
        Ok(i)
    }

    /// Bind a file to a channel.  A file already bound there is
    /// closed first.
    pub fn set(&mut self, channel: u8, file: Box<dyn ServerFile>) -> Result<(), CbmError> {
        let i = Self::index(channel)?;
        if let Some(mut old) = self.slots[i].take() {
            old.close();
        }
        self.slots[i] = Some(file);
        Ok(())
    }

    /// The file bound to a channel.
    pub fn get_mut(&mut self, channel: u8) -> Result<&mut Box<dyn ServerFile>, CbmError> {
        let i = Self::index(channel)?;
        self.slots[i].as_mut().ok_or(CbmError::FileNotOpen)
    }

    /// Unbind and return the file of a channel.
    pub fn take(&mut self, channel: u8) -> Result<Box<dyn ServerFile>, CbmError> {
        let i = Self::index(channel)?;
        self.slots[i].take().ok_or(CbmError::FileNotOpen)
    }

    /// Close everything, e.g. on RESET.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(mut file) = slot.take() {
                file.close();
            }
        }
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        ChannelTable::new()
    }
}
