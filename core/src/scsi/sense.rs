//! Status and sense data model

use anyhow::{Result, bail};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use super::{ASC_NO_SENSE, CC_KEY_NO_SENSE, STATUS_CHECK_CONDITION, STATUS_GOOD};

bitfield! {
    /// Sense key byte (byte 2 of extended sense data)
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SenseKey(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub key: u8 @ 0..=3,
        /// Incorrect length indicator
        pub ili: bool @ 5,
        /// End of medium (or beginning of medium on reverse operations)
        pub eom: bool @ 6,
        pub filemark: bool @ 7,
    }
}

/// Outcome of the last command: the status byte and the detail
/// returned by REQUEST SENSE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sense {
    pub status: u8,
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
    /// Information field (residue for incorrect length conditions)
    pub info: Option<i32>,
}

impl Sense {
    /// Length of extended sense data
    pub const EXTENDED_LEN: usize = 18;

    pub fn good() -> Self {
        Self {
            status: STATUS_GOOD,
            key: SenseKey(CC_KEY_NO_SENSE),
            asc: ASC_NO_SENSE,
            ascq: 0,
            info: None,
        }
    }

    pub fn set(&mut self, status: u8, key: SenseKey, asc: u8) {
        *self = Self {
            status,
            key,
            asc,
            ascq: 0,
            info: None,
        };
    }

    /// Builds the extended sense data block
    pub fn to_extended(&self) -> [u8; Self::EXTENDED_LEN] {
        let mut result = [0; Self::EXTENDED_LEN];

        // 0 Valid (7), error code (6-0): current error, extended format
        result[0] = 0x70;
        result[2] = self.key.0;
        if let Some(info) = self.info {
            result[0] |= 0x80;
            result[3..7].copy_from_slice(&info.to_be_bytes());
        }
        // Additional sense length (N-7)
        result[7] = (Self::EXTENDED_LEN - 8) as u8;
        result[12] = self.asc;
        result[13] = self.ascq;
        result
    }

    /// Decodes extended sense data as returned by REQUEST SENSE. The status
    /// is not part of sense data and is inferred from its contents.
    pub fn from_extended(data: &[u8]) -> Result<Self> {
        if data.len() < 14 || data[0] & 0x7F != 0x70 {
            bail!("Not extended sense data: {:02X?}", data);
        }
        let key = SenseKey(data[2]);
        let (asc, ascq) = (data[12], data[13]);
        let status = if key.0 == 0 && asc == 0 && ascq == 0 {
            STATUS_GOOD
        } else {
            STATUS_CHECK_CONDITION
        };
        let info = (data[0] & 0x80 != 0)
            .then(|| i32::from_be_bytes([data[3], data[4], data[5], data[6]]));
        Ok(Self {
            status,
            key,
            asc,
            ascq,
            info,
        })
    }
}
