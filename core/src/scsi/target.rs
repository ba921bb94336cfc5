//! SCSI target generic/shared code

use anyhow::Result;
use arrayvec::ArrayVec;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use super::sense::{Sense, SenseKey};
use super::{
    ASC_INVALID_FIELD_IN_CDB, ASC_LUN_NOT_SUPPORTED, ASC_MEDIUM_NOT_PRESENT,
    ASC_MEDIUM_REMOVAL_PREVENTED, ASC_NO_SENSE, ASC_SAVING_PARAMS_NOT_SUPPORTED,
    ASCQ_REMOVAL_PREVENTED, Action, CC_KEY_ILLEGAL_REQUEST, CC_KEY_NO_SENSE, CC_KEY_NOT_READY,
    STATUS_CHECK_CONDITION, STATUS_GOOD,
};

/// Page code requesting all supported mode pages
pub const MODE_PAGE_ALL: u8 = 0x3F;
/// Caching page, not emulated
pub const MODE_PAGE_CACHING: u8 = 0x08;

/// A single mode page, including its code and length bytes
pub type ModePage = ArrayVec<u8, 32>;

/// Builds a mode page from its parameter bytes
pub(super) fn mode_page(code: u8, params: &[u8]) -> ModePage {
    let mut page = ModePage::new();
    page.push(code);
    page.push(params.len() as u8);
    page.extend(params.iter().copied());
    page
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
/// Enumeration of supported emulated SCSI device classes
pub enum DeviceClass {
    /// Direct-access (magnetic disk)
    Disk,
    /// Sequential-access (tape)
    Tape,
    /// Write-once, handled as direct-access
    Worm,
    Cdrom,
}

impl DeviceClass {
    /// Peripheral device type as reported by INQUIRY
    pub fn peripheral_type(self) -> u8 {
        match self {
            Self::Disk => 0x00,
            Self::Tape => 0x01,
            Self::Worm => 0x04,
            Self::Cdrom => 0x05,
        }
    }
}

/// Identity and fixed parameters of a SCSI unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub class: DeviceClass,
    /// Peripheral qualifier (INQUIRY byte 0, bits 7-5)
    pub qualifier: u8,
    pub removable: bool,
    /// ANSI version reported by INQUIRY
    pub version: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    /// Logical block size in bytes. For tape, the fixed block size (0 for
    /// variable block mode only).
    pub block_size: usize,
    /// Erase gap written by a short ERASE, in gap markers (tape only)
    pub gap_length: usize,
}

impl DeviceDescriptor {
    /// Default identity for a device class
    pub fn for_class(class: DeviceClass) -> Self {
        let (product, removable, block_size) = match class {
            DeviceClass::Disk => ("VIRTUAL HDD", false, 512),
            DeviceClass::Tape => ("VIRTUAL TAPE", true, 512),
            DeviceClass::Worm => ("VIRTUAL WORM", true, 512),
            DeviceClass::Cdrom => ("VIRTUAL CD-ROM", true, 2048),
        };
        Self {
            class,
            qualifier: 0,
            removable,
            version: 2,
            vendor: "SCSIBUS".to_string(),
            product: product.to_string(),
            revision: "1.0".to_string(),
            block_size,
            gap_length: if class == DeviceClass::Tape { 1 } else { 0 },
        }
    }
}

bitfield! {
    /// START STOP UNIT (and LOAD UNLOAD) CDB byte 4
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct StartStopFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub start: bool @ 0,
        pub loej: bool @ 1,
    }
}

/// Access to bus state for a command handler
pub struct TargetIo<'a> {
    /// Transfer buffer. DATA-IN responses are written at the start, a
    /// delivered DATA-OUT payload is found at the start.
    pub buf: &'a mut [u8],
    pub(super) payload: Option<usize>,
    /// Outcome of this command, reported in the Status phase
    pub sense: &'a mut Sense,
    /// Outcome of the previous command, for REQUEST SENSE
    pub last_sense: &'a Sense,
    /// Logical unit selected by IDENTIFY
    pub lun: u8,
}

impl TargetIo<'_> {
    /// The DATA-OUT payload, once it has been delivered
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.map(|len| &self.buf[..len])
    }

    /// Records the outcome without changing phase
    pub fn status_deferred(&mut self, status: u8, key: SenseKey, asc: u8) {
        self.sense.set(status, key, asc);
    }

    pub fn good(&mut self) -> Action {
        self.status_deferred(STATUS_GOOD, SenseKey(CC_KEY_NO_SENSE), ASC_NO_SENSE);
        Action::Status
    }

    pub fn check_condition(&mut self, key: u8, asc: u8) -> Action {
        self.status_deferred(STATUS_CHECK_CONDITION, SenseKey(key), asc);
        Action::Status
    }

    pub fn invalid_field(&mut self) -> Action {
        self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB)
    }

    pub fn not_ready(&mut self) -> Action {
        self.check_condition(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT)
    }

    pub fn removal_prevented(&mut self) -> Action {
        self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_MEDIUM_REMOVAL_PREVENTED);
        self.sense.ascq = ASCQ_REMOVAL_PREVENTED;
        Action::Status
    }

    /// Returns `data` to the initiator, truncated to `alloc_len`
    pub fn data_in(&mut self, data: &[u8], alloc_len: usize) -> Action {
        let len = data.len().min(alloc_len);
        self.buf[..len].copy_from_slice(&data[..len]);
        Action::DataIn(len)
    }

    /// A DATA-IN buffer of `len` bytes, None if it exceeds the transfer buffer
    pub fn data_buffer(&mut self, len: usize) -> Option<&mut [u8]> {
        self.buf.get_mut(..len)
    }
}

/// Copies an ASCII identification string, padded with spaces
fn inquiry_string(dest: &mut [u8], s: &str) {
    dest.fill(b' ');
    let len = s.len().min(dest.len());
    dest[..len].copy_from_slice(&s.as_bytes()[..len]);
}

/// An abstraction of a SCSI target, one implementation per device class.
///
/// `cmd` handles the commands all classes share and passes everything else
/// on to `specific_cmd`. Commands with a DATA-OUT phase are handled twice:
/// once with only the CDB (returning `Action::DataOut`) and once more when
/// `TargetIo::payload` holds the delivered data.
pub trait ScsiTarget {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Medium present and ready
    fn ready(&self) -> bool;
    fn write_protected(&self) -> bool;
    fn set_prevent_removal(&mut self, prevent: bool);

    /// Amount of logical blocks, for block devices with a medium
    fn blocks(&self) -> Option<usize>;

    /// Supported mode pages, in the order they are returned for MODE_PAGE_ALL
    fn mode_page_codes(&self) -> &'static [u8];
    fn mode_page(&self, page: u8) -> Option<ModePage>;
    fn ms_density(&self) -> u8;
    fn ms_media_type(&self) -> u8 {
        0
    }
    fn ms_device_specific(&self) -> u8;

    /// Device class specific commands
    fn specific_cmd(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action>;

    fn cmd(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        if io.lun != 0 && !matches!(cmd[0], 0x03 | 0x12) {
            log::warn!("Command {:02X} to unsupported LUN {}", cmd[0], io.lun);
            return Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LUN_NOT_SUPPORTED));
        }

        match cmd[0] {
            0x00 => {
                // TEST UNIT READY
                if self.ready() {
                    Ok(io.good())
                } else {
                    Ok(io.not_ready())
                }
            }
            0x03 => {
                // REQUEST SENSE
                let sense = io.last_sense.to_extended();
                // Zero means 4 bytes for SCSI-1 initiators
                let alloc_len = if cmd[4] == 0 { 4 } else { cmd[4] as usize };
                Ok(io.data_in(&sense, alloc_len))
            }
            0x12 => {
                // INQUIRY
                self.inquiry(cmd, io)
            }
            0x15 => {
                // MODE SELECT(6)
                self.mode_select(cmd, cmd[4] as usize, io)
            }
            0x16 | 0x17 => {
                // RESERVE / RELEASE
                Ok(io.good())
            }
            0x1A => {
                // MODE SENSE(6)
                self.mode_sense(cmd, io, false)
            }
            0x1D => {
                // SEND DIAGNOSTIC
                let self_test = cmd[1] & 0x04 != 0;
                let param_len = u16::from_be_bytes(cmd[3..5].try_into()?);
                if self_test && param_len == 0 {
                    Ok(io.good())
                } else {
                    log::warn!("SEND DIAGNOSTIC without self test");
                    Ok(io.invalid_field())
                }
            }
            0x1E => {
                // PREVENT/ALLOW MEDIUM REMOVAL
                self.set_prevent_removal(cmd[4] & 0x01 != 0);
                Ok(io.good())
            }
            0x55 => {
                // MODE SELECT(10)
                let len = u16::from_be_bytes(cmd[7..9].try_into()?) as usize;
                self.mode_select(cmd, len, io)
            }
            0x5A => {
                // MODE SENSE(10)
                self.mode_sense(cmd, io, true)
            }
            _ => self.specific_cmd(cmd, io),
        }
    }

    fn inquiry(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        if cmd[1] & 0x01 != 0 {
            log::warn!("INQUIRY for vital product data page {:02X}", cmd[2]);
            return Ok(io.invalid_field());
        }

        let desc = self.descriptor();
        let mut result = [0; 36];

        // 0 Peripheral qualifier (7-5), peripheral device type (4-0)
        result[0] = if io.lun == 0 {
            (desc.qualifier << 5) | desc.class.peripheral_type()
        } else {
            // Not capable of supporting a device on this LUN
            0x7F
        };
        // Removable medium (7)
        result[1] = if desc.removable { 0x80 } else { 0 };
        result[2] = desc.version;
        // Response data format
        result[3] = if desc.version >= 2 { 2 } else { 1 };
        // 4 Additional length (N-4)
        result[4] = (result.len() - 5) as u8;

        // 8..16 Vendor identification
        inquiry_string(&mut result[8..16], &desc.vendor);
        // 16..32 Product identification
        inquiry_string(&mut result[16..32], &desc.product);
        // 32..36 Revision
        inquiry_string(&mut result[32..36], &desc.revision);

        Ok(io.data_in(&result, cmd[4] as usize))
    }

    /// MODE SELECT: parameters are accepted and ignored
    fn mode_select(&mut self, cmd: &[u8], param_len: usize, io: &mut TargetIo) -> Result<Action> {
        if cmd[1] & 0x01 != 0 {
            // Save pages
            return Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_SAVING_PARAMS_NOT_SUPPORTED));
        }
        if param_len > 0 && io.payload().is_none() {
            return Ok(Action::DataOut(param_len));
        }
        if param_len > 0 {
            log::debug!("MODE SELECT parameters ignored");
        }
        Ok(io.good())
    }

    fn mode_sense(&mut self, cmd: &[u8], io: &mut TargetIo, ten: bool) -> Result<Action> {
        let dbd = cmd[1] & 0x08 != 0;
        let page = cmd[2] & 0x3F;
        let (header_len, alloc_len) = if ten {
            (8, u16::from_be_bytes(cmd[7..9].try_into()?) as usize)
        } else {
            (4, cmd[4] as usize)
        };

        if page == MODE_PAGE_CACHING {
            log::warn!("MODE SENSE for caching page");
            return Ok(io.invalid_field());
        }

        let single = [page];
        let pages = if page == MODE_PAGE_ALL {
            self.mode_page_codes()
        } else {
            &single[..]
        };

        let mut len = header_len;
        let bd_len = if dbd { 0 } else { 8 };
        if !dbd {
            // Block descriptor
            let blocks = self.blocks().unwrap_or(0).min(0xFF_FFFF) as u32;
            let blocksize = self.descriptor().block_size as u32;
            let bd = &mut io.buf[len..(len + 8)];
            bd[0] = self.ms_density();
            bd[1..4].copy_from_slice(&blocks.to_be_bytes()[1..4]);
            bd[4] = 0;
            bd[5..8].copy_from_slice(&blocksize.to_be_bytes()[1..4]);
            len += bd_len;
        }

        for &code in pages {
            let Some(data) = self.mode_page(code) else {
                log::warn!("Unsupported mode page {:02X}", code);
                return Ok(io.invalid_field());
            };
            io.buf[len..(len + data.len())].copy_from_slice(&data);
            len += data.len();
        }

        // Mode parameter header
        if ten {
            io.buf[0..2].copy_from_slice(&((len - 2) as u16).to_be_bytes());
            io.buf[2] = self.ms_media_type();
            io.buf[3] = self.ms_device_specific();
            io.buf[4] = 0;
            io.buf[5] = 0;
            io.buf[6..8].copy_from_slice(&(bd_len as u16).to_be_bytes());
        } else {
            io.buf[0] = (len - 1) as u8;
            io.buf[1] = self.ms_media_type();
            io.buf[2] = self.ms_device_specific();
            io.buf[3] = bd_len as u8;
        }

        Ok(Action::DataIn(len.min(alloc_len)))
    }

    /// READ CAPACITY(10)
    fn read_capacity(&mut self, io: &mut TargetIo) -> Result<Action> {
        let Some(blocks) = self.blocks().filter(|_| self.ready()) else {
            return Ok(io.not_ready());
        };
        let mut result = [0; 8];
        let last = blocks.saturating_sub(1).min(u32::MAX as usize) as u32;
        result[0..4].copy_from_slice(&last.to_be_bytes());
        result[4..8].copy_from_slice(&(self.descriptor().block_size as u32).to_be_bytes());
        Ok(io.data_in(&result, result.len()))
    }
}
