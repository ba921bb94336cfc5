//! SCSI CD-ROM drive

use anyhow::Result;

use super::ASC_INVALID_COMMAND;
use super::Action;
use super::CC_KEY_ILLEGAL_REQUEST;
use super::disk::{lba_count6, lba_count10, read_blocks};
use super::disk_image::DiskImage;
use super::target::{DeviceDescriptor, ModePage, ScsiTarget, StartStopFlags, TargetIo, mode_page};

const TRACK_LEADOUT: u8 = 0xAA;

pub struct ScsiTargetCdrom {
    descriptor: DeviceDescriptor,

    /// Disc contents, None if no disc inserted
    disk: Option<Box<dyn DiskImage>>,

    prevent_removal: bool,
}

impl ScsiTargetCdrom {
    pub fn new(descriptor: DeviceDescriptor, disk: Option<Box<dyn DiskImage>>) -> Self {
        Self {
            descriptor,
            disk,
            prevent_removal: false,
        }
    }

    pub fn load_media(&mut self, disk: Box<dyn DiskImage>) {
        self.disk = Some(disk);
    }

    pub fn image(&self) -> Option<&dyn DiskImage> {
        self.disk.as_deref()
    }

    /// Track descriptor: control, track number and start block
    fn track_descriptor(dest: &mut [u8], track: u8, start: usize) {
        // 0 reserved
        // Digital
        dest[1] = 0x14;
        dest[2] = track;
        // 3 reserved
        dest[4..8].copy_from_slice(&(start as u32).to_be_bytes());
    }

    fn read_toc(&self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        let format = cmd[9] >> 6;
        let track = cmd[6];
        let alloc_len = u16::from_be_bytes(cmd[7..9].try_into()?) as usize;
        let Some(blocks) = self.blocks() else {
            return Ok(io.not_ready());
        };

        match format {
            0 => {
                // SCSI-2 TOC
                let mut result = [0; 0x14];
                // First track
                result[2] = 1;
                // Last track
                result[3] = 1;
                let len = match track {
                    0 | 1 => {
                        Self::track_descriptor(&mut result[4..12], 1, 0);
                        Self::track_descriptor(&mut result[12..20], TRACK_LEADOUT, blocks);
                        0x14
                    }
                    TRACK_LEADOUT => {
                        Self::track_descriptor(&mut result[4..12], TRACK_LEADOUT, blocks);
                        12
                    }
                    _ => {
                        log::warn!("READ TOC for unknown track {}", track);
                        return Ok(io.invalid_field());
                    }
                };
                // Length (N-2)
                result[1] = (len - 2) as u8;
                Ok(io.data_in(&result[..len], alloc_len))
            }
            1 => {
                // Session TOC
                let mut result = [0; 12];
                result[1] = 0x0A;
                // First session
                result[2] = 1;
                // Last session
                result[3] = 1;
                Self::track_descriptor(&mut result[4..12], 1, 0);
                Ok(io.data_in(&result, alloc_len))
            }
            _ => {
                log::warn!("Unknown READ TOC format: {}", format);
                Ok(io.invalid_field())
            }
        }
    }

    fn read(&self, lba: usize, count: usize, io: &mut TargetIo) -> Result<Action> {
        let Some(disk) = self.disk.as_deref() else {
            return Ok(io.not_ready());
        };
        // Images may not be aligned on the block size, the last block is
        // padded with zeroes.
        read_blocks(disk, self.descriptor.block_size, lba, count, io)
    }
}

impl ScsiTarget for ScsiTargetCdrom {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn ready(&self) -> bool {
        self.disk.is_some()
    }

    fn write_protected(&self) -> bool {
        true
    }

    fn set_prevent_removal(&mut self, prevent: bool) {
        self.prevent_removal = prevent;
    }

    fn blocks(&self) -> Option<usize> {
        let disk = self.disk.as_ref()?;
        let block_size = self.descriptor.block_size;
        (block_size > 0).then(|| disk.byte_len().div_ceil(block_size))
    }

    fn mode_page_codes(&self) -> &'static [u8] {
        &[0x01, 0x02, 0x0A, 0x0D]
    }

    fn mode_page(&self, page: u8) -> Option<ModePage> {
        match page {
            // Read error recovery, can remain at 0
            0x01 => Some(mode_page(0x01, &[0; 6])),
            // Disconnect-reconnect
            0x02 => Some(mode_page(0x02, &[0; 0x0E])),
            // Control mode
            0x0A => Some(mode_page(0x0A, &[0; 6])),
            0x0D => {
                // CD-ROM parameters page
                let mut params = [0; 6];
                // Inactivity timer multiplier
                params[1] = 0x05;
                // S units per M unit
                params[2..4].copy_from_slice(&60u16.to_be_bytes());
                // F units per S unit
                params[4..6].copy_from_slice(&75u16.to_be_bytes());
                Some(mode_page(0x0D, &params))
            }
            _ => None,
        }
    }

    fn ms_density(&self) -> u8 {
        1 // User data only, 2048 bytes
    }

    fn ms_media_type(&self) -> u8 {
        2 // 120mm CD-ROM
    }

    fn ms_device_specific(&self) -> u8 {
        0x80
    }

    fn specific_cmd(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        match cmd[0] {
            // READ(6)
            0x08 => {
                let (lba, count) = lba_count6(cmd);
                self.read(lba, count, io)
            }
            // START/STOP UNIT
            0x1B => {
                let flags = StartStopFlags(cmd[4]);
                if flags.loej() && !flags.start() {
                    if self.prevent_removal {
                        return Ok(io.removal_prevented());
                    }
                    log::debug!("CD-ROM ejected");
                    self.disk = None;
                }
                Ok(io.good())
            }
            // READ CAPACITY(10)
            0x25 => self.read_capacity(io),
            // READ(10)
            0x28 => {
                let (lba, count) = lba_count10(cmd)?;
                self.read(lba, count, io)
            }
            // READ TOC
            0x43 => self.read_toc(cmd, io),
            _ => {
                log::warn!("Unknown CD-ROM command {:02X}", cmd[0]);
                Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND))
            }
        }
    }
}
