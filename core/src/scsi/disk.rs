//! SCSI hard disk drive (direct-access block device)

use anyhow::Result;

use super::ASC_INVALID_COMMAND;
use super::ASC_LBA_OUT_OF_RANGE;
use super::ASC_WRITE_PROTECTED;
use super::Action;
use super::CC_KEY_DATA_PROTECT;
use super::CC_KEY_ILLEGAL_REQUEST;
use super::STATUS_CHECK_CONDITION;
use super::disk_image::DiskImage;
use super::sense::SenseKey;
use super::target::{DeviceDescriptor, ModePage, ScsiTarget, StartStopFlags, TargetIo, mode_page};

/// Heads reported in the rigid disk geometry page
const GEOMETRY_HEADS: usize = 16;
/// Sectors per track reported in the format device page
const GEOMETRY_SECTORS: usize = 63;

/// Logical block address and block count of a READ(6)/WRITE(6) CDB
pub(super) fn lba_count6(cmd: &[u8]) -> (usize, usize) {
    let lba = u32::from_be_bytes([0, cmd[1] & 0x1F, cmd[2], cmd[3]]) as usize;
    let count = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
    (lba, count)
}

/// Logical block address and block count of a READ(10)/WRITE(10) CDB
pub(super) fn lba_count10(cmd: &[u8]) -> Result<(usize, usize)> {
    let lba = u32::from_be_bytes(cmd[2..6].try_into()?) as usize;
    let count = u16::from_be_bytes(cmd[7..9].try_into()?) as usize;
    Ok((lba, count))
}

/// Reads `count` blocks from an image into the transfer buffer
pub(super) fn read_blocks(
    disk: &dyn DiskImage,
    blocksize: usize,
    lba: usize,
    count: usize,
    io: &mut TargetIo,
) -> Result<Action> {
    if blocksize == 0 {
        log::error!("Read from a unit without a block size");
        return Ok(io.invalid_field());
    }
    let blocks = disk.byte_len().div_ceil(blocksize);
    if lba + count > blocks {
        log::warn!("Reading beyond disk: {} + {} > {}", lba, count, blocks);
        return Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE));
    }
    let Some(out) = io.data_buffer(count * blocksize) else {
        log::warn!("Read of {} blocks exceeds transfer buffer", count);
        return Ok(io.invalid_field());
    };
    disk.read_bytes(lba * blocksize, out)?;
    Ok(Action::DataIn(count * blocksize))
}

pub struct ScsiTargetDisk {
    descriptor: DeviceDescriptor,

    /// Disk contents, None if no medium
    disk: Option<Box<dyn DiskImage>>,

    prevent_removal: bool,
}

impl ScsiTargetDisk {
    pub fn new(descriptor: DeviceDescriptor, disk: Option<Box<dyn DiskImage>>) -> Self {
        Self {
            descriptor,
            disk,
            prevent_removal: false,
        }
    }

    /// Inserts a medium, replacing any present
    pub fn load_media(&mut self, disk: Box<dyn DiskImage>) {
        self.disk = Some(disk);
    }

    pub fn image(&self) -> Option<&dyn DiskImage> {
        self.disk.as_deref()
    }

    fn blocksize(&self) -> usize {
        self.descriptor.block_size
    }

    fn cylinders(&self) -> usize {
        self.blocks()
            .unwrap_or(0)
            .div_ceil(GEOMETRY_HEADS * GEOMETRY_SECTORS)
    }

    fn in_range(&self, lba: usize, count: usize) -> bool {
        lba + count <= self.blocks().unwrap_or(0)
    }

    fn read(&mut self, lba: usize, count: usize, io: &mut TargetIo) -> Result<Action> {
        let blocksize = self.blocksize();
        let Some(disk) = self.disk.as_deref() else {
            // No medium reads as zeroes rather than NOT READY
            let Some(out) = io.data_buffer(count * blocksize) else {
                return Ok(io.invalid_field());
            };
            out.fill(0);
            return Ok(Action::DataIn(count * blocksize));
        };
        read_blocks(disk, blocksize, lba, count, io)
    }

    fn write(&mut self, lba: usize, count: usize, io: &mut TargetIo) -> Result<Action> {
        let blocksize = self.blocksize();
        let in_range = self.in_range(lba, count);
        let Some(disk) = self.disk.as_mut() else {
            return Ok(io.not_ready());
        };
        if disk.read_only() {
            return Ok(io.check_condition(CC_KEY_DATA_PROTECT, ASC_WRITE_PROTECTED));
        }
        if !in_range {
            log::warn!("Writing beyond disk: {} + {}", lba, count);
            return Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE));
        }

        let Some(data) = io.payload() else {
            return Ok(Action::DataOut(count * blocksize));
        };
        disk.write_bytes(lba * blocksize, data)?;
        Ok(io.good())
    }

    /// SEEK, VERIFY and the like: range check only
    fn position(&self, lba: usize, count: usize, io: &mut TargetIo) -> Action {
        if !self.ready() {
            io.not_ready()
        } else if !self.in_range(lba, count) {
            io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE)
        } else {
            io.good()
        }
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn ready(&self) -> bool {
        self.disk.is_some()
    }

    fn write_protected(&self) -> bool {
        self.disk.as_ref().is_some_and(|d| d.read_only())
    }

    fn set_prevent_removal(&mut self, prevent: bool) {
        self.prevent_removal = prevent;
    }

    fn blocks(&self) -> Option<usize> {
        self.disk.as_ref()?.byte_len().checked_div(self.blocksize())
    }

    fn mode_page_codes(&self) -> &'static [u8] {
        &[0x01, 0x02, 0x03, 0x04, 0x0A]
    }

    fn mode_page(&self, page: u8) -> Option<ModePage> {
        match page {
            0x01 => {
                // Read/write error recovery page
                Some(mode_page(
                    0x01,
                    &[
                        0b1100_0000, // AWRE, ARRE, TB, RC, EER, PER, DTE, DCR
                        8,           // Read retry count
                        0,           // Correction span
                        0,           // Head offset count
                        0,           // Data strobe offset count
                        0,           // Reserved
                        0,           // Write retry count
                        0,           // Reserved
                        0,           // Recovery time limit (MSB)
                        0,           // Recovery time limit (LSB)
                    ],
                ))
            }
            0x02 => {
                // Disconnect-reconnect page
                Some(mode_page(0x02, &[0; 0x0E]))
            }
            0x03 => {
                // Format device page
                let blocksize = self.blocksize() as u16;
                let sectors = GEOMETRY_SECTORS as u16;
                let mut params = [0; 0x16];
                // 0..8 Tracks per zone, alternate sectors/tracks (0)
                params[8..10].copy_from_slice(&sectors.to_be_bytes());
                params[10..12].copy_from_slice(&blocksize.to_be_bytes());
                // Interleave
                params[12..14].copy_from_slice(&1u16.to_be_bytes());
                // 14..18 Track/cylinder skew (0)
                // Flags: hard sectored (6)
                params[18] = 0x40;
                Some(mode_page(0x03, &params))
            }
            0x04 => {
                // Rigid disk drive geometry page
                let cylinders = (self.cylinders().min(0xFF_FFFF) as u32).to_be_bytes();
                let mut params = [0; 0x16];
                params[0..3].copy_from_slice(&cylinders[1..4]);
                params[3] = GEOMETRY_HEADS as u8;
                // Medium rotation rate (RPM)
                params[18..20].copy_from_slice(&3600u16.to_be_bytes());
                Some(mode_page(0x04, &params))
            }
            0x0A => {
                // Control mode page
                Some(mode_page(0x0A, &[0; 6]))
            }
            _ => None,
        }
    }

    fn ms_density(&self) -> u8 {
        0
    }

    fn ms_device_specific(&self) -> u8 {
        if self.write_protected() { 0x80 } else { 0 }
    }

    fn specific_cmd(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        match cmd[0] {
            0x01 => {
                // REZERO UNIT
                Ok(self.position(0, 0, io))
            }
            0x04 => {
                // FORMAT UNIT
                if self.write_protected() {
                    return Ok(io.check_condition(CC_KEY_DATA_PROTECT, ASC_WRITE_PROTECTED));
                }
                Ok(self.position(0, 0, io))
            }
            0x08 => {
                // READ(6)
                let (lba, count) = lba_count6(cmd);
                self.read(lba, count, io)
            }
            0x0A => {
                // WRITE(6)
                let (lba, count) = lba_count6(cmd);
                self.write(lba, count, io)
            }
            0x0B => {
                // SEEK(6)
                let (lba, _) = lba_count6(cmd);
                Ok(self.position(lba, 0, io))
            }
            0x1B => {
                // START/STOP UNIT
                let flags = StartStopFlags(cmd[4]);
                if flags.loej() && !flags.start() && self.descriptor.removable {
                    if self.prevent_removal {
                        return Ok(io.removal_prevented());
                    }
                    self.disk = None;
                }
                Ok(io.good())
            }
            0x25 => {
                // READ CAPACITY(10)
                self.read_capacity(io)
            }
            0x28 => {
                // READ(10)
                let (lba, count) = lba_count10(cmd)?;
                self.read(lba, count, io)
            }
            0x2A => {
                // WRITE(10)
                let (lba, count) = lba_count10(cmd)?;
                self.write(lba, count, io)
            }
            0x2B => {
                // SEEK(10)
                let (lba, _) = lba_count10(cmd)?;
                Ok(self.position(lba, 0, io))
            }
            0x2F => {
                // VERIFY(10)
                let (lba, count) = lba_count10(cmd)?;
                Ok(self.position(lba, count, io))
            }
            0x3E => {
                // READ LONG
                let (lba, len) = lba_count10(cmd)?;
                let blocksize = self.blocksize();
                if len != blocksize {
                    io.status_deferred(
                        STATUS_CHECK_CONDITION,
                        SenseKey(CC_KEY_ILLEGAL_REQUEST).with_ili(true),
                        super::ASC_INVALID_FIELD_IN_CDB,
                    );
                    io.sense.info = Some(len as i32 - blocksize as i32);
                    return Ok(Action::Status);
                }
                self.read(lba, 1, io)
            }
            _ => {
                log::warn!("Unknown disk command {:02X}", cmd[0]);
                Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND))
            }
        }
    }
}
