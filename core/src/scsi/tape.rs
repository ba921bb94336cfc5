//! SCSI tape drive (sequential-access device)

use anyhow::Result;
use proc_bitfield::bitfield;
use scsibus_tape::{Direction, MtError, SpaceError, TapeMedium};

use super::sense::SenseKey;
use super::target::{DeviceDescriptor, ModePage, ScsiTarget, TargetIo, mode_page};
use super::{
    ASC_INVALID_COMMAND, ASC_MEDIUM_NOT_PRESENT, ASC_NO_SENSE, ASC_WRITE_PROTECTED,
    ASCQ_BOP_DETECTED, ASCQ_END_OF_DATA_DETECTED, ASCQ_FILEMARK_DETECTED, Action,
    CC_KEY_BLANK_CHECK, CC_KEY_DATA_PROTECT, CC_KEY_ILLEGAL_REQUEST, CC_KEY_NO_SENSE,
    CC_KEY_NOT_READY, STATUS_CHECK_CONDITION,
};

bitfield! {
    /// READ(6)/WRITE(6) CDB byte 1
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TapeRwFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Transfer length is in blocks of the fixed block size
        pub fixed: bool @ 0,
        /// Suppress incorrect length indicator
        pub sili: bool @ 1,
    }
}

bitfield! {
    /// LOAD UNLOAD CDB byte 4
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub load: bool @ 0,
        pub reten: bool @ 1,
        pub eot: bool @ 2,
    }
}

/// SPACE codes
const SPACE_BLOCKS: u8 = 0;
const SPACE_FILEMARKS: u8 = 1;
const SPACE_END_OF_DATA: u8 = 3;

/// 24-bit big endian transfer length in CDB bytes 2..5
fn transfer_len(cmd: &[u8]) -> usize {
    u32::from_be_bytes([0, cmd[2], cmd[3], cmd[4]]) as usize
}

/// Sign-extended 24-bit count of a SPACE CDB
fn space_count(cmd: &[u8]) -> i32 {
    i32::from_be_bytes([cmd[2], cmd[3], cmd[4], 0]) >> 8
}

/// Translates a tape medium status into a deferred CHECK CONDITION
pub(super) fn tape_status(io: &mut TargetIo, err: MtError) -> Action {
    let (key, asc, ascq) = match err {
        MtError::Eom => (
            SenseKey(CC_KEY_BLANK_CHECK).with_eom(true),
            ASC_NO_SENSE,
            ASCQ_END_OF_DATA_DETECTED,
        ),
        MtError::TapeMark => (
            SenseKey(CC_KEY_NO_SENSE).with_filemark(true),
            ASC_NO_SENSE,
            ASCQ_FILEMARK_DETECTED,
        ),
        MtError::WriteProtect => (SenseKey(CC_KEY_DATA_PROTECT), ASC_WRITE_PROTECTED, 0),
        MtError::Unattached => (SenseKey(CC_KEY_NOT_READY), ASC_MEDIUM_NOT_PRESENT, 0),
        // Beginning of partition shares the EOM bit, told apart by the ASCQ
        MtError::Bot => (
            SenseKey(CC_KEY_NO_SENSE).with_eom(true),
            ASC_NO_SENSE,
            ASCQ_BOP_DETECTED,
        ),
        MtError::InvalidRecordLength { .. } => {
            (SenseKey(CC_KEY_NO_SENSE).with_ili(true), ASC_NO_SENSE, 0)
        }
        MtError::IoError | MtError::FormatError | MtError::RecordError => {
            log::warn!("Tape error: {}", err);
            (SenseKey(CC_KEY_NO_SENSE), ASC_NO_SENSE, 0)
        }
    };
    io.status_deferred(STATUS_CHECK_CONDITION, key, asc);
    io.sense.ascq = ascq;
    Action::Status
}

pub struct ScsiTargetTape {
    descriptor: DeviceDescriptor,
    tape: Option<Box<dyn TapeMedium>>,
    prevent_removal: bool,
}

impl ScsiTargetTape {
    pub fn new(descriptor: DeviceDescriptor, tape: Option<Box<dyn TapeMedium>>) -> Self {
        Self {
            descriptor,
            tape,
            prevent_removal: false,
        }
    }

    pub fn load_media(&mut self, tape: Box<dyn TapeMedium>) {
        self.tape = Some(tape);
    }

    pub fn medium(&self) -> Option<&dyn TapeMedium> {
        self.tape.as_deref()
    }

    fn read(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        let flags = TapeRwFlags(cmd[1]);
        let len = transfer_len(cmd);
        let blocksize = self.descriptor.block_size;
        let Some(tape) = self.tape.as_mut().filter(|t| t.is_attached()) else {
            return Ok(io.not_ready());
        };
        if len == 0 {
            return Ok(io.good());
        }

        if flags.fixed() {
            if blocksize == 0 {
                log::warn!("Fixed block read without a block size");
                return Ok(io.invalid_field());
            }
            if len * blocksize > io.buf.len() {
                return Ok(io.invalid_field());
            }
            for i in 0..len {
                let block = &mut io.buf[(i * blocksize)..((i + 1) * blocksize)];
                let err = match tape.read_record(block) {
                    Ok(n) if n == blocksize => continue,
                    Ok(_) => MtError::InvalidRecordLength { len: 0 },
                    Err(e) => e,
                };
                tape_status(io, err);
                io.sense.info = Some((len - i) as i32);
                return Ok(Action::DataIn(i * blocksize));
            }
            return Ok(Action::DataIn(len * blocksize));
        }

        if len > io.buf.len() {
            return Ok(io.invalid_field());
        }
        match tape.read_record(&mut io.buf[..len]) {
            Ok(n) if n == len => Ok(Action::DataIn(n)),
            Ok(n) => {
                // Underlength
                if !flags.sili() {
                    tape_status(io, MtError::InvalidRecordLength { len: n });
                    io.sense.info = Some((len - n) as i32);
                }
                Ok(Action::DataIn(n))
            }
            Err(MtError::InvalidRecordLength { len: actual }) => {
                // Overlength, the first `len` bytes were transferred
                if !flags.sili() {
                    tape_status(io, MtError::InvalidRecordLength { len: actual });
                    io.sense.info = Some(len as i32 - actual as i32);
                }
                Ok(Action::DataIn(len))
            }
            Err(e) => {
                tape_status(io, e);
                io.sense.info = Some(len as i32);
                Ok(Action::Status)
            }
        }
    }

    fn write(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        let flags = TapeRwFlags(cmd[1]);
        let len = transfer_len(cmd);
        let blocksize = if flags.fixed() {
            self.descriptor.block_size
        } else {
            len
        };
        let Some(tape) = self.tape.as_mut().filter(|t| t.is_attached()) else {
            return Ok(io.not_ready());
        };
        if tape.write_protected() {
            return Ok(tape_status(io, MtError::WriteProtect));
        }
        if flags.fixed() && blocksize == 0 {
            log::warn!("Fixed block write without a block size");
            return Ok(io.invalid_field());
        }
        let total = if flags.fixed() { len * blocksize } else { len };
        if total == 0 {
            return Ok(io.good());
        }

        let Some(data) = io.payload() else {
            return Ok(Action::DataOut(total));
        };
        let result = data
            .chunks(blocksize)
            .enumerate()
            .try_for_each(|(i, block)| tape.write_record(block).map_err(|e| (i, e)));
        match result {
            Ok(()) => Ok(io.good()),
            Err((i, e)) => {
                tape_status(io, e);
                if flags.fixed() {
                    io.sense.info = Some((len - i) as i32);
                } else {
                    io.sense.info = Some(len as i32);
                }
                Ok(Action::Status)
            }
        }
    }

    fn space(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        let code = cmd[1] & 0x07;
        let count = space_count(cmd);
        let Some(tape) = self.tape.as_mut().filter(|t| t.is_attached()) else {
            return Ok(io.not_ready());
        };
        let dir = if count < 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let n = count.unsigned_abs() as usize;

        let result = match code {
            SPACE_BLOCKS => tape.space_records(n, dir),
            SPACE_FILEMARKS => tape.space_files(n, dir),
            SPACE_END_OF_DATA => loop {
                match tape.space_files(1, Direction::Forward) {
                    Ok(()) => (),
                    Err(SpaceError {
                        cause: MtError::Eom,
                        ..
                    }) => break Ok(()),
                    Err(e) => break Err(e),
                }
            },
            _ => {
                log::warn!("Unsupported SPACE code {}", code);
                return Ok(io.invalid_field());
            }
        };

        match result {
            Ok(()) => Ok(io.good()),
            Err(SpaceError { skipped, cause }) => {
                log::debug!("SPACE {} {} stopped: {}", count, dir, cause);
                tape_status(io, cause);
                io.sense.info = Some(n.saturating_sub(skipped) as i32 * count.signum());
                Ok(Action::Status)
            }
        }
    }

    fn load_unload(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        let flags = LoadFlags(cmd[4]);
        if !flags.load() && flags.eot() {
            log::warn!("UNLOAD with EOT");
            return Ok(io.invalid_field());
        }
        if !flags.load() && self.prevent_removal {
            return Ok(io.removal_prevented());
        }
        let Some(tape) = self.tape.as_mut().filter(|t| t.is_attached()) else {
            return Ok(io.not_ready());
        };
        let result = if flags.load() {
            tape.rewind()
        } else {
            tape.detach()
        };
        match result {
            Ok(()) => Ok(io.good()),
            Err(e) => Ok(tape_status(io, e)),
        }
    }
}

impl ScsiTarget for ScsiTargetTape {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn ready(&self) -> bool {
        self.tape.as_ref().is_some_and(|t| t.is_attached())
    }

    fn write_protected(&self) -> bool {
        self.tape.as_ref().is_some_and(|t| t.write_protected())
    }

    fn set_prevent_removal(&mut self, prevent: bool) {
        self.prevent_removal = prevent;
    }

    fn blocks(&self) -> Option<usize> {
        None
    }

    fn mode_page_codes(&self) -> &'static [u8] {
        &[0x01, 0x02, 0x0A, 0x10]
    }

    fn mode_page(&self, page: u8) -> Option<ModePage> {
        match page {
            // Read/write error recovery
            0x01 => Some(mode_page(0x01, &[0; 10])),
            // Disconnect-reconnect
            0x02 => Some(mode_page(0x02, &[0; 0x0E])),
            // Control mode
            0x0A => Some(mode_page(0x0A, &[0; 6])),
            0x10 => {
                // Device configuration page
                let mut params = [0; 0x0E];
                // Gap size
                params[7] = self.descriptor.gap_length.min(0xFF) as u8;
                // EEG: erase at end of data on write
                params[8] = 0x10;
                Some(mode_page(0x10, &params))
            }
            _ => None,
        }
    }

    fn ms_density(&self) -> u8 {
        0
    }

    fn ms_device_specific(&self) -> u8 {
        // Buffered mode 1
        let wp = if self.write_protected() { 0x80 } else { 0 };
        wp | 0x10
    }

    fn specific_cmd(&mut self, cmd: &[u8], io: &mut TargetIo) -> Result<Action> {
        match cmd[0] {
            0x01 => {
                // REWIND
                let Some(tape) = self.tape.as_mut() else {
                    return Ok(io.not_ready());
                };
                match tape.rewind() {
                    Ok(()) => Ok(io.good()),
                    Err(e) => Ok(tape_status(io, e)),
                }
            }
            0x05 => {
                // READ BLOCK LIMITS
                let max = (io.buf.len().min(0xFF_FFFF) as u32).to_be_bytes();
                let mut result = [0; 6];
                result[1..4].copy_from_slice(&max[1..4]);
                result[4..6].copy_from_slice(&1u16.to_be_bytes());
                Ok(io.data_in(&result, result.len()))
            }
            0x08 => {
                // READ(6)
                self.read(cmd, io)
            }
            0x0A => {
                // WRITE(6)
                self.write(cmd, io)
            }
            0x10 => {
                // WRITE FILEMARKS
                let count = transfer_len(cmd);
                let Some(tape) = self.tape.as_mut() else {
                    return Ok(io.not_ready());
                };
                match (0..count).try_for_each(|_| tape.write_tapemark()) {
                    Ok(()) => Ok(io.good()),
                    Err(e) => Ok(tape_status(io, e)),
                }
            }
            0x11 => {
                // SPACE
                self.space(cmd, io)
            }
            0x19 => {
                // ERASE
                let gap = self.descriptor.gap_length;
                let Some(tape) = self.tape.as_mut() else {
                    return Ok(io.not_ready());
                };
                let result = if cmd[1] & 0x01 != 0 {
                    tape.erase_to_eom()
                } else {
                    tape.write_gap(gap)
                };
                match result {
                    Ok(()) => Ok(io.good()),
                    Err(e) => Ok(tape_status(io, e)),
                }
            }
            0x1B => {
                // LOAD/UNLOAD
                self.load_unload(cmd, io)
            }
            _ => {
                log::warn!("Unknown tape command {:02X}", cmd[0]);
                Ok(io.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::ASC_INVALID_FIELD_IN_CDB;
    use crate::scsi::sense::Sense;
    use crate::scsi::target::DeviceClass;
    use scsibus_tape::TapeImage;

    fn tape_with(records: &[&[u8]]) -> ScsiTargetTape {
        let mut image = TapeImage::blank();
        for r in records {
            image.write_record(r).unwrap();
        }
        image.write_tapemark().unwrap();
        image.rewind().unwrap();
        ScsiTargetTape::new(
            DeviceDescriptor::for_class(DeviceClass::Tape),
            Some(Box::new(image)),
        )
    }

    fn run(target: &mut ScsiTargetTape, cmd: &[u8], buf: &mut [u8]) -> (Action, Sense) {
        let mut sense = Sense::good();
        let last = Sense::good();
        let mut io = TargetIo {
            buf,
            payload: None,
            sense: &mut sense,
            last_sense: &last,
            lun: 0,
        };
        let action = target.cmd(cmd, &mut io).unwrap();
        (action, sense)
    }

    #[test]
    fn space_count_sign() {
        assert_eq!(space_count(&[0x11, 0, 0, 0, 3, 0]), 3);
        assert_eq!(space_count(&[0x11, 0, 0xFF, 0xFF, 0xFF, 0]), -1);
        assert_eq!(space_count(&[0x11, 0, 0xFF, 0xFF, 0xFE, 0]), -2);
    }

    #[test]
    fn status_mapping() {
        let mut buf = [0; 16];
        let mut sense = Sense::good();
        let last = Sense::good();
        let mut io = TargetIo {
            buf: &mut buf,
            payload: None,
            sense: &mut sense,
            last_sense: &last,
            lun: 0,
        };

        tape_status(&mut io, MtError::TapeMark);
        assert_eq!(io.sense.status, STATUS_CHECK_CONDITION);
        assert!(io.sense.key.filemark());
        assert_eq!(io.sense.key.key(), CC_KEY_NO_SENSE);
        assert_eq!(io.sense.ascq, ASCQ_FILEMARK_DETECTED);

        tape_status(&mut io, MtError::Eom);
        assert_eq!(io.sense.key.key(), CC_KEY_BLANK_CHECK);
        assert!(io.sense.key.eom());

        tape_status(&mut io, MtError::Bot);
        assert_eq!(io.sense.key.key(), CC_KEY_NO_SENSE);
        assert!(io.sense.key.eom());
        assert_eq!(io.sense.ascq, ASCQ_BOP_DETECTED);

        tape_status(&mut io, MtError::WriteProtect);
        assert_eq!(io.sense.key.key(), CC_KEY_DATA_PROTECT);
        assert_eq!(io.sense.asc, ASC_WRITE_PROTECTED);

        tape_status(&mut io, MtError::FormatError);
        assert_eq!(io.sense.key, SenseKey(CC_KEY_NO_SENSE));
        assert_eq!(io.sense.status, STATUS_CHECK_CONDITION);
    }

    #[test]
    fn read_overlength() {
        let mut target = tape_with(&[&[7; 12]]);
        let mut buf = [0; 64];

        let (action, sense) = run(&mut target, &[0x08, 0, 0, 0, 8, 0], &mut buf);
        assert_eq!(action, Action::DataIn(8));
        assert!(sense.key.ili());
        assert_eq!(sense.info, Some(-4));

        let (_, sense) = run(&mut target, &[0x01, 0, 0, 0, 0, 0], &mut buf);
        assert_eq!(sense.status, 0);
        let (action, sense) = run(&mut target, &[0x08, 0x02, 0, 0, 8, 0], &mut buf);
        assert_eq!(action, Action::DataIn(8));
        assert_eq!(sense, Sense::good());
    }

    #[test]
    fn read_tapemark() {
        let mut target = tape_with(&[]);
        let mut buf = [0; 64];
        let (action, sense) = run(&mut target, &[0x08, 0, 0, 0, 16, 0], &mut buf);
        assert_eq!(action, Action::Status);
        assert!(sense.key.filemark());
        assert_eq!(sense.info, Some(16));
    }

    #[test]
    fn fixed_residue() {
        let mut target = tape_with(&[&[1; 512], &[2; 512]]);
        let mut buf = vec![0; 512 * 4];
        let (action, sense) = run(&mut target, &[0x08, 0x01, 0, 0, 4, 0], &mut buf);
        assert_eq!(action, Action::DataIn(1024));
        assert!(sense.key.filemark());
        assert_eq!(sense.info, Some(2));
        assert_eq!(buf[512], 2);
    }

    #[test]
    fn space_filemarks_and_eod() {
        let mut target = tape_with(&[&[1; 4], &[2; 4]]);
        let mut buf = [0; 64];

        // Space over 3 blocks hits the tape mark after 2
        let (_, sense) = run(&mut target, &[0x11, SPACE_BLOCKS, 0, 0, 3, 0], &mut buf);
        assert!(sense.key.filemark());
        assert_eq!(sense.info, Some(1));

        // Back over the tape mark and both records
        let (_, sense) = run(&mut target, &[0x11, SPACE_FILEMARKS, 0xFF, 0xFF, 0xFF, 0], &mut buf);
        assert_eq!(sense, Sense::good());
        let (_, sense) = run(&mut target, &[0x11, SPACE_BLOCKS, 0xFF, 0xFF, 0xFD, 0], &mut buf);
        assert!(sense.key.eom());
        assert_eq!(sense.ascq, ASCQ_BOP_DETECTED);
        assert_eq!(sense.info, Some(-1));

        let (_, sense) = run(&mut target, &[0x11, SPACE_END_OF_DATA, 0, 0, 0, 0], &mut buf);
        assert_eq!(sense, Sense::good());
        let (_, sense) = run(&mut target, &[0x08, 0, 0, 0, 4, 0], &mut buf);
        assert_eq!(sense.key.key(), CC_KEY_BLANK_CHECK);

        let (_, sense) = run(&mut target, &[0x11, 2, 0, 0, 1, 0], &mut buf);
        assert_eq!(sense.asc, ASC_INVALID_FIELD_IN_CDB);
    }

    #[test]
    fn block_limits() {
        let mut target = tape_with(&[]);
        let mut buf = [0; 4096];
        let (action, _) = run(&mut target, &[0x05, 0, 0, 0, 0, 0], &mut buf);
        assert_eq!(action, Action::DataIn(6));
        assert_eq!(&buf[0..6], &[0, 0, 0x10, 0, 0, 1]);
    }

    #[test]
    fn unload() {
        let mut target = tape_with(&[&[1; 4]]);
        let mut buf = [0; 64];

        let (_, sense) = run(&mut target, &[0x1B, 0, 0, 0, 0x04, 0], &mut buf);
        assert_eq!(sense.asc, ASC_INVALID_FIELD_IN_CDB);

        let (_, sense) = run(&mut target, &[0x1B, 0, 0, 0, 0x01, 0], &mut buf);
        assert_eq!(sense, Sense::good());
        let (_, sense) = run(&mut target, &[0x1B, 0, 0, 0, 0x00, 0], &mut buf);
        assert_eq!(sense, Sense::good());
        assert!(!target.ready());
        let (_, sense) = run(&mut target, &[0x00, 0, 0, 0, 0, 0], &mut buf);
        assert_eq!(sense.key.key(), CC_KEY_NOT_READY);
    }
}
