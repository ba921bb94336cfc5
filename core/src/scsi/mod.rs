//! SCSI bus engine, targets and associated code

pub mod bus;
pub mod cdrom;
pub mod disk;
pub mod disk_image;
pub mod initiator;
pub mod sense;
pub mod tape;
pub mod target;


pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

pub const CC_KEY_NO_SENSE: u8 = 0x00;
pub const CC_KEY_NOT_READY: u8 = 0x02;
pub const CC_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const CC_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const CC_KEY_DATA_PROTECT: u8 = 0x07;
pub const CC_KEY_BLANK_CHECK: u8 = 0x08;

pub const ASC_NO_SENSE: u8 = 0x00;
pub const ASC_INVALID_COMMAND: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
pub const ASC_LUN_NOT_SUPPORTED: u8 = 0x25;
pub const ASC_WRITE_PROTECTED: u8 = 0x27;
pub const ASC_SAVING_PARAMS_NOT_SUPPORTED: u8 = 0x39;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub const ASC_MEDIUM_REMOVAL_PREVENTED: u8 = 0x53;

/// With ASC_NO_SENSE
pub const ASCQ_FILEMARK_DETECTED: u8 = 0x01;
/// With ASC_NO_SENSE
pub const ASCQ_BOP_DETECTED: u8 = 0x04;
/// With ASC_NO_SENSE
pub const ASCQ_END_OF_DATA_DETECTED: u8 = 0x05;
/// With ASC_MEDIUM_REMOVAL_PREVENTED
pub const ASCQ_REMOVAL_PREVENTED: u8 = 0x02;

pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;
pub const MSG_IDENTIFY: u8 = 0x80;

/// Longest command descriptor block the engine decodes
pub const MAX_CDB_LEN: usize = 12;

/// Command descriptor block length from the group code (top 3 bits) of
/// the operation code. Returns 0 for groups that cannot be decoded
/// (reserved and vendor specific).
pub const fn decode_group(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        3 => 12,
        _ => 0,
    }
}

/// Result of feeding buffered bytes to a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// This many bytes formed a complete unit and were taken
    Consumed(usize),
    /// Not enough bytes buffered yet, nothing was taken
    NeedMore,
}

/// What a command handler asks the bus to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Immediately turn to the Status phase
    Status,
    /// Returns this many bytes from the transfer buffer to the initiator,
    /// followed by the deferred status
    DataIn(usize),
    /// Expects this many bytes written to the target, after which the
    /// handler runs again with the payload
    DataOut(usize),
}

/// Progress of the command in flight on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Selected, the CDB has not fully arrived
    AwaitingCdb,
    /// The CDB was accepted and the handler waits for its DATA-OUT payload
    AwaitingPayload { len: usize },
    /// No command in flight
    Complete,
}

#[cfg(test)]
mod group_tests {
    use super::*;

    #[test]
    fn cdb_framing() {
        assert_eq!(decode_group(0x00), 6);
        assert_eq!(decode_group(0x1F), 6);
        assert_eq!(decode_group(0x25), 10);
        assert_eq!(decode_group(0x5A), 10);
        assert_eq!(decode_group(0x60), 12);
        for opcode in [0x80, 0xA8, 0xC0, 0xE0, 0xFF] {
            assert_eq!(decode_group(opcode), 0);
        }
    }
}
