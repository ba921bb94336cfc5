//! Target-mode SCSI bus engine
//!
//! ## Bus phases and transitions
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> Free
//!
//!     Free --> Arbitration : arbitrate()
//!     Arbitration --> Free : release()
//!     Arbitration --> MessageOut : select() with ATN
//!     Arbitration --> Command : select() without ATN
//!     Arbitration --> Free : select() timeout
//!
//!     MessageOut --> Command : message decoded
//!     MessageOut --> Free : ABORT, BUS DEVICE RESET
//!     Command --> DataOut : write-type command
//!     Command --> DataIn : data returned
//!     Command --> Status : immediate status
//!     DataOut --> Status : payload delivered
//!     DataIn --> Status : data drained
//!     Status --> MessageIn : status byte read
//!     MessageIn --> Free : release() by the initiator
//! ```
//!
//! Bytes enter the engine through [`ScsiBus::write`] and leave through
//! [`ScsiBus::read`]. Partial messages, CDBs and payloads stay buffered
//! until a later `write` completes them.

use std::mem;

use arrayvec::ArrayVec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sense::{Sense, SenseKey};
use super::target::{ScsiTarget, TargetIo};
use super::{
    ASC_INVALID_COMMAND, ASC_INVALID_FIELD_IN_CDB, ASC_NO_SENSE, Action, CC_KEY_HARDWARE_ERROR,
    CC_KEY_ILLEGAL_REQUEST, CommandState, MAX_CDB_LEN, MSG_ABORT, MSG_BUS_DEVICE_RESET,
    MSG_COMMAND_COMPLETE, MSG_EXTENDED, MSG_IDENTIFY, Progress, STATUS_CHECK_CONDITION,
    decode_group,
};

const SCSI_TRACE: bool = false;

/// Amount of IDs on the bus
pub const MAX_TARGETS: usize = 8;

/// Transfer buffer size used when none is configured
pub const DEFAULT_FRAME_SIZE: usize = 0x20000;

/// Smallest transfer buffer: fits any fixed-format response
const MIN_FRAME_SIZE: usize = 256;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    strum::IntoStaticStr,
    Serialize,
    Deserialize,
)]
/// SCSI information transfer phases, encoded as MSG, C/D, I/O
pub enum ScsiPhase {
    /// Initiator -> Target. Also the phase of a free bus.
    DataOut = 0,
    /// Target -> Initiator
    DataIn = 1,
    Command = 2,
    Status = 3,
    MessageOut = 6,
    MessageIn = 7,
}

impl ScsiPhase {
    /// Bytes flow from the initiator to the target
    pub fn is_output(self) -> bool {
        matches!(self, Self::DataOut | Self::Command | Self::MessageOut)
    }
}

/// Role of a SCSI ID on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BusState {
    Initiator,
    Target,
    Disconnected,
}

bitfield! {
    /// Bus control signals as seen by a host adapter
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BusSignals(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase_bits: u8 @ 0..=2,

        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub req: bool @ 3,
        pub bsy: bool @ 4,
        pub sel: bool @ 5,
        pub atn: bool @ 6,
        pub rst: bool @ 7,
    }
}

impl BusSignals {
    /// Phase encoded on MSG, C/D, I/O. None for the reserved encodings.
    pub fn phase(&self) -> Option<ScsiPhase> {
        ScsiPhase::from_u8(self.phase_bits())
    }
}

/// Failure to wire a unit to the bus
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    #[error("SCSI ID out of range: {0}")]
    IdOutOfRange(usize),
    #[error("SCSI ID {0} is the host adapter")]
    HostId(usize),
    #[error("SCSI ID {0} already in use")]
    InUse(usize),
}

/// A target wired to an ID
struct Unit {
    target: Box<dyn ScsiTarget>,
    /// Disabled units do not respond to selection
    enabled: bool,
}

/// A SCSI bus with the targets attached to it
pub struct ScsiBus {
    /// ID that won arbitration
    initiator: Option<usize>,
    /// Selected ID
    target: Option<usize>,
    /// Logical unit from the last IDENTIFY
    lun: u8,
    phase: ScsiPhase,
    atn: bool,
    req: bool,

    /// Transfer buffer
    buf: Box<[u8]>,
    /// Transfer cursor
    buf_t: usize,
    /// End of valid bytes
    buf_b: usize,

    /// CDB of the command in flight
    cmd: ArrayVec<u8, MAX_CDB_LEN>,
    state: CommandState,

    /// Outcome of the command in flight
    sense: Sense,
    /// Outcome of the previous command, returned by REQUEST SENSE
    last_sense: Sense,

    /// Bytes discarded during the current write()
    dropped: usize,

    units: [Option<Unit>; MAX_TARGETS],
}

impl ScsiBus {
    /// Creates a bus with a transfer buffer of `max_frame` bytes
    pub fn new(max_frame: usize) -> Self {
        let size = max_frame.max(MIN_FRAME_SIZE);
        Self {
            initiator: None,
            target: None,
            lun: 0,
            phase: ScsiPhase::DataOut,
            atn: false,
            req: false,
            buf: vec![0; size].into_boxed_slice(),
            buf_t: 0,
            buf_b: 0,
            cmd: ArrayVec::new(),
            state: CommandState::Complete,
            sense: Sense::good(),
            last_sense: Sense::good(),
            dropped: 0,
            units: Default::default(),
        }
    }

    /// Clears selection, phase and sense state. Units stay attached.
    pub fn reset(&mut self) {
        log::debug!("SCSI bus reset");
        self.release();
        self.atn = false;
        self.sense = Sense::good();
        self.last_sense = Sense::good();
    }

    /// Wires a target to an ID
    pub fn attach(&mut self, id: usize, target: Box<dyn ScsiTarget>) -> Result<(), AttachError> {
        let slot = self.units.get_mut(id).ok_or(AttachError::IdOutOfRange(id))?;
        if slot.is_some() {
            return Err(AttachError::InUse(id));
        }
        log::debug!("Attached {} at SCSI ID {}", target.descriptor().class, id);
        *slot = Some(Unit {
            target,
            enabled: true,
        });
        Ok(())
    }

    /// Removes the target at an ID, returning it
    pub fn detach(&mut self, id: usize) -> Option<Box<dyn ScsiTarget>> {
        if self.target == Some(id) {
            self.release();
        }
        self.units.get_mut(id)?.take().map(|u| u.target)
    }

    /// Administratively enables or disables the unit at an ID
    pub fn set_enabled(&mut self, id: usize, enabled: bool) {
        if let Some(unit) = self.units.get_mut(id).and_then(Option::as_mut) {
            unit.enabled = enabled;
        }
    }

    pub fn target(&self, id: usize) -> Option<&dyn ScsiTarget> {
        self.units.get(id)?.as_ref().map(|u| u.target.as_ref())
    }

    pub fn target_mut(&mut self, id: usize) -> Option<&mut (dyn ScsiTarget + 'static)> {
        self.units.get_mut(id)?.as_mut().map(|u| u.target.as_mut())
    }

    /// Claims the bus for an initiator. Fails if the bus is busy.
    pub fn arbitrate(&mut self, initiator: usize) -> bool {
        if self.initiator.is_some() {
            return false;
        }
        if SCSI_TRACE {
            log::debug!("ID {} won arbitration", initiator);
        }
        self.initiator = Some(initiator);
        true
    }

    /// Returns the bus to the free state
    pub fn release(&mut self) {
        if SCSI_TRACE && self.initiator.is_some() {
            log::debug!("Bus released");
        }
        self.initiator = None;
        self.target = None;
        self.lun = 0;
        self.buf_t = 0;
        self.buf_b = 0;
        self.phase = ScsiPhase::DataOut;
        self.req = false;
        self.state = CommandState::Complete;
    }

    /// Selects a target. A missing or disabled target times out, which
    /// releases the bus.
    pub fn select(&mut self, id: usize) -> bool {
        if self.initiator.is_none() || self.target.is_some() {
            log::warn!("Selection of ID {} without arbitration", id);
            return false;
        }
        let responds = self
            .units
            .get(id)
            .and_then(Option::as_ref)
            .is_some_and(|u| u.enabled);
        if !responds {
            log::debug!("Selection timeout on ID {}", id);
            self.release();
            return false;
        }

        self.target = Some(id);
        self.lun = 0;
        self.buf_t = 0;
        self.buf_b = 0;
        self.state = CommandState::AwaitingCdb;
        self.set_phase(if self.atn {
            ScsiPhase::MessageOut
        } else {
            ScsiPhase::Command
        });
        true
    }

    pub fn set_atn(&mut self) {
        self.atn = true;
    }

    pub fn release_atn(&mut self) {
        self.atn = false;
    }

    /// Role of an ID in the current transaction
    pub fn state(&self, id: usize) -> BusState {
        if self.initiator == Some(id) {
            BusState::Initiator
        } else if self.target == Some(id) {
            BusState::Target
        } else {
            BusState::Disconnected
        }
    }

    pub fn phase(&self) -> ScsiPhase {
        self.phase
    }

    pub fn req(&self) -> bool {
        self.req
    }

    pub fn atn(&self) -> bool {
        self.atn
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn initiator(&self) -> Option<usize> {
        self.initiator
    }

    pub fn selected(&self) -> Option<usize> {
        self.target
    }

    pub fn command_state(&self) -> CommandState {
        self.state
    }

    /// Deferred outcome of the command in flight (or the last one)
    pub fn sense(&self) -> &Sense {
        &self.sense
    }

    pub fn frame_size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes still expected in the DATA-OUT phase, if one is in progress
    pub fn pending_data_out(&self) -> Option<usize> {
        match self.state {
            CommandState::AwaitingPayload { len } => {
                Some(len.saturating_sub(self.buf_b - self.buf_t))
            }
            _ => None,
        }
    }

    /// Bytes waiting to be read by the initiator
    pub fn pending_data_in(&self) -> usize {
        if self.target.is_some() && !self.phase.is_output() {
            self.buf_b - self.buf_t
        } else {
            0
        }
    }

    /// Current bus signals
    pub fn signals(&self) -> BusSignals {
        let mut signals = BusSignals(0)
            .with_atn(self.atn)
            .with_bsy(self.initiator.is_some())
            .with_sel(self.initiator.is_some() && self.target.is_none());
        if self.target.is_some() {
            signals.set_phase_bits(self.phase as u8);
            signals.set_req(self.req);
        }
        signals
    }

    fn set_phase(&mut self, phase: ScsiPhase) {
        if SCSI_TRACE {
            log::debug!("Bus phase: {}", <&str>::from(phase));
        }
        self.phase = phase;
        self.req = true;
    }

    /// Takes `len` bytes from the buffer
    fn consume(&mut self, len: usize) {
        self.buf_t += len;
        if self.buf_t >= self.buf_b {
            self.buf_t = 0;
            self.buf_b = 0;
        }
    }

    /// Discards what is left in the buffer after `used` bytes
    fn drop_pending(&mut self, used: usize) {
        let left = (self.buf_b - self.buf_t).saturating_sub(used);
        if left > 0 {
            log::warn!("Discarding {} bytes after command", left);
        }
        self.dropped += left;
        self.buf_t = 0;
        self.buf_b = 0;
    }

    /// Publishes status immediately: sets the outcome and enters the
    /// Status phase
    pub fn status(&mut self, status: u8, key: SenseKey, asc: u8) {
        self.sense.set(status, key, asc);
        self.publish_status();
    }

    /// Records the outcome, to be published at the end of the data phase
    pub fn status_deferred(&mut self, status: u8, key: SenseKey, asc: u8) {
        self.sense.set(status, key, asc);
    }

    fn publish_status(&mut self) {
        self.state = CommandState::Complete;
        self.buf[0] = self.sense.status;
        self.buf_t = 0;
        self.buf_b = 1;
        self.set_phase(ScsiPhase::Status);
    }

    /// Feeds bytes from the initiator to the target. Returns the amount of
    /// bytes accepted. Bytes left over when the target stops accepting
    /// output are discarded and not counted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.target.is_none() || !self.phase.is_output() {
            log::warn!(
                "Write of {} bytes in phase {}",
                data.len(),
                <&str>::from(self.phase)
            );
            return 0;
        }

        let space = self.buf.len() - self.buf_b;
        let len = data.len().min(space);
        if len < data.len() {
            log::error!("Transfer buffer overrun, {} bytes lost", data.len() - len);
        }
        self.buf[self.buf_b..(self.buf_b + len)].copy_from_slice(&data[..len]);
        self.buf_b += len;
        self.dropped = 0;

        while self.buf_b > self.buf_t && self.target.is_some() && self.phase.is_output() {
            let progress = match self.phase {
                ScsiPhase::DataOut => self.data_out(),
                ScsiPhase::MessageOut => self.message(),
                ScsiPhase::Command => self.command(),
                _ => unreachable!(),
            };
            if SCSI_TRACE {
                log::debug!("Decoder progress: {:?}", progress);
            }
            if progress == Progress::NeedMore {
                self.req = true;
                break;
            }
        }

        len - self.dropped.min(len)
    }

    /// Drains bytes from the target to the initiator. Returns the amount of
    /// bytes produced, never crossing into the next phase.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        if self.target.is_none() || self.phase.is_output() {
            return 0;
        }

        let len = (self.buf_b - self.buf_t).min(out.len());
        out[..len].copy_from_slice(&self.buf[self.buf_t..(self.buf_t + len)]);
        self.buf_t += len;

        if self.buf_t == self.buf_b {
            match self.phase {
                ScsiPhase::DataIn => self.publish_status(),
                ScsiPhase::Status => {
                    self.buf[0] = MSG_COMMAND_COMPLETE;
                    self.buf_t = 0;
                    self.buf_b = 1;
                    self.set_phase(ScsiPhase::MessageIn);
                }
                ScsiPhase::MessageIn => {
                    // Bus release is up to the initiator
                    self.buf_t = 0;
                    self.buf_b = 0;
                    self.req = false;
                }
                _ => unreachable!(),
            }
        }
        len
    }

    /// MESSAGE OUT phase decoder
    fn message(&mut self) -> Progress {
        let avail = self.buf_b - self.buf_t;
        let msg = self.buf[self.buf_t];

        let len = if msg & MSG_IDENTIFY != 0 {
            self.lun = msg & 0x0F;
            if SCSI_TRACE {
                log::debug!("IDENTIFY LUN {}", self.lun);
            }
            1
        } else {
            match msg {
                MSG_EXTENDED => {
                    if avail < 2 {
                        return Progress::NeedMore;
                    }
                    let len = self.buf[self.buf_t + 1] as usize + 2;
                    if avail < len {
                        return Progress::NeedMore;
                    }
                    log::debug!(
                        "Ignoring extended message {:02X?}",
                        &self.buf[self.buf_t..(self.buf_t + len)]
                    );
                    len
                }
                MSG_ABORT | MSG_BUS_DEVICE_RESET => {
                    log::debug!("Message {:02X}: disconnecting", msg);
                    self.dropped += avail - 1;
                    self.release();
                    return Progress::Consumed(1);
                }
                _ => {
                    log::warn!("Unknown message {:02X}, discarding {} bytes", msg, avail);
                    avail
                }
            }
        };

        self.consume(len);
        self.set_phase(ScsiPhase::Command);
        Progress::Consumed(len)
    }

    /// COMMAND phase decoder
    fn command(&mut self) -> Progress {
        let avail = self.buf_b - self.buf_t;
        let opcode = self.buf[self.buf_t];
        let len = decode_group(opcode);

        if len == 0 {
            log::warn!("Cannot decode command group of opcode {:02X}", opcode);
            self.consume(avail);
            self.last_sense = mem::take(&mut self.sense);
            self.status(
                STATUS_CHECK_CONDITION,
                SenseKey(CC_KEY_ILLEGAL_REQUEST),
                ASC_INVALID_COMMAND,
            );
            return Progress::Consumed(avail);
        }
        if avail < len {
            return Progress::NeedMore;
        }

        self.cmd.clear();
        self.cmd
            .extend(self.buf[self.buf_t..(self.buf_t + len)].iter().copied());
        self.buf_t += len;

        // Whatever follows the CDB is the start of a DATA-OUT payload
        self.buf.copy_within(self.buf_t..self.buf_b, 0);
        self.buf_b -= self.buf_t;
        self.buf_t = 0;

        self.execute(None);
        Progress::Consumed(len)
    }

    /// DATA OUT phase accumulator
    fn data_out(&mut self) -> Progress {
        let CommandState::AwaitingPayload { len } = self.state else {
            log::error!("DATA-OUT without a command awaiting data");
            self.drop_pending(0);
            return Progress::Consumed(0);
        };
        if self.buf_b - self.buf_t < len {
            return Progress::NeedMore;
        }
        self.execute(Some(len));
        Progress::Consumed(len)
    }

    /// Runs the command in `cmd`, with the DATA-OUT payload of `payload`
    /// bytes at the start of the buffer if it was delivered
    fn execute(&mut self, payload: Option<usize>) {
        let Some(id) = self.target else {
            return;
        };
        if payload.is_none() {
            self.last_sense = mem::take(&mut self.sense);
        }
        if SCSI_TRACE {
            log::debug!(
                "SCSI ID {} LUN {} command: {:02X?} payload {:?}",
                id,
                self.lun,
                &self.cmd[..],
                payload
            );
        }

        let Some(unit) = self.units[id].as_mut() else {
            log::error!("SCSI command to disconnected target ID {}", id);
            self.release();
            return;
        };
        let mut io = TargetIo {
            buf: &mut self.buf,
            payload,
            sense: &mut self.sense,
            last_sense: &self.last_sense,
            lun: self.lun,
        };
        let action = match unit.target.cmd(&self.cmd, &mut io) {
            Ok(action) => action,
            Err(e) => {
                log::error!("SCSI command ({:02X}) error: {:?}", self.cmd[0], e);
                self.sense.set(
                    STATUS_CHECK_CONDITION,
                    SenseKey(CC_KEY_HARDWARE_ERROR),
                    ASC_NO_SENSE,
                );
                Action::Status
            }
        };
        let used = payload.unwrap_or(0);

        match action {
            Action::Status => {
                self.drop_pending(used);
                self.publish_status();
            }
            Action::DataIn(0) => {
                self.drop_pending(used);
                self.publish_status();
            }
            Action::DataIn(len) => {
                self.drop_pending(used);
                self.state = CommandState::Complete;
                self.buf_t = 0;
                self.buf_b = len;
                self.set_phase(ScsiPhase::DataIn);
            }
            Action::DataOut(len) if payload.is_none() => {
                if len > self.buf.len() {
                    log::warn!("DATA-OUT of {} bytes exceeds transfer buffer", len);
                    self.drop_pending(0);
                    self.status(
                        STATUS_CHECK_CONDITION,
                        SenseKey(CC_KEY_ILLEGAL_REQUEST),
                        ASC_INVALID_FIELD_IN_CDB,
                    );
                    return;
                }
                self.state = CommandState::AwaitingPayload { len };
                self.set_phase(ScsiPhase::DataOut);
                if len == 0 {
                    self.execute(Some(0));
                }
            }
            Action::DataOut(_) => {
                log::error!("Command {:02X} requested a second DATA-OUT phase", self.cmd[0]);
                self.drop_pending(used);
                self.status(
                    STATUS_CHECK_CONDITION,
                    SenseKey(CC_KEY_HARDWARE_ERROR),
                    ASC_NO_SENSE,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::disk::ScsiTargetDisk;
    use crate::scsi::STATUS_GOOD;
    use crate::scsi::disk_image::MemoryDiskImage;
    use crate::scsi::target::{DeviceClass, DeviceDescriptor};

    fn disk() -> Box<dyn ScsiTarget> {
        Box::new(ScsiTargetDisk::new(
            DeviceDescriptor::for_class(DeviceClass::Disk),
            Some(Box::new(MemoryDiskImage::new(512 * 16))),
        ))
    }

    #[test]
    fn attach_errors() {
        let mut bus = ScsiBus::new(DEFAULT_FRAME_SIZE);
        assert_eq!(bus.attach(0, disk()), Ok(()));
        assert_eq!(bus.attach(0, disk()), Err(AttachError::InUse(0)));
        assert_eq!(bus.attach(8, disk()), Err(AttachError::IdOutOfRange(8)));
        assert!(bus.detach(0).is_some());
        assert!(bus.target(0).is_none());
    }

    #[test]
    fn minimum_frame() {
        let bus = ScsiBus::new(0);
        assert_eq!(bus.frame_size(), MIN_FRAME_SIZE);
    }

    #[test]
    fn signals() {
        let mut bus = ScsiBus::new(DEFAULT_FRAME_SIZE);
        bus.attach(2, disk()).unwrap();
        assert_eq!(bus.signals(), BusSignals(0));

        assert!(bus.arbitrate(7));
        let s = bus.signals();
        assert!(s.bsy());
        assert!(s.sel());

        bus.set_atn();
        assert!(bus.select(2));
        let s = bus.signals();
        assert!(!s.sel());
        assert!(s.atn());
        assert!(s.req());
        assert!(s.msg());
        assert!(s.cd());
        assert!(!s.io());
        assert_eq!(s.phase(), Some(ScsiPhase::MessageOut));

        assert_eq!(BusSignals(0x04).phase(), None);
    }

    #[test]
    fn selection_timeout_releases() {
        let mut bus = ScsiBus::new(DEFAULT_FRAME_SIZE);
        bus.attach(1, disk()).unwrap();
        bus.set_enabled(1, false);

        assert!(bus.arbitrate(7));
        assert!(!bus.select(1));
        assert_eq!(bus.state(7), BusState::Disconnected);
        assert!(bus.arbitrate(7));
        assert!(!bus.select(3));
        assert_eq!(bus.initiator(), None);

        bus.set_enabled(1, true);
        assert!(bus.arbitrate(7));
        assert!(bus.select(1));
        assert_eq!(bus.state(7), BusState::Initiator);
        assert_eq!(bus.state(1), BusState::Target);
        assert!(!bus.select(1));
    }

    #[test]
    fn no_transfer_when_free() {
        let mut bus = ScsiBus::new(DEFAULT_FRAME_SIZE);
        let mut out = [0; 4];
        assert_eq!(bus.write(&[0; 6]), 0);
        assert_eq!(bus.read(&mut out), 0);
    }

    #[test]
    fn status_and_message_in() {
        let mut bus = ScsiBus::new(DEFAULT_FRAME_SIZE);
        bus.attach(0, disk()).unwrap();
        bus.arbitrate(7);
        bus.select(0);

        // TEST UNIT READY
        assert_eq!(bus.write(&[0, 0, 0, 0, 0, 0]), 6);
        assert_eq!(bus.phase(), ScsiPhase::Status);
        assert_eq!(bus.command_state(), CommandState::Complete);

        let mut out = [0xFF; 4];
        assert_eq!(bus.read(&mut out), 1);
        assert_eq!(out[0], STATUS_GOOD);
        assert_eq!(bus.phase(), ScsiPhase::MessageIn);
        assert_eq!(bus.read(&mut out), 1);
        assert_eq!(out[0], MSG_COMMAND_COMPLETE);
        assert!(!bus.req());
        assert_eq!(bus.read(&mut out), 0);

        // Not released by the engine
        assert_eq!(bus.state(0), BusState::Target);
        bus.release();
        assert_eq!(bus.state(0), BusState::Disconnected);
        assert_eq!(bus.phase(), ScsiPhase::DataOut);
    }
}
