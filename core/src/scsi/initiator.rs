//! Initiator side of a transaction, as a host adapter would drive it

use anyhow::{Result, bail};

use super::MSG_IDENTIFY;
use super::bus::{ScsiBus, ScsiPhase};
use super::sense::Sense;

/// Bytes requested per DATA-IN read
const READ_CHUNK: usize = 4096;

/// Outcome of a complete command transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Bytes returned in the DATA-IN phase
    pub data: Vec<u8>,
    pub status: u8,
    pub message: u8,
}

/// An initiator on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initiator {
    id: usize,
    /// Sends IDENTIFY for this LUN after selection
    lun: Option<u8>,
}

impl Initiator {
    pub fn new(id: usize) -> Self {
        Self { id, lun: None }
    }

    pub fn with_lun(self, lun: u8) -> Self {
        Self {
            lun: Some(lun),
            ..self
        }
    }

    /// Runs a command from arbitration to MESSAGE-IN, then releases the bus.
    /// `data_out` is delivered if the target asks for a DATA-OUT phase.
    pub fn command(
        &self,
        bus: &mut ScsiBus,
        target: usize,
        cdb: &[u8],
        data_out: &[u8],
    ) -> Result<Transaction> {
        if !bus.arbitrate(self.id) {
            bail!("Bus busy");
        }
        if self.lun.is_some() {
            bus.set_atn();
        }
        let selected = bus.select(target);
        bus.release_atn();
        if !selected {
            bail!("Selection timeout on ID {}", target);
        }

        let result = self.transfer(bus, cdb, data_out);
        bus.release();
        result
    }

    /// Issues REQUEST SENSE, returning the decoded sense data
    pub fn request_sense(&self, bus: &mut ScsiBus, target: usize) -> Result<Sense> {
        let t = self.command(
            bus,
            target,
            &[0x03, 0, 0, 0, Sense::EXTENDED_LEN as u8, 0],
            &[],
        )?;
        Sense::from_extended(&t.data)
    }

    fn transfer(&self, bus: &mut ScsiBus, cdb: &[u8], data_out: &[u8]) -> Result<Transaction> {
        if let Some(lun) = self.lun {
            if bus.write(&[MSG_IDENTIFY | lun]) != 1 {
                bail!("IDENTIFY not accepted");
            }
        }

        let accepted = bus.write(cdb);
        if accepted != cdb.len() || bus.phase() == ScsiPhase::Command {
            bail!(
                "Target accepted {} of {} CDB bytes, phase {:?}",
                accepted,
                cdb.len(),
                bus.phase()
            );
        }

        if bus.phase() == ScsiPhase::DataOut {
            let wanted = bus.pending_data_out().unwrap_or(0);
            if data_out.len() < wanted {
                bail!(
                    "Target wants {} bytes, {} available",
                    wanted,
                    data_out.len()
                );
            }
            bus.write(&data_out[..wanted]);
        } else if !data_out.is_empty() {
            log::debug!("Target did not request {} bytes of data", data_out.len());
        }

        let mut data = vec![];
        let mut chunk = [0; READ_CHUNK];
        while bus.phase() == ScsiPhase::DataIn {
            let n = bus.read(&mut chunk);
            if n == 0 {
                bail!("DATA-IN phase stalled");
            }
            data.extend_from_slice(&chunk[..n]);
        }

        let mut byte = [0];
        if bus.phase() != ScsiPhase::Status || bus.read(&mut byte) != 1 {
            bail!("Expected STATUS phase, in {:?}", bus.phase());
        }
        let status = byte[0];
        if bus.phase() != ScsiPhase::MessageIn || bus.read(&mut byte) != 1 {
            bail!("Expected MESSAGE-IN phase, in {:?}", bus.phase());
        }

        Ok(Transaction {
            data,
            status,
            message: byte[0],
        })
    }
}
