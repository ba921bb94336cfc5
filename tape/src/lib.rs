//! Tape media for sequential-access SCSI targets
//!
//! The medium is record oriented: a tape is a sequence of data records,
//! tape marks and erase gaps, read and written at a single position that
//! moves forward (or backward, for reverse reads and spacing).

pub mod image;

pub use image::TapeImage;

use thiserror::Error;

/// Tape operation status, other than success
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MtError {
    #[error("tape mark")]
    TapeMark,
    #[error("write protected")]
    WriteProtect,
    #[error("no medium attached")]
    Unattached,
    #[error("I/O error")]
    IoError,
    /// The record did not fit the caller's buffer. `len` is the full
    /// length of the record on tape; only the buffer's worth was transferred.
    #[error("invalid record length ({len} bytes)")]
    InvalidRecordLength { len: usize },
    #[error("invalid tape format")]
    FormatError,
    #[error("record with recorded error")]
    RecordError,
    #[error("beginning of tape")]
    Bot,
    #[error("end of medium")]
    Eom,
}

pub type TapeResult<T> = Result<T, MtError>;

/// Spacing stopped before the requested count was reached
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{cause} after skipping {skipped}")]
pub struct SpaceError {
    /// Records or files actually skipped
    pub skipped: usize,
    pub cause: MtError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Record-oriented tape access as used by a sequential-access target
pub trait TapeMedium {
    fn is_attached(&self) -> bool;
    fn write_protected(&self) -> bool;

    /// Tape is positioned at the beginning of tape
    fn at_bot(&self) -> bool;

    /// Reads the next record into `buf`, returning the record length.
    fn read_record(&mut self, buf: &mut [u8]) -> TapeResult<usize>;

    /// Reads the previous record into `buf`, returning the record length.
    /// Data is stored in forward order.
    fn read_record_reverse(&mut self, buf: &mut [u8]) -> TapeResult<usize>;

    fn write_record(&mut self, data: &[u8]) -> TapeResult<()>;
    fn write_tapemark(&mut self) -> TapeResult<()>;

    /// Writes an erase gap of `words` gap markers
    fn write_gap(&mut self, words: usize) -> TapeResult<()>;

    /// Erases everything from the current position to the end of medium
    fn erase_to_eom(&mut self) -> TapeResult<()>;

    fn space_records(&mut self, count: usize, dir: Direction) -> Result<(), SpaceError>;
    fn space_files(&mut self, count: usize, dir: Direction) -> Result<(), SpaceError>;

    fn rewind(&mut self) -> TapeResult<()>;

    /// Rewinds and removes the medium
    fn detach(&mut self) -> TapeResult<()>;
}
