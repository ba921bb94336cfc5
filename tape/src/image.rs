//! SIMH `.tap` container
//!
//! Layout of a record: 32-bit little-endian length word, the data padded to
//! an even length, and the same length word again. Special length words
//! mark tape marks, erase gaps and the logical end of medium.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::{Direction, MtError, SpaceError, TapeMedium, TapeResult};

const TAPE_MARK: u32 = 0x0000_0000;
const ERASE_GAP: u32 = 0xFFFF_FFFE;
const END_OF_MEDIUM: u32 = 0xFFFF_FFFF;

const RECORD_LENGTH_MASK: u32 = 0x00FF_FFFF;
const RECORD_CLASS_MASK: u32 = 0xF000_0000;
const RECORD_CLASS_ERROR: u32 = 0x8000_0000;

/// Largest record the length word can describe
pub const MAX_RECORD_LEN: usize = RECORD_LENGTH_MASK as usize;

const fn padded(len: usize) -> usize {
    (len + 1) & !1
}

/// A tape image held in memory, optionally backed by a file
#[derive(Debug, Default)]
pub struct TapeImage {
    data: Vec<u8>,
    pos: usize,
    attached: bool,
    write_protect: bool,

    /// Medium capacity in bytes, unlimited if None
    capacity: Option<usize>,

    /// Path where the image was loaded from
    path: Option<PathBuf>,
}

impl TapeImage {
    /// A freshly loaded tape with nothing recorded on it
    pub fn blank() -> Self {
        Self {
            attached: true,
            ..Default::default()
        }
    }

    /// A tape image from raw `.tap` contents
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            attached: true,
            ..Default::default()
        }
    }

    /// Loads a `.tap` image from a file.
    pub fn load(filename: &Path) -> Result<Self> {
        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }
        let data = fs::read(filename)
            .with_context(|| format!("Failed to open file {}", filename.display()))?;

        Ok(Self {
            path: Some(filename.to_path_buf()),
            ..Self::from_bytes(data)
        })
    }

    /// Writes the image back to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            bail!("Tape image has no backing file");
        };
        fs::write(path, &self.data)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_write_protect(&mut self, wp: bool) {
        self.write_protect = wp;
    }

    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Current position in bytes from the beginning of tape
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn word_at(&self, offset: usize) -> TapeResult<Option<u32>> {
        if offset >= self.data.len() {
            return Ok(None);
        }
        let Some(bytes) = self.data.get(offset..offset + 4) else {
            // Partial length word
            return Err(MtError::FormatError);
        };
        Ok(Some(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])))
    }

    fn check_attached(&self) -> TapeResult<()> {
        if !self.attached {
            return Err(MtError::Unattached);
        }
        Ok(())
    }

    fn check_writable(&self, needed: usize) -> TapeResult<()> {
        self.check_attached()?;
        if self.write_protect {
            return Err(MtError::WriteProtect);
        }
        if let Some(capacity) = self.capacity {
            if self.pos + needed > capacity {
                return Err(MtError::Eom);
            }
        }
        Ok(())
    }

    /// Validates a length word and returns the record length
    fn record_len(word: u32) -> TapeResult<usize> {
        match word & RECORD_CLASS_MASK {
            0 | RECORD_CLASS_ERROR => Ok((word & RECORD_LENGTH_MASK) as usize),
            _ => Err(MtError::FormatError),
        }
    }

    /// Finishes a record transfer of a record with length word `word`
    fn record_result(word: u32, len: usize, buflen: usize) -> TapeResult<usize> {
        if word & RECORD_CLASS_ERROR != 0 {
            return Err(MtError::RecordError);
        }
        if len > buflen {
            return Err(MtError::InvalidRecordLength { len });
        }
        Ok(len)
    }

    fn read_forward(&mut self, buf: &mut [u8]) -> TapeResult<usize> {
        self.check_attached()?;
        loop {
            let word = match self.word_at(self.pos)? {
                None | Some(END_OF_MEDIUM) => return Err(MtError::Eom),
                Some(w) => w,
            };
            match word {
                TAPE_MARK => {
                    self.pos += 4;
                    return Err(MtError::TapeMark);
                }
                ERASE_GAP => {
                    self.pos += 4;
                    continue;
                }
                _ => (),
            }

            let len = Self::record_len(word)?;
            let start = self.pos + 4;
            let trailer = start + padded(len);
            if self.word_at(trailer)? != Some(word) {
                log::error!("Tape record at {} has mismatched trailer", self.pos);
                return Err(MtError::FormatError);
            }

            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&self.data[start..(start + n)]);
            self.pos = trailer + 4;

            return Self::record_result(word, len, buf.len());
        }
    }

    fn read_reverse(&mut self, buf: &mut [u8]) -> TapeResult<usize> {
        self.check_attached()?;
        loop {
            if self.pos == 0 {
                return Err(MtError::Bot);
            }
            if self.pos < 4 {
                return Err(MtError::FormatError);
            }
            let word = match self.word_at(self.pos - 4)? {
                None | Some(END_OF_MEDIUM) => return Err(MtError::FormatError),
                Some(w) => w,
            };
            match word {
                TAPE_MARK => {
                    self.pos -= 4;
                    return Err(MtError::TapeMark);
                }
                ERASE_GAP => {
                    self.pos -= 4;
                    continue;
                }
                _ => (),
            }

            let len = Self::record_len(word)?;
            let Some(header) = self.pos.checked_sub(8 + padded(len)) else {
                return Err(MtError::FormatError);
            };
            if self.word_at(header)? != Some(word) {
                log::error!("Tape record ending at {} has mismatched header", self.pos);
                return Err(MtError::FormatError);
            }

            let start = header + 4;
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&self.data[start..(start + n)]);
            self.pos = header;

            return Self::record_result(word, len, buf.len());
        }
    }

    /// Moves over one record without transferring it
    fn skip_record(&mut self, dir: Direction) -> TapeResult<()> {
        let r = match dir {
            Direction::Forward => self.read_forward(&mut []),
            Direction::Reverse => self.read_reverse(&mut []),
        };
        match r {
            Ok(_) | Err(MtError::InvalidRecordLength { .. }) | Err(MtError::RecordError) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Writes everything from `from` to the end of the image back to the
    /// file it was loaded from, truncating the file after it
    fn write_through(&self, from: usize) -> TapeResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let result = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut f| {
                f.seek(SeekFrom::Start(from as u64))?;
                f.write_all(&self.data[from..])?;
                f.set_len(self.data.len() as u64)
            });
        result.map_err(|e| {
            log::error!("Failed to write {}: {}", path.display(), e);
            MtError::IoError
        })
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.pos = self.data.len();
    }
}

impl TapeMedium for TapeImage {
    fn is_attached(&self) -> bool {
        self.attached
    }

    fn write_protected(&self) -> bool {
        self.write_protect
    }

    fn at_bot(&self) -> bool {
        self.pos == 0
    }

    fn read_record(&mut self, buf: &mut [u8]) -> TapeResult<usize> {
        self.read_forward(buf)
    }

    fn read_record_reverse(&mut self, buf: &mut [u8]) -> TapeResult<usize> {
        self.read_reverse(buf)
    }

    fn write_record(&mut self, data: &[u8]) -> TapeResult<()> {
        if data.len() > MAX_RECORD_LEN {
            return Err(MtError::InvalidRecordLength { len: data.len() });
        }
        self.check_writable(8 + padded(data.len()))?;

        let word = (data.len() as u32).to_le_bytes();
        let start = self.pos;
        self.data.truncate(start);
        self.data.extend_from_slice(&word);
        self.data.extend_from_slice(data);
        if data.len() % 2 != 0 {
            self.data.push(0);
        }
        self.append(&word);
        self.write_through(start)
    }

    fn write_tapemark(&mut self) -> TapeResult<()> {
        self.check_writable(4)?;
        let start = self.pos;
        self.data.truncate(start);
        self.append(&TAPE_MARK.to_le_bytes());
        self.write_through(start)
    }

    fn write_gap(&mut self, words: usize) -> TapeResult<()> {
        self.check_writable(4 * words)?;
        let start = self.pos;
        self.data.truncate(start);
        for _ in 0..words {
            self.append(&ERASE_GAP.to_le_bytes());
        }
        self.write_through(start)
    }

    fn erase_to_eom(&mut self) -> TapeResult<()> {
        self.check_writable(0)?;
        self.data.truncate(self.pos);
        self.write_through(self.pos)
    }

    fn space_records(&mut self, count: usize, dir: Direction) -> Result<(), SpaceError> {
        for skipped in 0..count {
            self.skip_record(dir)
                .map_err(|cause| SpaceError { skipped, cause })?;
        }
        Ok(())
    }

    fn space_files(&mut self, count: usize, dir: Direction) -> Result<(), SpaceError> {
        for skipped in 0..count {
            loop {
                match self.skip_record(dir) {
                    Ok(()) => (),
                    Err(MtError::TapeMark) => break,
                    Err(cause) => return Err(SpaceError { skipped, cause }),
                }
            }
        }
        Ok(())
    }

    fn rewind(&mut self) -> TapeResult<()> {
        self.check_attached()?;
        self.pos = 0;
        Ok(())
    }

    fn detach(&mut self) -> TapeResult<()> {
        self.check_attached()?;
        self.pos = 0;
        self.attached = false;
        Ok(())
    }
}
