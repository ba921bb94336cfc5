//! Disk image abstraction for block device targets

use anyhow::{Context, Result, bail};
#[cfg(feature = "mmap")]
use memmap2::MmapMut;
use std::path::{Path, PathBuf};

/// Byte-addressed backing store of a block device
pub trait DiskImage {
    fn byte_len(&self) -> usize;

    /// Fills `out` from `offset`. Bytes beyond the end of the image read as zero.
    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()>;
    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()>;
    fn read_only(&self) -> bool;
    fn image_path(&self) -> Option<&Path>;
}

fn copy_out(disk: &[u8], offset: usize, out: &mut [u8]) {
    let start = offset.min(disk.len());
    let end = (offset + out.len()).min(disk.len());
    let len = end - start;
    out[..len].copy_from_slice(&disk[start..end]);
    out[len..].fill(0);
}

fn check_write(len: usize, offset: usize, data: &[u8], read_only: bool) -> Result<()> {
    if read_only {
        bail!("Write to read-only disk image");
    }
    if offset + data.len() > len {
        bail!(
            "Write of {} bytes at {} beyond end of image ({})",
            data.len(),
            offset,
            len
        );
    }
    Ok(())
}

/// Disk image backed by a file
pub struct FileDiskImage {
    /// Disk contents
    #[cfg(feature = "mmap")]
    disk: MmapMut,

    #[cfg(not(feature = "mmap"))]
    disk: Vec<u8>,

    /// Writes go through to this file
    #[cfg(not(feature = "mmap"))]
    file: Option<std::fs::File>,

    /// Path where the original image resides
    path: PathBuf,

    read_only: bool,
}

impl FileDiskImage {
    /// Opens a disk image whose size is a multiple of `block_size`.
    pub fn open_block_sized(filename: &Path, block_size: usize, read_only: bool) -> Result<Self> {
        let image = Self::open(filename, read_only)?;
        if block_size == 0 || image.byte_len() % block_size != 0 {
            bail!(
                "Cannot load disk image {}: not multiple of {}",
                filename.display(),
                block_size
            );
        }
        Ok(image)
    }

    /// Try to load a disk image, given the filename of the image.
    ///
    /// With the `mmap` feature, this locks the file on disk and memory maps
    /// the file for fast access and automatic writes back to disk, at the
    /// discretion of the operating system. Read-only images are mapped
    /// copy-on-write.
    #[cfg(feature = "mmap")]
    pub fn open(filename: &Path, read_only: bool) -> Result<Self> {
        use fs2::FileExt;
        use memmap2::MmapOptions;
        use std::fs::OpenOptions;

        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }
        let f = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(filename)
            .with_context(|| format!("Failed to open {}", filename.display()))?;

        let disk = if read_only {
            f.try_lock_shared()
                .with_context(|| format!("Failed to lock {}", filename.display()))?;
            unsafe { MmapOptions::new().map_copy(&f) }
        } else {
            f.try_lock_exclusive()
                .with_context(|| format!("Failed to lock {}", filename.display()))?;
            unsafe { MmapOptions::new().map_mut(&f) }
        }
        .with_context(|| format!("Failed to mmap file {}", filename.display()))?;

        Ok(Self {
            disk,
            path: filename.to_path_buf(),
            read_only,
        })
    }

    #[cfg(not(feature = "mmap"))]
    pub fn open(filename: &Path, read_only: bool) -> Result<Self> {
        use std::fs::{self, OpenOptions};

        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }

        let disk = fs::read(filename)
            .with_context(|| format!("Failed to open file {}", filename.display()))?;
        let file = if read_only {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .open(filename)
                    .with_context(|| format!("Failed to open {}", filename.display()))?,
            )
        };

        Ok(Self {
            disk,
            file,
            path: filename.to_path_buf(),
            read_only,
        })
    }
}

impl DiskImage for FileDiskImage {
    fn byte_len(&self) -> usize {
        self.disk.len()
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        copy_out(&self.disk, offset, out);
        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_write(self.disk.len(), offset, data, self.read_only)?;
        self.disk[offset..(offset + data.len())].copy_from_slice(data);

        #[cfg(not(feature = "mmap"))]
        if let Some(f) = self.file.as_mut() {
            use std::io::{Seek, SeekFrom, Write};

            f.seek(SeekFrom::Start(offset as u64))?;
            f.write_all(data)
                .with_context(|| format!("Failed to write {}", self.path.display()))?;
        }
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn image_path(&self) -> Option<&Path> {
        Some(self.path.as_ref())
    }
}

/// Disk image held in memory only
#[derive(Debug, Default, Clone)]
pub struct MemoryDiskImage {
    disk: Vec<u8>,
    read_only: bool,
}

impl MemoryDiskImage {
    /// A zero-filled image of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    pub fn from_bytes(disk: Vec<u8>) -> Self {
        Self {
            disk,
            read_only: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.disk
    }
}

impl DiskImage for MemoryDiskImage {
    fn byte_len(&self) -> usize {
        self.disk.len()
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        copy_out(&self.disk, offset, out);
        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_write(self.disk.len(), offset, data, self.read_only)?;
        self.disk[offset..(offset + data.len())].copy_from_slice(data);
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }
}
