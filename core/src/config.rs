//! Bus configuration, loaded from JSON

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use scsibus_tape::{TapeImage, TapeMedium};
use serde::{Deserialize, Serialize};

use crate::scsi::bus::{AttachError, DEFAULT_FRAME_SIZE, ScsiBus};
use crate::scsi::cdrom::ScsiTargetCdrom;
use crate::scsi::disk::ScsiTargetDisk;
use crate::scsi::disk_image::{DiskImage, FileDiskImage, MemoryDiskImage};
use crate::scsi::tape::ScsiTargetTape;
use crate::scsi::target::{DeviceClass, DeviceDescriptor, ScsiTarget};

/// A complete bus: transfer buffer, host adapter and attached units
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Transfer buffer size in bytes
    pub frame_size: usize,

    /// SCSI ID of the host adapter
    pub host_id: usize,

    pub units: Vec<UnitConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            host_id: 7,
            units: vec![],
        }
    }
}

const fn default_enabled() -> bool {
    true
}

/// One unit on the bus. Unset fields take the defaults of the device class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    /// Target ID
    pub id: usize,
    pub class: DeviceClass,

    /// Medium image, relative paths are resolved against the configuration
    /// file. No image means no medium, unless `scratch_blocks` is set.
    #[serde(default)]
    pub image: Option<PathBuf>,

    /// Size of an in-memory scratch medium, in blocks
    #[serde(default)]
    pub scratch_blocks: Option<usize>,

    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub version: Option<u8>,
    #[serde(default)]
    pub removable: Option<bool>,
    #[serde(default)]
    pub block_size: Option<usize>,
    #[serde(default)]
    pub gap_length: Option<usize>,

    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl UnitConfig {
    pub fn descriptor(&self) -> DeviceDescriptor {
        let defaults = DeviceDescriptor::for_class(self.class);
        DeviceDescriptor {
            vendor: self.vendor.clone().unwrap_or(defaults.vendor),
            product: self.product.clone().unwrap_or(defaults.product),
            revision: self.revision.clone().unwrap_or(defaults.revision),
            version: self.version.unwrap_or(defaults.version),
            removable: self.removable.unwrap_or(defaults.removable),
            block_size: self.block_size.unwrap_or(defaults.block_size),
            gap_length: self.gap_length.unwrap_or(defaults.gap_length),
            ..defaults
        }
    }

    fn disk_image(&self, basedir: &Path, block_size: usize) -> Result<Option<Box<dyn DiskImage>>> {
        if let Some(image) = &self.image {
            let path = basedir.join(image);
            let read_only = self.read_only || self.class == DeviceClass::Cdrom;
            let disk = if self.class == DeviceClass::Cdrom {
                FileDiskImage::open(&path, read_only)?
            } else {
                FileDiskImage::open_block_sized(&path, block_size, read_only)?
            };
            return Ok(Some(Box::new(disk)));
        }
        Ok(self.scratch_blocks.map(|blocks| {
            let mut disk = MemoryDiskImage::new(blocks * block_size);
            disk.set_read_only(self.read_only);
            Box::new(disk) as Box<dyn DiskImage>
        }))
    }

    fn tape_image(&self, basedir: &Path) -> Result<Option<TapeImage>> {
        let mut tape = if let Some(image) = &self.image {
            TapeImage::load(&basedir.join(image))?
        } else if self.scratch_blocks.is_some() {
            TapeImage::blank()
        } else {
            return Ok(None);
        };
        tape.set_write_protect(self.read_only);
        Ok(Some(tape))
    }

    /// Creates the target for this unit, loading its medium.
    /// Relative image paths are resolved against `basedir`.
    pub fn create_target(&self, basedir: &Path) -> Result<Box<dyn ScsiTarget>> {
        let descriptor = self.descriptor();
        if descriptor.block_size == 0 && self.class != DeviceClass::Tape {
            bail!("Block size of {} at SCSI ID {} cannot be 0", self.class, self.id);
        }
        let target: Box<dyn ScsiTarget> = match self.class {
            DeviceClass::Disk | DeviceClass::Worm => {
                let disk = self.disk_image(basedir, descriptor.block_size)?;
                Box::new(ScsiTargetDisk::new(descriptor, disk))
            }
            DeviceClass::Cdrom => {
                let disk = self.disk_image(basedir, descriptor.block_size)?;
                Box::new(ScsiTargetCdrom::new(descriptor, disk))
            }
            DeviceClass::Tape => {
                let tape = self.tape_image(basedir)?;
                let tape = tape.map(|t| Box::new(t) as Box<dyn TapeMedium>);
                Box::new(ScsiTargetTape::new(descriptor, tape))
            }
        };
        Ok(target)
    }
}

impl BusConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid bus configuration")
    }

    /// Loads a configuration file. Image paths in it are taken relative to
    /// the file.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let basedir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok((config, basedir))
    }

    /// Creates the bus and attaches all configured units
    pub fn build(&self, basedir: &Path) -> Result<ScsiBus> {
        let mut bus = ScsiBus::new(self.frame_size);
        for unit in &self.units {
            if unit.id == self.host_id {
                return Err(AttachError::HostId(unit.id).into());
            }
            let target = unit
                .create_target(basedir)
                .with_context(|| format!("Failed to create {} at SCSI ID {}", unit.class, unit.id))?;
            bus.attach(unit.id, target)?;
            bus.set_enabled(unit.id, unit.enabled);
            log::info!(
                "SCSI ID {}: {} {}",
                unit.id,
                unit.class,
                unit.image
                    .as_ref()
                    .map_or_else(|| "(no image)".to_string(), |p| p.display().to_string())
            );
        }
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::initiator::Initiator;
    use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD};

    const CONFIG: &str = r#"{
        "frame_size": 65536,
        "units": [
            { "id": 0, "class": "disk", "scratch_blocks": 100, "product": "SCRATCH" },
            { "id": 4, "class": "tape", "scratch_blocks": 0, "block_size": 1024 },
            { "id": 5, "class": "cdrom", "enabled": false }
        ]
    }"#;

    #[test]
    fn parse_defaults() {
        let config = BusConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.host_id, 7);
        assert_eq!(config.frame_size, 65536);
        assert_eq!(config.units.len(), 3);
        assert!(config.units[0].enabled);
        assert!(!config.units[2].enabled);

        let desc = config.units[0].descriptor();
        assert_eq!(desc.product, "SCRATCH");
        assert_eq!(desc.vendor, "SCSIBUS");
        assert_eq!(desc.block_size, 512);
        assert_eq!(config.units[1].descriptor().block_size, 1024);
        assert_eq!(config.units[1].descriptor().gap_length, 1);

        assert!(BusConfig::from_json(r#"{ "units": [{ "id": 1, "class": "floppy" }] }"#).is_err());
        assert_eq!(BusConfig::from_json("{}").unwrap(), BusConfig::default());
    }

    #[test]
    fn build_bus() {
        let config = BusConfig::from_json(CONFIG).unwrap();
        let mut bus = config.build(Path::new(".")).unwrap();
        assert_eq!(bus.frame_size(), 65536);
        assert_eq!(bus.target(0).unwrap().blocks(), Some(100));
        assert_eq!(bus.target(4).unwrap().descriptor().class, DeviceClass::Tape);

        let host = Initiator::new(config.host_id);
        let t = host.command(&mut bus, 0, &[0, 0, 0, 0, 0, 0], &[]).unwrap();
        assert_eq!(t.status, STATUS_GOOD);
        let t = host.command(&mut bus, 4, &[0, 0, 0, 0, 0, 0], &[]).unwrap();
        assert_eq!(t.status, STATUS_GOOD);
        // Disabled
        assert!(host.command(&mut bus, 5, &[0, 0, 0, 0, 0, 0], &[]).is_err());
        bus.set_enabled(5, true);
        let t = host.command(&mut bus, 5, &[0, 0, 0, 0, 0, 0], &[]).unwrap();
        assert_eq!(t.status, STATUS_CHECK_CONDITION);
    }

    #[test]
    fn build_errors() {
        let host = BusConfig::from_json(r#"{ "units": [{ "id": 7, "class": "disk" }] }"#).unwrap();
        let err = host.build(Path::new(".")).err().unwrap();
        assert_eq!(
            err.downcast_ref::<AttachError>(),
            Some(&AttachError::HostId(7))
        );

        let dup = BusConfig::from_json(
            r#"{ "units": [{ "id": 1, "class": "disk" }, { "id": 1, "class": "tape" }] }"#,
        )
        .unwrap();
        assert!(dup.build(Path::new(".")).is_err());

        let missing = BusConfig::from_json(
            r#"{ "units": [{ "id": 1, "class": "disk", "image": "does/not/exist.img" }] }"#,
        )
        .unwrap();
        assert!(missing.build(Path::new(".")).is_err());

        for class in ["disk", "worm", "cdrom"] {
            let zero = BusConfig::from_json(&format!(
                r#"{{ "units": [{{ "id": 1, "class": "{class}", "scratch_blocks": 4, "block_size": 0 }}] }}"#
            ))
            .unwrap();
            assert!(zero.build(Path::new(".")).is_err(), "{class}");
        }
        // Tapes in variable mode have no block size
        let tape = BusConfig::from_json(
            r#"{ "units": [{ "id": 1, "class": "tape", "scratch_blocks": 0, "block_size": 0 }] }"#,
        )
        .unwrap();
        assert!(tape.build(Path::new(".")).is_ok());
    }

    #[test]
    fn tape_image_written_back() {
        let path = std::env::temp_dir().join(format!("scsibus_config_{}.tap", std::process::id()));
        std::fs::write(&path, []).unwrap();
        let config = BusConfig {
            units: vec![UnitConfig {
                image: Some(path.clone()),
                ..BusConfig::from_json(r#"{ "units": [{ "id": 4, "class": "tape" }] }"#)
                    .unwrap()
                    .units[0]
                    .clone()
            }],
            ..Default::default()
        };

        let mut bus = config.build(Path::new(".")).unwrap();
        let host = Initiator::new(config.host_id);
        let t = host
            .command(&mut bus, 4, &[0x0A, 0, 0, 0, 5, 0], b"HELLO")
            .unwrap();
        assert_eq!(t.status, STATUS_GOOD);
        drop(bus);

        let mut tape = TapeImage::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let mut buf = [0; 16];
        assert_eq!(tape.read_record(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"HELLO");
    }
}
