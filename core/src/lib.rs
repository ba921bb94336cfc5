pub mod config;
pub mod scsi;
