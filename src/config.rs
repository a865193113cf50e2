//! Machine configuration (ambient stack): a `serde`-deriving
//! `MachineConfig` loaded from TOML via the `toml` crate, covering the
//! Alpha machine's CPU count, clock, RAM size, PAL base, ROM path and
//! per-channel disk images.
//!
//! Validated once, in `validate()`, before a `System` is built from it —
//! a "reject before touching hardware" shape, so `System::new` can assume
//! its `MachineConfig` already satisfies basic sanity.

use crate::error::{EmulatorError, Result};
use serde::Deserialize;
use std::path::PathBuf;

fn default_cpu_count() -> usize {
    1
}

fn default_clock_hz() -> u64 {
    600_000_000
}

fn default_pal_base() -> u64 {
    0x8000_0000
}

fn default_irq_refire_grace_ticks() -> u64 {
    10_000
}

fn default_atapi_selection_timeout_ticks() -> u64 {
    50_000
}

/// One drive attached to a channel. `atapi = true` selects a CD-ROM/SCSI
/// target device instead of a plain ATA disk.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub image_path: PathBuf,
    #[serde(default)]
    pub atapi: bool,
    #[serde(default)]
    pub read_only: bool,
}

/// One ATA channel: up to two drives, master and slave.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub master: Option<DeviceConfig>,
    #[serde(default)]
    pub slave: Option<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_cpu_count")]
    pub cpu_count: usize,
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u64,
    pub ram_bytes: usize,
    #[serde(default = "default_pal_base")]
    pub pal_base: u64,
    pub rom_path: PathBuf,
    #[serde(default)]
    pub channels: [ChannelConfig; 2],
    #[serde(default = "default_irq_refire_grace_ticks")]
    pub irq_refire_grace_ticks: u64,
    #[serde(default = "default_atapi_selection_timeout_ticks")]
    pub atapi_selection_timeout_ticks: u64,
}

impl MachineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MachineConfig = toml::from_str(text).map_err(|e| EmulatorError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects configurations the rest of the crate cannot honor.
    /// A single `MachineConfig` only ever describes one controller with two
    /// channels, so the check here is the CPU-count / RAM-size sanity
    /// `System::new` needs to already hold before it builds any hardware.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 {
            return Err(EmulatorError::Configuration("cpu_count must be at least 1".into()));
        }
        if self.cpu_count > 32 {
            return Err(EmulatorError::Configuration("cpu_count exceeds the supported maximum of 32".into()));
        }
        if self.ram_bytes == 0 {
            return Err(EmulatorError::Configuration("ram_bytes must be nonzero".into()));
        }
        if self.clock_hz == 0 {
            return Err(EmulatorError::Configuration("clock_hz must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let config = MachineConfig::from_toml_str(
            r#"
            ram_bytes = 67108864
            rom_path = "srm.rom"
            "#,
        )
        .unwrap();
        assert_eq!(config.cpu_count, 1);
        assert_eq!(config.pal_base, 0x8000_0000);
        assert_eq!(config.irq_refire_grace_ticks, 10_000);
    }

    #[test]
    fn zero_cpu_count_is_rejected() {
        let config = MachineConfig::from_toml_str(
            r#"
            cpu_count = 0
            ram_bytes = 67108864
            rom_path = "srm.rom"
            "#,
        );
        assert!(config.is_err());
    }

    #[test]
    fn channel_with_a_disk_image_parses() {
        let config = MachineConfig::from_toml_str(
            r#"
            ram_bytes = 67108864
            rom_path = "srm.rom"

            [[channels]]
            [channels.master]
            image_path = "disk0.img"

            [[channels]]
            "#,
        )
        .unwrap();
        assert!(config.channels[0].master.is_some());
        assert!(config.channels[1].master.is_none());
    }
}
