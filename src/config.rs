use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::block::{Block, BlockConfig};
use crate::error::{Error, Result};
use crate::families::Family;
use crate::query::Timeouts;
use crate::transport::TransportConfig;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub bus: BusConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    pub influx: Option<InfluxConfig>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub transport: TransportConfig,
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_polling_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct InfluxConfig {
    pub ip: std::net::IpAddr,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    #[serde(default = "default_database_name")]
    pub database: String,
    #[serde(default = "default_measurement_name")]
    pub measurement: String,
    #[serde(default)]
    pub skip_unchanged: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub unit_id: u8,
    pub family: Option<Family>,
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
    #[serde(default)]
    pub scale: HashMap<String, f64>,
    /// Overrides the cell count the device reports, which some battery revisions get wrong.
    pub cell_count: Option<u16>,
}

/// A configured device with its register map validated.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub unit_id: u8,
    pub blocks: Vec<Block>,
    pub scales: HashMap<String, f64>,
    pub cell_count: Option<u16>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_polling_interval() -> u64 {
    10
}
fn default_influx_port() -> u16 {
    8086
}
fn default_database_name() -> String {
    "modbus".to_string()
}
fn default_measurement_name() -> String {
    "modbus".to_string()
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_secs: default_polling_interval(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}.", path.display()))?;
        config_str.parse()
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    /// Resolves every device into its blocks, rejecting fields that do not fit their block.
    pub fn devices(&self) -> Result<Vec<Device>> {
        self.devices
            .iter()
            .map(|(name, device)| device.resolve(name))
            .collect()
    }
}

impl std::str::FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(config_str: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config file.")?;
        config.bus.validate()?;
        Ok(config)
    }
}

impl BusConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
            lock: Duration::from_secs(self.lock_timeout_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if let TransportConfig::Rtu {
            stop_bits,
            data_bits,
            ..
        } = &self.transport
        {
            if !matches!(stop_bits, 1 | 2) {
                return Err(Error::Config(format!("{stop_bits} stop bits")));
            }
            if !(5..=8).contains(data_bits) {
                return Err(Error::Config(format!("{data_bits} data bits")));
            }
        }
        if self.connect_timeout_secs == 0
            || self.read_timeout_secs == 0
            || self.lock_timeout_secs == 0
        {
            return Err(Error::Config("timeouts must be positive".to_owned()));
        }
        Ok(())
    }
}

impl DeviceConfig {
    fn resolve(&self, name: &str) -> Result<Device> {
        let mut blocks = Vec::new();
        let mut scales = HashMap::new();
        if let Some(family) = self.family {
            blocks.extend(family.blocks()?);
            scales.extend(family.scales());
        }
        for block in &self.blocks {
            blocks.push(Block::try_from(block.clone())?);
        }
        if blocks.is_empty() {
            return Err(Error::Config(format!(
                "device `{name}` has neither a family nor blocks"
            )));
        }
        for field in self.scale.keys() {
            if !blocks.iter().any(|block| block.fields.contains_key(field)) {
                log::warn!("[{name}] Scale given for unknown field `{field}`");
            }
        }
        scales.extend(self.scale.clone());

        Ok(Device {
            name: name.to_owned(),
            unit_id: self.unit_id,
            blocks,
            scales,
            cell_count: self.cell_count,
        })
    }
}
