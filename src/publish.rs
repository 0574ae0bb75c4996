//! Hands decoded records to InfluxDB.
//!
//! Scaling to physical units, the cell count override and skip-if-unchanged all live here,
//! the record itself stays as the device reported it.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rinfluxdb::line_protocol::blocking::Client;
use rinfluxdb::line_protocol::{Line, LineBuilder};

use crate::config::{Device, InfluxConfig};
use crate::decoder::{DeviceRecord, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Number(f64),
    Text(String),
}

/// Last published value per field of one device.
#[derive(Debug, Default)]
pub struct PublishCache {
    last: HashMap<String, Reading>,
}

impl PublishCache {
    /// Remembers `reading` and reports whether it differs from what was published before.
    pub fn changed(&mut self, field: &str, reading: &Reading) -> bool {
        if self.last.get(field) == Some(reading) {
            return false;
        }
        self.last.insert(field.to_owned(), reading.clone());
        true
    }
}

/// Fields to publish for `record`, in physical units.
pub fn readings(device: &Device, record: &DeviceRecord) -> Vec<(String, Reading)> {
    let reported_cells = record
        .get("cellVoltageCount")
        .and_then(Value::as_f64)
        .map(|count| count as u16);
    let cells = device.cell_count.or(reported_cells);

    let mut readings: Vec<_> = record
        .iter()
        .filter(|(name, _)| match (cell_index(name), cells) {
            (Some(index), Some(cells)) => index <= cells,
            _ => true,
        })
        .map(|(name, value)| {
            let reading = match value.as_f64() {
                Some(raw) => Reading::Number(raw * device.scales.get(name).copied().unwrap_or(1.0)),
                None => Reading::Text(value.to_string()),
            };
            (name.to_owned(), reading)
        })
        .collect();
    if let Some(cell_count) = device.cell_count {
        readings.push(("cell_count".to_owned(), Reading::Number(cell_count.into())));
    }
    readings
}

/// Index of a per-cell field such as `cell07Temp`.
fn cell_index(name: &str) -> Option<u16> {
    let rest = name.strip_prefix("cell")?;
    let (digits, kind) = rest.split_at_checked(2)?;
    if !matches!(kind, "Voltage" | "Temp") {
        return None;
    }
    digits.parse().ok()
}

pub struct Publisher {
    client: Client,
    database: String,
    measurement: String,
    skip_unchanged: bool,
}

impl Publisher {
    pub fn new(config: &InfluxConfig) -> anyhow::Result<Self> {
        let client = Client::new::<String, String>(
            reqwest::Url::parse(&format!("http://{}:{}", config.ip, config.port))
                .context("Influxdb ip or port invalid")?,
            None,
        )
        .context("Failed to create influxdb client")?;
        Ok(Publisher {
            client,
            database: config.database.clone(),
            measurement: config.measurement.clone(),
            skip_unchanged: config.skip_unchanged,
        })
    }

    pub fn publish(
        &self,
        device: &Device,
        record: &DeviceRecord,
        polled_at: DateTime<Utc>,
        cache: &mut PublishCache,
    ) -> anyhow::Result<()> {
        let Some(line) = self.line(device, record, polled_at, cache) else {
            log::debug!("[{}] Nothing changed, skipping publish", device.name);
            return Ok(());
        };
        self.client
            .send(&self.database, &[line])
            .context("Failed to store data in database")?;
        Ok(())
    }

    fn line(
        &self,
        device: &Device,
        record: &DeviceRecord,
        polled_at: DateTime<Utc>,
        cache: &mut PublishCache,
    ) -> Option<Line> {
        let mut builder = LineBuilder::new(self.measurement.clone())
            .insert_tag("device", device.name.clone())
            .insert_tag("unit", device.unit_id.to_string());
        let mut empty = true;
        for (name, reading) in readings(device, record) {
            if !cache.changed(&name, &reading) && self.skip_unchanged {
                continue;
            }
            empty = false;
            builder = match reading {
                Reading::Number(number) => builder.insert_field(name.as_str(), number),
                Reading::Text(text) => builder.insert_field(name.as_str(), text),
            };
        }
        (!empty).then(|| builder.set_timestamp(polled_at).build())
    }
}
