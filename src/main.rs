#![forbid(unsafe_code)]
#![warn(
    clippy::dbg_macro,
    clippy::decimal_literal_representation,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_in_result,
    clippy::unwrap_used,
    clippy::use_debug
)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Context;
use modbus_mon::config::{Config, Device, InfluxConfig};
use modbus_mon::publish::{PublishCache, Publisher};
use modbus_mon::Bus;

/// Polls one device forever, only returns with an error that must stop the process.
fn run_polling(
    device: Device,
    bus: Arc<Bus>,
    influx: Option<InfluxConfig>,
    interval: Duration,
) -> anyhow::Error {
    let publisher = match influx.as_ref().map(Publisher::new).transpose() {
        Ok(publisher) => publisher,
        Err(e) => return e.context(format!("[{}] Failed to set up publishing", device.name)),
    };
    let mut cache = PublishCache::default();

    loop {
        let started = Instant::now();
        let polled_at = chrono::Utc::now();
        match bus.query(device.unit_id, &device.blocks) {
            Ok(record) => {
                log::debug!("[{}] Received data: {record:?}", device.name);
                match &publisher {
                    Some(publisher) => {
                        if let Err(e) = publisher.publish(&device, &record, polled_at, &mut cache) {
                            log::error!("[{}] {e:#}", device.name);
                        }
                    }
                    None => {
                        for (name, value) in record.iter() {
                            log::info!("[{}] {name} = {value}", device.name);
                        }
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                return anyhow::Error::new(e).context(format!("[{}] Giving up", device.name))
            }
            Err(e) => log::warn!("[{}] No data this cycle ({e})", device.name),
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }
}

fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from);
    let config = Config::load(&path)?;
    simple_logger::init_with_level(log::Level::from_str(&config.log_level)?)
        .context("Failed to init logging")?;

    let devices = config.devices().context("Invalid device definitions")?;
    if devices.is_empty() {
        log::warn!("No devices configured, nothing to poll");
        return Ok(());
    }
    let bus = Arc::new(
        Bus::connect(&config.bus.transport, config.bus.timeouts())
            .context("Failed to open the modbus transport")?,
    );

    let (fatal_tx, fatal_rx) = mpsc::channel();
    for device in devices {
        let (bus, influx, fatal_tx) = (bus.clone(), config.influx.clone(), fatal_tx.clone());
        let interval = config.polling_interval();
        log::info!("[{}] Polling unit {} every {interval:?}", device.name, device.unit_id);
        std::thread::spawn(move || {
            let error = run_polling(device, bus, influx, interval);
            // the receiver only goes away once main is already exiting
            let _ = fatal_tx.send(error);
        });
    }
    drop(fatal_tx);

    match fatal_rx.recv() {
        Ok(error) => {
            log::error!("{error:#}");
            Err(error)
        }
        Err(_) => Ok(()),
    }
}
