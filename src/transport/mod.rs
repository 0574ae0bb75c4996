//! The single connection to the Modbus network.
//!
//! Transports never retry. A failed read is reported as-is and the next polling cycle
//! naturally tries again.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[cfg(test)]
pub(crate) mod fake;
mod modbus;
mod solarman;

pub use modbus::ModbusTransport;
pub use solarman::SolarmanTransport;

pub trait Transport: Send {
    /// Addresses the device the following reads go to.
    fn select_unit(&mut self, unit: u8);

    /// Reads `count` holding registers starting at `start`, returned as big-endian bytes.
    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn select_unit(&mut self, unit: u8) {
        (**self).select_unit(unit);
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u8>> {
        (**self).read_holding_registers(start, count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransportConfig {
    /// Modbus RTU on a serial line.
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
    },
    /// Modbus TCP.
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    /// Modbus RTU tunnelled through a Solarman V5 data logging stick.
    Solarman {
        host: String,
        #[serde(default = "default_solarman_port")]
        port: u16,
        logger_serial: Option<u32>,
    },
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_stop_bits() -> u8 {
    1
}
fn default_data_bits() -> u8 {
    8
}
fn default_tcp_port() -> u16 {
    502
}
fn default_solarman_port() -> u16 {
    8899
}

impl TransportConfig {
    /// Human readable name of the medium, used in logs and errors.
    pub fn target(&self) -> String {
        match self {
            TransportConfig::Rtu {
                device, baud_rate, ..
            } => format!("modbus-rtu {device}@{baud_rate}"),
            TransportConfig::Tcp { host, port } => format!("modbus-tcp {host}:{port}"),
            TransportConfig::Solarman { host, port, .. } => format!("solarman {host}:{port}"),
        }
    }
}

/// Opens the medium described by `config`.
///
/// `connect_timeout` bounds the setup, `read_timeout` every later transaction.
pub fn open(
    config: &TransportConfig,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Box<dyn Transport>> {
    let target = config.target();
    log::debug!("Connecting to {target}");
    let connect_error = |source: std::io::Error| Error::Connect {
        target: target.clone(),
        timeout: connect_timeout,
        source,
    };

    let transport: Box<dyn Transport> = match config {
        TransportConfig::Rtu {
            device,
            baud_rate,
            parity,
            stop_bits,
            data_bits,
        } => Box::new(
            ModbusTransport::rtu(
                device,
                *baud_rate,
                *parity,
                *stop_bits,
                *data_bits,
                connect_timeout,
                read_timeout,
            )
            .map_err(connect_error)?,
        ),
        TransportConfig::Tcp { host, port } => {
            let addr = resolve(host, *port).map_err(connect_error)?;
            Box::new(
                ModbusTransport::tcp(addr, connect_timeout, read_timeout).map_err(connect_error)?,
            )
        }
        TransportConfig::Solarman {
            host,
            port,
            logger_serial,
        } => {
            let addr = resolve(host, *port).map_err(connect_error)?;
            Box::new(
                SolarmanTransport::new(addr, *logger_serial, connect_timeout, read_timeout)
                    .map_err(connect_error)?,
            )
        }
    };
    log::info!("Connected to {target}");
    Ok(transport)
}

fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{host} did not resolve to any address"),
        )
    })
}
