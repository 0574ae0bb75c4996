use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::client::sync::{self, Context};
use tokio_modbus::prelude::{Slave, SlaveContext, SyncReader};

use super::{Parity, Transport};
use crate::error::{Error, Result};

/// Modbus RTU or TCP client backed by the synchronous `tokio-modbus` context.
pub struct ModbusTransport {
    context: Context,
    unit: u8,
    read_timeout: Duration,
}

impl ModbusTransport {
    pub fn tcp(
        addr: SocketAddr,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> std::io::Result<Self> {
        let slave = Slave::tcp_device();
        let context = sync::tcp::connect_slave_with_timeout(addr, slave, Some(connect_timeout))?;
        Ok(Self::with_context(context, slave.0, read_timeout))
    }

    pub fn rtu(
        device: &str,
        baud_rate: u32,
        parity: Parity,
        stop_bits: u8,
        data_bits: u8,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> std::io::Result<Self> {
        let builder = tokio_serial::new(device, baud_rate)
            .parity(match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            })
            .stop_bits(serial_stop_bits(stop_bits)?)
            .data_bits(serial_data_bits(data_bits)?);
        let context =
            sync::rtu::connect_slave_with_timeout(&builder, Slave(1), Some(connect_timeout))?;
        Ok(Self::with_context(context, 1, read_timeout))
    }

    fn with_context(mut context: Context, unit: u8, read_timeout: Duration) -> Self {
        context.set_timeout(Some(read_timeout));
        ModbusTransport {
            context,
            unit,
            read_timeout,
        }
    }
}

fn serial_stop_bits(stop_bits: u8) -> std::io::Result<tokio_serial::StopBits> {
    match stop_bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported number of stop bits: {other}"),
        )),
    }
}

fn serial_data_bits(data_bits: u8) -> std::io::Result<tokio_serial::DataBits> {
    match data_bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported number of data bits: {other}"),
        )),
    }
}

impl Transport for ModbusTransport {
    fn select_unit(&mut self, unit: u8) {
        self.unit = unit;
        self.context.set_slave(Slave(unit));
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u8>> {
        let words = match self.context.read_holding_registers(start, count) {
            Ok(Ok(words)) => words,
            Ok(Err(exception)) => {
                return Err(Error::Exception {
                    unit: self.unit,
                    reason: format!("{exception:?}"),
                })
            }
            Err(tokio_modbus::Error::Transport(error)) => {
                return Err(Error::Transport(error).timed_out_after(self.read_timeout))
            }
            Err(tokio_modbus::Error::Protocol(error)) => {
                return Err(Error::Transport(std::io::Error::other(error)))
            }
        };
        if words.len() != usize::from(count) {
            return Err(Error::malformed(format!(
                "asked unit {} for {count} registers at {start}, got {}",
                self.unit,
                words.len()
            )));
        }
        Ok(words.into_iter().flat_map(u16::to_be_bytes).collect())
    }
}
