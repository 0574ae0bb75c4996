use std::time::Duration;

use crate::block::{Block, RegisterBlock};
use crate::decoder::{self, DeviceRecord};
use crate::error::Result;
use crate::interlock::Interlock;
use crate::transport::{self, Transport, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub lock: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(30),
            read: Duration::from_secs(30),
            lock: Duration::from_secs(30),
        }
    }
}

/// One shared connection to the Modbus network, safe to query from any number of threads.
pub struct Bus {
    transport: Interlock<Box<dyn Transport>>,
    lock_timeout: Duration,
}

impl Bus {
    /// Opens the transport. A failure here is fatal, there is no retry.
    pub fn connect(config: &TransportConfig, timeouts: Timeouts) -> Result<Self> {
        let transport = transport::open(config, timeouts.connect, timeouts.read)?;
        Ok(Self::new(transport, timeouts.lock))
    }

    pub fn new(transport: Box<dyn Transport>, lock_timeout: Duration) -> Self {
        Bus {
            transport: Interlock::new(transport),
            lock_timeout,
        }
    }

    /// Reads a whole block in one transaction addressed to `unit`.
    pub fn read_block(&self, unit: u8, range: RegisterBlock) -> Result<Vec<u8>> {
        self.transport.with_lock(self.lock_timeout, |transport| {
            transport.select_unit(unit);
            transport.read_holding_registers(range.start(), range.len())
        })
    }

    /// Reads and decodes every block of a device, in order.
    ///
    /// Any failing block fails the whole query, a record is never returned with fields missing.
    pub fn query(&self, unit: u8, blocks: &[Block]) -> Result<DeviceRecord> {
        let partials = blocks
            .iter()
            .map(|block| {
                log::debug!(
                    "[unit {unit}] Reading `{}` ({}..{})",
                    block.name,
                    block.range.start(),
                    block.range.end()
                );
                let data = self.read_block(unit, block.range)?;
                decoder::decode(&data, block.range.start(), &block.fields)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DeviceRecord::merge(partials))
    }
}
