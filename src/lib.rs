//! Polls Modbus devices over one shared RTU, TCP or Solarman connection and decodes their
//! holding registers into flat records.
//!
//! ```no_run
//! use modbus_mon::{families::Family, query::Timeouts, transport::TransportConfig, Bus};
//!
//! # fn main() -> modbus_mon::Result<()> {
//! let transport = TransportConfig::Tcp { host: "192.168.1.20".to_owned(), port: 502 };
//! let bus = Bus::connect(&transport, Timeouts::default())?;
//! let record = bus.query(48, &Family::RenogyBattery.blocks()?)?;
//! println!("{:?}", record.get("cellVoltageCount"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::dbg_macro,
    clippy::decimal_literal_representation,
    clippy::panic_in_result_fn,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_in_result,
    clippy::use_debug
)]
#![cfg_attr(not(test), warn(clippy::panic, clippy::unwrap_used))]

pub mod block;
pub mod config;
pub mod decoder;
pub mod error;
pub mod families;
pub mod interlock;
pub mod publish;
pub mod query;
pub mod transport;

pub use decoder::DeviceRecord;
pub use error::{Error, Result};
pub use query::Bus;
