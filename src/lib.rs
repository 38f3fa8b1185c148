//! A library for reading and controlling hybrid solar inverters and their
//! batteries over Modbus.
//!
//! Devices are reached either directly via Modbus/TCP or through a Solarman
//! Wi-Fi data logger, which tunnels Modbus RTU frames inside its own V5
//! envelope. Both paths share the same register model:
//!
//! 1.  **Register catalog**: every supported inverter family is described as
//!     data in [`catalog`]. A [`register::Register`] maps one address to one or
//!     more named capabilities, each with its own scale or transform.
//!
//! 2.  **Device facade**: [`device::Device`] binds a model to a transport and
//!     offers a full read cycle, the capability list per device role and named
//!     write actions. All access to one device is serialised by a
//!     [`queue::CommandQueue`].
//!
//! ## Features
//!
//! - **Batched reads**: sparse registers are grouped into few contiguous
//!   requests (see [`batching`]), and a failing batch does not spoil the others.
//! - **Safe writes**: action arguments are validated and encoded before the
//!   first byte is sent; packed flag registers are updated with a
//!   read-modify-write that leaves the other bits untouched.
//! - **Two transports**: [`transport::ModbusTcpTransport`] and
//!   [`transport::SolarmanTransport`], each opening a fresh connection per
//!   operation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use solarlink_lib::{config::DeviceConfig, device::Device};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceConfig::from_yaml_file("inverter.yml")?;
//!     let device = Device::from_config(&config)?;
//!
//!     let cycle = device.read_all_registers().await?;
//!     for (capability, value) in cycle.values() {
//!         println!("{capability}: {value}");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod batching;
pub mod bits;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod register;
pub mod retry;
pub mod transport;

pub use error::{Error, Result};
