//! Wire transports.
//!
//! Both transports open a fresh connection per logical operation and never
//! share a socket between operations. Serialising operations on one device is
//! the job of the [`CommandQueue`](crate::queue::CommandQueue), not of the
//! transport.

use crate::{register::RegisterClass, Result};
use async_trait::async_trait;

pub mod modbus_tcp;
pub mod solarman;

pub use modbus_tcp::ModbusTcpTransport;
pub use solarman::SolarmanTransport;

/// One contiguous register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub class: RegisterClass,
    pub address: u16,
    pub count: u16,
}

/// Converts register words to the big-endian byte layout the codec works on.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Converts a big-endian byte buffer to register words, padding an odd trailing byte.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|chunk| match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        })
        .collect()
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes all `spans` as one logical read operation.
    ///
    /// The outer error reports a failure that prevented the whole operation
    /// (e.g. the connection could not be opened); the inner results report
    /// each span separately so that one failing span does not discard the others.
    async fn read_spans(&self, spans: &[ReadSpan]) -> Result<Vec<Result<Vec<u8>>>>;

    /// Writes `words` to consecutive holding registers starting at `address`.
    async fn write_registers(&self, address: u16, words: &[u16]) -> Result<()>;

    /// Reads a single span; convenience for read-modify-write sequences.
    async fn read_span(&self, span: ReadSpan) -> Result<Vec<u8>> {
        self.read_spans(&[span])
            .await?
            .pop()
            .unwrap_or_else(|| Err(crate::Error::ProtocolError("no response".into())))
    }
}

/// The transport selected by a [`DeviceConfig`](crate::config::DeviceConfig).
#[derive(Debug, Clone)]
pub enum DeviceTransport {
    Modbus(ModbusTcpTransport),
    Solarman(SolarmanTransport),
}

#[async_trait]
impl Transport for DeviceTransport {
    async fn read_spans(&self, spans: &[ReadSpan]) -> Result<Vec<Result<Vec<u8>>>> {
        match self {
            DeviceTransport::Modbus(transport) => transport.read_spans(spans).await,
            DeviceTransport::Solarman(transport) => transport.read_spans(spans).await,
        }
    }

    async fn write_registers(&self, address: u16, words: &[u16]) -> Result<()> {
        match self {
            DeviceTransport::Modbus(transport) => transport.write_registers(address, words).await,
            DeviceTransport::Solarman(transport) => {
                transport.write_registers(address, words).await
            }
        }
    }
}
