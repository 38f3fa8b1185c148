//! Direct Modbus/TCP transport built on `tokio-modbus`.
//!
//! Each logical operation (a full read cycle or a single write) opens its own
//! client context, sets the unit id, runs its requests under the configured
//! timeout and closes the connection again, whether the operation succeeded
//! or not.

use super::{words_to_bytes, ReadSpan, Transport};
use crate::{register::RegisterClass, Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Client, Reader, Slave, Writer};

#[derive(Debug, Clone)]
pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl ModbusTcpTransport {
    pub const DEFAULT_PORT: u16 = 502;

    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }

    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO or protocol error
        }
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("Cannot resolve host '{}'", self.host)))
    }

    async fn connect(&self) -> Result<Context> {
        let socket_addr = self.resolve().await?;
        log::debug!("Connecting to Modbus TCP device at {socket_addr} (unit {})", self.unit_id);
        let ctx = tokio::time::timeout(
            self.timeout,
            tokio_modbus::client::tcp::connect_slave(socket_addr, Slave(self.unit_id)),
        )
        .await??;
        Ok(ctx)
    }

    async fn close(ctx: &mut Context) {
        if let Err(err) = ctx.disconnect().await {
            log::debug!("Closing Modbus TCP connection failed: {err}");
        }
    }

    async fn read(&self, ctx: &mut Context, span: &ReadSpan) -> Result<Vec<u8>> {
        let request = async {
            match span.class {
                RegisterClass::Input => ctx.read_input_registers(span.address, span.count).await,
                RegisterClass::Holding => {
                    ctx.read_holding_registers(span.address, span.count).await
                }
            }
        };
        let words = Self::map_tokio_result(tokio::time::timeout(self.timeout, request).await?)?;
        if words.len() != span.count as usize {
            return Err(Error::ProtocolError(format!(
                "expected {} register(s) at {}, got {}",
                span.count,
                span.address,
                words.len()
            )));
        }
        Ok(words_to_bytes(&words))
    }
}

#[async_trait]
impl Transport for ModbusTcpTransport {
    async fn read_spans(&self, spans: &[ReadSpan]) -> Result<Vec<Result<Vec<u8>>>> {
        let mut ctx = self.connect().await?;
        let mut results = Vec::with_capacity(spans.len());
        for span in spans {
            let result = self.read(&mut ctx, span).await;
            if let Err(err) = &result {
                log::warn!(
                    "Reading {} registers {}..{} failed: {err}",
                    span.class,
                    span.address,
                    span.address as u32 + span.count as u32
                );
            }
            results.push(result);
        }
        Self::close(&mut ctx).await;
        Ok(results)
    }

    async fn write_registers(&self, address: u16, words: &[u16]) -> Result<()> {
        let mut ctx = self.connect().await?;
        log::debug!("Writing {words:?} to holding register {address}");
        let result = match tokio::time::timeout(
            self.timeout,
            ctx.write_multiple_registers(address, words),
        )
        .await
        {
            Ok(result) => Self::map_tokio_result(result),
            Err(elapsed) => Err(elapsed.into()),
        };
        Self::close(&mut ctx).await;
        result
    }
}
