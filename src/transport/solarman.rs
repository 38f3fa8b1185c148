//! Solarman V5 tunnel transport.
//!
//! Data loggers made for Solarman cloud monitoring accept Modbus RTU frames
//! wrapped in a proprietary envelope keyed by the logger serial number:
//!
//! ```text
//! +------+--------+---------+----------+--------+---------+----------+------+
//! | 0xA5 | length | control | sequence | serial | payload | checksum | 0x15 |
//! |  1   | 2 (LE) | 2 (LE)  |  2 (LE)  | 4 (LE) |   var   |    1     |  1   |
//! +------+--------+---------+----------+--------+---------+----------+------+
//! ```
//!
//! The request payload is a frame type byte, a two byte sensor type, three
//! zeroed 32-bit time fields and the Modbus RTU frame (with CRC16). The
//! response payload carries a status byte instead of the sensor type.
//!
//! Every request uses a new TCP connection which is closed after exactly one
//! response has been received.

use super::{ReadSpan, Transport};
use crate::{register::RegisterClass, Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_modbus::ExceptionCode;

pub const START: u8 = 0xA5;
pub const END: u8 = 0x15;
pub const CONTROL_REQUEST: u16 = 0x4510;
pub const CONTROL_RESPONSE: u16 = 0x1510;
pub const CONTROL_HEARTBEAT: u16 = 0x4710;
pub const FRAME_TYPE_INVERTER: u8 = 0x02;

const HEADER_LEN: usize = 11;
const TRAILER_LEN: usize = 2;
const REQUEST_PAYLOAD_PREFIX: usize = 15;
const RESPONSE_PAYLOAD_PREFIX: usize = 14;

const FC_WRITE_MULTIPLE: u8 = 0x10;
/// Largest register count a single write multiple request may carry.
const MAX_WRITE_WORDS: usize = 123;

/// Modbus CRC16 (polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend(crc.to_le_bytes());
    frame
}

/// Verifies the trailing CRC and returns the frame without it.
pub fn check_crc(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 4 {
        return Err(Error::ProtocolError(format!(
            "Modbus frame of {} byte(s) is too short",
            frame.len()
        )));
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    if expected != received {
        return Err(Error::ProtocolError(format!(
            "CRC mismatch: expected {expected:#06x}, received {received:#06x}"
        )));
    }
    Ok(body)
}

/// Builds a read request (`0x03` holding / `0x04` input) RTU frame.
pub fn read_request(unit_id: u8, class: RegisterClass, address: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit_id, class.read_function_code()];
    frame.extend(address.to_be_bytes());
    frame.extend(count.to_be_bytes());
    with_crc(frame)
}

/// Builds a write multiple registers (`0x10`) RTU frame.
pub fn write_request(unit_id: u8, address: u16, words: &[u16]) -> Result<Vec<u8>> {
    if words.is_empty() || words.len() > MAX_WRITE_WORDS {
        return Err(Error::InvalidValue(format!(
            "cannot write {} register(s) in one request",
            words.len()
        )));
    }
    let mut frame = vec![unit_id, FC_WRITE_MULTIPLE];
    frame.extend(address.to_be_bytes());
    frame.extend((words.len() as u16).to_be_bytes());
    frame.push((words.len() * 2) as u8);
    frame.extend(words.iter().flat_map(|w| w.to_be_bytes()));
    Ok(with_crc(frame))
}

/// Checks address and function code of a response body, turning exception
/// responses into [`Error::ModbusException`].
fn check_header(body: &[u8], unit_id: u8, function_code: u8) -> Result<()> {
    if body[0] != unit_id {
        return Err(Error::ProtocolError(format!(
            "response from unit {} while talking to unit {unit_id}",
            body[0]
        )));
    }
    if body[1] == function_code | 0x80 {
        return Err(Error::ModbusException(ExceptionCode::new(
            body.get(2).copied().unwrap_or_default(),
        )));
    }
    if body[1] != function_code {
        return Err(Error::ProtocolError(format!(
            "unexpected function code {:#04x}, expected {function_code:#04x}",
            body[1]
        )));
    }
    Ok(())
}

/// Parses a read response RTU frame and returns the register bytes.
pub fn parse_read_response(
    frame: &[u8],
    unit_id: u8,
    class: RegisterClass,
    count: u16,
) -> Result<Vec<u8>> {
    let body = check_crc(frame)?;
    check_header(body, unit_id, class.read_function_code())?;
    if body.len() < 3 {
        return Err(Error::ProtocolError("read response without byte count".into()));
    }
    let byte_count = body[2] as usize;
    let data = &body[3..];
    if byte_count != data.len() || byte_count != count as usize * 2 {
        return Err(Error::ProtocolError(format!(
            "byte count {byte_count} does not match {} data byte(s) for {count} register(s)",
            data.len()
        )));
    }
    Ok(data.to_vec())
}

/// Parses the echo of a write multiple registers request.
pub fn parse_write_response(frame: &[u8], unit_id: u8, address: u16, count: u16) -> Result<()> {
    let body = check_crc(frame)?;
    check_header(body, unit_id, FC_WRITE_MULTIPLE)?;
    match body {
        [_, _, a0, a1, c0, c1]
            if [*a0, *a1] == address.to_be_bytes() && [*c0, *c1] == count.to_be_bytes() =>
        {
            Ok(())
        }
        _ => Err(Error::ProtocolError(format!(
            "write response does not echo address {address} and count {count}"
        ))),
    }
}

/// Derives the 4-byte logger identifier from its printed serial number.
pub fn logger_serial(serial: &str) -> Result<u32> {
    serial
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Config(format!("'{serial}' is not a numeric logger serial")))
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Wraps a Modbus RTU frame into a V5 request envelope.
pub fn wrap(serial: u32, sequence: u16, modbus_frame: &[u8]) -> Vec<u8> {
    let payload_len = (REQUEST_PAYLOAD_PREFIX + modbus_frame.len()) as u16;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len as usize + TRAILER_LEN);
    frame.push(START);
    frame.extend(payload_len.to_le_bytes());
    frame.extend(CONTROL_REQUEST.to_le_bytes());
    frame.extend(sequence.to_le_bytes());
    frame.extend(serial.to_le_bytes());
    frame.push(FRAME_TYPE_INVERTER);
    frame.extend([0x00, 0x00]); // sensor type
    frame.extend([0x00; 12]); // total working time, power on time, offset time
    frame.extend(modbus_frame);
    frame.push(checksum(&frame[1..]));
    frame.push(END);
    frame
}

/// A structurally valid V5 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub control: u16,
    pub sequence: u16,
    pub serial: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Verifies start and end bytes, the declared length and the checksum.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN + TRAILER_LEN {
            return Err(Error::ProtocolError(format!(
                "V5 frame of {} byte(s) is too short",
                frame.len()
            )));
        }
        if frame[0] != START || frame[frame.len() - 1] != END {
            return Err(Error::ProtocolError("invalid V5 start or end byte".into()));
        }
        let payload_len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        if frame.len() != HEADER_LEN + payload_len + TRAILER_LEN {
            return Err(Error::ProtocolError(format!(
                "V5 frame declares {payload_len} payload byte(s) but has {}",
                frame.len() - HEADER_LEN - TRAILER_LEN
            )));
        }
        let expected = checksum(&frame[1..frame.len() - 2]);
        if frame[frame.len() - 2] != expected {
            return Err(Error::ProtocolError(format!(
                "V5 checksum mismatch: expected {expected:#04x}, received {:#04x}",
                frame[frame.len() - 2]
            )));
        }
        Ok(Self {
            control: u16::from_le_bytes([frame[3], frame[4]]),
            sequence: u16::from_le_bytes([frame[5], frame[6]]),
            serial: u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]),
            payload: frame[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }

    /// The Modbus RTU frame inside a response payload.
    pub fn modbus_frame(&self) -> Result<&[u8]> {
        match self.payload.get(RESPONSE_PAYLOAD_PREFIX..) {
            Some(frame) if !frame.is_empty() => Ok(frame),
            _ => Err(Error::ProtocolError(
                "logger response carries no Modbus frame".into(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolarmanTransport {
    host: String,
    port: u16,
    serial: u32,
    unit_id: u8,
    timeout: Duration,
    sequence: Arc<AtomicU16>,
}

impl SolarmanTransport {
    pub const DEFAULT_PORT: u16 = 8899;

    pub fn new(
        host: impl Into<String>,
        port: u16,
        serial: u32,
        unit_id: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            serial,
            unit_id,
            timeout,
            sequence: Arc::new(AtomicU16::new(1)),
        }
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn read_envelope(stream: &mut TcpStream) -> Result<Envelope> {
        let mut frame = vec![0u8; HEADER_LEN];
        stream.read_exact(&mut frame).await?;
        if frame[0] != START {
            return Err(Error::ProtocolError(format!(
                "invalid V5 start byte {:#04x}",
                frame[0]
            )));
        }
        let payload_len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        frame.resize(HEADER_LEN + payload_len + TRAILER_LEN, 0);
        stream.read_exact(&mut frame[HEADER_LEN..]).await?;
        log::trace!("Received V5 frame {frame:02X?}");
        Envelope::parse(&frame)
    }

    async fn exchange(&self, modbus_frame: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.next_sequence();
        let request = wrap(self.serial, sequence, modbus_frame);
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        log::trace!("Sending V5 frame {request:02X?}");
        stream.write_all(&request).await?;
        loop {
            let envelope = Self::read_envelope(&mut stream).await?;
            if envelope.control == CONTROL_HEARTBEAT {
                log::debug!("Skipping logger heartbeat");
                continue;
            }
            if envelope.control != CONTROL_RESPONSE {
                return Err(Error::ProtocolError(format!(
                    "unexpected V5 control code {:#06x}",
                    envelope.control
                )));
            }
            if envelope.sequence & 0xFF != sequence & 0xFF {
                return Err(Error::ProtocolError(format!(
                    "V5 sequence {:#06x} does not match request {sequence:#06x}",
                    envelope.sequence
                )));
            }
            if envelope.serial != self.serial {
                return Err(Error::ProtocolError(format!(
                    "response from logger {} while talking to {}",
                    envelope.serial, self.serial
                )));
            }
            return envelope.modbus_frame().map(<[u8]>::to_vec);
        }
    }

    /// Sends one Modbus RTU frame over a new connection and returns the
    /// RTU response frame. The connection is closed when this returns.
    pub async fn request(&self, modbus_frame: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.exchange(modbus_frame)).await?
    }
}

#[async_trait]
impl Transport for SolarmanTransport {
    async fn read_spans(&self, spans: &[ReadSpan]) -> Result<Vec<Result<Vec<u8>>>> {
        let mut results = Vec::with_capacity(spans.len());
        for span in spans {
            let frame = read_request(self.unit_id, span.class, span.address, span.count);
            let result = self.request(&frame).await.and_then(|response| {
                parse_read_response(&response, self.unit_id, span.class, span.count)
            });
            if let Err(err) = &result {
                log::warn!(
                    "Reading {} registers {}..{} via logger {} failed: {err}",
                    span.class,
                    span.address,
                    span.address as u32 + span.count as u32,
                    self.serial
                );
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn write_registers(&self, address: u16, words: &[u16]) -> Result<()> {
        let frame = write_request(self.unit_id, address, words)?;
        log::debug!("Writing {words:?} to holding register {address} via logger {}", self.serial);
        let response = self.request(&frame).await?;
        parse_write_response(&response, self.unit_id, address, words.len() as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    const SERIAL: u32 = 1_234_567_890;

    #[test]
    fn crc_of_known_frames() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        assert_eq!(crc16(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01]), 0xCA31);
    }

    #[test]
    fn read_request_frames() {
        assert_eq!(
            read_request(1, RegisterClass::Holding, 0, 1),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
        assert_eq!(
            read_request(1, RegisterClass::Input, 0, 1),
            vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x01, 0x31, 0xCA]
        );
    }

    #[test]
    fn write_request_frame() {
        let frame = write_request(1, 0x008E, &[0x0001, 0x1388]).unwrap();
        assert_eq!(
            &frame[..11],
            &[0x01, 0x10, 0x00, 0x8E, 0x00, 0x02, 0x04, 0x00, 0x01, 0x13, 0x88]
        );
        assert!(check_crc(&frame).is_ok());
        assert_matches!(write_request(1, 0, &[]), Err(Error::InvalidValue(..)));
        assert_matches!(write_request(1, 0, &[0; 124]), Err(Error::InvalidValue(..)));
    }

    #[test]
    fn wrap_matches_captured_request() {
        let frame = read_request(1, RegisterClass::Holding, 520, 15);
        assert_eq!(frame, vec![0x01, 0x03, 0x02, 0x08, 0x00, 0x0F, 0x85, 0xB4]);
        assert_eq!(
            wrap(SERIAL, 0x1234, &frame),
            vec![
                0xA5, 0x17, 0x00, 0x10, 0x45, 0x34, 0x12, 0xD2, 0x02, 0x96, 0x49, 0x02, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x01, 0x03, 0x02, 0x08, 0x00, 0x0F, 0x85, 0xB4, 0xBD, 0x15
            ]
        );
    }

    #[test]
    fn logger_serial_parsing() {
        assert_eq!(logger_serial("1234567890").unwrap(), SERIAL);
        assert_eq!(logger_serial(" 2712345678 ").unwrap(), 2_712_345_678);
        assert_matches!(logger_serial("ABC123"), Err(Error::Config(..)));
        assert_matches!(logger_serial("99999999999"), Err(Error::Config(..)));
    }

    /// Builds a response envelope the way a logger does.
    fn response(serial: u32, sequence: u16, control: u16, modbus_frame: &[u8]) -> Vec<u8> {
        let mut frame = vec![START];
        frame.extend(((RESPONSE_PAYLOAD_PREFIX + modbus_frame.len()) as u16).to_le_bytes());
        frame.extend(control.to_le_bytes());
        frame.extend(sequence.to_le_bytes());
        frame.extend(serial.to_le_bytes());
        frame.push(FRAME_TYPE_INVERTER);
        frame.push(0x01); // status
        frame.extend([0x00; 12]);
        frame.extend(modbus_frame);
        frame.push(checksum(&frame[1..]));
        frame.push(END);
        frame
    }

    fn read_response(unit_id: u8, function_code: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![unit_id, function_code, data.len() as u8];
        frame.extend(data);
        with_crc(frame)
    }

    #[test]
    fn envelope_parsing() {
        let modbus = read_response(1, 0x03, &[0x00, 0x64]);
        let frame = response(SERIAL, 7, CONTROL_RESPONSE, &modbus);
        let envelope = Envelope::parse(&frame).unwrap();
        assert_eq!(envelope.control, CONTROL_RESPONSE);
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.serial, SERIAL);
        assert_eq!(envelope.modbus_frame().unwrap(), modbus.as_slice());

        let mut corrupt = frame.clone();
        corrupt[20] ^= 0xFF;
        assert_matches!(Envelope::parse(&corrupt), Err(Error::ProtocolError(..)));

        let mut bad_end = frame.clone();
        *bad_end.last_mut().unwrap() = 0x00;
        assert_matches!(Envelope::parse(&bad_end), Err(Error::ProtocolError(..)));

        assert_matches!(Envelope::parse(&frame[..frame.len() - 3]), Err(Error::ProtocolError(..)));

        let empty = Envelope::parse(&response(SERIAL, 7, CONTROL_RESPONSE, &[])).unwrap();
        assert_matches!(empty.modbus_frame(), Err(Error::ProtocolError(..)));
    }

    #[test]
    fn read_response_parsing() {
        let frame = read_response(1, 0x04, &[0x00, 0x64, 0x01, 0x02]);
        assert_eq!(
            parse_read_response(&frame, 1, RegisterClass::Input, 2).unwrap(),
            vec![0x00, 0x64, 0x01, 0x02]
        );
        assert_matches!(
            parse_read_response(&frame, 1, RegisterClass::Input, 3),
            Err(Error::ProtocolError(..))
        );
        assert_matches!(
            parse_read_response(&frame, 2, RegisterClass::Input, 2),
            Err(Error::ProtocolError(..))
        );
        assert_matches!(
            parse_read_response(&frame, 1, RegisterClass::Holding, 2),
            Err(Error::ProtocolError(..))
        );
        let mut bad_crc = frame.clone();
        bad_crc[3] = 0xFF;
        assert_matches!(
            parse_read_response(&bad_crc, 1, RegisterClass::Input, 2),
            Err(Error::ProtocolError(..))
        );
        let exception = with_crc(vec![0x01, 0x83, 0x02]);
        assert_matches!(
            parse_read_response(&exception, 1, RegisterClass::Holding, 2),
            Err(Error::ModbusException(ExceptionCode::IllegalDataAddress))
        );
    }

    #[test]
    fn write_response_parsing() {
        let echo = with_crc(vec![0x01, 0x10, 0x00, 0x8E, 0x00, 0x02]);
        assert!(parse_write_response(&echo, 1, 0x008E, 2).is_ok());
        assert_matches!(
            parse_write_response(&echo, 1, 0x008F, 2),
            Err(Error::ProtocolError(..))
        );
        let acknowledge = with_crc(vec![0x01, 0x90, 0x05]);
        assert_matches!(
            parse_write_response(&acknowledge, 1, 0x008E, 2),
            Err(Error::ModbusException(ExceptionCode::Acknowledge))
        );
        let gateway = with_crc(vec![0x01, 0x90, 0x0B]);
        assert_matches!(
            parse_write_response(&gateway, 1, 0x008E, 2),
            Err(Error::ModbusException(ExceptionCode::GatewayTargetDevice))
        );
    }

    /// A fake logger answering each connection with the frames produced by `reply`.
    async fn fake_logger<F>(reply: F) -> (u16, tokio::task::JoinHandle<usize>)
    where
        F: Fn(Envelope) -> Vec<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            // Sockets stay open until the logger goes idle, so a missing reply
            // shows up as a timeout rather than a closed connection.
            let mut sockets = Vec::new();
            while let Ok(Ok((mut socket, _))) =
                tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
            {
                let request = SolarmanTransport::read_envelope(&mut socket).await.unwrap();
                for frame in reply(request) {
                    socket.write_all(&frame).await.unwrap();
                }
                sockets.push(socket);
            }
            sockets.len()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn read_spans_over_fake_logger() {
        let (port, logger) = fake_logger(|request| {
            let rtu = &request.payload[REQUEST_PAYLOAD_PREFIX..];
            let count = u16::from_be_bytes([rtu[4], rtu[5]]);
            let data: Vec<u8> = (0..count).flat_map(|i| (i + 1).to_be_bytes()).collect();
            vec![
                response(request.serial, 0, CONTROL_HEARTBEAT, &[]),
                response(
                    request.serial,
                    request.sequence,
                    CONTROL_RESPONSE,
                    &read_response(rtu[0], rtu[1], &data),
                ),
            ]
        })
        .await;

        let transport =
            SolarmanTransport::new("127.0.0.1", port, SERIAL, 1, Duration::from_secs(2));
        let spans = [
            ReadSpan {
                class: RegisterClass::Holding,
                address: 520,
                count: 2,
            },
            ReadSpan {
                class: RegisterClass::Input,
                address: 1000,
                count: 1,
            },
        ];
        let results = transport.read_spans(&spans).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &vec![0x00, 0x01, 0x00, 0x02]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![0x00, 0x01]);
        // one connection per request
        assert_eq!(logger.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wrong_serial_is_protocol_error() {
        let (port, _logger) = fake_logger(|request| {
            vec![response(
                request.serial + 1,
                request.sequence,
                CONTROL_RESPONSE,
                &read_response(1, 0x03, &[0x00, 0x01]),
            )]
        })
        .await;
        let transport =
            SolarmanTransport::new("127.0.0.1", port, SERIAL, 1, Duration::from_secs(2));
        let span = ReadSpan {
            class: RegisterClass::Holding,
            address: 0,
            count: 1,
        };
        assert_matches!(transport.read_span(span).await, Err(Error::ProtocolError(..)));
    }

    #[tokio::test]
    async fn silent_logger_times_out() {
        let (port, _logger) = fake_logger(|_| Vec::new()).await;
        let transport =
            SolarmanTransport::new("127.0.0.1", port, SERIAL, 1, Duration::from_millis(100));
        let result = transport.write_registers(142, &[1]).await;
        assert_matches!(result, Err(Error::TransactionTimedOut));
    }

    #[tokio::test]
    async fn write_over_fake_logger() {
        let (port, _logger) = fake_logger(|request| {
            let rtu = &request.payload[REQUEST_PAYLOAD_PREFIX..];
            vec![response(
                request.serial,
                request.sequence,
                CONTROL_RESPONSE,
                &with_crc(rtu[..6].to_vec()),
            )]
        })
        .await;
        let transport =
            SolarmanTransport::new("127.0.0.1", port, SERIAL, 1, Duration::from_secs(2));
        assert!(transport.write_registers(142, &[1, 5000]).await.is_ok());
    }
}
