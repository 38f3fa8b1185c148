//! Error type shared by the register model, the transports and the device facade.

/// Represents all possible errors of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A value does not fit the register's data type or its valid options.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A bit edit reaches past the end of the register buffer.
    #[error("Bit index {bit_index} with {count} bit(s) is out of range for {buffer_len} byte(s)")]
    BitIndexOutOfRange {
        bit_index: usize,
        count: usize,
        buffer_len: usize,
    },

    /// The catalog has no register at the requested address.
    #[error("Register {address} not found")]
    RegisterNotFound { address: u16 },

    /// Too many commands with the same name are already queued or in flight.
    #[error("Command queue saturated for '{0}'")]
    QueueSaturated(String),

    /// The device did not answer within the configured timeout.
    #[error("Transaction timed out")]
    TransactionTimedOut,

    /// A frame could not be parsed or its checksum did not match.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The device answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    ModbusException(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// The device model has no action with this name.
    #[error("Action '{0}' not found")]
    ActionNotFound(String),

    /// An action argument is missing or has the wrong type.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection settings are incomplete or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` if the caller should schedule a retry of the whole
    /// read cycle or write instead of treating the error as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TransactionTimedOut | Error::Io(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Error::TransactionTimedOut
        } else {
            Error::Io(err)
        }
    }
}

impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Error {
        match err {
            tokio_modbus::Error::Transport(io) => io.into(),
            other => Error::ProtocolError(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::TransactionTimedOut
    }
}

/// The result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
