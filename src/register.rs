//! Register descriptors.
//!
//! A [`Register`] describes one addressable cell (or a run of cells for 32-bit
//! and string values) on the device. Each register feeds one or more
//! capabilities through its [`ParseConfiguration`]s, so a single address may
//! for example expose both a raw percentage and a normalised battery level.
//!
//! All descriptors are plain data built with `const fn`s, which lets device
//! models live in `static` tables (see [`crate::catalog`]).

use std::fmt;
use std::str::FromStr;

/// The Modbus table a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    /// Read-only measurement registers, function code `0x04`.
    Input,
    /// Configuration registers, function code `0x03` (and `0x10` for writes).
    Holding,
}

impl RegisterClass {
    /// The Modbus function code used to read this class.
    pub const fn read_function_code(&self) -> u8 {
        match self {
            RegisterClass::Input => 0x04,
            RegisterClass::Holding => 0x03,
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterClass::Input => write!(f, "input"),
            RegisterClass::Holding => write!(f, "holding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub const fn is_readable(&self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub const fn is_writable(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// The part of an installation a register describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Inverter,
    Battery,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Inverter => write!(f, "inverter"),
            DeviceRole::Battery => write!(f, "battery"),
        }
    }
}

impl FromStr for DeviceRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inverter" => Ok(DeviceRole::Inverter),
            "battery" => Ok(DeviceRole::Battery),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown device role '{other}'"
            ))),
        }
    }
}

/// Roles shared by most registers.
pub const INVERTER: &[DeviceRole] = &[DeviceRole::Inverter];
pub const BATTERY: &[DeviceRole] = &[DeviceRole::Battery];
pub const INVERTER_AND_BATTERY: &[DeviceRole] = &[DeviceRole::Inverter, DeviceRole::Battery];

/// The binary layout of a register value. All numeric types are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    String,
}

impl DataType {
    /// Number of 16-bit words a numeric type occupies, `None` for strings.
    pub const fn word_count(&self) -> Option<u16> {
        match self {
            DataType::U16 | DataType::I16 => Some(1),
            DataType::U32 | DataType::I32 => Some(2),
            DataType::String => None,
        }
    }

    /// Inclusive value range of a numeric type, `None` for strings.
    pub const fn range(&self) -> Option<(i64, i64)> {
        match self {
            DataType::U16 => Some((0, u16::MAX as i64)),
            DataType::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            DataType::U32 => Some((0, u32::MAX as i64)),
            DataType::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            DataType::String => None,
        }
    }
}

/// Lower and upper bound a decoded (and scaled) capability value must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidOptions {
    pub min: f64,
    pub max: f64,
}

/// Decoding that cannot be expressed as a linear scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// Maps an enumerated code to a text label.
    Lookup(&'static [(i64, &'static str)]),
    /// A single flag, bit 0 being the least significant bit of the register.
    Bit(u8),
    /// An unsigned field of `width` bits starting at bit `start`.
    BitField { start: u8, width: u8 },
    /// `(raw - offset) * scale`, e.g. temperatures reported with a +100.0 °C bias.
    Offset { offset: i64, scale: f64 },
    /// A 32-bit value stored low word first, then scaled.
    SwappedWords { scale: f64 },
}

/// How a raw register value becomes a capability value.
///
/// A register either scales linearly or runs a transform, never both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    Raw,
    Scale(f64),
    Transform(Transform),
}

/// Maps a register to one named capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseConfiguration {
    pub capability: &'static str,
    pub unit: Option<&'static str>,
    pub conversion: Conversion,
    pub valid: Option<ValidOptions>,
}

impl ParseConfiguration {
    pub const fn new(capability: &'static str) -> Self {
        Self {
            capability,
            unit: None,
            conversion: Conversion::Raw,
            valid: None,
        }
    }

    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.conversion = Conversion::Scale(scale);
        self
    }

    pub const fn transform(mut self, transform: Transform) -> Self {
        self.conversion = Conversion::Transform(transform);
        self
    }

    pub const fn valid(mut self, min: f64, max: f64) -> Self {
        self.valid = Some(ValidOptions { min, max });
        self
    }
}

/// An immutable register descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub address: u16,
    /// Length in 16-bit words.
    pub length: u16,
    pub data_type: DataType,
    pub access: AccessMode,
    pub roles: &'static [DeviceRole],
    pub parse: &'static [ParseConfiguration],
}

impl Register {
    /// A read-only numeric register; the length follows from the data type.
    pub const fn new(
        address: u16,
        data_type: DataType,
        parse: &'static [ParseConfiguration],
    ) -> Self {
        let length = match data_type.word_count() {
            Some(words) => words,
            None => 1,
        };
        Self {
            address,
            length,
            data_type,
            access: AccessMode::ReadOnly,
            roles: INVERTER,
            parse,
        }
    }

    /// A read-only string register spanning `length` words.
    pub const fn string(address: u16, length: u16, parse: &'static [ParseConfiguration]) -> Self {
        Self {
            address,
            length,
            data_type: DataType::String,
            access: AccessMode::ReadOnly,
            roles: INVERTER,
            parse,
        }
    }

    pub const fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub const fn roles(mut self, roles: &'static [DeviceRole]) -> Self {
        self.roles = roles;
        self
    }

    /// First address past this register.
    pub const fn end(&self) -> u32 {
        self.address as u32 + self.length as u32
    }

    pub fn has_role(&self, role: DeviceRole) -> bool {
        self.roles.contains(&role)
    }

    /// Number of bytes the register occupies on the wire.
    pub const fn byte_len(&self) -> usize {
        self.length as usize * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PV1: Register = Register::new(
        672,
        DataType::U16,
        &[ParseConfiguration::new("measure_power.pv1").unit("W")],
    );

    #[test]
    fn numeric_register_length_follows_data_type() {
        assert_eq!(PV1.length, 1);
        assert_eq!(PV1.end(), 673);
        let total = Register::new(534, DataType::U32, &[]);
        assert_eq!(total.length, 2);
        assert_eq!(total.byte_len(), 4);
    }

    #[test]
    fn parse_configuration_builder() {
        let config = ParseConfiguration::new("measure_voltage.pv1")
            .unit("V")
            .scale(0.1)
            .valid(0.0, 1000.0);
        assert_eq!(config.conversion, Conversion::Scale(0.1));
        assert_eq!(config.unit, Some("V"));
        assert_eq!(
            config.valid,
            Some(ValidOptions {
                min: 0.0,
                max: 1000.0
            })
        );
    }

    #[test]
    fn access_modes() {
        assert!(AccessMode::ReadOnly.is_readable());
        assert!(!AccessMode::ReadOnly.is_writable());
        assert!(!AccessMode::WriteOnly.is_readable());
        assert!(AccessMode::ReadWrite.is_writable());
    }

    #[test]
    fn device_role_from_str() {
        assert_eq!("Battery".parse::<DeviceRole>().unwrap(), DeviceRole::Battery);
        assert!("grid".parse::<DeviceRole>().is_err());
        assert!(PV1.has_role(DeviceRole::Inverter));
        assert!(!PV1.has_role(DeviceRole::Battery));
    }
}
