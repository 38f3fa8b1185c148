use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use solarlink_lib::{codec::Value, register::DeviceRole, transport::solarman};
use std::path::PathBuf;
use std::time::Duration;

fn parse_unit_id(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))
}

fn parse_serial(s: &str) -> Result<String, String> {
    solarman::logger_serial(s).map_err(|e| e.to_string())?;
    Ok(s.trim().to_string())
}

fn parse_role(s: &str) -> Result<DeviceRole, String> {
    s.parse::<DeviceRole>().map_err(|e| e.to_string())
}

/// Parses `key=value`; the value becomes a bool, an integer (decimal or hex),
/// a float or else a text label.
fn parse_action_arg(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Missing parameter name in '{s}'"));
    }
    let value = value.trim();
    let value = match value {
        "true" | "on" => Value::Bool(true),
        "false" | "off" => Value::Bool(false),
        _ => {
            let integer = match value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
            {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => i64::from_str_radix(value, 10),
            };
            if let Ok(integer) = integer {
                Value::Integer(integer)
            } else if let Ok(float) = value.parse::<f64>() {
                Value::Float(float)
            } else {
                Value::Text(value.to_string())
            }
        }
    };
    Ok((key.to_string(), value))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to an inverter via Modbus TCP.
    Tcp {
        /// The IP address or hostname of the Modbus TCP device.
        host: String,

        /// Device model, see the `models` command.
        #[arg(short, long)]
        model: String,

        /// TCP port of the device.
        #[arg(short, long, default_value_t = 502)]
        port: u16,

        /// Modbus unit id, decimal or hexadecimal (e.g. "0x01").
        #[arg(short, long, default_value = "1", value_parser = parse_unit_id)]
        unit_id: u8,

        /// Commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to an inverter through a Solarman Wi-Fi data logger.
    Solarman {
        /// The IP address or hostname of the data logger.
        host: String,

        /// Serial number printed on the data logger (digits only).
        #[arg(short, long, value_parser = parse_serial)]
        serial: String,

        /// Device model, see the `models` command.
        #[arg(short, long)]
        model: String,

        /// TCP port of the data logger.
        #[arg(short, long, default_value_t = 8899)]
        port: u16,

        /// Modbus unit id of the inverter behind the logger.
        #[arg(short, long, default_value = "1", value_parser = parse_unit_id)]
        unit_id: u8,

        /// Commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect using the settings of a YAML device configuration file.
    Config {
        /// Path of the configuration file.
        file: PathBuf,

        /// Commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// List the supported device models and their actions.
    Models,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: continuously read all registers and print
    /// the capabilities whose value changed.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between read cycles (e.g., "10s", "1m").
        /// Defaults to the refresh interval of the configuration.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,
    },

    /// Read and display all capabilities once.
    Read,

    /// List the capabilities the device exposes for a role.
    Capabilities {
        /// Device role: "inverter" or "battery".
        #[arg(short, long, default_value = "inverter", value_parser = parse_role)]
        role: DeviceRole,
    },

    /// Execute a named write action.
    /// Arguments are given as key=value pairs, e.g.
    /// `action set_work_mode_and_export_power mode=zero_export_to_ct power=3000`
    #[clap(verbatim_doc_comment)]
    Action {
        /// Name of the action, see the `models` command.
        name: String,

        /// Action arguments as key=value.
        #[arg(value_parser = parse_action_arg)]
        args: Vec<(String, Value)>,

        /// Do not ask for confirmation before writing.
        #[arg(short, long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "Solarlink CLI - Read and control hybrid solar inverters via Modbus TCP or Solarman data loggers."
}

#[derive(Parser, Debug)]
#[command(name="solarlink", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and device-specific commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// I/O timeout for every network operation.
    /// Overrides the timeout of a configuration file.
    /// Examples: "5s", "1500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,
}
