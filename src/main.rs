//! Solarlink CLI
//!
//! A command-line interface (CLI) application for hybrid solar inverters and
//! their batteries, reached via Modbus TCP or through a Solarman data logger.
//!
//! This tool allows users to:
//! - List the supported device models and their write actions.
//! - Read all capabilities of a device once.
//! - List the capabilities a device exposes for the inverter or battery role.
//! - Execute named write actions after an interactive confirmation.
//! - Run in a continuous daemon mode that prints changed values, alerts and
//!   availability changes.
//!
//! The CLI leverages the `solarlink_lib` crate for the register model,
//! transports and device facade.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use solarlink_lib::{
    catalog,
    config::{DeviceConfig, TransportKind},
    device::{ActionArgs, Device, ReadCycle},
    monitor::Monitor,
    register::DeviceRole,
    retry::with_retry,
};
use std::{panic, time::Duration};

mod commandline;

/// Read cycles a device may miss before it is reported offline.
const OFFLINE_AFTER_MISSED_CYCLES: u32 = 3;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

fn print_models() {
    for model in catalog::models() {
        println!("{} ({})", model.id, model.name);
        for action in model.actions {
            println!(
                "  {:<32} [{}] {}",
                action.name,
                action.params.join(", "),
                action.description
            );
        }
    }
}

fn print_cycle(cycle: &ReadCycle) {
    for reading in &cycle.readings {
        println!(
            "{:<40} {} {}",
            reading.config.capability,
            reading.value,
            reading.config.unit.unwrap_or_default()
        );
    }
    for failure in &cycle.failures {
        match failure.capability {
            Some(capability) => println!("{capability:<40} <{}>", failure.error),
            None => println!(
                "{} registers from {:<26} <{}>",
                failure.class, failure.address, failure.error
            ),
        }
    }
}

/// Creates the device configuration from the command-line arguments.
fn create_config(
    connection: &commandline::CliConnection,
    timeout: Option<Duration>,
) -> Result<(DeviceConfig, &commandline::CliCommands)> {
    let (mut config, command) = match connection {
        commandline::CliConnection::Tcp {
            host,
            model,
            port,
            unit_id,
            command,
        } => {
            let mut config = DeviceConfig::new(host, TransportKind::Modbus, model);
            config.port = Some(*port);
            config.unit_id = *unit_id;
            (config, command)
        }
        commandline::CliConnection::Solarman {
            host,
            serial,
            model,
            port,
            unit_id,
            command,
        } => {
            let mut config = DeviceConfig::new(host, TransportKind::Solarman, model);
            config.serial = Some(serial.clone());
            config.port = Some(*port);
            config.unit_id = *unit_id;
            (config, command)
        }
        commandline::CliConnection::Config { file, command } => (
            DeviceConfig::from_yaml_file(file)
                .with_context(|| format!("Cannot load device config {}", file.display()))?,
            command,
        ),
        commandline::CliConnection::Models => {
            unreachable!("Models should be handled earlier.")
        }
    };
    if let Some(timeout) = timeout {
        config.timeout = timeout;
    }
    config.validate().context("Invalid device configuration")?;
    Ok((config, command))
}

fn handle_capabilities(device: &Device, role: DeviceRole) {
    info!("Executing: List {role} capabilities");
    for capability in device.capabilities(role) {
        println!("{capability}");
    }
}

async fn handle_action(
    device: &Device,
    config: &DeviceConfig,
    name: &str,
    args: &[(String, solarlink_lib::codec::Value)],
    yes: bool,
) -> Result<()> {
    let action = device
        .model()
        .find_action(name)
        .with_context(|| format!("Available actions: see `{} models`", env!("CARGO_PKG_NAME")))?;
    let args: ActionArgs = args.iter().cloned().collect();

    println!("{}: {}", action.name, action.description);
    for (key, value) in &args {
        println!("  {key} = {value}");
    }
    if !yes
        && !Confirm::new()
            .with_prompt(format!("Write to {}:{}?", config.host, config.port()))
            .default(false)
            .show_default(true)
            .interact()
            .context("Failed to get user confirmation.")?
    {
        info!("Action {name} aborted by user.");
        return Ok(());
    }

    with_retry(&config.retry, || device.execute_action(name, &args))
        .await
        .with_context(|| format!("Action {name} failed"))?;
    println!("Action {name} executed successfully.");
    Ok(())
}

async fn run_daemon(device: &Device, config: &DeviceConfig, poll_interval: Duration) -> Result<()> {
    if !config.enabled {
        bail!("Device {} is disabled in its configuration", config.host);
    }
    info!("Starting daemon mode: interval={poll_interval:?}");
    let mut monitor = Monitor::new(device.model(), poll_interval * OFFLINE_AFTER_MISSED_CYCLES);
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        debug!("Daemon: Reading all registers...");
        match with_retry(&config.retry, || device.read_all_registers()).await {
            Ok(cycle) => {
                let update = monitor.apply(&cycle);
                for capability in &update.changed {
                    if let Some(value) = monitor.value(capability) {
                        println!("{capability} = {value}");
                    }
                }
                for alert in &update.alerts {
                    println!("ALERT {}: {}", alert.capability, alert.message);
                }
                if let Some(availability) = update.availability {
                    println!("Device is {availability}");
                }
            }
            Err(error) => {
                if let Some(availability) = monitor.record_failure(&error) {
                    println!("Device is {availability}");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "Solarlink CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. The model listing needs no device
    if args.connection == commandline::CliConnection::Models {
        print_models();
        return Ok(());
    }

    // 3. Setup the device
    let (config, command) = create_config(&args.connection, args.timeout)?;
    let device = Device::from_config(&config)
        .with_context(|| format!("Cannot set up device at {}", config.host))?;

    // 4. Execute the command
    match command {
        commandline::CliCommands::Daemon { poll_interval } => {
            run_daemon(
                &device,
                &config,
                poll_interval.unwrap_or(config.refresh_interval),
            )
            .await?;
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read all registers");
            let cycle = with_retry(&config.retry, || device.read_all_registers())
                .await
                .with_context(|| format!("Cannot read from {}:{}", config.host, config.port()))?;
            print_cycle(&cycle);
        }
        commandline::CliCommands::Capabilities { role } => {
            handle_capabilities(&device, *role);
        }
        commandline::CliCommands::Action { name, args, yes } => {
            handle_action(&device, &config, name, args, *yes).await?;
        }
    }

    Ok(())
}
