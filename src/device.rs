//! The device facade: one device model bound to one transport.
//!
//! [`Device`] composes the catalog, the codec, the batching planner and the
//! command queue into the three operations a host needs: listing
//! capabilities, reading a snapshot of every register and executing named
//! write actions.

use crate::{
    batching::{self, Batch, BatchConfig},
    bits,
    catalog::{
        self, ActionDefinition, ActionStep, ArgSource, CapabilityValues, DeviceModel,
        StateCalculation,
    },
    codec::{self, Value},
    config::DeviceConfig,
    queue::CommandQueue,
    register::{DeviceRole, ParseConfiguration, Register, RegisterClass},
    transport::{bytes_to_words, DeviceTransport, ReadSpan, Transport},
    Error, Result,
};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Arguments of a write action by parameter name.
pub type ActionArgs = BTreeMap<String, Value>;

/// Queue name of a full read cycle; only one may be queued at a time.
pub const READ_ALL_REGISTERS: &str = "read_all_registers";

/// One successfully decoded capability value.
#[derive(Debug, Clone)]
pub struct Reading {
    pub class: RegisterClass,
    pub register: &'static Register,
    pub config: &'static ParseConfiguration,
    pub value: Value,
    /// The bytes the value was decoded from.
    pub raw: Vec<u8>,
}

/// A batch or a single capability that could not be read.
#[derive(Debug)]
pub struct ReadFailure {
    pub class: RegisterClass,
    pub address: u16,
    /// `None` if the whole batch starting at `address` failed.
    pub capability: Option<&'static str>,
    pub error: Error,
}

/// Result of one read cycle. Failures are collected instead of aborting the cycle.
#[derive(Debug, Default)]
pub struct ReadCycle {
    pub readings: Vec<Reading>,
    pub failures: Vec<ReadFailure>,
}

impl ReadCycle {
    /// `false` if no batch of a non-empty cycle returned any data.
    pub fn reached_device(&self) -> bool {
        !self.readings.is_empty()
            || self.failures.is_empty()
            || self.failures.iter().any(|f| f.capability.is_some())
    }

    /// Decoded values by capability id.
    pub fn values(&self) -> CapabilityValues {
        self.readings
            .iter()
            .map(|r| (r.config.capability.to_string(), r.value.clone()))
            .collect()
    }
}

/// A write step with its bytes already encoded.
#[derive(Debug)]
enum PreparedStep {
    Write {
        address: u16,
        words: Vec<u16>,
    },
    WriteBits {
        register: &'static Register,
        start_bit: usize,
        width: usize,
        value: u64,
    },
    Pause(Duration),
}

#[derive(Debug)]
pub struct Device<T = DeviceTransport> {
    model: &'static DeviceModel,
    transport: T,
    queue: CommandQueue,
    batching: BatchConfig,
}

impl Device<DeviceTransport> {
    /// Builds the device described by `config`.
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            catalog::find_model(&config.model)?,
            config.build_transport()?,
            CommandQueue::new(config.queue.poll_interval),
            config.batching,
        ))
    }
}

impl<T: Transport> Device<T> {
    pub fn new(
        model: &'static DeviceModel,
        transport: T,
        queue: CommandQueue,
        batching: BatchConfig,
    ) -> Self {
        Self {
            model,
            transport,
            queue,
            batching,
        }
    }

    pub fn model(&self) -> &'static DeviceModel {
        self.model
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Capability ids exposed for `role`, in register order and without
    /// duplicates, followed by the state calculations whose inputs are available.
    pub fn capabilities(&self, role: DeviceRole) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        let mut capabilities: Vec<&'static str> = self
            .model
            .input_registers
            .iter()
            .chain(self.model.holding_registers)
            .filter(|r| r.has_role(role))
            .flat_map(|r| r.parse.iter().map(|p| p.capability))
            .filter(|c| seen.insert(*c))
            .collect();
        for calculation in self.model.state_calculations {
            if calculation.dependencies.iter().all(|d| seen.contains(d))
                && seen.insert(calculation.capability)
            {
                capabilities.push(calculation.capability);
            }
        }
        capabilities
    }

    fn plan(&self) -> Vec<(RegisterClass, Batch<'static>)> {
        [RegisterClass::Input, RegisterClass::Holding]
            .into_iter()
            .flat_map(|class| {
                batching::plan(self.model.readable(class), &self.batching)
                    .into_iter()
                    .map(move |batch| (class, batch))
            })
            .collect()
    }

    /// Reads every readable register, input registers first.
    ///
    /// Failed batches and values that do not decode are logged and reported
    /// in [`ReadCycle::failures`] as long as at least one batch returned data.
    ///
    /// # Errors
    ///
    /// If every batch failed, the transport error of the first failed batch,
    /// preferring a recoverable one so that the caller can retry the cycle.
    pub async fn read_all_registers(&self) -> Result<ReadCycle> {
        let _permit = self.queue.admit(READ_ALL_REGISTERS, 1).await?;
        let batches = self.plan();
        let mut cycle = ReadCycle::default();
        if batches.is_empty() {
            return Ok(cycle);
        }
        let spans: Vec<ReadSpan> = batches
            .iter()
            .map(|(class, batch)| ReadSpan {
                class: *class,
                address: batch.start(),
                count: batch.word_count(),
            })
            .collect();
        let results = self.transport.read_spans(&spans).await?;
        if results.iter().all(|result| result.is_err()) {
            let mut errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
            if errors.is_empty() {
                return Ok(cycle);
            }
            let index = errors.iter().position(Error::is_recoverable).unwrap_or(0);
            let error = errors.swap_remove(index);
            log::warn!("No batch of {} could be read: {error}", self.model.id);
            return Err(error);
        }

        for ((class, batch), result) in batches.iter().zip(results) {
            let buffer = match result {
                Ok(buffer) => buffer,
                Err(error) => {
                    cycle.failures.push(ReadFailure {
                        class: *class,
                        address: batch.start(),
                        capability: None,
                        error,
                    });
                    continue;
                }
            };
            for (register, slice) in batch.split(&buffer) {
                for config in register.parse {
                    match codec::decode_capability(register, config, slice) {
                        Ok(value) => cycle.readings.push(Reading {
                            class: *class,
                            register,
                            config,
                            value,
                            raw: slice[..slice.len().min(register.byte_len())].to_vec(),
                        }),
                        Err(error) => {
                            log::warn!(
                                "Discarding {} at {class} register {}: {error}",
                                config.capability,
                                register.address
                            );
                            cycle.failures.push(ReadFailure {
                                class: *class,
                                address: register.address,
                                capability: Some(config.capability),
                                error,
                            });
                        }
                    }
                }
            }
        }
        log::debug!(
            "Read cycle finished with {} value(s) and {} failure(s)",
            cycle.readings.len(),
            cycle.failures.len()
        );
        Ok(cycle)
    }

    fn writable_register(&self, address: u16) -> Result<&'static Register> {
        let register = self.model.find_register(RegisterClass::Holding, address)?;
        if !register.access.is_writable() {
            log::error!("Holding register {address} of {} is not writable", self.model.id);
            return Err(Error::RegisterNotFound { address });
        }
        Ok(register)
    }

    fn argument(action: &ActionDefinition, args: &ActionArgs, source: ArgSource) -> Result<Value> {
        match source {
            ArgSource::Const(raw) => Ok(Value::Integer(raw)),
            ArgSource::Param(name) => args.get(name).cloned().ok_or_else(|| {
                Error::InvalidArgument(format!("{} requires '{name}'", action.name))
            }),
        }
    }

    /// Encodes every step of `action` so that nothing reaches the wire if any
    /// argument is missing or invalid.
    fn prepare(&self, action: &ActionDefinition, args: &ActionArgs) -> Result<Vec<PreparedStep>> {
        if let Some(unknown) = args.keys().find(|k| !action.params.contains(&k.as_str())) {
            return Err(Error::InvalidArgument(format!(
                "{} has no parameter '{unknown}'",
                action.name
            )));
        }
        action
            .steps
            .iter()
            .map(|step| match *step {
                ActionStep::Write { address, value } => {
                    let register = self.writable_register(address)?;
                    let argument = Self::argument(action, args, value)?;
                    let bytes = match (value, register.parse.first()) {
                        (ArgSource::Param(_), Some(config)) => {
                            codec::encode_capability(register, config, &argument)?
                        }
                        _ => codec::encode(&argument, register.data_type, register.length)?,
                    };
                    Ok(PreparedStep::Write {
                        address,
                        words: bytes_to_words(&bytes),
                    })
                }
                ActionStep::WriteBits {
                    address,
                    start_bit,
                    width,
                    value,
                } => {
                    let register = self.writable_register(address)?;
                    let (start_bit, width) = (start_bit as usize, width as usize);
                    if start_bit + width > register.byte_len() * 8 {
                        return Err(Error::BitIndexOutOfRange {
                            bit_index: start_bit,
                            count: width,
                            buffer_len: register.byte_len(),
                        });
                    }
                    let value = field_value(&Self::argument(action, args, value)?)?;
                    if width < 64 && value >> width != 0 {
                        return Err(Error::InvalidValue(format!(
                            "{value} does not fit into a {width} bit field"
                        )));
                    }
                    Ok(PreparedStep::WriteBits {
                        register,
                        start_bit,
                        width,
                        value,
                    })
                }
                ActionStep::Pause(duration) => Ok(PreparedStep::Pause(duration)),
            })
            .collect()
    }

    /// Executes the action `name` with `args`.
    ///
    /// Steps run in order. A failing step aborts the action; steps that were
    /// already applied are not rolled back.
    pub async fn execute_action(&self, name: &str, args: &ActionArgs) -> Result<()> {
        let action = self.model.find_action(name)?;
        let steps = self.prepare(action, args)?;
        let _permit = self.queue.admit(action.name, action.max_queued).await?;
        log::info!("Executing {} on {} with {args:?}", action.name, self.model.id);

        for step in steps {
            match step {
                PreparedStep::Write { address, words } => {
                    self.transport.write_registers(address, &words).await?;
                }
                PreparedStep::WriteBits {
                    register,
                    start_bit,
                    width,
                    value,
                } => {
                    let current = self
                        .transport
                        .read_span(ReadSpan {
                            class: RegisterClass::Holding,
                            address: register.address,
                            count: register.length,
                        })
                        .await?;
                    let updated = bits::set_field(&current, value, start_bit, width)?;
                    log::debug!(
                        "Register {}: {current:02X?} -> {updated:02X?}",
                        register.address
                    );
                    self.transport
                        .write_registers(register.address, &bytes_to_words(&updated))
                        .await?;
                }
                PreparedStep::Pause(duration) => tokio::time::sleep(duration).await,
            }
        }
        Ok(())
    }

    /// Runs the state calculations depending on any of `changed` against `values`.
    pub fn evaluate_state_calculations<S: AsRef<str>>(
        &self,
        values: &CapabilityValues,
        changed: &[S],
    ) -> Vec<(&'static StateCalculation, Value)> {
        self.model.evaluate_state_calculations(values, changed)
    }
}

/// Interprets an argument as an unsigned bit field value.
fn field_value(value: &Value) -> Result<u64> {
    match value {
        Value::Bool(b) => Ok(u64::from(*b)),
        Value::Integer(i) if *i >= 0 => Ok(*i as u64),
        Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Ok(*f as u64),
        other => Err(Error::InvalidValue(format!(
            "{other:?} is not a valid bit field value"
        ))),
    }
}
