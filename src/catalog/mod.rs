//! Device models as data.
//!
//! A [`DeviceModel`] bundles the register tables of one hardware family with
//! its write actions and state calculations. Models are `static` values; the
//! per-model behaviour is expressed by the data attached to the record rather
//! than by code per model.

use crate::{
    codec::Value,
    register::{Register, RegisterClass},
    Error, Result,
};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod deye;
pub mod sungrow;

/// Decoded capability values by capability id.
pub type CapabilityValues = BTreeMap<String, Value>;

/// Where a write step takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSource {
    /// A named argument supplied by the caller.
    Param(&'static str),
    /// A fixed raw value.
    Const(i64),
}

/// One step of a write action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStep {
    /// Encodes the value through the register's first parse configuration and writes it.
    Write { address: u16, value: ArgSource },
    /// Reads the register, replaces a bit field and writes it back.
    WriteBits {
        address: u16,
        start_bit: u8,
        width: u8,
        value: ArgSource,
    },
    /// Gives the device time to process the previous write.
    Pause(Duration),
}

/// Processing pause the inverters need between consecutive writes.
pub const WRITE_PAUSE: ActionStep = ActionStep::Pause(Duration::from_millis(500));

/// A named write command the host can execute.
#[derive(Debug, Clone, Copy)]
pub struct ActionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [&'static str],
    pub steps: &'static [ActionStep],
    /// How many instances of this action may be queued or running at once.
    pub max_queued: usize,
}

/// A synthetic capability computed from already decoded capabilities.
#[derive(Debug, Clone, Copy)]
pub struct StateCalculation {
    pub capability: &'static str,
    pub unit: Option<&'static str>,
    pub dependencies: &'static [&'static str],
    pub compute: fn(&CapabilityValues) -> Option<Value>,
}

impl StateCalculation {
    /// `true` if any of `changed` is a dependency of this calculation.
    pub fn depends_on_any<S: AsRef<str>>(&self, changed: &[S]) -> bool {
        changed
            .iter()
            .any(|c| self.dependencies.contains(&c.as_ref()))
    }
}

/// Numeric value of a capability, if present.
pub fn number(values: &CapabilityValues, capability: &str) -> Option<f64> {
    values.get(capability).and_then(Value::as_f64)
}

#[derive(Debug)]
pub struct DeviceModel {
    pub id: &'static str,
    pub name: &'static str,
    pub input_registers: &'static [Register],
    pub holding_registers: &'static [Register],
    pub actions: &'static [ActionDefinition],
    pub state_calculations: &'static [StateCalculation],
}

impl DeviceModel {
    pub fn registers(&self, class: RegisterClass) -> &'static [Register] {
        match class {
            RegisterClass::Input => self.input_registers,
            RegisterClass::Holding => self.holding_registers,
        }
    }

    /// Readable registers of `class` sorted by address, ready for batching.
    pub fn readable(&self, class: RegisterClass) -> Vec<&'static Register> {
        let mut registers: Vec<_> = self
            .registers(class)
            .iter()
            .filter(|r| r.access.is_readable())
            .collect();
        registers.sort_by_key(|r| r.address);
        registers
    }

    pub fn find_register(&self, class: RegisterClass, address: u16) -> Result<&'static Register> {
        self.registers(class)
            .iter()
            .find(|r| r.address == address)
            .ok_or(Error::RegisterNotFound { address })
    }

    pub fn find_action(&self, name: &str) -> Result<&ActionDefinition> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::ActionNotFound(name.to_string()))
    }

    /// Runs the state calculations depending on any of `changed` against `values`.
    pub fn evaluate_state_calculations<S: AsRef<str>>(
        &self,
        values: &CapabilityValues,
        changed: &[S],
    ) -> Vec<(&'static StateCalculation, Value)> {
        self.state_calculations
            .iter()
            .filter(|c| c.depends_on_any(changed))
            .filter_map(|c| (c.compute)(values).map(|value| (c, value)))
            .collect()
    }
}

static MODELS: &[&DeviceModel] = &[&deye::SUN_SG_HYBRID, &sungrow::SH_RT_HYBRID];

/// All known device models.
pub fn models() -> &'static [&'static DeviceModel] {
    MODELS
}

pub fn find_model(id: &str) -> Result<&'static DeviceModel> {
    MODELS
        .iter()
        .copied()
        .find(|m| m.id.eq_ignore_ascii_case(id))
        .ok_or_else(|| Error::Config(format!("unknown device model '{id}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Conversion;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    #[test]
    fn lookup_models() {
        assert_eq!(find_model("deye-sun-sg").unwrap().id, "deye-sun-sg");
        assert_eq!(find_model("SUNGROW-SH-RT").unwrap().id, "sungrow-sh-rt");
        assert_matches!(find_model("unknown"), Err(Error::Config(..)));
    }

    #[test]
    fn register_tables_are_consistent() {
        for model in models() {
            for class in [RegisterClass::Input, RegisterClass::Holding] {
                let mut seen = HashSet::new();
                for register in model.registers(class) {
                    assert!(register.length >= 1, "{} {}", model.id, register.address);
                    if let Some(words) = register.data_type.word_count() {
                        assert_eq!(register.length, words, "{} {}", model.id, register.address);
                    }
                    assert!(!register.parse.is_empty(), "{} {}", model.id, register.address);
                    assert!(!register.roles.is_empty());
                    // aliases must feed different capabilities
                    for config in register.parse {
                        assert!(
                            seen.insert((register.address, config.capability)),
                            "{} duplicates {} at {}",
                            model.id,
                            config.capability,
                            register.address
                        );
                        if let Conversion::Scale(scale) = config.conversion {
                            assert!(scale > 0.0);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn action_steps_reference_writable_registers() {
        for model in models() {
            let mut names = HashSet::new();
            for action in model.actions {
                assert!(names.insert(action.name), "{} twice", action.name);
                assert!(action.max_queued >= 1);
                for step in action.steps {
                    let (address, value) = match step {
                        ActionStep::Write { address, value }
                        | ActionStep::WriteBits { address, value, .. } => (*address, *value),
                        ActionStep::Pause(_) => continue,
                    };
                    let register = model
                        .find_register(RegisterClass::Holding, address)
                        .unwrap_or_else(|_| panic!("{}: no register {address}", action.name));
                    assert!(register.access.is_writable(), "{} {address}", action.name);
                    if let ArgSource::Param(param) = value {
                        assert!(action.params.contains(&param), "{} {param}", action.name);
                    }
                }
            }
        }
    }

    #[test]
    fn state_calculation_dependencies_exist() {
        for model in models() {
            let capabilities: HashSet<_> = model
                .input_registers
                .iter()
                .chain(model.holding_registers)
                .flat_map(|r| r.parse.iter().map(|p| p.capability))
                .collect();
            for calculation in model.state_calculations {
                for dependency in calculation.dependencies {
                    assert!(
                        capabilities.contains(dependency),
                        "{}: {} depends on unknown {dependency}",
                        model.id,
                        calculation.capability
                    );
                }
            }
        }
    }

    #[test]
    fn depends_on_any() {
        let calculation = &deye::SUN_SG_HYBRID.state_calculations[0];
        assert!(calculation.depends_on_any(&["measure_power.pv1"]));
        assert!(!calculation.depends_on_any(&["measure_power.load"]));
    }
}
