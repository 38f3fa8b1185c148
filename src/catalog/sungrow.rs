//! Sungrow SH-RT style three-phase hybrid inverters on direct Modbus/TCP.
//!
//! Measurements are input registers, settings are holding registers. Unlike
//! the rest of the protocol, 32-bit values are transmitted low word first.
//! Addresses are protocol addresses, i.e. one below the documented numbers.

use super::{
    number, ActionDefinition, ActionStep, ArgSource, CapabilityValues, DeviceModel,
    StateCalculation, WRITE_PAUSE,
};
use crate::codec::Value;
use crate::register::{
    AccessMode, DataType, ParseConfiguration as Pc, Register, Transform, BATTERY,
    INVERTER_AND_BATTERY,
};

const RW: AccessMode = AccessMode::ReadWrite;

const EMS_MODES: &[(i64, &str)] = &[
    (0, "self_consumption"),
    (2, "forced"),
    (3, "external_ems"),
];

const FORCED_COMMANDS: &[(i64, &str)] = &[(0xAA, "charge"), (0xBB, "discharge"), (0xCC, "stop")];

const ENABLED: &[(i64, &str)] = &[(0xAA, "enabled"), (0x55, "disabled")];

static INPUT: &[Register] = &[
    Register::string(4989, 10, &[Pc::new("serial_number")]),
    Register::new(
        5002,
        DataType::U16,
        &[Pc::new("meter_power.produced_today").unit("kWh").scale(0.1)],
    ),
    Register::new(
        5003,
        DataType::U32,
        &[Pc::new("meter_power.produced")
            .unit("kWh")
            .transform(Transform::SwappedWords { scale: 1.0 })],
    ),
    Register::new(
        5007,
        DataType::I16,
        &[Pc::new("measure_temperature.inverter").unit("°C").scale(0.1)],
    ),
    Register::new(5010, DataType::U16, &[Pc::new("measure_voltage.pv1").unit("V").scale(0.1)]),
    Register::new(5011, DataType::U16, &[Pc::new("measure_current.pv1").unit("A").scale(0.1)]),
    Register::new(5012, DataType::U16, &[Pc::new("measure_voltage.pv2").unit("V").scale(0.1)]),
    Register::new(5013, DataType::U16, &[Pc::new("measure_current.pv2").unit("A").scale(0.1)]),
    Register::new(
        5016,
        DataType::U32,
        &[Pc::new("measure_power.pv")
            .unit("W")
            .transform(Transform::SwappedWords { scale: 1.0 })],
    ),
    Register::new(
        13000,
        DataType::U16,
        &[
            Pc::new("state.pv_generating").transform(Transform::Bit(0)),
            Pc::new("state.battery_charging").transform(Transform::Bit(1)),
            Pc::new("state.battery_discharging").transform(Transform::Bit(2)),
            Pc::new("state.exporting").transform(Transform::Bit(4)),
            Pc::new("state.importing").transform(Transform::Bit(5)),
        ],
    )
    .roles(INVERTER_AND_BATTERY),
    Register::new(
        13007,
        DataType::I32,
        &[Pc::new("measure_power.load")
            .unit("W")
            .transform(Transform::SwappedWords { scale: 1.0 })],
    ),
    Register::new(
        13009,
        DataType::I32,
        &[Pc::new("measure_power.export")
            .unit("W")
            .transform(Transform::SwappedWords { scale: 1.0 })],
    ),
    Register::new(
        13019,
        DataType::U16,
        &[Pc::new("measure_voltage.battery").unit("V").scale(0.1)],
    )
    .roles(BATTERY),
    Register::new(
        13020,
        DataType::U16,
        &[Pc::new("measure_current.battery").unit("A").scale(0.1)],
    )
    .roles(BATTERY),
    Register::new(13021, DataType::U16, &[Pc::new("measure_power.battery").unit("W")])
        .roles(BATTERY),
    Register::new(
        13022,
        DataType::U16,
        &[Pc::new("measure_battery").unit("%").scale(0.1).valid(0.0, 100.0)],
    )
    .roles(INVERTER_AND_BATTERY),
    Register::new(
        13023,
        DataType::U16,
        &[Pc::new("battery_health").unit("%").scale(0.1).valid(0.0, 100.0)],
    )
    .roles(BATTERY),
    Register::new(
        13024,
        DataType::I16,
        &[Pc::new("measure_temperature.battery").unit("°C").scale(0.1)],
    )
    .roles(BATTERY),
];

static HOLDING: &[Register] = &[
    Register::new(
        13049,
        DataType::U16,
        &[Pc::new("ems_mode").transform(Transform::Lookup(EMS_MODES))],
    )
    .access(RW)
    .roles(INVERTER_AND_BATTERY),
    Register::new(
        13050,
        DataType::U16,
        &[Pc::new("forced_command").transform(Transform::Lookup(FORCED_COMMANDS))],
    )
    .access(RW)
    .roles(BATTERY),
    Register::new(
        13051,
        DataType::U16,
        &[Pc::new("forced_power").unit("W").valid(0.0, 10000.0)],
    )
    .access(RW)
    .roles(BATTERY),
    Register::new(
        13057,
        DataType::U16,
        &[Pc::new("max_soc").unit("%").scale(0.1).valid(0.0, 100.0)],
    )
    .access(RW)
    .roles(BATTERY),
    Register::new(
        13058,
        DataType::U16,
        &[Pc::new("min_soc").unit("%").scale(0.1).valid(0.0, 100.0)],
    )
    .access(RW)
    .roles(BATTERY),
    Register::new(
        13073,
        DataType::U16,
        &[Pc::new("export_limit").unit("W").valid(0.0, 10000.0)],
    )
    .access(RW),
    Register::new(
        13086,
        DataType::U16,
        &[Pc::new("export_limit_mode").transform(Transform::Lookup(ENABLED))],
    )
    .access(RW),
];

const fn write(address: u16, value: ArgSource) -> ActionStep {
    ActionStep::Write { address, value }
}

const FORCED: ArgSource = ArgSource::Const(2);

static ACTIONS: &[ActionDefinition] = &[
    ActionDefinition {
        name: "set_ems_mode",
        description: "Select the energy management mode",
        params: &["mode"],
        steps: &[write(13049, ArgSource::Param("mode"))],
        max_queued: 2,
    },
    ActionDefinition {
        name: "force_charge",
        description: "Charge the battery with a fixed power",
        params: &["power"],
        steps: &[
            write(13049, FORCED),
            WRITE_PAUSE,
            write(13050, ArgSource::Const(0xAA)),
            WRITE_PAUSE,
            write(13051, ArgSource::Param("power")),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "force_discharge",
        description: "Discharge the battery with a fixed power",
        params: &["power"],
        steps: &[
            write(13049, FORCED),
            WRITE_PAUSE,
            write(13050, ArgSource::Const(0xBB)),
            WRITE_PAUSE,
            write(13051, ArgSource::Param("power")),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "stop_forced_mode",
        description: "Stop forced charging or discharging and return to self consumption",
        params: &[],
        steps: &[
            write(13050, ArgSource::Const(0xCC)),
            WRITE_PAUSE,
            write(13049, ArgSource::Const(0)),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "set_soc_limits",
        description: "Set the upper and lower battery SOC limits",
        params: &["max", "min"],
        steps: &[
            write(13057, ArgSource::Param("max")),
            WRITE_PAUSE,
            write(13058, ArgSource::Param("min")),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "set_export_limit",
        description: "Enable export limitation with the given power",
        params: &["power"],
        steps: &[
            write(13086, ArgSource::Const(0xAA)),
            WRITE_PAUSE,
            write(13073, ArgSource::Param("power")),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "disable_export_limit",
        description: "Disable export limitation",
        params: &[],
        steps: &[write(13086, ArgSource::Const(0x55))],
        max_queued: 1,
    },
];

fn flag(values: &CapabilityValues, capability: &str) -> Option<bool> {
    match values.get(capability)? {
        Value::Bool(b) => Some(*b),
        other => other.as_f64().map(|v| v != 0.0),
    }
}

// Battery power is unsigned; the direction comes from the state bits.
fn battery_charge_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.battery")?;
    let charging = flag(values, "state.battery_charging")?;
    Some(Value::Float(if charging { power } else { 0.0 }))
}

fn battery_discharge_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.battery")?;
    let discharging = flag(values, "state.battery_discharging")?;
    Some(Value::Float(if discharging { power } else { 0.0 }))
}

/// Net grid power, positive when importing.
fn grid_power(values: &CapabilityValues) -> Option<Value> {
    let export = number(values, "measure_power.export")?;
    Some(Value::Float(-export))
}

static STATE_CALCULATIONS: &[StateCalculation] = &[
    StateCalculation {
        capability: "measure_power.battery_charge",
        unit: Some("W"),
        dependencies: &["measure_power.battery", "state.battery_charging"],
        compute: battery_charge_power,
    },
    StateCalculation {
        capability: "measure_power.battery_discharge",
        unit: Some("W"),
        dependencies: &["measure_power.battery", "state.battery_discharging"],
        compute: battery_discharge_power,
    },
    StateCalculation {
        capability: "measure_power.grid",
        unit: Some("W"),
        dependencies: &["measure_power.export"],
        compute: grid_power,
    },
];

pub static SH_RT_HYBRID: DeviceModel = DeviceModel {
    id: "sungrow-sh-rt",
    name: "Sungrow SH-RT hybrid inverter",
    input_registers: INPUT,
    holding_registers: HOLDING,
    actions: ACTIONS,
    state_calculations: STATE_CALCULATIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_capability;

    #[test]
    fn tables_are_sorted() {
        assert!(INPUT.windows(2).all(|w| w[0].address < w[1].address));
        assert!(HOLDING.windows(2).all(|w| w[0].address < w[1].address));
    }

    #[test]
    fn export_power_is_low_word_first() {
        let register = &INPUT[11];
        assert_eq!(register.address, 13009);
        // -1500 W as I32 is 0xFFFF_FA24, transmitted as FA24 FFFF
        assert_eq!(
            decode_capability(register, &register.parse[0], &[0xFA, 0x24, 0xFF, 0xFF]).unwrap(),
            Value::Float(-1500.0)
        );
    }

    #[test]
    fn battery_direction_from_state_bits() {
        let mut values = CapabilityValues::new();
        values.insert("measure_power.battery".into(), Value::Integer(2400));
        values.insert("state.battery_charging".into(), Value::Bool(false));
        values.insert("state.battery_discharging".into(), Value::Bool(true));
        values.insert("measure_power.export".into(), Value::Float(-1500.0));
        assert_eq!(battery_charge_power(&values), Some(Value::Float(0.0)));
        assert_eq!(battery_discharge_power(&values), Some(Value::Float(2400.0)));
        assert_eq!(grid_power(&values), Some(Value::Float(1500.0)));
    }
}
