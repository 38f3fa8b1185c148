//! Deye / Sunsynk style single-phase hybrid inverters, usually reached
//! through a Solarman Wi-Fi logger. Everything lives in holding registers.

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

const WORK_MODES: &[(i64, &str)] = &[
    (0, "selling_first"),
    (1, "zero_export_to_load"),
    (2, "zero_export_to_ct"),
];

const RUNNING_STATES: &[(i64, &str)] = &[
    (0, "standby"),
    (1, "self_check"),
    (2, "normal"),
    (3, "alarm"),
    (4, "fault"),
];

const FLAG: Transform = Transform::Bit(0);

const fn setting(address: u16, parse: &'static [Pc]) -> Register {
    Register::new(address, DataType::U16, parse).access(RW)
}

static HOLDING: &[Register] = &[
    Register::string(3, 5, &[Pc::new("serial_number")]),
    setting(108, &[Pc::new("max_charge_current").unit("A").valid(0.0, 240.0)]).roles(BATTERY),
    setting(109, &[Pc::new("max_discharge_current").unit("A").valid(0.0, 240.0)]).roles(BATTERY),
    setting(142, &[Pc::new("work_mode").transform(Transform::Lookup(WORK_MODES))]),
    setting(143, &[Pc::new("max_sell_power").unit("W").valid(0.0, 20000.0)]),
    setting(
        146,
        &[
            Pc::new("time_of_use.enabled").transform(FLAG),
            Pc::new("time_of_use.days").transform(Transform::BitField { start: 1, width: 7 }),
        ],
    ),
    setting(148, &[Pc::new("timeslot_time.1").valid(0.0, 2359.0)]),
    setting(149, &[Pc::new("timeslot_time.2").valid(0.0, 2359.0)]),
    setting(150, &[Pc::new("timeslot_time.3").valid(0.0, 2359.0)]),
    setting(151, &[Pc::new("timeslot_time.4").valid(0.0, 2359.0)]),
    setting(152, &[Pc::new("timeslot_time.5").valid(0.0, 2359.0)]),
    setting(153, &[Pc::new("timeslot_time.6").valid(0.0, 2359.0)]),
    setting(154, &[Pc::new("timeslot_power.1").unit("W").valid(0.0, 20000.0)]),
    setting(155, &[Pc::new("timeslot_power.2").unit("W").valid(0.0, 20000.0)]),
    setting(156, &[Pc::new("timeslot_power.3").unit("W").valid(0.0, 20000.0)]),
    setting(157, &[Pc::new("timeslot_power.4").unit("W").valid(0.0, 20000.0)]),
    setting(158, &[Pc::new("timeslot_power.5").unit("W").valid(0.0, 20000.0)]),
    setting(159, &[Pc::new("timeslot_power.6").unit("W").valid(0.0, 20000.0)]),
    setting(166, &[Pc::new("timeslot_soc.1").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(167, &[Pc::new("timeslot_soc.2").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(168, &[Pc::new("timeslot_soc.3").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(169, &[Pc::new("timeslot_soc.4").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(170, &[Pc::new("timeslot_soc.5").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(171, &[Pc::new("timeslot_soc.6").unit("%").valid(0.0, 100.0)]).roles(BATTERY),
    setting(172, &[Pc::new("timeslot_grid_charge.1").transform(FLAG)]).roles(BATTERY),
    setting(173, &[Pc::new("timeslot_grid_charge.2").transform(FLAG)]).roles(BATTERY),
    setting(174, &[Pc::new("timeslot_grid_charge.3").transform(FLAG)]).roles(BATTERY),
    setting(175, &[Pc::new("timeslot_grid_charge.4").transform(FLAG)]).roles(BATTERY),
    setting(176, &[Pc::new("timeslot_grid_charge.5").transform(FLAG)]).roles(BATTERY),
    setting(177, &[Pc::new("timeslot_grid_charge.6").transform(FLAG)]).roles(BATTERY),
    Register::new(
        500,
        DataType::U16,
        &[Pc::new("running_state").transform(Transform::Lookup(RUNNING_STATES))],
    ),
    Register::new(
        514,
        DataType::U16,
        &[Pc::new("meter_power.battery_charged_today").unit("kWh").scale(0.1)],
    )
    .roles(BATTERY),
    Register::new(
        515,
        DataType::U16,
        &[Pc::new("meter_power.battery_discharged_today").unit("kWh").scale(0.1)],
    )
    .roles(BATTERY),
    Register::new(
        520,
        DataType::U16,
        &[Pc::new("meter_power.imported_today").unit("kWh").scale(0.1)],
    ),
    Register::new(
        521,
        DataType::U16,
        &[Pc::new("meter_power.exported_today").unit("kWh").scale(0.1)],
    ),
    Register::new(
        522,
        DataType::U32,
        &[Pc::new("meter_power.imported").unit("kWh").scale(0.1)],
    ),
    Register::new(
        524,
        DataType::U32,
        &[Pc::new("meter_power.exported").unit("kWh").scale(0.1)],
    ),
    Register::new(
        526,
        DataType::U16,
        &[Pc::new("meter_power.consumed_today").unit("kWh").scale(0.1)],
    ),
    Register::new(
        529,
        DataType::U16,
        &[Pc::new("meter_power.produced_today").unit("kWh").scale(0.1)],
    ),
    Register::new(
        534,
        DataType::U32,
        &[Pc::new("meter_power.produced").unit("kWh").scale(0.1)],
    ),
    Register::new(
        586,
        DataType::U16,
        &[Pc::new("measure_temperature.battery")
            .unit("°C")
            .transform(Transform::Offset {
                offset: 1000,
                scale: 0.1,
            })
            .valid(-40.0, 100.0)],
    )
    .roles(BATTERY),
    Register::new(
        587,
        DataType::U16,
        &[Pc::new("measure_voltage.battery").unit("V").scale(0.01).valid(0.0, 70.0)],
    )
    .roles(BATTERY),
    // raw percentage and normalised level share one register
    Register::new(
        588,
        DataType::U16,
        &[
            Pc::new("measure_battery").unit("%").valid(0.0, 100.0),
            Pc::new("battery_level").scale(0.01).valid(0.0, 1.0),
        ],
    )
    .roles(INVERTER_AND_BATTERY),
    Register::new(590, DataType::I16, &[Pc::new("measure_power.battery").unit("W")])
        .roles(BATTERY),
    Register::new(
        591,
        DataType::I16,
        &[Pc::new("measure_current.battery").unit("A").scale(0.01)],
    )
    .roles(BATTERY),
    Register::new(
        598,
        DataType::U16,
        &[Pc::new("measure_voltage.grid").unit("V").scale(0.1).valid(0.0, 300.0)],
    ),
    Register::new(625, DataType::I16, &[Pc::new("measure_power.grid").unit("W")]),
    Register::new(653, DataType::U16, &[Pc::new("measure_power.load").unit("W")]),
    Register::new(672, DataType::U16, &[Pc::new("measure_power.pv1").unit("W")]),
    Register::new(673, DataType::U16, &[Pc::new("measure_power.pv2").unit("W")]),
    Register::new(676, DataType::U16, &[Pc::new("measure_voltage.pv1").unit("V").scale(0.1)]),
    Register::new(677, DataType::U16, &[Pc::new("measure_current.pv1").unit("A").scale(0.1)]),
    Register::new(678, DataType::U16, &[Pc::new("measure_voltage.pv2").unit("V").scale(0.1)]),
    Register::new(679, DataType::U16, &[Pc::new("measure_current.pv2").unit("A").scale(0.1)]),
];

const fn write(address: u16, param: &'static str) -> ActionStep {
    ActionStep::Write {
        address,
        value: ArgSource::Param(param),
    }
}

const fn write_flag(address: u16, param: &'static str) -> ActionStep {
    ActionStep::WriteBits {
        address,
        start_bit: 0,
        width: 1,
        value: ArgSource::Param(param),
    }
}

static ACTIONS: &[ActionDefinition] = &[
    ActionDefinition {
        name: "set_work_mode",
        description: "Select how surplus energy is handled",
        params: &["mode"],
        steps: &[write(142, "mode")],
        max_queued: 2,
    },
    ActionDefinition {
        name: "set_work_mode_and_export_power",
        description: "Select the work mode, then the maximum export power",
        params: &["mode", "power"],
        steps: &[write(142, "mode"), WRITE_PAUSE, write(143, "power")],
        max_queued: 1,
    },
    ActionDefinition {
        name: "set_max_charge_current",
        description: "Limit the battery charge current",
        params: &["current"],
        steps: &[write(108, "current")],
        max_queued: 2,
    },
    ActionDefinition {
        name: "set_max_discharge_current",
        description: "Limit the battery discharge current",
        params: &["current"],
        steps: &[write(109, "current")],
        max_queued: 2,
    },
    ActionDefinition {
        name: "set_time_of_use_enabled",
        description: "Switch the time-of-use schedule on or off",
        params: &["enabled"],
        steps: &[write_flag(146, "enabled")],
        max_queued: 2,
    },
    ActionDefinition {
        name: "write_all_timeslots",
        description: "Apply one power limit and one target SOC to all six timeslots",
        params: &["power", "soc"],
        steps: &[
            write(154, "power"),
            WRITE_PAUSE,
            write(155, "power"),
            WRITE_PAUSE,
            write(156, "power"),
            WRITE_PAUSE,
            write(157, "power"),
            WRITE_PAUSE,
            write(158, "power"),
            WRITE_PAUSE,
            write(159, "power"),
            WRITE_PAUSE,
            write(166, "soc"),
            WRITE_PAUSE,
            write(167, "soc"),
            WRITE_PAUSE,
            write(168, "soc"),
            WRITE_PAUSE,
            write(169, "soc"),
            WRITE_PAUSE,
            write(170, "soc"),
            WRITE_PAUSE,
            write(171, "soc"),
        ],
        max_queued: 1,
    },
    ActionDefinition {
        name: "set_grid_charge_all_timeslots",
        description: "Allow or forbid charging from the grid in all six timeslots",
        params: &["enabled"],
        steps: &[
            write_flag(172, "enabled"),
            WRITE_PAUSE,
            write_flag(173, "enabled"),
            WRITE_PAUSE,
            write_flag(174, "enabled"),
            WRITE_PAUSE,
            write_flag(175, "enabled"),
            WRITE_PAUSE,
            write_flag(176, "enabled"),
            WRITE_PAUSE,
            write_flag(177, "enabled"),
        ],
        max_queued: 1,
    },
];

fn total_pv_power(values: &CapabilityValues) -> Option<Value> {
    let pv1 = number(values, "measure_power.pv1")?;
    let pv2 = number(values, "measure_power.pv2")?;
    Some(Value::Float(pv1 + pv2))
}

// Positive battery power means discharging.
fn battery_charge_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.battery")?;
    Some(Value::Float((-power).max(0.0)))
}

fn battery_discharge_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.battery")?;
    Some(Value::Float(power.max(0.0)))
}

// Positive grid power means importing.
fn grid_import_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.grid")?;
    Some(Value::Float(power.max(0.0)))
}

fn grid_export_power(values: &CapabilityValues) -> Option<Value> {
    let power = number(values, "measure_power.grid")?;
    Some(Value::Float((-power).max(0.0)))
}

static STATE_CALCULATIONS: &[StateCalculation] = &[
    StateCalculation {
        capability: "measure_power.pv",
        unit: Some("W"),
        dependencies: &["measure_power.pv1", "measure_power.pv2"],
        compute: total_pv_power,
    },
    StateCalculation {
        capability: "measure_power.battery_charge",
        unit: Some("W"),
        dependencies: &["measure_power.battery"],
        compute: battery_charge_power,
    },
    StateCalculation {
        capability: "measure_power.battery_discharge",
        unit: Some("W"),
        dependencies: &["measure_power.battery"],
        compute: battery_discharge_power,
    },
    StateCalculation {
        capability: "measure_power.grid_import",
        unit: Some("W"),
        dependencies: &["measure_power.grid"],
        compute: grid_import_power,
    },
    StateCalculation {
        capability: "measure_power.grid_export",
        unit: Some("W"),
        dependencies: &["measure_power.grid"],
        compute: grid_export_power,
    },
];

pub static SUN_SG_HYBRID: DeviceModel = DeviceModel {
    id: "deye-sun-sg",
    name: "Deye SUN-SG hybrid inverter",
    input_registers: &[],
    holding_registers: HOLDING,
    actions: ACTIONS,
    state_calculations: STATE_CALCULATIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterClass;

    #[test]
    fn holding_table_is_sorted() {
        assert!(HOLDING.windows(2).all(|w| w[0].address < w[1].address));
        assert_eq!(SUN_SG_HYBRID.readable(RegisterClass::Holding).len(), HOLDING.len());
    }

    #[test]
    fn derived_powers() {
        let mut values = CapabilityValues::new();
        values.insert("measure_power.pv1".into(), Value::Integer(1200));
        values.insert("measure_power.pv2".into(), Value::Integer(800));
        values.insert("measure_power.battery".into(), Value::Integer(-500));
        values.insert("measure_power.grid".into(), Value::Integer(-300));
        assert_eq!(total_pv_power(&values), Some(Value::Float(2000.0)));
        assert_eq!(battery_charge_power(&values), Some(Value::Float(500.0)));
        assert_eq!(battery_discharge_power(&values), Some(Value::Float(0.0)));
        assert_eq!(grid_import_power(&values), Some(Value::Float(0.0)));
        assert_eq!(grid_export_power(&values), Some(Value::Float(300.0)));
    }

    #[test]
    fn missing_dependency_yields_nothing() {
        let mut values = CapabilityValues::new();
        values.insert("measure_power.pv1".into(), Value::Integer(1200));
        assert_eq!(total_pv_power(&values), None);
    }
}
