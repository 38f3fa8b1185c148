//! Host-facing view of a device across read cycles.
//!
//! A [`Monitor`] keeps the latest value of every capability, reports which
//! ones changed, derives state calculations, tracks availability and turns
//! invalid values into one-shot alerts.

use crate::{
    catalog::{CapabilityValues, DeviceModel},
    codec::Value,
    device::ReadCycle,
    Error,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    /// No successful read cycle within the grace period.
    Offline,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Online => write!(f, "online"),
            Availability::Offline => write!(f, "offline"),
        }
    }
}

/// Raised the first time a capability decodes to an invalid value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub capability: &'static str,
    pub message: String,
}

/// What a read cycle changed.
#[derive(Debug, Default)]
pub struct Update {
    /// Changed capability ids, register values first, then derived ones.
    pub changed: Vec<String>,
    pub alerts: Vec<Alert>,
    /// Set when the availability flipped.
    pub availability: Option<Availability>,
}

#[derive(Debug)]
pub struct Monitor {
    model: &'static DeviceModel,
    values: CapabilityValues,
    grace_period: Duration,
    last_success: Instant,
    availability: Availability,
    alerted: HashSet<&'static str>,
}

impl Monitor {
    /// A monitor that goes offline `grace_period` after the last successful cycle.
    pub fn new(model: &'static DeviceModel, grace_period: Duration) -> Self {
        Self {
            model,
            values: CapabilityValues::new(),
            grace_period,
            last_success: Instant::now(),
            availability: Availability::Online,
            alerted: HashSet::new(),
        }
    }

    pub fn values(&self) -> &CapabilityValues {
        &self.values
    }

    pub fn value(&self, capability: &str) -> Option<&Value> {
        self.values.get(capability)
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    fn store(&mut self, capability: &str, value: Value, changed: &mut Vec<String>) {
        if self.values.get(capability) != Some(&value) {
            self.values.insert(capability.to_string(), value);
            changed.push(capability.to_string());
        }
    }

    fn set_availability(&mut self, availability: Availability) -> Option<Availability> {
        if self.availability == availability {
            return None;
        }
        log::info!("{} is now {availability}", self.model.name);
        self.availability = availability;
        Some(availability)
    }

    /// Applies the results of a completed read cycle.
    ///
    /// A cycle in which no batch returned data counts as a failed cycle for
    /// availability.
    pub fn apply(&mut self, cycle: &ReadCycle) -> Update {
        let mut update = Update::default();

        for reading in &cycle.readings {
            let capability = reading.config.capability;
            if self.alerted.remove(capability) {
                log::info!("{capability} is valid again");
            }
            self.store(capability, reading.value.clone(), &mut update.changed);
        }

        for failure in &cycle.failures {
            if let (Some(capability), Error::InvalidValue(message)) =
                (failure.capability, &failure.error)
            {
                if self.alerted.insert(capability) {
                    update.alerts.push(Alert {
                        capability,
                        message: message.clone(),
                    });
                }
            }
        }

        let derived = self
            .model
            .evaluate_state_calculations(&self.values, &update.changed);
        for (calculation, value) in derived {
            self.store(calculation.capability, value, &mut update.changed);
        }

        update.availability = if cycle.reached_device() {
            self.last_success = Instant::now();
            self.set_availability(Availability::Online)
        } else {
            self.check_grace_period()
        };
        update
    }

    fn check_grace_period(&mut self) -> Option<Availability> {
        if self.last_success.elapsed() >= self.grace_period {
            self.set_availability(Availability::Offline)
        } else {
            None
        }
    }

    /// Records a read cycle that failed as a whole.
    ///
    /// Returns the new availability once the grace period has run out.
    pub fn record_failure(&mut self, error: &Error) -> Option<Availability> {
        log::warn!("Read cycle of {} failed: {error}", self.model.name);
        self.check_grace_period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::deye;
    use crate::device::{ReadFailure, Reading};
    use crate::register::RegisterClass;

    fn reading(address: u16, value: Value) -> Reading {
        let register = deye::SUN_SG_HYBRID
            .find_register(RegisterClass::Holding, address)
            .unwrap();
        Reading {
            class: RegisterClass::Holding,
            register,
            config: &register.parse[0],
            value,
            raw: vec![],
        }
    }

    fn invalid(address: u16) -> ReadFailure {
        let register = deye::SUN_SG_HYBRID
            .find_register(RegisterClass::Holding, address)
            .unwrap();
        ReadFailure {
            class: RegisterClass::Holding,
            address,
            capability: Some(register.parse[0].capability),
            error: Error::InvalidValue("out of range".into()),
        }
    }

    #[tokio::test]
    async fn reports_changes_and_derived_values() {
        let mut monitor = Monitor::new(&deye::SUN_SG_HYBRID, Duration::from_secs(60));
        let cycle = ReadCycle {
            readings: vec![
                reading(672, Value::Integer(1000)),
                reading(673, Value::Integer(400)),
            ],
            failures: vec![],
        };
        let update = monitor.apply(&cycle);
        assert_eq!(
            update.changed,
            vec!["measure_power.pv1", "measure_power.pv2", "measure_power.pv"]
        );
        assert_eq!(monitor.value("measure_power.pv"), Some(&Value::Float(1400.0)));
        assert_eq!(update.availability, None);

        // same values again: nothing changed, nothing derived
        let update = monitor.apply(&cycle);
        assert!(update.changed.is_empty());

        let cycle = ReadCycle {
            readings: vec![
                reading(672, Value::Integer(1000)),
                reading(673, Value::Integer(600)),
            ],
            failures: vec![],
        };
        let update = monitor.apply(&cycle);
        assert_eq!(update.changed, vec!["measure_power.pv2", "measure_power.pv"]);
        assert_eq!(monitor.value("measure_power.pv"), Some(&Value::Float(1600.0)));
    }

    #[tokio::test]
    async fn invalid_value_alerts_once_until_resolved() {
        let mut monitor = Monitor::new(&deye::SUN_SG_HYBRID, Duration::from_secs(60));
        let broken = ReadCycle {
            readings: vec![],
            failures: vec![invalid(586)],
        };
        let update = monitor.apply(&broken);
        assert_eq!(update.alerts.len(), 1);
        assert_eq!(update.alerts[0].capability, "measure_temperature.battery");
        assert!(monitor.apply(&broken).alerts.is_empty());

        let fixed = ReadCycle {
            readings: vec![reading(586, Value::Float(25.0))],
            failures: vec![],
        };
        assert!(monitor.apply(&fixed).alerts.is_empty());
        assert_eq!(monitor.apply(&broken).alerts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn goes_offline_after_grace_period() {
        let mut monitor = Monitor::new(&deye::SUN_SG_HYBRID, Duration::from_secs(60));
        let error = Error::TransactionTimedOut;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.record_failure(&error), None);
        assert_eq!(monitor.availability(), Availability::Online);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(monitor.record_failure(&error), Some(Availability::Offline));
        assert_eq!(monitor.record_failure(&error), None);
        assert_eq!(monitor.availability(), Availability::Offline);

        let update = monitor.apply(&ReadCycle::default());
        assert_eq!(update.availability, Some(Availability::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_without_data_does_not_keep_device_online() {
        let mut monitor = Monitor::new(&deye::SUN_SG_HYBRID, Duration::from_secs(60));
        let dead = ReadCycle {
            readings: vec![],
            failures: vec![ReadFailure {
                class: RegisterClass::Holding,
                address: 3,
                capability: None,
                error: Error::TransactionTimedOut,
            }],
        };
        assert!(!dead.reached_device());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.apply(&dead).availability, None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(monitor.apply(&dead).availability, Some(Availability::Offline));
        assert_eq!(monitor.availability(), Availability::Offline);

        // invalid values still prove the device answered
        let answered = ReadCycle {
            readings: vec![],
            failures: vec![invalid(586)],
        };
        assert!(answered.reached_device());
        assert_eq!(
            monitor.apply(&answered).availability,
            Some(Availability::Online)
        );
    }
}
