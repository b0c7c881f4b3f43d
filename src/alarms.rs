//! Alarm taxonomy (§4.9): derives boolean alarm/warning flags from a
//! [`LiveSnapshot`], the configured [`VictronThresholds`], and the current
//! CAN bus/keep-alive health. The Victron 0x35A payload and the Event Bus's
//! AlarmRaised/AlarmCleared channels both consume this.

use crate::config::VictronThresholds;
use crate::live_data::{AlarmEvent, AlarmKind, AlarmSeverity};

/// Two-bit-field-ready flags, one per alarm kind exercised by the 0x35A
/// encoder. `true` maps to the "Alarm" level (2); callers that need the
/// intermediate "Warning" level (1) use [`AlarmState::severity_of`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmState {
    pub under_voltage: bool,
    pub over_voltage: bool,
    pub over_temperature: bool,
    pub low_temp_charge: bool,
    pub cell_imbalance: bool,
    pub comms_error: bool,
    pub low_soc: bool,
    pub derate: bool,
}

impl AlarmState {
    pub fn any_active(&self) -> bool {
        self.under_voltage
            || self.over_voltage
            || self.over_temperature
            || self.low_temp_charge
            || self.cell_imbalance
            || self.comms_error
            || self.low_soc
            || self.derate
    }
}

/// Health facts that don't come from the BMS snapshot itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommsHealth {
    pub keepalive_lost: bool,
    pub recent_uart_error: bool,
    pub recent_can_error: bool,
}

impl CommsHealth {
    fn any_comms_fault(&self) -> bool {
        self.keepalive_lost || self.recent_uart_error || self.recent_can_error
    }
}

pub struct AlarmEvaluation {
    pub state: AlarmState,
    pub cell_imbalance_warning: bool,
}

/// Evaluates the full taxonomy table for one tick. `imbalance_mv` is taken
/// from the snapshot directly rather than re-derived, since
/// [`LiveSnapshot::finalize`] already guarantees it is non-negative.
pub fn evaluate(
    snapshot: &crate::live_data::LiveSnapshot,
    thresholds: &VictronThresholds,
    comms: CommsHealth,
) -> AlarmEvaluation {
    // Cell-level registers read as 0 when the BMS hasn't populated them;
    // fall back to the pack-voltage threshold rather than suppressing the
    // alarm outright.
    let under_voltage = if snapshot.min_cell_mv != 0 {
        snapshot.min_cell_mv as f32 <= snapshot.cell_undervoltage_mv as f32
    } else {
        snapshot.pack_voltage_v > 0.0 && snapshot.pack_voltage_v < thresholds.undervoltage_v
    };
    let over_voltage = if snapshot.max_cell_mv != 0 {
        snapshot.max_cell_mv as f32 >= snapshot.cell_overvoltage_mv as f32
    } else {
        snapshot.pack_voltage_v > thresholds.overvoltage_v
    };
    let over_temperature = snapshot.pack_temp_max_c > thresholds.overtemp_c;
    let low_temp_charge = snapshot.pack_temp_min_c < thresholds.low_temp_charge_c && snapshot.pack_current_a > 3.0;
    let cell_imbalance_alarm = snapshot.cell_imbalance_mv as f32 > thresholds.imbalance_alarm_mv as f32;
    let cell_imbalance_warning = !cell_imbalance_alarm && snapshot.cell_imbalance_mv as f32 > thresholds.imbalance_warn_mv as f32;
    let low_soc = snapshot.soc_percent <= thresholds.soc_low_percent;
    let derate = snapshot.max_charge_current_a <= thresholds.derate_current_a
        || snapshot.max_discharge_current_a <= thresholds.derate_current_a;

    AlarmEvaluation {
        state: AlarmState {
            under_voltage,
            over_voltage,
            over_temperature,
            low_temp_charge,
            cell_imbalance: cell_imbalance_alarm,
            comms_error: comms.any_comms_fault(),
            low_soc,
            derate,
        },
        cell_imbalance_warning,
    }
}

/// Builds the `AlarmEvent`s that transitioned since the previous evaluation,
/// for publishing on the Event Bus's AlarmRaised/AlarmCleared channels.
pub fn diff_events(previous: AlarmState, current: AlarmState) -> Vec<AlarmEvent> {
    let mut events = Vec::new();
    let pairs: [(bool, bool, AlarmKind, &str); 8] = [
        (previous.under_voltage, current.under_voltage, AlarmKind::UnderVoltage, "cell under-voltage"),
        (previous.over_voltage, current.over_voltage, AlarmKind::OverVoltage, "cell over-voltage"),
        (previous.over_temperature, current.over_temperature, AlarmKind::OverTemperature, "pack over-temperature"),
        (previous.low_temp_charge, current.low_temp_charge, AlarmKind::LowTempCharge, "charging below low-temp threshold"),
        (previous.cell_imbalance, current.cell_imbalance, AlarmKind::CellImbalance, "cell imbalance"),
        (previous.comms_error, current.comms_error, AlarmKind::CommsError, "communications fault"),
        (previous.low_soc, current.low_soc, AlarmKind::LowSoc, "state of charge low"),
        (previous.derate, current.derate, AlarmKind::Derate, "charge/discharge current derated"),
    ];
    for (was, is, kind, message) in pairs {
        if was != is {
            events.push(AlarmEvent {
                kind,
                severity: AlarmSeverity::Error,
                message: message.to_string(),
                value: 0.0,
                active: is,
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_data::LiveSnapshot;

    fn thresholds() -> VictronThresholds {
        VictronThresholds::default()
    }

    fn snapshot() -> LiveSnapshot {
        LiveSnapshot {
            soc_percent: 81.5,
            pack_current_a: 1.0,
            pack_temp_max_c: 25.0,
            pack_temp_min_c: 25.0,
            cell_undervoltage_mv: 2800,
            cell_overvoltage_mv: 3650,
            min_cell_mv: 3100,
            max_cell_mv: 3275,
            cell_imbalance_mv: 175,
            max_charge_current_a: 45.0,
            max_discharge_current_a: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn normal_snapshot_raises_no_alarms() {
        let eval = evaluate(&snapshot(), &thresholds(), CommsHealth::default());
        assert!(!eval.state.any_active());
        assert!(!eval.cell_imbalance_warning);
    }

    #[test]
    fn over_temperature_trips_when_above_cutoff() {
        let mut snap = snapshot();
        snap.pack_temp_max_c = 60.0;
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(eval.state.over_temperature);
    }

    #[test]
    fn low_temp_charge_requires_both_temperature_and_current() {
        let mut snap = snapshot();
        snap.pack_temp_min_c = -5.0;
        snap.pack_current_a = 0.0;
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(!eval.state.low_temp_charge);
        snap.pack_current_a = 5.0;
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(eval.state.low_temp_charge);
    }

    #[test]
    fn imbalance_warning_precedes_alarm_level() {
        let mut snap = snapshot();
        snap.cell_imbalance_mv = 150;
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(eval.cell_imbalance_warning);
        assert!(!eval.state.cell_imbalance);

        snap.cell_imbalance_mv = 250;
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(eval.state.cell_imbalance);
        assert!(!eval.cell_imbalance_warning);
    }

    #[test]
    fn falls_back_to_pack_voltage_when_cell_registers_are_absent() {
        let mut snap = snapshot();
        snap.min_cell_mv = 0;
        snap.max_cell_mv = 0;
        snap.pack_voltage_v = 40.0; // below default undervoltage_v (44.0)
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(eval.state.under_voltage);
        assert!(!eval.state.over_voltage);

        snap.pack_voltage_v = 60.0; // above default overvoltage_v (58.4)
        let eval = evaluate(&snap, &thresholds(), CommsHealth::default());
        assert!(!eval.state.under_voltage);
        assert!(eval.state.over_voltage);
    }

    #[test]
    fn keepalive_loss_surfaces_as_comms_error() {
        let eval = evaluate(
            &snapshot(),
            &thresholds(),
            CommsHealth { keepalive_lost: true, ..Default::default() },
        );
        assert!(eval.state.comms_error);
    }

    #[test]
    fn diff_events_reports_only_transitions() {
        let previous = AlarmState::default();
        let mut current = AlarmState::default();
        current.over_voltage = true;
        let events = diff_events(previous, current);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlarmKind::OverVoltage);
        assert!(events[0].active);

        let events = diff_events(current, current);
        assert!(events.is_empty());
    }
}
