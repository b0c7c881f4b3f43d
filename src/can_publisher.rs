//! Periodic scheduler (§4.8) tying the Live-Data Store, PGN encoder,
//! alarm taxonomy and keep-alive monitor to a CAN Channel. `tick` is a pure
//! step function driven by an externally supplied timestamp, matching the
//! Adaptive Poller's no-time-source-dependency design so it can be unit
//! tested without a real clock.

use crate::alarms::{self, AlarmState, CommsHealth};
use crate::can_channel::{BusState, CanChannel, CanFrame};
use crate::config::VictronConfig;
use crate::cvl_supervisor::LimitsStore;
use crate::keepalive::{KeepAliveMonitor, Transition, KEEPALIVE_IDENTIFIER};
use crate::live_data::{AlarmEvent, LiveDataStore};
use crate::victron_pgn;
use std::time::Duration;

pub struct CanPublisher {
    keepalive: KeepAliveMonitor,
    last_pgn_emit_ms: u64,
    alarm_state: AlarmState,
    recent_uart_error: bool,
    recent_can_error: bool,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub pgns_emitted: u32,
    pub pgn_tx_errors: u32,
    pub alarm_events: Vec<AlarmEvent>,
    pub keepalive_transition: Option<Transition>,
}

impl CanPublisher {
    pub fn new(config: &VictronConfig) -> Self {
        CanPublisher {
            keepalive: KeepAliveMonitor::new(
                config.keepalive_interval_ms as u64,
                config.keepalive_timeout_ms as u64,
            ),
            last_pgn_emit_ms: 0,
            alarm_state: AlarmState::default(),
            recent_uart_error: false,
            recent_can_error: false,
        }
    }

    pub fn note_uart_error(&mut self) {
        self.recent_uart_error = true;
    }

    pub fn note_can_error(&mut self) {
        self.recent_can_error = true;
    }

    pub fn keepalive_state(&self) -> crate::keepalive::KeepAliveState {
        self.keepalive.state()
    }

    /// One scheduler step. Drains pending RX, emits the fixed PGN set if due,
    /// manages the keep-alive heartbeat, and reports what happened.
    pub fn tick(
        &mut self,
        now_ms: u64,
        can: &mut dyn CanChannel,
        store: &LiveDataStore,
        limits: &LimitsStore,
        config: &VictronConfig,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if can.bus_state() != BusState::Running {
            self.recent_can_error = true;
        }

        loop {
            match can.receive(Duration::from_millis(0)) {
                Ok(frame) if frame.id == KEEPALIVE_IDENTIFIER => {
                    if self.keepalive.record_receive(now_ms) == Transition::Recovered {
                        outcome.keepalive_transition = Some(Transition::Recovered);
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        if self.keepalive.check_timeout(now_ms) == Transition::Lost {
            outcome.keepalive_transition = Some(Transition::Lost);
        }

        if now_ms.saturating_sub(self.last_pgn_emit_ms) >= config.pgn_interval_ms as u64 {
            self.last_pgn_emit_ms = now_ms;
            if let Some(snapshot) = store.latest() {
                let evaluation = alarms::evaluate(
                    &snapshot,
                    &config.thresholds,
                    CommsHealth {
                        keepalive_lost: self.keepalive.state() == crate::keepalive::KeepAliveState::Lost,
                        recent_uart_error: self.recent_uart_error,
                        recent_can_error: self.recent_can_error,
                    },
                );
                self.recent_uart_error = false;
                self.recent_can_error = false;
                outcome.alarm_events = alarms::diff_events(self.alarm_state, evaluation.state);
                self.alarm_state = evaluation.state;

                let computed = limits.latest().unwrap_or(crate::cvl_supervisor::ComputedLimits {
                    state: crate::cvl_supervisor::CvlState::Bulk,
                    cvl_v: config.thresholds.overvoltage_v,
                    ccl_a: snapshot.max_charge_current_a,
                    dcl_a: snapshot.max_discharge_current_a,
                    imbalance_hold_active: false,
                });

                let payloads: [(u16, Vec<u8>); 6] = [
                    (
                        victron_pgn::PGN_VOLTAGE_CURRENT_TEMP,
                        victron_pgn::encode_voltage_current_temp(
                            snapshot.pack_voltage_v,
                            snapshot.pack_current_a,
                            snapshot.temperature_c,
                        )
                        .to_vec(),
                    ),
                    (
                        victron_pgn::PGN_SOC_SOH,
                        victron_pgn::encode_soc_soh(snapshot.soc_percent, snapshot.soh_percent).to_vec(),
                    ),
                    (
                        victron_pgn::PGN_BATTERY_LIMITS,
                        victron_pgn::encode_battery_limits(computed.cvl_v, computed.ccl_a, computed.dcl_a)
                            .to_vec(),
                    ),
                    (
                        victron_pgn::PGN_ALARMS,
                        victron_pgn::encode_alarms(&evaluation.state).to_vec(),
                    ),
                    (
                        victron_pgn::PGN_MANUFACTURER_NAME,
                        victron_pgn::encode_manufacturer_name(&config.manufacturer_name).to_vec(),
                    ),
                    (
                        victron_pgn::PGN_BATTERY_NAME,
                        victron_pgn::encode_battery_name(&config.battery_name).to_vec(),
                    ),
                ];

                for (pgn, payload) in payloads {
                    let frame = CanFrame::new(pgn as u32, &payload);
                    match can.transmit(&frame, Duration::from_millis(10)) {
                        Ok(()) => outcome.pgns_emitted += 1,
                        Err(_) => outcome.pgn_tx_errors += 1,
                    }
                }
                if outcome.pgn_tx_errors > 0 {
                    self.recent_can_error = true;
                }
            }
        }

        if self.keepalive.should_transmit(now_ms) {
            let frame = CanFrame::new(KEEPALIVE_IDENTIFIER, &victron_pgn::encode_keepalive());
            let _ = can.transmit(&frame, Duration::from_millis(10));
            self.keepalive.record_transmit(now_ms);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_channel::LoopbackCanChannel;
    use crate::live_data::LiveSnapshot;

    fn config() -> VictronConfig {
        VictronConfig::default()
    }

    #[test]
    fn skips_pgn_emission_without_a_published_snapshot() {
        let mut publisher = CanPublisher::new(&config());
        let mut can = LoopbackCanChannel::new();
        let store = LiveDataStore::new();
        let limits = LimitsStore::new();
        let outcome = publisher.tick(0, &mut can, &store, &limits, &config());
        assert_eq!(outcome.pgns_emitted, 0);
    }

    #[test]
    fn emits_fixed_pgn_set_on_due_tick() {
        let mut publisher = CanPublisher::new(&config());
        let mut can = LoopbackCanChannel::new();
        let store = LiveDataStore::new();
        let limits = LimitsStore::new();
        store.publish_latest(LiveSnapshot {
            pack_voltage_v: 52.0,
            soc_percent: 81.5,
            ..Default::default()
        });
        let outcome = publisher.tick(0, &mut can, &store, &limits, &config());
        assert_eq!(outcome.pgns_emitted, 6);
        assert_eq!(can.transmitted.len(), 7); // 6 PGNs + keep-alive heartbeat
    }

    #[test]
    fn does_not_re_emit_before_interval_elapses() {
        let mut publisher = CanPublisher::new(&config());
        let mut can = LoopbackCanChannel::new();
        let store = LiveDataStore::new();
        let limits = LimitsStore::new();
        store.publish_latest(LiveSnapshot::default());
        publisher.tick(0, &mut can, &store, &limits, &config());
        let outcome = publisher.tick(500, &mut can, &store, &limits, &config());
        assert_eq!(outcome.pgns_emitted, 0);
    }

    #[test]
    fn bus_off_surfaces_as_comms_error_alarm() {
        let mut publisher = CanPublisher::new(&config());
        let mut can = LoopbackCanChannel::new();
        can.state = BusState::BusOff;
        let store = LiveDataStore::new();
        let limits = LimitsStore::new();
        store.publish_latest(LiveSnapshot::default());
        let outcome = publisher.tick(0, &mut can, &store, &limits, &config());
        let comms_error_raised = outcome
            .alarm_events
            .iter()
            .any(|e| e.kind == crate::live_data::AlarmKind::CommsError && e.active);
        assert!(comms_error_raised);
    }

    #[test]
    fn s5_keepalive_rx_drives_recovery_transition() {
        let mut publisher = CanPublisher::new(&config());
        publisher.keepalive.check_timeout(10001);
        let mut can = LoopbackCanChannel::new();
        can.inject_rx(CanFrame::new(KEEPALIVE_IDENTIFIER, &[0x00]));
        let store = LiveDataStore::new();
        let limits = LimitsStore::new();
        let outcome = publisher.tick(10500, &mut can, &store, &limits, &config());
        assert_eq!(outcome.keepalive_transition, Some(Transition::Recovered));
    }
}
