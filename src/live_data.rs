//! `LiveSnapshot`: the single source of truth produced by a successful BMS
//! polling round, and the process-wide Live-Data Store that holds exactly
//! one current value from first publish onward.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// BMS "ready" sentinel used when the online-status register reads back 0.
pub const ONLINE_STATUS_READY: u8 = 0x91;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveSnapshot {
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub soc_percent: f32,
    pub soh_percent: f32,
    pub temperature_c: f32,
    pub pack_temp_min_c: f32,
    pub pack_temp_max_c: f32,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub cell_imbalance_mv: u16,
    pub balancing_bits: u16,
    pub online_status: u8,
    pub max_charge_current_a: f32,
    pub max_discharge_current_a: f32,
    pub cell_overvoltage_mv: u16,
    pub cell_undervoltage_mv: u16,
    pub discharge_overcurrent_a: f32,
    pub charge_overcurrent_a: f32,
    pub overheat_cutoff_c: f32,
    pub lifetime_seconds: u32,
    pub firmware_version: String,
    pub manufacturer_family: String,
}

impl LiveSnapshot {
    /// Derives `cell_imbalance_mv` and defaults `online_status`. Called once
    /// after every binding in a polling round has been applied (§4.5).
    pub fn finalize(&mut self) {
        self.cell_imbalance_mv = self.max_cell_mv.saturating_sub(self.min_cell_mv);
        if self.online_status == 0 {
            self.online_status = ONLINE_STATUS_READY;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmKind {
    OverVoltage,
    UnderVoltage,
    OverTemperature,
    LowTempCharge,
    CellImbalance,
    CommsError,
    CanKeepAliveLost,
    UartError,
    LowSoc,
    Derate,
    BmsOffline,
    WatchdogReset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmKind,
    pub severity: AlarmSeverity,
    pub message: String,
    pub value: f32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub message: String,
    pub severity: AlarmSeverity,
}

const RING_CAPACITY: usize = 64;

/// Single-writer / many-reader latest-snapshot slot plus a bounded ring of
/// recent alarm/status events for late-arriving observers.
pub struct LiveDataStore {
    inner: Mutex<Inner>,
}

struct Inner {
    latest: Option<LiveSnapshot>,
    events: VecDeque<StatusEvent>,
}

impl LiveDataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(LiveDataStore {
            inner: Mutex::new(Inner {
                latest: None,
                events: VecDeque::with_capacity(RING_CAPACITY),
            }),
        })
    }

    /// Writer path: replaces the whole snapshot atomically. Only the BMS
    /// polling task calls this.
    pub fn publish_latest(&self, snapshot: LiveSnapshot) {
        self.inner.lock().latest = Some(snapshot);
    }

    /// Reader path: copies the slot if present. Never blocks longer than the
    /// copy itself.
    pub fn latest(&self) -> Option<LiveSnapshot> {
        self.inner.lock().latest.clone()
    }

    pub fn push_event(&self, event: StatusEvent) {
        let mut guard = self.inner.lock();
        if guard.events.len() == RING_CAPACITY {
            guard.events.pop_front();
        }
        guard.events.push_back(event);
    }

    pub fn recent_events(&self) -> Vec<StatusEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_derives_imbalance_and_status_sentinel() {
        let mut snap = LiveSnapshot {
            min_cell_mv: 3100,
            max_cell_mv: 3275,
            online_status: 0,
            ..Default::default()
        };
        snap.finalize();
        assert_eq!(snap.cell_imbalance_mv, 175);
        assert_eq!(snap.online_status, ONLINE_STATUS_READY);
    }

    #[test]
    fn imbalance_never_negative_when_max_below_min() {
        // P2 guard: max(0, max-min) even if inputs are momentarily inverted.
        let mut snap = LiveSnapshot {
            min_cell_mv: 3300,
            max_cell_mv: 3200,
            ..Default::default()
        };
        snap.finalize();
        assert_eq!(snap.cell_imbalance_mv, 0);
    }

    #[test]
    fn store_holds_nothing_until_first_publish() {
        let store = LiveDataStore::new();
        assert!(store.latest().is_none());
        store.publish_latest(LiveSnapshot::default());
        assert!(store.latest().is_some());
    }

    #[test]
    fn event_ring_is_bounded() {
        let store = LiveDataStore::new();
        for i in 0..100 {
            store.push_event(StatusEvent {
                message: format!("event {i}"),
                severity: AlarmSeverity::Info,
            });
        }
        assert_eq!(store.recent_events().len(), RING_CAPACITY);
    }
}
