//! Bridge Orchestrator (§4.13): creates every component, wires shared
//! state, and owns the three long-lived task handles. On a host rewrite
//! "pinned to cores" becomes `tokio::task::spawn_blocking`, mirroring the
//! teacher's own `tauri::async_runtime::spawn_blocking` pattern for wrapping
//! blocking serial/CAN I/O inside an async context.

use crate::adaptive_poller::{AdaptivePoller, AdaptivePollingConfig};
use crate::bms_client::BmsClient;
use crate::can_channel::CanChannel;
use crate::can_publisher::CanPublisher;
use crate::config::BridgeConfig;
use crate::cvl_supervisor::{CvlInputs, CvlSupervisor, LimitsStore};
use crate::event_bus::EventBus;
use crate::live_data::{AlarmEvent, AlarmKind, AlarmSeverity, LiveDataStore, StatusEvent};
use crate::register_decoder::{self, RegisterWords};
use crate::serial_channel::SerialChannel;
use crate::watchdog::{self, Watchdog};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const READ_SCHEDULE: &[(u16, u8)] = &[(32, 21), (102, 2), (113, 2), (305, 3), (315, 5), (500, 6)];

/// Shared state every task reads or writes. Built once at boot and cloned
/// (as `Arc`s) into each `spawn_blocking` closure.
pub struct Orchestrator {
    pub config: BridgeConfig,
    pub live_data: Arc<LiveDataStore>,
    pub limits: Arc<LimitsStore>,
    pub event_bus: Arc<EventBus>,
    pub watchdog: Arc<Watchdog>,
    /// Set by the BMS-poll task on a failed round, consumed by the
    /// CAN-publish task so a UART fault can feed the CommsError alarm path.
    uart_fault: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig) -> Self {
        let watchdog = Arc::new(Watchdog::new(
            config.watchdog.timeout_ms as u64,
            config.watchdog.min_feed_interval_ms as u64,
        ));
        let event_bus = EventBus::new();
        if watchdog::check_and_arm_shutdown_marker(&config.watchdog.marker_path) {
            event_bus.alarm_raised.publish(AlarmEvent {
                kind: AlarmKind::WatchdogReset,
                severity: AlarmSeverity::Warning,
                message: "previous run did not shut down cleanly".to_string(),
                value: 0.0,
                active: true,
            });
        }
        Orchestrator {
            config,
            live_data: LiveDataStore::new(),
            limits: LimitsStore::new(),
            event_bus,
            watchdog,
            uart_fault: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        watchdog::clear_shutdown_marker(&self.config.watchdog.marker_path);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Spawns the three long-lived tasks on the blocking thread pool and
    /// returns their join handles.
    pub fn spawn_tasks(
        self: &Arc<Self>,
        serial: Box<dyn SerialChannel>,
        can: Box<dyn CanChannel>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let bms_orchestrator = self.clone();
        let bms_handle = tokio::task::spawn_blocking(move || bms_poll_loop(bms_orchestrator, serial));

        let can_orchestrator = self.clone();
        let can_handle = tokio::task::spawn_blocking(move || can_publish_loop(can_orchestrator, can));

        let cvl_orchestrator = self.clone();
        let cvl_handle = tokio::task::spawn_blocking(move || cvl_supervise_loop(cvl_orchestrator));

        vec![bms_handle, can_handle, cvl_handle]
    }
}

/// Tracks consecutive failed polling rounds, raising `BmsOffline` once the
/// configured streak threshold is crossed and clearing it on the next
/// successful round. Edge-triggered like `KeepAliveMonitor`: one event per
/// transition, not one per failed round.
struct BmsHealthMonitor {
    consecutive_failures: u32,
    threshold: u32,
    offline: bool,
}

impl BmsHealthMonitor {
    fn new(threshold: u32) -> Self {
        BmsHealthMonitor {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            offline: false,
        }
    }

    fn record_failure(&mut self) -> Option<AlarmEvent> {
        self.consecutive_failures += 1;
        if !self.offline && self.consecutive_failures >= self.threshold {
            self.offline = true;
            Some(AlarmEvent {
                kind: AlarmKind::BmsOffline,
                severity: AlarmSeverity::Critical,
                message: format!(
                    "BMS unresponsive for {} consecutive polling rounds",
                    self.consecutive_failures
                ),
                value: self.consecutive_failures as f32,
                active: true,
            })
        } else {
            None
        }
    }

    fn record_success(&mut self) -> Option<AlarmEvent> {
        self.consecutive_failures = 0;
        if self.offline {
            self.offline = false;
            Some(AlarmEvent {
                kind: AlarmKind::BmsOffline,
                severity: AlarmSeverity::Critical,
                message: "BMS polling recovered".to_string(),
                value: 0.0,
                active: false,
            })
        } else {
            None
        }
    }
}

/// BMS-poll task body (§5 table): adaptive interval, default 100 ms in
/// [50, 500] ms.
fn bms_poll_loop(orchestrator: Arc<Orchestrator>, mut serial: Box<dyn SerialChannel>) {
    orchestrator.watchdog.register("bms-poll");
    let mut poller = AdaptivePoller::new(AdaptivePollingConfig {
        base_interval_ms: orchestrator.config.tinybms.poll_interval_ms,
        ..AdaptivePollingConfig::default()
    });
    let mut health = BmsHealthMonitor::new(orchestrator.config.tinybms.offline_failure_threshold);

    while !orchestrator.is_shutting_down() {
        let started = Instant::now();
        let round = run_polling_round(&orchestrator, serial.as_mut());
        let latency_ms = started.elapsed().as_millis() as u32;

        match round {
            Ok(snapshot) => {
                orchestrator.live_data.publish_latest(snapshot);
                poller.record_success(latency_ms);
                if let Some(event) = health.record_success() {
                    orchestrator.event_bus.alarm_cleared.publish(event);
                }
            }
            Err(message) => {
                orchestrator.live_data.push_event(StatusEvent {
                    message,
                    severity: AlarmSeverity::Error,
                });
                orchestrator.uart_fault.store(true, Ordering::Relaxed);
                poller.record_failure(latency_ms);
                if let Some(event) = health.record_failure() {
                    orchestrator.event_bus.alarm_raised.publish(event);
                }
            }
        }

        orchestrator.watchdog.feed("bms-poll");
        std::thread::sleep(Duration::from_millis(poller.current_interval_ms() as u64));
    }
}

/// One polling round per §4.5/§6.3: fetch every scheduled block, decode only
/// if all of them arrived intact.
fn run_polling_round(
    orchestrator: &Orchestrator,
    serial: &mut dyn SerialChannel,
) -> Result<crate::live_data::LiveSnapshot, String> {
    let mut client = BmsClient::new(
        serial,
        orchestrator.config.tinybms.uart_retry_count,
        orchestrator.config.tinybms.uart_retry_delay_ms,
        orchestrator.config.hardware.uart_timeout_ms,
    );

    let mut blocks: Vec<((u16, u8), Vec<u16>)> = Vec::with_capacity(READ_SCHEDULE.len());
    for &(start, count) in READ_SCHEDULE {
        match client.read_register_block(start, count) {
            Ok((words, _counters)) => blocks.push(((start, count), words)),
            Err(e) => return Err(format!("BMS polling round failed at block {start}: {e}")),
        }
    }

    let words: RegisterWords = register_decoder::words_map_from_blocks(&blocks)
        .ok_or_else(|| "BMS polling round produced an incomplete register set".to_string())?;

    Ok(register_decoder::decode_snapshot(&words))
}

/// CAN-publish task body: fixed 1000 ms cadence per §4.8, with the
/// keep-alive RX drain folded into the same tick.
fn can_publish_loop(orchestrator: Arc<Orchestrator>, mut can: Box<dyn CanChannel>) {
    orchestrator.watchdog.register("can-publish");
    let mut publisher = CanPublisher::new(&orchestrator.config.victron);
    let start = Instant::now();

    while !orchestrator.is_shutting_down() {
        if orchestrator.uart_fault.swap(false, Ordering::Relaxed) {
            publisher.note_uart_error();
        }

        let now_ms = start.elapsed().as_millis() as u64;
        let outcome = publisher.tick(
            now_ms,
            can.as_mut(),
            &orchestrator.live_data,
            &orchestrator.limits,
            &orchestrator.config.victron,
        );

        for event in outcome.alarm_events {
            if event.active {
                orchestrator.event_bus.alarm_raised.publish(event);
            } else {
                orchestrator.event_bus.alarm_cleared.publish(event);
            }
        }

        orchestrator.watchdog.feed("can-publish");
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// CVL-supervise task body: default 20 s cadence per §5.
fn cvl_supervise_loop(orchestrator: Arc<Orchestrator>) {
    orchestrator.watchdog.register("cvl-supervise");
    let mut supervisor = CvlSupervisor::new();

    while !orchestrator.is_shutting_down() {
        if let Some(snapshot) = orchestrator.live_data.latest() {
            let inputs = CvlInputs {
                soc_percent: snapshot.soc_percent,
                cell_imbalance_mv: snapshot.cell_imbalance_mv,
                base_ccl_a: snapshot.max_charge_current_a,
                base_dcl_a: snapshot.max_discharge_current_a,
                max_cell_voltage_v: snapshot.max_cell_mv as f32 / 1000.0,
                series_cell_count: orchestrator.config.cvl.series_cell_count,
            };
            let old_state = supervisor.state();
            let (computed, duration) = supervisor.evaluate(&inputs, &orchestrator.config.cvl);
            orchestrator.limits.publish(computed);

            if let Some(elapsed) = duration {
                orchestrator.event_bus.cvl_state_changed.publish(crate::event_bus::CvlStateChange {
                    old_state,
                    new_state: computed.state,
                    new_cvl_v: computed.cvl_v,
                    new_ccl_a: computed.ccl_a,
                    new_dcl_a: computed.dcl_a,
                    duration_in_old_state_ms: elapsed.as_millis() as u64,
                });
            }
        }

        orchestrator.watchdog.feed("cvl-supervise");
        std::thread::sleep(Duration::from_millis(orchestrator.config.victron.cvl_interval_ms as u64));
    }
}
