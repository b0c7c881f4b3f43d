//! Frame-oriented CAN controller: TX queue semantics via blocking send,
//! RX via blocking recv, bus-off detection and recovery, driver statistics.

use crate::error::CanError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// Linux error-frame class bits, from linux/can/error.h. Error frames carry
// these in the CAN ID rather than the payload.
const CAN_ERR_CRTL: u32 = 0x0000_0004;
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;
const CAN_ERR_RESTARTED: u32 = 0x0000_0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Running,
    BusOff,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        CanFrame {
            id,
            extended: id > 0x7FF,
            dlc: len as u8,
            data: buf,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

#[derive(Debug, Default)]
pub struct BusStats {
    pub tx_ok: AtomicU64,
    pub tx_err: AtomicU64,
    pub rx_ok: AtomicU64,
    pub rx_err: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub bus_off_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusStatsSnapshot {
    pub tx_ok: u64,
    pub tx_err: u64,
    pub rx_ok: u64,
    pub rx_err: u64,
    pub rx_dropped: u64,
    pub bus_off_events: u64,
}

impl BusStats {
    fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            tx_ok: self.tx_ok.load(Ordering::Relaxed),
            tx_err: self.tx_err.load(Ordering::Relaxed),
            rx_ok: self.rx_ok.load(Ordering::Relaxed),
            rx_err: self.rx_err.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            bus_off_events: self.bus_off_events.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.tx_ok.store(0, Ordering::Relaxed);
        self.tx_err.store(0, Ordering::Relaxed);
        self.rx_ok.store(0, Ordering::Relaxed);
        self.rx_err.store(0, Ordering::Relaxed);
        self.rx_dropped.store(0, Ordering::Relaxed);
        self.bus_off_events.store(0, Ordering::Relaxed);
    }
}

/// Pure classification of one error frame's class bits against the current
/// bus state: (next state, bump bus_off_events, bump rx_dropped). Factored
/// out of `SocketCanChannel` so the recovery state machine is testable
/// without an open socket.
fn classify_error_bits(current: BusState, error_bits: u32) -> (BusState, bool, bool) {
    if error_bits & CAN_ERR_BUSOFF != 0 {
        (BusState::Recovering, current == BusState::Running, false)
    } else if error_bits & CAN_ERR_RESTARTED != 0 {
        (BusState::Running, false, false)
    } else if error_bits & CAN_ERR_CRTL != 0 {
        (current, false, true)
    } else {
        (current, false, false)
    }
}

pub trait CanChannel: Send {
    fn transmit(&mut self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError>;
    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, CanError>;
    fn stats(&self) -> BusStatsSnapshot;
    fn reset_stats(&self);
    fn bus_state(&self) -> BusState;
}

/// Production backend over Linux SocketCAN.
#[cfg(target_os = "linux")]
pub struct SocketCanChannel {
    socket: socketcan::CanSocket,
    stats: BusStats,
    state: BusState,
}

#[cfg(target_os = "linux")]
impl SocketCanChannel {
    pub fn open(interface: &str) -> Result<Self, CanError> {
        use socketcan::Socket;
        let socket =
            socketcan::CanSocket::open(interface).map_err(|e| CanError::Driver(e.to_string()))?;
        socket
            .set_error_filter_accept_all()
            .map_err(|e| CanError::Driver(e.to_string()))?;
        Ok(SocketCanChannel {
            socket,
            stats: BusStats::default(),
            state: BusState::Running,
        })
    }

    /// Applies one error frame's class bits to the recovery state machine
    /// (§bus-off/recovery contract): BUS_OFF folds straight into RECOVERING
    /// since hardware recovery is initiated synchronously on the alert;
    /// RESTARTED is the controller's recovery-complete signal back to
    /// RUNNING. RX-overflow-class alerts only bump a counter.
    fn apply_error_frame(&mut self, error_bits: u32) {
        let (next, bus_off_event, rx_dropped) = classify_error_bits(self.state, error_bits);
        if bus_off_event {
            self.stats.bus_off_events.fetch_add(1, Ordering::Relaxed);
        }
        if rx_dropped {
            self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.state = next;
    }
}

#[cfg(target_os = "linux")]
impl CanChannel for SocketCanChannel {
    fn transmit(&mut self, frame: &CanFrame, _timeout: Duration) -> Result<(), CanError> {
        use socketcan::Socket;
        if self.state != BusState::Running {
            return Err(CanError::BusOff);
        }
        let can_frame = if frame.extended {
            socketcan::CanFrame::from(
                socketcan::ExtendedId::new(frame.id)
                    .ok_or_else(|| CanError::InvalidArg("id out of range".into()))
                    .and_then(|id| {
                        socketcan::frame::CanDataFrame::new(id, frame.payload())
                            .map_err(|e| CanError::InvalidArg(e.to_string()))
                    })?,
            )
        } else {
            socketcan::CanFrame::from(
                socketcan::StandardId::new(frame.id as u16)
                    .ok_or_else(|| CanError::InvalidArg("id out of range".into()))
                    .and_then(|id| {
                        socketcan::frame::CanDataFrame::new(id, frame.payload())
                            .map_err(|e| CanError::InvalidArg(e.to_string()))
                    })?,
            )
        };
        match self.socket.write_frame(&can_frame) {
            Ok(_) => {
                self.stats.tx_ok.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
                Err(CanError::Driver(e.to_string()))
            }
        }
    }

    fn receive(&mut self, _timeout: Duration) -> Result<CanFrame, CanError> {
        use socketcan::Socket;
        // Error frames arrive even while BUS_OFF/RECOVERING — that's how the
        // channel learns a RESTARTED alert and climbs back to RUNNING — so
        // this check can't gate the read itself, only the data it returns.
        match self.socket.read_frame() {
            Ok(socketcan::CanFrame::Data(data)) => {
                if self.state != BusState::Running {
                    return Err(CanError::Timeout);
                }
                self.stats.rx_ok.fetch_add(1, Ordering::Relaxed);
                Ok(CanFrame::new(data.raw_id(), data.data()))
            }
            Ok(socketcan::CanFrame::Error(err)) => {
                self.apply_error_frame(err.raw_id());
                Err(CanError::Timeout)
            }
            Ok(_) => Err(CanError::Timeout),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(CanError::Timeout),
            Err(e) => {
                self.stats.rx_err.fetch_add(1, Ordering::Relaxed);
                Err(CanError::Driver(e.to_string()))
            }
        }
    }

    fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }

    fn bus_state(&self) -> BusState {
        self.state
    }
}

/// In-memory loopback test double used by CAN Publisher / Keep-Alive Monitor
/// unit tests. Frames written via `inject_rx` are returned by `receive`.
#[cfg(test)]
pub struct LoopbackCanChannel {
    pub rx_queue: std::collections::VecDeque<CanFrame>,
    pub transmitted: Vec<CanFrame>,
    pub stats: BusStats,
    pub state: BusState,
    pub fail_transmit: bool,
}

#[cfg(test)]
impl LoopbackCanChannel {
    pub fn new() -> Self {
        LoopbackCanChannel {
            rx_queue: std::collections::VecDeque::new(),
            transmitted: Vec::new(),
            stats: BusStats::default(),
            state: BusState::Running,
            fail_transmit: false,
        }
    }

    pub fn inject_rx(&mut self, frame: CanFrame) {
        self.rx_queue.push_back(frame);
    }
}

#[cfg(test)]
impl CanChannel for LoopbackCanChannel {
    fn transmit(&mut self, frame: &CanFrame, _timeout: Duration) -> Result<(), CanError> {
        if self.state != BusState::Running {
            self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
            return Err(CanError::BusOff);
        }
        if self.fail_transmit {
            self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
            return Err(CanError::Driver("simulated tx failure".into()));
        }
        self.transmitted.push(*frame);
        self.stats.tx_ok.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<CanFrame, CanError> {
        if self.state != BusState::Running {
            return Err(CanError::Timeout);
        }
        match self.rx_queue.pop_front() {
            Some(frame) => {
                self.stats.rx_ok.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            None => Err(CanError::Timeout),
        }
    }

    fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }

    fn bus_state(&self) -> BusState {
        self.state
    }
}
