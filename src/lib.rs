//! TinyBMS to Victron VE.Can bridge: polls a TinyBMS over serial, republishes
//! its state as Victron CAN frames, and supervises charge-voltage/current
//! limits in a closed loop.

pub mod adaptive_poller;
pub mod alarms;
pub mod bms_client;
pub mod bms_protocol;
pub mod can_channel;
pub mod can_publisher;
pub mod config;
pub mod cvl_supervisor;
pub mod error;
pub mod event_bus;
pub mod keepalive;
pub mod live_data;
pub mod orchestrator;
pub mod register_decoder;
pub mod serial_channel;
pub mod victron_pgn;
pub mod watchdog;
