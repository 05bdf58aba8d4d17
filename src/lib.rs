//! SmartReader gateway
//!
//! Fleet-management gateway bridging HTTP command submission with the MQTT
//! broker fabric a population of RFID readers lives on: durable command
//! queue, publisher pump, inbound router with response correlation,
//! stale-command reaper, command scheduler, and the ingress API.

pub mod api;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod payload;
pub mod pump;
pub mod reaper;
pub mod router;
pub mod scheduler;
pub mod store;
