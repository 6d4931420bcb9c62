//! FTMS (Fitness Machine Service) indoor bike peripheral.
//!
//! Emulates a smart trainer over BLE: exposes the FTMS GATT service, answers
//! control point requests and streams Indoor Bike Data once per tick.

pub mod bluez;
pub mod config;
pub mod control;
pub mod debug_server;
pub mod error;
pub mod gatt;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};

/// Short numeric id the advertised name is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity(pub u16);

impl DeviceIdentity {
    /// Advertised local name. Kept short to fit the advertising packet.
    pub fn local_name(&self) -> String {
        format!("M {}", self.0)
    }
}

/// What the trainer lets a client control. Fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Accepts power, resistance and simulation targets
    pub controllable: bool,
}

impl Default for Capability {
    fn default() -> Self {
        Self { controllable: true }
    }
}
