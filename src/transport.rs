//! The narrow set of BLE operations the engine needs from a radio stack.

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::gatt::ServiceDescriptor;
use crate::Result;

/// Advertising payload for the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertising {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// General discoverable mode
    pub discoverable: bool,
    /// Include the TX power level
    pub include_tx_power: bool,
}

/// Inputs delivered to the session by the transport (and by its tick timer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw bytes written to the control point characteristic
    ControlPointWrite(Vec<u8>),
    /// Periodic telemetry tick
    Tick,
    /// A central connected; carries its address
    Connected(String),
    /// A central dropped; carries its address. Only the active central's
    /// disconnect ends the session.
    Disconnected(String),
}

/// What a BLE stack must provide. Implemented by the BlueZ backend and by
/// test doubles.
#[async_trait]
pub trait Transport: Send {
    async fn register_service(&mut self, service: &ServiceDescriptor) -> Result<()>;

    async fn start_advertising(&mut self, advertising: &Advertising) -> Result<()>;

    /// Push a notification. Dropped silently when nobody subscribed.
    async fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Push an indication. Dropped silently when nobody subscribed.
    async fn indicate(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Refuse a central that connected while another is active.
    async fn reject(&mut self, address: &str) -> Result<()>;
}
