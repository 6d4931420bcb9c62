//! Peripheral session: the FTMS engine and the event loop that drives it.
//!
//! [`Session`] is a plain state machine: every input is a [`SessionEvent`]
//! and every output is a list of [`Effect`]s for the transport to carry out.
//! [`run`] owns the session on a single task and feeds it transport events,
//! timer ticks and debug console requests one at a time.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::control::{ControlPoint, TargetState};
use crate::gatt::ServiceDescriptor;
use crate::protocol::{
    self, ResultCode, CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    MACHINE_STATUS_UUID,
};
use crate::telemetry::{TelemetryModel, TelemetrySnapshot};
use crate::transport::{Advertising, SessionEvent, Transport};
use crate::{Capability, DeviceIdentity, Error, Result};

/// FTMS advertisement service data: Flags (bit 0 = Fitness Machine Available)
/// followed by Fitness Machine Type (uint16 LE, bit 5 = Indoor Bike).
const FTMS_SERVICE_DATA: [u8; 3] = [0x01, 0x20, 0x00];

/// Connection state of the single central this peripheral serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Advertising,
    Connected,
    Disconnected,
}

/// A side effect requested by the session, applied in order by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RegisterService(ServiceDescriptor),
    StartAdvertising(Advertising),
    Notify { characteristic: Uuid, value: Vec<u8> },
    Indicate { characteristic: Uuid, value: Vec<u8> },
    Reject(String),
}

/// Read-only view of the engine for the debug console.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub state: SessionState,
    pub central: Option<String>,
    pub identity: DeviceIdentity,
    pub capability: Capability,
    pub telemetry: TelemetrySnapshot,
    pub targets: TargetState,
    pub service: Option<ServiceDescriptor>,
}

pub struct Session {
    identity: DeviceIdentity,
    capability: Capability,
    state: SessionState,
    central: Option<String>,
    started: bool,
    descriptor: Option<ServiceDescriptor>,
    control: ControlPoint,
    telemetry: TelemetryModel,
}

impl Session {
    pub fn new(identity: DeviceIdentity, capability: Capability) -> Self {
        Self {
            identity,
            capability,
            state: SessionState::Disconnected,
            central: None,
            started: false,
            descriptor: None,
            control: ControlPoint::default(),
            telemetry: TelemetryModel::default(),
        }
    }

    pub fn with_control_point(mut self, control: ControlPoint) -> Self {
        self.control = control;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryModel) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn targets(&self) -> TargetState {
        self.control.targets()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn inspect(&self) -> Inspection {
        Inspection {
            state: self.state,
            central: self.central.clone(),
            identity: self.identity,
            capability: self.capability,
            telemetry: self.telemetry.snapshot(),
            targets: self.control.targets(),
            service: self.descriptor.clone(),
        }
    }

    /// The service descriptor, built on first use and reused afterwards.
    pub fn descriptor(&mut self) -> &ServiceDescriptor {
        let capability = self.capability;
        self.descriptor
            .get_or_insert_with(|| ServiceDescriptor::build(capability))
    }

    pub fn advertising(&self) -> Advertising {
        Advertising {
            local_name: self.identity.local_name(),
            service_uuids: vec![FTMS_SERVICE_UUID],
            service_data: BTreeMap::from([(FTMS_SERVICE_UUID, FTMS_SERVICE_DATA.to_vec())]),
            discoverable: true,
            include_tx_power: true,
        }
    }

    /// Register the service and start advertising. Only the first call has
    /// any effect.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.started {
            debug!("Session already started");
            return Vec::new();
        }
        self.started = true;
        info!(
            "Starting FTMS session as '{}' (controllable={})",
            self.identity.local_name(),
            self.capability.controllable
        );
        self.readvertise()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::ControlPointWrite(bytes) => self.on_control_point_write(&bytes),
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::Connected(address) => self.on_connected(address),
            SessionEvent::Disconnected(address) => self.on_disconnected(address),
        }
    }

    fn readvertise(&mut self) -> Vec<Effect> {
        let service = self.descriptor().clone();
        self.state = SessionState::Advertising;
        vec![
            Effect::RegisterService(service),
            Effect::StartAdvertising(self.advertising()),
        ]
    }

    fn on_control_point_write(&mut self, bytes: &[u8]) -> Vec<Effect> {
        debug!("Control Point write: {} bytes {:02x?}", bytes.len(), bytes);

        let cmd = match protocol::decode_control_command(bytes) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Ignoring control point write {:02x?}: {}", bytes, e);
                return Vec::new();
            }
        };

        let response = self.control.handle(&cmd, self.capability);
        let mut effects = vec![Effect::Indicate {
            characteristic: CONTROL_POINT_UUID,
            value: response.encode().to_vec(),
        }];

        // The status notification follows the response indication
        if response.result == ResultCode::Success {
            if let Some(status) = protocol::encode_machine_status(&cmd) {
                effects.push(Effect::Notify {
                    characteristic: MACHINE_STATUS_UUID,
                    value: status,
                });
            }
        }
        effects
    }

    fn on_tick(&mut self) -> Vec<Effect> {
        self.telemetry
            .tick()
            .encode_frames()
            .into_iter()
            .map(|value| Effect::Notify {
                characteristic: INDOOR_BIKE_DATA_UUID,
                value,
            })
            .collect()
    }

    fn on_connected(&mut self, address: String) -> Vec<Effect> {
        if self.state == SessionState::Connected {
            // BlueZ reports the same central once per characteristic session
            if self.central.as_deref() == Some(address.as_str()) {
                return Vec::new();
            }
            error!(
                "Rejecting second central {} while {} is connected",
                address,
                self.central.as_deref().unwrap_or("?")
            );
            return vec![Effect::Reject(address)];
        }

        info!("Central {} connected", address);
        self.state = SessionState::Connected;
        self.central = Some(address);
        Vec::new()
    }

    fn on_disconnected(&mut self, address: String) -> Vec<Effect> {
        let active = match self.central.as_deref() {
            Some(central) => central == address,
            None => self.state == SessionState::Connected,
        };
        if !active {
            // e.g. a rejected second central going away
            debug!("Ignoring disconnect of inactive central {}", address);
            return Vec::new();
        }

        info!("Central {} disconnected, restarting advertising", address);
        self.state = SessionState::Disconnected;
        self.central = None;
        self.control.release();
        self.readvertise()
    }
}

/// A notification or indication as it went out, for debug subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Requests from outside the event loop (the debug console).
#[derive(Debug)]
pub enum Command {
    Inspect(oneshot::Sender<Inspection>),
    /// Same path as a BLE control point write; replies with the indication
    /// that was sent, if any.
    ControlPoint(Vec<u8>, oneshot::Sender<Option<Vec<u8>>>),
}

/// Cloneable handle for talking to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
}

/// The engine's side of an [`EngineHandle`].
pub struct EngineInbox {
    commands: mpsc::Receiver<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl EngineHandle {
    pub fn pair() -> (EngineHandle, EngineInbox) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (notify_tx, _) = broadcast::channel(64);
        (
            EngineHandle {
                commands: cmd_tx,
                notifications: notify_tx.clone(),
            },
            EngineInbox {
                commands: cmd_rx,
                notifications: notify_tx,
            },
        )
    }

    pub async fn inspect(&self) -> Result<Inspection> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn write_control_point(&self, bytes: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ControlPoint(bytes, tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

/// Run the engine until the transport's event stream ends.
///
/// Each input (tick, transport event, debug command) is handled to
/// completion and its effects applied before the next one is taken.
pub async fn run<T: Transport>(
    mut session: Session,
    mut transport: T,
    mut events: mpsc::Receiver<SessionEvent>,
    mut inbox: EngineInbox,
    tick: Duration,
) -> Result<()> {
    let startup = session.start();
    apply(&mut transport, &inbox.notifications, startup).await;

    let mut interval = tokio::time::interval(tick);
    // First tick fires immediately -- skip it
    interval.tick().await;

    info!("FTMS session running, tick every {:?}", tick);

    loop {
        let effects = tokio::select! {
            // Transport events queued before a debug command are seen first
            biased;

            _ = interval.tick() => session.handle(SessionEvent::Tick),

            event = events.recv() => match event {
                Some(event) => session.handle(event),
                None => {
                    info!("Transport event stream ended");
                    break;
                }
            },

            Some(cmd) = inbox.commands.recv() => match cmd {
                Command::Inspect(reply) => {
                    let _ = reply.send(session.inspect());
                    Vec::new()
                }
                Command::ControlPoint(bytes, reply) => {
                    let effects = session.handle(SessionEvent::ControlPointWrite(bytes));
                    let indication = effects.iter().find_map(|e| match e {
                        Effect::Indicate { value, .. } => Some(value.clone()),
                        _ => None,
                    });
                    let _ = reply.send(indication);
                    effects
                }
            },
        };

        apply(&mut transport, &inbox.notifications, effects).await;
    }

    Ok(())
}

/// Carry out effects in order. Transport failures are logged, never fatal.
async fn apply<T: Transport>(
    transport: &mut T,
    notifications: &broadcast::Sender<Notification>,
    effects: Vec<Effect>,
) {
    for effect in effects {
        let result = match effect {
            Effect::RegisterService(service) => transport.register_service(&service).await,
            Effect::StartAdvertising(adv) => transport.start_advertising(&adv).await,
            Effect::Notify { characteristic, value } => {
                let result = transport.notify(characteristic, &value).await;
                let _ = notifications.send(Notification { characteristic, value });
                result
            }
            Effect::Indicate { characteristic, value } => {
                let result = transport.indicate(characteristic, &value).await;
                let _ = notifications.send(Notification { characteristic, value });
                result
            }
            Effect::Reject(address) => transport.reject(&address).await,
        };
        if let Err(e) = result {
            warn!("Transport error: {}", e);
        }
    }
}
