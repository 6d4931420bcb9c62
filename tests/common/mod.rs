//! Shared helpers: an in-memory transport and an engine running on top of it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ftms_bike::control::ControlPoint;
use ftms_bike::gatt::ServiceDescriptor;
use ftms_bike::session::{self, EngineHandle, Session};
use ftms_bike::transport::{Advertising, SessionEvent, Transport};
use ftms_bike::{Capability, DeviceIdentity, Result};

/// One transport call as the engine made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RegisterService(Vec<Uuid>),
    StartAdvertising(String),
    Notify(Uuid, Vec<u8>),
    Indicate(Uuid, Vec<u8>),
    Reject(String),
}

/// Records every call; never fails.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn register_service(&mut self, service: &ServiceDescriptor) -> Result<()> {
        let uuids = service.characteristics.iter().map(|c| c.uuid).collect();
        self.record(Call::RegisterService(uuids));
        Ok(())
    }

    async fn start_advertising(&mut self, advertising: &Advertising) -> Result<()> {
        self.record(Call::StartAdvertising(advertising.local_name.clone()));
        Ok(())
    }

    async fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.record(Call::Notify(characteristic, value.to_vec()));
        Ok(())
    }

    async fn indicate(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.record(Call::Indicate(characteristic, value.to_vec()));
        Ok(())
    }

    async fn reject(&mut self, address: &str) -> Result<()> {
        self.record(Call::Reject(address.to_string()));
        Ok(())
    }
}

/// An engine running on a spawned task.
pub struct TestEngine {
    pub handle: EngineHandle,
    pub events: mpsc::Sender<SessionEvent>,
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub task: JoinHandle<Result<()>>,
}

impl TestEngine {
    pub fn start(capability: Capability, require_control: bool, tick: Duration) -> Self {
        let transport = RecordingTransport::default();
        let calls = transport.calls.clone();
        let session = Session::new(DeviceIdentity(1), capability)
            .with_control_point(ControlPoint::new(require_control));
        let (handle, inbox) = EngineHandle::pair();
        let (events, events_rx) = mpsc::channel(32);
        let task = tokio::spawn(session::run(session, transport, events_rx, inbox, tick));
        Self {
            handle,
            events,
            calls,
            task,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}
