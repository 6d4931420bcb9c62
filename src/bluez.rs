//! BlueZ transport: serves the FTMS service through `bluer`.
//!
//! Characteristics that notify, indicate or accept writes use IO mode. A pump
//! task watches their control streams, forwards control point writes and
//! connection changes to the session as [`SessionEvent`]s, and hands the
//! notification writers back to the transport.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use bluer::{
    adv::{Advertisement, AdvertisementHandle, Feature},
    gatt::{
        local::{
            characteristic_control, Application, ApplicationHandle, Characteristic,
            CharacteristicControl, CharacteristicControlEvent, CharacteristicNotify,
            CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
            CharacteristicWriteMethod, ReqError, Service,
        },
        CharacteristicReader, CharacteristicWriter,
    },
    Adapter, Address, DeviceEvent, DeviceProperty,
};
use futures::{pin_mut, stream::select_all, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::gatt::{CharacteristicData, ServiceDescriptor};
use crate::protocol::CONTROL_POINT_UUID;
use crate::transport::{Advertising, SessionEvent, Transport};
use crate::{Error, Result};

type Subscription = (Uuid, CharacteristicWriter);

pub struct BluezTransport {
    _session: bluer::Session,
    adapter: Adapter,
    events: mpsc::Sender<SessionEvent>,
    app: Option<ApplicationHandle>,
    adv: Option<AdvertisementHandle>,
    pump: Option<JoinHandle<()>>,
    subscriptions: mpsc::UnboundedReceiver<Subscription>,
    writers: HashMap<Uuid, CharacteristicWriter>,
}

impl BluezTransport {
    /// Open a BlueZ session and power on the adapter (`None` = default).
    pub async fn open(
        adapter_name: Option<&str>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;

        info!(
            "FTMS using adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        let (_, subscriptions) = mpsc::unbounded_channel();
        Ok(Self {
            _session: session,
            adapter,
            events,
            app: None,
            adv: None,
            pump: None,
            subscriptions,
            writers: HashMap::new(),
        })
    }

    /// Pick up writers for characteristics a client subscribed to since the
    /// last call.
    fn drain_subscriptions(&mut self) {
        while let Ok((uuid, writer)) = self.subscriptions.try_recv() {
            debug!("Subscriber attached to {}", uuid);
            self.writers.insert(uuid, writer);
        }
    }

    async fn push(&mut self, uuid: Uuid, value: &[u8]) -> Result<()> {
        self.drain_subscriptions();
        let Some(writer) = self.writers.get_mut(&uuid) else {
            debug!("No subscriber on {}, dropping {} bytes", uuid, value.len());
            return Ok(());
        };
        // Each write on the IO socket is sent as one notification/indication
        if let Err(e) = writer.write(value).await {
            self.writers.remove(&uuid);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn register_service(&mut self, service: &ServiceDescriptor) -> Result<()> {
        // Dropping the old handles unregisters the previous application
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.app = None;
        self.writers.clear();

        let mut controls = Vec::new();
        let characteristics = service
            .characteristics
            .iter()
            .map(|data| {
                let (characteristic, control) = to_bluer(data);
                if let Some(control) = control {
                    controls.push((data.uuid, control));
                }
                characteristic
            })
            .collect();

        let app = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        self.app = Some(self.adapter.serve_gatt_application(app).await?);
        info!("FTMS GATT service registered");

        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        self.subscriptions = sub_rx;
        self.pump = Some(tokio::spawn(pump(
            self.adapter.clone(),
            controls,
            self.events.clone(),
            sub_tx,
        )));
        Ok(())
    }

    async fn start_advertising(&mut self, advertising: &Advertising) -> Result<()> {
        self.adv = None;

        let mut system_includes = BTreeSet::new();
        if advertising.include_tx_power {
            system_includes.insert(Feature::TxPower);
        }
        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: advertising.service_uuids.iter().copied().collect(),
            service_data: advertising.service_data.clone().into_iter().collect(),
            local_name: Some(advertising.local_name.clone()),
            discoverable: Some(advertising.discoverable),
            system_includes,
            ..Default::default()
        };
        self.adv = Some(self.adapter.advertise(adv).await?);
        info!("Advertising as '{}' with FTMS service", advertising.local_name);
        Ok(())
    }

    async fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.push(characteristic, value).await
    }

    async fn indicate(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.push(characteristic, value).await
    }

    async fn reject(&mut self, address: &str) -> Result<()> {
        let address: Address = address.parse().map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid address {}: {:?}", address, e),
            ))
        })?;
        warn!("Disconnecting extra central {}", address);
        self.adapter.device(address)?.disconnect().await?;
        Ok(())
    }
}

/// Map one declared characteristic onto its bluer counterpart. Returns the
/// control stream for characteristics that use IO mode.
///
/// BlueZ creates the Client Characteristic Configuration descriptor for every
/// notify/indicate characteristic itself and refuses an explicit one, so the
/// declared CCCDs are not passed through.
fn to_bluer(data: &CharacteristicData) -> (Characteristic, Option<CharacteristicControl>) {
    let props = data.properties;

    let read = match (&data.value, props.read) {
        (Some(value), true) => {
            let value = value.clone();
            let uuid = data.uuid;
            Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |_req| {
                    let value = value.clone();
                    async move {
                        debug!("Characteristic {} read", uuid);
                        Ok(value)
                    }
                    .boxed()
                }),
                ..Default::default()
            })
        }
        _ => None,
    };

    if !(props.write || props.notify || props.indicate) {
        let characteristic = Characteristic {
            uuid: data.uuid,
            read,
            ..Default::default()
        };
        return (characteristic, None);
    }

    let (control, handle) = characteristic_control();
    let characteristic = Characteristic {
        uuid: data.uuid,
        read,
        write: props.write.then(|| CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Io,
            ..Default::default()
        }),
        notify: (props.notify || props.indicate).then(|| CharacteristicNotify {
            notify: props.notify,
            indicate: props.indicate,
            method: CharacteristicNotifyMethod::Io,
            ..Default::default()
        }),
        control_handle: handle,
        ..Default::default()
    };
    (characteristic, Some(control))
}

/// Drive the IO-mode control streams of one registered application.
///
/// Only the first central to open a characteristic session is served.
/// Sessions from any other central are still reported as `Connected` so the
/// engine can reject them, but their writes and notify writers are dropped.
/// Disconnect watchers live in a `JoinSet` owned by this task and are
/// aborted with it.
async fn pump(
    adapter: Adapter,
    controls: Vec<(Uuid, CharacteristicControl)>,
    events: mpsc::Sender<SessionEvent>,
    subscriptions: mpsc::UnboundedSender<Subscription>,
) {
    let mut controls = select_all(
        controls
            .into_iter()
            .map(|(uuid, control)| Box::pin(control.map(move |evt| (uuid, evt)))),
    );

    let mut cp_reader: Option<CharacteristicReader> = None;
    let mut read_buf = Vec::new();
    let mut centrals = Centrals::default();
    let mut watchers: JoinSet<Option<Address>> = JoinSet::new();

    loop {
        tokio::select! {
            evt = controls.next() => {
                let Some((uuid, evt)) = evt else {
                    info!("GATT control streams ended");
                    break;
                };
                let address = match &evt {
                    CharacteristicControlEvent::Write(req) => req.device_address(),
                    CharacteristicControlEvent::Notify(writer) => writer.device_address(),
                };

                if centrals.observe(address) {
                    if events.send(SessionEvent::Connected(address.to_string())).await.is_err() {
                        break;
                    }
                    watchers.spawn(watch_disconnect(adapter.clone(), address));
                }
                let active = centrals.is_active(address);

                match evt {
                    CharacteristicControlEvent::Write(req) if active && uuid == CONTROL_POINT_UUID => {
                        info!("{} write session from {} (MTU {})", uuid, address, req.mtu());
                        read_buf = vec![0u8; req.mtu()];
                        match req.accept() {
                            Ok(reader) => cp_reader = Some(reader),
                            Err(e) => error!("Failed to accept control point write: {}", e),
                        }
                    }
                    CharacteristicControlEvent::Write(req) => {
                        warn!("Refusing {} write session from {}", uuid, address);
                        req.reject(ReqError::NotPermitted);
                    }
                    CharacteristicControlEvent::Notify(writer) if active => {
                        info!("{} notify session from {} (MTU {})", uuid, address, writer.mtu());
                        if subscriptions.send((uuid, writer)).is_err() {
                            break;
                        }
                    }
                    CharacteristicControlEvent::Notify(_) => {
                        debug!("Dropping {} notify session from inactive {}", uuid, address);
                    }
                }
            }

            read_res = async {
                match &mut cp_reader {
                    Some(reader) => reader.read(&mut read_buf).await,
                    None => futures::future::pending().await,
                }
            } => {
                match read_res {
                    Ok(0) => {
                        info!("Control Point write stream ended");
                        cp_reader = None;
                    }
                    Ok(n) => {
                        let bytes = read_buf[..n].to_vec();
                        if events.send(SessionEvent::ControlPointWrite(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Control Point read error: {}", e);
                        cp_reader = None;
                    }
                }
            }

            Some(joined) = watchers.join_next() => {
                let Ok(Some(address)) = joined else {
                    continue;
                };
                if centrals.remove(address) {
                    cp_reader = None;
                }
                if events.send(SessionEvent::Disconnected(address.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Centrals seen by one pump. The first one is served, later ones are only
/// tracked until they go away.
#[derive(Debug, Default)]
struct Centrals {
    active: Option<Address>,
    others: HashSet<Address>,
}

impl Centrals {
    /// Record a characteristic session from `address`. Returns true the first
    /// time an address is seen.
    fn observe(&mut self, address: Address) -> bool {
        if self.active == Some(address) || self.others.contains(&address) {
            return false;
        }
        match self.active {
            None => self.active = Some(address),
            Some(_) => {
                self.others.insert(address);
            }
        }
        true
    }

    fn is_active(&self, address: Address) -> bool {
        self.active == Some(address)
    }

    /// Forget `address`. Returns true if it was the served central.
    fn remove(&mut self, address: Address) -> bool {
        if self.is_active(address) {
            self.active = None;
            true
        } else {
            self.others.remove(&address);
            false
        }
    }
}

/// Wait for `address` to drop. Returns `None` when the device cannot be
/// watched.
async fn watch_disconnect(adapter: Adapter, address: Address) -> Option<Address> {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            warn!("Cannot watch {} for disconnects: {}", address, e);
            return None;
        }
    };
    let device_events = match device.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch {} for disconnects: {}", address, e);
            return None;
        }
    };
    pin_mut!(device_events);

    // The link may have dropped before the subscription was in place
    if !device.is_connected().await.unwrap_or(false) {
        info!("Device {} already disconnected", address);
        return Some(address);
    }

    while let Some(event) = device_events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            info!("Device {} disconnected", address);
            return Some(address);
        }
    }
    None
}
