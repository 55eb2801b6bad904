//! Production [Adapter] backend over the BlueZ D-Bus daemon.
//!
//! The backend mirrors the daemon's object tree into a local cache, fed by
//! the object manager and property change signals, so that all queries are
//! answered without a bus round trip. Commands are posted as asynchronous
//! D-Bus calls; their outcome surfaces through adapter events or, when
//! nothing arrives, through the per-phase timeouts of the state machines.

use dbus::{
    arg::{prop_cast, PropMap},
    nonblock::{stdintf::org_freedesktop_dbus::Properties, Proxy, SyncConnection},
    Path,
};
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

use crate::{
    adapter::{Adapter, AdapterEvent, RcuDevice},
    session::{ObjectEvent, Session},
    BleAddress, Error, ErrorKind, Result, SERVICE_NAME, TIMEOUT,
};

pub(crate) const INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub(crate) const PREFIX: &str = "/org/bluez/";

/// Default adapter name.
pub const DEFAULT_NAME: &str = "hci0";

#[derive(Debug, Clone, Default)]
struct DeviceState {
    name: String,
    paired: bool,
    connected: bool,
    services_resolved: bool,
    ready: bool,
    ready_since: Option<Instant>,
}

#[derive(Default)]
struct Cache {
    available: bool,
    powered: bool,
    discovering: bool,
    pairable: bool,
    devices: BTreeMap<BleAddress, DeviceState>,
}

struct Inner {
    connection: Arc<SyncConnection>,
    dbus_path: Path<'static>,
    name: String,
    cache: Mutex<Cache>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl Inner {
    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn proxy(&self) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(SERVICE_NAME, self.dbus_path.clone(), TIMEOUT, self.connection.clone())
    }

    fn device_proxy(&self, address: BleAddress) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(SERVICE_NAME, device_path(&self.name, address), TIMEOUT, self.connection.clone())
    }

    fn parse_device_path(&self, path: &Path) -> Option<BleAddress> {
        parse_device_path(&self.name, path)
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    /// Applies adapter property changes to the cache and emits the
    /// resulting state change events.
    fn apply_adapter_props(&self, props: &PropMap) {
        let mut events = Vec::new();
        {
            let mut cache = self.cache();
            if let Some(&powered) = prop_cast::<bool>(props, "Powered") {
                if cache.powered != powered {
                    cache.powered = powered;
                    events.push(AdapterEvent::PoweredChanged(powered));
                }
            }
            if let Some(&discovering) = prop_cast::<bool>(props, "Discovering") {
                if cache.discovering != discovering {
                    cache.discovering = discovering;
                    events.push(AdapterEvent::DiscoveryChanged(discovering));
                }
            }
            if let Some(&pairable) = prop_cast::<bool>(props, "Pairable") {
                if cache.pairable != pairable {
                    cache.pairable = pairable;
                    events.push(AdapterEvent::PairableChanged(pairable));
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Applies device property changes to the cache and emits the
    /// resulting device events. `added` marks a device object that has
    /// just appeared, announced with a found event instead of a name
    /// change.
    fn apply_device_props(&self, address: BleAddress, props: &PropMap, added: bool) {
        let mut events = Vec::new();
        {
            let mut cache = self.cache();
            let device = cache.devices.entry(address).or_default();

            if let Some(name) = prop_cast::<String>(props, "Name") {
                if added || device.name != *name {
                    device.name = name.clone();
                    if !added {
                        events.push(AdapterEvent::DeviceNameChanged { address, name: name.clone() });
                    }
                }
            }
            if added {
                events.push(AdapterEvent::DeviceFound { address, name: device.name.clone() });
            }

            if let Some(&paired) = prop_cast::<bool>(props, "Paired") {
                if device.paired != paired {
                    device.paired = paired;
                    events.push(AdapterEvent::DevicePairingChanged { address, paired });
                }
            }
            if let Some(&connected) = prop_cast::<bool>(props, "Connected") {
                device.connected = connected;
            }
            if let Some(&resolved) = prop_cast::<bool>(props, "ServicesResolved") {
                device.services_resolved = resolved;
            }

            let ready = device.paired && device.connected && device.services_resolved;
            if device.ready != ready {
                device.ready = ready;
                if ready {
                    device.ready_since = Some(Instant::now());
                }
                events.push(AdapterEvent::DeviceReadyChanged { address, ready });
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    fn handle_object_event(&self, event: ObjectEvent) {
        match event {
            ObjectEvent::ObjectAdded { object, interfaces } => {
                if object == self.dbus_path {
                    if let Some(props) = interfaces.get(INTERFACE) {
                        self.cache().available = true;
                        self.apply_adapter_props(props);
                    }
                } else if let Some(address) = self.parse_device_path(&object) {
                    if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                        self.apply_device_props(address, props, true);
                    }
                }
            }
            ObjectEvent::ObjectRemoved { object, interfaces } => {
                if object == self.dbus_path && interfaces.contains(INTERFACE) {
                    log::warn!("adapter {} removed from the bus", self.name);
                    let was_powered = {
                        let mut cache = self.cache();
                        cache.available = false;
                        std::mem::replace(&mut cache.powered, false)
                    };
                    if was_powered {
                        self.emit(AdapterEvent::PoweredChanged(false));
                    }
                } else if let Some(address) = self.parse_device_path(&object) {
                    if interfaces.contains(DEVICE_INTERFACE) && self.cache().devices.remove(&address).is_some() {
                        self.emit(AdapterEvent::DeviceRemoved { address });
                    }
                }
            }
            ObjectEvent::PropertiesChanged { object, interface, changed } => {
                if object == self.dbus_path && interface == INTERFACE {
                    self.apply_adapter_props(&changed);
                } else if interface == DEVICE_INTERFACE {
                    if let Some(address) = self.parse_device_path(&object) {
                        self.apply_device_props(address, &changed, false);
                    }
                }
            }
        }
    }
}

/// D-Bus object path of the device with the given address.
///
/// The adapter name is validated at construction, so the formatted path
/// contains no characters invalid in a D-Bus path.
fn device_path(adapter_name: &str, address: BleAddress) -> Path<'static> {
    let path = format!("{}{}/dev_{}", PREFIX, adapter_name, address.to_string().replace(':', "_"));
    Path::new(path).unwrap()
}

/// Extracts the device address from a D-Bus device object path.
fn parse_device_path(adapter_name: &str, path: &Path) -> Option<BleAddress> {
    let suffix = path.strip_prefix(PREFIX)?.strip_prefix(adapter_name)?;
    suffix.strip_prefix("/dev_")?.replace('_', ":").parse().ok()
}

/// Interface to a Bluetooth adapter managed by the BlueZ daemon.
pub struct BluezAdapter {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for BluezAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BluezAdapter {{ name: {} }}", self.inner.name)
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl BluezAdapter {
    /// Creates the backend for the adapter with the given name (for
    /// example `hci0`), seeding the cache from the daemon's current
    /// object tree. Adapter events are delivered over `events_tx`.
    pub async fn new(
        session: &Session, adapter_name: &str, events_tx: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<Self> {
        let dbus_path = Path::new(format!("{}{}", PREFIX, adapter_name))
            .map_err(|_| Error::with_message(ErrorKind::InvalidArguments, adapter_name.to_string()))?;

        let inner = Arc::new(Inner {
            connection: session.connection(),
            dbus_path,
            name: adapter_name.to_string(),
            cache: Mutex::new(Cache::default()),
            events_tx,
        });

        // subscribe before seeding so no event can fall into the gap
        let mut events = session.events().await?;

        for (path, interfaces) in session.all_objects().await? {
            if path == inner.dbus_path {
                if let Some(props) = interfaces.get(INTERFACE) {
                    inner.cache().available = true;
                    inner.apply_adapter_props(props);
                }
            } else if let Some(address) = inner.parse_device_path(&path) {
                if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                    inner.apply_device_props(address, props, true);
                }
            }
        }

        if !inner.cache().available {
            log::warn!("bluetooth adapter {adapter_name} is not present (yet)");
        }

        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                pump_inner.handle_object_event(event);
            }
            log::warn!("lost connection to the bluetooth daemon");
        });

        Ok(Self { inner, pump })
    }
}

impl Adapter for BluezAdapter {
    fn is_available(&self) -> bool {
        self.inner.cache().available
    }

    fn is_powered(&self) -> bool {
        self.inner.cache().powered
    }

    fn is_discovering(&self) -> bool {
        self.inner.cache().discovering
    }

    fn start_discovery(&self, pairing_code: Option<u8>) -> Result<()> {
        match pairing_code {
            Some(code) => log::info!("starting discovery for pairing code {code:03}"),
            None => log::info!("starting discovery"),
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let proxy = inner.proxy();

            let mut filter = PropMap::new();
            filter.insert("Transport".to_string(), dbus::arg::Variant(Box::new("le".to_string()) as Box<_>));
            filter.insert("DuplicateData".to_string(), dbus::arg::Variant(Box::new(false) as Box<_>));
            let result: std::result::Result<(), dbus::Error> =
                proxy.method_call(INTERFACE, "SetDiscoveryFilter", (filter,)).await;
            if let Err(err) = result {
                log::warn!("failed to set discovery filter: {err}");
            }

            let result: std::result::Result<(), dbus::Error> =
                proxy.method_call(INTERFACE, "StartDiscovery", ()).await;
            if let Err(err) = result {
                log::warn!("failed to start discovery: {err}");
            }
        });
        Ok(())
    }

    fn stop_discovery(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result: std::result::Result<(), dbus::Error> =
                inner.proxy().method_call(INTERFACE, "StopDiscovery", ()).await;
            if let Err(err) = result {
                log::warn!("failed to stop discovery: {err}");
            }
        });
        Ok(())
    }

    fn is_pairable(&self) -> bool {
        self.inner.cache().pairable
    }

    fn enable_pairable(&self, timeout: Duration) -> Result<()> {
        log::info!("enabling pairable mode for {}s", timeout.as_secs());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let proxy = inner.proxy();
            if let Err(err) = proxy.set(INTERFACE, "PairableTimeout", timeout.as_secs() as u32).await {
                log::warn!("failed to set pairable timeout: {err}");
            }
            if let Err(err) = proxy.set(INTERFACE, "Pairable", true).await {
                log::warn!("failed to enable pairable mode: {err}");
            }
        });
        Ok(())
    }

    fn disable_pairable(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.proxy().set(INTERFACE, "Pairable", false).await {
                log::warn!("failed to disable pairable mode: {err}");
            }
        });
        Ok(())
    }

    fn paired_devices(&self) -> BTreeSet<BleAddress> {
        self.inner.cache().devices.iter().filter(|(_, d)| d.paired).map(|(&a, _)| a).collect()
    }

    fn device_names(&self) -> BTreeMap<BleAddress, String> {
        self.inner.cache().devices.iter().map(|(&a, d)| (a, d.name.clone())).collect()
    }

    fn is_device_paired(&self, address: BleAddress) -> bool {
        self.inner.cache().devices.get(&address).map(|d| d.paired).unwrap_or(false)
    }

    fn add_device(&self, address: BleAddress) -> Result<()> {
        if !self.inner.cache().devices.contains_key(&address) {
            return Err(Error::with_message(ErrorKind::NotFound, address.to_string()));
        }

        log::info!("requesting bluez to pair {address}");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result: std::result::Result<(), dbus::Error> =
                inner.device_proxy(address).method_call(DEVICE_INTERFACE, "Pair", ()).await;
            if let Err(err) = result {
                log::warn!("pair request for {address} failed: {err}");
            }
        });
        Ok(())
    }

    fn remove_device(&self, address: BleAddress) -> Result<()> {
        if !self.inner.cache().devices.contains_key(&address) {
            return Err(Error::with_message(ErrorKind::NotFound, address.to_string()));
        }

        log::info!("requesting bluez to remove {address}");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let path = device_path(&inner.name, address);
            let result: std::result::Result<(), dbus::Error> =
                inner.proxy().method_call(INTERFACE, "RemoveDevice", (path,)).await;
            if let Err(err) = result {
                log::warn!("remove request for {address} failed: {err}");
            }
        });
        Ok(())
    }

    fn device(&self, address: BleAddress) -> Option<RcuDevice> {
        self.inner.cache().devices.get(&address).map(|d| RcuDevice {
            address,
            name: d.name.clone(),
            paired: d.paired,
            connected: d.connected,
            ready: d.ready,
            ready_since: d.ready_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_round_trip() {
        let address: BleAddress = "1C:A2:B1:40:50:60".parse().unwrap();
        let path = device_path("hci0", address);
        assert_eq!(&*path, "/org/bluez/hci0/dev_1C_A2_B1_40_50_60");
        assert_eq!(parse_device_path("hci0", &path), Some(address));
    }

    #[test]
    fn foreign_paths_are_not_device_paths() {
        assert_eq!(parse_device_path("hci0", &Path::new("/org/bluez/hci0").unwrap()), None);
        assert_eq!(
            parse_device_path("hci0", &Path::new("/org/bluez/hci1/dev_1C_A2_B1_40_50_60").unwrap()),
            None
        );
        assert_eq!(parse_device_path("hci0", &Path::new("/org/bluez/hci0/dev_bogus").unwrap()), None);
    }
}
