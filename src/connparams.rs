//! Bluetooth LE connection parameter management.
//!
//! Normally the remote device chooses the parameters of its connection.
//! For the managed RCU models that choice is not always compatible with
//! low-latency voice search, so this component watches connection and
//! parameter update events from the kernel HCI driver and, whenever a
//! link whose OUI has a configured target drifts away from it, requests a
//! connection update until the observed parameters converge.
//!
//! The component never disconnects a device; the worst case is a retry
//! loop bounded by the remote side disconnecting.

use futures::{channel::mpsc, StreamExt};
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    config::Config,
    hci::{HciCommands, HciEvent},
    timer::EventTimer,
    BleAddress, ConnectionParameters, Result,
};

/// Delay between a connection completing with off-target parameters and
/// the first update request. The remote usually requests its own update
/// shortly after connecting, which cancels this.
const POST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between an off-target parameter update and the next request.
const POST_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spacing of repeated update requests for a link that won't converge.
const RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay before the update requests for links found at start-up. The
/// kernel has no interface for reading the current parameters, so those
/// links are assumed to be off target.
const STARTUP_TRIGGER_TIMEOUT: Duration = Duration::from_secs(1);

/// A stimulus for the connection parameter manager.
#[derive(Debug)]
pub enum ConnParamMsg {
    /// An event from the HCI socket.
    Hci(HciEvent),
    /// The timer of the connection with the given handle expired.
    Timeout(u16),
}

/// State of one managed connection.
struct ConnParamDevice {
    handle: u16,
    address: BleAddress,
    desired: ConnectionParameters,
    params_ok: bool,
    timer: EventTimer,
}

impl ConnParamDevice {
    fn new(handle: u16, address: BleAddress, desired: ConnectionParameters) -> Self {
        Self { handle, address, desired, params_ok: false, timer: EventTimer::new() }
    }

    /// Checks if the supplied connection parameters are close enough to
    /// the desired values: the interval must lie within the desired
    /// range, the latency within 25 events and the supervision timeout
    /// within a second.
    fn close_enough(&self, params: &ConnectionParameters) -> bool {
        let interval = params.minimum_interval();
        if interval < self.desired.minimum_interval() || interval > self.desired.maximum_interval() {
            return false;
        }

        let latency_delta = i32::from(params.latency()) - i32::from(self.desired.latency());
        if latency_delta.abs() > 25 {
            return false;
        }

        let timeout_delta =
            i64::from(params.supervision_timeout()) - i64::from(self.desired.supervision_timeout());
        if timeout_delta.abs() > 1000 {
            return false;
        }

        true
    }

    /// Records the observed parameters; if they are off target the update
    /// timer is (re)armed with `delay`.
    fn evaluate(&mut self, params: &ConnectionParameters, delay: Duration, tx: &mpsc::UnboundedSender<ConnParamMsg>) {
        self.params_ok = self.close_enough(params);
        if self.params_ok {
            self.timer.stop();
        } else {
            log::info!(
                "{} ({}) connection params don't match the desired parameters, updating in {:.1}s",
                self.address,
                self.handle,
                delay.as_secs_f32()
            );
            self.timer.start(delay, tx.clone(), ConnParamMsg::Timeout(self.handle));
        }
    }

    /// Forces an update request in `delay`, regardless of what was
    /// observed so far.
    fn trigger_update(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<ConnParamMsg>) {
        self.params_ok = false;
        self.timer.start(delay, tx.clone(), ConnParamMsg::Timeout(self.handle));
    }

    /// Timer expiry: if the parameters are still off target, request an
    /// update and re-arm for the retry interval in case the request does
    /// not stick.
    fn on_timeout(&mut self, commands: &dyn HciCommands, tx: &mpsc::UnboundedSender<ConnParamMsg>) {
        if self.params_ok {
            return;
        }

        log::info!("{} ({}) requesting an update of connection parameters", self.address, self.handle);
        if let Err(err) = commands.request_connection_update(self.handle, &self.desired) {
            log::warn!("{} ({}) connection update request failed: {err}", self.address, self.handle);
        }

        self.timer.start(RETRY_TIMEOUT, tx.clone(), ConnParamMsg::Timeout(self.handle));
    }
}

/// Keeps the connection parameters of managed links converged to the
/// per-model targets from the configuration.
pub struct ConnParamManager {
    commands: Arc<dyn HciCommands>,
    desired: HashMap<u32, ConnectionParameters>,
    devices: HashMap<u16, ConnParamDevice>,
    tx: mpsc::UnboundedSender<ConnParamMsg>,
}

impl ConnParamManager {
    /// Creates the manager with the desired parameter map taken from the
    /// enabled models of the configuration. `tx` must be the sender side
    /// of the queue later drained by [run](Self::run).
    pub fn new(config: &Config, commands: Arc<dyn HciCommands>, tx: mpsc::UnboundedSender<ConnParamMsg>) -> Self {
        let desired: HashMap<u32, ConnectionParameters> =
            config.enabled_models().filter_map(|m| m.connection_params().map(|p| (m.oui, p))).collect();

        for (oui, params) in &desired {
            log::info!(
                "managing connection params for {:02X}:{:02X}:{:02X}:xx:xx:xx -> interval {}..{}ms latency {} timeout {}ms",
                (oui >> 16) as u8,
                (oui >> 8) as u8,
                *oui as u8,
                params.minimum_interval(),
                params.maximum_interval(),
                params.latency(),
                params.supervision_timeout()
            );
        }

        Self { commands, desired, devices: HashMap::new(), tx }
    }

    /// Enumerates the links that already exist and schedules an update
    /// request for every managed one. There is no way to read the current
    /// parameters from the driver, so they are assumed to be off target.
    pub fn start(&mut self) -> Result<()> {
        for info in self.commands.connected_devices()? {
            log::info!("found connected device {info}");

            let oui = info.address.oui();
            let Some(desired) = self.desired.get(&oui) else {
                log::info!("device {} doesn't require conn param management", info.address);
                continue;
            };

            let device = self
                .devices
                .entry(info.handle)
                .or_insert_with(|| ConnParamDevice::new(info.handle, info.address, *desired));
            device.trigger_update(STARTUP_TRIGGER_TIMEOUT, &self.tx);
        }
        Ok(())
    }

    /// Drains the manager queue forever.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConnParamMsg>) {
        while let Some(msg) = rx.next().await {
            self.handle(msg);
        }
        log::info!("connection parameter manager shut down");
    }

    /// Handles one stimulus.
    pub fn handle(&mut self, msg: ConnParamMsg) {
        match msg {
            ConnParamMsg::Hci(HciEvent::ConnectionCompleted { handle, address, params }) => {
                self.on_connection_completed(handle, address, &params);
            }
            ConnParamMsg::Hci(HciEvent::ConnectionUpdated { handle, params }) => {
                self.on_connection_updated(handle, &params);
            }
            ConnParamMsg::Hci(HciEvent::DisconnectionCompleted { handle, reason }) => {
                self.on_disconnection_completed(handle, reason);
            }
            ConnParamMsg::Timeout(handle) => {
                if let Some(device) = self.devices.get_mut(&handle) {
                    device.on_timeout(self.commands.as_ref(), &self.tx);
                }
            }
        }
    }

    fn on_connection_completed(&mut self, handle: u16, address: BleAddress, params: &ConnectionParameters) {
        log::info!("{address} ({handle}) connected with params {params:?}");

        let Some(desired) = self.desired.get(&address.oui()) else {
            log::info!("connected device doesn't require conn param management");
            return;
        };

        let device =
            self.devices.entry(handle).or_insert_with(|| ConnParamDevice::new(handle, address, *desired));
        device.evaluate(params, POST_CONNECTION_TIMEOUT, &self.tx);
    }

    fn on_connection_updated(&mut self, handle: u16, params: &ConnectionParameters) {
        log::info!("connection parameters of handle {handle} changed to {params:?}");

        let Some(device) = self.devices.get_mut(&handle) else {
            log::info!("received a connection update event from unknown device with handle {handle}");
            return;
        };
        device.evaluate(params, POST_UPDATE_TIMEOUT, &self.tx);
    }

    fn on_disconnection_completed(&mut self, handle: u16, reason: crate::hci::HciStatus) {
        log::info!("connection with handle {handle} has disconnected due to {reason}");

        if self.devices.remove(&handle).is_none() {
            log::info!("received a disconnection event from unknown device with handle {handle}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{ConnectedDevice, HciStatus};
    use std::sync::Mutex;

    const CONFIG: &str = r#"{
        "models": [ {
            "name": "EC05x",
            "oui": "1C:A2:B1",
            "pairingNameFormat": "U%03hhu*",
            "scanNameFormat": "U*",
            "connectionParams": {
                "minInterval": 15.0,
                "maxInterval": 15.0,
                "latency": 332,
                "supervisionTimeout": 15000
            },
            "services": { "type": "dbus", "supported": [ "audio" ] }
        } ]
    }"#;

    #[derive(Default)]
    struct MockCommands {
        updates: Mutex<Vec<(u16, ConnectionParameters)>>,
        connected: Mutex<Vec<ConnectedDevice>>,
    }

    impl MockCommands {
        fn take_updates(&self) -> Vec<(u16, ConnectionParameters)> {
            std::mem::take(&mut self.updates.lock().unwrap())
        }
    }

    impl HciCommands for MockCommands {
        fn request_connection_update(&self, handle: u16, params: &ConnectionParameters) -> Result<()> {
            self.updates.lock().unwrap().push((handle, *params));
            Ok(())
        }

        fn connected_devices(&self) -> Result<Vec<ConnectedDevice>> {
            Ok(self.connected.lock().unwrap().clone())
        }
    }

    fn address() -> BleAddress {
        "1C:A2:B1:40:50:60".parse().unwrap()
    }

    fn manager() -> (ConnParamManager, Arc<MockCommands>, mpsc::UnboundedReceiver<ConnParamMsg>) {
        let config = Config::from_slice(CONFIG.as_bytes()).unwrap();
        let commands = Arc::new(MockCommands::default());
        let (tx, rx) = mpsc::unbounded();
        let manager = ConnParamManager::new(&config, commands.clone(), tx);
        (manager, commands, rx)
    }

    fn desired() -> ConnectionParameters {
        ConnectionParameters::new(15.0, 15.0, 332, 15000)
    }

    #[tokio::test]
    async fn off_target_connection_is_corrected_on_timeout() {
        let (mut manager, commands, _rx) = manager();

        // connects at 30 ms interval; latency and timeout on target
        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x40,
            address: address(),
            params: ConnectionParameters::new(30.0, 30.0, 332, 15000),
        }));
        assert!(commands.take_updates().is_empty());

        manager.handle(ConnParamMsg::Timeout(0x40));
        assert_eq!(commands.take_updates(), vec![(0x40, desired())]);

        // the update lands on target; no further requests on later timers
        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionUpdated {
            handle: 0x40,
            params: ConnectionParameters::new(15.0, 15.0, 332, 15000),
        }));
        manager.handle(ConnParamMsg::Timeout(0x40));
        assert!(commands.take_updates().is_empty());
    }

    #[tokio::test]
    async fn on_target_connection_arms_no_timer() {
        let (mut manager, _commands, mut rx) = manager();

        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x40,
            address: address(),
            params: desired(),
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_next().is_err());
        assert!(manager.devices.get(&0x40).unwrap().params_ok);
    }

    #[tokio::test]
    async fn unmanaged_oui_is_left_alone() {
        let (mut manager, _commands, _rx) = manager();

        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x41,
            address: "AA:BB:CC:11:22:33".parse().unwrap(),
            params: ConnectionParameters::new(30.0, 30.0, 0, 5000),
        }));
        assert!(manager.devices.is_empty());
    }

    #[tokio::test]
    async fn disconnect_destroys_the_record() {
        let (mut manager, commands, _rx) = manager();

        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x40,
            address: address(),
            params: ConnectionParameters::new(30.0, 30.0, 332, 15000),
        }));
        assert_eq!(manager.devices.len(), 1);

        manager.handle(ConnParamMsg::Hci(HciEvent::DisconnectionCompleted {
            handle: 0x40,
            reason: HciStatus(0x13),
        }));
        assert!(manager.devices.is_empty());

        // a stale timer message for the dead handle is a no-op
        manager.handle(ConnParamMsg::Timeout(0x40));
        assert!(commands.take_updates().is_empty());
    }

    #[tokio::test]
    async fn startup_schedules_updates_for_managed_links() {
        let (mut manager, commands, _rx) = manager();
        *commands.connected.lock().unwrap() = vec![
            ConnectedDevice { handle: 0x10, address: address(), state: 1, link_mode: 0 },
            ConnectedDevice { handle: 0x11, address: "AA:BB:CC:11:22:33".parse().unwrap(), state: 1, link_mode: 0 },
        ];

        manager.start().unwrap();
        assert_eq!(manager.devices.len(), 1);

        manager.handle(ConnParamMsg::Timeout(0x10));
        assert_eq!(commands.take_updates(), vec![(0x10, desired())]);
    }

    #[tokio::test(start_paused = true)]
    async fn post_connection_timer_fires_after_thirty_seconds() {
        let (mut manager, _commands, mut rx) = manager();

        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x40,
            address: address(),
            params: ConnectionParameters::new(30.0, 30.0, 332, 15000),
        }));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_next().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.try_next() {
            Ok(Some(ConnParamMsg::Timeout(0x40))) => {}
            other => panic!("expected timeout for handle 0x40, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tolerances_are_honoured() {
        let (mut manager, _commands, _rx) = manager();
        manager.handle(ConnParamMsg::Hci(HciEvent::ConnectionCompleted {
            handle: 0x40,
            address: address(),
            params: desired(),
        }));
        let device = manager.devices.get(&0x40).unwrap();

        // latency within 25 events either way
        assert!(device.close_enough(&ConnectionParameters::new(15.0, 15.0, 307, 15000)));
        assert!(device.close_enough(&ConnectionParameters::new(15.0, 15.0, 357, 15000)));
        assert!(!device.close_enough(&ConnectionParameters::new(15.0, 15.0, 306, 15000)));
        assert!(!device.close_enough(&ConnectionParameters::new(15.0, 15.0, 358, 15000)));

        // supervision timeout within a second either way
        assert!(device.close_enough(&ConnectionParameters::new(15.0, 15.0, 332, 14000)));
        assert!(device.close_enough(&ConnectionParameters::new(15.0, 15.0, 332, 16000)));
        assert!(!device.close_enough(&ConnectionParameters::new(15.0, 15.0, 332, 13990)));
        assert!(!device.close_enough(&ConnectionParameters::new(15.0, 15.0, 332, 16010)));

        // interval must lie inside the desired range
        assert!(!device.close_enough(&ConnectionParameters::new(16.0, 16.0, 332, 15000)));
        assert!(!device.close_enough(&ConnectionParameters::new(10.0, 10.0, 332, 15000)));
    }
}
