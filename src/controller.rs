//! RCU controller.
//!
//! Orchestrates the pairing and scanner state machines and maintains the
//! set of managed devices, enforcing the device count cap by evicting the
//! device that has been ready the longest.
//!
//! The controller and both machines run on a single control-plane task:
//! every stimulus (adapter event, timer expiry, queued internal step)
//! arrives as a [ControlMsg] over one queue and is handled to completion
//! before the next. Reactions that would re-enter the adapter from within
//! an event handler are posted back onto the queue instead of being run
//! inline.

use futures::{channel::mpsc, StreamExt};
use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use crate::{
    adapter::{Adapter, AdapterEvent, RcuDevice},
    config::Config,
    pairing::{self, PairingStateMachine},
    scanner::{self, ScannerStateMachine},
    timer::EventTimer,
    BleAddress, Error, ErrorKind, Result,
};

/// Maximum number of devices kept in the managed set.
const MAX_MANAGED_DEVICES: usize = 1;

/// Delay before the controller reports itself initialised when the
/// adapter is already powered at start-up.
const INITIALISED_DELAY: Duration = Duration::from_secs(1);

/// Externally visible controller state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum State {
    /// Waiting for the adapter to power up.
    Initialising,
    /// Ready for pairing or scanning requests.
    Idle,
    /// A scan is in progress.
    Searching,
    /// A pairing attempt is in progress.
    Pairing,
    /// The last pairing attempt succeeded.
    Complete,
    /// The last pairing or scanning attempt failed.
    Failed,
}

/// Notification published to controller clients.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ControllerEvent {
    /// A device joined the managed set.
    ManagedDeviceAdded(BleAddress),
    /// A device left the managed set.
    ManagedDeviceRemoved(BleAddress),
    /// Scanning started or stopped.
    ScanningStateChanged(bool),
    /// Pairing started or stopped.
    PairingStateChanged(bool),
    /// The controller state changed.
    StateChanged(State),
}

/// A stimulus for the control-plane loop.
#[derive(Debug)]
#[non_exhaustive]
pub enum ControlMsg {
    /// An event from the Bluetooth adapter.
    Adapter(AdapterEvent),
    /// A pairing phase timer expired.
    PairingTimeout(pairing::TimeoutKind),
    /// A scanner timer expired.
    ScannerTimeout(scanner::TimeoutKind),
    /// Queued pairing machine outcome.
    PairingStarted,
    /// Queued pairing machine outcome (success).
    PairingFinished,
    /// Queued pairing machine outcome (failure).
    PairingFailed,
    /// Queued scanner machine outcome.
    ScannerStarted,
    /// Queued scanner machine outcome.
    ScannerFinished,
    /// Queued scanner machine outcome (no match).
    ScannerFailed,
    /// The scanner found an RCU in pairing mode.
    FoundPairableDevice(BleAddress, String),
    /// Re-synchronise the managed set with the adapter.
    SyncManagedDevices,
    /// Deferred eviction pass over the managed set.
    RemoveLastConnectedDevice,
    /// The start-up grace period after power-on elapsed.
    Initialised,
}

/// Orchestrates pairing and scanning of RCU devices.
pub struct Controller {
    adapter: Arc<dyn Adapter>,
    pairing: PairingStateMachine,
    scanner: ScannerStateMachine,

    managed: BTreeSet<BleAddress>,
    supported_filter_bytes: BTreeSet<u8>,
    max_managed: usize,

    state: State,
    last_error: Option<Error>,

    tx: mpsc::UnboundedSender<ControlMsg>,
    subscribers: Vec<mpsc::UnboundedSender<ControllerEvent>>,
    init_timer: EventTimer,
}

impl Controller {
    /// Creates the controller. `tx` must be the sender side of the queue
    /// later drained by [run](Self::run).
    pub fn new(config: &Config, adapter: Arc<dyn Adapter>, tx: mpsc::UnboundedSender<ControlMsg>) -> Self {
        let supported_filter_bytes =
            config.enabled_models().flat_map(|m| m.filter_bytes.iter().copied()).collect();

        let pairing = PairingStateMachine::new(config, adapter.clone(), tx.clone());
        let scanner = ScannerStateMachine::new(config, adapter.clone(), tx.clone());

        let mut controller = Self {
            adapter,
            pairing,
            scanner,
            managed: BTreeSet::new(),
            supported_filter_bytes,
            max_managed: MAX_MANAGED_DEVICES,
            state: State::Initialising,
            last_error: None,
            tx,
            subscribers: Vec::new(),
            init_timer: EventTimer::new(),
        };

        // synchronise the managed set on the next turn of the loop
        let _ = controller.tx.unbounded_send(ControlMsg::SyncManagedDevices);

        // if the adapter is already powered the power-on event will never
        // arrive, so schedule the initialised transition ourselves
        if controller.adapter.is_powered() {
            controller.init_timer.start(INITIALISED_DELAY, controller.tx.clone(), ControlMsg::Initialised);
        }

        controller
    }

    /// Subscribes to controller notifications.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// The current controller state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The error of the last failed request.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Whether a pairing attempt is in progress.
    pub fn is_pairing(&self) -> bool {
        self.pairing.is_running()
    }

    /// Whether a scan is in progress.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_running()
    }

    /// The pairing code of the current or last IR triggered attempt.
    pub fn pairing_code(&self) -> Option<u8> {
        self.pairing.pairing_code()
    }

    /// Addresses of all managed devices.
    pub fn managed_devices(&self) -> BTreeSet<BleAddress> {
        self.managed.clone()
    }

    /// Snapshot of the managed device with the given address.
    pub fn managed_device(&self, address: BleAddress) -> Option<RcuDevice> {
        if !self.managed.contains(&address) {
            return None;
        }
        self.adapter.device(address)
    }

    /// Starts pairing for a device advertising the given IR pairing code.
    ///
    /// If a scan is running it is cancelled and the request fails busy;
    /// the client is expected to retry once scanning has stopped.
    pub fn start_pairing(&mut self, filter_byte: u8, pairing_code: u8) -> Result<()> {
        self.check_pairing_preconditions(filter_byte)?;
        self.pairing.start(filter_byte, pairing_code);
        self.drain_machine_signals();
        Ok(())
    }

    /// Starts pairing for a device whose address bytes sum to `mac_hash`.
    pub fn start_pairing_mac_hash(&mut self, filter_byte: u8, mac_hash: u8) -> Result<()> {
        self.check_pairing_preconditions(filter_byte)?;
        self.pairing.start_mac_hash(filter_byte, mac_hash);
        self.drain_machine_signals();
        Ok(())
    }

    fn check_pairing_preconditions(&mut self, filter_byte: u8) -> Result<()> {
        // a pairing request can only arrive from an IR event, so a running
        // scan has to be wound down before the client retries
        if self.scanner.is_running() {
            self.scanner.cancel();
            self.drain_machine_signals();
            log::warn!("received IR pairing request in scanning mode, disabling scanner");
            return self.fail(Error::with_message(ErrorKind::Busy, "Scanning in progress, retry"));
        }

        if filter_byte != 0x00 && !self.supported_filter_bytes.contains(&filter_byte) {
            log::debug!("IR filter byte 0x{filter_byte:02x} from RCU not supported");
            return self.fail(Error::with_message(ErrorKind::Rejected, "Unsupported filter byte value"));
        }

        if self.pairing.is_running() {
            log::debug!("requested pairing in already pairing state, ignoring request");
            return self.fail(Error::with_message(ErrorKind::Busy, "Already in pairing state"));
        }

        if !self.adapter.is_available() || !self.adapter.is_powered() {
            return self.fail(Error::with_message(ErrorKind::General, "Adaptor not available or not powered"));
        }

        Ok(())
    }

    /// Cancels a running pairing attempt. Returns `false` if none was
    /// running.
    pub fn cancel_pairing(&mut self) -> bool {
        if !self.pairing.is_running() {
            return false;
        }
        self.pairing.cancel();
        self.drain_machine_signals();
        true
    }

    /// Starts a timed scan for RCUs in pairing mode.
    pub fn start_scanning(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.pairing.is_running() {
            log::warn!("currently performing pairing, cannot start new scan");
            return self.fail(Error::with_message(ErrorKind::Busy, "Pairing in progress"));
        }

        if self.scanner.is_running() {
            log::warn!("already scanning, new scan request aborted");
            return self.fail(Error::with_message(ErrorKind::Busy, "Already scanning"));
        }

        if !self.adapter.is_available() || !self.adapter.is_powered() {
            return self.fail(Error::with_message(ErrorKind::General, "Adaptor not available or not powered"));
        }

        self.set_state(State::Searching);
        self.scanner.start(timeout);
        self.drain_machine_signals();
        Ok(())
    }

    /// Cancels a running scan. Returns `false` if none was running.
    pub fn cancel_scanning(&mut self) -> bool {
        if !self.scanner.is_running() {
            return false;
        }
        self.scanner.cancel();
        self.drain_machine_signals();
        true
    }

    /// Asks the adapter to unpair a managed device. The managed set
    /// shrinks when the resulting pairing change event arrives.
    pub fn unpair_device(&mut self, address: BleAddress) -> Result<()> {
        if !self.managed.contains(&address) {
            return self.fail(Error::with_message(ErrorKind::NotFound, address.to_string()));
        }
        self.adapter.remove_device(address)
    }

    fn fail(&mut self, error: Error) -> Result<()> {
        self.last_error = Some(error.clone());
        Err(error)
    }

    /// Drains the control queue forever.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
        while let Some(msg) = rx.next().await {
            self.handle(msg);
        }
        log::info!("controller shut down");
    }

    /// Handles one control-plane stimulus.
    pub fn handle(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Adapter(event) => self.handle_adapter_event(event),
            ControlMsg::PairingTimeout(kind) => {
                self.pairing.handle_timeout(kind);
                self.drain_machine_signals();
            }
            ControlMsg::ScannerTimeout(kind) => {
                self.scanner.handle_timeout(kind);
                self.drain_machine_signals();
            }
            ControlMsg::PairingStarted => {
                self.emit(ControllerEvent::PairingStateChanged(true));
                self.set_state(State::Pairing);
            }
            ControlMsg::PairingFinished => {
                self.on_pairing_ended(State::Complete);
            }
            ControlMsg::PairingFailed => {
                self.on_pairing_ended(State::Failed);
            }
            ControlMsg::ScannerStarted => {
                self.emit(ControllerEvent::ScanningStateChanged(true));
            }
            ControlMsg::ScannerFinished => {
                self.emit(ControllerEvent::ScanningStateChanged(false));
            }
            ControlMsg::ScannerFailed => {
                self.set_state(State::Failed);
            }
            ControlMsg::FoundPairableDevice(address, name) => {
                self.on_found_pairable_device(address, &name);
            }
            ControlMsg::SyncManagedDevices => self.sync_managed_devices(),
            ControlMsg::RemoveLastConnectedDevice => self.remove_last_connected_device(),
            ControlMsg::Initialised => {
                if self.state == State::Initialising {
                    self.set_state(State::Idle);
                }
            }
        }
    }

    fn handle_adapter_event(&mut self, event: AdapterEvent) {
        self.pairing.handle_adapter_event(&event);
        self.scanner.handle_adapter_event(&event);

        match &event {
            AdapterEvent::PoweredChanged(true) => {
                if self.state == State::Initialising {
                    self.set_state(State::Idle);
                }
            }
            AdapterEvent::DevicePairingChanged { address, paired } => {
                if !paired && self.managed.remove(address) {
                    // remove immediately even while pairing is running, so
                    // re-pairing the same device produces a removed/added
                    // notification pair
                    self.emit(ControllerEvent::ManagedDeviceRemoved(*address));
                }
                if !self.pairing.is_running() {
                    self.sync_managed_devices();
                }
            }
            AdapterEvent::DeviceReadyChanged { ready: true, .. } => {
                if !self.pairing.is_running() {
                    self.sync_managed_devices();
                }
            }
            _ => {}
        }

        self.drain_machine_signals();
    }

    /// Converts accumulated state machine signals into queued control
    /// messages, handled on the next turn of the loop.
    fn drain_machine_signals(&mut self) {
        for signal in self.pairing.take_signals() {
            let msg = match signal {
                pairing::Signal::Started => ControlMsg::PairingStarted,
                pairing::Signal::Finished => ControlMsg::PairingFinished,
                pairing::Signal::Failed => ControlMsg::PairingFailed,
            };
            let _ = self.tx.unbounded_send(msg);
        }

        for signal in self.scanner.take_signals() {
            let msg = match signal {
                scanner::Signal::Started => ControlMsg::ScannerStarted,
                scanner::Signal::FoundPairableDevice(address, name) => {
                    ControlMsg::FoundPairableDevice(address, name)
                }
                scanner::Signal::Failed => ControlMsg::ScannerFailed,
                scanner::Signal::Finished => ControlMsg::ScannerFinished,
            };
            let _ = self.tx.unbounded_send(msg);
        }
    }

    fn on_pairing_ended(&mut self, state: State) {
        let pairing = self.pairing.is_running();
        if !pairing {
            self.sync_managed_devices();
        }
        self.emit(ControllerEvent::PairingStateChanged(pairing));
        self.set_state(state);
    }

    fn on_found_pairable_device(&mut self, address: BleAddress, name: &str) {
        log::info!("found {address} RCU device in pairing mode, kicking off the pairing state machine");

        if self.pairing.is_running() {
            log::warn!("found target device in scan but pairing state machine already running?");
            return;
        }

        self.pairing.start_with_target(address, name);
        self.drain_machine_signals();
    }

    /// Reconciles the managed set against the adapter's paired devices.
    ///
    /// Runs at start-up, when a device pairs or unpairs outside a pairing
    /// attempt, when a device becomes ready outside a pairing attempt and
    /// when a pairing attempt finishes.
    fn sync_managed_devices(&mut self) {
        let paired = self.adapter.paired_devices();

        let removed: Vec<BleAddress> = self.managed.difference(&paired).copied().collect();
        log::debug!("removed {removed:?}");
        for address in removed {
            self.managed.remove(&address);
            self.emit(ControllerEvent::ManagedDeviceRemoved(address));
        }

        let added: Vec<BleAddress> = paired.difference(&self.managed).copied().collect();
        log::debug!("added {added:?}");
        for address in added {
            self.managed.insert(address);
            self.emit(ControllerEvent::ManagedDeviceAdded(address));
        }

        // evict on the next turn of the loop rather than re-entering the
        // adapter from inside an event handler
        if self.managed.len() > self.max_managed {
            let _ = self.tx.unbounded_send(ControlMsg::RemoveLastConnectedDevice);
        }
    }

    /// Unpairs devices until the managed set fits the cap, oldest ready
    /// first. The pairing change events triggered by the removals shrink
    /// the managed set.
    fn remove_last_connected_device(&mut self) {
        let mut devices: Vec<RcuDevice> =
            self.managed.iter().filter_map(|address| self.adapter.device(*address)).filter(|d| d.paired).collect();
        devices.sort_by_key(|d| d.ready_since);

        while devices.len() > self.max_managed {
            let device = devices.remove(0);
            log::info!(
                "unpairing {} (ready for {:?}) because exceeded maximum number of managed devices",
                device.address,
                device.since_ready()
            );
            if let Err(err) = self.adapter.remove_device(device.address) {
                log::warn!("failed to remove {}: {err}", device.address);
            }
        }
    }

    fn emit(&mut self, event: ControllerEvent) {
        self.subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            log::info!("controller state {} -> {state}", self.state);
            self.state = state;
            self.emit(ControllerEvent::StateChanged(state));
        }
    }
}
