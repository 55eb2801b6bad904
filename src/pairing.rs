//! Pairing state machine.
//!
//! Drives a single pairing attempt from an IR or scanner trigger through
//! discovery, bonding and service setup, or through un-pairing on failure.
//! The nested state layout:
//!
//! ```text
//! Running
//!   Discovery
//!     StartingDiscovery
//!     Discovering
//!   StoppingDiscovery
//!   PairingPhase
//!     EnablePairable
//!     Bonding
//!     Setup
//!   Unpairing
//!   StoppingExternalDiscovery
//! Finished
//! ```
//!
//! Every phase is guarded by a timeout. A timeout during bonding or setup
//! rolls back through the un-pairing state; a timeout during discovery
//! finishes the attempt directly. Loss of adapter power finishes the
//! attempt from any state.

use futures::channel::mpsc;
use regex::Regex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::{
    adapter::{Adapter, AdapterEvent},
    config::Config,
    controller::ControlMsg,
    statemachine::{self, StateMachine},
    timer::EventTimer,
    BleAddress,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Running,
    Discovery,
    StartingDiscovery,
    Discovering,
    StoppingDiscovery,
    PairingPhase,
    EnablePairable,
    Bonding,
    Setup,
    Unpairing,
    StoppingExternalDiscovery,
    Finished,
}

impl statemachine::State for State {
    fn parent(self) -> Option<Self> {
        match self {
            State::Discovery
            | State::StoppingDiscovery
            | State::PairingPhase
            | State::Unpairing
            | State::StoppingExternalDiscovery => Some(State::Running),
            State::StartingDiscovery | State::Discovering => Some(State::Discovery),
            State::EnablePairable | State::Bonding | State::Setup => Some(State::PairingPhase),
            State::Running | State::Finished => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    DiscoveryStarted,
    DiscoveryStopped,
    DiscoveryStartTimeout,
    DiscoveryStopTimeout,
    PairableEnabled,
    PairableDisabled,
    PairingTimeout,
    SetupTimeout,
    UnpairingTimeout,
    DeviceFound,
    DeviceUnpaired,
    DeviceRemoved,
    DevicePaired,
    DeviceReady,
    AdapterPoweredOff,
    CancelRequest,
}

const TRANSITIONS: &[(State, Event, State)] = &[
    (State::Running, Event::AdapterPoweredOff, State::Finished),
    (State::StartingDiscovery, Event::DiscoveryStarted, State::Discovering),
    (State::Discovery, Event::DeviceFound, State::StoppingDiscovery),
    (State::Discovery, Event::DiscoveryStartTimeout, State::Finished),
    (State::Discovery, Event::DiscoveryStopped, State::Finished),
    (State::Discovery, Event::CancelRequest, State::Finished),
    (State::StoppingDiscovery, Event::DiscoveryStopped, State::EnablePairable),
    (State::StoppingDiscovery, Event::DiscoveryStopTimeout, State::Finished),
    (State::StoppingDiscovery, Event::CancelRequest, State::Finished),
    (State::EnablePairable, Event::PairableEnabled, State::Bonding),
    (State::EnablePairable, Event::CancelRequest, State::Finished),
    (State::Bonding, Event::PairableDisabled, State::Unpairing),
    (State::Bonding, Event::DevicePaired, State::Setup),
    (State::Bonding, Event::CancelRequest, State::Unpairing),
    (State::Setup, Event::CancelRequest, State::Unpairing),
    (State::PairingPhase, Event::DeviceReady, State::Finished),
    (State::PairingPhase, Event::DeviceUnpaired, State::Finished),
    (State::PairingPhase, Event::DeviceRemoved, State::Finished),
    (State::PairingPhase, Event::PairingTimeout, State::Unpairing),
    (State::PairingPhase, Event::SetupTimeout, State::Unpairing),
    (State::Unpairing, Event::DeviceUnpaired, State::Finished),
    (State::Unpairing, Event::DeviceRemoved, State::Finished),
    (State::Unpairing, Event::UnpairingTimeout, State::Finished),
    (State::StoppingExternalDiscovery, Event::DiscoveryStopped, State::StartingDiscovery),
];

/// Which pairing phase timer has expired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutKind {
    /// The discovery phase timer.
    Discovery,
    /// The pairing phase timer, armed when discovery stops.
    Pairing,
    /// The service setup timer.
    Setup,
    /// The un-pairing rollback timer.
    Unpairing,
}

/// Outcome notifications for the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Signal {
    Started,
    Finished,
    Failed,
}

/// State machine driving one pairing attempt.
pub struct PairingStateMachine {
    machine: StateMachine<State, Event>,
    adapter: Arc<dyn Adapter>,
    tx: mpsc::UnboundedSender<ControlMsg>,

    discovery_timeout: Duration,
    pairing_timeout: Duration,
    setup_timeout: Duration,
    unpairing_timeout: Duration,
    discovery_timer: EventTimer,
    pairing_timer: EventTimer,
    setup_timer: EventTimer,
    unpairing_timer: EventTimer,

    /// Pairing name formats of the enabled models, keyed by OUI.
    name_formats: BTreeMap<u32, String>,
    /// Name matchers for the current attempt, keyed by OUI.
    matchers: BTreeMap<u32, Regex>,
    /// All name matchers of the current attempt, for devices whose OUI is
    /// not in the table.
    supported_names: Vec<Regex>,

    pairing_code: Option<u8>,
    pairing_mac_hash: Option<u8>,
    target: Option<BleAddress>,
    succeeded: bool,
    discovery_started_externally: bool,

    attempts: u32,
    successes: u32,
    signals: Vec<Signal>,
}

impl PairingStateMachine {
    pub(crate) fn new(config: &Config, adapter: Arc<dyn Adapter>, tx: mpsc::UnboundedSender<ControlMsg>) -> Self {
        let name_formats =
            config.enabled_models().map(|m| (m.oui, m.pairing_name_format.clone())).collect();

        Self {
            machine: StateMachine::new("pairing", TRANSITIONS, State::StartingDiscovery, State::Finished),
            adapter,
            tx,
            discovery_timeout: config.timeouts.discovery(),
            pairing_timeout: config.timeouts.pair(),
            setup_timeout: config.timeouts.setup(),
            unpairing_timeout: config.timeouts.unpair(),
            discovery_timer: EventTimer::new(),
            pairing_timer: EventTimer::new(),
            setup_timer: EventTimer::new(),
            unpairing_timer: EventTimer::new(),
            name_formats,
            matchers: BTreeMap::new(),
            supported_names: Vec::new(),
            pairing_code: None,
            pairing_mac_hash: None,
            target: None,
            succeeded: false,
            discovery_started_externally: false,
            attempts: 0,
            successes: 0,
            signals: Vec::new(),
        }
    }

    /// Whether an attempt is in progress.
    pub fn is_running(&self) -> bool {
        self.machine.is_running()
    }

    /// The pairing code of the current or last attempt, if it was started
    /// from an IR pairing event.
    pub fn pairing_code(&self) -> Option<u8> {
        self.pairing_code
    }

    /// Number of attempts started since the daemon came up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Number of attempts that reached the ready state.
    pub fn successes(&self) -> u32 {
        self.successes
    }

    /// Takes the signals emitted since the last call.
    pub(crate) fn take_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    /// Starts an attempt searching for a device whose name encodes the
    /// given pairing code.
    pub(crate) fn start(&mut self, _filter_byte: u8, pairing_code: u8) {
        if self.machine.is_running() {
            log::warn!("pairing state machine already running");
            return;
        }

        self.target = None;
        self.pairing_code = Some(pairing_code);
        self.pairing_mac_hash = None;

        self.matchers.clear();
        self.supported_names.clear();
        for (&oui, format) in &self.name_formats {
            let Some(matcher) = crate::config::wildcard_matcher(&crate::config::expand_name_format(format, pairing_code))
            else {
                continue;
            };
            log::info!(
                "pairing name match for {:02X}:{:02X}:{:02X}:xx:xx:xx is '{}'",
                (oui >> 16) as u8,
                (oui >> 8) as u8,
                oui as u8,
                matcher.as_str()
            );
            self.matchers.insert(oui, matcher.clone());
            self.supported_names.push(matcher);
        }

        self.launch();
        log::info!("started pairing using code {pairing_code:03}");
    }

    /// Starts an attempt searching for a device whose address bytes sum to
    /// the given hash.
    pub(crate) fn start_mac_hash(&mut self, _filter_byte: u8, mac_hash: u8) {
        if self.machine.is_running() {
            log::warn!("pairing state machine already running");
            return;
        }

        self.target = None;
        self.pairing_code = None;
        self.pairing_mac_hash = Some(mac_hash);
        self.matchers.clear();
        self.supported_names.clear();

        self.launch();
        log::info!("started pairing, searching for device with MAC hash 0x{mac_hash:02X}");
    }

    /// Starts an attempt with a pre-resolved target device; discovery
    /// short-circuits through the pre-scan of known device names.
    pub(crate) fn start_with_target(&mut self, target: BleAddress, name: &str) {
        if self.machine.is_running() {
            log::warn!("pairing state machine already running");
            return;
        }

        self.target = Some(target);
        self.pairing_code = None;
        self.pairing_mac_hash = None;

        self.matchers.clear();
        self.supported_names.clear();
        if let Some(matcher) = crate::config::wildcard_matcher(name) {
            self.matchers.insert(target.oui(), matcher.clone());
            self.supported_names.push(matcher);
        }

        self.launch();
        log::info!("started pairing targeting {target}");
    }

    fn launch(&mut self) {
        self.succeeded = false;
        self.attempts += 1;
        let entered = self.machine.start();
        for state in entered {
            self.on_enter(state);
        }
        self.run_machine();
    }

    /// Requests the attempt to stop. The machine unwinds asynchronously;
    /// a bond in progress is rolled back through the un-pairing state.
    pub(crate) fn cancel(&mut self) {
        if !self.machine.is_running() {
            return;
        }
        log::info!("cancelling pairing");
        self.machine.post(Event::CancelRequest);
        self.run_machine();
    }

    pub(crate) fn handle_adapter_event(&mut self, event: &AdapterEvent) {
        match event {
            AdapterEvent::DiscoveryChanged(discovering) => {
                if !self.machine.is_running() {
                    // remember the externally controlled discovery state;
                    // the next attempt has to stop that discovery first
                    log::debug!("discovery changed to {discovering} while pairing machine is stopped");
                    self.discovery_started_externally = *discovering;
                    self.machine.set_initial_state(if *discovering {
                        State::StoppingExternalDiscovery
                    } else {
                        State::StartingDiscovery
                    });
                    return;
                }
                self.machine.post(if *discovering { Event::DiscoveryStarted } else { Event::DiscoveryStopped });
            }
            AdapterEvent::PairableChanged(pairable) => {
                if !self.machine.is_running() {
                    return;
                }
                if !pairable && self.machine.in_state(State::PairingPhase) {
                    log::warn!("adapter 'pairable' disabled before target device became ready");
                }
                self.machine.post(if *pairable { Event::PairableEnabled } else { Event::PairableDisabled });
            }
            AdapterEvent::DeviceFound { address, name } | AdapterEvent::DeviceNameChanged { address, name } => {
                if !self.machine.is_running() {
                    return;
                }
                log::debug!("device {address} '{name}' (target {:?})", self.target);
                self.process_device(*address, name);
            }
            AdapterEvent::DeviceRemoved { address } => {
                if !self.machine.is_running() {
                    return;
                }
                if self.target == Some(*address) {
                    self.machine.post(Event::DeviceRemoved);
                }
            }
            AdapterEvent::DevicePairingChanged { address, paired } => {
                if !self.machine.is_running() {
                    return;
                }
                if self.target == Some(*address) {
                    self.machine.post(if *paired { Event::DevicePaired } else { Event::DeviceUnpaired });
                }
            }
            AdapterEvent::DeviceReadyChanged { address, ready } => {
                if !self.machine.is_running() {
                    return;
                }
                if self.target == Some(*address) && *ready {
                    self.successes += 1;
                    self.succeeded = true;
                    self.machine.post(Event::DeviceReady);
                }
            }
            AdapterEvent::PoweredChanged(powered) => {
                if !self.machine.is_running() {
                    return;
                }
                if !powered {
                    self.machine.post(Event::AdapterPoweredOff);
                }
            }
        }
        self.run_machine();
    }

    pub(crate) fn handle_timeout(&mut self, kind: TimeoutKind) {
        if !self.machine.is_running() {
            return;
        }

        match kind {
            TimeoutKind::Discovery => {
                if self.machine.in_state(State::Discovery) {
                    if self.machine.in_state(State::StartingDiscovery) {
                        log::error!("timed-out waiting for discovery started signal");
                    } else {
                        log::warn!("timed-out in discovery phase (didn't find target rcu device to pair to)");
                    }
                    self.machine.post(Event::DiscoveryStartTimeout);
                }
            }
            TimeoutKind::Pairing => {
                if self.machine.in_state(State::StoppingDiscovery) {
                    log::error!("timed-out waiting for discovery to stop");
                    self.machine.post(Event::DiscoveryStopTimeout);
                } else if self.machine.in_state(State::EnablePairable) || self.machine.in_state(State::Bonding) {
                    log::warn!(
                        "timed-out in pairing phase (rcu device didn't pair within {}ms)",
                        self.pairing_timeout.as_millis()
                    );
                    self.machine.post(Event::PairingTimeout);
                }
            }
            TimeoutKind::Setup => {
                if self.machine.in_state(State::Setup) {
                    log::warn!(
                        "timed-out in setup phase (rcu didn't respond to all requests within {}ms)",
                        self.setup_timeout.as_millis()
                    );
                    self.machine.post(Event::SetupTimeout);
                }
            }
            TimeoutKind::Unpairing => {
                if self.machine.in_state(State::Unpairing) {
                    log::warn!("timed-out in un-pairing phase (failed rcu may be left paired)");
                    self.machine.post(Event::UnpairingTimeout);
                }
            }
        }
        self.run_machine();
    }

    /// Checks whether a found or renamed device matches the current
    /// attempt and, if so, latches it as the target and advances the
    /// machine.
    fn process_device(&mut self, address: BleAddress, name: &str) {
        if let Some(matcher) = self.matchers.get(&address.oui()) {
            if !matcher.is_match(name) {
                return;
            }
        } else if self.supported_names.iter().any(|m| m.is_match(name)) {
            log::info!("OUI not known, but matched name '{name}' of {address}");
        } else if let Some(mac_hash) = self.pairing_mac_hash {
            let hash = address.iter().fold(0u32, |acc, &b| acc + u32::from(b)) & 0xff;
            log::info!(
                "validating device on MAC hash, requested 0x{mac_hash:02X}, device 0x{hash:02X} ({address} '{name}')"
            );
            if u32::from(mac_hash) != hash {
                return;
            }
        } else {
            if self.target.is_none() {
                log::warn!("odd, don't have a name match for device {address}");
            }
            return;
        }

        if self.target.is_none() {
            // a paired candidate has to be unpaired first; it will show up
            // again in a subsequent scan
            if self.adapter.is_device_paired(address) {
                log::info!(
                    "found target device {address} but it's currently paired, will unpair and wait \
                     till it shows up in a scan again"
                );
                if let Err(err) = self.adapter.remove_device(address) {
                    log::warn!("failed to remove paired candidate {address}: {err}");
                }
                return;
            }

            log::info!("found target device {address}");
            self.target = Some(address);
        } else if self.target != Some(address) {
            // two remotes with the same pairing name; stick with the first
            log::warn!(
                "device with matching name but address {address} doesn't match previously found {:?}",
                self.target
            );
            return;
        }

        self.machine.post(Event::DeviceFound);
    }

    fn run_machine(&mut self) {
        while let Some(transition) = self.machine.next() {
            for state in transition.exited {
                self.on_exit(state);
            }
            for state in transition.entered {
                self.on_enter(state);
            }
        }
    }

    fn on_enter(&mut self, state: State) {
        match state {
            State::StartingDiscovery => self.on_entered_starting_discovery(),
            State::Discovering => self.on_entered_discovering(),
            State::StoppingDiscovery => self.on_entered_stopping_discovery(),
            State::EnablePairable => self.on_entered_enable_pairable(),
            State::Bonding => self.on_entered_bonding(),
            State::Setup => self.on_entered_setup(),
            State::Unpairing => self.on_entered_unpairing(),
            State::StoppingExternalDiscovery => self.on_entered_stopping_external_discovery(),
            State::Finished => self.on_entered_finished(),
            State::Running | State::Discovery | State::PairingPhase => {}
        }
    }

    fn on_exit(&mut self, state: State) {
        match state {
            State::Discovery => {
                self.discovery_timer.stop();
                if let Err(err) = self.adapter.stop_discovery() {
                    log::warn!("failed to stop discovery: {err}");
                }
            }
            State::PairingPhase => {
                self.pairing_timer.stop();
                self.setup_timer.stop();
                if let Err(err) = self.adapter.disable_pairable() {
                    log::warn!("failed to disable pairable mode: {err}");
                }
            }
            State::Unpairing => self.unpairing_timer.stop(),
            _ => {}
        }
    }

    fn on_entered_starting_discovery(&mut self) {
        self.discovery_timer.start(
            self.discovery_timeout,
            self.tx.clone(),
            ControlMsg::PairingTimeout(TimeoutKind::Discovery),
        );

        self.signals.push(Signal::Started);

        if self.adapter.is_discovering() {
            log::warn!("adapter was already in discovery mode, this is unusual but shouldn't be a problem");

            // the adapter sometimes lies about this, so issue another
            // start request anyway, a duplicate doesn't hurt
            if let Err(err) = self.adapter.start_discovery(self.pairing_code) {
                log::warn!("failed to start discovery: {err}");
            }
            self.machine.post(Event::DiscoveryStarted);
        } else if let Err(err) = self.adapter.start_discovery(self.pairing_code) {
            log::warn!("failed to start discovery: {err}");
        }
    }

    fn on_entered_discovering(&mut self) {
        // check devices the adapter already knows about
        let device_names = self.adapter.device_names();
        for (address, name) in device_names {
            self.process_device(address, &name);
        }
    }

    fn on_entered_stopping_discovery(&mut self) {
        self.pairing_timer.start(
            self.pairing_timeout,
            self.tx.clone(),
            ControlMsg::PairingTimeout(TimeoutKind::Pairing),
        );

        debug_assert!(self.target.is_some());

        if !self.adapter.is_discovering() {
            self.machine.post(Event::DiscoveryStopped);
        }
    }

    fn on_entered_enable_pairable(&mut self) {
        debug_assert!(self.target.is_some());

        if self.adapter.is_pairable() {
            self.machine.post(Event::PairableEnabled);
        } else {
            // give the pairable window 5 seconds more than the phase itself
            let timeout = self.pairing_timeout + Duration::from_secs(5);
            if let Err(err) = self.adapter.enable_pairable(timeout) {
                log::warn!("failed to enable pairable mode: {err}");
            }
        }
    }

    fn on_entered_bonding(&mut self) {
        let Some(target) = self.target else {
            log::error!("entered bonding state without a target device");
            return;
        };
        if let Err(err) = self.adapter.add_device(target) {
            log::warn!("failed to request bonding with {target}: {err}");
        }
    }

    fn on_entered_setup(&mut self) {
        log::debug!("starting setup timeout timer for {}ms", self.setup_timeout.as_millis());
        self.setup_timer.start(self.setup_timeout, self.tx.clone(), ControlMsg::PairingTimeout(TimeoutKind::Setup));
    }

    fn on_entered_unpairing(&mut self) {
        self.unpairing_timer.start(
            self.unpairing_timeout,
            self.tx.clone(),
            ControlMsg::PairingTimeout(TimeoutKind::Unpairing),
        );

        let Some(target) = self.target else {
            log::error!("entered un-pairing state without a target device");
            self.machine.post(Event::DeviceUnpaired);
            return;
        };
        if self.adapter.remove_device(target).is_err() {
            self.machine.post(Event::DeviceUnpaired);
        }
    }

    fn on_entered_stopping_external_discovery(&mut self) {
        if let Err(err) = self.adapter.stop_discovery() {
            log::warn!("failed to stop externally started discovery: {err}");
        }
    }

    fn on_entered_finished(&mut self) {
        self.discovery_timer.stop();
        self.pairing_timer.stop();
        self.setup_timer.stop();
        self.unpairing_timer.stop();

        if self.discovery_started_externally {
            log::debug!("discovery was started externally and then stopped, resuming it");
            if let Err(err) = self.adapter.start_discovery(None) {
                log::warn!("failed to resume external discovery: {err}");
            }
            self.discovery_started_externally = false;
        }
        self.machine.set_initial_state(State::StartingDiscovery);

        self.signals.push(if self.succeeded { Signal::Finished } else { Signal::Failed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::{Command, MockAdapter};
    use crate::config::Config;

    const CONFIG: &str = r#"{
        "timeouts": { "discovery": 15000, "pair": 15000, "setup": 60000, "unpair": 20000 },
        "models": [ {
            "name": "EC05x",
            "manufacturer": "Ruwido",
            "oui": "1C:A2:B1",
            "pairingNameFormat": "U%03hhu*",
            "scanNameFormat": "U*",
            "filterBytes": [ 32 ],
            "services": { "type": "dbus", "supported": [ "audio" ] }
        } ]
    }"#;

    fn target() -> BleAddress {
        "1C:A2:B1:40:50:60".parse().unwrap()
    }

    fn machine() -> (PairingStateMachine, MockAdapter, mpsc::UnboundedReceiver<ControlMsg>) {
        let config = Config::from_slice(CONFIG.as_bytes()).unwrap();
        let adapter = MockAdapter::new();
        let (tx, rx) = mpsc::unbounded();
        let sm = PairingStateMachine::new(&config, Arc::new(adapter.clone()), tx);
        (sm, adapter, rx)
    }

    fn drive_to_bonding(sm: &mut PairingStateMachine, adapter: &MockAdapter) {
        adapter.add_known_device(target(), "U042ABC", false);
        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        adapter.lock().pairable = true;
        sm.handle_adapter_event(&AdapterEvent::PairableChanged(true));
    }

    #[tokio::test]
    async fn happy_ir_pairing_sequence() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(0, 42);
        assert!(sm.is_running());
        assert_eq!(sm.pairing_code(), Some(42));
        assert_eq!(sm.take_signals(), vec![Signal::Started]);
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery]);

        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));

        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address: target(), name: "U042ABC".into() });
        // leaving the discovery phase stops discovery
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        assert_eq!(
            adapter.take_commands(),
            vec![Command::EnablePairable(Duration::from_millis(20_000))]
        );

        adapter.lock().pairable = true;
        sm.handle_adapter_event(&AdapterEvent::PairableChanged(true));
        assert_eq!(adapter.take_commands(), vec![Command::AddDevice(target())]);

        sm.handle_adapter_event(&AdapterEvent::DevicePairingChanged { address: target(), paired: true });
        sm.handle_adapter_event(&AdapterEvent::DeviceReadyChanged { address: target(), ready: true });

        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Finished]);
        assert_eq!(sm.attempts(), 1);
        assert_eq!(sm.successes(), 1);
        // the pairable state is cleared on the way out
        assert_eq!(adapter.take_commands(), vec![Command::DisablePairable]);
    }

    #[tokio::test]
    async fn non_matching_names_are_ignored() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();

        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address: target(), name: "U043ABC".into() });
        sm.handle_adapter_event(&AdapterEvent::DeviceFound {
            address: "AA:BB:CC:00:00:01".parse().unwrap(),
            name: "SomethingElse".into(),
        });
        assert!(sm.is_running());
        assert_eq!(adapter.take_commands(), vec![]);
    }

    #[tokio::test]
    async fn known_devices_are_prescanned_on_discovery_entry() {
        let (mut sm, adapter, _rx) = machine();
        adapter.add_known_device(target(), "U042ABC", false);

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));

        // the pre-scan latched the target and moved to stopping discovery
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery, Command::StopDiscovery]);
    }

    #[tokio::test]
    async fn paired_candidate_is_unpaired_and_not_latched() {
        let (mut sm, adapter, _rx) = machine();
        adapter.add_known_device(target(), "U042ABC", true);

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));

        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery, Command::RemoveDevice(target())]);
        assert!(sm.is_running());
    }

    #[tokio::test]
    async fn second_matching_device_is_ignored() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();

        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address: target(), name: "U042ABC".into() });
        let second: BleAddress = "1C:A2:B1:11:22:33".parse().unwrap();
        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address: second, name: "U042XYZ".into() });

        // only the first match is bonded with
        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        adapter.lock().pairable = true;
        sm.handle_adapter_event(&AdapterEvent::PairableChanged(true));
        assert!(adapter.take_commands().contains(&Command::AddDevice(target())));
    }

    #[tokio::test]
    async fn mac_hash_mode_matches_on_address_sum() {
        let (mut sm, adapter, _rx) = machine();

        // 0x1c + 0xa2 + 0xb1 + 0x40 + 0x50 + 0x60 = 0x25f -> hash 0x5f
        sm.start_mac_hash(0, 0x5f);
        assert_eq!(sm.pairing_code(), None);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();

        sm.handle_adapter_event(&AdapterEvent::DeviceFound {
            address: "1C:A2:B1:40:50:61".parse().unwrap(),
            name: "AnyName".into(),
        });
        assert_eq!(adapter.take_commands(), vec![]);

        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address: target(), name: "AnyName".into() });
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);
    }

    #[tokio::test]
    async fn pairing_timeout_rolls_back_through_unpairing() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);
        adapter.take_commands();

        sm.handle_timeout(TimeoutKind::Pairing);
        assert!(sm.is_running());
        // the pairing phase exit disables pairable before the rollback
        assert_eq!(adapter.take_commands(), vec![Command::DisablePairable, Command::RemoveDevice(target())]);

        sm.handle_adapter_event(&AdapterEvent::DevicePairingChanged { address: target(), paired: false });
        assert!(!sm.is_running());
        let signals = sm.take_signals();
        assert!(signals.contains(&Signal::Failed));
        assert_eq!(sm.successes(), 0);
    }

    #[tokio::test]
    async fn setup_timeout_rolls_back_through_unpairing() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);
        sm.handle_adapter_event(&AdapterEvent::DevicePairingChanged { address: target(), paired: true });
        adapter.take_commands();

        sm.handle_timeout(TimeoutKind::Setup);
        assert_eq!(adapter.take_commands(), vec![Command::DisablePairable, Command::RemoveDevice(target())]);

        sm.handle_timeout(TimeoutKind::Unpairing);
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
    }

    #[tokio::test]
    async fn discovery_timeout_finishes_without_side_effects_left() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();

        sm.handle_timeout(TimeoutKind::Discovery);
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
        // discovery is stopped on the way out
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);
    }

    #[tokio::test]
    async fn adapter_power_loss_aborts_the_attempt() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);

        sm.handle_adapter_event(&AdapterEvent::PoweredChanged(false));
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
    }

    #[tokio::test]
    async fn cancel_before_bonding_finishes_directly() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(0, 42);
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();

        sm.cancel();
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
        // no device was bonded, so nothing to unpair
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);
    }

    #[tokio::test]
    async fn cancel_during_bonding_unpairs_the_target() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);
        adapter.take_commands();

        sm.cancel();
        assert!(sm.is_running());
        assert_eq!(adapter.take_commands(), vec![Command::DisablePairable, Command::RemoveDevice(target())]);

        sm.handle_adapter_event(&AdapterEvent::DeviceRemoved { address: target() });
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
    }

    #[tokio::test]
    async fn synchronous_unpair_failure_still_finishes() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);
        adapter.lock().fail_remove_device = true;
        adapter.take_commands();

        sm.handle_timeout(TimeoutKind::Pairing);
        assert!(!sm.is_running());
        assert!(sm.take_signals().contains(&Signal::Failed));
    }

    #[tokio::test]
    async fn externally_started_discovery_is_stopped_first_and_resumed_after() {
        let (mut sm, adapter, _rx) = machine();

        // discovery was started by somebody else before any attempt ran
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        assert!(!sm.is_running());

        sm.start(0, 42);
        // first action is stopping the foreign discovery
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        // now the machine starts its own discovery round
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery]);

        // let the discovery phase time out; the foreign discovery resumes
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
        adapter.take_commands();
        sm.handle_timeout(TimeoutKind::Discovery);
        assert!(!sm.is_running());
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery, Command::StartDiscovery]);
    }

    #[tokio::test]
    async fn ready_device_completes_even_while_bonding() {
        let (mut sm, adapter, _rx) = machine();
        drive_to_bonding(&mut sm, &adapter);

        // device became ready without a separate paired notification
        sm.handle_adapter_event(&AdapterEvent::DeviceReadyChanged { address: target(), ready: true });
        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started, Signal::Finished]);
    }
}
