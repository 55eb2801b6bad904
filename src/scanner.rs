//! Scanner state machine.
//!
//! Drives one timed scan looking for an RCU in pairing mode. The scan
//! halts on the first pairable match, on cancellation, on the caller
//! supplied deadline or on loss of adapter power. A found device is
//! reported to the controller, which chains into a targeted pairing
//! attempt.

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

const DISCOVERY_START_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVERY_STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Running,
    StartingDiscovery,
    Discovering,
    StoppingDiscovery,
    Finished,
}

impl statemachine::State for State {
    fn parent(self) -> Option<Self> {
        match self {
            State::StartingDiscovery | State::Discovering | State::StoppingDiscovery => Some(State::Running),
            State::Running | State::Finished => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    DiscoveryStarted,
    DiscoveryStopped,
    DiscoveryTimeout,
    DiscoveryStartTimeout,
    DiscoveryStopTimeout,
    DeviceFound,
    CancelRequest,
    AdapterPoweredOff,
}

const TRANSITIONS: &[(State, Event, State)] = &[
    (State::Running, Event::AdapterPoweredOff, State::Finished),
    (State::StartingDiscovery, Event::DiscoveryStarted, State::Discovering),
    (State::StartingDiscovery, Event::CancelRequest, State::StoppingDiscovery),
    (State::StartingDiscovery, Event::DiscoveryStartTimeout, State::Finished),
    (State::Discovering, Event::DeviceFound, State::StoppingDiscovery),
    (State::Discovering, Event::CancelRequest, State::StoppingDiscovery),
    (State::Discovering, Event::DiscoveryTimeout, State::StoppingDiscovery),
    (State::Discovering, Event::DiscoveryStopped, State::Finished),
    (State::StoppingDiscovery, Event::DiscoveryStopped, State::Finished),
    (State::StoppingDiscovery, Event::DiscoveryStopTimeout, State::Finished),
];

/// Which scanner timer has expired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutKind {
    /// The internal guard on discovery starting.
    Start,
    /// The internal guard on discovery stopping.
    Stop,
    /// The caller supplied scan deadline.
    Deadline,
}

/// Outcome notifications for the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Signal {
    Started,
    /// A device in pairing mode was found.
    FoundPairableDevice(BleAddress, String),
    /// The scan ended without a match.
    Failed,
    Finished,
}

/// State machine driving one timed scan.
pub struct ScannerStateMachine {
    machine: StateMachine<State, Event>,
    adapter: Arc<dyn Adapter>,
    tx: mpsc::UnboundedSender<ControlMsg>,

    start_timer: EventTimer,
    stop_timer: EventTimer,
    deadline_timer: EventTimer,
    scan_timeout: Option<Duration>,

    /// Scan name matchers of the enabled models, keyed by OUI.
    matchers: BTreeMap<u32, Regex>,
    /// All scan name matchers, for devices whose OUI is not in the table.
    supported_names: Vec<Regex>,

    found: Option<(BleAddress, String)>,
    signals: Vec<Signal>,
}

impl ScannerStateMachine {
    pub(crate) fn new(config: &Config, adapter: Arc<dyn Adapter>, tx: mpsc::UnboundedSender<ControlMsg>) -> Self {
        let mut matchers = BTreeMap::new();
        let mut supported_names = Vec::new();
        for model in config.enabled_models() {
            if let Some(matcher) = model.scan_matcher() {
                matchers.insert(model.oui, matcher.clone());
                supported_names.push(matcher);
            }
        }

        Self {
            machine: StateMachine::new("scanner", TRANSITIONS, State::StartingDiscovery, State::Finished),
            adapter,
            tx,
            start_timer: EventTimer::new(),
            stop_timer: EventTimer::new(),
            deadline_timer: EventTimer::new(),
            scan_timeout: None,
            matchers,
            supported_names,
            found: None,
            signals: Vec::new(),
        }
    }

    /// Whether a scan is in progress.
    pub fn is_running(&self) -> bool {
        self.machine.is_running()
    }

    /// Takes the signals emitted since the last call.
    pub(crate) fn take_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    /// Starts a scan that runs for `timeout`, or until cancelled if none
    /// is given.
    pub(crate) fn start(&mut self, timeout: Option<Duration>) {
        if self.machine.is_running() {
            log::error!("scanner already running");
            return;
        }

        match timeout {
            Some(timeout) => log::info!("starting scanner with timeout {}ms", timeout.as_millis()),
            None => log::info!("starting scanner without timeout"),
        }

        self.found = None;
        self.scan_timeout = timeout;

        let entered = self.machine.start();
        for state in entered {
            self.on_enter(state);
        }
        self.run_machine();
    }

    /// Cancels the scan. Asynchronous; the finished signal indicates the
    /// scanner has wound down.
    pub(crate) fn cancel(&mut self) {
        if !self.machine.is_running() {
            log::info!("scanner not running");
            return;
        }

        log::info!("cancelling scanner");
        self.machine.post(Event::CancelRequest);
        self.run_machine();
    }

    pub(crate) fn handle_adapter_event(&mut self, event: &AdapterEvent) {
        if !self.machine.is_running() {
            return;
        }

        match event {
            AdapterEvent::DiscoveryChanged(discovering) => {
                self.machine.post(if *discovering { Event::DiscoveryStarted } else { Event::DiscoveryStopped });
            }
            AdapterEvent::DeviceFound { address, name } | AdapterEvent::DeviceNameChanged { address, name } => {
                // only matches seen while actually discovering count
                if self.machine.in_state(State::Discovering) {
                    self.process_device(*address, name);
                }
            }
            AdapterEvent::PoweredChanged(powered) => {
                if !powered {
                    self.machine.post(Event::AdapterPoweredOff);
                }
            }
            _ => {}
        }
        self.run_machine();
    }

    pub(crate) fn handle_timeout(&mut self, kind: TimeoutKind) {
        if !self.machine.is_running() {
            return;
        }

        match kind {
            TimeoutKind::Start => self.machine.post(Event::DiscoveryStartTimeout),
            TimeoutKind::Stop => self.machine.post(Event::DiscoveryStopTimeout),
            TimeoutKind::Deadline => self.machine.post(Event::DiscoveryTimeout),
        }
        self.run_machine();
    }

    /// Checks whether a device name marks an RCU in pairing mode and, if
    /// so, latches it.
    fn process_device(&mut self, address: BleAddress, name: &str) {
        if self.found.is_some() {
            return;
        }

        if let Some(matcher) = self.matchers.get(&address.oui()) {
            if !matcher.is_match(name) {
                return;
            }
        } else if self.supported_names.iter().any(|m| m.is_match(name)) {
            log::info!("OUI not known, but matched name '{name}' of {address}");
        } else {
            return;
        }

        if self.adapter.is_device_paired(address) {
            log::info!("device {address} '{name}' is currently paired, ignoring");
            return;
        }

        log::info!("found pairable device {address} with name '{name}'");
        self.found = Some((address, name.to_string()));
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
            State::Finished => self.on_entered_finished(),
            State::Running => {}
        }
    }

    fn on_exit(&mut self, _state: State) {}

    fn on_entered_starting_discovery(&mut self) {
        self.signals.push(Signal::Started);

        if self.adapter.is_discovering() {
            log::warn!("adapter was already in discovery mode, this is unusual but shouldn't be a problem");

            // the adapter sometimes lies about this, so issue another
            // start request anyway, a duplicate doesn't hurt
            if let Err(err) = self.adapter.start_discovery(None) {
                log::warn!("failed to start discovery: {err}");
            }
            self.machine.post(Event::DiscoveryStarted);
        } else {
            if let Err(err) = self.adapter.start_discovery(None) {
                log::warn!("failed to start discovery: {err}");
            }
            self.start_timer.start(
                DISCOVERY_START_TIMEOUT,
                self.tx.clone(),
                ControlMsg::ScannerTimeout(TimeoutKind::Start),
            );
        }
    }

    fn on_entered_discovering(&mut self) {
        self.start_timer.stop();

        if let Some(timeout) = self.scan_timeout {
            self.deadline_timer.start(timeout, self.tx.clone(), ControlMsg::ScannerTimeout(TimeoutKind::Deadline));
        }

        // check devices the adapter already knows about
        let device_names = self.adapter.device_names();
        for (address, name) in device_names {
            self.process_device(address, &name);
        }
    }

    fn on_entered_stopping_discovery(&mut self) {
        if let Err(err) = self.adapter.stop_discovery() {
            log::warn!("failed to stop discovery: {err}");
        }

        if !self.adapter.is_discovering() {
            self.machine.post(Event::DiscoveryStopped);
        } else {
            self.stop_timer.start(
                DISCOVERY_STOP_TIMEOUT,
                self.tx.clone(),
                ControlMsg::ScannerTimeout(TimeoutKind::Stop),
            );
        }
    }

    fn on_entered_finished(&mut self) {
        self.start_timer.stop();
        self.stop_timer.stop();
        self.deadline_timer.stop();

        match self.found.take() {
            Some((address, name)) => self.signals.push(Signal::FoundPairableDevice(address, name)),
            None => self.signals.push(Signal::Failed),
        }
        self.signals.push(Signal::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::{Command, MockAdapter};
    use crate::config::Config;

    const CONFIG: &str = r#"{
        "models": [ {
            "name": "EC05x",
            "oui": "1C:A2:B1",
            "pairingNameFormat": "U%03hhu*",
            "scanNameFormat": "U1*",
            "services": { "type": "dbus", "supported": [ "audio" ] }
        }, {
            "name": "Platco",
            "oui": "AA:BB:CC",
            "pairingNameFormat": "BLERemote%03hhu*",
            "scanNameFormat": "BLERemote-Pair*",
            "services": { "type": "gatt", "supported": [ "audio" ] }
        } ]
    }"#;

    fn machine() -> (ScannerStateMachine, MockAdapter, mpsc::UnboundedReceiver<ControlMsg>) {
        let config = Config::from_slice(CONFIG.as_bytes()).unwrap();
        let adapter = MockAdapter::new();
        let (tx, rx) = mpsc::unbounded();
        let sm = ScannerStateMachine::new(&config, Arc::new(adapter.clone()), tx);
        (sm, adapter, rx)
    }

    fn start_discovering(sm: &mut ScannerStateMachine, adapter: &MockAdapter) {
        sm.start(Some(Duration::from_secs(10)));
        adapter.lock().discovering = true;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(true));
    }

    #[tokio::test]
    async fn scan_finds_a_pairable_device() {
        let (mut sm, adapter, _rx) = machine();

        start_discovering(&mut sm, &adapter);
        assert!(sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started]);
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery]);

        let address: BleAddress = "AA:BB:CC:11:22:33".parse().unwrap();
        sm.handle_adapter_event(&AdapterEvent::DeviceFound {
            address,
            name: "BLERemote-Pair".into(),
        });
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        assert!(!sm.is_running());
        assert_eq!(
            sm.take_signals(),
            vec![Signal::FoundPairableDevice(address, "BLERemote-Pair".into()), Signal::Finished]
        );
    }

    #[tokio::test]
    async fn deadline_ends_the_scan_without_a_match() {
        let (mut sm, adapter, _rx) = machine();

        start_discovering(&mut sm, &adapter);
        sm.handle_timeout(TimeoutKind::Deadline);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started, Signal::Failed, Signal::Finished]);
    }

    #[tokio::test]
    async fn paired_devices_are_skipped() {
        let (mut sm, adapter, _rx) = machine();
        let address: BleAddress = "1C:A2:B1:00:00:01".parse().unwrap();
        adapter.add_known_device(address, "U1 Remote", true);

        start_discovering(&mut sm, &adapter);
        // the pre-scan saw only the paired device
        assert!(sm.is_running());

        sm.handle_adapter_event(&AdapterEvent::DeviceFound { address, name: "U1 Remote".into() });
        assert!(sm.is_running());
    }

    #[tokio::test]
    async fn names_seen_before_discovering_do_not_count() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(Some(Duration::from_secs(10)));
        // still in starting discovery; device events are not processed yet
        sm.handle_adapter_event(&AdapterEvent::DeviceFound {
            address: "AA:BB:CC:11:22:33".parse().unwrap(),
            name: "BLERemote-Pair".into(),
        });
        assert!(sm.is_running());
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery]);
    }

    #[tokio::test]
    async fn cancel_stops_discovery_and_fails() {
        let (mut sm, adapter, _rx) = machine();

        start_discovering(&mut sm, &adapter);
        adapter.take_commands();

        sm.cancel();
        assert_eq!(adapter.take_commands(), vec![Command::StopDiscovery]);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started, Signal::Failed, Signal::Finished]);
    }

    #[tokio::test]
    async fn start_timeout_gives_up() {
        let (mut sm, adapter, _rx) = machine();

        sm.start(Some(Duration::from_secs(10)));
        adapter.take_commands();

        sm.handle_timeout(TimeoutKind::Start);
        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started, Signal::Failed, Signal::Finished]);
    }

    #[tokio::test]
    async fn power_loss_aborts_the_scan() {
        let (mut sm, adapter, _rx) = machine();

        start_discovering(&mut sm, &adapter);
        sm.handle_adapter_event(&AdapterEvent::PoweredChanged(false));
        assert!(!sm.is_running());
        assert_eq!(sm.take_signals(), vec![Signal::Started, Signal::Failed, Signal::Finished]);
    }

    #[tokio::test]
    async fn prescan_matches_known_pairable_device() {
        let (mut sm, adapter, _rx) = machine();
        let address: BleAddress = "1C:A2:B1:00:00:01".parse().unwrap();
        adapter.add_known_device(address, "U1 Remote", false);

        start_discovering(&mut sm, &adapter);
        // latched straight from the pre-scan
        assert_eq!(adapter.take_commands(), vec![Command::StartDiscovery, Command::StopDiscovery]);

        adapter.lock().discovering = false;
        sm.handle_adapter_event(&AdapterEvent::DiscoveryChanged(false));
        let signals = sm.take_signals();
        assert!(signals.contains(&Signal::FoundPairableDevice(address, "U1 Remote".into())));
    }
}
