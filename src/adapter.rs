//! The Bluetooth adapter capability set consumed by the control plane.
//!
//! The controller and both state machines talk to the system Bluetooth
//! daemon exclusively through the [Adapter] trait; the production backend
//! over BlueZ lives in [crate::bluez].

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use crate::{BleAddress, Result};

/// Notification from the Bluetooth adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdapterEvent {
    /// The adapter power state changed.
    PoweredChanged(bool),
    /// Device discovery was started or stopped.
    DiscoveryChanged(bool),
    /// The pairable state of the adapter changed.
    PairableChanged(bool),
    /// A device was found during discovery.
    DeviceFound {
        /// Address of the device.
        address: BleAddress,
        /// Advertised name of the device.
        name: String,
    },
    /// A device object was removed.
    DeviceRemoved {
        /// Address of the device.
        address: BleAddress,
    },
    /// The name of a known device changed.
    DeviceNameChanged {
        /// Address of the device.
        address: BleAddress,
        /// The new name.
        name: String,
    },
    /// The paired state of a device changed.
    DevicePairingChanged {
        /// Address of the device.
        address: BleAddress,
        /// Whether the device is now paired.
        paired: bool,
    },
    /// The ready state of a device changed. A device is ready once it is
    /// paired, connected and its services have been resolved.
    DeviceReadyChanged {
        /// Address of the device.
        address: BleAddress,
        /// Whether the device is now ready.
        ready: bool,
    },
}

/// A snapshot of an RCU device known to the adapter.
#[derive(Debug, Clone)]
pub struct RcuDevice {
    /// Address of the device.
    pub address: BleAddress,
    /// Last known name of the device.
    pub name: String,
    /// Whether the device is paired.
    pub paired: bool,
    /// Whether the device is connected.
    pub connected: bool,
    /// Whether the device is ready (paired, connected, services resolved).
    pub ready: bool,
    /// When the device last became ready, used to order evictions.
    pub ready_since: Option<Instant>,
}

impl RcuDevice {
    /// Time elapsed since the device became ready.
    pub fn since_ready(&self) -> Option<Duration> {
        self.ready_since.map(|at| at.elapsed())
    }
}

/// Operations on the system Bluetooth daemon.
///
/// Queries answer from locally cached daemon state and commands are posted
/// asynchronously; neither blocks the control plane. Command failures that
/// the backend only learns about later surface as adapter events (or as
/// the absence of them, handled by the per-phase timeouts).
pub trait Adapter: Send + Sync {
    /// Whether the adapter object is present on the bus.
    fn is_available(&self) -> bool;

    /// Whether the adapter is powered.
    fn is_powered(&self) -> bool;

    /// Whether device discovery is currently running.
    fn is_discovering(&self) -> bool;

    /// Starts device discovery. The pairing code that triggered the scan,
    /// if any, is only used for diagnostics.
    fn start_discovery(&self, pairing_code: Option<u8>) -> Result<()>;

    /// Stops device discovery.
    fn stop_discovery(&self) -> Result<()>;

    /// Whether the adapter is accepting pairing requests.
    fn is_pairable(&self) -> bool;

    /// Makes the adapter pairable for the given duration.
    fn enable_pairable(&self, timeout: Duration) -> Result<()>;

    /// Clears the pairable state of the adapter.
    fn disable_pairable(&self) -> Result<()>;

    /// Addresses of all currently paired devices.
    fn paired_devices(&self) -> BTreeSet<BleAddress>;

    /// Names of all known devices.
    fn device_names(&self) -> BTreeMap<BleAddress, String>;

    /// Whether the device with the given address is paired.
    fn is_device_paired(&self, address: BleAddress) -> bool;

    /// Starts bonding with the device with the given address.
    fn add_device(&self, address: BleAddress) -> Result<()>;

    /// Unpairs and removes the device with the given address.
    fn remove_device(&self, address: BleAddress) -> Result<()>;

    /// Returns a snapshot of the device with the given address.
    fn device(&self, address: BleAddress) -> Option<RcuDevice>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted adapter double for state machine and controller tests.

    use super::*;
    use std::sync::{Arc, Mutex, MutexGuard};

    /// A command issued to the mock adapter.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        StartDiscovery,
        StopDiscovery,
        EnablePairable(Duration),
        DisablePairable,
        AddDevice(BleAddress),
        RemoveDevice(BleAddress),
    }

    #[derive(Default)]
    pub struct MockState {
        pub available: bool,
        pub powered: bool,
        pub discovering: bool,
        pub pairable: bool,
        pub devices: BTreeMap<BleAddress, RcuDevice>,
        pub commands: Vec<Command>,
        pub fail_remove_device: bool,
    }

    /// Test double for [Adapter] recording every issued command.
    #[derive(Clone, Default)]
    pub struct MockAdapter {
        state: Arc<Mutex<MockState>>,
    }

    impl MockAdapter {
        pub fn new() -> Self {
            let mock = Self::default();
            {
                let mut state = mock.lock();
                state.available = true;
                state.powered = true;
            }
            mock
        }

        pub fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        pub fn add_known_device(&self, address: BleAddress, name: &str, paired: bool) {
            self.lock().devices.insert(
                address,
                RcuDevice {
                    address,
                    name: name.to_string(),
                    paired,
                    connected: false,
                    ready: false,
                    ready_since: None,
                },
            );
        }

        pub fn set_device_ready(&self, address: BleAddress, ready_since: Instant) {
            if let Some(device) = self.lock().devices.get_mut(&address) {
                device.paired = true;
                device.connected = true;
                device.ready = true;
                device.ready_since = Some(ready_since);
            }
        }

        pub fn take_commands(&self) -> Vec<Command> {
            std::mem::take(&mut self.lock().commands)
        }
    }

    impl Adapter for MockAdapter {
        fn is_available(&self) -> bool {
            self.lock().available
        }

        fn is_powered(&self) -> bool {
            self.lock().powered
        }

        fn is_discovering(&self) -> bool {
            self.lock().discovering
        }

        fn start_discovery(&self, _pairing_code: Option<u8>) -> Result<()> {
            self.lock().commands.push(Command::StartDiscovery);
            Ok(())
        }

        fn stop_discovery(&self) -> Result<()> {
            self.lock().commands.push(Command::StopDiscovery);
            Ok(())
        }

        fn is_pairable(&self) -> bool {
            self.lock().pairable
        }

        fn enable_pairable(&self, timeout: Duration) -> Result<()> {
            self.lock().commands.push(Command::EnablePairable(timeout));
            Ok(())
        }

        fn disable_pairable(&self) -> Result<()> {
            self.lock().commands.push(Command::DisablePairable);
            Ok(())
        }

        fn paired_devices(&self) -> BTreeSet<BleAddress> {
            self.lock().devices.values().filter(|d| d.paired).map(|d| d.address).collect()
        }

        fn device_names(&self) -> BTreeMap<BleAddress, String> {
            self.lock().devices.values().map(|d| (d.address, d.name.clone())).collect()
        }

        fn is_device_paired(&self, address: BleAddress) -> bool {
            self.lock().devices.get(&address).map(|d| d.paired).unwrap_or(false)
        }

        fn add_device(&self, address: BleAddress) -> Result<()> {
            self.lock().commands.push(Command::AddDevice(address));
            Ok(())
        }

        fn remove_device(&self, address: BleAddress) -> Result<()> {
            let mut state = self.lock();
            state.commands.push(Command::RemoveDevice(address));
            if state.fail_remove_device {
                return Err(crate::Error::new(crate::ErrorKind::NotFound));
            }
            Ok(())
        }

        fn device(&self, address: BleAddress) -> Option<RcuDevice> {
            self.lock().devices.get(&address).cloned()
        }
    }
}
