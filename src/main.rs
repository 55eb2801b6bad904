//! BLE RCU daemon.
//!
//! Wires the controller, the BlueZ adapter backend and the connection
//! parameter manager together and runs the control-plane loop.

use clap::Parser;
use futures::{channel::mpsc, StreamExt};
use std::{path::PathBuf, sync::Arc};

use blercud::{
    bluez::{BluezAdapter, DEFAULT_NAME},
    config::Config,
    connparams::{ConnParamManager, ConnParamMsg},
    controller::{ControlMsg, Controller},
    hci::HciSocket,
    session::Session,
};

#[derive(Parser, Debug)]
#[command(name = "blercud", about = "Daemon managing Bluetooth Low Energy remote control units")]
struct Opts {
    /// Bluetooth adapter to manage.
    #[arg(short, long, default_value = DEFAULT_NAME)]
    adapter: String,

    /// HCI device id to bind the raw socket to (0 for hci0).
    #[arg(short = 'i', long, default_value_t = 0)]
    device_id: u16,

    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Open file descriptor of the network namespace to create the HCI
    /// socket in, for use inside a container.
    #[arg(long)]
    network_namespace: Option<i32>,
}

#[tokio::main]
async fn main() -> blercud::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => Config::from_file(path)?,
        None => {
            log::warn!("no configuration file given, no RCU models will be matched");
            Config::default()
        }
    };

    let session = Session::new().await?;

    let (control_tx, control_rx) = mpsc::unbounded();

    // adapter events feed the control-plane queue
    let (adapter_tx, mut adapter_rx) = mpsc::unbounded();
    let adapter = Arc::new(BluezAdapter::new(&session, &opts.adapter, adapter_tx).await?);
    let forward_tx = control_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = adapter_rx.next().await {
            let _ = forward_tx.unbounded_send(ControlMsg::Adapter(event));
        }
    });

    let mut controller = Controller::new(&config, adapter.clone(), control_tx.clone());

    let mut controller_events = controller.events();
    tokio::spawn(async move {
        while let Some(event) = controller_events.next().await {
            log::info!("controller: {event:?}");
        }
    });

    // the connection parameter plane is independent of the controller and
    // optional: without CAP_NET_RAW the daemon still pairs and manages
    // devices, it just can't steer their connection parameters
    match HciSocket::open(opts.device_id, opts.network_namespace) {
        Ok(hci) => {
            let hci = Arc::new(hci);
            let (param_tx, param_rx) = mpsc::unbounded();

            let mut hci_events = hci.events();
            let hci_tx = param_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = hci_events.next().await {
                    let _ = hci_tx.unbounded_send(ConnParamMsg::Hci(event));
                }
            });

            // the manager holds the socket, keeping the reader task alive
            let mut manager = ConnParamManager::new(&config, hci, param_tx);
            if let Err(err) = manager.start() {
                log::warn!("failed to enumerate connected devices: {err}");
            }
            tokio::spawn(manager.run(param_rx));
        }
        Err(err) => {
            log::warn!("failed to open hci socket, connection parameter management disabled: {err}");
        }
    }

    controller.run(control_rx).await;
    Ok(())
}
