//! D-Bus session with the system Bluetooth daemon.

use dbus::{
    arg::{PropMap, Variant},
    message::SignalArgs,
    nonblock::{
        stdintf::org_freedesktop_dbus::{
            ObjectManager, ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved,
            PropertiesPropertiesChanged,
        },
        Proxy, SyncConnection,
    },
    strings::BusName,
    Message, Path,
};
use dbus_tokio::connection;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use lazy_static::lazy_static;
use std::{
    collections::{HashMap, HashSet},
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{Error, ErrorKind, InternalErrorKind, Result, SERVICE_NAME, TIMEOUT};

/// A D-Bus object or property event from the Bluetooth daemon.
#[derive(Debug)]
pub(crate) enum ObjectEvent {
    /// Object or object interfaces added, with their initial properties.
    ObjectAdded { object: Path<'static>, interfaces: HashMap<String, PropMap> },
    /// Object or object interfaces removed.
    ObjectRemoved { object: Path<'static>, interfaces: HashSet<String> },
    /// Properties changed.
    PropertiesChanged { object: Path<'static>, interface: String, changed: PropMap },
}

fn clone_prop_map(map: &PropMap) -> PropMap {
    map.iter().map(|(k, v)| (k.clone(), Variant(v.0.box_clone()))).collect()
}

impl Clone for ObjectEvent {
    fn clone(&self) -> Self {
        match self {
            Self::ObjectAdded { object, interfaces } => Self::ObjectAdded {
                object: object.clone(),
                interfaces: interfaces.iter().map(|(k, v)| (k.clone(), clone_prop_map(v))).collect(),
            },
            Self::ObjectRemoved { object, interfaces } => {
                Self::ObjectRemoved { object: object.clone(), interfaces: interfaces.clone() }
            }
            Self::PropertiesChanged { object, interface, changed } => Self::PropertiesChanged {
                object: object.clone(),
                interface: interface.clone(),
                changed: clone_prop_map(changed),
            },
        }
    }
}

/// Subscription request sent to the event pump.
struct SubscriptionReq {
    tx: mpsc::UnboundedSender<ObjectEvent>,
    ready_tx: oneshot::Sender<()>,
}

/// Connection to the system Bluetooth daemon.
///
/// Holds the D-Bus connection and a pump task that forwards the daemon's
/// object manager and property change signals to subscribers.
pub struct Session {
    connection: Arc<SyncConnection>,
    sub_tx: mpsc::Sender<SubscriptionReq>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.connection.unique_name())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

impl Session {
    /// Creates a new session by connecting to the D-Bus system bus.
    pub async fn new() -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync)
            .await
            .map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("connected to D-Bus with unique name {}", &connection.unique_name());

        let (sub_tx, sub_rx) = mpsc::channel(1);
        handle_connection(connection.clone(), sub_rx).await?;

        Ok(Self { connection, sub_tx, dbus_task })
    }

    pub(crate) fn connection(&self) -> Arc<SyncConnection> {
        self.connection.clone()
    }

    /// Gets all D-Bus objects of the Bluetooth daemon.
    pub(crate) async fn all_objects(&self) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
        let proxy = Proxy::new(SERVICE_NAME, "/", TIMEOUT, &*self.connection);
        Ok(proxy.get_managed_objects().await?)
    }

    /// Subscribes to all object and property events of the Bluetooth
    /// daemon.
    pub(crate) async fn events(&self) -> Result<mpsc::UnboundedReceiver<ObjectEvent>> {
        let (tx, rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut sub_tx = self.sub_tx.clone();
        sub_tx
            .send(SubscriptionReq { tx, ready_tx })
            .await
            .map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        ready_rx.await.map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        Ok(rx)
    }
}

/// Spawns a task that translates the daemon's signals into [ObjectEvent]s
/// and fans them out to subscribers.
async fn handle_connection(
    connection: Arc<SyncConnection>, mut sub_rx: mpsc::Receiver<SubscriptionReq>,
) -> Result<()> {
    lazy_static! {
        static ref SERVICE_NAME_BUS: BusName<'static> = BusName::new(SERVICE_NAME).unwrap();
        static ref SERVICE_NAME_REF: Option<&'static BusName<'static>> = Some(&SERVICE_NAME_BUS);
    }

    let (msg_tx, mut msg_rx) = mpsc::unbounded();
    let handle_msg = move |msg: Message| {
        let _ = msg_tx.unbounded_send(msg);
        true
    };

    let rule_add = ObjectManagerInterfacesAdded::match_rule(*SERVICE_NAME_REF, None);
    let msg_match_add = connection.add_match(rule_add).await?.msg_cb(handle_msg.clone());

    let rule_removed = ObjectManagerInterfacesRemoved::match_rule(*SERVICE_NAME_REF, None);
    let msg_match_removed = connection.add_match(rule_removed).await?.msg_cb(handle_msg.clone());

    let rule_prop = PropertiesPropertiesChanged::match_rule(*SERVICE_NAME_REF, None);
    let msg_match_prop = connection.add_match(rule_prop).await?.msg_cb(handle_msg.clone());

    tokio::spawn(async move {
        log::trace!("starting event loop for {}", &connection.unique_name());

        let mut subs: Vec<mpsc::UnboundedSender<ObjectEvent>> = Vec::new();

        loop {
            tokio::select! {
                msg_opt = msg_rx.next() => {
                    let Some(msg) = msg_opt else { break };
                    let Some(event) = to_object_event(&msg) else { continue };
                    log::trace!("event: {:?}", &event);
                    subs.retain(|sub| sub.unbounded_send(event.clone()).is_ok());
                },
                sub_opt = sub_rx.next() => {
                    match sub_opt {
                        Some(SubscriptionReq { tx, ready_tx }) => {
                            let _ = ready_tx.send(());
                            subs.push(tx);
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = connection.remove_match(msg_match_add.token()).await;
        let _ = connection.remove_match(msg_match_removed.token()).await;
        let _ = connection.remove_match(msg_match_prop.token()).await;
        log::trace!("terminated event loop for {}", &connection.unique_name());
    });

    Ok(())
}

fn to_object_event(msg: &Message) -> Option<ObjectEvent> {
    if let (Some(object), Some(PropertiesPropertiesChanged { interface_name, changed_properties, .. })) =
        (msg.path(), PropertiesPropertiesChanged::from_message(msg))
    {
        return Some(ObjectEvent::PropertiesChanged {
            object: object.into_static(),
            interface: interface_name,
            changed: changed_properties,
        });
    }

    if let Some(ObjectManagerInterfacesAdded { object, interfaces }) =
        ObjectManagerInterfacesAdded::from_message(msg)
    {
        return Some(ObjectEvent::ObjectAdded { object, interfaces });
    }

    if let Some(ObjectManagerInterfacesRemoved { object, interfaces, .. }) =
        ObjectManagerInterfacesRemoved::from_message(msg)
    {
        return Some(ObjectEvent::ObjectRemoved { object, interfaces: interfaces.into_iter().collect() });
    }

    None
}
