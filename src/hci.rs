//! Kernel HCI socket.
//!
//! Wraps a raw Bluetooth HCI socket to provide limited event notifications
//! and command execution. This is not a fully featured interface to the
//! kernel's HCI driver; it is targeted at Bluetooth Low Energy links and
//! carries only the basic connection events and a single command.
//!
//! To receive all target events the process needs the `CAP_NET_RAW`
//! capability or root privilege. The kernel HCI driver also rejects
//! sockets created outside the initial network namespace, so inside a
//! container a descriptor of the host network namespace must be supplied.

use futures::channel::mpsc;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    fmt,
    os::unix::io::RawFd,
    sync::{Arc, Mutex},
};
use tokio::{io::unix::AsyncFd, io::ReadBuf, task::JoinHandle};

use crate::{
    sock::{self, OwnedFd},
    sys, BleAddress, ConnectionParameters, Error, ErrorKind, InternalErrorKind, Result,
};

/// Maximum consecutive socket or parse errors before the reader gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// An event received from the HCI driver.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HciEvent {
    /// A new LE connection has been established.
    ConnectionCompleted {
        /// Connection handle assigned by the controller.
        handle: u16,
        /// Address of the remote device.
        address: BleAddress,
        /// Parameters in use for the new connection. The minimum and
        /// maximum interval are equal and refer to the current interval.
        params: ConnectionParameters,
    },
    /// The parameters of an LE connection have been updated.
    ConnectionUpdated {
        /// Connection handle.
        handle: u16,
        /// The new connection parameters.
        params: ConnectionParameters,
    },
    /// A connection has been terminated.
    DisconnectionCompleted {
        /// Connection handle.
        handle: u16,
        /// Reason for the disconnection.
        reason: HciStatus,
    },
}

/// A connected device as reported by the kernel connection list.
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    /// Connection handle.
    pub handle: u16,
    /// Address of the remote device.
    pub address: BleAddress,
    /// Kernel connection state.
    pub state: u16,
    /// Link mode flags.
    pub link_mode: u32,
}

impl fmt::Display for ConnectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectedDevice({}, handle={}, state={})", self.address, self.handle, self.state)
    }
}

/// Baseband link type of a kernel connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum LinkType {
    /// Synchronous connection oriented link.
    Sco = sys::SCO_LINK,
    /// Asynchronous connection oriented link.
    Acl = sys::ACL_LINK,
    /// Extended synchronous link.
    Esco = sys::ESCO_LINK,
    /// Bluetooth Low Energy link.
    Le = sys::LE_LINK,
    /// Alternate MAC/PHY link.
    Amp = sys::AMP_LINK,
}

/// HCI status code.
///
/// See Volume 2, Part D, Section 1.3 "List of Error Codes" of the
/// Bluetooth Core Specification.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HciStatus(pub u8);

impl HciStatus {
    /// Returns the specification name of the status code.
    pub fn name(self) -> &'static str {
        match self.0 {
            0x00 => "Success",
            0x01 => "Unknown HCI Command",
            0x02 => "Unknown Connection Identifier",
            0x03 => "Hardware Failure",
            0x04 => "Page Timeout",
            0x05 => "Authentication Failure",
            0x06 => "PIN or Key Missing",
            0x07 => "Memory Capacity Exceeded",
            0x08 => "Connection Timeout",
            0x09 => "Connection Limit Exceeded",
            0x0a => "Synchronous Connection Limit To A Device Exceeded",
            0x0b => "ACL Connection Already Exists",
            0x0c => "Command Disallowed",
            0x0d => "Connection Rejected due to Limited Resources",
            0x0e => "Connection Rejected Due To Security Reasons",
            0x0f => "Connection Rejected due to Unacceptable BD_ADDR",
            0x10 => "Connection Accept Timeout Exceeded",
            0x11 => "Unsupported Feature or Parameter Value",
            0x12 => "Invalid HCI Command Parameters",
            0x13 => "Remote User Terminated Connection",
            0x14 => "Remote Device Terminated Connection due to Low Resources",
            0x15 => "Remote Device Terminated Connection due to Power Off",
            0x16 => "Connection Terminated By Local Host",
            0x17 => "Repeated Attempts",
            0x18 => "Pairing Not Allowed",
            0x19 => "Unknown LMP PDU",
            0x1a => "Unsupported Remote Feature / Unsupported LMP Feature",
            0x1e => "Invalid LMP Parameters / Invalid LL Parameters",
            0x1f => "Unspecified Error",
            0x20 => "Unsupported LMP Parameter Value / Unsupported LL Parameter Value",
            0x21 => "Role Change Not Allowed",
            0x22 => "LMP Response Timeout / LL Response Timeout",
            0x25 => "Encryption Mode Not Acceptable",
            0x26 => "Link Key cannot be Changed",
            0x28 => "Instant Passed",
            0x29 => "Pairing With Unit Key Not Supported",
            0x2a => "Different Transaction Collision",
            0x2f => "Insufficient Security",
            0x30 => "Parameter Out Of Mandatory Range",
            0x34 => "Reserved Slot Violation",
            0x35 => "Role Switch Failed",
            0x37 => "Secure Simple Pairing Not Supported By Host",
            0x38 => "Host Busy - Pairing",
            0x39 => "Connection Rejected due to No Suitable Channel Found",
            0x3a => "Controller Busy",
            0x3b => "Unacceptable Connection Parameters",
            0x3c => "Directed Advertising Timeout",
            0x3d => "Connection Terminated due to MIC Failure",
            0x3e => "Connection Failed to be Established",
            0x3f => "MAC Connection Failed",
            0x40 => "Coarse Clock Adjustment Rejected but Will Try to Adjust Using Clock Dragging",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for HciStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), self.0)
    }
}

/// HCI command submission and connection enumeration.
///
/// The seam between the connection parameter manager and the socket;
/// implemented by [HciSocket] in production.
pub trait HciCommands: Send + Sync {
    /// Requests the controller to update the parameters of the connection
    /// with the given handle.
    ///
    /// The parameters are validated against the constraints the kernel
    /// checker applies; invalid parameters are rejected without
    /// submitting the command.
    fn request_connection_update(&self, handle: u16, params: &ConnectionParameters) -> Result<()>;

    /// Returns all currently connected Bluetooth LE devices.
    fn connected_devices(&self) -> Result<Vec<ConnectedDevice>>;
}

struct Inner {
    fd: AsyncFd<OwnedFd>,
    device_id: u16,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HciEvent>>>,
}

/// Bound kernel HCI socket for a single `hciN` device.
///
/// Owns the file descriptor and a reader task. The reader parses incoming
/// event frames and fans them out to all subscribers registered through
/// [events](Self::events). Dropping the socket stops the reader.
pub struct HciSocket {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
}

impl fmt::Debug for HciSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HciSocket {{ device_id: {} }}", self.inner.device_id)
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl HciSocket {
    /// Opens and binds an HCI socket for the device with the given id
    /// (typically 0 for `hci0`).
    ///
    /// If `net_ns_fd` is supplied the socket is created inside that
    /// network namespace.
    pub fn open(device_id: u16, net_ns_fd: Option<RawFd>) -> Result<Self> {
        log::info!("creating hci socket for device hci{device_id}");

        let fd = match net_ns_fd {
            None => sock::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI)?,
            Some(ns_fd) => sock::socket_in_ns(ns_fd, libc::AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI)?,
        };

        set_socket_filter(&fd)?;
        bind_socket(&fd, device_id)?;

        let inner = Arc::new(Inner {
            fd: AsyncFd::new(fd)?,
            device_id,
            subscribers: Mutex::new(Vec::new()),
        });
        let reader = tokio::spawn(reader_task(inner.clone()));

        Ok(Self { inner, reader })
    }

    /// Stream of events received from the driver.
    pub fn events(&self) -> mpsc::UnboundedReceiver<HciEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn send_command(&self, ogf: u16, ocf: u16, data: &[u8]) -> Result<()> {
        let pkt = command_packet(ogf, ocf, data);
        sock::send(self.inner.fd.get_ref(), &pkt, 0)?;
        Ok(())
    }
}

impl HciCommands for HciSocket {
    fn request_connection_update(&self, handle: u16, params: &ConnectionParameters) -> Result<()> {
        let min_interval = (params.minimum_interval() / 1.25) as u16;
        let max_interval = (params.maximum_interval() / 1.25) as u16;
        let latency = params.latency();
        let supervision_timeout = (params.supervision_timeout() / 10) as u16;

        if !check_connection_params(min_interval, max_interval, latency, supervision_timeout) {
            log::warn!("invalid connection parameters, aborting request");
            return Err(Error::with_message(ErrorKind::InvalidArguments, "invalid connection parameters"));
        }

        let payload = conn_update_payload(handle, min_interval, max_interval, latency, supervision_timeout);
        self.send_command(sys::OGF_LE_CTL, sys::OCF_LE_CONN_UPDATE, &payload)
    }

    fn connected_devices(&self) -> Result<Vec<ConnectedDevice>> {
        let mut req = sys::hci_conn_list_req {
            dev_id: self.inner.device_id,
            conn_num: sys::HCI_MAX_CONN_INFO as u16,
            conn_info: [sys::hci_conn_info::default(); sys::HCI_MAX_CONN_INFO],
        };

        sock::ioctl_inout(self.inner.fd.get_ref(), sys::HCIGETCONNLIST, &mut req).map_err(|err| {
            log::warn!("HCIGETCONNLIST ioctl failed: {err}");
            Error::from(err)
        })?;

        let count = usize::from(req.conn_num).min(sys::HCI_MAX_CONN_INFO);
        let devices = req.conn_info[..count]
            .iter()
            .filter(|info| LinkType::from_u8(info.type_) == Some(LinkType::Le))
            .map(|info| ConnectedDevice {
                handle: info.handle,
                address: BleAddress::from_lsb(info.bdaddr),
                state: info.state,
                link_mode: info.link_mode,
            })
            .collect();
        Ok(devices)
    }
}

/// Sets the HCI filter so only the events we care about are delivered.
fn set_socket_filter(fd: &OwnedFd) -> Result<()> {
    let type_mask = 1u32 << sys::HCI_EVENT_PKT;
    let event_mask = [1u32 << sys::EVT_DISCONN_COMPLETE, 1u32 << (sys::EVT_LE_META_EVENT - 32)];

    // fetch the current filter first in case it doesn't need changing
    match sock::getsockopt::<sys::hci_filter>(fd, sys::SOL_HCI, sys::HCI_FILTER) {
        Ok(filter)
            if (filter.type_mask & type_mask) == type_mask
                && (filter.event_mask[0] & event_mask[0]) == event_mask[0]
                && (filter.event_mask[1] & event_mask[1]) == event_mask[1] =>
        {
            log::info!("hci filter already matches, no need to reset");
            return Ok(());
        }
        Ok(filter) => {
            log::debug!(
                "hci filter was [ type=0x{:04x} events={{0x{:08x}, 0x{:08x}}} ]",
                filter.type_mask,
                filter.event_mask[0],
                filter.event_mask[1]
            );
        }
        Err(err) => log::warn!("failed to get hci socket filter: {err}"),
    }

    log::info!(
        "setting hci filter to [ type=0x{:04x} events={{0x{:08x}, 0x{:08x}}} ]",
        type_mask,
        event_mask[0],
        event_mask[1]
    );

    let filter = sys::hci_filter { type_mask, event_mask, opcode: 0 };
    sock::setsockopt(fd, sys::SOL_HCI, sys::HCI_FILTER, &filter).map_err(|err| {
        log::warn!("failed to set hci socket filter: {err}");
        Error::from(err)
    })
}

/// Binds the HCI socket to the given device.
fn bind_socket(fd: &OwnedFd, device_id: u16) -> Result<()> {
    let addr = sys::sockaddr_hci {
        hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        hci_dev: device_id,
        hci_channel: sys::HCI_CHANNEL_RAW,
    };

    match sock::bind(fd, &addr) {
        Ok(()) => Ok(()),
        // EALREADY is returned if the socket is already bound
        Err(err) if err.raw_os_error() == Some(libc::EALREADY) => Ok(()),
        Err(err) => {
            log::warn!("failed to bind to hci socket: {err}");
            Err(err.into())
        }
    }
}

/// Assembles a full HCI command packet.
fn command_packet(ogf: u16, ocf: u16, data: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(sys::HCI_TYPE_LEN + 3 + data.len());
    pkt.push(sys::HCI_COMMAND_PKT);
    let opcode = (ocf & 0x03ff) | (ogf << 10);
    pkt.extend_from_slice(&opcode.to_le_bytes());
    pkt.push(data.len() as u8);
    pkt.extend_from_slice(data);
    pkt
}

/// Assembles the parameter block of an `LE Connection Update` command.
///
/// All values are in raw controller units and little-endian on the wire.
fn conn_update_payload(handle: u16, min: u16, max: u16, latency: u16, supervision_timeout: u16) -> [u8; sys::LE_CONN_UPDATE_CP_SIZE] {
    let mut payload = [0u8; sys::LE_CONN_UPDATE_CP_SIZE];
    payload[0..2].copy_from_slice(&handle.to_le_bytes());
    payload[2..4].copy_from_slice(&min.to_le_bytes());
    payload[4..6].copy_from_slice(&max.to_le_bytes());
    payload[6..8].copy_from_slice(&latency.to_le_bytes());
    payload[8..10].copy_from_slice(&supervision_timeout.to_le_bytes());
    // minimum and maximum connection event length are left at zero
    payload
}

/// Checks that the supplied connection parameters are valid. The rules are
/// borrowed from the kernel checker code; all values are in raw units.
pub(crate) fn check_connection_params(min: u16, max: u16, latency: u16, supervision_timeout: u16) -> bool {
    if min > max || min < 6 || max > 3200 {
        return false;
    }

    if !(10..=3200).contains(&supervision_timeout) {
        return false;
    }

    if u32::from(max) >= u32::from(supervision_timeout) * 8 {
        return false;
    }

    let max_latency = (u32::from(supervision_timeout) * 8 / u32::from(max)) - 1;
    if latency > 499 || u32::from(latency) > max_latency {
        return false;
    }

    true
}

fn malformed(msg: String) -> Error {
    Error::with_message(ErrorKind::Internal(InternalErrorKind::InvalidValue), msg)
}

fn le16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn scaled_params(interval_raw: u16, latency: u16, supervision_timeout_raw: u16) -> ConnectionParameters {
    let interval_ms = f64::from(interval_raw) * 1.25;
    let supervision_timeout_ms = u32::from(supervision_timeout_raw) * 10;
    ConnectionParameters::new(interval_ms, interval_ms, latency, supervision_timeout_ms)
}

/// Parses one frame read from the socket.
///
/// Returns `Ok(None)` for frames that are valid but not interesting
/// (filtered packet types, unknown sub events, failed statuses) and an
/// error for malformed frames.
pub(crate) fn parse_event(buf: &[u8]) -> Result<Option<HciEvent>> {
    if buf.is_empty() {
        return Err(malformed("empty read from hci socket".into()));
    }

    if buf[0] != sys::HCI_EVENT_PKT {
        log::info!("odd, received non-event packet even though it should be filtered out");
        return Ok(None);
    }
    let buf = &buf[sys::HCI_TYPE_LEN..];

    if buf.len() < sys::HCI_EVENT_HDR_SIZE {
        return Err(malformed(format!("read too short message from hci socket ({} bytes)", buf.len())));
    }
    let event = buf[0];
    let plen = usize::from(buf[1]);
    let payload = &buf[sys::HCI_EVENT_HDR_SIZE..];

    if payload.len() != plen {
        return Err(malformed("size of received event doesn't match header value".into()));
    }

    match event {
        sys::EVT_DISCONN_COMPLETE => {
            if payload.len() < sys::EVT_DISCONN_COMPLETE_SIZE {
                return Err(malformed(format!(
                    "disconnect event has invalid size (expected:{} actual:{})",
                    sys::EVT_DISCONN_COMPLETE_SIZE,
                    payload.len()
                )));
            }

            let status = HciStatus(payload[0]);
            let handle = le16(&payload[1..3]);
            let reason = HciStatus(payload[3]);
            log::debug!("EVT_DISCONN_COMPLETE - {{ {status}, {handle}, {reason} }}");

            if status.0 != 0x00 {
                log::warn!("disconnection failed ({status})");
                return Ok(None);
            }

            Ok(Some(HciEvent::DisconnectionCompleted { handle, reason }))
        }

        sys::EVT_LE_META_EVENT => {
            if payload.len() < sys::EVT_LE_META_EVENT_SIZE {
                return Err(malformed(format!(
                    "le meta event has invalid size (expected:{} actual:{})",
                    sys::EVT_LE_META_EVENT_SIZE,
                    payload.len()
                )));
            }
            let subevent = payload[0];
            let data = &payload[sys::EVT_LE_META_EVENT_SIZE..];

            match subevent {
                sys::EVT_LE_CONN_COMPLETE => {
                    if data.len() < sys::EVT_LE_CONN_COMPLETE_SIZE {
                        return Err(malformed(format!(
                            "le connection complete event has invalid size (expected:{} actual:{})",
                            sys::EVT_LE_CONN_COMPLETE_SIZE,
                            data.len()
                        )));
                    }

                    let status = HciStatus(data[0]);
                    let handle = le16(&data[1..3]);
                    let mut bdaddr = [0u8; 6];
                    bdaddr.copy_from_slice(&data[5..11]);
                    let address = BleAddress::from_lsb(bdaddr);
                    let interval = le16(&data[11..13]);
                    let latency = le16(&data[13..15]);
                    let supervision_timeout = le16(&data[15..17]);

                    log::debug!(
                        "EVT_LE_CONN_COMPLETE - {{ {status}, {address}, {handle}, {interval}, {latency}, {supervision_timeout} }}"
                    );

                    if status.0 != 0x00 {
                        log::warn!("connection failed ({status})");
                        return Ok(None);
                    }

                    Ok(Some(HciEvent::ConnectionCompleted {
                        handle,
                        address,
                        params: scaled_params(interval, latency, supervision_timeout),
                    }))
                }

                sys::EVT_LE_CONN_UPDATE_COMPLETE => {
                    if data.len() < sys::EVT_LE_CONN_UPDATE_COMPLETE_SIZE {
                        return Err(malformed(format!(
                            "le connection update event has invalid size (expected:{} actual:{})",
                            sys::EVT_LE_CONN_UPDATE_COMPLETE_SIZE,
                            data.len()
                        )));
                    }

                    let status = HciStatus(data[0]);
                    let handle = le16(&data[1..3]);
                    let interval = le16(&data[3..5]);
                    let latency = le16(&data[5..7]);
                    let supervision_timeout = le16(&data[7..9]);

                    log::debug!(
                        "EVT_LE_CONN_UPDATE_COMPLETE - {{ {status}, {handle}, {interval}, {latency}, {supervision_timeout} }}"
                    );

                    if status.0 != 0x00 {
                        log::warn!("update connection failed ({status})");
                        return Ok(None);
                    }

                    Ok(Some(HciEvent::ConnectionUpdated {
                        handle,
                        params: scaled_params(interval, latency, supervision_timeout),
                    }))
                }

                _ => Ok(None),
            }
        }

        _ => Ok(None),
    }
}

/// Reads frames from the socket and fans parsed events out to subscribers.
///
/// Exits after [MAX_CONSECUTIVE_ERRORS] unexpected errors in a row or when
/// the socket is closed by the kernel.
async fn reader_task(inner: Arc<Inner>) {
    let mut consecutive_errors = 0u32;

    loop {
        let mut buf = [0u8; sys::HCI_MAX_EVENT_SIZE];
        let mut read_buf = ReadBuf::new(&mut buf);

        let read = loop {
            let mut guard = match inner.fd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    log::error!("failed to poll hci socket: {err}");
                    return;
                }
            };
            match guard.try_io(|fd| sock::recv(fd.get_ref(), &mut read_buf, 0)) {
                Ok(result) => break result,
                Err(_would_block) => continue,
            }
        };

        match read {
            Ok(0) => {
                log::error!("hci socket closed by kernel, stopping reader");
                return;
            }
            Ok(_) => match parse_event(read_buf.filled()) {
                Ok(Some(event)) => {
                    consecutive_errors = 0;
                    let mut subscribers = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
                    subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
                }
                Ok(None) => consecutive_errors = 0,
                Err(err) => {
                    log::warn!("dropping hci frame [{}]: {err}", hex::encode(read_buf.filled()));
                    consecutive_errors += 1;
                }
            },
            Err(err) => {
                log::warn!("failed to read from hci socket: {err}");
                consecutive_errors += 1;
            }
        }

        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            log::error!("too many consecutive hci errors, stopping reader");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_le_connection_complete_event() {
        let frame = [
            0x04, 0x3e, 0x13, 0x01, 0x00, 0x40, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x18, 0x00, 0x00, 0x00, 0xf4, 0x01, 0x00,
        ];
        let event = parse_event(&frame).unwrap().unwrap();
        assert_eq!(
            event,
            HciEvent::ConnectionCompleted {
                handle: 0x0040,
                address: "66:55:44:33:22:11".parse().unwrap(),
                params: ConnectionParameters::new(30.0, 30.0, 0, 5000),
            }
        );
    }

    #[test]
    fn parses_le_connection_update_complete_event() {
        // interval 0x000c (15 ms), latency 332, supervision timeout 15000 ms
        let frame = [0x04, 0x3e, 0x0a, 0x03, 0x00, 0x40, 0x00, 0x0c, 0x00, 0x4c, 0x01, 0xdc, 0x05];
        let event = parse_event(&frame).unwrap().unwrap();
        assert_eq!(
            event,
            HciEvent::ConnectionUpdated {
                handle: 0x0040,
                params: ConnectionParameters::new(15.0, 15.0, 332, 15000),
            }
        );
    }

    #[test]
    fn parses_disconnection_complete_event() {
        let frame = [0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13];
        let event = parse_event(&frame).unwrap().unwrap();
        assert_eq!(event, HciEvent::DisconnectionCompleted { handle: 0x0040, reason: HciStatus(0x13) });
    }

    #[test]
    fn failed_status_is_dropped_without_error() {
        let frame = [0x04, 0x05, 0x04, 0x08, 0x40, 0x00, 0x13];
        assert_eq!(parse_event(&frame).unwrap(), None);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        // header length larger than the actual payload
        assert!(parse_event(&[0x04, 0x05, 0x04, 0x00, 0x40]).is_err());
        // no event header at all
        assert!(parse_event(&[0x04]).is_err());
        // sub event payload too short for its advertised type
        assert!(parse_event(&[0x04, 0x3e, 0x03, 0x01, 0x00, 0x40]).is_err());
    }

    #[test]
    fn non_event_packets_are_ignored() {
        assert_eq!(parse_event(&[0x02, 0x00, 0x00]).unwrap(), None);
    }

    #[test]
    fn unknown_sub_events_are_ignored() {
        let frame = [0x04, 0x3e, 0x02, 0x0a, 0x00];
        assert_eq!(parse_event(&frame).unwrap(), None);
    }

    #[test]
    fn connection_update_command_encoding() {
        let payload = conn_update_payload(0x0040, 12, 12, 332, 1500);
        let pkt = command_packet(sys::OGF_LE_CTL, sys::OCF_LE_CONN_UPDATE, &payload);
        assert_eq!(
            pkt,
            vec![
                0x01, 0x13, 0x20, 0x0e, 0x40, 0x00, 0x0c, 0x00, 0x0c, 0x00, 0x4c, 0x01, 0xdc, 0x05,
                0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn connection_param_checker_matches_kernel_rules() {
        assert!(check_connection_params(12, 12, 332, 1500));
        // min above max
        assert!(!check_connection_params(13, 12, 0, 1500));
        // interval out of range
        assert!(!check_connection_params(5, 12, 0, 1500));
        assert!(!check_connection_params(12, 3201, 0, 3200));
        // supervision timeout out of range
        assert!(!check_connection_params(12, 12, 0, 9));
        assert!(!check_connection_params(12, 12, 0, 3201));
        // supervision timeout must exceed the maximum interval
        assert!(!check_connection_params(12, 400, 0, 50));
        // latency cap
        assert!(!check_connection_params(12, 12, 500, 1500));
        assert!(!check_connection_params(6, 2000, 499, 1000));
    }
}
