//! System native types and constants for the kernel HCI interface.

#![allow(non_camel_case_types)]

use libc::{c_ushort, sa_family_t};

pub const BTPROTO_HCI: i32 = 1;

pub const SOL_HCI: i32 = 0;
pub const HCI_FILTER: i32 = 2;

pub const HCI_CHANNEL_RAW: c_ushort = 0;

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

pub const HCI_TYPE_LEN: usize = 1;
pub const HCI_EVENT_HDR_SIZE: usize = 2;
pub const HCI_MAX_EVENT_SIZE: usize = 260;

#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: c_ushort,
    pub hci_channel: c_ushort,
}

#[repr(C)]
#[derive(Clone, Default)]
pub struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_DISCONN_COMPLETE_SIZE: usize = 4;

pub const EVT_LE_META_EVENT: u8 = 0x3e;
pub const EVT_LE_META_EVENT_SIZE: usize = 1;

pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_CONN_COMPLETE_SIZE: usize = 18;

pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_CONN_UPDATE_COMPLETE_SIZE: usize = 9;

pub const OGF_LE_CTL: u16 = 0x08;
pub const OCF_LE_CONN_UPDATE: u16 = 0x0013;
pub const LE_CONN_UPDATE_CP_SIZE: usize = 14;

/// `_IOR('H', 212, int)`
pub const HCIGETCONNLIST: libc::c_ulong = 0x800448d4;

pub const SCO_LINK: u8 = 0x00;
pub const ACL_LINK: u8 = 0x01;
pub const ESCO_LINK: u8 = 0x02;
pub const LE_LINK: u8 = 0x80;
pub const AMP_LINK: u8 = 0x81;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct hci_conn_info {
    pub handle: u16,
    pub bdaddr: [u8; 6],
    pub type_: u8,
    pub out: u8,
    pub state: u16,
    pub link_mode: u32,
}

pub const HCI_MAX_CONN_INFO: usize = 10;

#[repr(C)]
#[derive(Clone)]
pub struct hci_conn_list_req {
    pub dev_id: u16,
    pub conn_num: u16,
    pub conn_info: [hci_conn_info; HCI_MAX_CONN_INFO],
}
