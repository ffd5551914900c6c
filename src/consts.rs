use num_derive::FromPrimitive;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// USB/IP protocol version carried in every OP PDU
pub const USBIP_VERSION: u16 = 0x0111;

/// Conventional TCP port of a USB/IP server
pub const USBIP_PORT: u16 = 3240;

pub const OP_REQUEST: u16 = 0x80 << 8;
pub const OP_REPLY: u16 = 0x00 << 8;

pub const OP_DEVINFO: u16 = 0x02;
pub const OP_IMPORT: u16 = 0x03;
pub const OP_DEVLIST: u16 = 0x05;
pub const OP_EXPORT: u16 = 0x06;
pub const OP_UNEXPORT: u16 = 0x07;

pub const OP_REQ_DEVINFO: u16 = OP_REQUEST | OP_DEVINFO;
pub const OP_REP_DEVINFO: u16 = OP_REPLY | OP_DEVINFO;
pub const OP_REQ_IMPORT: u16 = OP_REQUEST | OP_IMPORT;
pub const OP_REP_IMPORT: u16 = OP_REPLY | OP_IMPORT;
pub const OP_REQ_DEVLIST: u16 = OP_REQUEST | OP_DEVLIST;
pub const OP_REP_DEVLIST: u16 = OP_REPLY | OP_DEVLIST;
pub const OP_REQ_EXPORT: u16 = OP_REQUEST | OP_EXPORT;
pub const OP_REP_EXPORT: u16 = OP_REPLY | OP_EXPORT;
pub const OP_REQ_UNEXPORT: u16 = OP_REQUEST | OP_UNEXPORT;
pub const OP_REP_UNEXPORT: u16 = OP_REPLY | OP_UNEXPORT;

pub const USBIP_CMD_SUBMIT: u16 = 0x0001;
pub const USBIP_CMD_UNLINK: u16 = 0x0002;
pub const USBIP_RET_SUBMIT: u16 = 0x0003;
pub const USBIP_RET_UNLINK: u16 = 0x0004;

pub const USBIP_DIR_OUT: u32 = 0x00;
pub const USBIP_DIR_IN: u32 = 0x01;

/// Width of the sysfs path field in a device record
pub const SYSFS_PATH_MAX: usize = 256;
/// Width of the bus id field in a device record and import request
pub const SYSFS_BUS_ID_SIZE: usize = 32;
/// Upper bound of interfaces a device may announce
pub const MAX_INTERFACES: usize = 32;
/// Size of one isochronous packet descriptor following a CMD_SUBMIT/RET_SUBMIT
pub const ISO_PACKET_DESCRIPTOR_SIZE: usize = 16;
/// Largest payload accepted in a single CMD_SUBMIT unless configured otherwise
pub const DEFAULT_MAX_TRANSFER_LENGTH: usize = 16 * 1024 * 1024;

/// Status carried in the common header of OP replies
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpStatus {
    Ok = 0x00,
    /// Request not available or not supported
    NotAvailable = 0x01,
    /// Device requested for import is in use
    DevBusy = 0x02,
    /// Device requested for import is in error state
    DevError = 0x03,
    NoDevice = 0x04,
    Error = 0x05,
}

pub const ST_OK: u32 = OpStatus::Ok as u32;
pub const ST_NA: u32 = OpStatus::NotAvailable as u32;
pub const ST_DEV_BUSY: u32 = OpStatus::DevBusy as u32;
pub const ST_DEV_ERR: u32 = OpStatus::DevError as u32;
pub const ST_NODEV: u32 = OpStatus::NoDevice as u32;
pub const ST_ERROR: u32 = OpStatus::Error as u32;

/// Transfer direction as encoded in the basic URB header
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// Device speed as reported in a device record (`enum usb_device_speed`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UsbSpeed {
    #[default]
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
    SuperPlus = 6,
}

/// URB command codes carried in the low half of the basic header's command word
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbIpCommandCode {
    CmdSubmit = 0x0001,
    CmdUnlink = 0x0002,
    RetSubmit = 0x0003,
    RetUnlink = 0x0004,
}

/// Linux errno values reported in RET_SUBMIT and RET_UNLINK status fields
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EXDEV: i32 = 18;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const EOVERFLOW: i32 = 75;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
}
