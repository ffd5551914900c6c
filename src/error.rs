use crate::errno;
use thiserror::Error;

/// Coarse classification deciding how a failure is surfaced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Broken framing or protocol violation, always closes the connection
    Protocol,
    /// Problem with the requested device, reported in a status field when a reply is owed
    Device,
    /// Rejected submit/unlink, the session stays open
    Transfer,
    /// Host controller failure, surfaced as a non-OK completion status
    Hardware,
    /// Socket failure, fatal to that connection only
    Network,
}

/// Errors that end or refuse a USB/IP operation
#[derive(Debug, Error)]
pub enum UsbIpError {
    #[error("USB/IP version mismatch: got {found:#06x}, expected {expected:#06x}")]
    VersionMismatch { found: u16, expected: u16 },

    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u32),

    #[error("unexpected {opcode} while {phase}")]
    UnexpectedOpcode {
        opcode: &'static str,
        phase: &'static str,
    },

    #[error("malformed {record}: needed {needed} bytes, got {available}")]
    MalformedPdu {
        record: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid {field} in PDU: {value}")]
    InvalidField { field: &'static str, value: i64 },

    #[error("no exported device with bus id {0}")]
    NoDevice(String),

    #[error("device {0} was detached")]
    DeviceGone(String),

    #[error("device {bus_id:?} cannot be exported: {reason}")]
    InvalidDescriptor { bus_id: String, reason: String },

    #[error("device registry is full ({capacity} devices)")]
    RegistryFull { capacity: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UsbIpError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::VersionMismatch { .. }
            | Self::UnknownOpcode(_)
            | Self::UnexpectedOpcode { .. }
            | Self::MalformedPdu { .. }
            | Self::InvalidField { .. } => FaultKind::Protocol,
            Self::NoDevice(_)
            | Self::DeviceGone(_)
            | Self::InvalidDescriptor { .. }
            | Self::RegistryFull { .. } => FaultKind::Device,
            Self::Io(_) => FaultKind::Network,
        }
    }

    /// Whether the peer simply hung up between PDUs
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    pub(crate) fn short(record: &'static str, needed: usize, available: usize) -> Self {
        Self::MalformedPdu {
            record,
            needed,
            available,
        }
    }
}

/// Reasons the URB bridge refuses a CMD_SUBMIT
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubmitRejected {
    #[error("no device imported on this session")]
    NoActiveImport,
    #[error("sequence number {0} is already pending")]
    DuplicateSequence(u32),
    #[error("endpoint {0:#04x} not found")]
    UnknownEndpoint(u8),
    #[error("transfer queue is full")]
    TransferQueueFull,
    #[error("host refused the transfer: {0}")]
    Hardware(String),
}

impl SubmitRejected {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Hardware(_) => FaultKind::Hardware,
            _ => FaultKind::Transfer,
        }
    }

    /// Negative errno reported in RET_SUBMIT, or `None` when no reply may be sent
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::NoActiveImport => Some(-errno::ENODEV),
            Self::DuplicateSequence(_) => None,
            Self::UnknownEndpoint(_) => Some(-errno::EPIPE),
            Self::TransferQueueFull => Some(-errno::EBUSY),
            Self::Hardware(_) => Some(-errno::EIO),
        }
    }
}

/// Reasons the URB bridge refuses a CMD_UNLINK
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnlinkRejected {
    #[error("no pending transfer with sequence number {0}")]
    NotFound(u32),
    #[error("transfer {0} is already being unlinked")]
    AlreadyUnlinking(u32),
}

/// Errors a [crate::UsbHostInterface] reports when it cannot take a transfer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host transfer queue is saturated")]
    QueueFull,
    #[error("endpoint {0:#04x} does not exist on the device")]
    UnknownEndpoint(u8),
    #[error("device {0} is not open on the host")]
    NoDevice(String),
    #[error("host controller error: {0}")]
    Hardware(String),
}

/// Why an import request could not be granted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportRefusal {
    NoDevice,
    Busy,
}

pub type Result<T, E = UsbIpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_faults_are_classified() {
        let err = UsbIpError::VersionMismatch {
            found: 0x0106,
            expected: 0x0111,
        };
        assert_eq!(err.kind(), FaultKind::Protocol);
        assert!(err.to_string().contains("0x0106"));
        assert_eq!(
            UsbIpError::short("op_common", 8, 3).kind(),
            FaultKind::Protocol
        );
    }

    #[test]
    fn eof_is_recognized() {
        let err = UsbIpError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_eof());
        assert_eq!(err.kind(), FaultKind::Network);
        assert!(!UsbIpError::DeviceGone("1-1".into()).is_eof());
    }

    #[test]
    fn hardware_rejections_are_hardware_faults() {
        assert_eq!(
            SubmitRejected::Hardware("stall".into()).kind(),
            FaultKind::Hardware
        );
        assert_eq!(SubmitRejected::TransferQueueFull.kind(), FaultKind::Transfer);
    }

    #[test]
    fn rejections_map_to_negative_errno() {
        assert_eq!(
            SubmitRejected::UnknownEndpoint(0x81).errno(),
            Some(-errno::EPIPE)
        );
        assert_eq!(SubmitRejected::TransferQueueFull.errno(), Some(-16));
        assert_eq!(SubmitRejected::DuplicateSequence(3).errno(), None);
    }
}
