use crate::error::HostError;
use crate::session::SessionId;
use crate::urb_bridge::UrbBridge;
use crate::Direction;
use std::fmt::Debug;
use std::sync::Weak;

pub mod simulated;

/// Correlates a hardware transfer with the session and URB it serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub session: SessionId,
    pub seqnum: u32,
}

/// One transfer to perform on the hardware
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrbRequest {
    pub key: TransferKey,
    pub bus_id: String,
    /// Endpoint address, with 0x80 set for IN transfers
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer_flags: u32,
    pub setup: [u8; 8],
    pub interval: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    /// Payload of an OUT transfer
    pub data: Vec<u8>,
    /// Bytes reserved for an IN transfer
    pub buffer_length: usize,
    pub iso_packet_descriptor: Vec<u8>,
}

impl UrbRequest {
    pub fn is_control(&self) -> bool {
        self.endpoint & 0x0f == 0
    }
}

/// Outcome of a hardware transfer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferCompletion {
    /// 0 or a negative errno
    pub status: i32,
    pub actual_length: usize,
    /// Data read by an IN transfer
    pub data: Vec<u8>,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub iso_packet_descriptor: Vec<u8>,
}

impl TransferCompletion {
    /// Successful IN transfer returning `data`
    pub fn read(data: Vec<u8>) -> Self {
        Self {
            actual_length: data.len(),
            data,
            ..Default::default()
        }
    }

    /// Successful OUT transfer that wrote `actual_length` bytes
    pub fn written(actual_length: usize) -> Self {
        Self {
            actual_length,
            ..Default::default()
        }
    }

    /// Failed transfer; `errno` may be given with either sign
    pub fn failed(errno: i32) -> Self {
        Self {
            status: -errno.abs(),
            ..Default::default()
        }
    }
}

/// Handle through which a host reports the fate of one transfer
///
/// Both methods may be called from any thread and never block. Only the
/// first report for a transfer reaches the client; later ones are dropped.
#[derive(Clone, Debug)]
pub struct CompletionSink {
    bridge: Weak<UrbBridge>,
    key: TransferKey,
}

impl CompletionSink {
    pub(crate) fn new(bridge: Weak<UrbBridge>, key: TransferKey) -> Self {
        Self { bridge, key }
    }

    pub fn key(&self) -> TransferKey {
        self.key
    }

    /// Report that the transfer finished; returns whether the report was delivered
    pub fn complete(&self, completion: TransferCompletion) -> bool {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.on_hardware_completion(self.key.seqnum, completion),
            None => false,
        }
    }

    /// Acknowledge a cancellation with the status to report, usually `-ECONNRESET`
    pub fn unlinked(&self, status: i32) -> bool {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.on_unlink_acknowledged(self.key.seqnum, status),
            None => false,
        }
    }
}

/// What the engine needs from the USB host side
pub trait UsbHostInterface: Send + Sync + Debug {
    /// Start a transfer without waiting for it
    ///
    /// Must not block beyond taking a queue slot; a saturated queue is
    /// reported as [HostError::QueueFull].
    fn submit(&self, request: UrbRequest, sink: CompletionSink) -> Result<(), HostError>;

    /// Ask for a transfer to be cancelled
    ///
    /// A host that manages to cancel acknowledges through
    /// [CompletionSink::unlinked]; one that is too late just completes it.
    fn cancel(&self, key: TransferKey);
}
