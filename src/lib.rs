//! A library for exporting USB devices over USB/IP
//!
//! The [UsbIpServer] keeps a registry of exportable devices and speaks the
//! USB/IP protocol with remote clients. Actual transfers are performed by a
//! [UsbHostInterface]: the bundled [SimulatedHost] for tests and demos, or
//! the `rusb` backend for real hardware.

mod config;
mod consts;
mod device;
pub mod error;
mod host;
mod registry;
mod session;
mod urb_bridge;
pub mod usbip_protocol;
mod util;
pub use config::ServerConfig;
pub use consts::*;
pub use device::*;
pub use error::{
    FaultKind, HostError, ImportRefusal, SubmitRejected, UnlinkRejected, UsbIpError,
};
pub use host::simulated::SimulatedHost;
pub use host::{CompletionSink, TransferCompletion, TransferKey, UrbRequest, UsbHostInterface};
pub use registry::{AttachOutcome, DeviceRegistry};
pub use session::{
    CloseReason, EventReceiver, EventSender, Phase, Session, SessionEvent, SessionId,
};
pub use urb_bridge::{PendingTransfer, UrbBridge};
pub use util::*;
mod usbip_server;
#[cfg(feature = "nusb")]
pub use usbip_server::nusb_impl;
#[cfg(feature = "rusb")]
pub use usbip_server::rusb_impl::RusbHost;
pub use usbip_server::{
    UsbIpServer,
    server::{handler, server},
};
