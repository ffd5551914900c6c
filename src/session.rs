use crate::error::{ImportRefusal, Result, SubmitRejected, UsbIpError};
use crate::urb_bridge::UrbBridge;
use crate::usbip_protocol::{CmdSubmitHeader, CmdUnlinkHeader, UsbIpCommand, UsbIpResponse};
use crate::util::from_fixed_field;
use crate::*;
use log::*;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one connection for claims, logs and transfer keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the connection's writer has to act on
#[derive(Debug)]
pub enum SessionEvent {
    /// A PDU to send, possibly produced on the host's execution context
    Reply(UsbIpResponse),
    /// The imported device was detached; close without a further reply
    DeviceGone(String),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ProtocolFault,
    DeviceGone,
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    /// Listing and importing; stays here after a refused import
    Negotiating,
    Attached {
        bus_id: String,
        devid: u32,
    },
    Closed(CloseReason),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake => "in handshake",
            Self::Negotiating => "negotiating",
            Self::Attached { .. } => "attached",
            Self::Closed(_) => "closed",
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    server: Arc<UsbIpServer>,
    phase: Phase,
    version: Option<u16>,
    bridge: Option<Arc<UrbBridge>>,
    highest_seqnum: Option<u32>,
    events: EventSender,
}

impl Session {
    /// Create a session and the queue its replies come out of
    pub fn new(server: Arc<UsbIpServer>) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            id: server.next_session_id(),
            server,
            phase: Phase::Handshake,
            version: None,
            bridge: None,
            highest_seqnum: None,
            events,
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Protocol version of the last accepted OP PDU
    pub fn version(&self) -> Option<u16> {
        self.version
    }

    pub fn imported_bus_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Attached { bus_id, .. } => Some(bus_id),
            _ => None,
        }
    }

    pub fn bridge(&self) -> Option<&Arc<UrbBridge>> {
        self.bridge.as_ref()
    }

    /// Process one PDU; an error means the connection must be closed
    pub fn handle(&mut self, command: UsbIpCommand) -> Result<()> {
        if let Phase::Closed(_) = self.phase {
            return Err(UsbIpError::UnexpectedOpcode {
                opcode: command.name(),
                phase: self.phase.name(),
            });
        }

        if let Some(version) = command.version() {
            if version != USBIP_VERSION {
                warn!(
                    "Session {}: version mismatch {version:#06x} in {}",
                    self.id,
                    command.name()
                );
                self.reply(UsbIpResponse::op_rep_status(
                    command.code() & !OP_REQUEST,
                    ST_ERROR,
                ));
                return self.fault(UsbIpError::VersionMismatch {
                    found: version,
                    expected: USBIP_VERSION,
                });
            }
            self.version = Some(version);
        }

        let attached = matches!(self.phase, Phase::Attached { .. });
        match command {
            UsbIpCommand::OpReqDevlist { .. } if !attached => {
                trace!("Session {}: got OP_REQ_DEVLIST", self.id);
                self.phase = Phase::Negotiating;
                let devices = self.server.registry().exportable();
                debug!("Session {}: listing {} devices", self.id, devices.len());
                self.reply(UsbIpResponse::op_rep_devlist(&devices));
                Ok(())
            }
            UsbIpCommand::OpReqImport { busid, .. } if !attached => {
                self.import(&from_fixed_field(&busid));
                Ok(())
            }
            UsbIpCommand::OpReqDevinfo { busid, .. } if !attached => {
                warn!(
                    "Session {}: OP_REQ_DEVINFO for {} is not supported",
                    self.id,
                    from_fixed_field(&busid)
                );
                self.phase = Phase::Negotiating;
                self.reply(UsbIpResponse::op_rep_status(OP_REP_DEVINFO, ST_NA));
                Ok(())
            }
            UsbIpCommand::OpReqExport { device, .. } if !attached => {
                warn!(
                    "Session {}: OP_REQ_EXPORT of {} is not supported",
                    self.id, device.bus_id
                );
                self.phase = Phase::Negotiating;
                self.reply(UsbIpResponse::OpRepExport {
                    code: OP_REP_EXPORT,
                    status: ST_NA,
                    returncode: -1,
                });
                Ok(())
            }
            UsbIpCommand::OpReqUnexport { device, .. } if !attached => {
                warn!(
                    "Session {}: OP_REQ_UNEXPORT of {} is not supported",
                    self.id, device.bus_id
                );
                self.phase = Phase::Negotiating;
                self.reply(UsbIpResponse::OpRepExport {
                    code: OP_REP_UNEXPORT,
                    status: ST_NA,
                    returncode: -1,
                });
                Ok(())
            }
            UsbIpCommand::OpReqUnknown { code, .. } => {
                self.fault(UsbIpError::UnknownOpcode(code.into()))
            }
            UsbIpCommand::UsbIpCmdSubmit {
                header,
                data,
                iso_packet_descriptor,
            } if attached => {
                self.submit(header, data, iso_packet_descriptor);
                Ok(())
            }
            UsbIpCommand::UsbIpCmdUnlink { header } if attached => {
                self.unlink(header);
                Ok(())
            }
            command => {
                let err = UsbIpError::UnexpectedOpcode {
                    opcode: command.name(),
                    phase: self.phase.name(),
                };
                self.fault(err)
            }
        }
    }

    fn import(&mut self, bus_id: &str) {
        trace!("Session {}: got OP_REQ_IMPORT for {bus_id}", self.id);
        self.phase = Phase::Negotiating;
        let registry = self.server.registry();
        match registry.claim(bus_id, self.id, self.events.clone()) {
            Ok(device) => {
                let config = self.server.config();
                self.bridge = Some(UrbBridge::new(
                    self.id,
                    bus_id.to_string(),
                    self.server.host(),
                    self.events.clone(),
                    config.max_pending_transfers,
                ));
                self.phase = Phase::Attached {
                    bus_id: bus_id.to_string(),
                    devid: device.devid(),
                };
                info!(
                    "Session {}: imported {bus_id} ({:04x}:{:04x})",
                    self.id, device.vendor_id, device.product_id
                );
                self.reply(UsbIpResponse::op_rep_import_success(&device));
            }
            Err(ImportRefusal::NoDevice) => {
                warn!("Session {}: no device {bus_id} to import", self.id);
                self.reply(UsbIpResponse::op_rep_import_fail(ST_NODEV));
            }
            Err(ImportRefusal::Busy) => {
                warn!("Session {}: device {bus_id} is busy", self.id);
                self.reply(UsbIpResponse::op_rep_import_fail(ST_DEV_BUSY));
            }
        }
    }

    fn submit(&mut self, submit: CmdSubmitHeader, data: Vec<u8>, iso_packet_descriptor: Vec<u8>) {
        let header = submit.header;
        trace!(
            "Session {}: got USBIP_CMD_SUBMIT {} ep {} dir {}",
            self.id,
            header.seqnum,
            header.ep,
            header.direction
        );
        self.track_seqnum(header.seqnum);
        let result = match &self.bridge {
            Some(bridge) => bridge.submit(&submit, data, iso_packet_descriptor),
            None => Err(SubmitRejected::NoActiveImport),
        };
        if let Err(rejection) = result {
            match rejection.errno() {
                Some(errno) => {
                    warn!("Session {}: submit {} rejected: {rejection}", self.id, header.seqnum);
                    self.reply(UsbIpResponse::usbip_ret_submit_fail(&header, errno));
                }
                // the pending transfer still owns this seqnum
                None => warn!("Session {}: dropping submit: {rejection}", self.id),
            }
        }
    }

    fn unlink(&mut self, unlink: CmdUnlinkHeader) {
        let header = unlink.header;
        trace!(
            "Session {}: got USBIP_CMD_UNLINK {} for {}",
            self.id, header.seqnum, unlink.unlink_seqnum
        );
        self.track_seqnum(header.seqnum);
        let result = match &self.bridge {
            Some(bridge) => bridge.unlink(&header, unlink.unlink_seqnum),
            None => Err(crate::error::UnlinkRejected::NotFound(unlink.unlink_seqnum)),
        };
        if let Err(rejection) = result {
            debug!("Session {}: {rejection}", self.id);
            self.reply(UsbIpResponse::usbip_ret_unlink(&header, -errno::ENOENT));
        }
    }

    fn track_seqnum(&mut self, seqnum: u32) {
        if let Some(highest) = self.highest_seqnum {
            if seqnum <= highest {
                warn!(
                    "Session {}: seqnum {seqnum} does not follow {highest}",
                    self.id
                );
            }
        }
        self.highest_seqnum = Some(self.highest_seqnum.map_or(seqnum, |h| h.max(seqnum)));
    }

    /// React to the registry reporting `bus_id` detached
    ///
    /// Returns whether this session had it imported and is now closed.
    pub fn device_gone(&mut self, bus_id: &str) -> bool {
        if self.imported_bus_id() != Some(bus_id) {
            return false;
        }
        info!("Session {}: device {bus_id} is gone", self.id);
        self.teardown();
        self.phase = Phase::Closed(CloseReason::DeviceGone);
        true
    }

    /// Release the imported device and every pending transfer
    pub fn teardown(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.close();
        }
        if let Phase::Attached { bus_id, .. } = &self.phase {
            self.server.registry().release(bus_id, self.id);
        }
        if !matches!(self.phase, Phase::Closed(_)) {
            self.phase = Phase::Closed(CloseReason::Disconnected);
        }
    }

    fn fault(&mut self, err: UsbIpError) -> Result<()> {
        self.teardown();
        self.phase = Phase::Closed(CloseReason::ProtocolFault);
        Err(err)
    }

    fn reply(&self, response: UsbIpResponse) {
        if self.events.send(SessionEvent::Reply(response)).is_err() {
            debug!("Session {}: writer is gone", self.id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
