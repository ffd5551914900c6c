use crate::error::{HostError, SubmitRejected, UnlinkRejected};
use crate::host::{CompletionSink, TransferCompletion, TransferKey, UrbRequest, UsbHostInterface};
use crate::session::{EventSender, SessionEvent, SessionId};
use crate::usbip_protocol::{CmdSubmitHeader, RetSubmitHeader, UsbIpHeaderBasic, UsbIpResponse};
use crate::*;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// A CMD_SUBMIT handed to the host and not yet answered
#[derive(Clone, Debug)]
pub struct PendingTransfer {
    pub seqnum: u32,
    pub ep: u32,
    pub direction: Direction,
    /// Bytes reserved for IN data, or sent for OUT
    pub buffer_length: usize,
    pub submitted_at: Instant,
    /// Header echoed back in RET_SUBMIT
    pub header: UsbIpHeaderBasic,
    pub key: TransferKey,
    /// Header of the CMD_UNLINK waiting for cancellation, if any
    pub unlink: Option<UsbIpHeaderBasic>,
}

#[derive(Debug)]
struct BridgeState {
    active: bool,
    pending: HashMap<u32, PendingTransfer>,
}

/// Pending-transfer table of one attached session
///
/// A hardware completion and an unlink acknowledgement race to remove an
/// entry; only the one that removes it reaches the client.
#[derive(Debug)]
pub struct UrbBridge {
    session: SessionId,
    bus_id: String,
    host: Arc<dyn UsbHostInterface>,
    events: EventSender,
    max_pending: usize,
    state: Mutex<BridgeState>,
    this: Weak<UrbBridge>,
}

impl UrbBridge {
    pub fn new(
        session: SessionId,
        bus_id: String,
        host: Arc<dyn UsbHostInterface>,
        events: EventSender,
        max_pending: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session,
            bus_id,
            host,
            events,
            max_pending,
            state: Mutex::new(BridgeState {
                active: true,
                pending: HashMap::new(),
            }),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, seqnum: u32) -> bool {
        self.lock().pending.contains_key(&seqnum)
    }

    /// Record a CMD_SUBMIT and hand it to the host
    ///
    /// `data` is the OUT payload; IN transfers reserve
    /// `transfer_buffer_length` bytes instead.
    pub fn submit(
        &self,
        submit: &CmdSubmitHeader,
        data: Vec<u8>,
        iso_packet_descriptor: Vec<u8>,
    ) -> Result<(), SubmitRejected> {
        let header = submit.header;
        let seqnum = header.seqnum;
        if header.ep > 0x0f {
            return Err(SubmitRejected::UnknownEndpoint(header.ep as u8));
        }
        let direction = header
            .direction()
            .ok_or(SubmitRejected::UnknownEndpoint(header.endpoint_address()))?;
        let buffer_length = usize::try_from(submit.transfer_buffer_length).unwrap_or(0);
        let key = TransferKey {
            session: self.session,
            seqnum,
        };

        {
            let mut state = self.lock();
            if !state.active {
                return Err(SubmitRejected::NoActiveImport);
            }
            if state.pending.contains_key(&seqnum) {
                return Err(SubmitRejected::DuplicateSequence(seqnum));
            }
            if state.pending.len() >= self.max_pending {
                return Err(SubmitRejected::TransferQueueFull);
            }
            state.pending.insert(
                seqnum,
                PendingTransfer {
                    seqnum,
                    ep: header.ep,
                    direction,
                    buffer_length,
                    submitted_at: Instant::now(),
                    header,
                    key,
                    unlink: None,
                },
            );
        }

        let request = UrbRequest {
            key,
            bus_id: self.bus_id.clone(),
            endpoint: header.endpoint_address(),
            direction,
            transfer_flags: submit.transfer_flags,
            setup: submit.setup,
            interval: submit.interval,
            start_frame: submit.start_frame,
            number_of_packets: submit.number_of_packets,
            data: match direction {
                Direction::Out => data,
                Direction::In => vec![],
            },
            buffer_length,
            iso_packet_descriptor,
        };
        let sink = CompletionSink::new(self.this.clone(), key);
        if let Err(err) = self.host.submit(request, sink) {
            // the host never saw it, so nothing can complete it
            self.lock().pending.remove(&seqnum);
            return Err(match err {
                HostError::QueueFull => SubmitRejected::TransferQueueFull,
                HostError::UnknownEndpoint(ep) => SubmitRejected::UnknownEndpoint(ep),
                HostError::NoDevice(_) => SubmitRejected::NoActiveImport,
                HostError::Hardware(msg) => SubmitRejected::Hardware(msg),
            });
        }
        trace!(
            "Session {} submitted {seqnum} to ep {:02x} ({buffer_length} bytes)",
            self.session,
            header.endpoint_address()
        );
        Ok(())
    }

    /// Called by the host when transfer `seqnum` finished
    ///
    /// Returns whether a RET_SUBMIT was queued.
    pub fn on_hardware_completion(&self, seqnum: u32, completion: TransferCompletion) -> bool {
        let Some(pending) = self.lock().pending.remove(&seqnum) else {
            debug!(
                "Session {}: dropping completion of {seqnum}, no longer pending",
                self.session
            );
            return false;
        };
        if pending.unlink.is_some() {
            debug!(
                "Session {}: {seqnum} completed before its unlink, RET_UNLINK suppressed",
                self.session
            );
        }
        trace!(
            "Session {}: {seqnum} completed with {} after {:?}",
            self.session,
            completion.status,
            pending.submitted_at.elapsed()
        );
        self.send(ret_submit(&pending, completion))
    }

    /// Ask the host to cancel `target`, answering with `unlink` once it does
    pub fn unlink(&self, unlink: &UsbIpHeaderBasic, target: u32) -> Result<(), UnlinkRejected> {
        let key = {
            let mut state = self.lock();
            let pending = state
                .pending
                .get_mut(&target)
                .ok_or(UnlinkRejected::NotFound(target))?;
            if pending.unlink.is_some() {
                return Err(UnlinkRejected::AlreadyUnlinking(target));
            }
            pending.unlink = Some(*unlink);
            pending.key
        };
        trace!(
            "Session {}: unlinking {target} for {}",
            self.session,
            unlink.seqnum
        );
        self.host.cancel(key);
        Ok(())
    }

    /// Called by the host once transfer `seqnum` was cancelled
    ///
    /// Returns whether a RET_UNLINK was queued.
    pub fn on_unlink_acknowledged(&self, seqnum: u32, status: i32) -> bool {
        let unlink = {
            let mut state = self.lock();
            match state.pending.get(&seqnum).and_then(|p| p.unlink) {
                Some(unlink) => {
                    state.pending.remove(&seqnum);
                    unlink
                }
                None => {
                    debug!(
                        "Session {}: dropping unlink acknowledgement of {seqnum}",
                        self.session
                    );
                    return false;
                }
            }
        };
        self.send(UsbIpResponse::usbip_ret_unlink(&unlink, status))
    }

    /// Stop accepting transfers and cancel every pending one
    ///
    /// Returns how many transfers were abandoned.
    pub fn close(&self) -> usize {
        let abandoned: Vec<PendingTransfer> = {
            let mut state = self.lock();
            state.active = false;
            state.pending.drain().map(|(_, pending)| pending).collect()
        };
        for pending in &abandoned {
            self.host.cancel(pending.key);
        }
        if !abandoned.is_empty() {
            debug!(
                "Session {}: abandoned {} pending transfers on {}",
                self.session,
                abandoned.len(),
                self.bus_id
            );
        }
        abandoned.len()
    }

    fn send(&self, response: UsbIpResponse) -> bool {
        if self.events.send(SessionEvent::Reply(response)).is_err() {
            debug!("Session {} is gone, reply dropped", self.session);
            return false;
        }
        true
    }
}

fn ret_submit(pending: &PendingTransfer, completion: TransferCompletion) -> UsbIpResponse {
    let (data, actual_length) = match pending.direction {
        Direction::In => {
            let mut data = completion.data;
            data.truncate(completion.actual_length.min(pending.buffer_length));
            let len = data.len();
            (data, len)
        }
        Direction::Out => (vec![], completion.actual_length.min(pending.buffer_length)),
    };
    UsbIpResponse::UsbIpRetSubmit {
        header: RetSubmitHeader {
            header: pending.header.reply(USBIP_RET_SUBMIT),
            status: completion.status,
            actual_length: actual_length as i32,
            start_frame: completion.start_frame,
            number_of_packets: completion.number_of_packets,
            error_count: completion.error_count,
        },
        data,
        iso_packet_descriptor: completion.iso_packet_descriptor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::simulated::SimulatedHost;
    use crate::session::EventReceiver;
    use tokio::sync::mpsc;

    const SESSION: SessionId = SessionId(1);

    fn bridge_with(host: Arc<SimulatedHost>, max_pending: usize) -> (Arc<UrbBridge>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = UrbBridge::new(SESSION, "1-1".to_string(), host, tx, max_pending);
        (bridge, rx)
    }

    fn submit(seqnum: u32, direction: u32, ep: u32, length: i32) -> CmdSubmitHeader {
        CmdSubmitHeader {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_SUBMIT.into(),
                seqnum,
                devid: 0x0001_0001,
                direction,
                ep,
            },
            transfer_buffer_length: length,
            ..Default::default()
        }
    }

    fn unlink_header(seqnum: u32) -> UsbIpHeaderBasic {
        UsbIpHeaderBasic {
            command: USBIP_CMD_UNLINK.into(),
            seqnum,
            devid: 0x0001_0001,
            ..Default::default()
        }
    }

    fn replies(rx: &mut EventReceiver) -> Vec<UsbIpResponse> {
        let mut out = vec![];
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Reply(response) => out.push(response),
                other => panic!("unexpected {other:?}"),
            }
        }
        out
    }

    #[test]
    fn in_completion_produces_ret_submit() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        bridge.submit(&submit(7, USBIP_DIR_IN, 1, 64), vec![], vec![]).unwrap();

        let request = &host.in_flight()[0];
        assert_eq!(request.endpoint, 0x81);
        assert_eq!(request.buffer_length, 64);

        assert!(host.complete(7, TransferCompletion::read(vec![0xaa; 64])));
        match replies(&mut rx).as_slice() {
            [UsbIpResponse::UsbIpRetSubmit { header, data, .. }] => {
                assert_eq!(header.header.seqnum, 7);
                assert_eq!(header.header.command, USBIP_RET_SUBMIT as u32);
                assert_eq!(header.status, 0);
                assert_eq!(header.actual_length, 64);
                assert_eq!(data.len(), 64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn in_data_is_capped_to_reservation() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        bridge.submit(&submit(1, USBIP_DIR_IN, 1, 8), vec![], vec![]).unwrap();
        host.complete(1, TransferCompletion::read(vec![1; 32]));
        match replies(&mut rx).as_slice() {
            [UsbIpResponse::UsbIpRetSubmit { header, data, .. }] => {
                assert_eq!(header.actual_length, 8);
                assert_eq!(data.len(), 8);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_payload_is_forwarded_verbatim() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        bridge
            .submit(&submit(2, USBIP_DIR_OUT, 2, 4), vec![1, 2, 3, 4], vec![])
            .unwrap();
        assert_eq!(host.in_flight()[0].data, vec![1, 2, 3, 4]);
        assert_eq!(host.in_flight()[0].endpoint, 0x02);

        host.complete(2, TransferCompletion::written(4));
        match replies(&mut rx).as_slice() {
            [UsbIpResponse::UsbIpRetSubmit { header, data, .. }] => {
                assert_eq!(header.actual_length, 4);
                assert!(data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_sequence_leaves_entry_alone() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, _rx) = bridge_with(host.clone(), 16);
        bridge.submit(&submit(3, USBIP_DIR_IN, 1, 64), vec![], vec![]).unwrap();
        assert_eq!(
            bridge.submit(&submit(3, USBIP_DIR_OUT, 2, 0), vec![], vec![]),
            Err(SubmitRejected::DuplicateSequence(3))
        );
        assert_eq!(bridge.pending(), 1);
        assert_eq!(host.in_flight().len(), 1);
        assert_eq!(bridge.lock().pending[&3].ep, 1);
    }

    #[test]
    fn pending_limit_and_host_queue_are_bounded() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, _rx) = bridge_with(host, 1);
        bridge.submit(&submit(1, USBIP_DIR_IN, 1, 8), vec![], vec![]).unwrap();
        assert_eq!(
            bridge.submit(&submit(2, USBIP_DIR_IN, 1, 8), vec![], vec![]),
            Err(SubmitRejected::TransferQueueFull)
        );

        let host = Arc::new(SimulatedHost::with_queue_depth(0));
        let (bridge, _rx) = bridge_with(host, 16);
        assert_eq!(
            bridge.submit(&submit(1, USBIP_DIR_IN, 1, 8), vec![], vec![]),
            Err(SubmitRejected::TransferQueueFull)
        );
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn unknown_endpoints_are_rejected() {
        let host = Arc::new(SimulatedHost::new());
        host.set_endpoints("1-1", &[0x81]);
        let (bridge, _rx) = bridge_with(host, 16);
        assert_eq!(
            bridge.submit(&submit(1, USBIP_DIR_OUT, 2, 0), vec![], vec![]),
            Err(SubmitRejected::UnknownEndpoint(0x02))
        );
        assert_eq!(
            bridge.submit(&submit(2, USBIP_DIR_IN, 16, 0), vec![], vec![]),
            Err(SubmitRejected::UnknownEndpoint(16))
        );
        assert!(bridge.submit(&submit(3, USBIP_DIR_IN, 1, 8), vec![], vec![]).is_ok());
        assert!(bridge.submit(&submit(4, USBIP_DIR_IN, 0, 8), vec![], vec![]).is_ok());
        assert_eq!(bridge.pending(), 2);
    }

    #[test]
    fn acknowledged_unlink_yields_ret_unlink_only() {
        let host = Arc::new(SimulatedHost::new());
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        bridge.submit(&submit(5, USBIP_DIR_IN, 1, 64), vec![], vec![]).unwrap();
        bridge.unlink(&unlink_header(6), 5).unwrap();

        // the simulated host cancels at once, a late completion loses
        assert!(!host.complete(5, TransferCompletion::read(vec![0; 64])));
        match replies(&mut rx).as_slice() {
            [UsbIpResponse::UsbIpRetUnlink { header }] => {
                assert_eq!(header.header.seqnum, 6);
                assert_eq!(header.header.command, USBIP_RET_UNLINK as u32);
                assert_eq!(header.status, -errno::ECONNRESET);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn completion_winning_the_race_suppresses_ret_unlink() {
        let host = Arc::new(SimulatedHost::new());
        host.set_acknowledge_unlinks(false);
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        bridge.submit(&submit(5, USBIP_DIR_IN, 1, 4), vec![], vec![]).unwrap();
        bridge.unlink(&unlink_header(6), 5).unwrap();
        assert_eq!(
            host.cancelled(),
            vec![TransferKey {
                session: SESSION,
                seqnum: 5
            }]
        );

        assert!(bridge.on_hardware_completion(5, TransferCompletion::read(vec![1; 4])));
        assert!(!bridge.on_unlink_acknowledged(5, -errno::ECONNRESET));
        let sent = replies(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], UsbIpResponse::UsbIpRetSubmit { .. }));
    }

    #[test]
    fn racing_threads_deliver_exactly_one_reply() {
        for _ in 0..64 {
            let host = Arc::new(SimulatedHost::new());
            host.set_acknowledge_unlinks(false);
            let (bridge, mut rx) = bridge_with(host, 16);
            bridge.submit(&submit(9, USBIP_DIR_IN, 1, 4), vec![], vec![]).unwrap();
            bridge.unlink(&unlink_header(10), 9).unwrap();

            let completer = {
                let bridge = bridge.clone();
                std::thread::spawn(move || {
                    bridge.on_hardware_completion(9, TransferCompletion::read(vec![0; 4]))
                })
            };
            let unlinker = {
                let bridge = bridge.clone();
                std::thread::spawn(move || bridge.on_unlink_acknowledged(9, -errno::ECONNRESET))
            };
            let delivered = [completer.join().unwrap(), unlinker.join().unwrap()];
            assert_eq!(delivered.iter().filter(|d| **d).count(), 1);
            assert_eq!(replies(&mut rx).len(), 1);
        }
    }

    #[test]
    fn unlink_of_unknown_sequence_is_rejected() {
        let host = Arc::new(SimulatedHost::new());
        host.set_acknowledge_unlinks(false);
        let (bridge, _rx) = bridge_with(host, 16);
        assert_eq!(
            bridge.unlink(&unlink_header(2), 1),
            Err(UnlinkRejected::NotFound(1))
        );
        bridge.submit(&submit(1, USBIP_DIR_IN, 1, 4), vec![], vec![]).unwrap();
        bridge.unlink(&unlink_header(2), 1).unwrap();
        assert_eq!(
            bridge.unlink(&unlink_header(3), 1),
            Err(UnlinkRejected::AlreadyUnlinking(1))
        );
    }

    #[test]
    fn close_cancels_everything_and_refuses_new_work() {
        let host = Arc::new(SimulatedHost::new());
        host.set_acknowledge_unlinks(false);
        let (bridge, mut rx) = bridge_with(host.clone(), 16);
        for seqnum in 1..=3 {
            bridge
                .submit(&submit(seqnum, USBIP_DIR_IN, 1, 4), vec![], vec![])
                .unwrap();
        }
        assert_eq!(bridge.close(), 3);
        assert_eq!(host.cancelled().len(), 3);
        assert!(!bridge.is_active());
        assert_eq!(
            bridge.submit(&submit(4, USBIP_DIR_IN, 1, 4), vec![], vec![]),
            Err(SubmitRejected::NoActiveImport)
        );
        assert!(!host.complete(2, TransferCompletion::read(vec![0; 4])));
        assert!(replies(&mut rx).is_empty());
    }
}
