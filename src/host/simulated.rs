use crate::error::HostError;
use crate::host::{CompletionSink, TransferCompletion, TransferKey, UrbRequest, UsbHostInterface};
use crate::errno;
use log::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug)]
struct SimState {
    in_flight: Vec<(UrbRequest, CompletionSink)>,
    endpoints: HashMap<String, Vec<u8>>,
    cancelled: Vec<TransferKey>,
    acknowledge_unlinks: bool,
}

/// In-memory host that holds transfers until they are completed by hand
///
/// Used to run the server without hardware and to drive completions,
/// cancellations and races deterministically.
#[derive(Debug)]
pub struct SimulatedHost {
    state: Mutex<SimState>,
    submitted: Notify,
    queue_depth: usize,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::with_queue_depth(usize::MAX)
    }

    /// Host refusing new transfers while `queue_depth` are in flight
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                in_flight: vec![],
                endpoints: HashMap::new(),
                cancelled: vec![],
                acknowledge_unlinks: true,
            }),
            submitted: Notify::new(),
            queue_depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restrict `bus_id` to the given endpoint addresses; endpoint 0 is always valid
    pub fn set_endpoints(&self, bus_id: &str, endpoints: &[u8]) {
        self.lock()
            .endpoints
            .insert(bus_id.to_string(), endpoints.to_vec());
    }

    /// Whether [UsbHostInterface::cancel] acknowledges right away
    ///
    /// When disabled, cancellations are only recorded and the test decides
    /// the race with [Self::complete] or [Self::acknowledge_unlink].
    pub fn set_acknowledge_unlinks(&self, acknowledge: bool) {
        self.lock().acknowledge_unlinks = acknowledge;
    }

    pub fn in_flight(&self) -> Vec<UrbRequest> {
        self.lock()
            .in_flight
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Keys passed to [UsbHostInterface::cancel], in call order
    pub fn cancelled(&self) -> Vec<TransferKey> {
        self.lock().cancelled.clone()
    }

    fn take(&self, seqnum: u32) -> Option<CompletionSink> {
        let mut state = self.lock();
        let index = state
            .in_flight
            .iter()
            .position(|(request, _)| request.key.seqnum == seqnum)?;
        Some(state.in_flight.remove(index).1)
    }

    /// Finish the in-flight transfer `seqnum`; returns whether the client will see it
    pub fn complete(&self, seqnum: u32, completion: TransferCompletion) -> bool {
        match self.take(seqnum) {
            Some(sink) => sink.complete(completion),
            None => false,
        }
    }

    /// Acknowledge cancellation of the in-flight transfer `seqnum`
    pub fn acknowledge_unlink(&self, seqnum: u32, status: i32) -> bool {
        match self.take(seqnum) {
            Some(sink) => sink.unlinked(status),
            None => false,
        }
    }

    /// Wait until a transfer with `seqnum` has been submitted
    pub async fn wait_for_submission(&self, seqnum: u32) -> UrbRequest {
        loop {
            let notified = self.submitted.notified();
            if let Some(request) = self
                .in_flight()
                .into_iter()
                .find(|request| request.key.seqnum == seqnum)
            {
                return request;
            }
            notified.await;
        }
    }
}

impl UsbHostInterface for SimulatedHost {
    fn submit(&self, request: UrbRequest, sink: CompletionSink) -> Result<(), HostError> {
        let mut state = self.lock();
        if let Some(endpoints) = state.endpoints.get(&request.bus_id) {
            if !request.is_control() && !endpoints.contains(&request.endpoint) {
                return Err(HostError::UnknownEndpoint(request.endpoint));
            }
        }
        if state.in_flight.len() >= self.queue_depth {
            return Err(HostError::QueueFull);
        }
        trace!(
            "Simulated transfer {} on {} ep {:02x}",
            request.key.seqnum,
            request.bus_id,
            request.endpoint
        );
        state.in_flight.push((request, sink));
        drop(state);
        self.submitted.notify_waiters();
        Ok(())
    }

    fn cancel(&self, key: TransferKey) {
        let acknowledge = {
            let mut state = self.lock();
            state.cancelled.push(key);
            state.acknowledge_unlinks
        };
        if acknowledge {
            let sink = {
                let mut state = self.lock();
                state
                    .in_flight
                    .iter()
                    .position(|(request, _)| request.key == key)
                    .map(|index| state.in_flight.remove(index).1)
            };
            if let Some(sink) = sink {
                sink.unlinked(-errno::ECONNRESET);
            }
        }
    }
}
