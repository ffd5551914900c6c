use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::*;
use rusb::{Device, DeviceHandle, GlobalContext, TransferType};

use crate::error::{HostError, Result, UsbIpError};
use crate::{
    CompletionSink, DeviceDescriptor, Direction, InterfaceDescriptor, ServerConfig,
    TransferCompletion, TransferKey, UrbRequest, UsbHostInterface, UsbIpServer, UsbSpeed, errno,
};

/// Transfers queued for the worker before submits are refused
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
/// Time a single libusb transfer may take
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

struct OpenDevice {
    handle: Mutex<DeviceHandle<GlobalContext>>,
    /// Transfer type of every non-control endpoint, keyed by address
    endpoints: HashMap<u8, TransferType>,
}

#[derive(Default)]
struct Shared {
    devices: Mutex<HashMap<String, Arc<OpenDevice>>>,
    /// Transfers waiting for the worker, flagged once cancelled
    queued: Mutex<HashMap<TransferKey, bool>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host interface exporting devices opened through libusb
///
/// Transfers run in order on one worker thread. Only transfers it has not
/// started yet can be cancelled.
pub struct RusbHost {
    shared: Arc<Shared>,
    queue: SyncSender<(UrbRequest, CompletionSink)>,
}

impl fmt::Debug for RusbHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let devices: Vec<String> = lock(&self.shared.devices).keys().cloned().collect();
        f.debug_struct("RusbHost").field("devices", &devices).finish()
    }
}

impl RusbHost {
    pub fn new() -> Result<Self> {
        Self::with_limits(DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_TIMEOUT)
    }

    /// Start the worker thread with a queue of `queue_depth` transfers
    pub fn with_limits(queue_depth: usize, timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (queue, rx) = sync_channel(queue_depth);
        let worker_shared = shared.clone();
        std::thread::Builder::new()
            .name("usbip-rusb".to_string())
            .spawn(move || worker(worker_shared, rx, timeout))?;
        Ok(Self { shared, queue })
    }

    /// Open `device`, claim its interfaces and return its descriptor for the registry
    pub fn open(&self, device: &Device<GlobalContext>) -> Result<DeviceDescriptor> {
        let desc = device.device_descriptor().map_err(rusb_error)?;
        let cfg = device.active_config_descriptor().map_err(rusb_error)?;
        let mut handle = device.open().map_err(rusb_error)?;
        handle.set_auto_detach_kernel_driver(true).ok();

        let bus_id = bus_id_of(device);
        let version = desc.device_version();
        let mut descriptor =
            DeviceDescriptor::new(device.bus_number().into(), device.address().into())
                .with_bus_id(&bus_id)
                .with_ids(desc.vendor_id(), desc.product_id())
                .with_speed(speed_of(device.speed()))
                .with_class(desc.class_code(), desc.sub_class_code(), desc.protocol_code());
        descriptor.path = format!("/sys/bus/usb/devices/{bus_id}");
        descriptor.device_bcd = (u16::from(version.major()) << 8)
            | (u16::from(version.minor()) << 4)
            | u16::from(version.sub_minor());
        descriptor.configuration_value = cfg.number();
        descriptor.num_configurations = desc.num_configurations();

        let mut endpoints = HashMap::new();
        for intf in cfg.interfaces() {
            // ignore alternate settings
            let Some(intf_desc) = intf.descriptors().next() else {
                continue;
            };
            if let Err(err) = handle.claim_interface(intf.number()) {
                warn!("Could not claim interface {} of {bus_id}: {err}", intf.number());
            }
            descriptor = descriptor.with_interface(InterfaceDescriptor::new(
                intf_desc.class_code(),
                intf_desc.sub_class_code(),
                intf_desc.protocol_code(),
            ));
            for ep_desc in intf_desc.endpoint_descriptors() {
                endpoints.insert(ep_desc.address(), ep_desc.transfer_type());
            }
        }

        debug!(
            "Opened {bus_id} ({:04x}:{:04x}) with {} endpoints",
            desc.vendor_id(),
            desc.product_id(),
            endpoints.len()
        );
        lock(&self.shared.devices).insert(
            bus_id,
            Arc::new(OpenDevice {
                handle: Mutex::new(handle),
                endpoints,
            }),
        );
        Ok(descriptor)
    }

    /// Forget `bus_id`; transfers already queued for it fail with `-ENODEV`
    pub fn close(&self, bus_id: &str) -> bool {
        lock(&self.shared.devices).remove(bus_id).is_some()
    }
}

impl UsbHostInterface for RusbHost {
    fn submit(&self, request: UrbRequest, sink: CompletionSink) -> Result<(), HostError> {
        let device = lock(&self.shared.devices)
            .get(&request.bus_id)
            .cloned()
            .ok_or_else(|| HostError::NoDevice(request.bus_id.clone()))?;
        if !request.is_control() {
            match device.endpoints.get(&request.endpoint) {
                None => return Err(HostError::UnknownEndpoint(request.endpoint)),
                Some(TransferType::Isochronous) => {
                    return Err(HostError::Hardware(
                        "isochronous transfers are not supported".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        let key = request.key;
        lock(&self.shared.queued).insert(key, false);
        match self.queue.try_send((request, sink)) {
            Ok(()) => Ok(()),
            Err(err) => {
                lock(&self.shared.queued).remove(&key);
                match err {
                    TrySendError::Full(_) => Err(HostError::QueueFull),
                    TrySendError::Disconnected(_) => {
                        Err(HostError::Hardware("transfer worker stopped".to_string()))
                    }
                }
            }
        }
    }

    fn cancel(&self, key: TransferKey) {
        if let Some(cancelled) = lock(&self.shared.queued).get_mut(&key) {
            *cancelled = true;
        }
    }
}

fn worker(shared: Arc<Shared>, rx: Receiver<(UrbRequest, CompletionSink)>, timeout: Duration) {
    for (request, sink) in rx {
        let cancelled = lock(&shared.queued).remove(&request.key).unwrap_or(false);
        if cancelled {
            trace!("Transfer {} cancelled before it started", request.key.seqnum);
            sink.unlinked(-errno::ECONNRESET);
            continue;
        }
        let device = lock(&shared.devices).get(&request.bus_id).cloned();
        let completion = match device {
            Some(device) => perform(&device, &request, timeout)
                .unwrap_or_else(|err| TransferCompletion::failed(errno_of(err))),
            None => TransferCompletion::failed(errno::ENODEV),
        };
        if completion.status != 0 {
            debug!(
                "Transfer {} on {} ep {:02x} failed with {}",
                request.key.seqnum, request.bus_id, request.endpoint, completion.status
            );
        }
        sink.complete(completion);
    }
    debug!("rusb transfer worker stopped");
}

fn perform(
    device: &OpenDevice,
    request: &UrbRequest,
    timeout: Duration,
) -> rusb::Result<TransferCompletion> {
    let handle = lock(&device.handle);
    let ep = request.endpoint;
    let transfer_type = if request.is_control() {
        TransferType::Control
    } else {
        device
            .endpoints
            .get(&ep)
            .copied()
            .ok_or(rusb::Error::NotFound)?
    };

    match (transfer_type, request.direction) {
        (TransferType::Control, _) => {
            let setup = &request.setup;
            let request_type = setup[0];
            let b_request = setup[1];
            let value = u16::from_le_bytes([setup[2], setup[3]]);
            let index = u16::from_le_bytes([setup[4], setup[5]]);
            let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
            if request_type & 0x80 != 0 {
                let mut buf = vec![0; length.min(request.buffer_length)];
                let len =
                    handle.read_control(request_type, b_request, value, index, &mut buf, timeout)?;
                buf.truncate(len);
                Ok(TransferCompletion::read(buf))
            } else {
                let len =
                    handle.write_control(request_type, b_request, value, index, &request.data, timeout)?;
                Ok(TransferCompletion::written(len))
            }
        }
        (TransferType::Bulk, Direction::In) => {
            let mut buf = vec![0; request.buffer_length];
            let len = handle.read_bulk(ep, &mut buf, timeout)?;
            buf.truncate(len);
            Ok(TransferCompletion::read(buf))
        }
        (TransferType::Bulk, Direction::Out) => {
            Ok(TransferCompletion::written(handle.write_bulk(ep, &request.data, timeout)?))
        }
        (TransferType::Interrupt, Direction::In) => {
            let mut buf = vec![0; request.buffer_length];
            let len = handle.read_interrupt(ep, &mut buf, timeout)?;
            buf.truncate(len);
            Ok(TransferCompletion::read(buf))
        }
        (TransferType::Interrupt, Direction::Out) => Ok(TransferCompletion::written(
            handle.write_interrupt(ep, &request.data, timeout)?,
        )),
        (TransferType::Isochronous, _) => Err(rusb::Error::NotSupported),
    }
}

fn bus_id_of(device: &Device<GlobalContext>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{}-{}", device.bus_number(), ports.join("."))
        }
        _ => format!("{}-{}", device.bus_number(), device.port_number()),
    }
}

fn speed_of(speed: rusb::Speed) -> UsbSpeed {
    match speed {
        rusb::Speed::Low => UsbSpeed::Low,
        rusb::Speed::Full => UsbSpeed::Full,
        rusb::Speed::High => UsbSpeed::High,
        rusb::Speed::Super => UsbSpeed::Super,
        rusb::Speed::SuperPlus => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Unknown,
    }
}

/// Positive errno matching a libusb failure
fn errno_of(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Timeout => errno::ETIMEDOUT,
        rusb::Error::Pipe => errno::EPIPE,
        rusb::Error::NoDevice => errno::ENODEV,
        rusb::Error::Overflow => errno::EOVERFLOW,
        rusb::Error::Busy => errno::EBUSY,
        rusb::Error::Access => errno::EACCES,
        rusb::Error::NotFound => errno::ENOENT,
        rusb::Error::InvalidParam => errno::EINVAL,
        _ => errno::EIO,
    }
}

fn rusb_error(err: rusb::Error) -> UsbIpError {
    UsbIpError::Io(std::io::Error::other(err))
}

impl UsbIpServer {
    /// Create a [UsbIpServer] exposing devices in the host, and redirect all USB transfers to them using libusb
    pub fn new_from_host(config: ServerConfig) -> Result<Self> {
        Self::new_from_host_with_filter(config, |_| true)
    }

    /// Create a [UsbIpServer] exposing filtered devices in the host, and redirect all USB transfers to them using libusb
    pub fn new_from_host_with_filter<F>(config: ServerConfig, filter: F) -> Result<Self>
    where
        F: FnMut(&Device<GlobalContext>) -> bool,
    {
        let host = Arc::new(RusbHost::new()?);
        let server = Self::new(host.clone(), config);
        let list = rusb::devices().map_err(rusb_error)?;
        for dev in list.iter().filter(filter) {
            let descriptor = match host.open(&dev) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!("Impossible to share {dev:?}: {err}, ignoring device");
                    continue;
                }
            };
            if let Err(err) = server.add_device(descriptor) {
                warn!("Not exporting {dev:?}: {err}");
            }
        }
        Ok(server)
    }
}
