use crate::error::{ImportRefusal, Result, UsbIpError};
use crate::session::{EventSender, SessionEvent, SessionId};
use crate::{DeviceDescriptor, MAX_INTERFACES, SYSFS_BUS_ID_SIZE, SYSFS_PATH_MAX};
use log::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// What [DeviceRegistry::attach] did with a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    Added,
    Replaced,
    Unchanged,
}

#[derive(Debug)]
struct Claim {
    session: SessionId,
    events: EventSender,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Registration order
    devices: Vec<DeviceDescriptor>,
    claims: HashMap<String, Claim>,
}

/// Bounded set of exportable devices keyed by bus id
///
/// Every operation holds the lock only for a scan of the set; nothing
/// here waits on I/O, so the host's event context may call in freely.
#[derive(Debug)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    capacity: usize,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a device, replacing any device with the same bus id
    ///
    /// Descriptors that cannot be announced intact in OP_REP_DEVLIST are
    /// refused; `num_interfaces` is taken from the interface list.
    pub fn attach(&self, mut descriptor: DeviceDescriptor) -> Result<AttachOutcome> {
        check_wire_limits(&descriptor)?;
        descriptor.num_interfaces = descriptor.interfaces.len() as u8;
        let mut state = self.lock();
        if let Some(existing) = state
            .devices
            .iter_mut()
            .find(|d| d.bus_id == descriptor.bus_id)
        {
            if *existing == descriptor {
                debug!("Device {} attached again unchanged", descriptor.bus_id);
                return Ok(AttachOutcome::Unchanged);
            }
            info!(
                "Device {} replaced ({:04x}:{:04x})",
                descriptor.bus_id, descriptor.vendor_id, descriptor.product_id
            );
            *existing = descriptor;
            return Ok(AttachOutcome::Replaced);
        }

        if state.devices.len() >= self.capacity {
            warn!(
                "Refusing device {}: registry holds {} devices",
                descriptor.bus_id, self.capacity
            );
            return Err(UsbIpError::RegistryFull {
                capacity: self.capacity,
            });
        }
        info!(
            "Device {} attached ({:04x}:{:04x})",
            descriptor.bus_id, descriptor.vendor_id, descriptor.product_id
        );
        state.devices.push(descriptor);
        Ok(AttachOutcome::Added)
    }

    /// Remove a device; the session that imported it is told the device is gone
    pub fn detach(&self, bus_id: &str) -> Option<DeviceDescriptor> {
        let mut state = self.lock();
        let index = state.devices.iter().position(|d| d.bus_id == bus_id)?;
        let device = state.devices.remove(index);
        if let Some(claim) = state.claims.remove(bus_id) {
            info!(
                "Device {bus_id} detached while imported by session {}",
                claim.session
            );
            // the session may already be gone, nothing to tell then
            let _ = claim.events.send(SessionEvent::DeviceGone(bus_id.to_string()));
        } else {
            info!("Device {bus_id} detached");
        }
        Some(device)
    }

    /// Snapshot of every registered device in registration order
    pub fn list(&self) -> Vec<DeviceDescriptor> {
        self.lock().devices.clone()
    }

    /// Snapshot of the devices no session has imported
    pub fn exportable(&self) -> Vec<DeviceDescriptor> {
        let state = self.lock();
        state
            .devices
            .iter()
            .filter(|d| !state.claims.contains_key(&d.bus_id))
            .cloned()
            .collect()
    }

    pub fn find(&self, bus_id: &str) -> Option<DeviceDescriptor> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.bus_id == bus_id)
            .cloned()
    }

    /// Reserve a device for `session`; `events` is told if the device is detached
    pub fn claim(
        &self,
        bus_id: &str,
        session: SessionId,
        events: EventSender,
    ) -> Result<DeviceDescriptor, ImportRefusal> {
        let mut state = self.lock();
        let device = state
            .devices
            .iter()
            .find(|d| d.bus_id == bus_id)
            .cloned()
            .ok_or(ImportRefusal::NoDevice)?;
        match state.claims.get(bus_id) {
            Some(claim) if claim.session != session => Err(ImportRefusal::Busy),
            _ => {
                state
                    .claims
                    .insert(bus_id.to_string(), Claim { session, events });
                Ok(device)
            }
        }
    }

    /// Drop the claim on `bus_id` if `session` holds it
    pub fn release(&self, bus_id: &str, session: SessionId) {
        let mut state = self.lock();
        if state
            .claims
            .get(bus_id)
            .is_some_and(|claim| claim.session == session)
        {
            state.claims.remove(bus_id);
            debug!("Device {bus_id} released by session {session}");
        }
    }

    pub fn claimed_by(&self, bus_id: &str) -> Option<SessionId> {
        self.lock().claims.get(bus_id).map(|claim| claim.session)
    }
}

fn check_wire_limits(descriptor: &DeviceDescriptor) -> Result<()> {
    let invalid = |reason: String| -> Result<()> {
        warn!("Refusing device {:?}: {reason}", descriptor.bus_id);
        Err(UsbIpError::InvalidDescriptor {
            bus_id: descriptor.bus_id.clone(),
            reason,
        })
    };
    if descriptor.bus_id.is_empty() {
        return invalid("empty bus id".to_string());
    }
    if descriptor.bus_id.len() > SYSFS_BUS_ID_SIZE {
        return invalid(format!(
            "bus id is {} bytes, at most {SYSFS_BUS_ID_SIZE} fit",
            descriptor.bus_id.len()
        ));
    }
    if descriptor.path.len() > SYSFS_PATH_MAX {
        return invalid(format!(
            "path is {} bytes, at most {SYSFS_PATH_MAX} fit",
            descriptor.path.len()
        ));
    }
    if descriptor.interfaces.len() > MAX_INTERFACES {
        return invalid(format!(
            "{} interfaces, at most {MAX_INTERFACES} allowed",
            descriptor.interfaces.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterfaceDescriptor;
    use crate::usbip_protocol::{UsbIpResponse, WireRecord, unpack_devlist_entry};
    use tokio::sync::mpsc;

    fn device(bus_num: u32, dev_num: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(bus_num, dev_num)
            .with_ids(0x1234, 0x5678)
            .with_interface(InterfaceDescriptor::new(0xff, 0, 0))
    }

    #[test]
    fn attach_keeps_registration_order() {
        let registry = DeviceRegistry::new(4);
        for port in [3, 1, 2] {
            assert_eq!(
                registry.attach(device(1, port)).unwrap(),
                AttachOutcome::Added
            );
        }
        let ids: Vec<_> = registry.list().into_iter().map(|d| d.bus_id).collect();
        assert_eq!(ids, ["1-3", "1-1", "1-2"]);
    }

    #[test]
    fn reattach_replaces_or_is_unchanged() {
        let registry = DeviceRegistry::new(1);
        registry.attach(device(1, 1)).unwrap();
        assert_eq!(
            registry.attach(device(1, 1)).unwrap(),
            AttachOutcome::Unchanged
        );
        assert_eq!(
            registry.attach(device(1, 1).with_ids(0xaaaa, 0xbbbb)).unwrap(),
            AttachOutcome::Replaced
        );
        assert_eq!(registry.find("1-1").unwrap().vendor_id, 0xaaaa);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = DeviceRegistry::new(1);
        registry.attach(device(1, 1)).unwrap();
        assert!(matches!(
            registry.attach(device(1, 2)),
            Err(UsbIpError::RegistryFull { capacity: 1 })
        ));
    }

    #[test]
    fn claims_are_exclusive() {
        let registry = DeviceRegistry::new(2);
        registry.attach(device(1, 1)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            registry.claim("2-2", SessionId(1), tx.clone()),
            Err(ImportRefusal::NoDevice)
        );
        assert!(registry.claim("1-1", SessionId(1), tx.clone()).is_ok());
        assert_eq!(
            registry.claim("1-1", SessionId(2), tx.clone()),
            Err(ImportRefusal::Busy)
        );
        assert!(registry.exportable().is_empty());
        assert_eq!(registry.list().len(), 1);

        registry.release("1-1", SessionId(2));
        assert_eq!(registry.claimed_by("1-1"), Some(SessionId(1)));
        registry.release("1-1", SessionId(1));
        assert!(registry.claim("1-1", SessionId(2), tx).is_ok());
    }

    #[test]
    fn detach_notifies_claimant() {
        let registry = DeviceRegistry::new(2);
        registry.attach(device(1, 1)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.claim("1-1", SessionId(5), tx).unwrap();

        assert!(registry.detach("1-1").is_some());
        match rx.try_recv() {
            Ok(SessionEvent::DeviceGone(bus_id)) => assert_eq!(bus_id, "1-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.find("1-1").is_none());
        assert_eq!(registry.claimed_by("1-1"), None);
        assert!(registry.detach("1-1").is_none());
    }

    #[test]
    fn interface_count_follows_interface_list() {
        let registry = DeviceRegistry::new(1);
        let mut descriptor = DeviceDescriptor::new(1, 1);
        descriptor.num_interfaces = 2;
        assert_eq!(registry.attach(descriptor).unwrap(), AttachOutcome::Added);
        assert_eq!(registry.find("1-1").unwrap().num_interfaces, 0);

        let bytes = UsbIpResponse::op_rep_devlist(&registry.list()).to_bytes();
        assert_eq!(bytes.len(), 12 + DeviceDescriptor::SIZE);
        let (listed, used) = unpack_devlist_entry(&bytes[12..]).unwrap();
        assert_eq!(used, DeviceDescriptor::SIZE);
        assert!(listed.interfaces.is_empty());
    }

    #[test]
    fn too_many_interfaces_are_refused() {
        let registry = DeviceRegistry::new(1);
        let mut descriptor = DeviceDescriptor::new(1, 1);
        descriptor.interfaces = vec![InterfaceDescriptor::new(0xff, 0, 0); MAX_INTERFACES + 1];
        assert!(matches!(
            registry.attach(descriptor),
            Err(UsbIpError::InvalidDescriptor { .. })
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn bus_id_must_fit_its_record_field() {
        let registry = DeviceRegistry::new(2);
        let long = "1-1.2.3.4.5.6.7.8.9.10.11.12.13.14";
        assert_eq!(long.len(), 34);
        assert!(matches!(
            registry.attach(device(1, 1).with_bus_id(long)),
            Err(UsbIpError::InvalidDescriptor { bus_id, .. }) if bus_id == long
        ));
        assert!(matches!(
            registry.attach(device(1, 1).with_bus_id("")),
            Err(UsbIpError::InvalidDescriptor { .. })
        ));
        let mut long_path = device(1, 1);
        long_path.path = "/".repeat(SYSFS_PATH_MAX + 1);
        assert!(matches!(
            registry.attach(long_path),
            Err(UsbIpError::InvalidDescriptor { .. })
        ));
        assert!(registry.list().is_empty());

        // a bus id filling the whole field is listed as is and can be claimed
        let full = "1-1.2.3.4.5.6.7.8.9.10.11.12.13.";
        assert_eq!(full.len(), SYSFS_BUS_ID_SIZE);
        registry.attach(device(1, 1).with_bus_id(full)).unwrap();
        let bytes = UsbIpResponse::op_rep_devlist(&registry.exportable()).to_bytes();
        let (listed, _) = unpack_devlist_entry(&bytes[12..]).unwrap();
        assert_eq!(listed.bus_id, full);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.claim(&listed.bus_id, SessionId(1), tx).is_ok());
    }
}
