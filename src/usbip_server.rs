use crate::error::{Result, UsbIpError};
use crate::host::simulated::SimulatedHost;
use crate::registry::{AttachOutcome, DeviceRegistry};
use crate::session::SessionId;
use crate::{DeviceDescriptor, ServerConfig, UsbHostInterface};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "nusb")]
pub mod nusb_impl;
#[cfg(feature = "rusb")]
pub mod rusb_impl;
pub mod server;

/// Main struct of a USB/IP server
#[derive(Debug)]
pub struct UsbIpServer {
    registry: DeviceRegistry,
    host: Arc<dyn UsbHostInterface>,
    config: ServerConfig,
    next_session: AtomicU64,
}

impl UsbIpServer {
    pub fn new(host: Arc<dyn UsbHostInterface>, config: ServerConfig) -> Self {
        Self {
            registry: DeviceRegistry::new(config.registry_capacity),
            host,
            config,
            next_session: AtomicU64::new(1),
        }
    }

    /// Create a [UsbIpServer] exporting `devices` backed by a [SimulatedHost]
    ///
    /// Devices beyond the default registry capacity are not exported.
    pub fn new_simulated(devices: Vec<DeviceDescriptor>) -> (Self, Arc<SimulatedHost>) {
        let host = Arc::new(SimulatedHost::new());
        let capacity = ServerConfig::default().registry_capacity.max(devices.len());
        let server = Self::new(
            host.clone(),
            ServerConfig::default().with_registry_capacity(capacity),
        );
        for device in devices {
            // capacity was sized for them, so this cannot fail
            let _ = server.registry.attach(device);
        }
        (server, host)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn host(&self) -> Arc<dyn UsbHostInterface> {
        self.host.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Devices a client may still import
    pub fn available_devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.exportable()
    }

    pub fn add_device(&self, device: DeviceDescriptor) -> Result<AttachOutcome> {
        self.registry.attach(device)
    }

    /// Stop exporting `bus_id`, closing the session that imported it
    pub fn remove_device(&self, bus_id: &str) -> Result<DeviceDescriptor> {
        self.registry
            .detach(bus_id)
            .ok_or_else(|| UsbIpError::NoDevice(bus_id.to_string()))
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_server_exports_all_devices() {
        let devices: Vec<_> = (1..=10).map(|n| DeviceDescriptor::new(1, n)).collect();
        let (server, _host) = UsbIpServer::new_simulated(devices);
        assert_eq!(server.available_devices().len(), 10);
    }

    #[test]
    fn remove_unknown_device_fails() {
        let (server, _host) = UsbIpServer::new_simulated(vec![DeviceDescriptor::new(1, 1)]);
        assert!(matches!(
            server.remove_device("3-3"),
            Err(UsbIpError::NoDevice(_))
        ));
        assert_eq!(server.remove_device("1-1").unwrap().bus_id, "1-1");
        assert!(server.available_devices().is_empty());
    }

    #[test]
    fn session_ids_are_unique() {
        let (server, _host) = UsbIpServer::new_simulated(vec![]);
        assert_ne!(server.next_session_id(), server.next_session_id());
    }
}
