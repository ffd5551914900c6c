use crate::{DEFAULT_MAX_TRANSFER_LENGTH, USBIP_PORT};
use std::net::{Ipv4Addr, SocketAddr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunables of a [crate::UsbIpServer]
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ServerConfig {
    /// Address the accept loop binds to
    pub bind_addr: SocketAddr,
    /// Transfers one session may have in flight before submits are refused
    pub max_pending_transfers: usize,
    /// Largest CMD_SUBMIT payload accepted from a client
    pub max_transfer_length: usize,
    /// Devices the registry holds at most
    pub registry_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, USBIP_PORT)),
            max_pending_transfers: 256,
            max_transfer_length: DEFAULT_MAX_TRANSFER_LENGTH,
            registry_capacity: 8,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_max_pending_transfers(mut self, max_pending_transfers: usize) -> Self {
        self.max_pending_transfers = max_pending_transfers;
        self
    }

    pub fn with_max_transfer_length(mut self, max_transfer_length: usize) -> Self {
        self.max_transfer_length = max_transfer_length;
        self
    }

    pub fn with_registry_capacity(mut self, registry_capacity: usize) -> Self {
        self.registry_capacity = registry_capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_usbip_port() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3240);
        assert!(config.registry_capacity >= 1);
    }

    #[test]
    fn builders_override_defaults() {
        let config = ServerConfig::default()
            .with_max_pending_transfers(4)
            .with_registry_capacity(1)
            .with_max_transfer_length(512);
        assert_eq!(config.max_pending_transfers, 4);
        assert_eq!(config.registry_capacity, 1);
        assert_eq!(config.max_transfer_length, 512);
    }
}
