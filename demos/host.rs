use log::*;
use std::sync::Arc;
use usbip_bridge::{ServerConfig, UsbIpServer};

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = ServerConfig::default();
    let addr = config.bind_addr;
    let server = match UsbIpServer::new_from_host(config) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            error!("Could not open host devices: {err}");
            return;
        }
    };
    for device in server.available_devices() {
        info!(
            "Exporting {} ({:04x}:{:04x})",
            device.bus_id, device.vendor_id, device.product_id
        );
    }
    if let Err(err) = usbip_bridge::server(addr, server).await {
        error!("Server stopped: {err}");
    }
}
