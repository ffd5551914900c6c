use log::*;

use crate::error::Result;
use crate::{DeviceDescriptor, InterfaceDescriptor, UsbIpServer, UsbSpeed};

impl UsbIpServer {
    /// Capture descriptors of Vec<[nusb::DeviceInfo]> for attaching to the registry
    pub fn with_nusb_devices(nusb_device_infos: Vec<nusb::DeviceInfo>) -> Vec<DeviceDescriptor> {
        nusb_device_infos.iter().map(descriptor_of).collect()
    }

    /// Descriptors of every device nusb enumerates on this host
    pub fn nusb_host_devices() -> Result<Vec<DeviceDescriptor>> {
        Ok(nusb::list_devices()?.map(|info| descriptor_of(&info)).collect())
    }
}

/// Build a [DeviceDescriptor] from enumeration data
///
/// The configuration value needs the device opened; it stays 1 when that fails.
pub fn descriptor_of(device_info: &nusb::DeviceInfo) -> DeviceDescriptor {
    let bus_id = format!(
        "{}-{}",
        device_info.bus_number(),
        device_info.device_address()
    );
    let mut descriptor = DeviceDescriptor::new(
        device_info.bus_number().into(),
        device_info.device_address().into(),
    )
    .with_bus_id(&bus_id)
    .with_ids(device_info.vendor_id(), device_info.product_id())
    .with_speed(device_info.speed().map(speed_of).unwrap_or_default())
    .with_class(
        device_info.class(),
        device_info.subclass(),
        device_info.protocol(),
    );
    descriptor.device_bcd = device_info.device_version();

    for intf in device_info.interfaces() {
        descriptor = descriptor.with_interface(InterfaceDescriptor::new(
            intf.class(),
            intf.subclass(),
            intf.protocol(),
        ));
    }

    match device_info.open() {
        Ok(dev) => {
            descriptor.num_configurations = dev.configurations().count() as u8;
            match dev.active_configuration() {
                Ok(cfg) => descriptor.configuration_value = cfg.configuration_value(),
                Err(err) => warn!("Impossible to get active configuration of {bus_id}: {err}"),
            }
        }
        Err(err) => debug!("Impossible to open device {bus_id}: {err}"),
    }
    descriptor
}

fn speed_of(speed: nusb::Speed) -> UsbSpeed {
    match speed {
        nusb::Speed::Low => UsbSpeed::Low,
        nusb::Speed::Full => UsbSpeed::Full,
        nusb::Speed::High => UsbSpeed::High,
        nusb::Speed::Super => UsbSpeed::Super,
        nusb::Speed::SuperPlus => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speeds_follow_linux_numbering() {
        assert_eq!(speed_of(nusb::Speed::Low) as u32, 1);
        assert_eq!(speed_of(nusb::Speed::SuperPlus), UsbSpeed::SuperPlus);
    }
}
