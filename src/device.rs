use crate::{MAX_INTERFACES, UsbSpeed};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Class triple of one interface, as announced in OP_REP_DEVLIST
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InterfaceDescriptor {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub fn new(interface_class: u8, interface_subclass: u8, interface_protocol: u8) -> Self {
        Self {
            interface_class,
            interface_subclass,
            interface_protocol,
        }
    }
}

/// Identity of one exportable USB device
///
/// Captured once from host enumeration and replaced wholesale when the
/// device is attached again.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceDescriptor {
    pub path: String,
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_bcd: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    /// Interface count as carried on the wire; kept equal to `interfaces.len()`
    /// except for records decoded without their interface list
    pub num_interfaces: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    /// Create a descriptor for a device on bus 1 at the given port, e.g. `1-1`
    pub fn new(bus_num: u32, dev_num: u32) -> Self {
        let bus_id = format!("{bus_num}-{dev_num}");
        Self {
            path: format!("/sys/devices/platform/usbip/usb{bus_num}/{bus_id}"),
            bus_id,
            bus_num,
            dev_num,
            speed: UsbSpeed::Full as u32,
            configuration_value: 1,
            num_configurations: 1,
            ..Self::default()
        }
    }

    pub fn with_bus_id(mut self, bus_id: &str) -> Self {
        self.bus_id = bus_id.to_string();
        self
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = speed as u32;
        self
    }

    pub fn with_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.device_class = class;
        self.device_subclass = subclass;
        self.device_protocol = protocol;
        self
    }

    /// Append an interface; interfaces past [MAX_INTERFACES] are dropped
    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        if self.interfaces.len() < MAX_INTERFACES {
            self.interfaces.push(interface);
            self.num_interfaces = self.interfaces.len() as u8;
        } else {
            log::warn!(
                "Device {} has more than {MAX_INTERFACES} interfaces, ignoring the rest",
                self.bus_id
            );
        }
        self
    }

    /// Device id used in URB headers, computed as the Linux stub driver does
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xffff)
    }

    /// Same device without its interface list, as carried in OP_REP_IMPORT
    pub fn without_interfaces(&self) -> Self {
        Self {
            interfaces: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devid_combines_bus_and_device_numbers() {
        let dev = DeviceDescriptor::new(1, 3);
        assert_eq!(dev.bus_id, "1-3");
        assert_eq!(dev.devid(), 0x0001_0003);
    }

    #[test]
    fn interface_count_follows_interfaces() {
        let dev = DeviceDescriptor::new(1, 1)
            .with_interface(InterfaceDescriptor::new(0x03, 0x01, 0x01))
            .with_interface(InterfaceDescriptor::new(0x03, 0x00, 0x00));
        assert_eq!(dev.num_interfaces, 2);
        let bare = dev.without_interfaces();
        assert_eq!(bare.num_interfaces, 2);
        assert!(bare.interfaces.is_empty());
    }

    #[test]
    fn interface_list_is_bounded() {
        let mut dev = DeviceDescriptor::new(1, 1);
        for _ in 0..MAX_INTERFACES + 4 {
            dev = dev.with_interface(InterfaceDescriptor::default());
        }
        assert_eq!(dev.interfaces.len(), MAX_INTERFACES);
        assert_eq!(dev.num_interfaces as usize, MAX_INTERFACES);
    }
}
