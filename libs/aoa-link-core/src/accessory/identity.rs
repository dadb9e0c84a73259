use std::fmt::Display;

/// Vendor ID a device reports once it has switched into accessory mode.
pub const USB_ACCESSORY_VENDOR_ID: u16 = 0x18D1;
/// Product ID of an accessory-mode device.
pub const USB_ACCESSORY_PRODUCT_ID: u16 = 0x2D00;
/// Product ID of an accessory-mode device that also exposes ADB.
pub const USB_ACCESSORY_ADB_PRODUCT_ID: u16 = 0x2D01;

/// What a device looks like from its vendor and product IDs alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Already in accessory mode.
    Accessory,
    /// Already in accessory mode, with ADB enabled alongside.
    AccessoryWithAdb,
    /// Anything else. It may still speak the accessory protocol, but it has
    /// to be asked to switch first.
    Other,
}

impl DeviceClass {
    pub fn of(vendor_id: u16, product_id: u16) -> Self {
        match (vendor_id, product_id) {
            (USB_ACCESSORY_VENDOR_ID, USB_ACCESSORY_PRODUCT_ID) => DeviceClass::Accessory,
            (USB_ACCESSORY_VENDOR_ID, USB_ACCESSORY_ADB_PRODUCT_ID) => {
                DeviceClass::AccessoryWithAdb
            }
            _ => DeviceClass::Other,
        }
    }

    pub fn is_accessory(self) -> bool {
        matches!(self, DeviceClass::Accessory | DeviceClass::AccessoryWithAdb)
    }
}

/// Identity of an opened device: its IDs plus the interface that was claimed
/// on it and the endpoint used for control transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    vendor_id: u16,
    product_id: u16,
    interface: u8,
    control_endpoint: u8,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, interface: u8, control_endpoint: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            interface,
            control_endpoint,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn control_endpoint(&self) -> u8 {
        self.control_endpoint
    }

    pub fn class(&self) -> DeviceClass {
        DeviceClass::of(self.vendor_id, self.product_id)
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (interface {}, control endpoint {:#04x})",
            self.vendor_id, self.product_id, self.interface, self.control_endpoint
        )
    }
}
