//! Concrete channels for the accessory link: a nusb backend for the USB
//! host side, and the accessory device node for the device side.

#[cfg(feature = "accessory")]
pub mod accessory;
#[cfg(feature = "usb-host")]
pub mod usb;
