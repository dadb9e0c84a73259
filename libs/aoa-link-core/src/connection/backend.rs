use std::fmt::Debug;

use crate::{
    accessory::DeviceClass,
    negotiation::{BulkEndpoints, ControlChannel},
    transport::Channel,
};

/// A device as announced by an attach event, before it is opened.
pub trait DeviceHandle: Clone + Send + Debug {
    /// Stable key for the device while it stays attached. Detach events
    /// only carry this.
    type Id: Clone + PartialEq + Send + Debug;

    fn id(&self) -> Self::Id;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    fn serial_number(&self) -> Option<&str> {
        None
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::of(self.vendor_id(), self.product_id())
    }
}

/// Something that happened on the bus, in the order it happened.
#[derive(Debug, Clone)]
pub enum DeviceEvent<H: DeviceHandle> {
    Attached(H),
    Detached(H::Id),
    PermissionGranted(H),
    PermissionDenied(H::Id),
}

/// The USB stack the connection manager drives.
pub trait UsbBackend: Send + Sync {
    type Handle: DeviceHandle;
    /// An opened device with its interface claimed. Dropping it releases
    /// the interface.
    type Device: ControlChannel + Send;
    type Channel: Channel;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether the process may open the device. Hosts without a permission
    /// model always may.
    fn has_permission(&self, _handle: &Self::Handle) -> bool {
        true
    }

    /// Ask for access. The answer arrives later as a permission event.
    fn request_permission(&self, _handle: &Self::Handle) -> Result<(), Self::Error> {
        Ok(())
    }

    fn open(&self, handle: &Self::Handle, interface: u8) -> Result<Self::Device, Self::Error>;

    /// Bind a byte channel to the bulk endpoints of an opened device.
    fn open_channel(
        &self,
        device: &Self::Device,
        endpoints: BulkEndpoints,
    ) -> Result<Self::Channel, Self::Error>;
}
