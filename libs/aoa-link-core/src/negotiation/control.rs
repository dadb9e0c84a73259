use std::time::Duration;

use crate::accessory::DeviceIdentity;

/// Vendor request: read the accessory protocol version (device to host).
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;
/// Vendor request: send one identification string (host to device).
pub const ACCESSORY_SEND_STRING: u8 = 52;
/// Vendor request: switch into accessory mode (host to device).
pub const ACCESSORY_START: u8 = 53;

/// Direction of an endpoint, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: EndpointDirection,
}

impl EndpointInfo {
    /// Build from an endpoint address; bit 7 carries the direction.
    pub fn from_address(address: u8) -> Self {
        let direction = if address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        };
        Self { address, direction }
    }
}

/// The pair of bulk endpoints messages travel over once a device is in
/// accessory mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BulkEndpoints {
    pub bulk_in: EndpointInfo,
    pub bulk_out: EndpointInfo,
}

/// A vendor-type request addressed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl VendorRequest {
    pub fn new(request: u8, index: u16) -> Self {
        Self {
            request,
            value: 0,
            index,
        }
    }
}

/// An opened device with a claimed interface, able to do vendor control
/// transfers and to list the claimed interface's endpoints.
pub trait ControlChannel {
    type Error: std::error::Error + Send + Sync + 'static;

    fn identity(&self) -> DeviceIdentity;

    /// Device-to-host transfer of up to `length` bytes. The returned buffer
    /// may be shorter than requested.
    fn vendor_in(
        &self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, Self::Error>;

    /// Host-to-device transfer. Returns the number of bytes the device took.
    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Self::Error>;

    /// Endpoints of the claimed interface, in descriptor order.
    fn endpoints(&self) -> Vec<EndpointInfo>;
}
