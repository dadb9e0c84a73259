use std::time::Duration;

use aoa_link_core::{
    accessory::DeviceIdentity,
    connection::{DeviceHandle, UsbBackend},
    negotiation::{BulkEndpoints, ControlChannel, EndpointInfo, VendorRequest},
};
use log::{debug, info};
use nusb::{
    Device, DeviceId, DeviceInfo, Interface, MaybeFuture,
    descriptors::TransferType,
    transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError},
};

use crate::usb::{BulkChannel, error::UsbError};

/// The default control pipe. Vendor requests always go here.
const CONTROL_ENDPOINT: u8 = 0x00;

/// A device seen on the bus, not yet opened.
#[derive(Debug, Clone)]
pub struct UsbDeviceHandle(DeviceInfo);

impl UsbDeviceHandle {
    pub fn new(info: DeviceInfo) -> Self {
        Self(info)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.0
    }
}

impl DeviceHandle for UsbDeviceHandle {
    type Id = DeviceId;

    fn id(&self) -> DeviceId {
        self.0.id()
    }

    fn vendor_id(&self) -> u16 {
        self.0.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.0.product_id()
    }

    fn serial_number(&self) -> Option<&str> {
        self.0.serial_number()
    }
}

/// An opened device with one claimed interface. Dropping it releases the
/// interface.
pub struct NusbDevice {
    device: Device,
    interface: Interface,
    identity: DeviceIdentity,
}

impl ControlChannel for NusbDevice {
    type Error = TransferError;

    fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    fn vendor_in(
        &self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        self.device
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    length,
                },
                timeout,
            )
            .wait()
    }

    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        // A completed OUT control transfer has moved the whole data stage
        self.device
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map(|()| data.len())
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        let Some(setting) = self.interface.descriptor() else {
            return Vec::new();
        };

        setting
            .endpoints()
            .filter(|ep| matches!(ep.transfer_type(), TransferType::Bulk))
            .map(|ep| EndpointInfo::from_address(ep.address()))
            .collect()
    }
}

/// [`UsbBackend`] over nusb. Desktop hosts have no runtime permission
/// prompt, so permission checks use the trait defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NusbBackend;

impl UsbBackend for NusbBackend {
    type Handle = UsbDeviceHandle;
    type Device = NusbDevice;
    type Channel = BulkChannel;
    type Error = UsbError;

    fn open(&self, handle: &UsbDeviceHandle, interface: u8) -> Result<NusbDevice, UsbError> {
        let info = handle.info();
        let device = info.open().wait().map_err(UsbError::Open)?;
        debug!("Opened device: {device:?}");

        let claimed = device
            .claim_interface(interface)
            .wait()
            .map_err(|source| UsbError::Claim { interface, source })?;
        debug!("Claimed interface {interface}");

        Ok(NusbDevice {
            identity: DeviceIdentity::new(
                info.vendor_id(),
                info.product_id(),
                interface,
                CONTROL_ENDPOINT,
            ),
            device,
            interface: claimed,
        })
    }

    fn open_channel(
        &self,
        device: &NusbDevice,
        endpoints: BulkEndpoints,
    ) -> Result<BulkChannel, UsbError> {
        let in_address = endpoints.bulk_in.address;
        let out_address = endpoints.bulk_out.address;

        let bulk_in = device
            .interface
            .endpoint::<Bulk, In>(in_address)
            .map_err(|source| UsbError::Endpoint {
                address: in_address,
                source,
            })?;
        let bulk_out = device
            .interface
            .endpoint::<Bulk, Out>(out_address)
            .map_err(|source| UsbError::Endpoint {
                address: out_address,
                source,
            })?;

        info!(
            "Bulk channel open on {} (in {in_address:#04x}, out {out_address:#04x})",
            device.identity
        );
        Ok(BulkChannel::new(bulk_in, bulk_out))
    }
}
