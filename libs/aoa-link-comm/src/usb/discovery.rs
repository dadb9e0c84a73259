use aoa_link_core::{connection::DeviceEvent, util::PinnedStream};
use futures_util::{StreamExt, stream};
use log::debug;
use nusb::hotplug::HotplugEvent;

use crate::usb::{UsbDeviceHandle, error::UsbError};

pub type UsbDeviceEvent = DeviceEvent<UsbDeviceHandle>;

/// Every device on the bus right now as an attach event, followed by
/// hotplug events as they happen.
///
/// The watch is registered before the bus is listed, so a device plugged in
/// between the two shows up at least once.
pub async fn device_events() -> Result<PinnedStream<'static, UsbDeviceEvent>, UsbError> {
    let watch = nusb::watch_devices().map_err(UsbError::Enumerate)?;

    let present: Vec<UsbDeviceEvent> = nusb::list_devices()
        .await
        .map_err(UsbError::Enumerate)?
        .map(|info| DeviceEvent::Attached(UsbDeviceHandle::new(info)))
        .collect();
    debug!("{} USB devices present at startup", present.len());

    let hotplug = watch.map(|event| match event {
        HotplugEvent::Connected(info) => DeviceEvent::Attached(UsbDeviceHandle::new(info)),
        HotplugEvent::Disconnected(id) => DeviceEvent::Detached(id),
    });

    Ok(stream::iter(present).chain(hotplug).boxed())
}
