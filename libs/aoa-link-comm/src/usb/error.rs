use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("Failed to open USB device: {0}")]
    Open(nusb::Error),
    #[error("Failed to claim interface {interface}: {source}")]
    Claim { interface: u8, source: nusb::Error },
    #[error("Failed to open endpoint {address:#04x}: {source}")]
    Endpoint { address: u8, source: nusb::Error },
    #[error("Failed to enumerate USB devices: {0}")]
    Enumerate(nusb::Error),
}
