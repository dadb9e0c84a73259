use std::{fmt::Display, time::Duration};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    accessory::{AccessoryDescriptor, StringField},
    negotiation::{
        ACCESSORY_GET_PROTOCOL, ACCESSORY_SEND_STRING, ACCESSORY_START, BulkEndpoints,
        ControlChannel, EndpointDirection, EndpointInfo, VendorRequest,
    },
};

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Accessory protocol version, as reported by `GET_PROTOCOL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    /// Version value used in diagnostics when the device gave no usable answer.
    pub const NO_RESPONSE: i32 = -1;

    pub fn new(version: u16) -> Self {
        Self(version)
    }

    /// Decode the two little-endian bytes of a `GET_PROTOCOL` response.
    /// Anything other than exactly two bytes is not a version.
    pub fn from_response(response: &[u8]) -> Option<Self> {
        let [low, high] = response else {
            return None;
        };
        Some(Self(u16::from_le_bytes([*low, *high])))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_supported(self) -> bool {
        self.0 >= 1
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reasons a negotiation attempt ends. Each one is final for the attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Device does not support the accessory protocol (reported version {version})")]
    UnsupportedProtocol { version: i32 },
    #[error("Device refused to switch to accessory mode")]
    ModeSwitchRefused,
    #[error("Unable to find bulk endpoints on interface {interface}")]
    EndpointsNotFound { interface: u8 },
}

/// An identification string the device did not fully take. Logged and
/// reported, never fatal: device firmware is free to ignore fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringSendFailed {
    pub field: StringField,
    pub expected: usize,
    /// Bytes the device took, or `None` if the transfer itself failed.
    pub transferred: Option<usize>,
}

impl Display for StringSendFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.transferred {
            Some(transferred) => write!(
                f,
                "Failed to send string {:?}: {} of {} bytes transferred",
                self.field, transferred, self.expected
            ),
            None => write!(f, "Failed to send string {:?}: transfer failed", self.field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// The device accepted `ACCESSORY_START` and is about to drop off the
    /// bus and come back as an accessory.
    SwitchRequested {
        version: ProtocolVersion,
        string_failures: Vec<StringSendFailed>,
    },
    /// The device already is an accessory and its bulk endpoints are known.
    Ready {
        version: ProtocolVersion,
        endpoints: BulkEndpoints,
    },
}

/// Runs the accessory handshake against one opened device.
///
/// Which path is taken depends on the device's vendor and product IDs, not
/// on what it answers: a device that is not yet an accessory is sent the
/// identification strings and the start command, a device that already is
/// one has its bulk endpoints looked up. Both paths check the protocol
/// version first.
#[derive(Debug, Clone)]
pub struct Negotiator {
    descriptor: AccessoryDescriptor,
    timeout: Duration,
}

impl Negotiator {
    pub fn new(descriptor: AccessoryDescriptor) -> Self {
        Self {
            descriptor,
            timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn descriptor(&self) -> &AccessoryDescriptor {
        &self.descriptor
    }

    pub fn negotiate<C>(&self, device: &C) -> Result<NegotiationOutcome, NegotiationError>
    where
        C: ControlChannel,
    {
        let identity = device.identity();

        let version = self.query_protocol(device)?;

        if identity.class().is_accessory() {
            info!("Connecting to accessory: {identity}");
            let endpoints =
                select_bulk_endpoints(&device.endpoints()).ok_or_else(|| {
                    error!("Unable to find bulk endpoints");
                    NegotiationError::EndpointsNotFound {
                        interface: identity.interface(),
                    }
                })?;
            debug!(
                "Bulk IN endpoint: {:#04x}, bulk OUT endpoint: {:#04x}",
                endpoints.bulk_in.address, endpoints.bulk_out.address
            );
            Ok(NegotiationOutcome::Ready { version, endpoints })
        } else {
            debug!("Attempting to switch {identity} to accessory mode");
            let string_failures = self.send_identification(device);
            self.start_accessory_mode(device)?;
            Ok(NegotiationOutcome::SwitchRequested {
                version,
                string_failures,
            })
        }
    }

    /// Ask the device for its accessory protocol version. Anything below 1,
    /// a short answer or a failed transfer all mean it can't be used.
    pub fn query_protocol<C>(&self, device: &C) -> Result<ProtocolVersion, NegotiationError>
    where
        C: ControlChannel,
    {
        let response = device
            .vendor_in(
                VendorRequest::new(ACCESSORY_GET_PROTOCOL, 0),
                size_of::<u16>() as u16,
                self.timeout,
            )
            .inspect_err(|e| warn!("GET_PROTOCOL transfer failed: {e}"))
            .ok();

        let version = response.as_deref().and_then(ProtocolVersion::from_response);

        match version {
            Some(version) if version.is_supported() => {
                debug!("Protocol version: {version}");
                Ok(version)
            }
            other => {
                let version = other.map_or(ProtocolVersion::NO_RESPONSE, |v| v.get() as i32);
                error!("Device does not support accessory protocol (version {version})");
                Err(NegotiationError::UnsupportedProtocol { version })
            }
        }
    }

    /// Send all six identification strings. Failures are collected and
    /// logged, and never stop the remaining sends.
    pub fn send_identification<C>(&self, device: &C) -> Vec<StringSendFailed>
    where
        C: ControlChannel,
    {
        self.descriptor
            .fields()
            .filter_map(|(field, value)| self.send_string(device, field, value).err())
            .collect()
    }

    fn send_string<C>(
        &self,
        device: &C,
        field: StringField,
        value: &str,
    ) -> Result<(), StringSendFailed>
    where
        C: ControlChannel,
    {
        let payload = string_payload(value);
        let transferred = device
            .vendor_out(
                VendorRequest::new(ACCESSORY_SEND_STRING, field.index()),
                &payload,
                self.timeout,
            )
            .inspect_err(|e| warn!("SEND_STRING transfer failed: {e}"))
            .ok();

        if transferred == Some(payload.len()) {
            debug!("Sent string {}: \"{value}\"", field.index());
            Ok(())
        } else {
            let failure = StringSendFailed {
                field,
                expected: payload.len(),
                transferred,
            };
            error!("{failure}: \"{value}\"");
            Err(failure)
        }
    }

    /// Send `ACCESSORY_START`. The device signals acceptance with a zero
    /// length transfer.
    pub fn start_accessory_mode<C>(&self, device: &C) -> Result<(), NegotiationError>
    where
        C: ControlChannel,
    {
        debug!("Sending accessory start request.");
        let transferred = device
            .vendor_out(VendorRequest::new(ACCESSORY_START, 0), &[], self.timeout)
            .inspect_err(|e| warn!("ACCESSORY_START transfer failed: {e}"));

        match transferred {
            Ok(0) => {
                debug!("Waiting for device to re-enumerate...");
                Ok(())
            }
            _ => {
                error!("Device refused to switch to accessory mode.");
                Err(NegotiationError::ModeSwitchRefused)
            }
        }
    }
}

/// Wire payload of an identification string: the UTF-8 text and one NUL.
pub fn string_payload(value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(value.len() + 1);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    payload
}

/// First IN endpoint becomes bulk-in, first OUT endpoint becomes bulk-out.
/// Later endpoints of an already matched direction are ignored.
pub fn select_bulk_endpoints(endpoints: &[EndpointInfo]) -> Option<BulkEndpoints> {
    let mut bulk_in = None;
    let mut bulk_out = None;

    for endpoint in endpoints {
        match endpoint.direction {
            EndpointDirection::In => {
                bulk_in.get_or_insert(*endpoint);
            }
            EndpointDirection::Out => {
                bulk_out.get_or_insert(*endpoint);
            }
        }
    }

    Some(BulkEndpoints {
        bulk_in: bulk_in?,
        bulk_out: bulk_out?,
    })
}
