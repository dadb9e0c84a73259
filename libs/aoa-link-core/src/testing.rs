//! In-memory stand-ins for USB devices and byte channels.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use thiserror::Error;

use crate::{
    accessory::{DeviceIdentity, StringField, USB_ACCESSORY_PRODUCT_ID, USB_ACCESSORY_VENDOR_ID},
    negotiation::{
        ACCESSORY_GET_PROTOCOL, ACCESSORY_SEND_STRING, ACCESSORY_START, ControlChannel,
        EndpointInfo, VendorRequest,
    },
    transport::Channel,
    util::lock,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    In {
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    },
    Out {
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
}

#[derive(Debug, Error)]
#[error("Mock transfer failed")]
pub struct MockTransferError;

/// A device answering vendor requests from a script. Clones share the
/// transfer log.
#[derive(Debug, Clone)]
pub struct MockDevice {
    identity: DeviceIdentity,
    protocol_response: Option<Vec<u8>>,
    short_string: Option<StringField>,
    start_result: Result<usize, ()>,
    endpoints: Vec<EndpointInfo>,
    transfers: Arc<Mutex<Vec<Transfer>>>,
}

impl MockDevice {
    /// A phone that speaks protocol version 2 but is not in accessory mode.
    pub fn phone() -> Self {
        Self::new(DeviceIdentity::new(0x04E8, 0x6860, 0, 0))
    }

    /// A device already in accessory mode with one IN and one OUT endpoint.
    pub fn accessory() -> Self {
        Self::new(DeviceIdentity::new(
            USB_ACCESSORY_VENDOR_ID,
            USB_ACCESSORY_PRODUCT_ID,
            0,
            0,
        ))
    }

    fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            protocol_response: Some(vec![0x02, 0x00]),
            short_string: None,
            start_result: Ok(0),
            endpoints: vec![
                EndpointInfo::from_address(0x81),
                EndpointInfo::from_address(0x01),
            ],
            transfers: Arc::default(),
        }
    }

    pub fn with_protocol_response(mut self, response: Vec<u8>) -> Self {
        self.protocol_response = Some(response);
        self
    }

    pub fn with_failing_protocol_query(mut self) -> Self {
        self.protocol_response = None;
        self
    }

    pub fn with_short_string(mut self, field: StringField) -> Self {
        self.short_string = Some(field);
        self
    }

    pub fn with_start_result(mut self, result: Result<usize, ()>) -> Self {
        self.start_result = result;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointInfo>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.transfers).clone()
    }

    pub fn requests(&self) -> Vec<u8> {
        self.transfers()
            .iter()
            .map(|transfer| match transfer {
                Transfer::In { request, .. } | Transfer::Out { request, .. } => *request,
            })
            .collect()
    }
}

impl ControlChannel for MockDevice {
    type Error = MockTransferError;

    fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    fn vendor_in(
        &self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, Self::Error> {
        lock(&self.transfers).push(Transfer::In {
            request: request.request,
            value: request.value,
            index: request.index,
            length,
            timeout,
        });

        match request.request {
            ACCESSORY_GET_PROTOCOL => self.protocol_response.clone().ok_or(MockTransferError),
            _ => Err(MockTransferError),
        }
    }

    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, Self::Error> {
        lock(&self.transfers).push(Transfer::Out {
            request: request.request,
            value: request.value,
            index: request.index,
            data: data.to_vec(),
        });

        match request.request {
            ACCESSORY_SEND_STRING
                if self.short_string.map(StringField::index) == Some(request.index) =>
            {
                Ok(data.len().saturating_sub(1))
            }
            ACCESSORY_SEND_STRING => Ok(data.len()),
            ACCESSORY_START => self.start_result.map_err(|()| MockTransferError),
            _ => Err(MockTransferError),
        }
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.clone()
    }
}

#[derive(Default)]
struct ChannelState {
    reads: VecDeque<io::Result<Vec<u8>>>,
    written: Vec<u8>,
    writes: usize,
}

/// A channel whose reads are fed by the test. Reads block until something is
/// queued or the channel is closed. Writes land byte by byte in a shared
/// log, yielding between bytes so unsynchronised writers interleave.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    state: Arc<Mutex<ChannelState>>,
    readable: Arc<Condvar>,
    closed: Arc<AtomicBool>,
    reads_attempted: Arc<AtomicUsize>,
    short_writes: Arc<AtomicBool>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, data: &[u8]) {
        lock(&self.state).reads.push_back(Ok(data.to_vec()));
        self.readable.notify_all();
    }

    pub fn push_read_error(&self) {
        lock(&self.state)
            .reads
            .push_back(Err(io::Error::other("scripted read failure")));
        self.readable.notify_all();
    }

    pub fn fail_writes_short(&self) {
        self.short_writes.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn reads_attempted(&self) -> usize {
        self.reads_attempted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for ScriptedChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads_attempted.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            if let Some(next) = state.reads.pop_front() {
                let data = next?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        lock(&self.state).writes += 1;
        if self.short_writes.load(Ordering::SeqCst) {
            return Ok(buf.len() / 2);
        }
        for byte in buf {
            lock(&self.state).written.push(*byte);
            thread::yield_now();
        }
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _state = lock(&self.state);
        self.readable.notify_all();
    }
}
