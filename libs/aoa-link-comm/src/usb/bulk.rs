use std::{
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use aoa_link_core::{transport::Channel, util::lock};
use log::{debug, warn};
use nusb::{
    Endpoint,
    transfer::{Buffer, Bulk, Completion, In, Out, TransferError},
};

/// Bulk transfers never time out on their own. Waits are sliced so that a
/// close is noticed within this interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a cancelled transfer to be handed back.
const CANCEL_WAIT: Duration = Duration::from_secs(1);

/// The parts of a bulk endpoint a blocking transfer needs.
trait BulkPipe {
    fn wait_next(&mut self, timeout: Duration) -> Option<Completion>;
    fn cancel(&mut self);
    fn in_flight(&self) -> usize;
}

impl BulkPipe for Endpoint<Bulk, In> {
    fn wait_next(&mut self, timeout: Duration) -> Option<Completion> {
        self.wait_next_complete(timeout)
    }

    fn cancel(&mut self) {
        self.cancel_all();
    }

    fn in_flight(&self) -> usize {
        self.pending()
    }
}

impl BulkPipe for Endpoint<Bulk, Out> {
    fn wait_next(&mut self, timeout: Duration) -> Option<Completion> {
        self.wait_next_complete(timeout)
    }

    fn cancel(&mut self) {
        self.cancel_all();
    }

    fn in_flight(&self) -> usize {
        self.pending()
    }
}

struct OutPipe {
    endpoint: Endpoint<Bulk, Out>,
    /// Handed back by the last completed write and reused by the next.
    buffer: Option<Buffer>,
}

/// A blocking [`Channel`] over one bulk IN and one bulk OUT endpoint.
///
/// Each direction has its own lock, so a read blocked waiting on the
/// device never holds up a write.
pub struct BulkChannel {
    bulk_in: Mutex<Endpoint<Bulk, In>>,
    bulk_out: Mutex<OutPipe>,
    closed: AtomicBool,
}

impl BulkChannel {
    pub fn new(bulk_in: Endpoint<Bulk, In>, bulk_out: Endpoint<Bulk, Out>) -> Self {
        Self {
            bulk_in: Mutex::new(bulk_in),
            bulk_out: Mutex::new(OutPipe {
                endpoint: bulk_out,
                buffer: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    /// Wait for the transfer just submitted on `pipe`, giving up and
    /// cancelling it once the channel is closed.
    fn complete(&self, pipe: &mut impl BulkPipe) -> io::Result<Completion> {
        loop {
            if let Some(completion) = pipe.wait_next(POLL_INTERVAL) {
                return Ok(completion);
            }

            if self.closed.load(Ordering::SeqCst) {
                pipe.cancel();
                while pipe.in_flight() > 0 {
                    if pipe.wait_next(CANCEL_WAIT).is_none() {
                        warn!("Cancelled bulk transfer was not returned");
                        break;
                    }
                }
                return Err(closed_error());
            }
        }
    }
}

impl Channel for BulkChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut endpoint = lock(&self.bulk_in);

        let requested = read_request_len(buf.len(), endpoint.max_packet_size());
        let mut buffer = endpoint.allocate(requested);
        buffer.set_requested_len(requested);
        endpoint.submit(buffer);

        let completion = self.complete(&mut *endpoint)?;
        completion.status.map_err(transfer_error)?;

        let received = &completion.buffer[..completion.actual_len.min(completion.buffer.len())];
        let filled = received.len().min(buf.len());
        if filled < received.len() {
            warn!(
                "Dropping {} bytes that did not fit the read buffer",
                received.len() - filled
            );
        }
        buf[..filled].copy_from_slice(&received[..filled]);
        Ok(filled)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut out = lock(&self.bulk_out);
        let OutPipe { endpoint, buffer } = &mut *out;

        let mut out_buffer = buffer
            .take()
            .filter(|buffer| buffer.capacity() >= data.len())
            .unwrap_or_else(|| endpoint.allocate(data.len()));
        out_buffer.clear();
        out_buffer.extend_fill(data.len(), 0).copy_from_slice(data);

        let terminate = needs_zero_length_packet(data.len(), endpoint.max_packet_size());
        endpoint.submit(out_buffer);
        if terminate {
            endpoint.submit(Buffer::new(0));
        }

        let completion = self.complete(&mut *endpoint)?;
        let written = completion.actual_len;
        buffer.replace(completion.buffer);

        if terminate {
            self.complete(&mut *endpoint)?
                .status
                .map_err(transfer_error)?;
        }
        completion.status.map_err(transfer_error)?;
        Ok(written)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing bulk channel");
        }
    }
}

/// IN transfers must ask for whole packets. Round the caller's buffer down
/// to a packet multiple, but never below one packet.
fn read_request_len(capacity: usize, max_packet_size: usize) -> usize {
    let packet = max_packet_size.max(1);
    (capacity / packet).max(1) * packet
}

/// A write that ends exactly on a packet boundary is followed by a
/// zero-length packet, otherwise the device keeps its read open and the
/// next write lands in the same transfer.
fn needs_zero_length_packet(len: usize, max_packet_size: usize) -> bool {
    max_packet_size > 0 && len > 0 && len % max_packet_size == 0
}

fn transfer_error(error: TransferError) -> io::Error {
    let kind = match error {
        TransferError::Cancelled => io::ErrorKind::Interrupted,
        TransferError::Disconnected => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Bulk channel is closed")
}
