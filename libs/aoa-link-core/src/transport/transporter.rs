use std::{
    io,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    transport::{
        BufferPool, Channel, DEFAULT_POOL_SIZE, EncodeError, EnvelopeCodec, MAX_ENVELOPE_SIZE,
        MessageHandler,
    },
    util::lock,
};

/// Pause between a failed read and the next attempt.
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(5);

const READER_THREAD_NAME: &str = "aoa-transport-reader";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("Read failed: {0}")]
    Read(#[source] io::Error),
    #[error("Write failed: {0}")]
    Write(#[source] io::Error),
    #[error("Short write: {written} of {expected} bytes transferred")]
    ShortWrite { written: usize, expected: usize },
    #[error("Transport is closed")]
    Closed,
    #[error("Failed to start the reader thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Capacity of each read buffer, and the largest envelope sent.
    pub max_envelope_size: usize,
    /// Read buffers kept in the pool.
    pub pool_size: usize,
    pub read_backoff: Duration,
    /// Give up after this many reads in a row have failed. `None` retries
    /// until the transport is closed.
    pub max_read_failures: Option<u32>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_envelope_size: MAX_ENVELOPE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            read_backoff: DEFAULT_READ_BACKOFF,
            max_read_failures: None,
        }
    }
}

#[derive(Debug, Default)]
struct LoopFlags {
    stop_requested: bool,
    exited: bool,
}

/// Shared between a transporter and its reader: the stop request going one
/// way and the exit notice coming back.
#[derive(Debug, Default)]
struct LoopSignal {
    flags: Mutex<LoopFlags>,
    changed: Condvar,
}

impl LoopSignal {
    fn request_stop(&self) {
        lock(&self.flags).stop_requested = true;
        self.changed.notify_all();
    }

    fn stop_requested(&self) -> bool {
        lock(&self.flags).stop_requested
    }

    /// Sleep for `duration` unless a stop is requested first. Returns
    /// whether a stop was requested.
    fn sleep(&self, duration: Duration) -> bool {
        let flags = lock(&self.flags);
        let (flags, _) = self
            .changed
            .wait_timeout_while(flags, duration, |flags| !flags.stop_requested)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        flags.stop_requested
    }

    fn mark_exited(&self) {
        lock(&self.flags).exited = true;
        self.changed.notify_all();
    }

    fn has_exited(&self) -> bool {
        lock(&self.flags).exited
    }

    fn wait_exited(&self, timeout: Duration) -> bool {
        let flags = lock(&self.flags);
        let (flags, _) = self
            .changed
            .wait_timeout_while(flags, timeout, |flags| !flags.exited)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        flags.exited
    }
}

/// Turns a raw [`Channel`] into a message channel.
///
/// Creating a transporter starts its one reader thread. The reader pulls a
/// buffer from the pool, does a blocking read, cuts the envelope out, hands
/// the buffer back and passes the decoded text to the handler. A failed
/// read is logged and retried after the backoff interval.
///
/// Sends are written on the caller's thread, one message at a time.
pub struct Transporter<C: Channel> {
    channel: Arc<C>,
    codec: EnvelopeCodec,
    /// Reused wire buffer. Holding its lock is what keeps writers apart.
    out_buffer: Mutex<Vec<u8>>,
    signal: Arc<LoopSignal>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Channel> Transporter<C> {
    pub fn spawn(
        channel: C,
        options: &TransportOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TransportError> {
        let channel = Arc::new(channel);
        let codec = EnvelopeCodec::new(options.max_envelope_size);
        let signal = Arc::new(LoopSignal::default());

        let read_loop = ReadLoop {
            channel: channel.clone(),
            pool: BufferPool::new(options.max_envelope_size, options.pool_size),
            codec,
            handler,
            signal: signal.clone(),
            backoff: options.read_backoff,
            max_failures: options.max_read_failures,
        };

        let reader = thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || read_loop.run())
            .map_err(TransportError::Spawn)?;

        debug!(
            "Transport started ({} x {} byte read buffers)",
            options.pool_size, options.max_envelope_size
        );

        Ok(Self {
            channel,
            codec,
            out_buffer: Mutex::new(Vec::with_capacity(options.max_envelope_size)),
            signal,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn send(&self, message: &str) -> Result<(), TransportError> {
        self.send_bytes(message.as_bytes())
    }

    /// Encode and write one message. A write that does not take the whole
    /// envelope fails and the message counts as not delivered.
    pub fn send_bytes(&self, message: &[u8]) -> Result<(), TransportError> {
        let mut out = lock(&self.out_buffer);

        if self.signal.stop_requested() {
            return Err(TransportError::Closed);
        }

        out.clear();
        self.codec.encode_into(message, &mut out)?;

        let written = self.channel.write(&out).map_err(TransportError::Write)?;
        if written != out.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: out.len(),
            });
        }

        debug!("Sent {written} byte envelope");
        Ok(())
    }

    /// Stop the reader and release the channel. Does not wait for the
    /// reader to finish; see [`Transporter::wait_stopped`].
    pub fn close(&self) {
        if self.signal.stop_requested() {
            return;
        }
        debug!("Closing transport");
        self.signal.request_stop();
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.signal.stop_requested()
    }

    /// Whether the reader thread is still running.
    pub fn is_reading(&self) -> bool {
        !self.signal.has_exited()
    }

    /// Wait up to `timeout` for the reader to exit, joining it if it did.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        if !self.signal.wait_exited(timeout) {
            return false;
        }

        if let Some(reader) = lock(&self.reader).take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                error!("Transport reader panicked");
            }
        }
        true
    }
}

impl<C: Channel> Drop for Transporter<C> {
    fn drop(&mut self) {
        self.close();
    }
}

struct ReadLoop<C: Channel> {
    channel: Arc<C>,
    pool: BufferPool,
    codec: EnvelopeCodec,
    handler: Arc<dyn MessageHandler>,
    signal: Arc<LoopSignal>,
    backoff: Duration,
    max_failures: Option<u32>,
}

impl<C: Channel> ReadLoop<C> {
    fn run(self) {
        debug!("Transport reader started");
        let mut failures: u32 = 0;

        while !self.signal.stop_requested() {
            let read = {
                let mut buffer = self.pool.checkout();
                self.channel
                    .read(&mut buffer)
                    .map(|filled| self.codec.decode(&buffer[..filled.min(buffer.len())]))
            };

            match read {
                Ok(envelope) => {
                    failures = 0;
                    self.handler.on_message(envelope.to_text());
                }
                Err(_) if self.signal.stop_requested() => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("{} (failure {failures})", TransportError::Read(e));

                    if self.max_failures.is_some_and(|max| failures >= max) {
                        error!("Giving up after {failures} failed reads");
                        self.handler.on_log("Transport stopped after repeated read failures");
                        self.signal.request_stop();
                        self.channel.close();
                        break;
                    }

                    let started = Instant::now();
                    if self.signal.sleep(self.backoff) {
                        debug!(
                            "Backoff interrupted by close after {}ms",
                            started.elapsed().as_millis()
                        );
                        break;
                    }
                }
            }
        }

        info!("Transport reader stopped");
        self.signal.mark_exited();
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;

    use super::*;
    use crate::testing::ScriptedChannel;

    const WAIT: Duration = Duration::from_secs(2);

    fn options() -> TransportOptions {
        TransportOptions {
            max_envelope_size: 32,
            pool_size: 2,
            read_backoff: Duration::from_secs(5),
            max_read_failures: None,
        }
    }

    fn collecting_handler() -> (Arc<dyn MessageHandler>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = move |message: String| {
            let _ = lock(&tx).send(message);
        };
        (Arc::new(handler), rx)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_reads_are_delivered_as_messages() {
        let channel = ScriptedChannel::new();
        let (handler, messages) = collecting_handler();
        let transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        channel.push_read(b"hello\0");
        channel.push_read(b"world");
        channel.push_read(b"");
        channel.push_read(b"cut\0off");

        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "hello");
        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "world");
        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "");
        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "cut");

        transporter.close();
        assert!(transporter.wait_stopped(WAIT));
    }

    #[test]
    fn test_oversized_read_is_truncated_to_capacity() {
        let channel = ScriptedChannel::new();
        let (handler, messages) = collecting_handler();
        let _transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        channel.push_read(&[b'x'; 40]);

        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "x".repeat(32));
    }

    #[test]
    fn test_read_error_is_retried_after_backoff() {
        let channel = ScriptedChannel::new();
        let (handler, messages) = collecting_handler();
        let opts = TransportOptions {
            read_backoff: Duration::from_millis(20),
            ..options()
        };
        let _transporter = Transporter::spawn(channel.clone(), &opts, handler).unwrap();

        channel.push_read_error();
        channel.push_read(b"after\0");

        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "after");
        assert!(channel.reads_attempted() >= 2);
    }

    #[test]
    fn test_close_interrupts_backoff() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let opts = options();
        let transporter = Transporter::spawn(channel.clone(), &opts, handler).unwrap();

        channel.push_read_error();
        wait_until(|| channel.reads_attempted() >= 1);
        // Let the reader get into its backoff sleep
        thread::sleep(Duration::from_millis(50));

        let closed_at = Instant::now();
        transporter.close();
        assert!(transporter.wait_stopped(opts.read_backoff));
        assert!(closed_at.elapsed() < opts.read_backoff);
        assert!(!transporter.is_reading());
        assert!(channel.is_closed());
        // No further reads were attempted once closed
        assert_eq!(channel.reads_attempted(), 1);
    }

    #[test]
    fn test_reader_gives_up_after_max_failures() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let opts = TransportOptions {
            read_backoff: Duration::from_millis(1),
            max_read_failures: Some(3),
            ..options()
        };
        let transporter = Transporter::spawn(channel.clone(), &opts, handler).unwrap();

        for _ in 0..3 {
            channel.push_read_error();
        }

        assert!(transporter.wait_stopped(WAIT));
        assert!(transporter.is_closed());
        assert!(channel.is_closed());
        assert_eq!(channel.reads_attempted(), 3);
    }

    #[test]
    fn test_send_writes_terminated_envelope() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        transporter.send("hello").unwrap();

        assert_eq!(channel.written(), b"hello\0");
        assert_eq!(channel.write_count(), 1);
    }

    #[test]
    fn test_short_write_fails() {
        let channel = ScriptedChannel::new();
        channel.fail_writes_short();
        let (handler, _messages) = collecting_handler();
        let transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        let result = transporter.send("hello");

        assert!(matches!(
            result,
            Err(TransportError::ShortWrite {
                written: 3,
                expected: 6
            })
        ));
    }

    #[test]
    fn test_unencodable_message_is_not_written() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        let result = transporter.send(&"y".repeat(40));

        assert!(matches!(
            result,
            Err(TransportError::Encode(EncodeError::TooLarge { .. }))
        ));
        assert_eq!(channel.write_count(), 0);
    }

    #[test]
    fn test_send_after_close_fails() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let transporter = Transporter::spawn(channel.clone(), &options(), handler).unwrap();

        transporter.close();

        assert!(matches!(
            transporter.send("late"),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_concurrent_sends_do_not_interleave() {
        let channel = ScriptedChannel::new();
        let (handler, _messages) = collecting_handler();
        let transporter = Arc::new(Transporter::spawn(channel.clone(), &options(), handler).unwrap());

        let senders: Vec<_> = (0..4)
            .map(|sender| {
                let transporter = transporter.clone();
                thread::spawn(move || {
                    for round in 0..10 {
                        let message = format!("sender-{sender}-round-{round}");
                        transporter.send(&message).unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let written = channel.written();
        let mut received: Vec<String> = written
            .split(|byte| *byte == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8(chunk.to_vec()).unwrap())
            .collect();
        received.sort();

        let mut expected: Vec<String> = (0..4)
            .flat_map(|sender| (0..10).map(move |round| format!("sender-{sender}-round-{round}")))
            .collect();
        expected.sort();

        assert_eq!(received, expected);
        assert_eq!(channel.write_count(), 40);
    }
}
