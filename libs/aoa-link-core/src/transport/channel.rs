use std::io;

/// A raw duplex byte channel the transporter runs on top of.
///
/// Reads and writes may be issued from different threads at the same time:
/// one read loop, and whichever thread is sending.
pub trait Channel: Send + Sync + 'static {
    /// Block until one transfer's worth of bytes has arrived, copy it into
    /// `buf` and return how many bytes were filled.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until `buf` has been handed to the peer. Returns the number of
    /// bytes actually transferred.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the channel. Reads and writes in progress, and any issued
    /// afterwards, fail.
    fn close(&self);
}
