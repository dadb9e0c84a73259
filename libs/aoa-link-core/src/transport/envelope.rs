use thiserror::Error;

/// Largest envelope the transport reads in one go.
pub const MAX_ENVELOPE_SIZE: usize = 16384;

/// Byte that ends an envelope on the wire.
pub const ENVELOPE_TERMINATOR: u8 = 0;

/// One message cut out of a read buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    bytes: Vec<u8>,
}

impl Envelope {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The envelope as text. Invalid UTF-8 sequences are replaced rather
    /// than dropping the whole message.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Message contains a NUL byte at offset {offset}")]
    InteriorNul { offset: usize },
    #[error("Encoded message is {size} bytes but envelopes hold at most {capacity}")]
    TooLarge { size: usize, capacity: usize },
}

/// Cuts envelopes out of read buffers and builds outgoing ones.
///
/// An envelope runs from the start of the buffer to the first zero byte,
/// or to the end of the filled region if there is none. Nothing carries
/// over between reads, so a message longer than the capacity is truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCodec {
    capacity: usize,
}

impl EnvelopeCodec {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cut the envelope out of the filled part of a read buffer.
    pub fn decode(&self, filled: &[u8]) -> Envelope {
        let filled = &filled[..filled.len().min(self.capacity)];
        let end = filled
            .iter()
            .position(|byte| *byte == ENVELOPE_TERMINATOR)
            .unwrap_or(filled.len());
        Envelope {
            bytes: filled[..end].to_vec(),
        }
    }

    /// Append the wire form of `message` to `out`: the bytes followed by
    /// the terminator. Messages the peer could not decode intact are
    /// refused and `out` is left untouched.
    pub fn encode_into(&self, message: &[u8], out: &mut Vec<u8>) -> Result<(), EncodeError> {
        if let Some(offset) = message
            .iter()
            .position(|byte| *byte == ENVELOPE_TERMINATOR)
        {
            return Err(EncodeError::InteriorNul { offset });
        }

        let size = message.len() + 1;
        if size > self.capacity {
            return Err(EncodeError::TooLarge {
                size,
                capacity: self.capacity,
            });
        }

        out.reserve(size);
        out.extend_from_slice(message);
        out.push(ENVELOPE_TERMINATOR);
        Ok(())
    }

    pub fn encode(&self, message: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.encode_into(message, &mut out)?;
        Ok(out)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_ENVELOPE_SIZE)
    }
}
