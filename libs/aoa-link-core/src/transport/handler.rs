use futures::channel::mpsc;

/// Receives what comes up from the link.
///
/// Messages are delivered on the transport's reader thread, never on the
/// thread that created the transport.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: String);

    /// Diagnostic narration of what the link is doing. Optional.
    fn on_log(&self, _line: &str) {}
}

impl<F> MessageHandler for F
where
    F: Fn(String) + Send + Sync,
{
    fn on_message(&self, message: String) {
        self(message)
    }
}

pub type MessageStream = mpsc::UnboundedReceiver<String>;

/// Forwards every message into an unbounded channel so it can be consumed
/// as a [`futures::Stream`].
#[derive(Debug, Clone)]
pub struct StreamHandler {
    tx: mpsc::UnboundedSender<String>,
}

impl MessageHandler for StreamHandler {
    fn on_message(&self, message: String) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.unbounded_send(message);
    }
}

pub fn message_channel() -> (StreamHandler, MessageStream) {
    let (tx, rx) = mpsc::unbounded();
    (StreamHandler { tx }, rx)
}
