use std::sync::mpsc::Sender;

/// Severity of a [`ProgressMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Verbose,
    Warning,
}

/// One line of operator-facing progress, published per archive entry.
#[derive(Clone, Debug)]
pub struct ProgressMessage {
    pub kind: MessageKind,
    pub text: String,
}

/// Handle the archive and extract loops publish progress through.
///
/// The consumer end is owned by the caller and runs concurrently; messages
/// for entry `i` are sent before any message for entry `i+1`. Without a
/// consumer, publishing is a no-op, and a consumer that has hung up is
/// treated the same way.
#[derive(Default)]
pub struct Progress {
    sender: Option<Sender<ProgressMessage>>,
}

impl Progress {
    pub fn new(sender: Sender<ProgressMessage>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// A `Progress` that drops everything published to it.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn verbose(&self, text: String) {
        self.send(MessageKind::Verbose, text);
    }

    pub fn warning(&self, text: String) {
        self.send(MessageKind::Warning, text);
    }

    fn send(&self, kind: MessageKind, text: String) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(ProgressMessage { kind, text });
        }
    }
}
