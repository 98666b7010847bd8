//! Output relay
//!
//! Fans incremental script output out to whichever listeners are attached at
//! the moment a chunk arrives. Nothing is replayed for late subscribers; a UI
//! that needs history keeps its own scrollback.

use parking_lot::RwLock;
use serde::Serialize;

/// One piece of script output, in arrival order for its stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub script_id: String,
    pub text: String,
}

struct Listener {
    /// None = every script
    script_id: Option<String>,
    tx: async_channel::Sender<OutputChunk>,
}

/// Multi-listener push channel for script output
#[derive(Default)]
pub struct OutputRelay {
    listeners: RwLock<Vec<Listener>>,
}

impl OutputRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive output of every script
    pub fn subscribe(&self) -> async_channel::Receiver<OutputChunk> {
        self.add_listener(None)
    }

    /// Receive output of one script id only
    pub fn subscribe_script(&self, script_id: &str) -> async_channel::Receiver<OutputChunk> {
        self.add_listener(Some(script_id.to_string()))
    }

    fn add_listener(&self, script_id: Option<String>) -> async_channel::Receiver<OutputChunk> {
        // Unbounded so a slow consumer never blocks the pipe reader threads
        let (tx, rx) = async_channel::unbounded();
        self.listeners.write().push(Listener { script_id, tx });
        rx
    }

    /// Deliver `text` to the listeners currently attached for `script_id`.
    ///
    /// Fire-and-forget: listeners whose receiver was dropped are pruned.
    pub fn emit(&self, script_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }

        let mut saw_closed = false;
        {
            let listeners = self.listeners.read();
            for listener in listeners.iter() {
                if listener
                    .script_id
                    .as_deref()
                    .is_some_and(|id| id != script_id)
                {
                    continue;
                }
                let chunk = OutputChunk {
                    script_id: script_id.to_string(),
                    text: text.to_string(),
                };
                if listener.tx.try_send(chunk).is_err() {
                    saw_closed = true;
                }
            }
        }

        if saw_closed {
            self.listeners.write().retain(|l| !l.tx.is_closed());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Incremental UTF-8 decoder for pipe reads.
///
/// A multi-byte character split across two reads is held back until its
/// remaining bytes arrive; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus held-back bytes) as is complete
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;

        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    if let Ok(prefix) = std::str::from_utf8(&self.pending[start..valid_end]) {
                        out.push_str(prefix);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + bad;
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush whatever is left when the stream closes
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
