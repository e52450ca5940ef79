//! Typed listener slots.
//!
//! Each client event is its own [`Listeners`] value with its own payload
//! type; registration hands back a [`ListenerToken`] for deterministic
//! removal. One-shot listeners are consumed by their first emit.

use serde_json::Value;

use crate::server_info::ServerInfo;
use crate::wire::TransactionResult;

/// Removal handle for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

enum Callback<T> {
    Each(Box<dyn FnMut(&T) + Send>),
    Once(Option<Box<dyn FnOnce(&T) + Send>>),
}

struct Entry<T> {
    id: u64,
    cb: Callback<T>,
}

/// An ordered set of callbacks for one event type.
pub struct Listeners<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T> Listeners<T> {
    /// Registers a listener invoked on every emit until removed.
    pub fn on(&mut self, cb: impl FnMut(&T) + Send + 'static) -> ListenerToken {
        self.push(Callback::Each(Box::new(cb)))
    }

    /// Registers a listener invoked on the next emit only.
    pub fn once(&mut self, cb: impl FnOnce(&T) + Send + 'static) -> ListenerToken {
        self.push(Callback::Once(Some(Box::new(cb))))
    }

    fn push(&mut self, cb: Callback<T>) -> ListenerToken {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { id, cb });
        ListenerToken(id)
    }

    /// Removes a listener. Returns whether it was still registered.
    pub fn remove(&mut self, token: ListenerToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != token.0);
        self.entries.len() != before
    }

    /// Invokes all listeners in registration order, dropping one-shots.
    pub fn emit(&mut self, value: &T) {
        for entry in &mut self.entries {
            match &mut entry.cb {
                Callback::Each(f) => f(value),
                Callback::Once(slot) => {
                    if let Some(f) = slot.take() {
                        f(value);
                    }
                }
            }
        }
        self.entries.retain(|e| !matches!(e.cb, Callback::Once(None)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The client's fixed event set. Listeners run on the client loop and must
/// not block; they get shared references to loop-owned snapshots.
#[derive(Default)]
pub struct ClientEvents {
    /// Transport established, handshake done.
    pub connected: Listeners<()>,
    /// Transport gone (manual or not).
    pub disconnected: Listeners<()>,
    /// Combined subscription acknowledged after (re)connect.
    pub subscribed: Listeners<ServerInfo>,
    /// A ledger closed; payload is the updated server projection.
    pub ledger_closed: Listeners<ServerInfo>,
    /// A transaction reported validated (stream or fill-in).
    pub validated_transaction: Listeners<TransactionResult>,
    /// Fired after every processed message; cheap state-change hook.
    pub state_change: Listeners<()>,
    /// Raw incoming message, post-parse.
    pub message: Listeners<Value>,
    /// Outgoing request payload, pre-send.
    pub send_message: Listeners<Value>,
    /// path_find stream message.
    pub path_find: Listeners<Value>,
    /// validationReceived stream message.
    pub validation_received: Listeners<Value>,
    /// Transport or server-pushed error.
    pub error: Listeners<String>,
}
