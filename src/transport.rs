//! Transport boundary.
//!
//! The client consumes any [`Transport`]; events flow back through a
//! [`TransportSink`], which marshals them onto the client loop. Transport
//! implementations may call sink methods from any task.

use crate::client::ClientState;
use crate::error::Result;
use crate::task_loop::LoopHandle;

pub mod ws;

/// Pushes transport events onto the client loop.
#[derive(Clone)]
pub struct TransportSink {
    handle: LoopHandle<ClientState>,
}

impl TransportSink {
    pub(crate) fn new(handle: LoopHandle<ClientState>) -> Self {
        TransportSink { handle }
    }

    /// A connection attempt started.
    pub fn connecting(&self) {
        self.handle.run(|state, handle| state.on_transport_connecting(handle));
    }

    /// The connection is up and ready for traffic.
    pub fn connected(&self) {
        self.handle.run(|state, handle| state.on_transport_connected(handle));
    }

    /// The connection is gone, for any reason.
    pub fn disconnected(&self) {
        self.handle.run(|state, handle| state.on_transport_disconnected(handle));
    }

    /// A transport-level fault that did not necessarily end the connection.
    pub fn error(&self, message: String) {
        self.handle
            .run(move |state, handle| state.on_transport_error(handle, message));
    }

    /// One complete text frame from the server.
    pub fn message(&self, text: String) {
        self.handle
            .run(move |state, handle| state.on_transport_message(handle, text));
    }
}

/// A message-oriented transport carrying one connection at a time.
pub trait Transport: Send + 'static {
    /// Called once before any other method; gives the transport its event
    /// sink.
    fn attach(&mut self, sink: TransportSink);

    /// Starts a connection attempt. Non-blocking; completion is reported
    /// through the sink. After a fatal error the sink must still observe a
    /// `disconnected` event.
    fn connect(&mut self, uri: &str) -> Result<()>;

    /// Tears down the current connection, if any. Idempotent. No sink
    /// events are emitted for a manual teardown.
    fn disconnect(&mut self);

    /// Writes one text frame. Errors are synchronous send failures only;
    /// asynchronous loss surfaces as a `disconnected` sink event.
    fn send(&mut self, text: String) -> Result<()>;
}
