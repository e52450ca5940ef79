//! Scripted in-process transport for driving a client without a server.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use ledger_link::{LedgerClient, LedgerLinkError, Transport, TransportSink};

struct MockShared {
    sink: Mutex<Option<TransportSink>>,
    sent: Mutex<Vec<Value>>,
    connects: Mutex<u32>,
    fail_sends: Mutex<u32>,
}

/// The transport half, handed to the client builder.
pub struct MockTransport(Arc<MockShared>);

/// The test half: inspects sent frames and injects server messages.
#[derive(Clone)]
pub struct MockHandle(Arc<MockShared>);

pub fn mock_transport() -> (MockTransport, MockHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let shared = Arc::new(MockShared {
        sink: Mutex::new(None),
        sent: Mutex::new(Vec::new()),
        connects: Mutex::new(0),
        fail_sends: Mutex::new(0),
    });
    (MockTransport(shared.clone()), MockHandle(shared))
}

impl Transport for MockTransport {
    fn attach(&mut self, sink: TransportSink) {
        *self.0.sink.lock().unwrap() = Some(sink);
    }

    fn connect(&mut self, _uri: &str) -> ledger_link::Result<()> {
        *self.0.connects.lock().unwrap() += 1;
        let sink = self.0.sink.lock().unwrap().clone().unwrap();
        sink.connecting();
        sink.connected();
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn send(&mut self, text: String) -> ledger_link::Result<()> {
        {
            let mut fail = self.0.fail_sends.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(LedgerLinkError::Transport("scripted send failure".into()));
            }
        }
        let frame: Value = serde_json::from_str(&text).unwrap();
        self.0.sent.lock().unwrap().push(frame);
        Ok(())
    }
}

impl MockHandle {
    pub fn sent(&self) -> Vec<Value> {
        self.0.sent.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u32 {
        *self.0.connects.lock().unwrap()
    }

    pub fn requests(&self, command: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|f| f["command"] == command)
            .collect()
    }

    pub fn last_request(&self, command: &str) -> Value {
        self.requests(command)
            .pop()
            .unwrap_or_else(|| panic!("no {command} request was sent"))
    }

    pub fn inject(&self, msg: Value) {
        let sink = self.0.sink.lock().unwrap().clone().unwrap();
        sink.message(msg.to_string());
    }

    pub fn respond(&self, request: &Value, result: Value) {
        self.inject(json!({
            "type": "response",
            "id": request["id"],
            "status": "success",
            "result": result,
        }));
    }

    pub fn respond_error(&self, request: &Value, code: &str) {
        self.inject(json!({
            "type": "response",
            "id": request["id"],
            "status": "error",
            "error": code,
            "error_message": code,
        }));
    }

    /// Makes the next `n` sends fail as if the socket had just broken.
    pub fn fail_next_sends(&self, n: u32) {
        *self.0.fail_sends.lock().unwrap() = n;
    }

    /// Simulates the server dropping the connection.
    pub fn drop_connection(&self) {
        let sink = self.0.sink.lock().unwrap().clone().unwrap();
        sink.disconnected();
    }
}

/// Settles repeatedly so tasks enqueued by tasks (transport events, managed
/// continuations) all run before the test inspects state.
pub async fn pump(client: &LedgerClient) {
    for _ in 0..6 {
        client.settle().await.expect("client loop alive");
    }
}

pub fn hash_hex(n: u8) -> String {
    format!("{:062}{:02X}", 0, n)
}
