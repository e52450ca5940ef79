//! End-to-end transaction submission against a scripted server: sequence
//! assignment, engine-result handling and validation matching.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use common::{hash_hex, mock_transport, pump, MockHandle};
use ledger_link::{
    AccountId, Hash256, LedgerClient, LedgerLinkConfig, SignedTxn, TxSigner, TxnEvent,
};

/// Deterministic stand-in for real serialization: blob and hash derive from
/// the prepared Sequence, so validations can be scripted.
struct FakeSigner;

impl TxSigner for FakeSigner {
    fn sign(&self, tx_json: &Map<String, Value>) -> SignedTxn {
        let seq = tx_json["Sequence"].as_u64().unwrap() as u8;
        let mut bytes = [0u8; 32];
        bytes[31] = seq;
        SignedTxn {
            blob: format!("{seq:02X}"),
            hash: Hash256::from_bytes(bytes),
        }
    }
}

fn alice() -> AccountId {
    AccountId::from("rAlice")
}

/// Connects, primes server fee state, tracks rAlice and primes its root at
/// `sequence`.
async fn primed_client(sequence: u32) -> (LedgerClient, MockHandle) {
    let (transport, server) = mock_transport();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .build();
    client.connect("ws://localhost:6006");
    pump(&client).await;
    server.respond(
        &server.last_request("subscribe"),
        json!({"ledger_index": 100, "fee_base": 10, "fee_ref": 10, "load_base": 256, "load_factor": 256}),
    );
    client.track_account(alice(), Arc::new(FakeSigner));
    pump(&client).await;
    server.respond(
        &server.last_request("ledger_entry"),
        json!({"node": {"Sequence": sequence, "Balance": "1000"}}),
    );
    pump(&client).await;
    (client, server)
}

fn payment() -> Map<String, Value> {
    let Value::Object(map) = json!({"TransactionType": "Payment", "Destination": "rBob"}) else {
        unreachable!()
    };
    map
}

fn event_log() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&TxnEvent) + Send + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let cb = move |event: &TxnEvent| {
        sink.lock().unwrap().push(
            match event {
                TxnEvent::SubmitSuccess { .. } => "submit_success",
                TxnEvent::SubmitError { .. } => "submit_error",
                TxnEvent::SubmitFailure { .. } => "submit_failure",
                TxnEvent::Validated { .. } => "validated",
            }
            .to_owned(),
        );
    };
    (log, cb)
}

fn submit_response(engine_result: &str, sequence: u32) -> Value {
    json!({
        "engine_result": engine_result,
        "tx_json": {"Sequence": sequence},
    })
}

fn validated_txn(ledger_index: u64, sequence: u32) -> Value {
    json!({
        "type": "transaction",
        "validated": true,
        "ledger_index": ledger_index,
        "engine_result": "tesSUCCESS",
        "transaction": {
            "hash": hash_hex(sequence as u8),
            "Account": "rAlice",
            "Sequence": sequence,
        },
    })
}

#[tokio::test]
async fn queued_transactions_get_strictly_increasing_sequences() {
    let (client, server) = primed_client(5).await;
    client.queue_transaction(&alice(), payment(), |_| {});
    client.queue_transaction(&alice(), payment(), |_| {});
    pump(&client).await;

    let submits = server.requests("submit");
    assert_eq!(submits.len(), 2);
    // FakeSigner encodes the sequence into the blob
    assert_eq!(submits[0]["tx_blob"], "05");
    assert_eq!(submits[1]["tx_blob"], "06");
}

#[tokio::test]
async fn submission_waits_for_account_root() {
    let (transport, server) = mock_transport();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .build();
    client.connect("ws://localhost:6006");
    pump(&client).await;
    server.respond(
        &server.last_request("subscribe"),
        json!({"ledger_index": 100, "fee_base": 10, "load_base": 256, "load_factor": 256}),
    );
    client.track_account(alice(), Arc::new(FakeSigner));
    client.queue_transaction(&alice(), payment(), |_| {});
    pump(&client).await;
    assert!(server.requests("submit").is_empty());

    server.respond(
        &server.last_request("ledger_entry"),
        json!({"node": {"Sequence": 9}}),
    );
    pump(&client).await;
    let submits = server.requests("submit");
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0]["tx_blob"], "09");
}

#[tokio::test]
async fn unfunded_account_starts_at_sequence_one() {
    let (transport, server) = mock_transport();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .build();
    client.connect("ws://localhost:6006");
    pump(&client).await;
    server.respond(
        &server.last_request("subscribe"),
        json!({"ledger_index": 100, "fee_base": 10, "load_base": 256, "load_factor": 256}),
    );
    client.track_account(alice(), Arc::new(FakeSigner));
    pump(&client).await;
    server.respond_error(&server.last_request("ledger_entry"), "entryNotFound");
    client.queue_transaction(&alice(), payment(), |_| {});
    pump(&client).await;
    assert_eq!(server.last_request("submit")["tx_blob"], "01");
}

#[tokio::test]
async fn validated_stream_transaction_finalizes_the_submission() {
    let (client, server) = primed_client(5).await;
    let (log, cb) = event_log();
    client.queue_transaction(&alice(), payment(), cb);
    pump(&client).await;

    server.respond(&server.last_request("submit"), submit_response("tesSUCCESS", 5));
    pump(&client).await;
    assert_eq!(*log.lock().unwrap(), vec!["submit_success"]);

    server.inject(validated_txn(101, 5));
    pump(&client).await;
    assert_eq!(*log.lock().unwrap(), vec!["submit_success", "validated"]);
}

#[tokio::test]
async fn past_seq_resubmits_only_after_validated_sequence_observed() {
    let (client, server) = primed_client(5).await;
    let (log, cb) = event_log();
    client.queue_transaction(&alice(), payment(), cb);
    pump(&client).await;

    // another wallet consumed sequence 5 on the server
    server.respond(&server.last_request("submit"), submit_response("tefPAST_SEQ", 5));
    pump(&client).await;
    // no blind resubmission: the consumed sequence has not been observed
    // validated yet
    assert_eq!(server.requests("submit").len(), 1);
    assert!(log.lock().unwrap().is_empty());

    // a foreign validated transaction with sequence 5 arrives (different
    // hash than ours)
    server.inject(json!({
        "type": "transaction",
        "validated": true,
        "ledger_index": 101,
        "engine_result": "tesSUCCESS",
        "transaction": {
            "hash": hash_hex(0xEE),
            "Account": "rAlice",
            "Sequence": 5,
        },
    }));
    pump(&client).await;

    let submits = server.requests("submit");
    assert_eq!(submits.len(), 2);
    // resubmitted under the next free sequence
    assert_eq!(submits[1]["tx_blob"], "06");
}

#[tokio::test]
async fn ter_pre_seq_waits_for_sequence_to_be_reached() {
    let (client, server) = primed_client(5).await;
    client.queue_transaction(&alice(), payment(), |_| {});
    client.queue_transaction(&alice(), payment(), |_| {});
    pump(&client).await;
    let submits = server.requests("submit");
    assert_eq!(submits.len(), 2);

    // the second submission (seq 6) raced ahead of the first
    server.respond(&submits[1], submit_response("terPRE_SEQ", 6));
    pump(&client).await;
    assert_eq!(server.requests("submit").len(), 2);

    // first transaction validates: validated-sequence progress reaches 6
    server.inject(validated_txn(101, 5));
    pump(&client).await;
    let submits = server.requests("submit");
    assert_eq!(submits.len(), 3);
    assert_eq!(submits[2]["tx_blob"], "06");
}

#[tokio::test]
async fn engine_failure_reports_after_expiry() {
    let (client, server) = primed_client(5).await;
    let (log, cb) = event_log();
    client.queue_transaction(&alice(), payment(), cb);
    pump(&client).await;

    server.respond(
        &server.last_request("submit"),
        submit_response("temBAD_AMOUNT", 5),
    );
    pump(&client).await;
    assert!(log.lock().unwrap().is_empty());

    // close a ledger beyond the submission horizon plus safety margin
    server.inject(json!({"type": "ledgerClosed", "ledger_index": 115, "txn_count": 0}));
    pump(&client).await;
    assert_eq!(*log.lock().unwrap(), vec!["submit_failure"]);
}

#[tokio::test]
async fn late_validation_of_a_failed_transaction_still_wins() {
    let (client, server) = primed_client(5).await;
    let (log, cb) = event_log();
    client.queue_transaction(&alice(), payment(), cb);
    pump(&client).await;

    server.respond(
        &server.last_request("submit"),
        submit_response("tecPATH_DRY", 5),
    );
    pump(&client).await;

    // validated before the horizon expired: Validated is the outcome,
    // no failure report
    server.inject(validated_txn(102, 5));
    server.inject(json!({"type": "ledgerClosed", "ledger_index": 115, "txn_count": 0}));
    pump(&client).await;
    assert_eq!(*log.lock().unwrap(), vec!["validated"]);
}
