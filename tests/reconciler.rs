//! Pending-ledger reconciliation driven through the full client: header
//! verification fast path, fill-in of missed transactions, and gap backfill.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use common::{hash_hex, mock_transport, pump, MockHandle};
use ledger_link::{LedgerClient, LedgerLinkConfig};

async fn reconciling_client() -> (LedgerClient, MockHandle) {
    let (transport, server) = mock_transport();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .build();
    client.install_ledger_reconciler();
    client.connect("ws://localhost:6006");
    pump(&client).await;
    (client, server)
}

fn ledger_closed(ledger_index: u64, txn_count: u32) -> Value {
    json!({"type": "ledgerClosed", "ledger_index": ledger_index, "txn_count": txn_count})
}

fn stream_txn(ledger_index: u64, hash: &str) -> Value {
    json!({
        "type": "transaction",
        "validated": true,
        "ledger_index": ledger_index,
        "transaction": {"hash": hash},
    })
}

/// Finds the fetch for `ledger_index`, if any, distinguishing header checks
/// (`expand: false`) from fill-ins.
fn ledger_fetches(server: &MockHandle, ledger_index: u64, expanded: bool) -> Vec<Value> {
    server
        .requests("ledger")
        .into_iter()
        .filter(|f| f["ledger_index"] == ledger_index && f["expand"] == expanded)
        .collect()
}

#[tokio::test]
async fn reconciler_subscribes_to_transactions_stream() {
    let (_client, server) = reconciling_client().await;
    let sub = server.last_request("subscribe");
    assert_eq!(sub["streams"], json!(["server", "ledger", "transactions"]));
}

#[tokio::test]
async fn complete_ledger_clears_via_header_check() {
    let (client, server) = reconciling_client().await;
    // ledger 100 closes announcing one transaction, which arrives
    server.inject(ledger_closed(100, 1));
    server.inject(stream_txn(100, &hash_hex(1)));
    pump(&client).await;
    // the count is complete: a header check goes out immediately
    let checks = ledger_fetches(&server, 100, false);
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0]["transactions"], false);

    // digest of a single hash is that hash
    server.respond(
        &checks[0],
        json!({"ledger": {"ledger_index": 100, "transaction_hash": hash_hex(1)}}),
    );
    pump(&client).await;
    // cleared: the next close does not re-fetch 100
    server.inject(ledger_closed(101, 0));
    pump(&client).await;
    assert_eq!(ledger_fetches(&server, 100, false).len(), 1);
}

#[tokio::test]
async fn missed_transaction_is_filled_in_and_delivered() {
    let (transport, server) = mock_transport();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .on_validated_transaction(move |tr| sink.lock().unwrap().push(tr.hash.to_string()))
        .build();
    client.install_ledger_reconciler();
    client.connect("ws://localhost:6006");
    pump(&client).await;

    // ledger 101 announces one transaction but the stream never delivers it
    server.inject(ledger_closed(101, 1));
    server.inject(ledger_closed(102, 0));
    pump(&client).await;
    let checks = ledger_fetches(&server, 101, false);
    assert_eq!(checks.len(), 1);

    // header digest differs from our (empty) accumulated set: fill-in
    server.respond(
        &checks[0],
        json!({"ledger": {"ledger_index": 101, "transaction_hash": hash_hex(7)}}),
    );
    pump(&client).await;
    let fills = ledger_fetches(&server, 101, true);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0]["transactions"], true);

    server.respond(
        &fills[0],
        json!({
            "ledger": {
                "ledger_index": 101,
                "transaction_hash": hash_hex(7),
                "transactions": [{"hash": hash_hex(7), "Account": "rCarol", "Sequence": 3}],
            }
        }),
    );
    pump(&client).await;
    assert_eq!(*delivered.lock().unwrap(), vec![hash_hex(7)]);
}

#[tokio::test]
async fn duplicate_stream_transactions_are_delivered_once() {
    let (transport, server) = mock_transport();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .on_validated_transaction(move |tr| sink.lock().unwrap().push(tr.hash.to_string()))
        .build();
    client.install_ledger_reconciler();
    client.connect("ws://localhost:6006");
    pump(&client).await;

    server.inject(ledger_closed(100, 2));
    server.inject(stream_txn(100, &hash_hex(1)));
    server.inject(stream_txn(100, &hash_hex(1)));
    pump(&client).await;
    assert_eq!(*delivered.lock().unwrap(), vec![hash_hex(1)]);
}

#[tokio::test]
async fn one_fetch_in_flight_per_close() {
    let (client, server) = reconciling_client().await;
    // two stalled ledgers accumulate
    server.inject(ledger_closed(100, 1));
    server.inject(ledger_closed(101, 1));
    pump(&client).await;
    // only 100 is checked; 101 waits while 100's fetch is outstanding
    assert_eq!(ledger_fetches(&server, 100, false).len(), 1);
    assert!(ledger_fetches(&server, 101, false).is_empty());
    server.inject(ledger_closed(102, 0));
    pump(&client).await;
    assert!(ledger_fetches(&server, 101, false).is_empty());
}

#[tokio::test]
async fn fill_in_mismatch_surfaces_an_error_and_parks_the_ledger() {
    let (transport, server) = mock_transport();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let client = LedgerClient::builder()
        .config(LedgerLinkConfig::for_testing())
        .transport(transport)
        .on_error(move |e| sink.lock().unwrap().push(e.clone()))
        .build();
    client.install_ledger_reconciler();
    client.connect("ws://localhost:6006");
    pump(&client).await;

    server.inject(ledger_closed(101, 1));
    server.inject(ledger_closed(102, 0));
    pump(&client).await;
    let check = ledger_fetches(&server, 101, false).remove(0);
    server.respond(
        &check,
        json!({"ledger": {"ledger_index": 101, "transaction_hash": hash_hex(7)}}),
    );
    pump(&client).await;
    let fill = ledger_fetches(&server, 101, true).remove(0);
    // expanded fetch disagrees with its own header
    server.respond(
        &fill,
        json!({
            "ledger": {
                "ledger_index": 101,
                "transaction_hash": hash_hex(7),
                "transactions": [{"hash": hash_hex(9)}],
            }
        }),
    );
    pump(&client).await;

    // the inconsistent ledger is parked: later closes never refetch it
    server.inject(ledger_closed(103, 0));
    server.inject(ledger_closed(104, 0));
    pump(&client).await;
    assert_eq!(ledger_fetches(&server, 101, false).len(), 1);
    assert_eq!(ledger_fetches(&server, 101, true).len(), 1);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("101"), "unexpected error: {}", errors[0]);
}
