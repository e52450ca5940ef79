//! The client: public handle, loop-owned state, connection controller,
//! request table, managed-request driver, and message routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::account::TxSigner;
use crate::config::LedgerLinkConfig;
use crate::error::{LedgerLinkError, Result};
use crate::events::ClientEvents;
use crate::ledgers::{HeaderOutcome, PendingLedgers};
use crate::managed::{FnManager, ManagedOutcome, RequestBuilder, RequestManager};
use crate::request::{
    PendingRequest, Request, RequestCallback, RequestOutcome, Response, RpcError,
};
use crate::server_info::ServerInfo;
use crate::subscriptions::{Stream, Subscriptions};
use crate::task_loop::{LoopHandle, TaskLoop};
use crate::transactions::{TransactionManager, TxnEvent, TxnId};
use crate::transport::{ws::WsTransport, Transport, TransportSink};
use crate::wire::{self, AccountId, LedgerHeader, MessageType, TransactionResult};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection, request and server state shared by all components.
pub(crate) struct Core {
    pub(crate) config: LedgerLinkConfig,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) conn: ConnState,
    pub(crate) manually_disconnected: bool,
    reconnecting: bool,
    /// Bumped on every successful connect; requests carrying affinity to an
    /// older generation are discarded instead of sent.
    pub(crate) generation: u64,
    previous_uri: Option<String>,
    last_traffic: Option<Instant>,
    pub(crate) server_info: ServerInfo,
    pub(crate) subscriptions: Subscriptions,
    requests: HashMap<u64, PendingRequest>,
    next_request_id: u64,
    /// Requests accepted while disconnected, flushed on connect.
    unsent: Vec<u64>,
    pub(crate) events: ClientEvents,
    connected_flag: Arc<AtomicBool>,
}

impl Core {
    pub(crate) fn is_connected(&self) -> bool {
        self.conn == ConnState::Connected
    }

    /// A fresh request with the next id; ids are unique for the client's
    /// lifetime.
    pub(crate) fn next_request(&mut self, command: &str) -> Request {
        self.next_request_id += 1;
        Request::new(self.next_request_id, command)
    }

    /// Registers the request in the table and sends it now or when the
    /// connection comes (back) up.
    pub(crate) fn send_request(
        &mut self,
        req: Request,
        retry_on_disconnect: bool,
        affinity: Option<u64>,
        callback: RequestCallback,
    ) {
        let id = req.id;
        let entry = PendingRequest {
            command: req.command.clone(),
            wire: req.to_wire(),
            sent_at: None,
            affinity,
            retry_on_disconnect,
            callback,
        };
        self.requests.insert(id, entry);
        if self.is_connected() {
            self.try_send(id);
        } else {
            self.unsent.push(id);
        }
    }

    fn try_send(&mut self, id: u64) {
        let wire = {
            let Some(entry) = self.requests.get(&id) else {
                return;
            };
            if let Some(generation) = entry.affinity {
                if generation != self.generation {
                    log::debug!(
                        "[ledger-link] dropping request {id} ({}): stale connection affinity",
                        entry.command
                    );
                    self.requests.remove(&id);
                    return;
                }
            }
            entry.wire.clone()
        };
        self.events.send_message.emit(&wire);
        match self.transport.send(wire.to_string()) {
            Ok(()) => {
                if let Some(entry) = self.requests.get_mut(&id) {
                    entry.sent_at = Some(Instant::now());
                }
            }
            Err(e) => {
                // Send it once the connection is back.
                log::warn!("[ledger-link] send failed, queueing request {id}: {e}");
                self.unsent.push(id);
            }
        }
    }

    fn flush_unsent(&mut self) {
        let pending: Vec<u64> = std::mem::take(&mut self.unsent);
        for id in pending {
            if self.requests.contains_key(&id) {
                self.try_send(id);
            }
        }
    }
}

/// Everything the client loop owns.
pub(crate) struct ClientState {
    pub(crate) core: Core,
    pub(crate) accounts: HashMap<AccountId, TransactionManager>,
    pub(crate) reconciler: Option<PendingLedgers>,
}

impl ClientState {
    // ---- connection controller -------------------------------------------

    pub(crate) fn do_connect(
        &mut self,
        handle: &LoopHandle<ClientState>,
        uri: &str,
    ) -> Result<()> {
        if self.core.is_connected() {
            return Err(LedgerLinkError::AlreadyConnected);
        }
        self.core.manually_disconnected = false;
        self.core.previous_uri = Some(uri.to_owned());
        self.core.conn = ConnState::Connecting;
        let _ = handle;
        if let Err(e) = self.core.transport.connect(uri) {
            self.core.conn = ConnState::Disconnected;
            self.core.events.error.emit(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn do_disconnect(&mut self, handle: &LoopHandle<ClientState>) {
        self.core.manually_disconnected = true;
        self.core.transport.disconnect();
        self.on_transport_disconnected(handle);
    }

    pub(crate) fn do_reconnect(&mut self, handle: &LoopHandle<ClientState>) {
        if self.core.reconnecting {
            return;
        }
        let uri = self.core.previous_uri.clone();
        self.do_disconnect(handle);
        self.core.manually_disconnected = false;
        if let Some(uri) = uri {
            if let Err(e) = self.do_connect(handle, &uri) {
                log::warn!("[ledger-link] reconnect failed: {e}");
            }
        }
    }

    fn maybe_schedule_reconnect(&mut self, handle: &LoopHandle<ClientState>) {
        if self.core.manually_disconnected || self.core.reconnecting {
            return;
        }
        self.core.reconnecting = true;
        let delay = self.core.config.reconnect_delay;
        handle.schedule(delay, |state, handle| {
            state.core.reconnecting = false;
            if state.core.manually_disconnected || state.core.conn != ConnState::Disconnected {
                return;
            }
            if let Some(uri) = state.core.previous_uri.clone() {
                log::info!("[ledger-link] reconnecting to {uri}");
                if let Err(e) = state.do_connect(handle, &uri) {
                    log::warn!("[ledger-link] reconnect failed: {e}");
                    state.maybe_schedule_reconnect(handle);
                }
            }
        });
    }

    /// Self-perpetuating heartbeat: request timeout sweep plus dormancy
    /// detection. Reschedules itself first so a fault in one tick never
    /// stops the heartbeat.
    pub(crate) fn maintenance(&mut self, handle: &LoopHandle<ClientState>) {
        let interval = self.core.config.maintenance_interval;
        handle.schedule(interval, |state, handle| state.maintenance(handle));

        self.sweep_timeouts(handle);

        if self.core.is_connected() && !self.core.manually_disconnected {
            let dormant = self
                .core
                .last_traffic
                .map_or(false, |t| t.elapsed() >= self.core.config.dormancy_threshold);
            if dormant {
                log::warn!("[ledger-link] connection dormant, forcing reconnect");
                self.do_reconnect(handle);
            }
        }
    }

    fn sweep_timeouts(&mut self, handle: &LoopHandle<ClientState>) {
        let timeout = self.core.config.request_timeout;
        let expired: Vec<u64> = self
            .core
            .requests
            .iter()
            .filter(|(_, e)| e.sent_at.map_or(false, |t| t.elapsed() >= timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.core.requests.remove(&id) {
                log::warn!("[ledger-link] request {id} ({}) timed out", entry.command);
                (entry.callback)(self, handle, RequestOutcome::Timeout);
            }
        }
    }

    // ---- transport events ------------------------------------------------

    pub(crate) fn on_transport_connecting(&mut self, _handle: &LoopHandle<ClientState>) {
        self.core.conn = ConnState::Connecting;
        log::debug!("[ledger-link] connecting");
    }

    pub(crate) fn on_transport_connected(&mut self, handle: &LoopHandle<ClientState>) {
        self.core.conn = ConnState::Connected;
        self.core.generation += 1;
        self.core.connected_flag.store(true, Ordering::SeqCst);
        self.core.last_traffic = Some(Instant::now());
        log::info!(
            "[ledger-link] connected (generation {})",
            self.core.generation
        );
        self.core.events.connected.emit(&());
        self.issue_combined_subscription();
        self.core.flush_unsent();
        self.after_message(handle);
    }

    pub(crate) fn on_transport_disconnected(&mut self, handle: &LoopHandle<ClientState>) {
        if self.core.conn == ConnState::Disconnected {
            return;
        }
        self.core.conn = ConnState::Disconnected;
        self.core.connected_flag.store(false, Ordering::SeqCst);
        log::warn!("[ledger-link] disconnected");
        self.core.events.disconnected.emit(&());

        // Managed requests learn about the drop immediately; plain requests
        // are left to time out.
        let opted_in: Vec<u64> = self
            .core
            .requests
            .iter()
            .filter(|(_, e)| e.retry_on_disconnect)
            .map(|(id, _)| *id)
            .collect();
        for id in opted_in {
            if let Some(entry) = self.core.requests.remove(&id) {
                (entry.callback)(self, handle, RequestOutcome::Disconnected);
            }
        }

        self.maybe_schedule_reconnect(handle);
        self.after_message(handle);
    }

    pub(crate) fn on_transport_error(&mut self, _handle: &LoopHandle<ClientState>, message: String) {
        log::warn!("[ledger-link] transport error: {message}");
        self.core.events.error.emit(&message);
    }

    pub(crate) fn on_transport_message(&mut self, handle: &LoopHandle<ClientState>, text: String) {
        self.core.last_traffic = Some(Instant::now());
        let msg: Value = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("[ledger-link] unparseable message: {e}");
                return;
            }
        };
        self.core.events.message.emit(&msg);
        match wire::classify(&msg) {
            MessageType::ServerStatus => self.core.server_info.update(&msg),
            MessageType::LedgerClosed => self.handle_ledger_closed(handle, &msg),
            MessageType::Response => self.handle_response(handle, &msg),
            MessageType::Transaction => self.handle_transaction(handle, &msg),
            MessageType::PathFind => self.core.events.path_find.emit(&msg),
            MessageType::ValidationReceived => self.core.events.validation_received.emit(&msg),
            MessageType::Error => {
                log::warn!("[ledger-link] server error message: {msg}");
                self.core.events.error.emit(&msg.to_string());
            }
            MessageType::Unknown(t) => {
                log::debug!("[ledger-link] ignoring message type {t:?}");
            }
        }
        self.after_message(handle);
    }

    /// Runs after every processed message: the generic state-change hook
    /// plus the per-account deferred-submission dispatchers.
    fn after_message(&mut self, handle: &LoopHandle<ClientState>) {
        self.core.events.state_change.emit(&());
        let ClientState { core, accounts, .. } = self;
        for manager in accounts.values_mut() {
            manager.on_state_change(core, handle);
        }
    }

    // ---- message routing -------------------------------------------------

    fn handle_ledger_closed(&mut self, handle: &LoopHandle<ClientState>, msg: &Value) {
        self.core.server_info.update(msg);
        let info = self.core.server_info.clone();
        self.core.events.ledger_closed.emit(&info);
        {
            let ClientState { core, accounts, .. } = self;
            for manager in accounts.values_mut() {
                manager.on_ledger_closed(core, handle, info.ledger_index);
            }
        }
        self.reconciler_on_ledger_closed(handle, info.ledger_index, info.txn_count);
    }

    fn handle_response(&mut self, handle: &LoopHandle<ClientState>, msg: &Value) {
        let Some(resp) = Response::from_wire(msg) else {
            log::warn!("[ledger-link] response without id");
            return;
        };
        let Some(entry) = self.core.requests.remove(&resp.id) else {
            // Timed out, superseded by a reconnect, or never ours.
            log::debug!("[ledger-link] response for unknown request {}", resp.id);
            return;
        };
        (entry.callback)(self, handle, RequestOutcome::Response(resp));
    }

    fn handle_transaction(&mut self, handle: &LoopHandle<ClientState>, msg: &Value) {
        let Some(tr) = TransactionResult::from_stream(msg) else {
            log::warn!("[ledger-link] malformed transaction message");
            return;
        };
        if !tr.validated {
            return;
        }
        if let Some(reconciler) = self.reconciler.as_mut() {
            let outcome = reconciler.ingest(&tr);
            if outcome.deliver {
                self.deliver_validated(handle, &tr);
            }
            if let Some(ledger_index) = outcome.check_header {
                self.reconciler_fetch_header(handle, ledger_index);
            }
        } else {
            self.deliver_validated(handle, &tr);
        }
    }

    fn deliver_validated(&mut self, handle: &LoopHandle<ClientState>, tr: &TransactionResult) {
        {
            let ClientState { core, accounts, .. } = self;
            if let Some(account) = tr.account.as_ref() {
                if let Some(manager) = accounts.get_mut(account) {
                    manager.notify_transaction_result(core, handle, tr);
                }
            }
        }
        self.core.events.validated_transaction.emit(tr);
    }

    // ---- subscriptions ---------------------------------------------------

    fn issue_combined_subscription(&mut self) {
        let payload = self.core.subscriptions.combined_payload();
        let mut req = self.core.next_request("subscribe");
        req.merge(payload);
        let generation = self.core.generation;
        self.core.send_request(
            req,
            false,
            Some(generation),
            Box::new(|state, _handle, outcome| {
                if let RequestOutcome::Response(resp) = outcome {
                    if resp.succeeded {
                        state.core.server_info.update(&resp.result);
                        let info = state.core.server_info.clone();
                        state.core.events.subscribed.emit(&info);
                    } else {
                        log::warn!("[ledger-link] subscribe failed: {:?}", resp.error);
                    }
                }
            }),
        );
    }

    fn issue_incremental_subscription(&mut self, streams: &[Stream], accounts: &[AccountId]) {
        if !self.core.is_connected() {
            return; // picked up by the combined subscription on connect
        }
        let payload = Subscriptions::incremental_payload(streams, accounts);
        let mut req = self.core.next_request("subscribe");
        req.merge(payload);
        let generation = self.core.generation;
        self.core
            .send_request(req, false, Some(generation), Box::new(|_, _, _| {}));
    }

    // ---- accounts --------------------------------------------------------

    pub(crate) fn do_track_account(
        &mut self,
        handle: &LoopHandle<ClientState>,
        account: AccountId,
        signer: Arc<dyn TxSigner>,
    ) {
        if self.accounts.contains_key(&account) {
            return;
        }
        self.accounts.insert(
            account.clone(),
            TransactionManager::new(account.clone(), signer),
        );
        if self.core.subscriptions.add_account(account.clone()) {
            self.issue_incremental_subscription(&[], &[account.clone()]);
        }
        self.fetch_account_root(handle, account);
    }

    fn fetch_account_root(&mut self, handle: &LoopHandle<ClientState>, account: AccountId) {
        let loop_handle = handle.clone();
        let cb_account = account.clone();
        let manager = FnManager::new(
            |resp: Option<&Response>| match resp {
                // keep trying through disconnects/timeouts and transient
                // errors; a missing entry is a real answer
                None => true,
                Some(r) => r.error != Some(RpcError::EntryNotFound),
            },
            move |outcome: ManagedOutcome<Value>| {
                let account = cb_account.clone();
                let node = match outcome {
                    ManagedOutcome::Done { value, .. } => Some(value),
                    ManagedOutcome::Failed { response }
                        if response.error == Some(RpcError::EntryNotFound) =>
                    {
                        None
                    }
                    _ => return,
                };
                loop_handle.run(move |state, handle| {
                    state.apply_account_root(handle, &account, node);
                });
            },
        );
        start_managed_call(
            self,
            handle,
            "ledger_entry".to_owned(),
            Box::new(manager),
            Box::new(AccountRootBuilder { account }),
        );
    }

    fn apply_account_root(
        &mut self,
        handle: &LoopHandle<ClientState>,
        account: &AccountId,
        node: Option<Value>,
    ) {
        let ClientState { core, accounts, .. } = self;
        let Some(manager) = accounts.get_mut(account) else {
            return;
        };
        match node {
            Some(node) => manager.root_mut().set_from_json(&node),
            None => manager.root_mut().set_unfunded(),
        }
        log::debug!(
            "[ledger-link] account {account} primed at sequence {:?}",
            manager.root().sequence()
        );
        manager.on_root_primed(core, handle);
    }

    // ---- transaction manager glue ---------------------------------------

    pub(crate) fn on_submit_outcome(
        &mut self,
        handle: &LoopHandle<ClientState>,
        account: &AccountId,
        txn_id: TxnId,
        request_id: u64,
        outcome: RequestOutcome,
    ) {
        let ClientState { core, accounts, .. } = self;
        if let Some(manager) = accounts.get_mut(account) {
            manager.handle_submit_outcome(core, handle, txn_id, request_id, outcome);
        }
    }

    pub(crate) fn on_account_tx_outcome(
        &mut self,
        handle: &LoopHandle<ClientState>,
        account: &AccountId,
        run_id: u64,
        outcome: RequestOutcome,
    ) {
        let ClientState { core, accounts, .. } = self;
        if let Some(manager) = accounts.get_mut(account) {
            manager.handle_account_tx_outcome(core, handle, run_id, outcome);
        }
    }

    pub(crate) fn resubmit_txn(
        &mut self,
        handle: &LoopHandle<ClientState>,
        account: &AccountId,
        txn_id: TxnId,
    ) {
        let ClientState { core, accounts, .. } = self;
        if let Some(manager) = accounts.get_mut(account) {
            manager.resubmit_with_same_sequence(core, handle, txn_id);
        }
    }

    // ---- pending-ledger reconciler glue ----------------------------------

    pub(crate) fn do_install_reconciler(&mut self, _handle: &LoopHandle<ClientState>) {
        if self.reconciler.is_some() {
            return;
        }
        self.reconciler = Some(PendingLedgers::new());
        if self.core.subscriptions.add_stream(Stream::Transactions) {
            self.issue_incremental_subscription(&[Stream::Transactions], &[]);
        }
    }

    fn reconciler_on_ledger_closed(
        &mut self,
        handle: &LoopHandle<ClientState>,
        ledger_index: u64,
        txn_count: u32,
    ) {
        let max_in_flight = self.core.config.effective_gap_fetches();
        let picks = match self.reconciler.as_mut() {
            Some(reconciler) => reconciler.on_ledger_closed(ledger_index, txn_count, max_in_flight),
            None => return,
        };
        for pick in picks {
            self.reconciler_fetch_header(handle, pick);
        }
    }

    fn reconciler_fetch_header(&mut self, handle: &LoopHandle<ClientState>, ledger_index: u64) {
        let loop_handle = handle.clone();
        let manager = FnManager::new(crate::managed::always_retry, move |outcome| {
            if let ManagedOutcome::Done { value, .. } = outcome {
                loop_handle.run(move |state, handle| {
                    state.reconciler_apply_header(handle, ledger_index, value);
                });
            }
        });
        start_managed_call(
            self,
            handle,
            "ledger".to_owned(),
            Box::new(manager),
            Box::new(LedgerFetchBuilder {
                ledger_index,
                expanded: false,
            }),
        );
    }

    fn reconciler_apply_header(
        &mut self,
        handle: &LoopHandle<ClientState>,
        ledger_index: u64,
        result: Value,
    ) {
        let header = match LedgerHeader::from_ledger_result(&result) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("[ledger-link] bad ledger header for {ledger_index}: {e}");
                if let Some(reconciler) = self.reconciler.as_mut() {
                    reconciler.fetch_failed(ledger_index);
                }
                return;
            }
        };
        let outcome = self
            .reconciler
            .as_mut()
            .and_then(|r| r.on_header(ledger_index, header));
        match outcome {
            Some(HeaderOutcome::Cleared) => {
                log::debug!("[ledger-link] ledger {ledger_index} cleared from header check");
            }
            Some(HeaderOutcome::FillIn) => self.reconciler_fetch_fill_in(handle, ledger_index),
            None => {}
        }
    }

    fn reconciler_fetch_fill_in(&mut self, handle: &LoopHandle<ClientState>, ledger_index: u64) {
        let loop_handle = handle.clone();
        let manager = FnManager::new(crate::managed::always_retry, move |outcome| {
            if let ManagedOutcome::Done { value, .. } = outcome {
                loop_handle.run(move |state, handle| {
                    state.reconciler_apply_fill_in(handle, ledger_index, value);
                });
            }
        });
        start_managed_call(
            self,
            handle,
            "ledger".to_owned(),
            Box::new(manager),
            Box::new(LedgerFetchBuilder {
                ledger_index,
                expanded: true,
            }),
        );
    }

    fn reconciler_apply_fill_in(
        &mut self,
        handle: &LoopHandle<ClientState>,
        ledger_index: u64,
        result: Value,
    ) {
        let header = match LedgerHeader::from_ledger_result(&result) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("[ledger-link] bad expanded ledger for {ledger_index}: {e}");
                if let Some(reconciler) = self.reconciler.as_mut() {
                    reconciler.fetch_failed(ledger_index);
                }
                return;
            }
        };
        let txns: Vec<TransactionResult> = result
            .get("ledger")
            .and_then(|l| l.get("transactions"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|tx| TransactionResult::from_expanded(ledger_index, tx))
                    .collect()
            })
            .unwrap_or_default();
        let filled = match self.reconciler.as_mut() {
            Some(reconciler) => reconciler.on_fill_in(ledger_index, header, txns),
            None => return,
        };
        match filled {
            Ok(newly) => {
                for tr in &newly {
                    self.deliver_validated(handle, tr);
                }
            }
            Err(e) => {
                log::error!("[ledger-link] {e}");
                self.core.events.error.emit(&e.to_string());
            }
        }
    }
}

/// Ledger fetch request shaping shared by header checks and fill-ins.
struct LedgerFetchBuilder {
    ledger_index: u64,
    expanded: bool,
}

impl RequestBuilder<Value> for LedgerFetchBuilder {
    fn before_request(&mut self, req: &mut Request) {
        req.set("ledger_index", self.ledger_index);
        req.set("transactions", self.expanded);
        req.set("expand", self.expanded);
    }

    fn build_typed_response(&mut self, resp: &Response) -> Result<Value> {
        Ok(resp.result.clone())
    }
}

/// `ledger_entry account_root` against the validated ledger; the typed value
/// is the entry's `node` object.
struct AccountRootBuilder {
    account: AccountId,
}

impl RequestBuilder<Value> for AccountRootBuilder {
    fn before_request(&mut self, req: &mut Request) {
        req.set("account_root", self.account.as_str());
        req.set("ledger_index", "validated");
    }

    fn build_typed_response(&mut self, resp: &Response) -> Result<Value> {
        resp.result.get("node").cloned().ok_or_else(|| {
            LedgerLinkError::MalformedResponse("ledger_entry result missing node".into())
        })
    }
}

/// One forward `account_tx` page over the full validated range.
struct AccountTxBuilder {
    account: AccountId,
    ledger_index_min: i64,
}

impl RequestBuilder<Value> for AccountTxBuilder {
    fn before_request(&mut self, req: &mut Request) {
        req.set("account", self.account.as_str());
        req.set("ledger_index_min", self.ledger_index_min);
        req.set("ledger_index_max", -1);
        req.set("forward", true);
    }

    fn build_typed_response(&mut self, resp: &Response) -> Result<Value> {
        Ok(resp.result.clone())
    }
}

// ---- managed request driver ----------------------------------------------

/// Issues one attempt of a managed call; retries re-enter through the loop
/// with fresh request ids, and exactly one terminal outcome is delivered.
pub(crate) fn start_managed_call<T: Send + 'static>(
    state: &mut ClientState,
    handle: &LoopHandle<ClientState>,
    command: String,
    mut manager: Box<dyn RequestManager<T>>,
    mut builder: Box<dyn RequestBuilder<T>>,
) {
    let _ = handle;
    let mut req = state.core.next_request(&command);
    builder.before_request(&mut req);
    manager.before_request(&mut req);
    state.core.send_request(
        req,
        true,
        None,
        Box::new(move |state, handle, outcome| {
            managed_attempt_concluded(state, handle, command, manager, builder, outcome);
        }),
    );
}

fn managed_attempt_concluded<T: Send + 'static>(
    state: &mut ClientState,
    handle: &LoopHandle<ClientState>,
    command: String,
    mut manager: Box<dyn RequestManager<T>>,
    mut builder: Box<dyn RequestBuilder<T>>,
    outcome: RequestOutcome,
) {
    match outcome {
        RequestOutcome::Response(resp) if resp.succeeded => {
            match builder.build_typed_response(&resp) {
                Ok(value) => manager.on_outcome(ManagedOutcome::Done {
                    response: resp,
                    value,
                }),
                Err(e) => {
                    log::warn!("[ledger-link] {command} response failed to convert: {e}");
                    manager.on_outcome(ManagedOutcome::Failed { response: resp });
                }
            }
        }
        RequestOutcome::Response(resp) => {
            if manager.retry_on_unsuccessful(Some(&resp)) {
                schedule_managed_retry(state, handle, command, manager, builder);
            } else {
                manager.on_outcome(ManagedOutcome::Failed { response: resp });
            }
        }
        RequestOutcome::Timeout | RequestOutcome::Disconnected => {
            if manager.retry_on_unsuccessful(None) {
                schedule_managed_retry(state, handle, command, manager, builder);
            } else {
                manager.on_outcome(ManagedOutcome::Abandoned);
            }
        }
    }
}

fn schedule_managed_retry<T: Send + 'static>(
    state: &mut ClientState,
    handle: &LoopHandle<ClientState>,
    command: String,
    manager: Box<dyn RequestManager<T>>,
    builder: Box<dyn RequestBuilder<T>>,
) {
    let delay = state.core.config.managed_retry_delay;
    handle.schedule(delay, move |state, handle| {
        start_managed_call(state, handle, command, manager, builder);
    });
}

// ---- public handle --------------------------------------------------------

/// A client for one ledger-protocol server.
///
/// All state lives on a background task; handle methods enqueue work and
/// return immediately. Events registered through the builder run on that
/// task and must not block. Dropping the client stops the background task.
pub struct LedgerClient {
    task_loop: TaskLoop<ClientState>,
    handle: LoopHandle<ClientState>,
    connected: Arc<AtomicBool>,
}

impl LedgerClient {
    pub fn builder() -> LedgerClientBuilder {
        LedgerClientBuilder::new()
    }

    /// Starts connecting to `uri`. Failures surface through the error event
    /// and the disconnected/reconnect cycle.
    pub fn connect(&self, uri: &str) {
        let uri = uri.to_owned();
        self.handle.run(move |state, handle| {
            if let Err(e) = state.do_connect(handle, &uri) {
                log::warn!("[ledger-link] connect: {e}");
            }
        });
    }

    /// Disconnects and stays down until `connect` or `reconnect`.
    pub fn disconnect(&self) {
        self.handle
            .run(|state, handle| state.do_disconnect(handle));
    }

    /// Tears the connection down and immediately dials the previous
    /// endpoint again.
    pub fn reconnect(&self) {
        self.handle.run(|state, handle| state.do_reconnect(handle));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stops the background task; queued work is dropped, in-flight
    /// requests are abandoned.
    pub fn dispose(&self) {
        self.task_loop.stop();
    }

    /// Completes once every task enqueued before this call has run.
    pub async fn settle(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if !self.handle.run(move |_, _| {
            let _ = tx.send(());
        }) {
            return Err(LedgerLinkError::Disposed);
        }
        rx.await.map_err(|_| LedgerLinkError::Disposed)
    }

    /// Registers an account for transaction management: subscribes to its
    /// stream and primes its root entry from the server.
    pub fn track_account(&self, account: AccountId, signer: Arc<dyn TxSigner>) {
        self.handle.run(move |state, handle| {
            state.do_track_account(handle, account, signer);
        });
    }

    /// Queues a transaction on a tracked account. Lifecycle events for the
    /// transaction are delivered to `on_event` on the client task.
    pub fn queue_transaction(
        &self,
        account: &AccountId,
        tx_json: Map<String, Value>,
        on_event: impl FnMut(&TxnEvent) + Send + 'static,
    ) {
        let account = account.clone();
        self.handle.run(move |state, handle| {
            let ClientState { core, accounts, .. } = state;
            let Some(manager) = accounts.get_mut(&account) else {
                log::warn!("[ledger-link] queue_transaction for untracked account {account}");
                return;
            };
            let mut txn = manager.create(tx_json);
            txn.on_event(on_event);
            manager.queue(core, handle, txn);
        });
    }

    /// Installs the pending-ledger reconciler: subscribes to the
    /// transactions stream and reconciles every closed ledger's announced
    /// transaction count against what was actually observed.
    pub fn install_ledger_reconciler(&self) {
        self.handle
            .run(|state, handle| state.do_install_reconciler(handle));
    }

    /// Issues a managed request: re-tried per the manager's policy across
    /// disconnects, timeouts and unsuccessful responses, with exactly one
    /// terminal outcome.
    pub fn make_managed_request<T: Send + 'static>(
        &self,
        command: &str,
        manager: impl RequestManager<T>,
        builder: impl RequestBuilder<T>,
    ) {
        let command = command.to_owned();
        self.handle.run(move |state, handle| {
            start_managed_call(state, handle, command, Box::new(manager), Box::new(builder));
        });
    }

    /// Fetches a validated ledger (header only, or expanded transactions),
    /// retrying until the server has it.
    pub fn request_ledger(
        &self,
        ledger_index: u64,
        expanded: bool,
        mut on_outcome: impl FnMut(ManagedOutcome<Value>) + Send + 'static,
    ) {
        self.make_managed_request(
            "ledger",
            FnManager::new(crate::managed::always_retry, move |outcome| {
                on_outcome(outcome)
            }),
            LedgerFetchBuilder {
                ledger_index,
                expanded,
            },
        );
    }

    /// Fetches an account's root entry from the validated ledger. `Failed`
    /// with `entryNotFound` means the account does not exist.
    pub fn request_account_root(
        &self,
        account: AccountId,
        mut on_outcome: impl FnMut(ManagedOutcome<Value>) + Send + 'static,
    ) {
        self.make_managed_request(
            "ledger_entry",
            FnManager::new(
                |resp: Option<&Response>| match resp {
                    None => true,
                    Some(r) => r.error != Some(RpcError::EntryNotFound),
                },
                move |outcome| on_outcome(outcome),
            ),
            AccountRootBuilder { account },
        );
    }

    /// Fetches one forward page of an account's validated transaction
    /// history, starting at `ledger_index_min`.
    pub fn request_account_tx(
        &self,
        account: AccountId,
        ledger_index_min: i64,
        mut on_outcome: impl FnMut(ManagedOutcome<Value>) + Send + 'static,
    ) {
        self.make_managed_request(
            "account_tx",
            FnManager::new(crate::managed::always_retry, move |outcome| {
                on_outcome(outcome)
            }),
            AccountTxBuilder {
                account,
                ledger_index_min,
            },
        );
    }
}

/// Configures and spawns a [`LedgerClient`]. Must be built on a tokio
/// runtime.
pub struct LedgerClientBuilder {
    config: LedgerLinkConfig,
    transport: Option<Box<dyn Transport>>,
    events: ClientEvents,
}

impl LedgerClientBuilder {
    fn new() -> Self {
        LedgerClientBuilder {
            config: LedgerLinkConfig::default(),
            transport: None,
            events: ClientEvents::default(),
        }
    }

    pub fn config(mut self, config: LedgerLinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the stock WebSocket transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn on_connected(mut self, cb: impl FnMut(&()) + Send + 'static) -> Self {
        self.events.connected.on(cb);
        self
    }

    pub fn on_disconnected(mut self, cb: impl FnMut(&()) + Send + 'static) -> Self {
        self.events.disconnected.on(cb);
        self
    }

    pub fn on_subscribed(mut self, cb: impl FnMut(&ServerInfo) + Send + 'static) -> Self {
        self.events.subscribed.on(cb);
        self
    }

    pub fn on_ledger_closed(mut self, cb: impl FnMut(&ServerInfo) + Send + 'static) -> Self {
        self.events.ledger_closed.on(cb);
        self
    }

    pub fn on_validated_transaction(
        mut self,
        cb: impl FnMut(&TransactionResult) + Send + 'static,
    ) -> Self {
        self.events.validated_transaction.on(cb);
        self
    }

    pub fn on_state_change(mut self, cb: impl FnMut(&()) + Send + 'static) -> Self {
        self.events.state_change.on(cb);
        self
    }

    pub fn on_error(mut self, cb: impl FnMut(&String) + Send + 'static) -> Self {
        self.events.error.on(cb);
        self
    }

    pub fn build(self) -> LedgerClient {
        let transport = self
            .transport
            .unwrap_or_else(|| Box::new(WsTransport::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let mut core = Core {
            config: self.config,
            transport,
            conn: ConnState::Disconnected,
            manually_disconnected: false,
            reconnecting: false,
            generation: 0,
            previous_uri: None,
            last_traffic: None,
            server_info: ServerInfo::default(),
            subscriptions: Subscriptions::default(),
            requests: HashMap::new(),
            next_request_id: 0,
            unsent: Vec::new(),
            events: self.events,
            connected_flag: connected.clone(),
        };
        core.subscriptions.add_stream(Stream::Ledger);
        core.subscriptions.add_stream(Stream::Server);
        let state = ClientState {
            core,
            accounts: HashMap::new(),
            reconciler: None,
        };
        let task_loop = TaskLoop::spawn(state);
        let handle = task_loop.handle().clone();
        let sink = TransportSink::new(handle.clone());
        handle.run(move |state, handle| {
            state.core.transport.attach(sink);
            let interval = state.core.config.maintenance_interval;
            handle.schedule(interval, |state, handle| state.maintenance(handle));
        });
        LedgerClient {
            task_loop,
            handle,
            connected,
        }
    }
}
