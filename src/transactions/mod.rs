//! Per-account transaction submission management.
//!
//! One [`TransactionManager`] per tracked account owns everything between
//! "caller queued a payload" and "transaction validated or definitively
//! failed": optimistic sequence assignment, deferred submission until the
//! client can submit, engine-result-driven resubmission, sequence-contention
//! handling, expiry of failed submissions, and periodic `account_tx`
//! reconciliation against the server's validated history.

mod managed_txn;
mod pager;

pub use managed_txn::{ManagedTxn, Submission, TxnEvent, TxnId};
pub use pager::{AccountTxPager, Page};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::account::{TrackedAccountRoot, TxSigner};
use crate::client::{ClientState, Core};
use crate::engine_result::{EngineResult, ResultClass};
use crate::request::{RequestOutcome, Response, RpcError};
use crate::task_loop::LoopHandle;
use crate::transactions::managed_txn::TxnWait;
use crate::wire::{AccountId, TransactionResult};

pub struct TransactionManager {
    account: AccountId,
    signer: Arc<dyn TxSigner>,
    root: TrackedAccountRoot,
    /// Local sequence preemption counter; 0 until first assignment.
    sequence: u32,
    pending: Vec<ManagedTxn>,
    /// Finalized as failed, kept until every submission's horizon expires.
    failed: Vec<ManagedTxn>,
    /// Queued before the account root was primed.
    deferred: Vec<ManagedTxn>,
    seen_validated_sequences: BTreeSet<u32>,
    pager: Option<AccountTxPager>,
    next_pager_run: u64,
    last_pager_update: u64,
    last_ledger_checked: u64,
    next_txn_id: u64,
}

impl TransactionManager {
    pub(crate) fn new(account: AccountId, signer: Arc<dyn TxSigner>) -> Self {
        TransactionManager {
            root: TrackedAccountRoot::new(account.clone()),
            account,
            signer,
            sequence: 0,
            pending: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            seen_validated_sequences: BTreeSet::new(),
            pager: None,
            next_pager_run: 0,
            last_pager_update: 0,
            last_ledger_checked: 0,
            next_txn_id: 0,
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn root(&self) -> &TrackedAccountRoot {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut TrackedAccountRoot {
        &mut self.root
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    fn pending_ref(&self, id: TxnId) -> Option<&ManagedTxn> {
        self.pending.iter().find(|t| t.id == id)
    }

    fn pending_mut(&mut self, id: TxnId) -> Option<&mut ManagedTxn> {
        self.pending.iter_mut().find(|t| t.id == id)
    }

    /// Creates a managed transaction owned by this account. Attach
    /// listeners, then pass it to [`TransactionManager::queue`].
    pub(crate) fn create(&mut self, tx_json: Map<String, Value>) -> ManagedTxn {
        self.next_txn_id += 1;
        ManagedTxn::new(TxnId(self.next_txn_id), &self.account, tx_json)
    }

    /// Queues for submission, or defers until the account root is primed.
    pub(crate) fn queue(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn: ManagedTxn,
    ) {
        if self.root.primed() {
            let sequence = self.next_sequence();
            self.queue_with_sequence(core, handle, txn, sequence);
        } else {
            self.deferred.push(txn);
        }
    }

    pub(crate) fn on_root_primed(&mut self, core: &mut Core, handle: &LoopHandle<ClientState>) {
        let queued: Vec<ManagedTxn> = self.deferred.drain(..).collect();
        for txn in queued {
            let sequence = self.next_sequence();
            self.queue_with_sequence(core, handle, txn, sequence);
        }
    }

    /// Next submission sequence: the server's reported account sequence
    /// preempted by sequences we have already handed out locally.
    fn next_sequence(&mut self) -> u32 {
        let server = self.root.sequence().unwrap_or(1);
        if server > self.sequence {
            self.sequence = server;
        }
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn queue_with_sequence(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        mut txn: ManagedTxn,
        sequence: u32,
    ) {
        txn.set_sequence(sequence);
        let id = txn.id;
        self.pending.push(txn);
        self.make_submit_request(core, handle, id, sequence);
    }

    fn can_submit(&self, core: &Core) -> bool {
        core.is_connected()
            && core.server_info.primed()
            && core.server_info.has_fee_data()
            && core.server_info.load_below(core.config.max_load_factor)
            && self.root.primed()
    }

    /// Submits now or arms a wait until submission becomes possible.
    fn make_submit_request(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        sequence: u32,
    ) {
        if self.can_submit(core) {
            self.do_submit(core, handle, txn_id, sequence);
        } else if let Some(txn) = self.pending_mut(txn_id) {
            txn.wait = TxnWait::UntilCanSubmit {
                sequence,
                submissions_at_defer: txn.submissions().len(),
            };
        }
    }

    fn do_submit(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        sequence: u32,
    ) {
        let _ = handle;
        let fee = core.server_info.transaction_fee();
        let current = core.server_info.ledger_index;
        let horizon = core.config.submission_horizon;
        let Some(txn) = self.pending.iter_mut().find(|t| t.id == txn_id) else {
            return;
        };
        let mut last_ledger_sequence = (current as u32).saturating_add(horizon);
        if let Some(prev) = txn.last_submission() {
            // Reuse an unexpired horizon so a resubmission cannot outlive
            // the original submission window.
            if current < prev.last_ledger_sequence as u64 {
                last_ledger_sequence = prev.last_ledger_sequence;
            }
        }
        txn.set_sequence(sequence);
        txn.wait = TxnWait::None;
        let prepared = txn.prepared_json(sequence, fee, last_ledger_sequence);
        let signed = self.signer.sign(&prepared);

        let mut req = core.next_request("submit");
        req.set("tx_blob", signed.blob.as_str());
        let request_id = req.id;
        txn.note_submission(Submission {
            request_id,
            sequence,
            hash: signed.hash,
            ledger_index: current,
            last_ledger_sequence,
            fee,
        });
        log::debug!(
            "[ledger-link] submit {} seq {} last_ledger {} fee {}",
            signed.hash,
            sequence,
            last_ledger_sequence,
            fee
        );
        let account = self.account.clone();
        core.send_request(
            req,
            false,
            None,
            Box::new(move |state, handle, outcome| {
                state.on_submit_outcome(handle, &account, txn_id, request_id, outcome);
            }),
        );
    }

    pub(crate) fn handle_submit_outcome(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        request_id: u64,
        outcome: RequestOutcome,
    ) {
        // Timeouts and disconnects are left to the periodic resubmission
        // sweep; only responses drive the state machine.
        let RequestOutcome::Response(resp) = outcome else {
            return;
        };
        {
            let Some(txn) = self.pending.iter_mut().find(|t| t.id == txn_id) else {
                return;
            };
            if txn.response_is_stale(request_id) {
                return;
            }
            txn.last_response = Some(resp.clone());
        }
        if resp.succeeded {
            self.handle_submit_success(core, handle, txn_id, resp);
        } else {
            self.handle_submit_error(core, handle, txn_id, resp);
        }
    }

    fn handle_submit_success(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        resp: Response,
    ) {
        let Some(ter) = resp.engine_result() else {
            log::warn!("[ledger-link] submit response without engine result");
            self.await_expiry(txn_id);
            return;
        };
        let submit_sequence = resp
            .submit_sequence()
            .or_else(|| self.pending_ref(txn_id).and_then(ManagedTxn::sequence))
            .unwrap_or(0);
        use EngineResult::*;
        match ter {
            tesSUCCESS => {
                if let Some(txn) = self.pending_mut(txn_id) {
                    txn.emit(&TxnEvent::SubmitSuccess { response: resp });
                }
            }
            tefPAST_SEQ => self.resubmit_with_new_sequence(core, handle, txn_id),
            tefMAX_LEDGER => self.resubmit(core, handle, txn_id, submit_sequence),
            terPRE_SEQ => {
                // Resubmit once the validated stream catches up to the
                // sequence we submitted under.
                if let Some(txn) = self.pending_mut(txn_id) {
                    txn.wait = TxnWait::SequenceReached {
                        sequence: submit_sequence,
                    };
                }
            }
            telINSUF_FEE_P => self.resubmit(core, handle, txn_id, submit_sequence),
            tefALREADY | terQUEUED => {
                // Already with the server under this exact hash, or held in
                // its queue. Leave it pending; validation or the periodic
                // resubmission sweep resolves it.
            }
            telCAN_NOT_QUEUE
            | telCAN_NOT_QUEUE_BALANCE
            | telCAN_NOT_QUEUE_BLOCKS
            | telCAN_NOT_QUEUE_BLOCKED
            | telCAN_NOT_QUEUE_FEE
            | telCAN_NOT_QUEUE_FULL => {
                // Queue rejection. Leave it pending for the sweep; the
                // account_tx reconciliation may clear it sooner.
            }
            other => match other.class() {
                ResultClass::tecCLAIM => {
                    // Sequence consumed, fee claimed; could still apply.
                    // Wait for validation or expiry.
                    self.await_expiry(txn_id);
                }
                ResultClass::temMALFORMED
                | ResultClass::tefFAILURE
                | ResultClass::telLOCAL_ERROR
                | ResultClass::terRETRY => {
                    self.await_expiry(txn_id);
                    if self.pending.is_empty() {
                        // Hand the unused sequence back to the local counter.
                        self.sequence = self.sequence.saturating_sub(1);
                    } else {
                        // Later queued transactions depend on this sequence
                        // being consumed; plug the gap and nudge them.
                        self.queue_sequence_plug(core, handle, submit_sequence);
                        self.resubmit_greater_than(core, handle, submit_sequence);
                    }
                }
                ResultClass::tesSUCCESS => {}
            },
        }
    }

    fn handle_submit_error(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        resp: Response,
    ) {
        match resp.error {
            Some(RpcError::NoNetwork) => {
                let account = self.account.clone();
                let delay = core.config.no_network_retry_delay;
                handle.schedule(delay, move |state, handle| {
                    state.resubmit_txn(handle, &account, txn_id);
                });
            }
            _ => self.await_expiry(txn_id),
        }
    }

    /// Finalizes a transaction as failed; it is reported once every
    /// submission's horizon has safely expired.
    fn await_expiry(&mut self, txn_id: TxnId) {
        if let Some(pos) = self.pending.iter().position(|t| t.id == txn_id) {
            let mut txn = self.pending.remove(pos);
            txn.finalize();
            self.failed.push(txn);
        }
    }

    fn resubmit(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
        sequence: u32,
    ) {
        self.make_submit_request(core, handle, txn_id, sequence);
    }

    pub(crate) fn resubmit_with_same_sequence(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
    ) {
        if let Some(sequence) = self.pending_ref(txn_id).and_then(ManagedTxn::sequence) {
            self.resubmit(core, handle, txn_id, sequence);
        }
    }

    /// Resubmission under a fresh sequence happens only after the contended
    /// sequence was actually observed consumed by a validated transaction;
    /// otherwise the transaction waits for that observation.
    fn resubmit_with_new_sequence(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        txn_id: TxnId,
    ) {
        let Some(txn) = self.pending.iter().find(|t| t.id == txn_id) else {
            return;
        };
        if txn.is_sequence_plug() {
            // The sequence it was meant to plug is consumed either way.
            return;
        }
        let seen = txn
            .sequence()
            .map_or(false, |s| self.seen_validated_sequences.contains(&s));
        if seen && !txn.is_finalized() {
            if let Some(txn) = self.pending_mut(txn_id) {
                txn.wait = TxnWait::None;
            }
            let sequence = self.next_sequence();
            self.resubmit(core, handle, txn_id, sequence);
        } else if let Some(txn) = self.pending_mut(txn_id) {
            txn.wait = TxnWait::SequenceConsumed;
        }
    }

    fn resubmit_greater_than(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        sequence: u32,
    ) {
        let ids: Vec<TxnId> = self
            .pending
            .iter()
            .filter(|t| t.sequence().map_or(false, |s| s > sequence))
            .map(|t| t.id)
            .collect();
        for id in ids {
            self.resubmit_with_same_sequence(core, handle, id);
        }
    }

    fn resubmit_first_with_taken_sequence(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        sequence: u32,
    ) {
        let id = self
            .pending
            .iter()
            .find(|t| t.sequence() == Some(sequence))
            .map(|t| t.id);
        if let Some(id) = id {
            self.resubmit_with_new_sequence(core, handle, id);
        }
    }

    /// A no-op transaction that consumes a sequence so later queued
    /// transactions can clear.
    fn queue_sequence_plug(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        sequence: u32,
    ) {
        let mut plug_json = Map::new();
        plug_json.insert("TransactionType".to_owned(), Value::from("AccountSet"));
        let mut plug = self.create(plug_json);
        plug.set_sequence_plug();
        self.queue_with_sequence(core, handle, plug, sequence);
    }

    /// Dispatcher for transactions waiting on validated-sequence progress.
    /// `next_expected` is one past the sequence just observed validated.
    pub(crate) fn on_validated_sequence(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        next_expected: u32,
    ) {
        let reached: Vec<(TxnId, u32)> = self
            .pending
            .iter()
            .filter_map(|t| match t.wait {
                TxnWait::SequenceReached { sequence } if sequence == next_expected => {
                    Some((t.id, sequence))
                }
                _ => None,
            })
            .collect();
        for (id, sequence) in reached {
            if let Some(txn) = self.pending_mut(id) {
                txn.wait = TxnWait::None;
            }
            self.resubmit(core, handle, id, sequence);
        }

        let consumed: Vec<TxnId> = self
            .pending
            .iter()
            .filter(|t| {
                t.wait == TxnWait::SequenceConsumed
                    && t.sequence()
                        .map_or(false, |s| self.seen_validated_sequences.contains(&s))
            })
            .map(|t| t.id)
            .collect();
        for id in consumed {
            if let Some(txn) = self.pending_mut(id) {
                txn.wait = TxnWait::None;
            }
            let sequence = self.next_sequence();
            self.resubmit(core, handle, id, sequence);
        }
    }

    /// Dispatcher run after every processed message: drains submissions
    /// deferred on `can_submit`.
    pub(crate) fn on_state_change(&mut self, core: &mut Core, handle: &LoopHandle<ClientState>) {
        if !self.deferred.is_empty() && self.root.primed() {
            self.on_root_primed(core, handle);
        }
        let waiting: Vec<(TxnId, u32, usize)> = self
            .pending
            .iter()
            .filter_map(|t| match t.wait {
                TxnWait::UntilCanSubmit {
                    sequence,
                    submissions_at_defer,
                } => Some((t.id, sequence, submissions_at_defer)),
                _ => None,
            })
            .collect();
        for (id, sequence, submissions_at_defer) in waiting {
            let stale = self
                .pending_ref(id)
                .map_or(true, |t| t.submissions().len() != submissions_at_defer);
            if stale {
                if let Some(txn) = self.pending_mut(id) {
                    txn.wait = TxnWait::None;
                }
                continue;
            }
            if self.can_submit(core) {
                self.do_submit(core, handle, id, sequence);
            }
        }
    }

    /// Ingests one validated transaction initiated by this account.
    pub(crate) fn notify_transaction_result(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        tr: &TransactionResult,
    ) {
        if !tr.validated || tr.account.as_ref() != Some(&self.account) {
            return;
        }
        self.root.update_from_transaction(tr);
        let Some(txn_sequence) = tr.sequence else {
            return;
        };
        self.seen_validated_sequences.insert(txn_sequence);

        if let Some(pos) = self
            .pending
            .iter()
            .position(|t| t.was_submitted_with(&tr.hash))
        {
            let mut txn = self.pending.remove(pos);
            txn.finalize();
            txn.emit(&TxnEvent::Validated { result: tr.clone() });
        } else if let Some(pos) = self
            .failed
            .iter()
            .position(|t| t.was_submitted_with(&tr.hash))
        {
            let mut txn = self.failed.remove(pos);
            txn.finalize();
            txn.emit(&TxnEvent::Validated { result: tr.clone() });
        } else {
            // Someone else consumed the sequence; preempt the terPRE_SEQ.
            self.resubmit_first_with_taken_sequence(core, handle, txn_sequence);
        }
        // Either way validated-sequence progress advanced; wake waiters.
        self.on_validated_sequence(core, handle, txn_sequence.wrapping_add(1));
    }

    /// Per-ledger-close sweep: account_tx reconciliation, failed-txn
    /// expiry, and resubmission of a stalled oldest pending transaction.
    pub(crate) fn on_ledger_closed(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        ledger_index: u64,
    ) {
        self.check_account_transactions(core, handle, ledger_index);
        self.clear_failed(core, ledger_index);

        if !self.can_submit(core) || self.pending.is_empty() {
            return;
        }
        let oldest = self
            .pending
            .iter()
            .min_by_key(|t| t.sequence().unwrap_or(u32::MAX))
            .map(|t| (t.id, t.last_submission().map(|s| s.ledger_index)));
        if let Some((id, Some(submitted_at))) = oldest {
            if ledger_index.saturating_sub(submitted_at) > core.config.resubmit_after_ledgers as u64
            {
                self.resubmit_with_same_sequence(core, handle, id);
            }
        }
    }

    /// Reports failed transactions whose every submission horizon is safely
    /// in the past: `SubmitError` for RPC-level failures, `SubmitFailure`
    /// for engine-level ones. Reported transactions are dropped.
    fn clear_failed(&mut self, core: &Core, ledger_index: u64) {
        let safety = core.config.expiry_safety_margin as u64;
        let mut i = 0;
        while i < self.failed.len() {
            let expired = !self.failed[i].submissions().is_empty()
                && self.failed[i]
                    .submissions()
                    .iter()
                    .all(|s| ledger_index.saturating_sub(safety) > s.last_ledger_sequence as u64);
            if !expired {
                i += 1;
                continue;
            }
            let mut txn = self.failed.remove(i);
            if let Some(response) = txn.last_response.take() {
                let event = if response.error.is_some() {
                    TxnEvent::SubmitError { response }
                } else {
                    TxnEvent::SubmitFailure { response }
                };
                txn.emit(&event);
            }
        }
    }

    fn check_account_transactions(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        current: u64,
    ) {
        if self.pending.is_empty() && self.failed.is_empty() {
            self.last_ledger_checked = 0;
            return;
        }
        if self.last_ledger_checked == 0 {
            // Seed at the earliest submission ledger; sweep on a later close.
            let mut start = current;
            for txn in self.pending.iter().chain(self.failed.iter()) {
                for s in txn.submissions() {
                    start = start.min(s.ledger_index);
                }
            }
            self.last_ledger_checked = start;
            return;
        }
        let ledgers_passed = current.saturating_sub(self.last_ledger_checked);
        if ledgers_passed < core.config.ledgers_between_account_tx as u64 {
            return;
        }
        if self.pager.is_some() {
            if current.saturating_sub(self.last_pager_update)
                >= core.config.account_tx_timeout_ledgers as u64
            {
                // Stalled run; drop it and restart on a later close.
                self.pager = None;
            }
        } else {
            self.last_pager_update = current;
            self.next_pager_run += 1;
            let start =
                self.last_ledger_checked as i64 - core.config.account_tx_restart_margin as i64;
            self.pager = Some(AccountTxPager::new(
                self.account.clone(),
                self.next_pager_run,
                start,
            ));
            self.issue_pager_request(core, handle);
        }
    }

    fn issue_pager_request(&mut self, core: &mut Core, handle: &LoopHandle<ClientState>) {
        let _ = handle;
        let Some(pager) = &self.pager else {
            return;
        };
        let run_id = pager.run_id();
        let mut req = core.next_request("account_tx");
        req.merge(pager.request_payload());
        let account = self.account.clone();
        core.send_request(
            req,
            false,
            None,
            Box::new(move |state, handle, outcome| {
                state.on_account_tx_outcome(handle, &account, run_id, outcome);
            }),
        );
    }

    pub(crate) fn handle_account_tx_outcome(
        &mut self,
        core: &mut Core,
        handle: &LoopHandle<ClientState>,
        run_id: u64,
        outcome: RequestOutcome,
    ) {
        if self.pager.as_ref().map(AccountTxPager::run_id) != Some(run_id) {
            // Aborted or superseded run; drop the late page.
            return;
        }
        let RequestOutcome::Response(resp) = outcome else {
            return;
        };
        if !resp.succeeded {
            // Leave the pager; the close sweep aborts it after the timeout.
            return;
        }
        self.last_pager_update = core.server_info.ledger_index;
        let Some(pager) = self.pager.as_mut() else {
            return;
        };
        let page = pager.apply_page(&resp.result);
        if page.has_more {
            self.issue_pager_request(core, handle);
        } else {
            if let Some(max) = page.ledger_index_max {
                self.last_ledger_checked = self.last_ledger_checked.max(max);
            }
            self.pager = None;
        }
        for tr in &page.txns {
            self.notify_transaction_result(core, handle, tr);
        }
    }
}
