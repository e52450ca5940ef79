//! ledger-link: a stateful client for ledger-protocol servers.
//!
//! The crate keeps one persistent WebSocket per client and owns everything
//! that makes such a connection usable in practice:
//!
//! - a single-writer task loop that serializes all client state mutation,
//! - automatic reconnection with generation-tagged request affinity,
//! - a request table with timeout sweeping and a managed-request retry
//!   protocol for requests that must survive reconnects,
//! - a per-account transaction submission manager that reacts to provisional
//!   engine results (resubmission, sequence contention, fee bumps),
//! - a pending-ledger reconciler that detects missed transactions by
//!   comparing accumulated transaction sets against fetched ledger headers.
//!
//! Entry point is [`LedgerClient`]; construct one through
//! [`LedgerClient::builder`], connect, track accounts, queue transactions.

pub mod account;
pub mod client;
pub mod config;
pub mod engine_result;
pub mod error;
pub mod events;
pub mod ledgers;
pub mod managed;
pub mod request;
pub mod server_info;
pub mod subscriptions;
pub mod task_loop;
pub mod transactions;
pub mod transport;
pub mod wire;

pub use account::{SignedTxn, TrackedAccountRoot, TxSigner};
pub use client::{ConnState, LedgerClient, LedgerClientBuilder};
pub use config::LedgerLinkConfig;
pub use engine_result::{EngineResult, ResultClass};
pub use error::{LedgerLinkError, Result};
pub use events::ListenerToken;
pub use ledgers::TxSetDigest;
pub use managed::{ManagedOutcome, RequestBuilder, RequestManager};
pub use request::{Request, RequestOutcome, Response, RpcError};
pub use server_info::ServerInfo;
pub use subscriptions::Stream;
pub use task_loop::{LoopHandle, TaskLoop};
pub use transactions::{TxnEvent, TxnId};
pub use transport::{Transport, TransportSink};
pub use wire::{AccountId, Hash256, LedgerHeader, TransactionResult};
