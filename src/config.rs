use std::time::Duration;

/// Tunable timing and policy knobs for a [`crate::LedgerClient`].
///
/// Every constant the client consults lives here so tests (and unusual
/// deployments) can compress or stretch the protocol's rhythm without
/// touching client code. Use [`LedgerLinkConfig::builder`] to override
/// individual values:
///
/// ```
/// use ledger_link::LedgerLinkConfig;
/// use std::time::Duration;
///
/// let config = LedgerLinkConfig::builder()
///     .request_timeout(Duration::from_secs(30))
///     .reconnect_delay(Duration::from_millis(200))
///     .build();
/// assert_eq!(config.request_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerLinkConfig {
    /// Cadence of the maintenance heartbeat (request sweep + dormancy check).
    pub maintenance_interval: Duration,
    /// Connected but silent for longer than this: force a reconnect cycle.
    pub dormancy_threshold: Duration,
    /// Delay before a guarded reconnect attempt after an unexpected drop.
    pub reconnect_delay: Duration,
    /// A sent request with no response after this long times out.
    pub request_timeout: Duration,
    /// Delay between managed-request retries.
    pub managed_retry_delay: Duration,
    /// Delay before resubmitting a transaction rejected with a
    /// connectivity-class RPC error.
    pub no_network_retry_delay: Duration,
    /// Submitted transactions expire `submission_horizon` ledgers after the
    /// ledger index current at submission time.
    pub submission_horizon: u32,
    /// Resubmit the oldest pending transaction if this many ledgers close
    /// after its latest submission without a validation.
    pub resubmit_after_ledgers: u32,
    /// Run account-transaction reconciliation once this many ledgers have
    /// closed since the last fully checked ledger.
    pub ledgers_between_account_tx: u32,
    /// Abort a reconciliation pager that made no progress for this many
    /// ledger closes.
    pub account_tx_timeout_ledgers: u32,
    /// When restarting the pager, begin this many ledgers below the last
    /// fully checked ledger.
    pub account_tx_restart_margin: u32,
    /// Failed transactions are reported only after every submission's
    /// expiry horizon is this many ledgers in the past.
    pub expiry_safety_margin: u32,
    /// Upper bound on header/fill-in requests launched per ledger close.
    /// Clamped to 1; larger values historically flooded slow servers.
    pub gap_fetches_per_close: usize,
    /// Refuse to submit while the server's load factor scaled against its
    /// load base is at or above this value.
    pub max_load_factor: u64,
}

impl Default for LedgerLinkConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(10),
            dormancy_threshold: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            managed_retry_delay: Duration::from_millis(50),
            no_network_retry_delay: Duration::from_millis(500),
            submission_horizon: 8,
            resubmit_after_ledgers: 5,
            ledgers_between_account_tx: 15,
            account_tx_timeout_ledgers: 5,
            account_tx_restart_margin: 5,
            expiry_safety_margin: 1,
            gap_fetches_per_close: 1,
            max_load_factor: 768_000,
        }
    }
}

impl LedgerLinkConfig {
    pub fn builder() -> LedgerLinkConfigBuilder {
        LedgerLinkConfigBuilder::default()
    }

    /// Preset with all delays compressed for tests that drive a scripted
    /// server and should not wait wall-clock seconds.
    pub fn for_testing() -> Self {
        Self {
            maintenance_interval: Duration::from_millis(50),
            dormancy_threshold: Duration::from_millis(400),
            reconnect_delay: Duration::from_millis(20),
            request_timeout: Duration::from_millis(500),
            managed_retry_delay: Duration::from_millis(5),
            no_network_retry_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// The effective per-close fetch bound. The field is configurable for
    /// symmetry but never exceeds one in-flight fetch per close.
    pub fn effective_gap_fetches(&self) -> usize {
        self.gap_fetches_per_close.min(1)
    }
}

/// Builder for [`LedgerLinkConfig`]. Unset fields keep their defaults.
#[derive(Debug, Default, Clone)]
pub struct LedgerLinkConfigBuilder {
    config: Option<LedgerLinkConfig>,
}

macro_rules! builder_setters {
    ($($(#[$meta:meta])* $name:ident: $ty:ty),+ $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, value: $ty) -> Self {
                self.config.get_or_insert_with(LedgerLinkConfig::default).$name = value;
                self
            }
        )+
    };
}

impl LedgerLinkConfigBuilder {
    builder_setters! {
        maintenance_interval: Duration,
        dormancy_threshold: Duration,
        reconnect_delay: Duration,
        request_timeout: Duration,
        managed_retry_delay: Duration,
        no_network_retry_delay: Duration,
        submission_horizon: u32,
        resubmit_after_ledgers: u32,
        ledgers_between_account_tx: u32,
        account_tx_timeout_ledgers: u32,
        account_tx_restart_margin: u32,
        expiry_safety_margin: u32,
        gap_fetches_per_close: usize,
        max_load_factor: u64,
    }

    pub fn build(self) -> LedgerLinkConfig {
        self.config.unwrap_or_default()
    }
}
