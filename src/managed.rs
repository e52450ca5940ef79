//! Managed requests: requests that survive disconnects, timeouts and
//! transient server errors by re-issuing themselves under fresh ids.
//!
//! A managed call pairs a [`RequestBuilder`] (shapes the request, types the
//! response) with a [`RequestManager`] (owns the retry policy and receives
//! the single terminal outcome). The driver lives on the client; it consumes
//! the pending continuation on every attempt, so exactly one
//! [`ManagedOutcome`] is ever delivered per logical call.

use crate::error::Result;
use crate::request::{Request, Response};

/// Shapes the outgoing request and converts the successful response.
pub trait RequestBuilder<T>: Send + 'static {
    /// Adds payload fields before each attempt (fresh id every time).
    fn before_request(&mut self, _request: &mut Request) {}

    /// Converts a successful response into the typed value.
    fn build_typed_response(&mut self, response: &Response) -> Result<T>;
}

/// Owns the retry policy and receives the terminal outcome.
pub trait RequestManager<T>: Send + 'static {
    /// Extra payload shaping, applied after the builder's.
    fn before_request(&mut self, _request: &mut Request) {}

    /// Whether to retry. `None` means the attempt ended without a response
    /// (timeout or disconnect); `Some` is an unsuccessful response.
    fn retry_on_unsuccessful(&mut self, response: Option<&Response>) -> bool;

    /// The single terminal outcome for the logical call.
    fn on_outcome(&mut self, outcome: ManagedOutcome<T>);
}

/// Terminal outcome of a managed call.
#[derive(Debug)]
pub enum ManagedOutcome<T> {
    /// Successful response, typed.
    Done { response: Response, value: T },
    /// Unsuccessful response and the manager declined to retry.
    Failed { response: Response },
    /// Timeout or disconnect with retry declined; no response exists.
    Abandoned,
}

/// A [`RequestBuilder`] from a conversion closure.
pub struct FnBuilder<F> {
    build: F,
}

impl<F> FnBuilder<F> {
    pub fn new(build: F) -> Self {
        FnBuilder { build }
    }
}

impl<T, F> RequestBuilder<T> for FnBuilder<F>
where
    F: FnMut(&Response) -> Result<T> + Send + 'static,
{
    fn build_typed_response(&mut self, response: &Response) -> Result<T> {
        (self.build)(response)
    }
}

/// A [`RequestManager`] from a retry predicate and an outcome sink.
pub struct FnManager<R, O> {
    retry: R,
    outcome: O,
}

impl<R, O> FnManager<R, O> {
    pub fn new(retry: R, outcome: O) -> Self {
        FnManager { retry, outcome }
    }
}

impl<T, R, O> RequestManager<T> for FnManager<R, O>
where
    R: FnMut(Option<&Response>) -> bool + Send + 'static,
    O: FnMut(ManagedOutcome<T>) + Send + 'static,
{
    fn retry_on_unsuccessful(&mut self, response: Option<&Response>) -> bool {
        (self.retry)(response)
    }

    fn on_outcome(&mut self, outcome: ManagedOutcome<T>) {
        (self.outcome)(outcome);
    }
}

/// Retry policy that always retries; for requests that must eventually
/// succeed (ledger fetches against validated history).
pub fn always_retry(_: Option<&Response>) -> bool {
    true
}
