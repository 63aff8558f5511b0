//! Transport seam.
//!
//! The core treats the RPC fabric as a black box with a narrow surface:
//! contexts that are progressed cooperatively from one thread, requests
//! sent with a completion callback, registered bulk buffers addressed by
//! id for one-sided PUT/GET, group broadcast and eviction notification.
//! [`loopback`] provides the in-process implementation used by tests and
//! single-node deployments; a networked fabric implements the same two
//! traits.
//!
//! Completion callbacks run inside `progress` on the thread that drives
//! the owning context; the one exception is a send that fails before
//! queuing, whose callback is handed back for the caller to complete.

pub mod loopback;
pub mod progress;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::proto::OpCode;
use crate::proto::wire::BulkId;
use crate::tracker::Tracker;

pub type Rank = u32;

/// Destination of a request: rank plus context tag within the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub rank: Rank,
    pub tag: u32,
}

impl Endpoint {
    pub fn new(rank: Rank) -> Endpoint {
        Endpoint { rank, tag: 0 }
    }
}

/// Transport-level outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Ok,
    /// No reply within the request's timeout budget.
    TimedOut,
    /// The destination rank was evicted from the group.
    Evicted,
    /// The destination rank is not a member of the group.
    OutOfGroup,
    /// Local allocation failure.
    NoMemLocal,
    /// The remote reported an allocation failure.
    NoMemRemote,
    /// Any other transport failure.
    Failed,
}

impl RpcStatus {
    /// Eviction and out-of-group escalate to the failover path.
    pub fn is_eviction(self) -> bool {
        matches!(self, RpcStatus::Evicted | RpcStatus::OutOfGroup)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub status: RpcStatus,
    pub reply: Vec<u8>,
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;
pub type EvictionFn = Box<dyn Fn(&str, Rank) + Send + Sync>;

/// Errors from the transport API itself (as opposed to request outcomes,
/// which arrive through completions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// Context has in-flight requests and cannot be destroyed.
    Busy,
    /// The fabric or the peer context is gone.
    Disconnected,
    /// No such rank in the group.
    InvalidEndpoint,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RpcError::Busy => "context busy with in-flight requests",
            RpcError::Disconnected => "fabric disconnected",
            RpcError::InvalidEndpoint => "no such rank",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for RpcError {}

/// A send that failed before the request was queued.  The completion
/// callback is handed back untouched so the caller can still fire it;
/// a callback must run exactly once no matter how the send goes.
pub struct SendFailure {
    pub error: RpcError,
    pub cb: CompletionFn,
}

impl fmt::Debug for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendFailure({:?})", self.error)
    }
}

/// A registered local buffer, target or source of one-sided transfers.
pub type BulkBuf = Arc<Mutex<Vec<u8>>>;

/// Reply hook for an incoming request.  Consumed by sending; dropping it
/// without replying is logged, since the peer will hang until timeout.
pub struct Replier {
    send: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
    op: OpCode,
}

impl Replier {
    pub fn new(op: OpCode, send: Box<dyn FnOnce(Vec<u8>) + Send>) -> Replier {
        Replier {
            send: Some(send),
            op,
        }
    }

    pub fn send(mut self, payload: Vec<u8>) {
        if let Some(send) = self.send.take() {
            send(payload);
        }
    }
}

impl Drop for Replier {
    fn drop(&mut self) {
        if self.send.is_some() {
            log::warn!("dropping {:?} request without a reply", self.op);
        }
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replier({:?})", self.op)
    }
}

/// An inbound request as seen by a server handler.
pub struct Incoming {
    pub op: OpCode,
    pub payload: Vec<u8>,
    pub replier: Replier,
    /// The context the request arrived on, for bulk transfers.
    pub ctx: Arc<dyn RpcContext>,
}

pub type Handler = Box<dyn Fn(Incoming) + Send + Sync>;

#[derive(Default)]
pub struct HandlerTable {
    handlers: std::collections::HashMap<OpCode, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: OpCode, handler: Handler) {
        self.handlers.insert(op, handler);
    }

    pub fn get(&self, op: OpCode) -> Option<&Handler> {
        self.handlers.get(&op)
    }
}

/// One progressable transport context.
pub trait RpcContext: Send + Sync {
    /// Queue a request.  On success `cb` fires exactly once from
    /// `progress`; a send that fails before queuing returns the callback
    /// in the [`SendFailure`] so the caller completes it instead.
    fn send_rpc(
        &self,
        ep: Endpoint,
        op: OpCode,
        payload: Vec<u8>,
        cb: CompletionFn,
    ) -> Result<(), SendFailure>;

    /// Pump completions and inbound requests for up to `timeout`, or until
    /// `stop` returns true.  Returns the number of events handled.
    fn progress(&self, timeout: Duration, stop: Option<&(dyn Fn() -> bool)>) -> usize;

    /// Install the handler table for inbound requests (server contexts).
    fn set_handlers(&self, table: HandlerTable);

    /// Expose a local buffer for one-sided transfers.
    fn bulk_register(&self, buf: BulkBuf) -> BulkId;

    fn bulk_deregister(&self, id: BulkId);

    /// One-sided PUT into the peer buffer `remote`.  `cb` runs from this
    /// context's `progress` with the transfer outcome.
    fn bulk_put(&self, remote: BulkId, data: Vec<u8>, cb: Box<dyn FnOnce(bool) + Send>);

    /// One-sided GET of up to `len` bytes from the peer buffer `remote`.
    fn bulk_get(
        &self,
        remote: BulkId,
        len: u64,
        cb: Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>,
    );

    /// Requests sent but not yet completed.
    fn in_flight(&self) -> usize;

    /// Tear the context down; refuses while requests are in flight.
    fn destroy(&self) -> Result<(), RpcError>;

    /// Downcast support: a fabric implementation only ever receives
    /// contexts it created itself, and uses this to get them back.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The fabric: rank addressing, group membership, eviction, broadcast.
pub trait Fabric: Send + Sync {
    fn group_name(&self) -> &str;

    /// Ranks currently alive in the group.
    fn live_ranks(&self) -> Vec<Rank>;

    fn create_context(&self) -> Arc<dyn RpcContext>;

    /// Bind a context as the service endpoint for `rank`.
    fn bind_rank(&self, rank: Rank, ctx: &Arc<dyn RpcContext>);

    /// Register an eviction callback; it runs on `ctx`'s progress thread
    /// with `(group, evicted_rank)`.
    fn register_eviction_cb(&self, ctx: &Arc<dyn RpcContext>, cb: EvictionFn);

    /// Send `op` to every live rank except `exclude`; `cb` fires once after
    /// all targets have replied (or failed), with the first failure if any.
    fn broadcast(
        &self,
        ctx: &Arc<dyn RpcContext>,
        exclude: Rank,
        op: OpCode,
        payload: Vec<u8>,
        cb: CompletionFn,
    ) -> Result<(), RpcError>;
}

/// Block until `tracker` reaches zero.  With a progress thread present the
/// wait is a pure sleep; without one the caller must drive progress
/// itself, so completions can still run.
pub fn wait_tracker(
    ctx: &Arc<dyn RpcContext>,
    has_progress_thread: bool,
    poll_interval: Duration,
    tracker: &Tracker,
) {
    if has_progress_thread {
        tracker.wait();
        return;
    }
    while !tracker.is_signalled() {
        ctx.progress(poll_interval, Some(&|| tracker.is_signalled()));
    }
}
