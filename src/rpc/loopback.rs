//! In-process fabric.
//!
//! Connects any number of client and server contexts through per-context
//! mailboxes. Requests are delivered into the destination rank's mailbox
//! and executed by whatever thread progresses that context, which keeps
//! the cooperative single-threaded callback discipline of a real fabric.
//! Bulk buffers live in a fabric-wide registry keyed by id, so a PUT or
//! GET is a copy between registered buffers, the loopback stand-in for
//! RDMA. Ranks can be evicted at runtime: in-flight requests to the rank
//! fail with `Evicted` and registered eviction callbacks fire on their
//! owning context's progress thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, unbounded};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::proto::OpCode;
use crate::proto::wire::BulkId;

use super::{
    BulkBuf, Completion, CompletionFn, Endpoint, EvictionFn, Fabric, HandlerTable, Incoming, Rank,
    Replier, RpcContext, RpcError, RpcStatus, SendFailure,
};

type CtxId = u64;

enum Event {
    Request {
        op: OpCode,
        payload: Vec<u8>,
        reply_to: CtxId,
        xid: u64,
    },
    Reply {
        xid: u64,
        payload: Vec<u8>,
    },
    /// Deferred work delivered to this context: locally-failed sends,
    /// bulk completions, broadcast aggregation.
    Task(Box<dyn FnOnce() + Send>),
    Evicted(Rank),
}

struct PendingCall {
    cb: CompletionFn,
    dest: Rank,
}

struct FabricState {
    group: String,
    mailboxes: Mutex<HashMap<CtxId, Sender<Event>>>,
    rank_ctx: Mutex<HashMap<Rank, CtxId>>,
    evicted: Mutex<HashSet<Rank>>,
    bulk: Mutex<HashMap<BulkId, BulkBuf>>,
    eviction_cbs: Mutex<Vec<(CtxId, Arc<EvictionFn>)>>,
    next_ctx: AtomicU64,
    next_bulk: AtomicU64,
    next_xid: AtomicU64,
}

impl FabricState {
    fn post(&self, ctx: CtxId, event: Event) -> Result<(), RpcError> {
        let mailboxes = self.mailboxes.lock();
        let tx = mailboxes.get(&ctx).ok_or(RpcError::Disconnected)?;
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(RpcError::Disconnected),
            Err(TrySendError::Full(_)) => unreachable!("unbounded channel"),
        }
    }
}

/// The in-process fabric for one peer group.
pub struct LoopbackFabric {
    state: Arc<FabricState>,
}

impl LoopbackFabric {
    pub fn new(group: &str) -> Arc<LoopbackFabric> {
        Arc::new(LoopbackFabric {
            state: Arc::new(FabricState {
                group: group.to_string(),
                mailboxes: Mutex::new(HashMap::new()),
                rank_ctx: Mutex::new(HashMap::new()),
                evicted: Mutex::new(HashSet::new()),
                bulk: Mutex::new(HashMap::new()),
                eviction_cbs: Mutex::new(Vec::new()),
                next_ctx: AtomicU64::new(1),
                next_bulk: AtomicU64::new(1),
                next_xid: AtomicU64::new(1),
            }),
        })
    }

    /// Remove `rank` from the group: in-flight requests to it fail with
    /// `Evicted` and eviction callbacks fire.
    pub fn evict(&self, rank: Rank) {
        debug!("evicting rank {rank} from group {}", self.state.group);
        self.state.evicted.lock().insert(rank);
        self.state.rank_ctx.lock().remove(&rank);
        let targets: Vec<CtxId> = self.state.mailboxes.lock().keys().copied().collect();
        for ctx in targets {
            let _ = self.state.post(ctx, Event::Evicted(rank));
        }
    }
}

impl Fabric for LoopbackFabric {
    fn group_name(&self) -> &str {
        &self.state.group
    }

    fn live_ranks(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = self.state.rank_ctx.lock().keys().copied().collect();
        ranks.sort_unstable();
        ranks
    }

    fn create_context(&self) -> Arc<dyn RpcContext> {
        let (tx, rx) = unbounded();
        let id = self.state.next_ctx.fetch_add(1, Ordering::Relaxed);
        self.state.mailboxes.lock().insert(id, tx.clone());
        let ctx = Arc::new_cyclic(|weak| LoopbackContext {
            id,
            state: Arc::clone(&self.state),
            rx,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(None),
            self_weak: weak.clone(),
        });
        ctx
    }

    fn bind_rank(&self, rank: Rank, ctx: &Arc<dyn RpcContext>) {
        let id = ctx_id(ctx).expect("loopback context expected");
        self.state.evicted.lock().remove(&rank);
        self.state.rank_ctx.lock().insert(rank, id);
    }

    fn register_eviction_cb(&self, ctx: &Arc<dyn RpcContext>, cb: EvictionFn) {
        let id = ctx_id(ctx).expect("loopback context expected");
        self.state.eviction_cbs.lock().push((id, Arc::new(cb)));
    }

    fn broadcast(
        &self,
        ctx: &Arc<dyn RpcContext>,
        exclude: Rank,
        op: OpCode,
        payload: Vec<u8>,
        cb: CompletionFn,
    ) -> Result<(), RpcError> {
        let targets: Vec<Rank> = self
            .live_ranks()
            .into_iter()
            .filter(|r| *r != exclude)
            .collect();
        let id = ctx_id(ctx).ok_or(RpcError::Disconnected)?;
        if targets.is_empty() {
            let done = Completion {
                status: RpcStatus::Ok,
                reply: Vec::new(),
            };
            return self
                .state
                .post(id, Event::Task(Box::new(move || cb(done))));
        }
        // Aggregate: the final callback fires once every target replied,
        // carrying the first failure seen.
        struct Agg {
            remaining: usize,
            first_error: Option<RpcStatus>,
            cb: Option<CompletionFn>,
        }
        let agg = Arc::new(Mutex::new(Agg {
            remaining: targets.len(),
            first_error: None,
            cb: Some(cb),
        }));
        for rank in targets {
            let agg = Arc::clone(&agg);
            let sent = ctx.send_rpc(
                Endpoint::new(rank),
                op,
                payload.clone(),
                Box::new(move |completion| {
                    let mut agg = agg.lock();
                    if completion.status != RpcStatus::Ok && agg.first_error.is_none() {
                        agg.first_error = Some(completion.status);
                    }
                    agg.remaining -= 1;
                    if agg.remaining == 0 {
                        if let Some(cb) = agg.cb.take() {
                            cb(Completion {
                                status: agg.first_error.unwrap_or(RpcStatus::Ok),
                                reply: Vec::new(),
                            });
                        }
                    }
                }),
            );
            if let Err(failure) = sent {
                // The target counts as failed; the aggregate still fires.
                (failure.cb)(Completion {
                    status: RpcStatus::Failed,
                    reply: Vec::new(),
                });
            }
        }
        Ok(())
    }
}

/// One mailbox-backed context.
pub struct LoopbackContext {
    id: CtxId,
    state: Arc<FabricState>,
    rx: Receiver<Event>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: RwLock<Option<HandlerTable>>,
    self_weak: std::sync::Weak<LoopbackContext>,
}

impl LoopbackContext {
    /// Post deferred work to our own mailbox so it runs under progress.
    fn post_self(&self, task: Box<dyn FnOnce() + Send>) {
        if self.state.post(self.id, Event::Task(task)).is_err() {
            warn!("context {} mailbox gone, dropping task", self.id);
        }
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Request {
                op,
                payload,
                reply_to,
                xid,
            } => {
                let handlers = self.handlers.read();
                let Some(table) = handlers.as_ref() else {
                    warn!("request {op:?} arrived on a context with no handlers");
                    return;
                };
                let Some(handler) = table.get(op) else {
                    warn!("no handler for {op:?}");
                    return;
                };
                let state = Arc::clone(&self.state);
                let replier = Replier::new(
                    op,
                    Box::new(move |payload| {
                        if state.post(reply_to, Event::Reply { xid, payload }).is_err() {
                            debug!("reply target context {reply_to} is gone");
                        }
                    }),
                );
                let Some(ctx) = self.self_weak.upgrade() else {
                    return;
                };
                handler(Incoming {
                    op,
                    payload,
                    replier,
                    ctx,
                });
            }
            Event::Reply { xid, payload } => {
                let call = self.pending.lock().remove(&xid);
                match call {
                    Some(call) => (call.cb)(Completion {
                        status: RpcStatus::Ok,
                        reply: payload,
                    }),
                    None => debug!("reply for unknown xid {xid}"),
                }
            }
            Event::Task(task) => task(),
            Event::Evicted(rank) => {
                let failed: Vec<PendingCall> = {
                    let mut pending = self.pending.lock();
                    let xids: Vec<u64> = pending
                        .iter()
                        .filter(|(_, c)| c.dest == rank)
                        .map(|(x, _)| *x)
                        .collect();
                    xids.into_iter().filter_map(|x| pending.remove(&x)).collect()
                };
                for call in failed {
                    (call.cb)(Completion {
                        status: RpcStatus::Evicted,
                        reply: Vec::new(),
                    });
                }
                let cbs: Vec<Arc<EvictionFn>> = self
                    .state
                    .eviction_cbs
                    .lock()
                    .iter()
                    .filter(|(id, _)| *id == self.id)
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                for cb in cbs {
                    cb(&self.state.group, rank);
                }
            }
        }
    }
}

impl RpcContext for LoopbackContext {
    fn send_rpc(
        &self,
        ep: Endpoint,
        op: OpCode,
        payload: Vec<u8>,
        cb: CompletionFn,
    ) -> Result<(), SendFailure> {
        let dest_ctx = {
            if self.state.evicted.lock().contains(&ep.rank) {
                None
            } else {
                self.state.rank_ctx.lock().get(&ep.rank).copied()
            }
        };
        let Some(dest_ctx) = dest_ctx else {
            // Fail through our own mailbox so the callback still runs on
            // the progress thread.
            let status = if self.state.evicted.lock().contains(&ep.rank) {
                RpcStatus::Evicted
            } else {
                RpcStatus::OutOfGroup
            };
            self.post_self(Box::new(move || {
                cb(Completion {
                    status,
                    reply: Vec::new(),
                })
            }));
            return Ok(());
        };
        let xid = self.state.next_xid.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .insert(xid, PendingCall { cb, dest: ep.rank });
        let posted = self.state.post(
            dest_ctx,
            Event::Request {
                op,
                payload,
                reply_to: self.id,
                xid,
            },
        );
        if posted.is_err() {
            // Destination died between lookup and post.
            if let Some(call) = self.pending.lock().remove(&xid) {
                self.post_self(Box::new(move || {
                    (call.cb)(Completion {
                        status: RpcStatus::Evicted,
                        reply: Vec::new(),
                    })
                }));
            }
        }
        Ok(())
    }

    fn progress(&self, timeout: Duration, stop: Option<&(dyn Fn() -> bool)>) -> usize {
        let deadline = Instant::now() + timeout;
        let mut handled = 0;
        loop {
            if let Some(stop) = stop {
                if stop() {
                    break;
                }
            }
            // Drain whatever is ready before blocking.
            while let Ok(event) = self.rx.try_recv() {
                self.handle(event);
                handled += 1;
                if let Some(stop) = stop {
                    if stop() {
                        return handled;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Cap the block so a raised stop flag is noticed promptly.
            let wait = (deadline - now).min(Duration::from_millis(10));
            match self.rx.recv_timeout(wait) {
                Ok(event) => {
                    self.handle(event);
                    handled += 1;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if stop.is_none() {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        handled
    }

    fn set_handlers(&self, table: HandlerTable) {
        *self.handlers.write() = Some(table);
    }

    fn bulk_register(&self, buf: BulkBuf) -> BulkId {
        let id = self.state.next_bulk.fetch_add(1, Ordering::Relaxed);
        self.state.bulk.lock().insert(id, buf);
        id
    }

    fn bulk_deregister(&self, id: BulkId) {
        self.state.bulk.lock().remove(&id);
    }

    fn bulk_put(&self, remote: BulkId, data: Vec<u8>, cb: Box<dyn FnOnce(bool) + Send>) {
        let target = self.state.bulk.lock().get(&remote).cloned();
        let ok = match target {
            Some(buf) => {
                let mut buf = buf.lock();
                if buf.len() < data.len() {
                    buf.resize(data.len(), 0);
                }
                buf[..data.len()].copy_from_slice(&data);
                true
            }
            None => false,
        };
        self.post_self(Box::new(move || cb(ok)));
    }

    fn bulk_get(
        &self,
        remote: BulkId,
        len: u64,
        cb: Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>,
    ) {
        let source = self.state.bulk.lock().get(&remote).cloned();
        let result = match source {
            Some(buf) => {
                let buf = buf.lock();
                let take = (len as usize).min(buf.len());
                Ok(buf[..take].to_vec())
            }
            None => Err(RpcError::InvalidEndpoint),
        };
        self.post_self(Box::new(move || cb(result)));
    }

    fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn destroy(&self) -> Result<(), RpcError> {
        if self.in_flight() > 0 {
            return Err(RpcError::Busy);
        }
        self.state.mailboxes.lock().remove(&self.id);
        self.state.eviction_cbs.lock().retain(|(id, _)| *id != self.id);
        self.state.rank_ctx.lock().retain(|_, ctx| *ctx != self.id);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Map a trait object back to the mailbox id of the loopback context
/// behind it.  The fabric only ever sees contexts it created.
fn ctx_id(ctx: &Arc<dyn RpcContext>) -> Option<CtxId> {
    ctx.as_any().downcast_ref::<LoopbackContext>().map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::OpCode;
    use std::sync::atomic::AtomicBool;

    fn echo_table() -> HandlerTable {
        let mut table = HandlerTable::new();
        table.register(
            OpCode::Getattr,
            Box::new(|incoming: Incoming| {
                let mut payload = incoming.payload;
                payload.reverse();
                incoming.replier.send(payload);
            }),
        );
        table
    }

    #[test]
    fn request_reply_round_trip() {
        let fabric = LoopbackFabric::new("test");
        let server = fabric.create_context();
        server.set_handlers(echo_table());
        fabric.bind_rank(0, &server);
        let client = fabric.create_context();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        client
            .send_rpc(
                Endpoint::new(0),
                OpCode::Getattr,
                vec![1, 2, 3],
                Box::new(move |completion| {
                    assert_eq!(completion.status, RpcStatus::Ok);
                    assert_eq!(completion.reply, vec![3, 2, 1]);
                    done2.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();

        server.progress(Duration::from_millis(100), None);
        client.progress(Duration::from_millis(100), None);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn eviction_fails_in_flight_and_notifies() {
        let fabric = LoopbackFabric::new("test");
        let server = fabric.create_context();
        // No progress on the server: the request stays in flight.
        server.set_handlers(echo_table());
        fabric.bind_rank(0, &server);
        let client = fabric.create_context();

        let evicted_rank = Arc::new(AtomicU64::new(u64::MAX));
        let seen = Arc::clone(&evicted_rank);
        fabric.register_eviction_cb(
            &client,
            Box::new(move |group, rank| {
                assert_eq!(group, "test");
                seen.store(rank as u64, Ordering::SeqCst);
            }),
        );

        let status = Arc::new(Mutex::new(None));
        let status2 = Arc::clone(&status);
        client
            .send_rpc(
                Endpoint::new(0),
                OpCode::Getattr,
                vec![],
                Box::new(move |completion| {
                    *status2.lock() = Some(completion.status);
                }),
            )
            .unwrap();
        fabric.evict(0);
        client.progress(Duration::from_millis(100), None);

        assert_eq!(*status.lock(), Some(RpcStatus::Evicted));
        assert_eq!(evicted_rank.load(Ordering::SeqCst), 0);
        // Further sends fail locally with Evicted.
        let late = Arc::new(Mutex::new(None));
        let late2 = Arc::clone(&late);
        client
            .send_rpc(
                Endpoint::new(0),
                OpCode::Getattr,
                vec![],
                Box::new(move |c| *late2.lock() = Some(c.status)),
            )
            .unwrap();
        client.progress(Duration::from_millis(100), None);
        assert_eq!(*late.lock(), Some(RpcStatus::Evicted));
    }

    #[test]
    fn bulk_put_and_get() {
        let fabric = LoopbackFabric::new("test");
        let client = fabric.create_context();
        let server = fabric.create_context();

        let buf: BulkBuf = Arc::new(Mutex::new(vec![0u8; 8]));
        let id = client.bulk_register(Arc::clone(&buf));

        let put_done = Arc::new(AtomicBool::new(false));
        let put_done2 = Arc::clone(&put_done);
        server.bulk_put(
            id,
            vec![9, 8, 7],
            Box::new(move |ok| {
                assert!(ok);
                put_done2.store(true, Ordering::SeqCst);
            }),
        );
        server.progress(Duration::from_millis(100), None);
        assert!(put_done.load(Ordering::SeqCst));
        assert_eq!(&buf.lock()[..3], &[9, 8, 7]);

        let got = Arc::new(Mutex::new(None));
        let got2 = Arc::clone(&got);
        server.bulk_get(
            id,
            3,
            Box::new(move |r| *got2.lock() = Some(r.unwrap())),
        );
        server.progress(Duration::from_millis(100), None);
        assert_eq!(got.lock().as_deref(), Some(&[9u8, 8, 7][..]));

        client.bulk_deregister(id);
        let missing = Arc::new(AtomicBool::new(true));
        let missing2 = Arc::clone(&missing);
        server.bulk_put(id, vec![1], Box::new(move |ok| missing2.store(ok, Ordering::SeqCst)));
        server.progress(Duration::from_millis(100), None);
        assert!(!missing.load(Ordering::SeqCst));
    }

    #[test]
    fn broadcast_aggregates() {
        let fabric = LoopbackFabric::new("test");
        let mut servers = Vec::new();
        for rank in 0..3 {
            let ctx = fabric.create_context();
            let mut table = HandlerTable::new();
            table.register(
                OpCode::Shutdown,
                Box::new(|incoming: Incoming| incoming.replier.send(Vec::new())),
            );
            ctx.set_handlers(table);
            fabric.bind_rank(rank, &ctx);
            servers.push(ctx);
        }
        let caller = Arc::clone(&servers[0]);
        let done = Arc::new(Mutex::new(None));
        let done2 = Arc::clone(&done);
        fabric
            .broadcast(
                &caller,
                0,
                OpCode::Shutdown,
                Vec::new(),
                Box::new(move |c| *done2.lock() = Some(c.status)),
            )
            .unwrap();
        for ctx in &servers[1..] {
            ctx.progress(Duration::from_millis(50), None);
        }
        caller.progress(Duration::from_millis(50), None);
        assert_eq!(*done.lock(), Some(RpcStatus::Ok));
    }
}
