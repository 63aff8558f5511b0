//! Request completion plumbing.
//!
//! Every dispatched operation follows the same request life cycle: build
//! the payload, queue it on the projection's context, and resolve the
//! completion on the progress thread. Transport failures map to errnos
//! here; eviction gets one retry against the re-targeted primary when the
//! operation is safe to replay, which is the client half of the failover
//! contract.

use std::sync::Arc;

use log::{info, warn};

use crate::proto::OpCode;
use crate::rpc::{Completion, RpcStatus};

use super::Projection;

pub type ReplyHandler = Box<dyn FnOnce(Result<Vec<u8>, i32>) + Send>;

/// Errno for a failed completion, taking the projection's offline state
/// into account.
fn status_errno(proj: &Projection, status: RpcStatus) -> i32 {
    match status {
        RpcStatus::Ok => 0,
        RpcStatus::NoMemLocal | RpcStatus::NoMemRemote => libc::ENOMEM,
        RpcStatus::Evicted | RpcStatus::OutOfGroup => {
            let offline = proj.offline_reason();
            if offline != 0 { offline } else { libc::EHOSTDOWN }
        }
        // A request that exhausted its timeout budget is indistinguishable
        // from a lost server; no caller here is retry-aware.
        RpcStatus::TimedOut => libc::EIO,
        RpcStatus::Failed => libc::EIO,
    }
}

/// Send `op` and hand the raw reply (or an errno) to `handler`.
///
/// With `retry` set, an eviction completion re-targets once: by the time
/// the completion runs, the eviction controller has already swung the
/// group's primary, so the replay goes to the survivor.
pub fn send_request(
    proj: &Arc<Projection>,
    op: OpCode,
    payload: Vec<u8>,
    retry: bool,
    handler: ReplyHandler,
) {
    let offline = proj.offline_reason();
    if offline != 0 {
        handler(Err(offline));
        return;
    }
    let attempt_payload = if retry { Some(payload.clone()) } else { None };
    let proj2 = Arc::clone(proj);
    // On a failed send Projection::send completes the callback inline
    // with `Failed`, so the handler fires exactly once either way.
    let _ = proj.send(
        op,
        payload,
        Box::new(move |completion: Completion| {
            match completion.status {
                RpcStatus::Ok => handler(Ok(completion.reply)),
                RpcStatus::Evicted | RpcStatus::OutOfGroup => {
                    let offline = proj2.offline_reason();
                    if offline == 0 && attempt_payload.is_some() && proj2.group.is_enabled() {
                        info!(
                            "replaying {op:?} against rank {}",
                            proj2.group.primary()
                        );
                        let payload = attempt_payload.unwrap();
                        let proj3 = Arc::clone(&proj2);
                        let resend = proj2.send(
                            op,
                            payload,
                            Box::new(move |completion: Completion| {
                                match completion.status {
                                    RpcStatus::Ok => handler(Ok(completion.reply)),
                                    status => {
                                        handler(Err(status_errno(&proj3, status)))
                                    }
                                }
                            }),
                        );
                        if let Err(errno) = resend {
                            // The handler already fired with `Failed`
                            // through the inline completion.
                            warn!("replay of {op:?} not sent: {errno}");
                        }
                    } else {
                        handler(Err(status_errno(&proj2, completion.status)))
                    }
                }
                status => handler(Err(status_errno(&proj2, status))),
            }
        }),
    );
}
