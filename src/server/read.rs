//! Pipelined reads.
//!
//! Reads are the one operation with unbounded buffer demand, so each
//! projection caps them: at most `max_read_count` reads own an active
//! descriptor (and its max_read-sized buffer) at a time, and the rest
//! queue in arrival order. A slot is held from `pread` through the bulk
//! PUT of the result and is handed to the oldest queued request on
//! completion, which bounds server memory regardless of request rate.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use crate::pool::Poolable;
use crate::proto::wire::{ReadxIn, ReadxOut};
use crate::proto::{ErrCode, encode, encode_with_tail};
use crate::rpc::{Replier, RpcContext};

use super::handle::FileHandle;
use super::{ServerBase, ServerProjection};

/// One slot of the read engine: the pinned buffer a single in-flight
/// read fills and transfers from.
pub struct ActiveRead {
    pub buf: Vec<u8>,
}

impl Poolable for ActiveRead {
    /// Buffer size, the projection's max_read.
    type Seed = usize;

    fn create(seed: &usize) -> Option<Self> {
        Some(ActiveRead {
            buf: vec![0u8; *seed],
        })
    }
}

/// A read request waiting for (or holding) an active slot.
pub struct PendingRead {
    pub handle: Arc<FileHandle>,
    pub req: ReadxIn,
    pub replier: Replier,
    pub ctx: Arc<dyn RpcContext>,
}

#[derive(Default)]
pub struct ReadEngine {
    pub active: usize,
    pub pending: VecDeque<PendingRead>,
}

/// Entry point from the readx handler: run now if a slot is free, else
/// queue in arrival order.
pub fn submit(base: &Arc<ServerBase>, rrd: PendingRead) {
    let projection = Arc::clone(&rrd.handle.projection);
    let ard = {
        let mut engine = projection.read_engine.lock();
        if engine.active < projection.max_read_count {
            match projection.ar_pool.acquire() {
                Some(ard) => {
                    engine.active += 1;
                    debug!(
                        "read slot taken ({}/{})",
                        engine.active, projection.max_read_count
                    );
                    Some(ard)
                }
                None => None,
            }
        } else {
            None
        }
    };
    match ard {
        Some(ard) => process(base, ard, rrd),
        None => {
            let mut engine = projection.read_engine.lock();
            engine.pending.push_back(rrd);
            debug!("read queued ({} waiting)", engine.pending.len());
        }
    }
}

/// Release a slot, or hand it to the oldest queued request.
pub fn check_and_send(base: &Arc<ServerBase>, projection: &Arc<ServerProjection>) {
    let next = {
        let mut engine = projection.read_engine.lock();
        if engine.pending.is_empty() {
            engine.active -= 1;
            debug!(
                "read slot dropped ({}/{})",
                engine.active, projection.max_read_count
            );
            return;
        }
        match projection.ar_pool.acquire() {
            Some(ard) => {
                let rrd = engine.pending.pop_front().expect("pending non-empty");
                Some((ard, rrd))
            }
            None => {
                engine.active -= 1;
                warn!("no active-read descriptor available");
                None
            }
        }
    };
    if let Some((ard, rrd)) = next {
        process(base, ard, rrd);
    }
}

/// Run one read to completion: pread into the slot buffer, then either
/// inline the bytes in the reply or PUT them to the client and reply from
/// the transfer callback.
fn process(base: &Arc<ServerBase>, mut ard: Box<ActiveRead>, rrd: PendingRead) {
    let PendingRead {
        handle,
        req,
        replier,
        ctx,
    } = rrd;
    let projection = Arc::clone(&handle.projection);
    let len = (req.xtvec.len as usize).min(ard.buf.len());

    let result = nix::sys::uio::pread(&handle.fd, &mut ard.buf[..len], req.xtvec.off);
    // The read itself is done with the handle either way.
    handle.decref(base, 1);

    let mut out = ReadxOut::default();
    match result {
        Err(errno) => {
            out.rc = errno as i32;
            replier.send(encode(&out));
            finish(base, &projection, ard);
        }
        Ok(n) if n <= base.config.max_iov_read as usize => {
            out.iov_len = n as u32;
            let payload = encode_with_tail(&out, &ard.buf[..n]);
            replier.send(payload);
            finish(base, &projection, ard);
        }
        Ok(n) => {
            debug!("bulk PUT of {n} bytes for {}", handle.gah());
            let data = ard.buf[..n].to_vec();
            let base = Arc::clone(base);
            let projection2 = Arc::clone(&projection);
            ctx.bulk_put(
                req.data_bulk,
                data,
                Box::new(move |ok| {
                    let mut out = ReadxOut::default();
                    if ok {
                        out.bulk_len = n as u64;
                    } else {
                        out.err = ErrCode::Transport.raw();
                    }
                    replier.send(encode(&out));
                    finish(&base, &projection2, ard);
                }),
            );
        }
    }
}

fn finish(base: &Arc<ServerBase>, projection: &Arc<ServerProjection>, ard: Box<ActiveRead>) {
    projection.ar_pool.release(ard);
    projection.ar_pool.restock();
    check_and_send(base, projection);
}
