//! Progress threads.
//!
//! The transport is cooperative and single-threaded per context: whatever
//! thread calls `progress` runs every completion and inbound handler for
//! that context. A [`ProgressThread`] dedicates one thread to one context
//! and restocks the registered descriptor pools before each blocking
//! progress call, which is what keeps the request hot path allocation
//! free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::tracker::Tracker;

use super::RpcContext;

pub type Restocker = Box<dyn Fn() + Send + Sync>;

pub struct ProgressThread {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressThread {
    pub fn start(
        name: &str,
        ctx: Arc<dyn RpcContext>,
        poll_interval: Duration,
        restockers: Vec<Restocker>,
    ) -> ProgressThread {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let started = Arc::new(Tracker::new(1));
        let started_tx = Arc::clone(&started);
        let thread_name = format!("progress-{name}");
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("progress thread running");
                started_tx.signal();
                while !stop_flag.load(Ordering::Acquire) {
                    for restock in &restockers {
                        restock();
                    }
                    ctx.progress(
                        poll_interval,
                        Some(&|| stop_flag.load(Ordering::Acquire)),
                    );
                }
                // One final drain so completions queued during shutdown
                // still run before the thread exits.
                ctx.progress(Duration::ZERO, None);
                for restock in &restockers {
                    restock();
                }
                debug!("progress thread exiting");
            })
            .expect("spawning progress thread");
        started.wait();
        ProgressThread {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop_and_join(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("progress thread panicked");
            }
        }
    }
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::OpCode;
    use crate::rpc::loopback::LoopbackFabric;
    use crate::rpc::{Endpoint, Fabric, HandlerTable, Incoming, RpcStatus};

    #[test]
    fn completions_run_on_progress_thread() {
        let fabric = LoopbackFabric::new("test");
        let server = fabric.create_context();
        let mut table = HandlerTable::new();
        table.register(
            OpCode::Close,
            Box::new(|incoming: Incoming| incoming.replier.send(Vec::new())),
        );
        server.set_handlers(table);
        fabric.bind_rank(0, &server);
        let server_thread = ProgressThread::start(
            "srv",
            Arc::clone(&server),
            Duration::from_millis(5),
            Vec::new(),
        );

        let client = fabric.create_context();
        let client_thread = ProgressThread::start(
            "cli",
            Arc::clone(&client),
            Duration::from_millis(5),
            Vec::new(),
        );

        let done = Arc::new(Tracker::new(1));
        let done_tx = Arc::clone(&done);
        client
            .send_rpc(
                Endpoint::new(0),
                OpCode::Close,
                Vec::new(),
                Box::new(move |completion| {
                    assert_eq!(completion.status, RpcStatus::Ok);
                    done_tx.signal();
                }),
            )
            .unwrap();
        assert!(done.wait_timeout(Duration::from_secs(5)));

        client_thread.stop_and_join();
        server_thread.stop_and_join();
    }
}
