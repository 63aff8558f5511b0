//! Service groups and the eviction controller.
//!
//! A service group is one server peer group: its fabric attachment and
//! the current primary rank all requests target. When the fabric reports
//! an eviction the controller re-targets the group to the first surviving
//! rank, or takes its projections offline when no rank remains or the
//! projection has failover disabled. Handle invalidation (rather than
//! transparent migration) is the failover contract: subsequent operations
//! on open handles fail locally until the application reopens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{info, warn};

use crate::rpc::{Fabric, Rank};

pub struct ServiceGroup {
    pub fabric: Arc<dyn Fabric>,
    primary: AtomicU32,
    enabled: AtomicBool,
}

impl ServiceGroup {
    pub fn new(fabric: Arc<dyn Fabric>) -> Arc<ServiceGroup> {
        let primary = fabric.live_ranks().first().copied().unwrap_or(0);
        Arc::new(ServiceGroup {
            fabric,
            primary: AtomicU32::new(primary),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        self.fabric.group_name()
    }

    /// Rank requests currently target.
    pub fn primary(&self) -> Rank {
        self.primary.load(Ordering::Acquire)
    }

    /// Re-target from `evicted` to `new`, keeping any concurrent update.
    pub fn retarget(&self, evicted: Rank, new: Rank) -> Rank {
        let _ = self
            .primary
            .compare_exchange(evicted, new, Ordering::AcqRel, Ordering::Acquire);
        self.primary()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

/// What the controller needs from each projection on an evicted group.
pub trait EvictionSink: Send + Sync {
    fn fs_id(&self) -> u32;
    fn has_failover(&self) -> bool;
    /// Fast-fail all subsequent operations with `errno`.
    fn mark_offline(&self, errno: i32);
    /// Clear `gah_ok` on every open file and directory handle.
    fn invalidate_handles(&self);
}

/// Process one eviction notification for `group`.
///
/// Ordering matters: the primary is re-targeted before any projection is
/// touched, so completion callbacks observing the eviction already see
/// the new primary.
pub fn eviction_update(group: &ServiceGroup, evicted: Rank, sinks: &[Arc<dyn EvictionSink>]) {
    let survivors = group.fabric.live_ranks();
    let new_primary = survivors.iter().copied().find(|r| *r != evicted);

    match new_primary {
        Some(new) => {
            let now = group.retarget(evicted, new);
            info!(
                "group {}: rank {evicted} evicted, primary now {now}",
                group.name()
            );
        }
        None => {
            warn!("group {}: no ranks left after eviction", group.name());
            group.disable();
        }
    }

    for sink in sinks {
        if !group.is_enabled() {
            warn!("projection {}: group disabled, going offline", sink.fs_id());
            sink.mark_offline(libc::EHOSTDOWN);
        } else if !sink.has_failover() {
            warn!(
                "projection {}: failover disabled, going offline",
                sink.fs_id()
            );
            sink.mark_offline(libc::EHOSTDOWN);
        } else {
            info!("projection {}: invalidating open handles", sink.fs_id());
            sink.invalidate_handles();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Fabric;
    use crate::rpc::loopback::LoopbackFabric;
    use std::sync::atomic::AtomicI32;

    struct TestSink {
        failover: bool,
        offline: AtomicI32,
        invalidated: AtomicBool,
    }

    impl EvictionSink for TestSink {
        fn fs_id(&self) -> u32 {
            0
        }
        fn has_failover(&self) -> bool {
            self.failover
        }
        fn mark_offline(&self, errno: i32) {
            self.offline.store(errno, Ordering::SeqCst);
        }
        fn invalidate_handles(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    type Ctxs = Vec<Arc<dyn crate::rpc::RpcContext>>;

    fn two_rank_group() -> (Arc<LoopbackFabric>, Arc<ServiceGroup>, Ctxs) {
        let fabric = LoopbackFabric::new("grp");
        let mut ctxs: Ctxs = Vec::new();
        for rank in [0, 1] {
            let ctx = fabric.create_context();
            fabric.bind_rank(rank, &ctx);
            ctxs.push(ctx);
        }
        let group = ServiceGroup::new(fabric.clone());
        (fabric, group, ctxs)
    }

    #[test]
    fn retarget_on_eviction() {
        let (fabric, group, _ctxs) = two_rank_group();
        assert_eq!(group.primary(), 0);
        let sink = Arc::new(TestSink {
            failover: true,
            offline: AtomicI32::new(0),
            invalidated: AtomicBool::new(false),
        });
        fabric.evict(0);
        let sinks: Vec<Arc<dyn EvictionSink>> = vec![sink.clone()];
        eviction_update(&group, 0, &sinks);
        assert_eq!(group.primary(), 1);
        assert!(group.is_enabled());
        assert!(sink.invalidated.load(Ordering::SeqCst));
        assert_eq!(sink.offline.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn offline_when_failover_disabled() {
        let (fabric, group, _ctxs) = two_rank_group();
        let sink = Arc::new(TestSink {
            failover: false,
            offline: AtomicI32::new(0),
            invalidated: AtomicBool::new(false),
        });
        fabric.evict(0);
        let sinks: Vec<Arc<dyn EvictionSink>> = vec![sink.clone()];
        eviction_update(&group, 0, &sinks);
        assert_eq!(sink.offline.load(Ordering::SeqCst), libc::EHOSTDOWN);
        assert!(!sink.invalidated.load(Ordering::SeqCst));
    }

    #[test]
    fn group_disabled_when_no_ranks_remain() {
        let fabric = LoopbackFabric::new("grp");
        let ctx = fabric.create_context();
        fabric.bind_rank(0, &ctx);
        let group = ServiceGroup::new(fabric.clone());
        let sink = Arc::new(TestSink {
            failover: true,
            offline: AtomicI32::new(0),
            invalidated: AtomicBool::new(false),
        });
        fabric.evict(0);
        let sinks: Vec<Arc<dyn EvictionSink>> = vec![sink.clone()];
        eviction_update(&group, 0, &sinks);
        assert!(!group.is_enabled());
        assert_eq!(sink.offline.load(Ordering::SeqCst), libc::EHOSTDOWN);
    }
}
