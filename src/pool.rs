//! Object pools for request descriptors.
//!
//! Every short-lived descriptor in the system (lookup, open handle, read
//! buffer, write buffer, active read, ...) is drawn from a typed pool so
//! the hot path never allocates once steady state is reached. The life
//! cycle is deliberate: `release` parks a descriptor on a pending list
//! rather than the free list, and the progress thread recycles pending
//! entries with `restock` before it blocks, so the thread that completed
//! the request is never the one paying for cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

/// A descriptor type that can live in a [`Pool`].
///
/// `create` runs once when the backing storage is first allocated,
/// `reset` on every acquire (returning false destroys the descriptor and
/// fails the acquire), `clean` during restock to decide whether an entry
/// returning from in-flight use can be recycled without a fresh reset.
pub trait Poolable: Send + Sized + 'static {
    /// Shared context handed to `create`, typically an `Arc` of the
    /// owning projection.
    type Seed: Clone + Send + Sync + 'static;

    fn create(seed: &Self::Seed) -> Option<Self>;

    fn reset(&mut self) -> bool {
        true
    }

    fn clean(&mut self) -> bool {
        true
    }
}

struct Lists<T> {
    free: Vec<Box<T>>,
    pending: Vec<Box<T>>,
}

pub struct Pool<T: Poolable> {
    name: &'static str,
    seed: T::Seed,
    lists: Mutex<Lists<T>>,
    /// Descriptors currently allocated (free + pending + in flight).
    total: AtomicUsize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(name: &'static str, seed: T::Seed) -> Arc<Self> {
        debug!("created pool '{name}'");
        Arc::new(Pool {
            name,
            seed,
            lists: Mutex::new(Lists {
                free: Vec::new(),
                pending: Vec::new(),
            }),
            total: AtomicUsize::new(0),
        })
    }

    /// Take a ready-to-use descriptor, creating one if the free list is
    /// empty. Returns None on creation or reset failure.
    pub fn acquire(self: &Arc<Self>) -> Option<Box<T>> {
        let recycled = self.lists.lock().free.pop();
        let mut item = match recycled {
            Some(item) => item,
            None => {
                let item = Box::new(T::create(&self.seed)?);
                self.total.fetch_add(1, Ordering::Relaxed);
                item
            }
        };
        if !item.reset() {
            warn!("pool '{}': reset failed, destroying descriptor", self.name);
            self.total.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(item)
    }

    /// Hand a descriptor back.  It lands on the pending list; the next
    /// `restock` decides whether it can be recycled.
    pub fn release(&self, item: Box<T>) {
        self.lists.lock().pending.push(item);
    }

    /// Drain the pending list: cleaned entries move to the free list,
    /// entries that fail `clean` are destroyed.
    pub fn restock(&self) {
        let pending = {
            let mut lists = self.lists.lock();
            std::mem::take(&mut lists.pending)
        };
        if pending.is_empty() {
            return;
        }
        let mut cleaned = Vec::with_capacity(pending.len());
        for mut item in pending {
            if item.clean() {
                cleaned.push(item);
            } else {
                debug!("pool '{}': entry failed clean", self.name);
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.lists.lock().free.append(&mut cleaned);
    }

    /// Restock, then destroy everything on the free list.  Used at
    /// projection teardown; in-flight descriptors are unaffected.
    pub fn reclaim(&self) {
        self.restock();
        let free = {
            let mut lists = self.lists.lock();
            std::mem::take(&mut lists.free)
        };
        self.total.fetch_sub(free.len(), Ordering::Relaxed);
        debug!("pool '{}': reclaimed {}, {} still out", self.name,
               free.len(), self.in_use());
    }

    /// Descriptors acquired and neither released nor reclaimed.
    pub fn in_use(&self) -> usize {
        let lists = self.lists.lock();
        self.total.load(Ordering::Relaxed) - lists.free.len() - lists.pending.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Restock closure for registration with a progress thread.
    pub fn restocker(self: &Arc<Self>) -> Box<dyn Fn() + Send + Sync> {
        let pool = Arc::clone(self);
        Box::new(move || pool.restock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Item {
        resets: usize,
        dirty: bool,
        poison: Arc<AtomicBool>,
    }

    impl Poolable for Item {
        type Seed = Arc<AtomicBool>;

        fn create(seed: &Self::Seed) -> Option<Self> {
            Some(Item {
                resets: 0,
                dirty: false,
                poison: seed.clone(),
            })
        }

        fn reset(&mut self) -> bool {
            self.resets += 1;
            self.dirty = false;
            true
        }

        fn clean(&mut self) -> bool {
            !self.poison.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn acquire_release_restock_accounting() {
        let poison = Arc::new(AtomicBool::new(false));
        let pool: Arc<Pool<Item>> = Pool::new("test", poison.clone());

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        // Released but not restocked entries still count as outstanding
        // relative to the free list.
        assert_eq!(pool.in_use(), 1);

        pool.restock();
        let c = pool.acquire().unwrap();
        // The recycled entry was reset a second time.
        assert_eq!(c.resets, 2);
        assert_eq!(pool.in_use(), 2);

        pool.release(b);
        pool.release(c);
        pool.reclaim();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn failed_clean_destroys_entry() {
        let poison = Arc::new(AtomicBool::new(false));
        let pool: Arc<Pool<Item>> = Pool::new("test", poison.clone());
        let a = pool.acquire().unwrap();
        poison.store(true, Ordering::Relaxed);
        pool.release(a);
        pool.restock();
        // Entry was destroyed rather than recycled.
        assert_eq!(pool.in_use(), 0);
        poison.store(false, Ordering::Relaxed);
        let b = pool.acquire().unwrap();
        assert_eq!(b.resets, 1);
    }
}
