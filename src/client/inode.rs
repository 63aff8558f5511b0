//! Client inode table.
//!
//! Every entry the kernel has been told about is held here, keyed by
//! inode number. The reference count mirrors the kernel's lookup count
//! plus one per child entry that names this inode as parent; when it
//! reaches zero the entry leaves the table immediately and its GAH is
//! closed on the server. The cached stat is used for the inode number
//! and file type only; nothing else is trusted across time.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::gah::Gah;
use crate::proto::wire::WireStat;

pub const ROOT_INO: u64 = 1;

pub struct InodeEntry {
    pub ino: u64,
    gah: Mutex<Gah>,
    pub stat: Mutex<WireStat>,
    /// Basename at the time the entry was created; advisory only.
    pub name: OsString,
    /// Parent inode at creation time.  Holds one table reference.
    pub parent: u64,
    refs: AtomicU64,
}

impl InodeEntry {
    pub fn new(gah: Gah, stat: WireStat, name: &OsStr, parent: u64) -> Arc<InodeEntry> {
        Arc::new(InodeEntry {
            ino: stat.ino,
            gah: Mutex::new(gah),
            stat: Mutex::new(stat),
            name: name.to_os_string(),
            parent,
            refs: AtomicU64::new(1),
        })
    }

    pub fn gah(&self) -> Gah {
        *self.gah.lock()
    }

    pub fn set_gah(&self, gah: Gah) {
        *self.gah.lock() = gah;
    }

    pub fn refs(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct InodeTable {
    map: RwLock<HashMap<u64, Arc<InodeEntry>>>,
}

/// What `find_insert` decided about a freshly-built entry.
pub enum Inserted {
    /// Ours went in.
    New(Arc<InodeEntry>),
    /// A racing sibling got there first; its entry gained our kernel
    /// reference and the caller must close the GAH it minted.
    Existing { winner: Arc<InodeEntry>, lost_gah: Gah },
}

impl InodeTable {
    /// GAH for `ino`, or None if the kernel knows an inode we do not.
    pub fn find_gah(&self, ino: u64) -> Option<Gah> {
        self.map.read().get(&ino).map(|entry| entry.gah())
    }

    pub fn get(&self, ino: u64) -> Option<Arc<InodeEntry>> {
        self.map.read().get(&ino).cloned()
    }

    /// Take an extra reference for a child entry being created.
    pub fn ref_parent(&self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        match self.map.read().get(&ino) {
            Some(entry) => {
                entry.refs.fetch_add(1, Ordering::AcqRel);
            }
            None => warn!("no table entry for parent inode {ino}"),
        }
    }

    /// Insert a freshly-built entry unless a racing lookup for the same
    /// inode already published one.
    pub fn find_insert(&self, entry: Arc<InodeEntry>) -> Inserted {
        let mut map = self.map.write();
        match map.get(&entry.ino) {
            Some(existing) => {
                existing.refs.fetch_add(1, Ordering::AcqRel);
                debug!("lost insert race for inode {}", entry.ino);
                Inserted::Existing {
                    winner: Arc::clone(existing),
                    lost_gah: entry.gah(),
                }
            }
            None => {
                map.insert(entry.ino, Arc::clone(&entry));
                Inserted::New(entry)
            }
        }
    }

    /// Drop `count` references.  Returns the entries that reached zero
    /// and were removed, the forgotten inode first, then any parents the
    /// cascade released: their GAHs must be closed by the caller.
    pub fn forget(&self, ino: u64, count: u64) -> Vec<Arc<InodeEntry>> {
        let mut released = Vec::new();
        let mut next = Some((ino, count));
        while let Some((ino, count)) = next.take() {
            if ino == ROOT_INO {
                break;
            }
            let removed = {
                let mut map = self.map.write();
                let Some(entry) = map.get(&ino) else {
                    warn!("forget of unknown inode {ino}");
                    break;
                };
                let old = entry.refs.fetch_sub(count, Ordering::AcqRel);
                if old > count {
                    break;
                }
                map.remove(&ino)
            };
            if let Some(entry) = removed {
                debug!("inode {} released, closing {}", entry.ino, entry.gah());
                if entry.parent != 0 {
                    next = Some((entry.parent, 1));
                }
                released.push(entry);
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Drain everything at projection teardown.
    pub fn drain(&self) -> Vec<Arc<InodeEntry>> {
        self.map.write().drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_for(ino: u64) -> WireStat {
        WireStat {
            ino,
            mode: libc::S_IFREG | 0o644,
            ..WireStat::default()
        }
    }

    fn gah_for(fid: u32) -> Gah {
        Gah::assemble(1, 0, 0, fid)
    }

    #[test]
    fn insert_find_forget() {
        let table = InodeTable::default();
        let entry = InodeEntry::new(gah_for(1), stat_for(10), OsStr::new("f"), ROOT_INO);
        let Inserted::New(entry) = table.find_insert(entry) else {
            panic!("insert should win");
        };
        assert_eq!(table.find_gah(10), Some(entry.gah()));
        // A refcount of one means one forget releases it.
        let released = table.forget(10, 1);
        assert_eq!(released.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn losing_race_reports_stale_gah() {
        let table = InodeTable::default();
        let first = InodeEntry::new(gah_for(1), stat_for(10), OsStr::new("f"), ROOT_INO);
        let Inserted::New(first) = table.find_insert(first) else {
            panic!("insert should win");
        };
        let second = InodeEntry::new(gah_for(2), stat_for(10), OsStr::new("f"), ROOT_INO);
        let Inserted::Existing { winner, lost_gah } = table.find_insert(second) else {
            panic!("second insert should lose");
        };
        assert!(Arc::ptr_eq(&winner, &first));
        assert_eq!(lost_gah, gah_for(2));
        // The winner carries both kernel references now.
        assert_eq!(first.refs(), 2);
        assert!(table.forget(10, 2).len() == 1);
    }

    #[test]
    fn parent_released_by_cascade() {
        let table = InodeTable::default();
        let dir = InodeEntry::new(
            gah_for(1),
            WireStat {
                ino: 5,
                mode: libc::S_IFDIR | 0o755,
                ..WireStat::default()
            },
            OsStr::new("d"),
            ROOT_INO,
        );
        let Inserted::New(dir) = table.find_insert(dir) else {
            panic!()
        };
        // Child creation takes a parent reference.
        table.ref_parent(5);
        let child = InodeEntry::new(gah_for(2), stat_for(6), OsStr::new("c"), 5);
        let Inserted::New(_) = table.find_insert(child) else {
            panic!()
        };
        assert_eq!(dir.refs(), 2);

        // Kernel forgets the directory: still pinned by the child.
        assert!(table.forget(5, 1).is_empty());
        assert_eq!(table.len(), 2);

        // Forgetting the child releases both.
        let released = table.forget(6, 1);
        assert_eq!(released.len(), 2);
        assert!(table.is_empty());
    }
}
