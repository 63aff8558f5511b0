//! Per-projection operation counters, exported through the control
//! filesystem.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! projection_stats {
    ($($name:ident),* $(,)?) => {
        /// One counter per dispatched operation, plus byte totals.
        #[derive(Debug, Default)]
        pub struct ProjectionStats {
            $(pub $name: Counter,)*
        }

        impl ProjectionStats {
            /// Counter names and values, for control-fs registration.
            pub fn entries(&self) -> Vec<(&'static str, &Counter)> {
                vec![$((stringify!($name), &self.$name),)*]
            }
        }
    };
}

projection_stats! {
    lookup,
    forget,
    getattr,
    setattr,
    readlink,
    mkdir,
    rmdir,
    unlink,
    symlink,
    rename,
    opendir,
    readdir,
    closedir,
    open,
    create,
    release,
    read,
    write,
    fsync,
    statfs,
    ioctl,
    il_ioctl,
    read_bytes,
    write_bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expose_all_counters() {
        let stats = ProjectionStats::default();
        stats.read.inc();
        stats.read_bytes.add(3);
        let entries = stats.entries();
        let read = entries.iter().find(|(n, _)| *n == "read").unwrap();
        assert_eq!(read.1.get(), 1);
        let bytes = entries.iter().find(|(n, _)| *n == "read_bytes").unwrap();
        assert_eq!(bytes.1.get(), 3);
        assert!(entries.len() >= 20);
    }
}
