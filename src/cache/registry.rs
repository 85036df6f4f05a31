//! Process-wide table of live frame stores.
//!
//! Each store is reference counted by the number of [`StoreLease`]s handed
//! out for it. When the last lease goes, the slot turns into a closing
//! marker and the store's worker is joined outside the table lock. Acquirers
//! of the same files wait on the marker, so they always see the persisted
//! index, while other keys proceed untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::debug;
use parking_lot::Mutex;

use super::format::StorePaths;
use super::queue::StoreQueue;
use super::store::{FrameStore, StoreError};

static GLOBAL: LazyLock<Arc<CacheRegistry>> = LazyLock::new(CacheRegistry::new);

enum Slot {
    Live {
        queue: Arc<StoreQueue>,
        holders: usize,
    },
    /// Worker is shutting down. Removing the slot drops `_signal`, which
    /// wakes everyone blocked on `done`.
    Closing {
        done: Receiver<()>,
        _signal: Sender<()>,
    },
}

/// Table of live stores keyed by their index file path.
#[derive(Default)]
pub struct CacheRegistry {
    stores: Mutex<HashMap<PathBuf, Slot>>,
}

impl CacheRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The registry shared by the whole process.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Share the live store for `paths`, opening it if nobody holds it.
    ///
    /// Blocks while a previous store for the same files is still closing.
    pub fn acquire(self: &Arc<Self>, paths: StorePaths) -> Result<StoreLease, StoreError> {
        let key = paths.map.clone();

        let queue = loop {
            let mut stores = self.stores.lock();
            match stores.get_mut(&key) {
                Some(Slot::Live { queue, holders }) => {
                    *holders += 1;
                    break Arc::clone(queue);
                }
                Some(Slot::Closing { done, .. }) => {
                    let done = done.clone();
                    drop(stores);
                    debug!("Waiting for frame store {} to close", key.display());
                    let _ = done.recv();
                }
                None => {
                    let registry = Arc::downgrade(self);
                    let exit_key = key.clone();
                    let store = FrameStore::open(paths.clone());
                    let queue = StoreQueue::spawn_with_exit(store, move || {
                        if let Some(registry) = registry.upgrade() {
                            registry.closed(&exit_key, None);
                        }
                    })?;
                    let queue = Arc::new(queue);
                    stores.insert(
                        key.clone(),
                        Slot::Live {
                            queue: Arc::clone(&queue),
                            holders: 1,
                        },
                    );
                    break queue;
                }
            }
        };

        Ok(StoreLease {
            registry: Arc::clone(self),
            key,
            queue: Some(queue),
        })
    }

    fn release(&self, key: &Path, queue: Arc<StoreQueue>) {
        drop(queue);

        let (last, done) = {
            let mut stores = self.stores.lock();
            let Some(Slot::Live { holders, .. }) = stores.get_mut(key) else {
                return;
            };
            *holders = holders.saturating_sub(1);
            if *holders > 0 {
                return;
            }
            let (signal, done) = bounded(0);
            let closing = Slot::Closing {
                done: done.clone(),
                _signal: signal,
            };
            match stores.insert(key.to_path_buf(), closing) {
                Some(Slot::Live { queue, .. }) => (queue, done),
                _ => return,
            }
        };

        // Joins the worker outside the lock. Its exit hook clears the slot
        // once the index is persisted; a worker that panicked never gets
        // there, so clear it here too.
        let joined = !last.on_worker();
        drop(last);
        if joined {
            self.closed(key, Some(&done));
        }
        debug!("Released frame store {}", key.display());
    }

    /// Drop the closing marker for `key`, waking waiting acquirers.
    ///
    /// With `marker`, only that exact marker is removed.
    fn closed(&self, key: &Path, marker: Option<&Receiver<()>>) {
        let mut stores = self.stores.lock();
        if let Some(Slot::Closing { done, .. }) = stores.get(key)
            && marker.is_none_or(|marker| marker.same_channel(done))
        {
            stores.remove(key);
        }
    }

    /// Number of stores currently open.
    pub fn live_stores(&self) -> usize {
        self.stores
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    /// Number of leases held on the store whose index lives at `map_path`.
    pub fn holders(&self, map_path: &Path) -> usize {
        match self.stores.lock().get(map_path) {
            Some(Slot::Live { holders, .. }) => *holders,
            _ => 0,
        }
    }
}

/// One holder's share of a live store.
pub struct StoreLease {
    registry: Arc<CacheRegistry>,
    key: PathBuf,
    queue: Option<Arc<StoreQueue>>,
}

impl StoreLease {
    pub fn queue(&self) -> Result<&StoreQueue, StoreError> {
        self.queue.as_deref().ok_or(StoreError::WorkerGone)
    }

    pub fn map_path(&self) -> &Path {
        &self.key
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            self.registry.release(&self.key, queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::format::{CacheFileName, CodecTag, CompressionType, FileKind, FrameIndex};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn paths(dir: &Path, key: &str) -> StorePaths {
        let name = CacheFileName {
            cache_key: key.to_string(),
            version: 1,
            codec: CodecTag {
                compression: CompressionType::None,
                delta: false,
            },
            buffer_size: 4,
            live_time_secs: 60,
            kind: FileKind::Map,
        };
        StorePaths::new(dir, &name)
    }

    #[test]
    fn test_same_paths_share_one_store() {
        let dir = tempdir().unwrap();
        let registry = CacheRegistry::new();
        let p = paths(dir.path(), "shared");

        let a = registry.acquire(p.clone()).unwrap();
        let b = registry.acquire(p.clone()).unwrap();
        assert_eq!(registry.live_stores(), 1);
        assert_eq!(registry.holders(&p.map), 2);
        assert!(std::ptr::eq(a.queue().unwrap(), b.queue().unwrap()));

        let other = registry.acquire(paths(dir.path(), "other")).unwrap();
        assert_eq!(registry.live_stores(), 2);

        drop(a);
        assert_eq!(registry.holders(&p.map), 1);
        drop(b);
        assert_eq!(registry.holders(&p.map), 0);
        assert_eq!(registry.live_stores(), 1);
        drop(other);
        assert_eq!(registry.live_stores(), 0);
    }

    #[test]
    fn test_last_release_persists_before_reacquire() {
        let dir = tempdir().unwrap();
        let registry = CacheRegistry::new();
        let p = paths(dir.path(), "persist");

        let lease = registry.acquire(p.clone()).unwrap();
        lease.queue().unwrap().dispatch(|store| {
            store.write_frame(0, &[1, 2, 3, 4]).unwrap();
            store.set_finished(true);
        });
        drop(lease);
        assert!(FrameIndex::load(&p.map).finished);

        let lease = registry.acquire(p).unwrap();
        let bytes = lease
            .queue()
            .unwrap()
            .sync(|store| store.read_frame(0))
            .unwrap()
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_closing_store_does_not_block_other_keys() {
        let dir = tempdir().unwrap();
        let registry = CacheRegistry::new();
        let slow = paths(dir.path(), "slow");

        let lease = registry.acquire(slow.clone()).unwrap();
        let (started_tx, started_rx) = bounded(1);
        lease.queue().unwrap().dispatch(move |store| {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(500));
            store.write_frame(0, &[9; 4]).unwrap();
            store.set_finished(true);
        });
        started_rx.recv().unwrap();

        let closer = thread::spawn(move || drop(lease));
        while registry.holders(&slow.map) != 0 {
            thread::yield_now();
        }

        let start = Instant::now();
        let other = registry.acquire(paths(dir.path(), "other")).unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
        drop(other);

        // Reacquiring the closing key waits for its index to be persisted.
        let lease = registry.acquire(slow.clone()).unwrap();
        assert!(lease.queue().unwrap().sync(|store| store.has_frame(0)).unwrap());
        closer.join().unwrap();
        assert!(FrameIndex::load(&slow.map).finished);
    }

    #[test]
    fn test_lease_dropped_on_its_own_worker() {
        let dir = tempdir().unwrap();
        let registry = CacheRegistry::new();
        let p = paths(dir.path(), "self");

        let lease = registry.acquire(p.clone()).unwrap();
        let (lease_tx, lease_rx) = bounded::<StoreLease>(1);
        let (done_tx, done_rx) = bounded(1);
        lease.queue().unwrap().dispatch(move |store| {
            store.write_frame(0, &[5; 4]).unwrap();
            drop(lease_rx.recv().unwrap());
            let _ = done_tx.send(());
        });
        lease_tx.send(lease).unwrap();
        done_rx.recv().unwrap();

        let lease = registry.acquire(p).unwrap();
        assert!(lease.queue().unwrap().sync(|store| store.has_frame(0)).unwrap());
        assert_eq!(registry.live_stores(), 1);
    }
}
