//! Serial execution context for a frame store.
//!
//! Every store runs on its own worker thread fed by an unbounded channel.
//! Jobs run in submission order, so offsets in the data file are always
//! allocated by exactly one thread and never race.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded, unbounded};
use log::{debug, warn};

use super::store::{FrameStore, StoreError};

type Job = Box<dyn FnOnce(&mut FrameStore) + Send>;

/// Handle to a store's worker thread.
///
/// Dropping the queue lets already-submitted jobs finish, then drops the
/// store (persisting its index) and joins the worker. A queue dropped from
/// inside one of its own jobs is not joined.
pub struct StoreQueue {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    label: String,
}

impl StoreQueue {
    /// Move `store` onto a new worker thread.
    pub fn spawn(store: FrameStore) -> Result<Self, StoreError> {
        Self::spawn_with_exit(store, || ())
    }

    /// Like [`spawn`](Self::spawn), running `on_exit` on the worker once
    /// the store has been dropped.
    pub fn spawn_with_exit<F>(store: FrameStore, on_exit: F) -> Result<Self, StoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        let label = store
            .paths()
            .map
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (tx, rx) = unbounded::<Job>();

        let handle = thread::Builder::new()
            .name(format!("lotcache-{}", label))
            .spawn(move || {
                let mut store = store;
                for job in rx {
                    job(&mut store);
                }
                drop(store);
                on_exit();
            })?;

        debug!("Started store worker for {}", label);
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            label,
        })
    }

    /// Queue a job without waiting for it.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce(&mut FrameStore) + Send + 'static,
    {
        if let Some(tx) = &self.tx
            && tx.send(Box::new(job)).is_err()
        {
            warn!("Store worker for {} has exited, dropping job", self.label);
        }
    }

    /// Run a job on the worker and wait for its result.
    pub fn sync<F, R>(&self, job: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut FrameStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.dispatch(move |store| {
            let _ = reply_tx.send(job(store));
        });
        reply_rx.recv().map_err(|_| StoreError::WorkerGone)
    }

    /// Whether the caller is running on this queue's worker.
    pub fn on_worker(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    /// Wait until every job submitted before this call has run.
    pub fn flush(&self) {
        let _ = self.sync(|_| ());
    }
}

impl Drop for StoreQueue {
    fn drop(&mut self) {
        self.tx = None;
        if self.on_worker() {
            // Dropped from one of its own jobs; the worker exits after it.
            debug!("Store worker for {} released itself", self.label);
            return;
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Store worker for {} panicked", self.label);
        }
        debug!("Stopped store worker for {}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::format::{
        CacheFileName, CodecTag, CompressionType, FileKind, FrameIndex, StorePaths,
    };
    use tempfile::tempdir;

    fn paths(dir: &std::path::Path) -> StorePaths {
        let name = CacheFileName {
            cache_key: "queue".to_string(),
            version: 1,
            codec: CodecTag {
                compression: CompressionType::None,
                delta: false,
            },
            buffer_size: 8,
            live_time_secs: 60,
            kind: FileKind::Map,
        };
        StorePaths::new(dir, &name)
    }

    #[test]
    fn test_jobs_run_in_order() {
        let dir = tempdir().unwrap();
        let queue = StoreQueue::spawn(FrameStore::open(paths(dir.path()))).unwrap();

        for frame in 0..32u32 {
            queue.dispatch(move |store| {
                store.write_frame(frame, &[frame as u8; 8]).unwrap();
            });
        }
        let offsets = queue
            .sync(|store| {
                (0..32u32)
                    .map(|f| store.index().get(f).map(|e| e.offset))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        let expected: Vec<_> = (0..32u64).map(|f| Some(f * 8)).collect();
        assert_eq!(offsets, expected);
    }

    #[test]
    fn test_drop_persists_index() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        {
            let queue = StoreQueue::spawn(FrameStore::open(paths.clone())).unwrap();
            queue.dispatch(|store| {
                store.initialize(30, 0, 1);
                store.write_frame(0, &[1; 8]).unwrap();
            });
        }
        let index = FrameIndex::load(&paths.map);
        assert_eq!(index.fps, 30);
        assert!(index.contains(0));
    }

    #[test]
    fn test_exit_hook_runs_after_store_is_saved() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let map = paths.map.clone();
        let (saved_tx, saved_rx) = bounded(1);

        let queue = StoreQueue::spawn_with_exit(FrameStore::open(paths), move || {
            let _ = saved_tx.send(FrameIndex::load(&map).contains(3));
        })
        .unwrap();
        queue.dispatch(|store| store.write_frame(3, &[3; 8]).unwrap());
        drop(queue);
        assert_eq!(saved_rx.try_recv(), Ok(true));
    }
}
