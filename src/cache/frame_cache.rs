//! Per-animation façade over a shared frame store.

use std::fs;
use std::sync::Arc;

use log::{debug, warn};

use super::codec::FrameCodec;
use super::format::{CacheFileName, FileKind, StorePaths};
use super::registry::{CacheRegistry, StoreLease};
use super::store::{FrameStore, StoreError, StoreStats};
use crate::schema::{Animation, AnimationKey, CacheConfig, CachePurpose};

/// Compressed on-disk frame cache for one animation.
///
/// Any number of `FrameCache`s may exist for the same animation; they share
/// one store and one worker. Writes are queued and return immediately; reads
/// block until the worker has served them. Failures never escape: a failed
/// write is dropped and a failed read is a miss.
///
/// ```ignore
/// let cache = FrameCache::open(&config, &animation)?;
/// cache.initialize(fps, start, end);
/// for frame in start..=end {
///     let raw = decoder.render(frame);
///     cache.add_frame(previous.as_deref(), &raw, frame);
///     previous = Some(raw);
/// }
/// cache.mark_finished();
/// ```
pub struct FrameCache {
    lease: StoreLease,
    codec: FrameCodec,
    buffer_size: usize,
}

impl FrameCache {
    /// Open the cache for `animation` in the process-wide registry.
    pub fn open(config: &CacheConfig, animation: &Animation) -> Result<Self, StoreError> {
        Self::open_in(&CacheRegistry::global(), config, animation)
    }

    /// Open the cache for `animation` in a specific registry.
    pub fn open_in(
        registry: &Arc<CacheRegistry>,
        config: &CacheConfig,
        animation: &Animation,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let codec = FrameCodec::new(config.compression, config.delta);
        let name = CacheFileName {
            cache_key: animation.cache_key.clone(),
            version: config.version,
            codec: codec.tag(),
            buffer_size: animation.buffer_size,
            live_time_secs: animation.live_time.as_secs(),
            kind: FileKind::Map,
        };

        fs::create_dir_all(&config.cache_dir)?;
        let lease = registry.acquire(StorePaths::new(&config.cache_dir, &name))?;

        Ok(Self {
            lease,
            codec,
            buffer_size: animation.buffer_size,
        })
    }

    /// Open a cache for `key` unless its purpose says not to cache.
    pub fn for_purpose(
        config: &CacheConfig,
        key: &AnimationKey,
        purpose: CachePurpose,
    ) -> Option<Self> {
        let live_time = purpose.live_time()?;
        let animation = Animation::from_key(key, live_time);
        Self::open(config, &animation)
            .inspect_err(|e| warn!("Frame cache unavailable for {}: {}", animation.cache_key, e))
            .ok()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Record fps and frame range. Expected once, before the first frame.
    pub fn initialize(&self, fps: u32, start_frame: u32, end_frame: u32) {
        if let Ok(queue) = self.lease.queue() {
            queue.dispatch(move |store| store.initialize(fps, start_frame, end_frame));
        }
    }

    /// Queue one decoded frame for compression and storage.
    ///
    /// `previous` is the raw frame shown before `current`; it is only used
    /// in delta mode and must be the same buffer later passed to
    /// [`read_frame`](Self::read_frame).
    pub fn add_frame(&self, previous: Option<&[u8]>, current: &[u8], frame: u32) {
        if current.len() != self.buffer_size {
            warn!(
                "Ignoring frame {} of {} bytes, cache expects {}",
                frame,
                current.len(),
                self.buffer_size
            );
            return;
        }
        let Ok(queue) = self.lease.queue() else {
            return;
        };

        let codec = self.codec;
        let current = current.to_vec();
        let previous = previous.filter(|_| codec.delta).map(<[u8]>::to_vec);

        queue.dispatch(move |store| {
            if store.has_frame(frame) {
                return;
            }
            let compressed = codec.encode(&current, previous.as_deref());
            if let Err(e) = store.write_frame(frame, &compressed) {
                warn!("Dropping frame {}: {}", frame, e);
            }
        });
    }

    /// Fetch and decode one frame. `None` on any miss.
    pub fn read_frame(&self, previous: Option<&[u8]>, frame: u32) -> Option<Vec<u8>> {
        match self.try_read_frame(previous, frame) {
            Ok(data) => Some(data),
            Err(StoreError::NotReady | StoreError::MissingFrame(_)) => None,
            Err(e) => {
                debug!("Frame {} miss: {}", frame, e);
                None
            }
        }
    }

    fn try_read_frame(&self, previous: Option<&[u8]>, frame: u32) -> Result<Vec<u8>, StoreError> {
        let compressed = self
            .lease
            .queue()?
            .sync(move |store| store.read_frame(frame))??;
        Ok(self.codec.decode(&compressed, previous, self.buffer_size)?)
    }

    /// Queue the transition to the finished state.
    pub fn mark_finished(&self) {
        if let Ok(queue) = self.lease.queue() {
            queue.dispatch(|store| store.set_finished(true));
        }
    }

    pub fn is_finished(&self) -> bool {
        self.query(|store| store.is_finished()).unwrap_or(false)
    }

    pub fn has_frame(&self, frame: u32) -> bool {
        self.query(move |store| store.has_frame(frame)).unwrap_or(false)
    }

    pub fn fps(&self) -> u32 {
        self.query(|store| store.fps()).unwrap_or(0)
    }

    pub fn start_frame(&self) -> u32 {
        self.query(|store| store.start_frame()).unwrap_or(0)
    }

    pub fn end_frame(&self) -> u32 {
        self.query(|store| store.end_frame()).unwrap_or(0)
    }

    pub fn stats(&self) -> Option<StoreStats> {
        self.query(|store| store.stats())
    }

    /// Block until all operations queued so far have completed.
    pub fn flush(&self) {
        if let Ok(queue) = self.lease.queue() {
            queue.flush();
        }
    }

    fn query<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&FrameStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.lease.queue().ok()?.sync(move |store| f(store)).ok()
    }
}
