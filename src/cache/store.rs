//! Frame store: one index file plus one append-only data file per animation.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use log::{debug, info, warn};

use super::codec::CodecError;
use super::format::{FrameEntry, FrameIndex, StorePaths};
use crate::schema::ConfigError;

/// Errors surfaced by store operations. None of these are fatal; callers treat them as misses.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Cache is not finished yet")]
    NotReady,
    #[error("Frame {0} is not cached")]
    MissingFrame(u32),
    #[error("Frame {frame} is corrupt: expected {expected} bytes, read {actual}")]
    Corrupt { frame: u32, expected: u64, actual: u64 },
    #[error("Refusing to cache empty frame {0}")]
    EmptyFrame(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Store worker is no longer running")]
    WorkerGone,
    #[error("Invalid cache configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Snapshot of a store's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Frames with an index entry.
    pub frame_count: usize,
    /// Total compressed bytes addressed by the index.
    pub stored_bytes: u64,
    pub finished: bool,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let average = if self.frame_count > 0 {
            self.stored_bytes / self.frame_count as u64
        } else {
            0
        };
        write!(
            f,
            "{} frames, {} bytes stored, {} bytes/frame avg ({})",
            self.frame_count,
            self.stored_bytes,
            average,
            if self.finished { "finished" } else { "filling" }
        )
    }
}

/// Owner of one animation's index and data file.
///
/// A store is not synchronized; all access goes through a single worker
/// (see [`super::StoreQueue`]). Read and write handles are never open at the
/// same time. The index is persisted when the store is dropped.
pub struct FrameStore {
    paths: StorePaths,
    index: FrameIndex,
    reader: Option<File>,
    writer: Option<File>,
    dirty: bool,
}

impl FrameStore {
    /// Open the store for a file pair, loading whatever index exists.
    pub fn open(paths: StorePaths) -> Self {
        let mut index = FrameIndex::load(&paths.map);
        if !index.entries.is_empty() && !paths.data.exists() {
            warn!(
                "Data file {} is missing, resetting index",
                paths.data.display()
            );
            index = FrameIndex::default();
        }

        touch(&paths.map);
        touch(&paths.data);

        info!(
            "Opened frame store {} ({} frames, finished: {})",
            paths.map.display(),
            index.entries.len(),
            index.finished
        );

        Self {
            paths,
            index,
            reader: None,
            writer: None,
            dirty: false,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn initialize(&mut self, fps: u32, start_frame: u32, end_frame: u32) {
        self.index.initialize(fps, start_frame, end_frame);
        self.dirty = true;
    }

    #[inline]
    pub fn has_frame(&self, frame: u32) -> bool {
        self.index.contains(frame)
    }

    pub fn fps(&self) -> u32 {
        self.index.fps
    }

    pub fn start_frame(&self) -> u32 {
        self.index.start_frame
    }

    pub fn end_frame(&self) -> u32 {
        self.index.end_frame
    }

    pub fn is_finished(&self) -> bool {
        self.index.finished
    }

    pub fn set_finished(&mut self, finished: bool) {
        if self.index.finished != finished {
            self.index.set_finished(finished);
            self.dirty = true;
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            frame_count: self.index.entries.len(),
            stored_bytes: self.index.stored_bytes(),
            finished: self.index.finished,
        }
    }

    /// Append a compressed frame. Frames already present are left untouched.
    pub fn write_frame(&mut self, frame: u32, bytes: &[u8]) -> Result<(), StoreError> {
        if self.index.contains(frame) {
            return Ok(());
        }
        if bytes.is_empty() {
            return Err(StoreError::EmptyFrame(frame));
        }

        let offset = match self.append(bytes) {
            Ok(offset) => offset,
            Err(e) => {
                self.writer = None;
                return Err(e.into());
            }
        };

        self.index.entries.insert(
            frame,
            FrameEntry {
                offset,
                length: bytes.len() as u64,
                finished: self.index.finished,
            },
        );
        self.dirty = true;
        debug!("Cached frame {} at {}+{}", frame, offset, bytes.len());
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        self.reader = None;
        let file = match self.writer.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.paths.data)?,
        };
        let writer = self.writer.insert(file);
        let offset = writer.seek(SeekFrom::End(0))?;
        writer.write_all(bytes)?;
        Ok(offset)
    }

    /// Read a compressed frame. Only allowed once the store is finished.
    ///
    /// A frame whose recorded range can't be read back in full is dropped
    /// from the index.
    pub fn read_frame(&mut self, frame: u32) -> Result<Vec<u8>, StoreError> {
        if !self.index.finished {
            return Err(StoreError::NotReady);
        }
        let entry = *self
            .index
            .get(frame)
            .ok_or(StoreError::MissingFrame(frame))?;

        let data = match self.read_range(entry) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                self.reader = None;
                return Err(e.into());
            }
        };

        if data.len() as u64 != entry.length {
            warn!(
                "Dropping corrupt frame {} from {}: expected {} bytes, read {}",
                frame,
                self.paths.data.display(),
                entry.length,
                data.len()
            );
            self.index.entries.remove(&frame);
            self.dirty = true;
            return Err(StoreError::Corrupt {
                frame,
                expected: entry.length,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    fn read_range(&mut self, entry: FrameEntry) -> io::Result<Vec<u8>> {
        self.writer = None;
        let file = match self.reader.take() {
            Some(file) => file,
            None => File::open(&self.paths.data)?,
        };
        let reader = self.reader.insert(file);
        reader.seek(SeekFrom::Start(entry.offset))?;

        let mut data = Vec::with_capacity(entry.length.min(1 << 24) as usize);
        reader.take(entry.length).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Persist the index if anything changed since it was loaded.
    pub fn persist(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.index.save(&self.paths.map)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Err(e) = self.persist() {
            warn!(
                "Failed to persist frame index {}: {}",
                self.paths.map.display(),
                e
            );
        }
    }
}

/// Refresh the modification time of an existing file.
fn touch(path: &Path) {
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = result
        && e.kind() != io::ErrorKind::NotFound
    {
        debug!("Could not touch {}: {}", path.display(), e);
    }
}
