//! On-disk formats: the frame index ("map") file and cache file naming.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Cache format version. Bumping it orphans every file written before.
pub const CACHE_VERSION: u32 = 1;

/// Magic bytes identifying a frame index file.
pub const INDEX_MAGIC: &[u8; 4] = b"LTFM";

/// Binary layout version of the index file itself.
pub const INDEX_FORMAT_VERSION: u16 = 1;

const FLAG_FINISHED: u16 = 1;

/// Compression type for frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    /// No compression (raw frame bytes).
    None = 0,
    /// LZ4 block compression.
    Lz4 = 1,
}

impl Default for CompressionType {
    fn default() -> Self {
        if cfg!(feature = "lz4") {
            CompressionType::Lz4
        } else {
            CompressionType::None
        }
    }
}

/// Location of one frame inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Byte offset from start of the data file.
    pub offset: u64,
    /// Compressed size in bytes.
    pub length: u64,
    /// Whether the whole sequence had been finalized when this entry was last written.
    pub finished: bool,
}

impl FrameEntry {
    /// Size of one serialized entry including its frame number.
    pub const SIZE: usize = 21;

    fn write_to<W: Write>(&self, frame: u32, w: &mut W) -> io::Result<()> {
        w.write_all(&frame.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.length.to_le_bytes())?;
        w.write_all(&[self.finished as u8])?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<(u32, Self)> {
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        let mut buf1 = [0u8; 1];

        r.read_exact(&mut buf4)?;
        let frame = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf8)?;
        let offset = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf8)?;
        let length = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf1)?;
        let finished = buf1[0] != 0;

        if length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Zero-length entry for frame {frame}"),
            ));
        }

        Ok((
            frame,
            Self {
                offset,
                length,
                finished,
            },
        ))
    }
}

/// Frame number to data-file range map plus playback metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameIndex {
    pub entries: HashMap<u32, FrameEntry>,
    pub fps: u32,
    pub start_frame: u32,
    pub end_frame: u32,
    pub finished: bool,
}

impl FrameIndex {
    /// Header size: Magic(4) + Version(2) + Flags(2) + Fps(4) + Start(4) + End(4) + Count(4).
    pub const HEADER_SIZE: usize = 24;

    /// Set playback metadata. Expected once per animation, before any frame is written.
    pub fn initialize(&mut self, fps: u32, start_frame: u32, end_frame: u32) {
        self.fps = fps;
        self.start_frame = start_frame;
        self.end_frame = end_frame;
    }

    #[inline]
    pub fn get(&self, frame: u32) -> Option<&FrameEntry> {
        self.entries.get(&frame)
    }

    #[inline]
    pub fn contains(&self, frame: u32) -> bool {
        self.entries.contains_key(&frame)
    }

    /// Update the sequence-level flag; entering the finished state stamps every entry.
    pub fn set_finished(&mut self, finished: bool) {
        if finished && !self.finished {
            for entry in self.entries.values_mut() {
                entry.finished = true;
            }
        }
        self.finished = finished;
    }

    /// Sum of all recorded frame lengths.
    pub fn stored_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.length).sum()
    }

    /// Write the index to output.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let flags = if self.finished { FLAG_FINISHED } else { 0 };
        w.write_all(INDEX_MAGIC)?;
        w.write_all(&INDEX_FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&flags.to_le_bytes())?;
        w.write_all(&self.fps.to_le_bytes())?;
        w.write_all(&self.start_frame.to_le_bytes())?;
        w.write_all(&self.end_frame.to_le_bytes())?;
        w.write_all(&(self.entries.len() as u32).to_le_bytes())?;

        let mut frames: Vec<_> = self.entries.iter().collect();
        frames.sort_unstable_by_key(|(frame, _)| **frame);
        for (&frame, entry) in frames {
            entry.write_to(frame, w)?;
        }
        Ok(())
    }

    /// Read an index from input.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid frame index magic bytes",
            ));
        }

        let mut buf2 = [0u8; 2];
        let mut buf4 = [0u8; 4];

        r.read_exact(&mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != INDEX_FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported frame index version: {}", version),
            ));
        }

        r.read_exact(&mut buf2)?;
        let flags = u16::from_le_bytes(buf2);

        r.read_exact(&mut buf4)?;
        let fps = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let start_frame = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let end_frame = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let count = u32::from_le_bytes(buf4) as usize;

        let mut entries = HashMap::with_capacity(count.min(4096));
        for _ in 0..count {
            let (frame, entry) = FrameEntry::read_from(r)?;
            entries.insert(frame, entry);
        }

        Ok(Self {
            entries,
            fps,
            start_frame,
            end_frame,
            finished: flags & FLAG_FINISHED != 0,
        })
    }

    /// Load an index file. A missing or unreadable file yields an empty index.
    pub fn load(path: &Path) -> Self {
        let result = File::open(path).and_then(|file| Self::read_from(&mut BufReader::new(file)));
        match result {
            Ok(index) => index,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Discarding unreadable frame index {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Atomically replace the index file at `path`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp = temp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut writer)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })?;
        debug!(
            "Saved frame index {} ({} frames)",
            path.display(),
            self.entries.len()
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Which half of a cache file pair a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Map,
    Data,
}

impl FileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Map => "map",
            FileKind::Data => "data",
        }
    }

    pub fn sibling(self) -> Self {
        match self {
            FileKind::Map => FileKind::Data,
            FileKind::Data => FileKind::Map,
        }
    }
}

/// Encoding of the frames inside a data file, as named in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecTag {
    pub compression: CompressionType,
    pub delta: bool,
}

impl CodecTag {
    pub fn as_str(self) -> &'static str {
        match (self.compression, self.delta) {
            (CompressionType::Lz4, false) => "lz4",
            (CompressionType::Lz4, true) => "lz4xor",
            (CompressionType::None, false) => "raw",
            (CompressionType::None, true) => "rawxor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (compression, delta) = match s {
            "lz4" => (CompressionType::Lz4, false),
            "lz4xor" => (CompressionType::Lz4, true),
            "raw" => (CompressionType::None, false),
            "rawxor" => (CompressionType::None, true),
            _ => return None,
        };
        Some(Self { compression, delta })
    }
}

/// Parsed form of `<key>-v<version>-<codec>-bs<size>-lt<secs>-<map|data>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheFileName {
    pub cache_key: String,
    pub version: u32,
    pub codec: CodecTag,
    pub buffer_size: usize,
    pub live_time_secs: u64,
    pub kind: FileKind,
}

impl CacheFileName {
    /// Name without the trailing `-map` / `-data`.
    pub fn stem(&self) -> String {
        format!(
            "{}-v{}-{}-bs{}-lt{}",
            self.cache_key,
            self.version,
            self.codec.as_str(),
            self.buffer_size,
            self.live_time_secs
        )
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}", self.stem(), self.kind.suffix())
    }

    pub fn with_kind(&self, kind: FileKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Parse a file name. Cache keys may contain `-`, so fields are taken from the right.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.rsplitn(6, '-');
        let kind = match parts.next()? {
            "map" => FileKind::Map,
            "data" => FileKind::Data,
            _ => return None,
        };
        let live_time_secs = parts.next()?.strip_prefix("lt")?.parse().ok()?;
        let buffer_size = parts.next()?.strip_prefix("bs")?.parse().ok()?;
        let codec = CodecTag::parse(parts.next()?)?;
        let version = parts.next()?.strip_prefix('v')?.parse().ok()?;
        let cache_key = parts.next()?;
        if cache_key.is_empty() {
            return None;
        }
        Some(Self {
            cache_key: cache_key.to_string(),
            version,
            codec,
            buffer_size,
            live_time_secs,
            kind,
        })
    }
}

/// Resolved paths of one store's file pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePaths {
    pub map: PathBuf,
    pub data: PathBuf,
}

impl StorePaths {
    pub fn new(dir: &Path, name: &CacheFileName) -> Self {
        Self {
            map: dir.join(name.with_kind(FileKind::Map).file_name()),
            data: dir.join(name.with_kind(FileKind::Data).file_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn sample_index() -> FrameIndex {
        let mut index = FrameIndex::default();
        index.initialize(30, 0, 59);
        index.entries.insert(
            0,
            FrameEntry {
                offset: 0,
                length: 120,
                finished: false,
            },
        );
        index.entries.insert(
            1,
            FrameEntry {
                offset: 120,
                length: 64,
                finished: false,
            },
        );
        index
    }

    #[test]
    fn test_index_roundtrip() {
        let mut index = sample_index();
        index.set_finished(true);

        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FrameIndex::HEADER_SIZE + 2 * FrameEntry::SIZE);

        let decoded = FrameIndex::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, index);
        assert!(decoded.finished);
        assert!(decoded.entries.values().all(|e| e.finished));
    }

    #[test]
    fn test_set_finished_stamps_entries() {
        let mut index = sample_index();
        index.set_finished(true);
        assert!(index.entries.values().all(|e| e.finished));
        assert_eq!(index.stored_bytes(), 184);
    }

    #[test]
    fn test_load_missing_or_corrupt_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-map");
        assert_eq!(FrameIndex::load(&path), FrameIndex::default());

        fs::write(&path, b"LTFM\x01\x00garbage").unwrap();
        assert_eq!(FrameIndex::load(&path), FrameIndex::default());

        fs::write(&path, b"not an index at all").unwrap();
        assert_eq!(FrameIndex::load(&path), FrameIndex::default());
    }

    #[test]
    fn test_save_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anim-map");

        let index = sample_index();
        index.save(&path).unwrap();
        assert_eq!(FrameIndex::load(&path), index);

        let mut smaller = FrameIndex::default();
        smaller.initialize(60, 1, 2);
        smaller.save(&path).unwrap();
        assert_eq!(FrameIndex::load(&path), smaller);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = CacheFileName {
            cache_key: "animation-0-42-fitz2".to_string(),
            version: CACHE_VERSION,
            codec: CodecTag {
                compression: CompressionType::Lz4,
                delta: false,
            },
            buffer_size: 4096,
            live_time_secs: 3600,
            kind: FileKind::Map,
        };
        let file_name = name.file_name();
        assert_eq!(file_name, "animation-0-42-fitz2-v1-lz4-bs4096-lt3600-map");
        assert_eq!(CacheFileName::parse(&file_name), Some(name.clone()));

        let data = name.with_kind(FileKind::Data).file_name();
        assert_eq!(
            CacheFileName::parse(&data).map(|n| n.kind),
            Some(FileKind::Data)
        );
    }

    #[test]
    fn test_file_name_rejects_garbage() {
        for name in [
            "notes.txt",
            "anim-v1-lz4-bs4096-lt3600-map.tmp",
            "anim-v1-zstd-bs4096-lt3600-map",
            "anim-vX-lz4-bs4096-lt3600-data",
            "-v1-lz4-bs4096-lt3600-data",
            "v1-lz4-bs4096-lt3600-data",
        ] {
            assert_eq!(CacheFileName::parse(name), None, "{name}");
        }
    }
}
