//! Background removal of expired cache files.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, info, warn};

use super::format::CacheFileName;
use crate::schema::CacheConfig;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files deleted because their lifetime elapsed.
    pub expired: usize,
    /// Files deleted because their name isn't a current cache file.
    pub orphaned: usize,
    /// Cache files left in place.
    pub retained: usize,
    /// Deletions that failed.
    pub failed: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} expired, {} orphaned, {} retained, {} failed",
            self.expired, self.orphaned, self.retained, self.failed
        )
    }
}

/// Delete expired and foreign files from `dir`.
///
/// A file pair expires when the modification time of either half plus the
/// lifetime encoded in its name lies before `now`; both halves go together.
/// Files that don't parse as cache names, or carry another `version`, are
/// deleted outright. Subdirectories are left alone.
pub fn sweep(dir: &Path, version: u32, now: SystemTime) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let mut pairs: HashMap<String, (Vec<PathBuf>, bool)> = HashMap::new();

    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();

        let parsed = entry
            .file_name()
            .to_str()
            .and_then(CacheFileName::parse)
            .filter(|parsed| parsed.version == version);
        let Some(parsed) = parsed else {
            debug!("Removing orphaned cache file {}", path.display());
            if remove(&path, &mut report) {
                report.orphaned += 1;
            }
            continue;
        };

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .is_ok_and(|modified| {
                // A lifetime past the end of representable time never expires.
                modified
                    .checked_add(Duration::from_secs(parsed.live_time_secs))
                    .is_some_and(|deadline| deadline < now)
            });
        let pair = pairs.entry(parsed.stem()).or_default();
        pair.0.push(path);
        pair.1 |= expired;
    }

    for (stem, (paths, expired)) in pairs {
        if !expired {
            report.retained += paths.len();
            continue;
        }
        debug!("Removing expired cache files {}", stem);
        for path in paths {
            if remove(&path, &mut report) {
                report.expired += 1;
            }
        }
    }

    Ok(report)
}

fn remove(path: &Path, report: &mut SweepReport) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            report.failed += 1;
            false
        }
    }
}

/// Periodic sweeper running on its own thread.
///
/// Sweeps once on start, then every `interval`, until dropped.
pub struct Evictor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Evictor {
    pub fn spawn(dir: PathBuf, version: u32, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("lotcache-evictor".to_string())
            .spawn(move || {
                loop {
                    match sweep(&dir, version, SystemTime::now()) {
                        Ok(report) => info!("Swept {}: {}", dir.display(), report),
                        Err(e) => warn!("Sweep of {} failed: {}", dir.display(), e),
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Sweep `config.cache_dir` every `config.sweep_interval()`.
    pub fn from_config(config: &CacheConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Self::spawn(
            config.cache_dir.clone(),
            config.version,
            config.sweep_interval(),
        )
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::format::{CACHE_VERSION, CodecTag, CompressionType, FileKind};
    use std::time::Instant;
    use tempfile::tempdir;

    fn name(key: &str, live_time_secs: u64, kind: FileKind) -> String {
        CacheFileName {
            cache_key: key.to_string(),
            version: CACHE_VERSION,
            codec: CodecTag {
                compression: CompressionType::Lz4,
                delta: false,
            },
            buffer_size: 4096,
            live_time_secs,
            kind,
        }
        .file_name()
    }

    fn write_pair(dir: &Path, key: &str, live_time_secs: u64) -> (PathBuf, PathBuf) {
        let map = dir.join(name(key, live_time_secs, FileKind::Map));
        let data = dir.join(name(key, live_time_secs, FileKind::Data));
        fs::write(&map, b"map").unwrap();
        fs::write(&data, b"data").unwrap();
        (map, data)
    }

    #[test]
    fn test_expired_pair_removed_live_pair_kept() {
        let dir = tempdir().unwrap();
        let (old_map, old_data) = write_pair(dir.path(), "short", 60);
        let (new_map, new_data) = write_pair(dir.path(), "long", 3_600);

        let later = SystemTime::now() + Duration::from_secs(600);
        let report = sweep(dir.path(), CACHE_VERSION, later).unwrap();

        assert!(!old_map.exists());
        assert!(!old_data.exists());
        assert!(new_map.exists());
        assert!(new_data.exists());
        assert_eq!(report.expired, 2);
        assert_eq!(report.retained, 2);
        assert_eq!(report.orphaned, 0);
    }

    #[test]
    fn test_expired_half_takes_sibling() {
        let dir = tempdir().unwrap();
        let (map, data) = write_pair(dir.path(), "half", 60);
        let stale = SystemTime::now() - Duration::from_secs(120);
        fs::File::options()
            .write(true)
            .open(&data)
            .unwrap()
            .set_modified(stale)
            .unwrap();

        let report = sweep(dir.path(), CACHE_VERSION, SystemTime::now()).unwrap();
        assert!(!map.exists());
        assert!(!data.exists());
        assert_eq!(report.expired, 2);
        assert_eq!(report.retained, 0);
    }

    #[test]
    fn test_huge_live_time_is_retained() {
        let dir = tempdir().unwrap();
        let (map, data) = write_pair(dir.path(), "forever", u64::MAX);

        let later = SystemTime::now() + Duration::from_secs(86_400);
        let report = sweep(dir.path(), CACHE_VERSION, later).unwrap();
        assert!(map.exists());
        assert!(data.exists());
        assert_eq!(report.retained, 2);
        assert_eq!(report.expired, 0);
    }

    #[test]
    fn test_orphans_and_old_versions_removed() {
        let dir = tempdir().unwrap();
        let junk = dir.path().join("leftover.tmp");
        fs::write(&junk, b"x").unwrap();
        let old = dir.path().join("animation-1-1-v0-lz4-bs4096-lt3600-map");
        fs::write(&old, b"x").unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let (map, _) = write_pair(dir.path(), "fresh", 3_600);

        let report = sweep(dir.path(), CACHE_VERSION, SystemTime::now()).unwrap();
        assert!(!junk.exists());
        assert!(!old.exists());
        assert!(nested.exists());
        assert!(map.exists());
        assert_eq!(report.orphaned, 2);
        assert_eq!(report.retained, 2);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(sweep(&dir.path().join("absent"), CACHE_VERSION, SystemTime::now()).is_err());
    }

    #[test]
    fn test_evictor_sweeps_on_start() {
        let dir = tempdir().unwrap();
        let junk = dir.path().join("garbage");
        fs::write(&junk, b"x").unwrap();

        let evictor =
            Evictor::spawn(dir.path().to_path_buf(), CACHE_VERSION, Duration::from_secs(3600))
                .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while junk.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        drop(evictor);
        assert!(!junk.exists());
    }

    fn wait_for_removal(path: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        !path.exists()
    }

    #[test]
    fn test_evictor_sweeps_again_after_interval() {
        let dir = tempdir().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.sweep_interval_secs = 1;

        let first = dir.path().join("first");
        fs::write(&first, b"x").unwrap();
        let evictor = Evictor::from_config(&config).unwrap();
        assert!(wait_for_removal(&first));

        let second = dir.path().join("second");
        fs::write(&second, b"x").unwrap();
        assert!(wait_for_removal(&second));
        drop(evictor);
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.sweep_interval_secs = 0;
        let err = Evictor::from_config(&config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
