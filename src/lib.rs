//! lotcache - Persistent compressed frame cache for Lottie animation playback.
//!
//! Rendering a Lottie frame is expensive, and stickers loop the same frames
//! over and over. This crate stores each decoded frame, LZ4-compressed, in a
//! per-animation file pair so later playback sessions skip the decoder.
//!
//! # Architecture
//!
//! - `schema`: Configuration and animation descriptor types
//! - `cache`: Frame index, store, codec, shared registry and evictor
//!
//! # Example
//!
//! ```rust,no_run
//! use lotcache::{
//!     cache::FrameCache,
//!     schema::{Animation, CacheConfig, LiveTime},
//! };
//!
//! let config = CacheConfig::new("/tmp/lotcache");
//! let animation = Animation::new("animation-0-42", 4096, LiveTime::Chat);
//! let cache = FrameCache::open(&config, &animation).unwrap();
//!
//! cache.initialize(30, 0, 9);
//! for frame in 0..10 {
//!     let raw = vec![frame as u8; 4096];
//!     cache.add_frame(None, &raw, frame);
//! }
//! cache.mark_finished();
//!
//! let frame = cache.read_frame(None, 5);
//! assert_eq!(frame, Some(vec![5u8; 4096]));
//! ```

pub mod cache;
pub mod schema;

// Re-export commonly used types
pub use cache::{CacheRegistry, Evictor, FrameCache, StoreError};
pub use schema::{Animation, AnimationKey, CacheConfig, CachePurpose, LiveTime};
