//! Animation identity and the descriptor handed to the frame cache.

use std::fmt::Write as _;

/// How long a cache entry stays valid on disk after its last use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveTime {
    /// Stickers shown inline in a chat.
    Chat,
    /// Thumbnails and panels.
    Thumb,
    /// Full-screen effects.
    Effect,
    /// Arbitrary lifetime in seconds.
    Custom(u64),
}

impl LiveTime {
    pub fn as_secs(self) -> u64 {
        match self {
            LiveTime::Chat => 3_600,
            LiveTime::Thumb => 259_200,
            LiveTime::Effect => 241_920,
            LiveTime::Custom(secs) => secs,
        }
    }
}

/// Whether frames of an animation are cached at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePurpose {
    /// Always decode live.
    #[default]
    None,
    /// Cache compressed frames on disk for the given lifetime.
    Temporary(LiveTime),
}

impl CachePurpose {
    pub fn live_time(self) -> Option<LiveTime> {
        match self {
            CachePurpose::None => None,
            CachePurpose::Temporary(live_time) => Some(live_time),
        }
    }
}

/// Where the animation document comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnimationSource {
    /// Downloaded media file.
    Media { namespace: i32, id: i64 },
    /// Resource shipped with the application.
    Bundle(String),
}

/// A recolor applied to one layer key path before rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LottieColor {
    pub key_path: String,
    /// Packed `0xRRGGBBAA`.
    pub rgba: u32,
}

/// Identity of one animation asset together with its render configuration.
///
/// Two keys that compare equal render identical frames, so they may share
/// one cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnimationKey {
    pub source: AnimationSource,
    /// Size in points.
    pub width: u32,
    pub height: u32,
    /// Pixels per point.
    pub backing_scale: u32,
    /// Emoji skin tone modifier (1-5).
    pub fitz_modifier: Option<u8>,
    pub colors: Vec<LottieColor>,
}

impl AnimationKey {
    pub fn new(source: AnimationSource, width: u32, height: u32, backing_scale: u32) -> Self {
        Self {
            source,
            width,
            height,
            backing_scale,
            fitz_modifier: None,
            colors: Vec::new(),
        }
    }

    pub fn with_fitz_modifier(mut self, modifier: u8) -> Self {
        self.fitz_modifier = Some(modifier);
        self
    }

    pub fn with_colors(mut self, colors: Vec<LottieColor>) -> Self {
        self.colors = colors;
        self
    }

    /// Stable string naming this animation's cache files.
    pub fn cache_key(&self) -> String {
        let mut key = match &self.source {
            AnimationSource::Media { namespace, id } => match self.fitz_modifier {
                Some(fitz) => format!("animation-{namespace}-{id}-fitz{fitz}"),
                None => format!("animation-{namespace}-{id}"),
            },
            AnimationSource::Bundle(name) => name.clone(),
        };
        for (i, color) in self.colors.iter().enumerate() {
            if i > 0 {
                key.push(' ');
            }
            let _ = write!(key, "{}{:08x}", color.key_path, color.rgba);
        }
        sanitize_cache_key(&key)
    }

    /// Bytes in one decoded BGRA frame.
    pub fn buffer_size(&self) -> usize {
        let w = self.width as usize * self.backing_scale as usize;
        let h = self.height as usize * self.backing_scale as usize;
        w * h * 4
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so the key is a single path component.
pub fn sanitize_cache_key(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{sanitized}"),
        _ => sanitized,
    }
}

/// Descriptor the frame cache consumes for one animation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Animation {
    pub cache_key: String,
    /// Size of one decoded raw frame in bytes.
    pub buffer_size: usize,
    pub live_time: LiveTime,
}

impl Animation {
    pub fn new(cache_key: impl AsRef<str>, buffer_size: usize, live_time: LiveTime) -> Self {
        Self {
            cache_key: sanitize_cache_key(cache_key.as_ref()),
            buffer_size,
            live_time,
        }
    }

    pub fn from_key(key: &AnimationKey, live_time: LiveTime) -> Self {
        Self {
            cache_key: key.cache_key(),
            buffer_size: key.buffer_size(),
            live_time,
        }
    }
}
