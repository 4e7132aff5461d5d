use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

// See rfc8216 and https://developer.apple.com/documentation/http_live_streaming

/// Default `#EXT-X-TARGETDURATION` of a playlist without segments
pub const DEFAULT_TARGET_DURATION: u64 = 10;

/// `#EXT-X-VERSION` of the playlists written by the recorder
pub const PLAYLIST_VERSION: u32 = 3;

/// Value of the `#EXT-X-PLAYLIST-TYPE` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Vod,
    Event,
    Live,
}

impl fmt::Display for PlaylistType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaylistType::Vod => write!(f, "VOD"),
            PlaylistType::Event => write!(f, "EVENT"),
            PlaylistType::Live => write!(f, "LIVE"),
        }
    }
}

impl FromStr for PlaylistType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vod" => Ok(PlaylistType::Vod),
            "event" => Ok(PlaylistType::Event),
            "live" => Ok(PlaylistType::Live),
            other => Err(format!("Unknown playlist type '{}'", other)),
        }
    }
}

/// One `#EXTINF` entry
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub url: String,
    pub duration: f64,
    pub title: String,
}

/// Append-only HLS media playlist.
///
/// Entries are never removed or reordered; every render contains every
/// entry appended so far. `#EXT-X-ENDLIST` is always written because many
/// players ignore `#EXT-X-START`, which means players won't reload the file
/// while the recording keeps growing in storage.
#[derive(Debug, Clone)]
pub struct Playlist {
    version: u32,
    playlist_type: Option<PlaylistType>,
    default_target_duration: u64,
    entries: Vec<PlaylistEntry>,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new(PLAYLIST_VERSION, Some(PlaylistType::Vod))
    }
}

impl Playlist {
    pub fn new(version: u32, playlist_type: Option<PlaylistType>) -> Self {
        Self {
            version,
            playlist_type,
            default_target_duration: DEFAULT_TARGET_DURATION,
            entries: Vec::new(),
        }
    }

    /// Target duration written while the playlist is still empty
    pub fn with_default_target_duration(mut self, seconds: u64) -> Self {
        self.default_target_duration = seconds;
        self
    }

    pub fn append(&mut self, url: impl Into<String>, duration: f64, title: impl Into<String>) {
        self.entries.push(PlaylistEntry {
            url: url.into(),
            duration,
            title: title.into(),
        });
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest segment duration rounded up to whole seconds
    pub fn target_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.duration.ceil() as u64)
            .max()
            .unwrap_or(self.default_target_duration)
    }

    pub fn render(&self) -> String {
        let mut m3u8 = String::from("#EXTM3U\n");
        if let Some(playlist_type) = self.playlist_type {
            m3u8.push_str(&format!("#EXT-X-PLAYLIST-TYPE:{}\n", playlist_type));
        }
        m3u8.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration()));
        m3u8.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        m3u8.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        m3u8.push_str("#EXT-X-ENDLIST\n");
        for entry in &self.entries {
            m3u8.push_str(&format!("#EXTINF:{:.3},{}\n", entry.duration, entry.title));
            m3u8.push_str(&entry.url);
            m3u8.push('\n');
        }
        m3u8
    }

    /// Rewrite the whole playlist file
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.render())
    }
}
