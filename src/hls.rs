//! Generic HLS adapter for [`StreamResolver`].
//!
//! The streamer's playlist URL comes from a template. A master playlist is
//! narrowed to the best variant within the streamer's quality limit, then the
//! media playlist is polled and every segment is handed out once, in media
//! sequence order.

use log::{debug, warn};
use m3u8_rs::{Playlist as M3u8Playlist, VariantStream};
use reqwest::blocking::Client;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::db::Streamer;
use crate::streaming::{
    IncomingSegment, InterruptibleBody, ReaderHandle, ResolvedStream, SegmentReader,
    SignalHandle, StreamError, StreamResolver,
};

/// Shortest pause between two media playlist reloads
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on what a streamer wants to watch, parsed from its quality
/// setting (`best`, `worst`, `audio_only`, `720p`, `1080p60`, ...)
#[derive(Debug, Clone, PartialEq)]
pub enum QualityLimit {
    Best,
    Worst,
    AudioOnly,
    /// Highest vertical resolution, optionally capped in frame rate at that
    /// resolution
    MaxHeight { height: u64, frame_rate: Option<f64> },
}

impl FromStr for QualityLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => return Ok(QualityLimit::Best),
            "worst" => return Ok(QualityLimit::Worst),
            "audio_only" => return Ok(QualityLimit::AudioOnly),
            _ => {}
        }
        let invalid = || format!("Invalid stream quality: {}", s);
        let (height, frame_rate) = s.split_once('p').ok_or_else(invalid)?;
        let height: u64 = height.parse().map_err(|_| invalid())?;
        let frame_rate = if frame_rate.is_empty() {
            None
        } else {
            Some(frame_rate.parse::<u32>().map_err(|_| invalid())? as f64)
        };
        Ok(QualityLimit::MaxHeight { height, frame_rate })
    }
}

fn height(variant: &VariantStream) -> u64 {
    variant.resolution.as_ref().map(|r| r.height).unwrap_or(0)
}

fn ranking(variant: &VariantStream) -> (u64, u64, u64) {
    let frame_rate = variant.frame_rate.unwrap_or(0.0).round() as u64;
    (height(variant), frame_rate, variant.bandwidth)
}

/// Pick the variant to record from a master playlist
pub fn select_variant<'a>(
    variants: &'a [VariantStream],
    limit: &QualityLimit,
) -> Option<&'a VariantStream> {
    let playable = variants.iter().filter(|v| !v.is_i_frame);
    match limit {
        QualityLimit::Best => playable.max_by_key(|v| ranking(v)),
        QualityLimit::Worst => {
            let video: Vec<_> = playable.filter(|v| v.resolution.is_some()).collect();
            video.into_iter().min_by_key(|v| ranking(v))
        }
        QualityLimit::AudioOnly => playable
            .filter(|v| v.resolution.is_none())
            .max_by_key(|v| v.bandwidth),
        QualityLimit::MaxHeight { height: max, frame_rate } => playable
            .filter(|v| v.resolution.is_some())
            .filter(|v| {
                let h = height(v);
                match (frame_rate, v.frame_rate) {
                    _ if h < *max => true,
                    (Some(limit), Some(rate)) if h == *max => rate <= *limit + 0.5,
                    _ => h == *max,
                }
            })
            .max_by_key(|v| ranking(v)),
    }
}

/// Substitute the streamer name into the playlist URL template
pub fn stream_url(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

fn parse_playlist(bytes: &[u8], url: &Url) -> Result<M3u8Playlist, StreamError> {
    m3u8_rs::parse_playlist_res(bytes)
        .map_err(|_| StreamError::Parse(format!("Invalid HLS playlist at {}", url)))
}

fn join(base: &Url, uri: &str) -> Result<Url, StreamError> {
    base.join(uri)
        .map_err(|e| StreamError::Parse(format!("Invalid URI '{}': {}", uri, e)))
}

/// Resolves streamers to HLS media playlists over HTTP
pub struct HlsResolver {
    client: Client,
    url_template: String,
}

impl HlsResolver {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, StreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }
}

impl StreamResolver for HlsResolver {
    fn resolve(&self, streamer: &Streamer) -> Result<Option<Box<dyn ResolvedStream>>, StreamError> {
        let limit: QualityLimit = streamer.max_quality.parse().map_err(StreamError::Parse)?;
        let url = stream_url(&self.url_template, &streamer.name);

        let response = self.client.get(&url).send()?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            debug!("{} is offline ({})", streamer.name, status);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StreamError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let base = response.url().clone();
        let bytes = response.bytes()?;
        let media_url = match parse_playlist(&bytes, &base)? {
            M3u8Playlist::MasterPlaylist(master) => {
                match select_variant(&master.variants, &limit) {
                    Some(variant) => join(&base, &variant.uri)?,
                    None => {
                        debug!(
                            "{} has no variant within quality {}",
                            streamer.name, streamer.max_quality
                        );
                        return Ok(None);
                    }
                }
            }
            M3u8Playlist::MediaPlaylist(_) => base,
        };

        Ok(Some(Box::new(HlsStream {
            client: self.client.clone(),
            media_url,
        })))
    }
}

/// A chosen HLS media playlist
pub struct HlsStream {
    client: Client,
    media_url: Url,
}

impl ResolvedStream for HlsStream {
    // Plain HLS carries no stream metadata
    fn title(&self) -> Option<String> {
        None
    }

    fn category(&self) -> Option<String> {
        None
    }

    fn open(self: Box<Self>) -> Result<Box<dyn SegmentReader>, StreamError> {
        Ok(Box::new(HlsReader::new(self.client, self.media_url)))
    }
}

#[derive(Debug)]
struct PendingSegment {
    sequence: u64,
    duration: f64,
    url: Url,
}

/// Polls a media playlist and yields each segment once.
///
/// Closing the handle is noticed between requests and between body reads,
/// not inside a blocking `send()`, so shutdown can take up to the client
/// timeout when the server stops answering.
pub struct HlsReader {
    client: Client,
    media_url: Url,
    handle: Arc<SignalHandle>,
    pending: VecDeque<PendingSegment>,
    next_sequence: Option<u64>,
    last_duration: f64,
    ended: bool,
}

impl HlsReader {
    pub fn new(client: Client, media_url: Url) -> Self {
        Self {
            client,
            media_url,
            handle: Arc::new(SignalHandle::new()),
            pending: VecDeque::new(),
            next_sequence: None,
            last_duration: 0.0,
            ended: false,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.last_duration / 2.0).max(MIN_POLL_INTERVAL)
    }

    fn refresh(&mut self) -> Result<(), StreamError> {
        let response = self.client.get(self.media_url.clone()).send()?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            // The playlist disappears when the broadcast ends
            self.ended = true;
            return Ok(());
        }
        if !status.is_success() {
            return Err(StreamError::Status {
                url: self.media_url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes()?;
        let playlist = match parse_playlist(&bytes, &self.media_url)? {
            M3u8Playlist::MediaPlaylist(playlist) => playlist,
            M3u8Playlist::MasterPlaylist(_) => {
                return Err(StreamError::Parse(format!(
                    "Expected a media playlist at {}",
                    self.media_url
                )))
            }
        };

        for (index, segment) in playlist.segments.iter().enumerate() {
            let sequence = playlist.media_sequence + index as u64;
            if matches!(self.next_sequence, Some(next) if sequence < next) {
                continue;
            }
            self.pending.push_back(PendingSegment {
                sequence,
                duration: segment.duration as f64,
                url: join(&self.media_url, &segment.uri)?,
            });
            self.next_sequence = Some(sequence + 1);
            self.last_duration = segment.duration as f64;
        }
        self.ended = playlist.end_list;
        Ok(())
    }
}

impl SegmentReader for HlsReader {
    fn next_segment(&mut self) -> Result<Option<IncomingSegment>, StreamError> {
        loop {
            if self.handle.is_closed() {
                return Ok(None);
            }

            if let Some(segment) = self.pending.pop_front() {
                let response = self.client.get(segment.url.clone()).send()?;
                if !response.status().is_success() {
                    warn!("Segment {} answered {}", segment.url, response.status());
                    return Err(StreamError::Status {
                        url: segment.url.to_string(),
                        status: response.status().as_u16(),
                    });
                }
                let handle: Arc<dyn ReaderHandle> = self.handle.clone();
                return Ok(Some(IncomingSegment {
                    sequence: segment.sequence,
                    duration: segment.duration,
                    body: Box::new(InterruptibleBody::new(response, handle)),
                }));
            }

            if self.ended {
                return Ok(None);
            }

            self.refresh()?;
            if self.pending.is_empty() && !self.ended && self.handle.sleep(self.poll_interval()) {
                return Ok(None);
            }
        }
    }

    fn handle(&self) -> Arc<dyn ReaderHandle> {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,FRAME-RATE=60.000
1080p60.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,FRAME-RATE=30.000
720p30.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=4500000,RESOLUTION=1280x720,FRAME-RATE=60.000
720p60.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=900000,RESOLUTION=640x360,FRAME-RATE=30.000
360p30.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=160000,CODECS=\"mp4a.40.2\"
audio_only.m3u8
";

    fn variants() -> Vec<VariantStream> {
        match m3u8_rs::parse_playlist_res(MASTER.as_bytes()) {
            Ok(M3u8Playlist::MasterPlaylist(master)) => master.variants,
            _ => panic!("fixture is not a master playlist"),
        }
    }

    fn pick(quality: &str) -> Option<String> {
        let limit: QualityLimit = quality.parse().unwrap();
        let variants = variants();
        select_variant(&variants, &limit).map(|v| v.uri.clone())
    }

    #[test]
    fn test_parse_quality() {
        assert_eq!("best".parse::<QualityLimit>(), Ok(QualityLimit::Best));
        assert_eq!(
            "720p".parse::<QualityLimit>(),
            Ok(QualityLimit::MaxHeight {
                height: 720,
                frame_rate: None
            })
        );
        assert_eq!(
            "1080p60".parse::<QualityLimit>(),
            Ok(QualityLimit::MaxHeight {
                height: 1080,
                frame_rate: Some(60.0)
            })
        );
        assert!("720".parse::<QualityLimit>().is_err());
        assert!("p60".parse::<QualityLimit>().is_err());
        assert!("720pxx".parse::<QualityLimit>().is_err());
    }

    #[test]
    fn test_select_best_and_worst() {
        assert_eq!(pick("best").as_deref(), Some("1080p60.m3u8"));
        assert_eq!(pick("worst").as_deref(), Some("360p30.m3u8"));
        assert_eq!(pick("audio_only").as_deref(), Some("audio_only.m3u8"));
    }

    #[test]
    fn test_select_within_height_limit() {
        assert_eq!(pick("720p").as_deref(), Some("720p60.m3u8"));
        assert_eq!(pick("720p30").as_deref(), Some("720p30.m3u8"));
        assert_eq!(pick("1080p30").as_deref(), Some("720p60.m3u8"));
        assert_eq!(pick("480p").as_deref(), Some("360p30.m3u8"));
    }

    #[test]
    fn test_no_variant_under_limit() {
        assert_eq!(pick("240p"), None);
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(
            stream_url("https://live.example/{name}/index.m3u8", "alice"),
            "https://live.example/alice/index.m3u8"
        );
    }
}
