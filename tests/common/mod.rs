#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use offstream::db::{NewStream, RecordStore, StoreError, Streamer, StreamerRoster};
use offstream::ipfs::{AddedEntry, ContentStore, IpfsError};
use offstream::streaming::{
    IncomingSegment, InterruptibleBody, ReaderHandle, ResolvedStream, SegmentReader,
    SignalHandle, StreamError, StreamResolver,
};

pub const GATEWAY: &str = "https://gw.test/{cid}/{path}";

pub fn streamer(id: i64, name: &str) -> Streamer {
    Streamer {
        id,
        name: name.to_string(),
        max_quality: "best".to_string(),
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Playlist file contents parsed back into segment urls
pub fn playlist_urls(m3u8: &str) -> Vec<String> {
    m3u8.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Content store
// ============================================================================

/// In-memory content store. Directory CIDs are `dir<n>`, playlist CIDs
/// `pl<n>`, both numbered from 0 in call order.
#[derive(Default)]
pub struct FakeContentStore {
    pub limit: Option<u64>,
    /// Delay applied to directory adds whose first file has this name
    pub slow_files: Mutex<HashMap<String, Duration>>,
    /// Number of upcoming directory adds that fail
    pub failures: AtomicUsize,
    pub directories: Mutex<Vec<Vec<String>>>,
    pub playlists: Mutex<Vec<String>>,
    playlist_count: AtomicUsize,
}

impl FakeContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn slow_on(&self, file_name: &str, delay: Duration) {
        self.slow_files
            .lock()
            .unwrap()
            .insert(file_name.to_string(), delay);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn last_playlist(&self) -> Option<String> {
        self.playlists.lock().unwrap().last().cloned()
    }

    pub fn playlist_count(&self) -> usize {
        self.playlists.lock().unwrap().len()
    }

    /// Gateway url handed out for the most recent playlist
    pub fn last_playlist_url(&self) -> Option<String> {
        let count = self.playlist_count();
        (count > 0).then(|| format!("https://gw.test/pl{}/", count - 1))
    }
}

impl ContentStore for FakeContentStore {
    fn add_directory(&self, files: &[PathBuf]) -> Result<Vec<AddedEntry>, IpfsError> {
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        let delay = self.slow_files.lock().unwrap().get(&names[0]).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IpfsError::Status {
                status: 500,
                message: "injected failure".to_string(),
            });
        }

        for file in files {
            // Files must still exist when they are added
            fs::metadata(file)?;
        }

        let mut directories = self.directories.lock().unwrap();
        let hash = format!("dir{}", directories.len());
        directories.push(names.clone());

        let mut entries: Vec<AddedEntry> = names
            .into_iter()
            .map(|name| AddedEntry {
                hash: format!("{}-{}", hash, name),
                name,
            })
            .collect();
        entries.push(AddedEntry {
            name: String::new(),
            hash,
        });
        Ok(entries)
    }

    fn add_file(&self, file: &Path) -> Result<AddedEntry, IpfsError> {
        let content = fs::read_to_string(file)?;
        let mut playlists = self.playlists.lock().unwrap();
        let n = self.playlist_count.fetch_add(1, Ordering::SeqCst);
        playlists.push(content);
        Ok(AddedEntry {
            name: file.file_name().unwrap().to_string_lossy().to_string(),
            hash: format!("pl{}", n),
        })
    }

    fn request_size_limit(&self) -> u64 {
        self.limit.unwrap_or(u64::MAX)
    }
}

// ============================================================================
// Roster and record store
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoredStream {
    pub stream: NewStream,
    pub urls: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    pub roster: Mutex<Vec<Streamer>>,
    pub streams: Mutex<Vec<StoredStream>>,
    pub roster_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn with_streamers(streamers: Vec<Streamer>) -> Self {
        Self {
            roster: Mutex::new(streamers),
            ..Default::default()
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn url(&self, index: usize) -> Option<String> {
        self.streams.lock().unwrap()[index].urls.last().cloned()
    }
}

impl StreamerRoster for MemoryStore {
    fn streamers(&self) -> Result<Vec<Streamer>, StoreError> {
        let failing = self
            .roster_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Invalid("roster unavailable".to_string()));
        }
        Ok(self.roster.lock().unwrap().clone())
    }
}

impl RecordStore for MemoryStore {
    fn create_stream(&self, stream: &NewStream) -> Result<i64, StoreError> {
        let mut streams = self.streams.lock().unwrap();
        streams.push(StoredStream {
            stream: stream.clone(),
            urls: Vec::new(),
        });
        Ok(streams.len() as i64)
    }

    fn update_stream_url(&self, id: i64, url: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.lock().unwrap();
        let stored = streams
            .get_mut((id - 1) as usize)
            .ok_or_else(|| StoreError::NotFound(format!("stream {}", id)))?;
        stored.urls.push(url.to_string());
        Ok(())
    }
}

// ============================================================================
// Stream resolver
// ============================================================================

/// What a fake stream does after its scripted segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSegments {
    /// End of stream
    End,
    /// Block until the reader is closed, like a live stream between segments
    Block,
    /// Transport error
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct FakeStreamPlan {
    pub segments: usize,
    pub segment_size: usize,
    pub duration: f64,
    pub after: AfterSegments,
}

impl FakeStreamPlan {
    pub fn new(segments: usize, segment_size: usize, after: AfterSegments) -> Self {
        Self {
            segments,
            segment_size,
            duration: 2.0,
            after,
        }
    }
}

/// Shared counters of a [`FakeResolver`]
#[derive(Default)]
pub struct ResolverStats {
    pub resolves: AtomicUsize,
    pub delivered: AtomicUsize,
    /// Readers that delivered everything and are waiting to be closed
    pub blocked: AtomicUsize,
    open_by_streamer: Mutex<HashMap<i64, usize>>,
    max_open_per_streamer: AtomicUsize,
    open_total: AtomicUsize,
    max_open_total: AtomicUsize,
}

impl ResolverStats {
    pub fn max_open_per_streamer(&self) -> usize {
        self.max_open_per_streamer.load(Ordering::SeqCst)
    }

    pub fn max_open_total(&self) -> usize {
        self.max_open_total.load(Ordering::SeqCst)
    }

    pub fn open_total(&self) -> usize {
        self.open_total.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    fn opened(&self, streamer_id: i64) {
        let mut open = self.open_by_streamer.lock().unwrap();
        let count = open.entry(streamer_id).or_insert(0);
        *count += 1;
        self.max_open_per_streamer.fetch_max(*count, Ordering::SeqCst);
        let total = self.open_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_total.fetch_max(total, Ordering::SeqCst);
    }

    fn closed(&self, streamer_id: i64) {
        let mut open = self.open_by_streamer.lock().unwrap();
        if let Some(count) = open.get_mut(&streamer_id) {
            *count -= 1;
        }
        self.open_total.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolver that is live for every streamer in `plans`, offline otherwise.
/// Streamers in `broken` fail to resolve.
#[derive(Default)]
pub struct FakeResolver {
    pub plans: HashMap<String, FakeStreamPlan>,
    pub broken: Vec<String>,
    pub stats: Arc<ResolverStats>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(mut self, name: &str, plan: FakeStreamPlan) -> Self {
        self.plans.insert(name.to_string(), plan);
        self
    }

    pub fn broken(mut self, name: &str) -> Self {
        self.broken.push(name.to_string());
        self
    }
}

impl StreamResolver for FakeResolver {
    fn resolve(&self, streamer: &Streamer) -> Result<Option<Box<dyn ResolvedStream>>, StreamError> {
        self.stats.resolves.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(&streamer.name) {
            return Err(StreamError::Transport("resolver down".to_string()));
        }
        Ok(self.plans.get(&streamer.name).map(|plan| {
            Box::new(FakeStream {
                streamer_id: streamer.id,
                title: format!("{} live", streamer.name),
                plan: *plan,
                stats: Arc::clone(&self.stats),
            }) as Box<dyn ResolvedStream>
        }))
    }
}

struct FakeStream {
    streamer_id: i64,
    title: String,
    plan: FakeStreamPlan,
    stats: Arc<ResolverStats>,
}

impl ResolvedStream for FakeStream {
    fn title(&self) -> Option<String> {
        Some(self.title.clone())
    }

    fn category(&self) -> Option<String> {
        Some("Testing".to_string())
    }

    fn open(self: Box<Self>) -> Result<Box<dyn SegmentReader>, StreamError> {
        self.stats.opened(self.streamer_id);
        Ok(Box::new(FakeReader {
            streamer_id: self.streamer_id,
            plan: self.plan,
            next: 0,
            handle: Arc::new(SignalHandle::new()),
            stats: self.stats,
        }))
    }
}

struct FakeReader {
    streamer_id: i64,
    plan: FakeStreamPlan,
    next: usize,
    handle: Arc<SignalHandle>,
    stats: Arc<ResolverStats>,
}

impl SegmentReader for FakeReader {
    fn next_segment(&mut self) -> Result<Option<IncomingSegment>, StreamError> {
        if self.handle.is_closed() {
            return Ok(None);
        }
        if self.next < self.plan.segments {
            let sequence = self.next as u64;
            self.next += 1;
            self.stats.delivered.fetch_add(1, Ordering::SeqCst);
            let body = vec![sequence as u8; self.plan.segment_size];
            let handle: Arc<dyn ReaderHandle> = self.handle.clone();
            return Ok(Some(IncomingSegment {
                sequence,
                duration: self.plan.duration,
                body: Box::new(InterruptibleBody::new(io::Cursor::new(body), handle)),
            }));
        }
        match self.plan.after {
            AfterSegments::End => Ok(None),
            AfterSegments::Fail => Err(StreamError::Transport("connection reset".to_string())),
            AfterSegments::Block => {
                self.stats.blocked.fetch_add(1, Ordering::SeqCst);
                while !self.handle.sleep(Duration::from_secs(60)) {}
                Ok(None)
            }
        }
    }

    fn handle(&self) -> Arc<dyn ReaderHandle> {
        self.handle.clone()
    }
}

impl Drop for FakeReader {
    fn drop(&mut self) {
        self.stats.closed(self.streamer_id);
    }
}
