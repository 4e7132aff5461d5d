//! One recording session of one streamer.

use log::{debug, info, warn};
use std::error::Error as StdError;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::buffer::{Segment, SegmentBuffer};
use crate::constants::{
    PLAYLIST_FILE_NAME, RECORD_UPDATE_ATTEMPTS, SEGMENT_CHUNK_SIZE, WORKDIR_PREFIX,
};
use crate::db::{NewStream, RecordStore, StoreError, Streamer};
use crate::ipfs::{ContentStore, GatewayTemplate};
use crate::playlist::{Playlist, PlaylistType, PLAYLIST_VERSION};
use crate::streaming::{ReaderHandle, ResolvedStream, StreamError, StreamResolver};
use crate::uploader::{
    CompletionCallback, FlushOutcome, FlushPipeline, ShutdownMode, UploadError, UploadStats,
    Uploader,
};

/// Recording errors
#[derive(Debug)]
pub enum RecordError {
    /// Resolving or opening the stream failed
    Stream(StreamError),
    /// Stream record could not be created
    Store(StoreError),
    /// Upload queue rejected a batch
    Upload(UploadError),
    /// Temporary directory or thread setup failed
    Io(io::Error),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Stream(err) => write!(f, "Stream error: {}", err),
            RecordError::Store(err) => write!(f, "Store error: {}", err),
            RecordError::Upload(err) => write!(f, "Upload error: {}", err),
            RecordError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl StdError for RecordError {}

impl From<StreamError> for RecordError {
    fn from(err: StreamError) -> Self {
        RecordError::Stream(err)
    }
}

impl From<StoreError> for RecordError {
    fn from(err: StoreError) -> Self {
        RecordError::Store(err)
    }
}

impl From<UploadError> for RecordError {
    fn from(err: UploadError) -> Self {
        RecordError::Upload(err)
    }
}

impl From<io::Error> for RecordError {
    fn from(err: io::Error) -> Self {
        RecordError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Recording,
    Draining,
    Closed,
}

/// Shared handle that stops a running [`Worker`] from another thread
pub struct WorkerControl {
    closed: AtomicBool,
    // Shared with the uploader, which cancels queued batches once it is set
    aborted: Arc<AtomicBool>,
    state: Mutex<SessionState>,
    reader: Mutex<Option<Arc<dyn ReaderHandle>>>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            aborted: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SessionState::Idle),
            reader: Mutex::new(None),
        }
    }

    /// Stop recording; buffered segments are still flushed. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = reader.as_ref() {
            handle.close();
        }
    }

    /// Stop recording without the final flush and cancel queued uploads
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Register the reader to close on shutdown; returns false, leaving the
    /// handle unregistered, if the worker is already closed
    pub fn attach(&self, handle: Arc<dyn ReaderHandle>) -> bool {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return false;
        }
        *reader = Some(handle);
        true
    }
}

/// Collaborators shared by every worker of a scheduler
pub struct RecorderContext {
    pub resolver: Arc<dyn StreamResolver>,
    pub store: Arc<dyn RecordStore>,
    pub content: Arc<dyn ContentStore>,
    pub gateway: GatewayTemplate,
    pub flush_threshold: u64,
    pub playlist_type: Option<PlaylistType>,
    /// Parent of the session directories, system temp when unset
    pub temp_dir: Option<PathBuf>,
}

/// What a finished session did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// None when nothing was live
    pub stream_id: Option<i64>,
    pub segments: usize,
    pub bytes: u64,
    pub uploads: UploadStats,
}

pub struct Worker {
    streamer: Streamer,
    context: Arc<RecorderContext>,
    control: Arc<WorkerControl>,
}

impl Worker {
    pub fn new(streamer: Streamer, context: Arc<RecorderContext>, control: Arc<WorkerControl>) -> Self {
        Self {
            streamer,
            context,
            control,
        }
    }

    /// Record the streamer's live stream until it ends or the worker is closed
    pub fn run(self) -> Result<SessionSummary, RecordError> {
        let result = self.session();
        self.control.set_state(SessionState::Closed);
        result
    }

    fn session(&self) -> Result<SessionSummary, RecordError> {
        let name = &self.streamer.name;
        let mut summary = SessionSummary::default();

        if self.control.is_closed() {
            return Ok(summary);
        }
        self.control.set_state(SessionState::Resolving);
        let resolved = match self.context.resolver.resolve(&self.streamer)? {
            Some(resolved) => resolved,
            None => {
                debug!("[{}] Not live", name);
                return Ok(summary);
            }
        };
        if self.control.is_closed() {
            return Ok(summary);
        }

        let stream_id = self.context.store.create_stream(&NewStream {
            streamer_id: self.streamer.id,
            title: resolved.title(),
            category: resolved.category(),
            created_at: chrono::Utc::now(),
        })?;
        summary.stream_id = Some(stream_id);
        info!("[{}] Recording stream {}", name, stream_id);

        let workdir = match &self.context.temp_dir {
            Some(parent) => tempfile::Builder::new()
                .prefix(WORKDIR_PREFIX)
                .tempdir_in(parent)?,
            None => tempfile::Builder::new().prefix(WORKDIR_PREFIX).tempdir()?,
        };

        let pipeline = FlushPipeline::new(
            Arc::clone(&self.context.content),
            self.context.gateway.clone(),
            workdir.path().join(PLAYLIST_FILE_NAME),
        )
        .with_playlist(Playlist::new(PLAYLIST_VERSION, self.context.playlist_type));
        let uploader = Uploader::spawn(
            name,
            pipeline,
            Arc::clone(&self.control.aborted),
            record_updater(Arc::clone(&self.context.store), stream_id, name.clone()),
        )?;
        let mut buffer = SegmentBuffer::new(self.context.flush_threshold);

        self.control.set_state(SessionState::Recording);
        let recorded = self.record(resolved, workdir.path(), &mut buffer, &uploader, &mut summary);

        self.control.set_state(SessionState::Draining);
        let mode = if self.control.is_aborted() {
            if !buffer.is_empty() {
                debug!("[{}] Aborted, dropping {} buffered segments", name, buffer.len());
            }
            ShutdownMode::CancelPending
        } else {
            if let Some(batch) = buffer.take() {
                debug!("[{}] Final flush of {} segments", name, batch.len());
                if let Err(e) = uploader.submit(batch) {
                    warn!("[{}] Final flush not submitted: {}", name, e);
                }
            }
            ShutdownMode::Drain
        };
        summary.uploads = uploader.shutdown(mode);

        if let Err(e) = workdir.close() {
            warn!("[{}] Failed to remove session directory: {}", name, e);
        }
        info!(
            "[{}] Stream {} finished: {} segments, {} flushes uploaded, {} failed, {} cancelled",
            name,
            stream_id,
            summary.segments,
            summary.uploads.uploaded,
            summary.uploads.failed,
            summary.uploads.cancelled
        );

        recorded.map(|_| summary)
    }

    fn record(
        &self,
        resolved: Box<dyn ResolvedStream>,
        workdir: &Path,
        buffer: &mut SegmentBuffer,
        uploader: &Uploader,
        summary: &mut SessionSummary,
    ) -> Result<(), RecordError> {
        let name = &self.streamer.name;
        let mut reader = resolved.open()?;
        let handle = reader.handle();
        if !self.control.attach(Arc::clone(&handle)) {
            handle.close();
            return Ok(());
        }

        while !self.control.is_closed() {
            let mut incoming = match reader.next_segment() {
                Ok(Some(incoming)) => incoming,
                Ok(None) => {
                    debug!("[{}] Stream ended", name);
                    break;
                }
                Err(e) => {
                    if !self.control.is_closed() {
                        warn!("[{}] Stream interrupted: {}", name, e);
                    }
                    break;
                }
            };

            let file_name = format!("{}.ts", incoming.sequence);
            let path = workdir.join(&file_name);
            let size = match download_segment(&mut incoming.body, &path) {
                Ok(size) => size,
                Err(e) => {
                    discard(&path);
                    if self.control.is_closed() {
                        debug!("[{}] Discarded partial segment {}", name, file_name);
                    } else {
                        warn!("[{}] Failed to download {}: {}", name, file_name, e);
                    }
                    break;
                }
            };

            summary.segments += 1;
            summary.bytes += size;
            let flushes = buffer.append(Segment {
                file_name,
                path,
                size,
                duration: incoming.duration,
            });
            for batch in flushes {
                debug!("[{}] Flushing {} segments ({} bytes)", name, batch.len(), batch.size());
                uploader.submit(batch)?;
            }
        }

        handle.close();
        Ok(())
    }
}

/// Copy a segment body into `path` chunk by chunk, returning its size
fn download_segment(body: &mut dyn Read, path: &Path) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let mut chunk = [0u8; SEGMENT_CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match body.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        file.write_all(&chunk[..n])?;
        written += n as u64;
    }
    file.flush()?;
    Ok(written)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 << attempt.saturating_sub(1).min(4))
}

/// Completion callback that points the stream record at each new playlist
fn record_updater(store: Arc<dyn RecordStore>, stream_id: i64, name: String) -> CompletionCallback {
    Box::new(move |outcome: &FlushOutcome| match outcome {
        FlushOutcome::Uploaded { url, segments } => {
            info!("[{}] Uploaded {} segments: {}", name, segments, url);
            update_url_with_retry(store.as_ref(), stream_id, url);
        }
        FlushOutcome::Failed { error, segments } => {
            warn!("[{}] Upload of {} segments failed: {}", name, segments, error);
        }
        FlushOutcome::Cancelled { segments } => {
            debug!("[{}] Upload of {} segments cancelled", name, segments);
        }
    })
}

fn update_url_with_retry(store: &dyn RecordStore, stream_id: i64, url: &str) {
    for attempt in 1..=RECORD_UPDATE_ATTEMPTS {
        match store.update_stream_url(stream_id, url) {
            Ok(()) => return,
            Err(e) if attempt < RECORD_UPDATE_ATTEMPTS => {
                let backoff = retry_backoff(attempt);
                warn!(
                    "Failed to update stream {} (attempt {}): {}; retrying in {}ms",
                    stream_id,
                    attempt,
                    e,
                    backoff.as_millis()
                );
                thread::sleep(backoff);
            }
            Err(e) => {
                // The next successful flush writes a newer cumulative url
                warn!("Giving up on updating stream {}: {}", stream_id, e);
            }
        }
    }
}
