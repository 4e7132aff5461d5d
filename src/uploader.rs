//! Per-recording upload pipeline.
//!
//! Every worker owns one [`Uploader`]: a single thread fed by a bounded
//! queue, so batches are uploaded one at a time in submission order and the
//! cumulative playlist only ever grows.

use crossbeam_channel::{bounded, Sender};
use log::{debug, error, warn};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::DirtyBatch;
use crate::constants::UPLOAD_QUEUE_DEPTH;
use crate::ipfs::{ContentStore, GatewayTemplate, IpfsError};
use crate::playlist::Playlist;

/// Upload errors
#[derive(Debug)]
pub enum UploadError {
    /// Content store call failed
    Store(IpfsError),
    /// Local file error
    Io(io::Error),
    /// Batch is bigger than one request to the store may be
    TooLarge { size: u64, limit: u64 },
    /// Directory add returned no directory entry
    MissingDirectory,
    /// Uploader thread is gone
    Closed,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Store(err) => write!(f, "Content store error: {}", err),
            UploadError::Io(err) => write!(f, "I/O error: {}", err),
            UploadError::TooLarge { size, limit } => write!(
                f,
                "Batch of {} bytes exceeds the request size limit of {} bytes",
                size, limit
            ),
            UploadError::MissingDirectory => write!(f, "No directory entry in add response"),
            UploadError::Closed => write!(f, "Uploader is shut down"),
        }
    }
}

impl StdError for UploadError {}

impl From<IpfsError> for UploadError {
    fn from(err: IpfsError) -> Self {
        UploadError::Store(err)
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Io(err)
    }
}

/// Result of one submitted batch, handed to the completion callback
#[derive(Debug)]
pub enum FlushOutcome {
    /// Batch and playlist uploaded; `url` points at the cumulative playlist
    Uploaded { url: String, segments: usize },
    Failed { error: UploadError, segments: usize },
    /// Dropped before it started because the uploader was cancelled
    Cancelled { segments: usize },
}

pub type CompletionCallback = Box<dyn FnMut(&FlushOutcome) + Send>;

/// How [`Uploader::shutdown`] treats batches still in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Upload everything that was submitted
    Drain,
    /// Let the in-flight batch finish and cancel the rest
    CancelPending,
}

/// Counters of one uploader's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Url of the most recent successfully uploaded playlist
    pub last_url: Option<String>,
}

/// Uploads batches and keeps the cumulative playlist of one recording
pub struct FlushPipeline {
    store: Arc<dyn ContentStore>,
    gateway: GatewayTemplate,
    playlist: Playlist,
    playlist_path: PathBuf,
}

impl FlushPipeline {
    /// `playlist_path` is where the playlist is written before each upload;
    /// its file name becomes the uploaded name
    pub fn new(store: Arc<dyn ContentStore>, gateway: GatewayTemplate, playlist_path: PathBuf) -> Self {
        Self {
            store,
            gateway,
            playlist: Playlist::default(),
            playlist_path,
        }
    }

    /// Start from `playlist` instead of an empty default playlist
    pub fn with_playlist(mut self, playlist: Playlist) -> Self {
        self.playlist = playlist;
        self
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    /// Upload the batch, extend and upload the playlist, return its url.
    ///
    /// Segment files are removed once the directory add succeeded. If the
    /// playlist upload fails afterwards, its new entries are still kept and
    /// go out with the next flush.
    pub fn flush(&mut self, batch: DirtyBatch) -> Result<String, UploadError> {
        let limit = self.store.request_size_limit();
        let size = batch.size();
        if size > limit {
            return Err(UploadError::TooLarge { size, limit });
        }

        let files: Vec<PathBuf> = batch.segments().iter().map(|s| s.path.clone()).collect();
        let entries = self.store.add_directory(&files)?;
        let directory = entries
            .iter()
            .find(|entry| entry.name.is_empty())
            .ok_or(UploadError::MissingDirectory)?;
        debug!(
            "Added {} segments ({} bytes) as directory {}",
            batch.len(),
            size,
            directory.hash
        );

        for segment in batch.segments() {
            if let Err(e) = fs::remove_file(&segment.path) {
                warn!("Failed to remove {}: {}", segment.path.display(), e);
            }
            let url = self.gateway.url(&directory.hash, &segment.file_name);
            self.playlist.append(url, segment.duration, "");
        }

        self.playlist.write(&self.playlist_path)?;
        let added = self.store.add_file(&self.playlist_path)?;
        Ok(self.gateway.url(&added.hash, ""))
    }
}

/// Single-threaded, order-preserving upload queue
pub struct Uploader {
    sender: Option<Sender<DirtyBatch>>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<UploadStats>>,
}

impl Uploader {
    /// Start the upload thread; `on_complete` runs on that thread once per
    /// submitted batch. Setting `cancelled` turns every batch that has not
    /// started yet into [`FlushOutcome::Cancelled`].
    pub fn spawn(
        name: &str,
        mut pipeline: FlushPipeline,
        cancelled: Arc<AtomicBool>,
        mut on_complete: CompletionCallback,
    ) -> io::Result<Self> {
        let (sender, receiver) = bounded::<DirtyBatch>(UPLOAD_QUEUE_DEPTH);
        let cancelled_clone = Arc::clone(&cancelled);

        let handle = thread::Builder::new()
            .name(format!("upload-{}", name))
            .spawn(move || {
                let mut stats = UploadStats::default();
                for batch in receiver.iter() {
                    let segments = batch.len();
                    let outcome = if cancelled_clone.load(Ordering::SeqCst) {
                        stats.cancelled += 1;
                        FlushOutcome::Cancelled { segments }
                    } else {
                        match pipeline.flush(batch) {
                            Ok(url) => {
                                stats.uploaded += 1;
                                stats.last_url = Some(url.clone());
                                FlushOutcome::Uploaded { url, segments }
                            }
                            Err(error) => {
                                stats.failed += 1;
                                FlushOutcome::Failed { error, segments }
                            }
                        }
                    };
                    on_complete(&outcome);
                }
                stats
            })?;

        Ok(Self {
            sender: Some(sender),
            cancelled,
            handle: Some(handle),
        })
    }

    /// Queue a batch. Blocks while `UPLOAD_QUEUE_DEPTH` batches are already
    /// waiting, which holds the recording back until the upload catches up.
    pub fn submit(&self, batch: DirtyBatch) -> Result<(), UploadError> {
        let sender = self.sender.as_ref().ok_or(UploadError::Closed)?;
        sender.send(batch).map_err(|_| UploadError::Closed)
    }

    /// Stop accepting batches and wait for the upload thread to finish
    pub fn shutdown(mut self, mode: ShutdownMode) -> UploadStats {
        if mode == ShutdownMode::CancelPending {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.sender.take();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!("Upload thread panicked");
                UploadStats::default()
            }
            None => UploadStats::default(),
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        // Without an explicit shutdown, queued batches are cancelled and the
        // thread is left to wind down on its own
        if self.handle.is_some() {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }
}
