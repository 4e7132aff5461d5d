//! Capability traits between the recorder and whatever turns a streamer into
//! a sequence of video segments.
//!
//! Reading is pull-style: the worker asks for the next segment and copies its
//! body itself. A reader's [`ReaderHandle`] can be closed from another thread
//! to unblock a pending read.

use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Streamer;
use crate::signal::CloseSignal;

/// Errors raised while resolving or reading a stream
#[derive(Debug)]
pub enum StreamError {
    /// HTTP request failed
    Http(reqwest::Error),
    /// Server answered with an unexpected status
    Status { url: String, status: u16 },
    /// Playlist or URL could not be understood
    Parse(String),
    /// Connection dropped or body ended early
    Transport(String),
    /// General I/O error
    Io(io::Error),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Http(err) => write!(f, "HTTP error: {}", err),
            StreamError::Status { url, status } => {
                write!(f, "Unexpected status {} from {}", status, url)
            }
            StreamError::Parse(msg) => write!(f, "Parse error: {}", msg),
            StreamError::Transport(msg) => write!(f, "Transport error: {}", msg),
            StreamError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl StdError for StreamError {}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Http(err)
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err)
    }
}

/// Turns a streamer into a live stream, if one is on air
pub trait StreamResolver: Send + Sync {
    /// `Ok(None)` means nothing to record right now: offline, or no variant
    /// within the streamer's quality limit
    fn resolve(&self, streamer: &Streamer) -> Result<Option<Box<dyn ResolvedStream>>, StreamError>;
}

/// A stream picked by a resolver, not opened yet
pub trait ResolvedStream: Send {
    fn title(&self) -> Option<String>;
    fn category(&self) -> Option<String>;
    fn open(self: Box<Self>) -> Result<Box<dyn SegmentReader>, StreamError>;
}

/// One segment as it arrives from the stream
pub struct IncomingSegment {
    pub sequence: u64,
    pub duration: f64,
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for IncomingSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingSegment")
            .field("sequence", &self.sequence)
            .field("duration", &self.duration)
            .finish()
    }
}

pub trait SegmentReader: Send {
    /// Block until the next segment starts; `Ok(None)` on clean end of stream
    /// or after the reader was closed
    fn next_segment(&mut self) -> Result<Option<IncomingSegment>, StreamError>;

    /// Handle that closes this reader from another thread
    fn handle(&self) -> Arc<dyn ReaderHandle>;
}

pub trait ReaderHandle: Send + Sync {
    /// Close the reader. Waits between polls and body reads end promptly; an
    /// HTTP request already in flight is only bounded by the client timeout.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Reader handle backed by a [`CloseSignal`], so a reader can sleep between
/// polls and still wake up as soon as it is closed
#[derive(Debug, Default)]
pub struct SignalHandle {
    signal: CloseSignal,
}

impl SignalHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep up to `timeout`; returns true if the handle was closed
    pub fn sleep(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }
}

impl ReaderHandle for SignalHandle {
    fn close(&self) {
        self.signal.fire();
    }

    fn is_closed(&self) -> bool {
        self.signal.is_fired()
    }
}

/// Wraps a segment body so reads fail once the owning reader is closed
pub struct InterruptibleBody<R> {
    inner: R,
    handle: Arc<dyn ReaderHandle>,
}

impl<R: Read> InterruptibleBody<R> {
    pub fn new(inner: R, handle: Arc<dyn ReaderHandle>) -> Self {
        Self { inner, handle }
    }
}

impl<R: Read> Read for InterruptibleBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.handle.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "stream reader closed",
            ));
        }
        self.inner.read(buf)
    }
}
