use std::path::PathBuf;

/// A downloaded segment waiting in the worker's temporary directory
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// File name inside the temporary directory, also used as the path
    /// below the uploaded directory's CID
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub duration: f64,
}

/// Segments collected since the previous flush, in capture order
#[derive(Debug, Default, PartialEq)]
pub struct DirtyBatch {
    segments: Vec<Segment>,
}

impl DirtyBatch {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.segments.iter().map(|segment| segment.size).sum()
    }
}

/// Accumulates segments until their combined size calls for a flush.
///
/// The threshold is checked on both sides of an append: a segment that
/// would push existing data over the threshold flushes that data first, and
/// a segment that is over the threshold on its own is flushed right away.
/// After `append` returns, `dirty_size() <= threshold()` always holds.
#[derive(Debug)]
pub struct SegmentBuffer {
    threshold: u64,
    dirty_size: u64,
    pending: Vec<Segment>,
}

impl SegmentBuffer {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            dirty_size: 0,
            pending: Vec::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn dirty_size(&self) -> u64 {
        self.dirty_size
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Add a segment and return the batches that must be flushed, oldest first
    pub fn append(&mut self, segment: Segment) -> Vec<DirtyBatch> {
        let mut flushes = Vec::new();

        if self.dirty_size > 0 && self.dirty_size + segment.size > self.threshold {
            flushes.extend(self.take());
        }

        self.dirty_size += segment.size;
        self.pending.push(segment);

        if self.dirty_size > self.threshold {
            flushes.extend(self.take());
        }

        flushes
    }

    /// Move every pending segment out, leaving the buffer empty
    pub fn take(&mut self) -> Option<DirtyBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.dirty_size = 0;
        Some(DirtyBatch::new(std::mem::take(&mut self.pending)))
    }
}
