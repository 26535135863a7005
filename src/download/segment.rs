//! Byte-range segments of a download.
//!
//! A task's segments partition `[0, total)` into contiguous, disjoint ranges
//! assigned once when the task is planned. Each segment tracks how many bytes of
//! its range are on disk, so a paused or interrupted segment resumes at
//! `start + downloaded`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Not started, or stopped by a pause.
    #[default]
    Pending,
    /// A worker is transferring it.
    Active,
    /// Every byte of the range is on disk.
    Completed,
    /// Retries exhausted.
    Failed,
}

impl SegmentStatus {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous byte range `[start, end)` of a download.
///
/// `end` is `None` only for the single segment of a download whose size the
/// server did not disclose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    index: usize,
    start: u64,
    end: Option<u64>,
    downloaded: u64,
    status: SegmentStatus,
}

impl Segment {
    /// Creates a pending segment with nothing downloaded.
    #[must_use]
    pub fn new(index: usize, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            status: SegmentStatus::Pending,
        }
    }

    /// Restores a segment from persisted progress.
    ///
    /// `downloaded` is clamped to the range length, and a segment with its
    /// whole range on disk comes back completed.
    #[must_use]
    pub fn restored(index: usize, start: u64, end: Option<u64>, downloaded: u64) -> Self {
        let mut segment = Self::new(index, start, end);
        segment.downloaded = match segment.len() {
            Some(len) => downloaded.min(len),
            None => downloaded,
        };
        if segment.remaining() == Some(0) {
            segment.status = SegmentStatus::Completed;
        }
        segment
    }

    /// Position of this segment within its task.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// First byte of the range.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte, if known.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Bytes of the range already on disk.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    /// Length of the range, if known.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    /// Returns true for a known-empty range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Bytes still to fetch, if the end is known.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.downloaded))
    }

    /// File offset the next byte is written at.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.start + self.downloaded
    }

    /// Returns true when the segment is done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Completed
    }

    pub(crate) fn set_status(&mut self, status: SegmentStatus) {
        self.status = status;
    }

    /// Records `bytes` written at [`offset`](Self::offset), completing the
    /// segment when its range is full.
    pub(crate) fn record(&mut self, bytes: u64) {
        self.downloaded += bytes;
        if self.remaining() == Some(0) {
            self.status = SegmentStatus::Completed;
        }
    }

    /// Marks an open-ended segment complete once its stream ended, fixing its end.
    pub(crate) fn finish_open_ended(&mut self) {
        if self.end.is_none() {
            self.end = Some(self.start + self.downloaded);
        }
        self.status = SegmentStatus::Completed;
    }
}

/// Splits a download into segments.
///
/// - Unknown size, a non-resumable server, or a requested count of 1 yields a
///   single segment.
/// - Otherwise `[0, total)` is divided into `min(requested, total)` ranges whose
///   lengths differ by at most one byte.
#[must_use]
pub fn plan_segments(total: Option<u64>, requested: usize, resumable: bool) -> Vec<Segment> {
    let Some(total) = total else {
        return vec![Segment::new(0, 0, None)];
    };
    let requested = requested.max(1) as u64;
    let count = if resumable { requested.min(total.max(1)) } else { 1 };

    let base = total / count;
    let extra = total % count;
    let mut segments = Vec::with_capacity(usize::try_from(count).unwrap_or(1));
    let mut start = 0;
    for i in 0..count {
        let len = base + u64::from(i < extra);
        #[allow(clippy::cast_possible_truncation)]
        segments.push(Segment::new(i as usize, start, Some(start + len)));
        start += len;
    }
    segments
}
