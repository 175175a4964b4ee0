// Segment Bookkeeper: which buffered time ranges are backed by which representation.
//
// Owned by one buffer. Updated on every successful push and on eviction, read
// by the scheduler (to avoid fetching twice) and by the playback quality
// estimator (to attribute frame drops to a representation).

use serde::{Deserialize, Serialize};

use crate::manifest::{RepresentationKey, TIME_EPSILON};

/// Half-open time range `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.end - self.start <= TIME_EPSILON
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start - TIME_EPSILON && time < self.end - TIME_EPSILON
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start < other.end - TIME_EPSILON && other.start < self.end - TIME_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedChunk {
    pub range: TimeRange,
    pub representation: RepresentationKey,
    pub bitrate: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentBookkeeper {
    /// Sorted by start, never overlapping.
    chunks: Vec<BufferedChunk>,
}

impl SegmentBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[BufferedChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Records pushed content. Older entries lose whatever part overlaps it.
    pub fn insert(&mut self, range: TimeRange, representation: RepresentationKey, bitrate: u64) {
        if range.is_empty() {
            return;
        }
        self.remove(range);
        let at = self.chunks.partition_point(|c| c.range.start < range.start);
        self.chunks.insert(
            at,
            BufferedChunk {
                range,
                representation,
                bitrate,
            },
        );
    }

    /// Forgets content inside `range`, splitting entries that straddle it.
    pub fn remove(&mut self, range: TimeRange) {
        let mut kept = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            if !chunk.range.intersects(&range) {
                kept.push(chunk);
                continue;
            }
            let left = TimeRange::new(chunk.range.start, range.start);
            if !left.is_empty() {
                kept.push(BufferedChunk {
                    range: left,
                    ..chunk.clone()
                });
            }
            let right = TimeRange::new(range.end, chunk.range.end);
            if !right.is_empty() {
                kept.push(BufferedChunk {
                    range: right,
                    ..chunk
                });
            }
        }
        self.chunks = kept;
    }

    /// Whether `range` is entirely buffered by content `accept` agrees with.
    pub fn is_covered(&self, range: TimeRange, accept: impl Fn(&RepresentationKey) -> bool) -> bool {
        let mut cursor = range.start;
        for chunk in &self.chunks {
            if cursor >= range.end - TIME_EPSILON {
                break;
            }
            if chunk.range.end <= cursor + TIME_EPSILON {
                continue;
            }
            if chunk.range.start > cursor + TIME_EPSILON || !accept(&chunk.representation) {
                return false;
            }
            cursor = chunk.range.end;
        }
        cursor >= range.end - TIME_EPSILON
    }

    /// Distinct representations buffered between two positions (in either order).
    pub fn representations_between(&self, a: f64, b: f64) -> Vec<&RepresentationKey> {
        let (start, end) = if a <= b { (a, b) } else { (b, a) };
        let mut keys: Vec<&RepresentationKey> = Vec::new();
        for chunk in &self.chunks {
            let touches = chunk.range.start <= end + TIME_EPSILON
                && chunk.range.end > start + TIME_EPSILON;
            if touches && !keys.contains(&&chunk.representation) {
                keys.push(&chunk.representation);
            }
        }
        keys
    }

    /// End of the contiguous buffered range containing `position`.
    pub fn buffered_end(&self, position: f64) -> Option<f64> {
        let first = self.chunks.iter().position(|c| c.range.contains(position))?;
        let mut end = self.chunks[first].range.end;
        for chunk in &self.chunks[first + 1..] {
            if chunk.range.start > end + TIME_EPSILON {
                break;
            }
            end = end.max(chunk.range.end);
        }
        Some(end)
    }

    /// Buffered content strictly before `time`.
    pub fn range_before(&self, time: f64) -> Option<TimeRange> {
        let first = self.chunks.first()?;
        let range = TimeRange::new(first.range.start, time);
        (!range.is_empty()).then_some(range)
    }

    /// Buffered content from `time` onward.
    pub fn range_after(&self, time: f64) -> Option<TimeRange> {
        let last = self.chunks.last()?;
        let range = TimeRange::new(time, last.range.end);
        (!range.is_empty()).then_some(range)
    }

    /// Ranges from `from` onward that belong to another representation than `keep`.
    pub fn ranges_not_matching(&self, from: f64, keep: &RepresentationKey) -> Vec<TimeRange> {
        self.chunks
            .iter()
            .filter(|c| c.representation != *keep && c.range.end > from + TIME_EPSILON)
            .map(|c| TimeRange::new(c.range.start.max(from), c.range.end))
            .filter(|r| !r.is_empty())
            .collect()
    }
}
