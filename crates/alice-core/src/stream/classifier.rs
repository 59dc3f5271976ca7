//! Incremental thinking/content classifier for streamed model replies.
//!
//! Text outside any marked region is `Content`. A region opens on the earliest
//! start marker and closes on its paired end marker; everything consumed while
//! inside, both markers included, is `Thinking`. Marker prefixes at the end of
//! the buffer are held back so a marker split across two deltas is never
//! misclassified.

use super::markers::{MarkerTable, partial_suffix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Thinking,
    Content,
}

/// A typed span of classified reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSegment {
    pub kind: SegmentKind,
    pub text: String,
}

impl StreamSegment {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Thinking,
            text: text.into(),
        }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Content,
            text: text.into(),
        }
    }
}

/// Streaming classifier. Call [`feed`](Self::feed) per delta and
/// [`flush`](Self::flush) once when the stream ends.
#[derive(Debug)]
pub struct StreamClassifier {
    markers: MarkerTable,
    buffer: String,
    /// Index of the pair whose end marker is awaited, if inside a region.
    active: Option<usize>,
}

impl StreamClassifier {
    pub fn new(markers: MarkerTable) -> Self {
        Self {
            markers,
            buffer: String::new(),
            active: None,
        }
    }

    pub fn markers(&self) -> &MarkerTable {
        &self.markers
    }

    pub fn in_region(&self) -> bool {
        self.active.is_some()
    }

    /// Appends `text` and returns every segment that can be decided.
    pub fn feed(&mut self, text: &str) -> Vec<StreamSegment> {
        self.buffer.push_str(text);
        let mut out = Segments::default();
        self.drain(&mut out, false);
        out.into_vec()
    }

    /// Emits everything still buffered in the current mode and resets.
    ///
    /// An unclosed region is closed implicitly and its remainder is
    /// classified as thinking. Calling `flush` again yields nothing.
    pub fn flush(&mut self) -> Vec<StreamSegment> {
        let mut out = Segments::default();
        // No more text can arrive, so held-back start markers are decidable.
        self.drain(&mut out, true);
        let rest = std::mem::take(&mut self.buffer);
        let kind = if self.active.take().is_some() {
            SegmentKind::Thinking
        } else {
            SegmentKind::Content
        };
        out.push(kind, rest);
        out.into_vec()
    }

    fn drain(&mut self, out: &mut Segments, at_end: bool) {
        loop {
            let progressed = match self.active {
                None => self.scan_outside(out, at_end),
                Some(idx) => self.scan_inside(idx, out),
            };
            if !progressed {
                break;
            }
        }
    }

    /// Resolves text outside a region. Returns true when a region was entered.
    ///
    /// At the end of the stream partial markers can no longer complete and
    /// are ignored.
    fn scan_outside(&mut self, out: &mut Segments, at_end: bool) -> bool {
        let full = self.markers.earliest_start(&self.buffer);
        let partial = if at_end {
            None
        } else {
            self.markers.partial_start(&self.buffer)
        };

        match (full, partial) {
            // A marker that might still complete would win over the full match,
            // either by starting earlier or by registration order at the same
            // position, so the earliest match is not decidable yet.
            (Some(matched), Some((hold, partial_idx))) if (hold, partial_idx) < matched => {
                self.emit_prefix(SegmentKind::Content, hold, out);
                false
            }
            (Some((pos, idx)), _) => {
                self.emit_prefix(SegmentKind::Content, pos, out);
                let start_len = self.markers.pair(idx).start.len();
                self.emit_prefix(SegmentKind::Thinking, start_len, out);
                self.active = Some(idx);
                true
            }
            (None, Some((hold, _))) => {
                self.emit_prefix(SegmentKind::Content, hold, out);
                false
            }
            (None, None) => {
                let len = self.buffer.len();
                self.emit_prefix(SegmentKind::Content, len, out);
                false
            }
        }
    }

    /// Resolves text inside region `idx`. Returns true when the region closed.
    fn scan_inside(&mut self, idx: usize, out: &mut Segments) -> bool {
        let end = &self.markers.pair(idx).end;
        if let Some(pos) = self.buffer.find(end.as_str()) {
            let through = pos + end.len();
            self.emit_prefix(SegmentKind::Thinking, through, out);
            self.active = None;
            return true;
        }

        let hold = partial_suffix(&self.buffer, end).unwrap_or(self.buffer.len());
        self.emit_prefix(SegmentKind::Thinking, hold, out);
        false
    }

    fn emit_prefix(&mut self, kind: SegmentKind, len: usize, out: &mut Segments) {
        if len == 0 {
            return;
        }
        let head: String = self.buffer.drain(..len).collect();
        out.push(kind, head);
    }
}

/// Segment accumulator that merges adjacent spans of the same kind.
#[derive(Default)]
struct Segments(Vec<StreamSegment>);

impl Segments {
    fn push(&mut self, kind: SegmentKind, text: String) {
        if text.is_empty() {
            return;
        }
        match self.0.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(&text),
            _ => self.0.push(StreamSegment { kind, text }),
        }
    }

    fn into_vec(self) -> Vec<StreamSegment> {
        self.0
    }
}
