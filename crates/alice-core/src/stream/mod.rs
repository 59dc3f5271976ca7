//! Live classification of streamed reply text.

pub mod classifier;
pub mod markers;

pub use classifier::{SegmentKind, StreamClassifier, StreamSegment};
pub use markers::{MarkerPair, MarkerTable};
