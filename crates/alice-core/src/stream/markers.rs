//! Marker-pair table shared by live stream classification and block extraction.
//!
//! The same table drives both passes, so what the user sees routed to the
//! thinking channel is exactly what the runtime considers for execution.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::tools::{ToolInvocation, ToolKind};

/// A start/end delimiter pair defining a thinking/source region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPair {
    pub start: String,
    pub end: String,
    /// Whether regions delimited by this pair are candidates for execution.
    #[serde(default)]
    pub executable: bool,
}

impl MarkerPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>, executable: bool) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            executable,
        }
    }

    /// Fenced code blocks (```` ```lang ... ``` ````).
    pub fn code_fence() -> Self {
        Self::new("```", "```", true)
    }

    /// Inline reasoning tags emitted by some models inside the content channel.
    pub fn think_tags() -> Self {
        Self::new("<think>", "</think>", false)
    }
}

/// Ordered set of marker pairs. Registration order breaks ties between
/// start markers matching at the same position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTable {
    pairs: Vec<MarkerPair>,
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self {
            pairs: vec![MarkerPair::code_fence(), MarkerPair::think_tags()],
        }
    }
}

impl MarkerTable {
    /// Builds a table from explicit pairs.
    ///
    /// # Errors
    /// Returns an error if the table is empty or any marker is empty.
    pub fn new(pairs: Vec<MarkerPair>) -> Result<Self> {
        if pairs.is_empty() {
            bail!("marker table must contain at least one pair");
        }
        for pair in &pairs {
            if pair.start.is_empty() || pair.end.is_empty() {
                bail!("marker pairs must have non-empty start and end delimiters");
            }
        }
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[MarkerPair] {
        &self.pairs
    }

    pub fn pair(&self, index: usize) -> &MarkerPair {
        &self.pairs[index]
    }

    /// Earliest start-marker match in `text` as `(position, pair index)`.
    pub(crate) fn earliest_start(&self, text: &str) -> Option<(usize, usize)> {
        self.pairs
            .iter()
            .enumerate()
            .filter_map(|(idx, pair)| text.find(&pair.start).map(|pos| (pos, idx)))
            .min()
    }

    /// Earliest suffix of `text` that is a proper prefix of a start marker, as
    /// `(position, pair index)`. Ordered the same way as [`earliest_start`].
    ///
    /// [`earliest_start`]: Self::earliest_start
    pub(crate) fn partial_start(&self, text: &str) -> Option<(usize, usize)> {
        self.pairs
            .iter()
            .enumerate()
            .filter_map(|(idx, pair)| partial_suffix(text, &pair.start).map(|pos| (pos, idx)))
            .min()
    }

    /// Extracts executable blocks from a completed reply, in document order.
    ///
    /// Regions are located with the same earliest-match rule the classifier
    /// uses. The first word directly after the start marker is the language
    /// tag; untagged, unknown-language, empty, and unclosed blocks are skipped.
    pub fn extract_invocations(&self, reply: &str) -> Vec<ToolInvocation> {
        let mut invocations = Vec::new();
        let mut rest = reply;

        while let Some((pos, idx)) = self.earliest_start(rest) {
            let pair = &self.pairs[idx];
            let after_start = &rest[pos + pair.start.len()..];
            let Some(end) = after_start.find(&pair.end) else {
                break;
            };

            if pair.executable
                && let Some(invocation) = parse_block(&after_start[..end])
            {
                invocations.push(invocation);
            }
            rest = &after_start[end + pair.end.len()..];
        }

        invocations
    }
}

/// Returns the byte offset where the longest suffix of `text` that is a
/// proper prefix of `marker` begins.
pub(crate) fn partial_suffix(text: &str, marker: &str) -> Option<usize> {
    let longest = marker.len().saturating_sub(1).min(text.len());
    (1..=longest).rev().find_map(|len| {
        let at = text.len() - len;
        (text.is_char_boundary(at)
            && marker.is_char_boundary(len)
            && marker.as_bytes().starts_with(&text.as_bytes()[at..]))
        .then_some(at)
    })
}

fn parse_block(inner: &str) -> Option<ToolInvocation> {
    let tag_len = inner
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')))
        .unwrap_or(inner.len());
    let kind = ToolKind::from_tag(&inner[..tag_len])?;
    let source = inner[tag_len..].trim();
    if source.is_empty() {
        return None;
    }
    Some(ToolInvocation::new(kind, source))
}
