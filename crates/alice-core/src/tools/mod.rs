//! Executable blocks and the sandbox that runs them.

use std::fmt;

pub mod denylist;
pub mod sandbox;

pub use sandbox::Sandbox;

/// Language of an executable block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Python,
    Shell,
}

impl ToolKind {
    /// Maps a fence language tag to a block kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "bash" | "sh" | "shell" => Some(Self::Shell),
            _ => None,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Python => write!(f, "python"),
            ToolKind::Shell => write!(f, "shell"),
        }
    }
}

/// A block extracted from a completed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub kind: ToolKind,
    pub source: String,
}

impl ToolInvocation {
    pub fn new(kind: ToolKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Heading used for this block in the feedback message.
    fn feedback_heading(&self) -> String {
        match self.kind {
            ToolKind::Python => "Python result:".to_string(),
            ToolKind::Shell => format!("Shell command `{}` result:", self.source),
        }
    }
}

/// Orders invocations for execution: every python block, then every shell
/// block, each group keeping document order.
pub fn execution_order(invocations: Vec<ToolInvocation>) -> Vec<ToolInvocation> {
    let (mut python, shell): (Vec<_>, Vec<_>) = invocations
        .into_iter()
        .partition(|inv| inv.kind == ToolKind::Python);
    python.extend(shell);
    python
}

/// Outcome of running one block. `text` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub text: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub blocked: bool,
    pub interrupted: bool,
}

impl ExecutionResult {
    pub(crate) fn completed(text: String, exit_code: Option<i32>) -> Self {
        Self {
            text,
            exit_code,
            timed_out: false,
            blocked: false,
            interrupted: false,
        }
    }

    pub(crate) fn blocked() -> Self {
        Self {
            blocked: true,
            ..Self::completed(sandbox::BLOCKED_MESSAGE.to_string(), None)
        }
    }

    pub(crate) fn timed_out(message: String) -> Self {
        Self {
            timed_out: true,
            ..Self::completed(message, None)
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::completed(sandbox::INTERRUPTED_MESSAGE.to_string(), None)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

const FEEDBACK_HEADER: &str = "Execution feedback:";
const SKIPPED_MESSAGE: &str = "[skipped: turn interrupted]";

/// Builds the single tool-feedback message for one tool round.
///
/// Results appear in execution order; blocks that never ran because the turn
/// was interrupted are listed with a skip note.
pub fn format_feedback(
    results: &[(ToolInvocation, ExecutionResult)],
    skipped: &[ToolInvocation],
) -> String {
    let sections: Vec<String> = results
        .iter()
        .map(|(inv, result)| {
            format!("{}\n{}", inv.feedback_heading(), result.text.trim_end())
        })
        .chain(
            skipped
                .iter()
                .map(|inv| format!("{}\n{SKIPPED_MESSAGE}", inv.feedback_heading())),
        )
        .collect();
    format!("{FEEDBACK_HEADER}\n{}", sections.join("\n\n"))
}
