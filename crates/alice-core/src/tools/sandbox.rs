//! Sandboxed execution of python snippets and shell commands.
//!
//! Every run is pinned to the project root, checked against the denylist,
//! bounded by a wall-clock timeout, and placed in its own process group so a
//! timeout or cancel terminates everything it spawned.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::denylist::Denylist;
use super::{ExecutionResult, ToolInvocation, ToolKind};
use crate::config::SandboxConfig;

/// Maximum bytes kept per output stream (stdout/stderr).
const MAX_OUTPUT_BYTES: usize = 40 * 1024; // 40KB

const DEFAULT_VENV_PYTHON: &str = ".venv/bin/python";
const FALLBACK_PYTHON: &str = "python3";

pub(crate) const BLOCKED_MESSAGE: &str =
    "[blocked: command matches a destructive pattern and was not executed]";
pub(crate) const INTERRUPTED_MESSAGE: &str = "[interrupted: execution cancelled by user]";
const NO_OUTPUT_MESSAGE: &str = "[no output]";

/// Executes one block at a time inside the project root.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    python: PathBuf,
    extension_paths: Vec<PathBuf>,
    timeout: Duration,
    denylist: Denylist,
}

impl Sandbox {
    /// Builds a sandbox rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the root cannot be resolved or a denylist pattern
    /// is invalid.
    pub fn new(root: &Path, config: &SandboxConfig) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve project root {}", root.display()))?;
        let python = resolve_python(&root, config.python.as_deref());
        let extension_paths = config
            .extension_paths
            .iter()
            .map(|p| root.join(p))
            .collect();
        let denylist = Denylist::new(&config.extra_denylist)?;

        Ok(Self {
            root,
            python,
            extension_paths,
            timeout: config.timeout(),
            denylist,
        })
    }

    /// Overrides the wall-clock limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// Runs one invocation to completion, timeout, or cancellation.
    ///
    /// Never fails: denylist hits, spawn failures, timeouts and cancels all
    /// come back as result text.
    pub async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if let Some(rule) = self.denylist.check(&invocation.source) {
            tracing::warn!(kind = %invocation.kind, rule, "blocked by denylist");
            return ExecutionResult::blocked();
        }

        let result = match invocation.kind {
            ToolKind::Python => self.run_python(&invocation.source, cancel).await,
            ToolKind::Shell => {
                let command = self.rewrite_shell(&invocation.source);
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                self.run_command(cmd, cancel).await
            }
        };

        tracing::debug!(
            kind = %invocation.kind,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            interrupted = result.interrupted,
            "execution finished"
        );
        result
    }

    async fn run_python(&self, source: &str, cancel: &CancellationToken) -> ExecutionResult {
        // Removed when dropped, on every return path.
        let scratch = match self.write_scratch(source) {
            Ok(file) => file,
            Err(e) => return spawn_failure(&e),
        };

        let mut cmd = Command::new(&self.python);
        cmd.arg(scratch.path());
        self.run_command(cmd, cancel).await
    }

    fn write_scratch(&self, source: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(".alice-scratch-")
            .suffix(".py")
            .tempfile_in(&self.root)
            .context("Failed to create scratch file")?;
        file.write_all(source.as_bytes())
            .context("Failed to write scratch file")?;
        file.flush().context("Failed to write scratch file")?;
        Ok(file)
    }

    /// Points a leading `python`/`pip` at the isolated interpreter.
    fn rewrite_shell(&self, command: &str) -> String {
        let trimmed = command.trim_start();
        let (first, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        let python = shell_quote(&self.python.to_string_lossy());

        let prefix = match first {
            "python" | "python3" => python,
            "pip" | "pip3" => format!("{python} -m pip"),
            _ => return command.to_string(),
        };
        if rest.is_empty() {
            prefix
        } else {
            format!("{prefix} {rest}")
        }
    }

    fn pythonpath(&self) -> Option<OsString> {
        let existing = std::env::var_os("PYTHONPATH");
        let paths = self
            .extension_paths
            .iter()
            .cloned()
            .chain(existing.iter().flat_map(std::env::split_paths));
        std::env::join_paths(paths).ok()
    }

    async fn run_command(&self, mut cmd: Command, cancel: &CancellationToken) -> ExecutionResult {
        cmd.current_dir(&self.root)
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(pythonpath) = self.pythonpath() {
            cmd.env("PYTHONPATH", pythonpath);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&anyhow::Error::new(e)),
        };
        let mut group = ProcessGroup::new(child.id());

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                group.kill();
                ExecutionResult::interrupted()
            }
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => {
                match waited {
                    Err(_) => {
                        group.kill();
                        ExecutionResult::timed_out(format!(
                            "[timed out after {:?}; process terminated]",
                            self.timeout
                        ))
                    }
                    Ok(Err(e)) => spawn_failure(&anyhow::Error::new(e)),
                    Ok(Ok(output)) => {
                        group.disarm();
                        let exit_code = output.status.code();
                        ExecutionResult::completed(
                            format_output(&output.stdout, &output.stderr, exit_code),
                            exit_code,
                        )
                    }
                }
            }
        }
    }
}

/// Kills the whole process group of a sandboxed child unless disarmed.
struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }

    fn kill(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = i32::try_from(pid) else {
                return;
            };
            // SAFETY: kill(2) with a negative pid only signals the group we created.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn resolve_python(root: &Path, configured: Option<&str>) -> PathBuf {
    if let Some(configured) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        let path = Path::new(configured);
        // Bare names ("python3") are looked up on PATH by the OS.
        if path.is_absolute() || path.components().count() == 1 {
            return path.to_path_buf();
        }
        return root.join(path);
    }

    let venv = root.join(DEFAULT_VENV_PYTHON);
    if venv.exists() {
        venv
    } else {
        tracing::warn!(
            "no interpreter at {}, falling back to {FALLBACK_PYTHON}",
            venv.display()
        );
        PathBuf::from(FALLBACK_PYTHON)
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn spawn_failure(err: &anyhow::Error) -> ExecutionResult {
    tracing::warn!("failed to start sandboxed process: {err:#}");
    ExecutionResult::completed(format!("[failed to start process: {err:#}]"), None)
}

/// Truncates a byte slice at a valid UTF-8 character boundary.
///
/// Returns the text and whether truncation occurred.
fn truncate_at_utf8_boundary(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    if bytes.len() <= max_bytes {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    // Back up to the first byte of the character straddling the cut.
    let mut end = max_bytes;
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true)
}

fn push_stream(text: &mut String, bytes: &[u8]) {
    let (body, truncated) = truncate_at_utf8_boundary(bytes, MAX_OUTPUT_BYTES);
    text.push_str(body.trim_end());
    if truncated {
        text.push_str(&format!(
            "\n[output truncated: showing {MAX_OUTPUT_BYTES} of {} bytes]",
            bytes.len()
        ));
    }
}

/// Combines stdout, stderr and the exit status into the result text.
fn format_output(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> String {
    let mut text = String::new();
    push_stream(&mut text, stdout);

    if !String::from_utf8_lossy(stderr).trim().is_empty() {
        if !text.is_empty() {
            text.push_str("\n[stderr]\n");
        }
        push_stream(&mut text, stderr);
    }

    let status_note = match exit_code {
        Some(0) => None,
        Some(code) => Some(format!("[exit code: {code}]")),
        None => Some("[terminated by signal]".to_string()),
    };
    if let Some(note) = status_note {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&note);
    }

    if text.trim().is_empty() {
        return NO_OUTPUT_MESSAGE.to_string();
    }
    text
}
