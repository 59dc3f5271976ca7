//! System prompt assembly from the memory/skill store.
//!
//! The store is read-only from the runtime's point of view. A refresh simply
//! re-reads every source and rebuilds the prompt text.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ContextConfig;
use crate::skills::{discover_skills, format_skill_index};

/// Built-in prompt used when the base prompt file is missing.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Alice, an AI assistant working inside a \
project directory. To run code, reply with a fenced ```python block or a fenced ```bash \
block. Each block is executed in the project root and its output is returned to you in \
the next message. Reply without code blocks once you have the final answer.";

/// Read access to prompt, memory and skill files.
pub trait MemoryStore: Send + Sync {
    /// Reads a file by path relative to the store root.
    fn read(&self, path: &str) -> Option<String>;

    /// Relative paths of `<dir>/*/SKILL.md`, sorted by skill directory.
    fn skill_manifests(&self, _dir: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Store backed by files under the project root.
#[derive(Debug, Clone)]
pub struct FileMemoryStore {
    root: PathBuf,
}

impl FileMemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MemoryStore for FileMemoryStore {
    fn read(&self, path: &str) -> Option<String> {
        match fs::read_to_string(self.root.join(path)) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("failed to read {path}: {e}");
                None
            }
        }
    }

    fn skill_manifests(&self, dir: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(dir)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join("SKILL.md").is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let dir = dir.trim_end_matches('/');
        names
            .into_iter()
            .map(|name| format!("{dir}/{name}/SKILL.md"))
            .collect()
    }
}

/// Builds the full system message text.
///
/// Sections appear in a fixed order: base prompt, each memory file that
/// exists and is non-empty, then the skill index.
pub fn build_system_prompt(store: &dyn MemoryStore, config: &ContextConfig) -> String {
    let base = store
        .read(&config.prompt_path)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let mut sections = vec![base];

    for path in &config.memory_paths {
        if let Some(memory) = store.read(path) {
            let memory = memory.trim();
            if !memory.is_empty() {
                sections.push(format!("## Memory ({path})\n{memory}"));
            }
        }
    }

    let skills = discover_skills(store, &config.skills_dir);
    if let Some(index) = format_skill_index(&skills) {
        sections.push(index);
    }

    sections.join("\n\n")
}
