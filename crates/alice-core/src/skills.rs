//! Skill index built from `SKILL.md` manifests.
//!
//! Each skill lives in its own directory under the skills root and carries a
//! `SKILL.md` whose YAML frontmatter names and describes it. Only the index
//! (name, description, manifest path) goes into the system prompt; the model
//! reads full manifests on demand through the sandbox.

use serde::Deserialize;

use crate::core::context::MemoryStore;

const NO_DESCRIPTION: &str = "no description";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Manifest path relative to the project root.
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Loads every skill manifest under `skills_dir`, in directory order.
pub fn discover_skills(store: &dyn MemoryStore, skills_dir: &str) -> Vec<Skill> {
    store
        .skill_manifests(skills_dir)
        .into_iter()
        .filter_map(|path| {
            let content = store.read(&path)?;
            Some(load_skill(&path, &content))
        })
        .collect()
}

fn load_skill(path: &str, content: &str) -> Skill {
    let dir_name = path
        .rsplit('/')
        .nth(1)
        .filter(|s| !s.is_empty())
        .unwrap_or(path)
        .to_string();

    let frontmatter = match parse_frontmatter(content) {
        Ok(frontmatter) => Some(frontmatter),
        Err(e) => {
            tracing::warn!("skill manifest {path}: {e}");
            None
        }
    };
    let (name, description) = frontmatter
        .map(|f| (f.name, f.description))
        .unwrap_or_default();

    Skill {
        name: name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or(dir_name),
        description: description
            .map(|d| d.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
        path: path.to_string(),
    }
}

fn parse_frontmatter(content: &str) -> Result<SkillFrontmatter, String> {
    let content = strip_utf8_bom(content);
    let mut lines = content.lines();
    let Some(first) = lines.next() else {
        return Err("Missing YAML frontmatter".to_string());
    };

    if first.trim() != "---" {
        return Err("Missing YAML frontmatter".to_string());
    }

    let mut yaml_lines = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed == "---" || trimmed == "..." {
            let yaml = yaml_lines.join("\n");
            return serde_yaml::from_str(&yaml)
                .map_err(|e| format!("Failed to parse YAML frontmatter: {e}"));
        }
        yaml_lines.push(line);
    }

    Err("Unterminated YAML frontmatter".to_string())
}

fn strip_utf8_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

/// Renders the skill index section of the system prompt.
pub fn format_skill_index(skills: &[Skill]) -> Option<String> {
    if skills.is_empty() {
        return None;
    }
    let mut out = String::from(
        "## Skills\nRead a skill's manifest before using it (e.g. `cat <path>`).\n",
    );
    for skill in skills {
        out.push_str(&format!(
            "- {}: {} ({})\n",
            skill.name, skill.description, skill.path
        ));
    }
    Some(out.trim_end().to_string())
}
