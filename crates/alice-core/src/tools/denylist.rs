//! Static denylist of destructive command patterns.
//!
//! Checked before any process is spawned. Python sources are checked too,
//! since they can shell out.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Built-in patterns. Each entry is `(label, regex)`.
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (
        "recursive delete of root or home",
        r#"(?m)(?:^|[\s;&|('"])rm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S*\s+)*(?:/|~|\$HOME)/?\*?(?:\s|$|[;&|)'"])"#,
    ),
    (
        "raw device write",
        r#"(?m)(?:^|[\s;&|('"])dd\s[^\n]*\bof=/dev/(?:sd|hd|nvme|vd|xvd|mmcblk|disk)"#,
    ),
    (
        "redirect to block device",
        r">\s*/dev/(?:sd|hd|nvme|vd|xvd|mmcblk|disk)",
    ),
    ("filesystem format", r"\b(?:mkfs(?:\.\w+)?|mkswap|wipefs)\b"),
    ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    (
        "recursive delete of root or home",
        r#"shutil\.rmtree\(\s*['"](?:/|~|/home)/?['"]"#,
    ),
];

static BUILTIN_RULES: OnceLock<Vec<Rule>> = OnceLock::new();

#[derive(Debug, Clone)]
struct Rule {
    label: String,
    pattern: Regex,
}

/// Built-in rules, compiled once per process.
fn builtin_rules() -> &'static [Rule] {
    BUILTIN_RULES.get_or_init(|| {
        BUILTIN_PATTERNS
            .iter()
            .filter_map(|(label, pattern)| match Regex::new(pattern) {
                Ok(pattern) => Some(Rule {
                    label: (*label).to_string(),
                    pattern,
                }),
                Err(e) => {
                    tracing::warn!(label, "built-in denylist pattern skipped: {e}");
                    None
                }
            })
            .collect()
    })
}

/// Compiled denylist: the built-in rules plus any user patterns.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    extra: Vec<Rule>,
}

impl Denylist {
    /// Compiles `extra` user patterns on top of the built-ins.
    ///
    /// # Errors
    /// Returns an error if any extra pattern is not a valid regex.
    pub fn new(extra: &[String]) -> Result<Self> {
        let extra = extra
            .iter()
            .map(|pattern| {
                let compiled = Regex::new(pattern)
                    .with_context(|| format!("Invalid denylist pattern: {pattern}"))?;
                Ok(Rule {
                    label: format!("custom pattern `{pattern}`"),
                    pattern: compiled,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { extra })
    }

    /// Returns the label of the first matching rule, if any.
    pub fn check(&self, source: &str) -> Option<&str> {
        builtin_rules()
            .iter()
            .chain(&self.extra)
            .find(|rule| rule.pattern.is_match(source))
            .map(|rule| rule.label.as_str())
    }
}
