//! Config command handlers.

use std::path::{Path, PathBuf};

use alice_core::config;
use anyhow::{Context, Result};

fn resolve_path(override_path: Option<&Path>) -> PathBuf {
    override_path.map_or_else(config::paths::config_path, Path::to_path_buf)
}

pub fn path(override_path: Option<&Path>) {
    println!("{}", resolve_path(override_path).display());
}

pub fn init(override_path: Option<&Path>) -> Result<()> {
    let config_path = resolve_path(override_path);
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}
