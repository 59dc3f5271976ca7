//! Bridge command handler.

use std::path::Path;

use alice_core::config::Config;
use anyhow::{Context, Result};

use crate::modes::bridge::{self, BridgeOptions};

pub async fn run(root: &Path, config_path: Option<&Path>, model: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("load config");

    bridge::run(BridgeOptions {
        root,
        config,
        model_override: model,
    })
    .await
}
