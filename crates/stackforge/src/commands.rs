pub mod forges;
pub mod synth;
pub mod validate;

use anyhow::Context;
use std::path::PathBuf;

/// The explicit configuration path, or the discovered one
pub fn resolve_config(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => stackforge_config::find_config_file().context("no configuration file given"),
    }
}

/// Load the configuration and report where it came from
pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<(PathBuf, stackforge_core::Config)> {
    let path = resolve_config(explicit)?;
    let config = stackforge_config::load_config(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok((path, config))
}
