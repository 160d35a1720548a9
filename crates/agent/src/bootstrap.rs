//! Agent config discovery

use netsentry_lib::agents::AgentConfig;
use netsentry_lib::error::ConfigError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Parse every agent config in `dir`, in file-name order. Invalid files are
/// logged and skipped; a missing directory yields no agents.
pub fn load_agent_configs(dir: &Path) -> Vec<AgentConfig> {
    let mut files = match config_files(dir) {
        Ok(files) => files,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Agent config directory unreadable");
            return Vec::new();
        }
    };
    files.sort();

    let mut configs: Vec<AgentConfig> = Vec::new();
    for path in files {
        match AgentConfig::from_file(&path) {
            Ok(config) if configs.iter().any(|c| c.id == config.id) => {
                let err = ConfigError::DuplicateAgent(config.id);
                warn!(path = %path.display(), error = %err, "Skipping agent config");
            }
            Ok(config) => {
                info!(
                    path = %path.display(),
                    agent_id = %config.id,
                    strategy = config.strategy.name(),
                    "Loaded agent config"
                );
                configs.push(config);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid agent config");
            }
        }
    }
    configs
}

fn config_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| CONFIG_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}
