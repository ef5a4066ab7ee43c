use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::{error, info};

fn default_components() -> bool {
    true
}

/// One export config as written in YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExportConfig {
    /// Source file to export from.
    pub file_id: String,
    pub output_dir: PathBuf,
    /// Download priority, lower goes first.
    #[serde(default)]
    pub priority: i32,
    /// Export every published component.
    #[serde(default = "default_components")]
    pub components: bool,
    /// Variable collection to export, by name.
    #[serde(default)]
    pub collection: Option<String>,
}

/// Loads and validates a YAML export config.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ExportConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let config: ExportConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if config.file_id.trim().is_empty() {
        error!(config_path = ?path_ref, "file_id must not be empty");
        anyhow::bail!("file_id must not be empty");
    }
    if !config.components && config.collection.is_none() {
        error!(config_path = ?path_ref, "Config exports nothing");
        anyhow::bail!("Config exports nothing: enable components or name a collection");
    }

    info!(
        file_id = %config.file_id,
        output_dir = %config.output_dir.display(),
        priority = config.priority,
        components = config.components,
        collection = ?config.collection,
        "Config loaded successfully"
    );
    Ok(config)
}
