/// `load_config` module: loads the static YAML deployment settings.
///
/// Deployment settings carry no secrets: the API key, bucket and project always come from the
/// environment (see `etf_ingest_core::deploy::DeployEnv`). Every field in the YAML file is
/// optional and falls back to the defaults of [`DeploySettings`]; unknown keys are rejected so
/// typos surface instead of silently deploying with defaults.
///
/// # Errors
/// All errors use `anyhow::Error` for context-rich diagnostics and are surfaced at the CLI boundary.
use anyhow::Result;
use etf_ingest_core::deploy::DeploySettings;
use std::fs;
use std::path::Path;
use tracing::{error, info};

/// Loads deployment settings from `path`, or the defaults when no path is given.
pub fn load_settings<P: AsRef<Path>>(path: Option<P>) -> Result<DeploySettings> {
    let Some(path) = path else {
        info!("No deployment config given, using default settings");
        return Ok(DeploySettings::default());
    };
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading deployment settings from file");

    let content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    // An empty file is valid YAML for "all defaults", but serde_yaml reads it as a unit.
    if content.trim().is_empty() {
        return Ok(DeploySettings::default());
    }

    match serde_yaml::from_str::<DeploySettings>(&content) {
        Ok(settings) => {
            info!(
                config_path = ?path_ref,
                region = %settings.region,
                topic = %settings.topic,
                "Parsed deployment settings YAML successfully"
            );
            Ok(settings)
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            Err(anyhow::anyhow!("Failed to parse config YAML: {e}"))
        }
    }
}
