use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use aql_compiler::CompilerConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "aqlc.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub compiler: CompilerConfig,
    pub logging: LoggingConfig,
    pub fixtures: FixturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Collaborator fixtures used when the command line names none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixturesConfig {
    pub knowledge: Option<PathBuf>,
    pub terminology: Option<PathBuf>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.compiler.validate()?;
        let level = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&level.as_str()) {
            bail!("logging.level must be one of {valid_levels:?}");
        }
        Ok(())
    }
}

/// Load `path` (or `aqlc.toml` when present), layer `AQLC__SECTION__KEY`
/// environment variables on top, then validate.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Config::builder();
    match path {
        Some(p) => {
            if !p.exists() {
                bail!("config file {} does not exist", p.display());
            }
            builder = builder.add_source(File::from(p));
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path));
            }
        }
    }
    builder = builder.add_source(
        Environment::with_prefix("AQLC")
            .try_parsing(true)
            .separator("__"),
    );

    let cfg = builder.build().context("config build error")?;
    let mut merged: AppConfig = cfg
        .try_deserialize()
        .context("config deserialize error")?;
    merged.compiler = merged.compiler.with_env_overrides();
    merged.validate()?;
    Ok(merged)
}
