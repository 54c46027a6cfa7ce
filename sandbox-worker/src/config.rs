use anyhow::{Context, Result};
use sandbox_orchestrator::OrchestratorSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Worker configuration. Every field falls back to an environment variable,
/// then to a built-in default; a YAML file overrides both.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub terraform: TerraformConfig,

    #[serde(default = "default_orchestrator")]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerraformConfig {
    #[serde(default = "default_terraform_binary")]
    pub binary: PathBuf,

    /// Parent directory of every deployment workspace.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Directory holding the `*.tf` files copied into each workspace.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn data_dir() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("sandbox")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".sandbox")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn default_db_path() -> PathBuf {
    std::env::var("SANDBOX_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("sandbox.db"))
}

fn default_sweep_interval() -> u64 {
    env_parse("SANDBOX_SWEEP_INTERVAL").unwrap_or(60)
}

fn default_terraform_binary() -> PathBuf {
    std::env::var("SANDBOX_TERRAFORM_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("terraform"))
}

fn default_workspace_root() -> PathBuf {
    std::env::var("SANDBOX_TERRAFORM_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("deployments"))
}

fn default_template_dir() -> PathBuf {
    std::env::var("SANDBOX_TERRAFORM_TEMPLATE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("terraform"))
}

fn default_command_timeout() -> u64 {
    // One creation deadline plus a little slack for init.
    env_parse("SANDBOX_TERRAFORM_TIMEOUT").unwrap_or(1900)
}

fn default_orchestrator() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    if let Some(v) = env_parse("SANDBOX_BATCH_SIZE") {
        settings.batch_size = v;
    }
    if let Some(v) = env_parse("SANDBOX_GROUP_COOLDOWN") {
        settings.group_cooldown_secs = v;
    }
    if let Some(v) = env_parse("SANDBOX_CLEANUP_GRACE") {
        settings.cleanup_grace_secs = v;
    }
    if let Some(v) = env_parse("SANDBOX_WORKER_POOL_SIZE") {
        settings.worker_pool_size = v;
    }
    settings
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: default_terraform_binary(),
            workspace_root: default_workspace_root(),
            template_dir: default_template_dir(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sweep_interval_secs: default_sweep_interval(),
            terraform: TerraformConfig::default(),
            orchestrator: default_orchestrator(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` when given, the environment otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let config = Self::from_env();
            config.validate()?;
            return Ok(config);
        };

        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&source)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be at least 1");
        }
        self.orchestrator.validate()?;
        Ok(())
    }
}
