use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::orchestration::{PoolConfig, RetryMode, RetryPolicy};
use crate::workspace::{IntegrationStrategy, DEFAULT_COPY_PATTERNS};
use crate::{elog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_mode: RetryMode,
    pub isolation: bool,
    pub worktree_dir: Option<String>,
    pub integration: IntegrationStrategy,
    pub target_branch: Option<String>,
    pub implement_command: Option<String>,
    pub verify_command: Option<String>,
    pub copy_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 0,
            retry_mode: RetryMode::Full,
            isolation: true,
            worktree_dir: None,
            integration: IntegrationStrategy::Branch,
            target_branch: None,
            implement_command: None,
            verify_command: None,
            copy_patterns: DEFAULT_COPY_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Config {
    pub fn base_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".epic-executor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::base_dir()?.join("worktrees")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        elog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            elog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        elog_debug!(
            "Config loaded: max_concurrent={}, isolation={}, integration={:?}, retries={}",
            config.max_concurrent,
            config.isolation,
            config.integration,
            config.max_retries
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent: self.max_concurrent,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                mode: self.retry_mode,
            },
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let base = Self::base_dir()?;
        let worktrees = self.worktrees_dir()?;
        for dir in [base, worktrees] {
            if !dir.exists() {
                elog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
