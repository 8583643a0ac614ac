use std::path::Path;

use anyhow::{Context as _, Result};
use margin_core::config::ConfigFile;

use crate::atomic;

/// Reads and validates the config file. A missing file is the default config.
pub async fn load(path: &Path) -> Result<ConfigFile> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => {
            let cfg: ConfigFile = toml::from_str(&s)
                .with_context(|| format!("parse config: {}", path.display()))?;
            cfg.validate()
                .with_context(|| format!("validate config: {}", path.display()))?;
            Ok(cfg)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(err) => Err(err).with_context(|| format!("read config: {}", path.display())),
    }
}

/// Validates and writes `config` to `path` atomically.
pub async fn save(path: &Path, config: &ConfigFile) -> Result<()> {
    config.validate().context("validate config")?;

    let s = toml::to_string(config).context("serialize config")?;
    atomic::write_file(path, s.as_bytes())
        .await
        .with_context(|| format!("write config: {}", path.display()))
}
