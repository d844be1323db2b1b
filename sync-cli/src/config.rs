//! Configuration file handling for the peersync binary.

use anyhow::{Context, Result};
use peersync_peer::Config;
use std::path::Path;

/// Configuration file used when `--config` / `--path` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "peersync.toml";

/// Load and validate the configuration at `path`.
///
/// A relative `sync.root` is taken relative to the directory holding the
/// configuration file, so a node can be started from anywhere.
pub fn load(path: &Path) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Configuration rejected")?;

    if config.sync.root.is_relative() {
        if let Some(dir) = path.parent() {
            config.sync.root = dir.join(&config.sync.root);
        }
    }
    Ok(config)
}

/// Write `config` to `path`, refusing to replace a file unless `force`.
pub async fn save(config: &Config, path: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(path).await.unwrap_or(false) {
        anyhow::bail!(
            "{} already exists. Pass --force to overwrite it.",
            path.display()
        );
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let contents = config.to_toml()?;
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.toml");
        save(&Config::default(), &path, false).await.unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.node, Config::default().node);
        assert_eq!(loaded.sync.root, dir.path().join("share"));
    }

    #[tokio::test]
    async fn save_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.toml");
        save(&Config::default(), &path, false).await.unwrap();

        assert!(save(&Config::default(), &path, false).await.is_err());
        assert!(save(&Config::default(), &path, true).await.is_ok());
    }

    #[test]
    fn absolute_root_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.toml");
        let share = dir.path().join("elsewhere");
        std::fs::write(&path, format!("[sync]\nroot = {:?}\n", share.display().to_string())).unwrap();

        assert_eq!(load(&path).unwrap().sync.root, share);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.toml");
        std::fs::write(&path, "[sync]\nblock_size = 0\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("block_size"));
    }
}
