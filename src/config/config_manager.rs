use super::KubestrapConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "kubestrap";
const CONFIG_FILE_NAME: &str = "config.toml";

pub fn get_config_dir() -> Result<PathBuf> {
    let home = get_home_dir()?;
    Ok(home.join(".config").join(CONFIG_DIR_NAME))
}

pub fn get_config_file_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

fn get_home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE")) // Windows fallback
        .map(PathBuf::from)
        .with_context(|| "Could not determine home directory")
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.to_str().and_then(|p| p.strip_prefix("~/")) {
        Some(rest) => Ok(get_home_dir()?.join(rest)),
        None => Ok(path.to_path_buf()),
    }
}

/// Load `~/.config/kubestrap/config.toml`, or defaults when it does not exist
pub fn load_config() -> Result<KubestrapConfig> {
    load_config_from(&get_config_file_path()?)
}

pub fn load_config_from(config_path: &Path) -> Result<KubestrapConfig> {
    if !config_path.exists() {
        return Ok(KubestrapConfig::default());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let mut config: KubestrapConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

    for key in config.ssh.keys.values_mut() {
        key.private_key_path = expand_home(&key.private_key_path)?;
        if let Some(public) = key.public_key_path.take() {
            key.public_key_path = Some(expand_home(&public)?);
        }
    }

    Ok(config)
}

pub fn save_config(config: &KubestrapConfig) -> Result<()> {
    save_config_to(config, &get_config_file_path()?)
}

pub fn save_config_to(config: &KubestrapConfig, config_path: &Path) -> Result<()> {
    if let Some(dir) = config_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    }

    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(config_path, content)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshKeyConfig;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, KubestrapConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = KubestrapConfig::default();
        config.ssh.keys.insert(
            "ops".to_string(),
            SshKeyConfig {
                private_key_path: PathBuf::from("/keys/ops"),
                public_key_path: Some(PathBuf::from("/keys/ops.pub")),
            },
        );
        config.timeouts.apiserver_ready_secs = 42;

        save_config_to(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[ssh\nuser = ").unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
