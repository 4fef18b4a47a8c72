use anyhow::{Context, Result};
use directories::ProjectDirs;
use dtntunnel_core::control::TunnelConfig;
use std::fs;
use std::path::{Path, PathBuf};

const QUALIFIER: &str = "org";
const ORGANIZATION: &str = "dtnrg";
const APPLICATION: &str = "dtntunnel";
const CONFIG_FILE_NAME: &str = "dtntunnel.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist
pub fn load(path: &Path) -> Result<TunnelConfig> {
    if !path.exists() {
        return Ok(TunnelConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse TOML: {}", path.display()))
}

pub fn save(path: &Path, cfg: &TunnelConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtntunnel_core::proto::Protocol;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dtntunnel-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = scratch_dir("missing");
        let cfg = load(&dir.join("nope.toml")).expect("load");
        assert!(!cfg.listen);
        assert_eq!(cfg.max_size, TunnelConfig::default().max_size);
    }

    #[test]
    fn test_save_then_load() {
        let dir = scratch_dir("save");
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let cfg = TunnelConfig {
            protocol: Protocol::Udp,
            delay: Some(Duration::from_millis(5)),
            dest_eid: Some("dtn://far/dtntunnel".into()),
            ..Default::default()
        };

        save(&path, &cfg, false).expect("save");
        assert!(save(&path, &cfg, false).is_err());
        save(&path, &cfg, true).expect("overwrite");

        let loaded = load(&path).expect("load");
        assert_eq!(loaded.protocol, Protocol::Udp);
        assert_eq!(loaded.delay, Some(Duration::from_millis(5)));
        assert_eq!(loaded.dest_eid.as_deref(), Some("dtn://far/dtntunnel"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let dir = scratch_dir("bad");
        let path = dir.join(CONFIG_FILE_NAME);
        ensure_parent_dir(&path).expect("mkdir");
        fs::write(&path, "max_size = \"lots\"").expect("write");

        let err = load(&path).expect_err("should fail");
        assert!(err.to_string().contains("failed to parse TOML"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_default_path_is_under_project_dir() {
        // No home directory in some sandboxes
        let Ok(path) = default_config_path() else {
            return;
        };
        assert!(path.ends_with(CONFIG_FILE_NAME));
        let dirs = path.parent().map(|p| p.to_string_lossy().into_owned());
        assert!(dirs.is_some_and(|d| d.contains(APPLICATION)), "{}", path.display());
    }
}
