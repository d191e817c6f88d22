//! `murmur config`: Configuration management commands.

use anyhow::{Context, bail};
use murmur_config::AppConfig;

pub fn init(force: bool) -> anyhow::Result<()> {
    let dir = AppConfig::config_dir();
    let path = dir.join("config.toml");
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(&path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✅ Wrote {}", path.display());
    println!("   Set MURMUR_API_KEY or OPENAI_API_KEY, or add api_key to the file.");
    Ok(())
}

pub fn show() -> anyhow::Result<()> {
    let config = super::load_config()?;
    println!("{}", render(&config)?);
    Ok(())
}

/// The configuration as TOML, with the API key masked.
pub fn render(config: &AppConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some("[REDACTED]".into());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }

    #[test]
    fn api_key_is_masked() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let text = render(&config).unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(text.contains("[REDACTED]"));
    }
}
