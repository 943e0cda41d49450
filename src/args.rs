use crate::config::{Config, ProviderKind};
use crate::error::{Error, Result};
use clap::Args;
use std::path::PathBuf;

// Global flags shared across every subcommand.
#[derive(Debug, Clone, Args, Default)]
pub struct CommonArgs {
    /// Path to a config.toml file
    #[arg(
        short = 'c',
        long,
        value_name = "PATH",
        env = "CLAWLINE_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Provider override: twilio, telnyx, plivo, voximplant, mock
    #[arg(long, value_name = "PROVIDER", env = "CLAWLINE_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Explicit public URL (skips tunnel/LAN resolution)
    #[arg(long, value_name = "URL", env = "CLAWLINE_PUBLIC_URL", global = true)]
    pub public_url: Option<String>,
}

impl CommonArgs {
    fn default_config_path() -> Option<PathBuf> {
        let path = dirs::home_dir()?.join(".clawline").join("config.toml");
        path.exists().then_some(path)
    }

    /// Load the effective config: explicit path, else `~/.clawline/
    /// config.toml` when present, else mock-provider defaults.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match self.config.clone().or_else(Self::default_config_path) {
            Some(path) => Config::load(&path)?,
            None => Config::for_provider(ProviderKind::Mock),
        };

        if let Some(provider) = &self.provider {
            config.provider = match provider.to_lowercase().as_str() {
                "twilio" => ProviderKind::Twilio,
                "telnyx" => ProviderKind::Telnyx,
                "plivo" => ProviderKind::Plivo,
                "voximplant" => ProviderKind::Voximplant,
                "mock" => ProviderKind::Mock,
                other => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown provider '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(url) = &self.public_url {
            config.public_url = Some(url.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_override_applies() {
        let args = CommonArgs {
            provider: Some("mock".into()),
            ..Default::default()
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.provider, ProviderKind::Mock);

        let bad = CommonArgs {
            provider: Some("carrier-pigeon".into()),
            ..Default::default()
        };
        assert!(bad.load_config().is_err());
    }
}
