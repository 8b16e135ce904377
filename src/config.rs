use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

pub const ENV_PREFIX: &str = "CIDNET";

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub url: String,
    pub identity: String,
}

///
/// Runtime settings. Read from an optional config file (any format the
/// `config` crate understands, `config.toml` by default) and overridden by
/// `CIDNET_*` environment variables, e.g. `CIDNET_PAGE_SIZE=50`.
///
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub page_size: usize,
    pub request_timeout_ms: u64,
    pub log_level: String,
    #[serde(default)]
    pub servers: Vec<ServerSettings>,
}

impl Settings {
    fn defaults() -> Result<config::Config> {
        let mut settings = config::Config::default();
        settings.set_default("data_dir", "data")?;
        settings.set_default("key_path", "keyfile")?;
        settings.set_default("page_size", 20)?;
        settings.set_default("request_timeout_ms", 10_000)?;
        settings.set_default("log_level", "info")?;
        Ok(settings)
    }

    pub fn load(config_name: &str) -> Result<Settings> {
        let mut settings = Settings::defaults()?;
        settings
            .merge(config::File::with_name(config_name).required(false))?
            .merge(config::Environment::with_prefix(ENV_PREFIX))?;
        Ok(settings.try_into()?)
    }

    /// Defaults only; used by tests and tools that do not read a file.
    pub fn default_settings() -> Result<Settings> {
        Ok(Settings::defaults()?.try_into()?)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
