use std::{
    net::SocketAddr,
    path::{
        Path,
        PathBuf,
    },
};

use color_eyre::eyre::{
    eyre,
    Error,
};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct ConfigData {
    #[serde(default)]
    pub ca: CaConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub repeater: RepeaterConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug)]
pub struct Config {
    pub data: ConfigData,
    pub path: PathBuf,
}

impl Config {
    pub const DIR_NAME: &'static str = "ferret";
    pub const CONFIG_FILE: &'static str = "ferret.toml";

    pub fn open(path: Option<impl AsRef<Path>>) -> Result<Self, Error> {
        let path = path
            .map(|path| path.as_ref().to_owned())
            .or_else(|| dirs::config_local_dir().map(|path| path.join(Self::DIR_NAME)))
            .ok_or_else(|| eyre!("Could not determine config directory"))?;

        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        }

        let config_file_path = path.join(Self::CONFIG_FILE);
        let data = if config_file_path.exists() {
            let toml = std::fs::read_to_string(&config_file_path)?;
            toml::from_str(&toml)?
        }
        else {
            let data = ConfigData::default();
            std::fs::write(&config_file_path, include_str!("../ferret.default.toml"))?;
            data
        };

        Ok(Self { data, path })
    }
}

#[derive(Debug, Deserialize)]
pub struct CaConfig {
    #[serde(default = "default_config_key_file")]
    pub key_file: PathBuf,

    #[serde(default = "default_config_cert_file")]
    pub cert_file: PathBuf,
}

fn default_config_key_file() -> PathBuf {
    "ca.key.pem".into()
}

fn default_config_cert_file() -> PathBuf {
    "ca.cert.pem".into()
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            key_file: default_config_key_file(),
            cert_file: default_config_cert_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_bind_address")]
    pub bind_address: SocketAddr,

    /// How long a tunnel's capture waits on a partial request before
    /// dropping it, in seconds.
    #[serde(default = "default_capture_idle_secs")]
    pub capture_idle_secs: u64,
}

fn default_proxy_bind_address() -> SocketAddr {
    ([127, 0, 0, 1], ferret::proxy::DEFAULT_PORT).into()
}

fn default_capture_idle_secs() -> u64 {
    3
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_proxy_bind_address(),
            capture_idle_secs: default_capture_idle_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RepeaterConfig {
    #[serde(default = "default_repeater_bind_address")]
    pub bind_address: SocketAddr,
}

fn default_repeater_bind_address() -> SocketAddr {
    ([127, 0, 0, 1], 8889).into()
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_repeater_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_file")]
    pub database_file: PathBuf,
}

fn default_database_file() -> PathBuf {
    "history.sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}
