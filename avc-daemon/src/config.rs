use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::downloader::DownloaderConfig;
use crate::downloader::retry::RetryPolicy;
use crate::session::SessionConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub lwm2m: Lwm2mConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the local control API to listen on
    pub http_addr: SocketAddr,
}

/// Where resume info, update records and pending notifications live.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
    File { dir: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory holding downloaded packages
    pub work_dir: PathBuf,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub chunk_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Extra root certificate (PEM) trusted for HTTPS package servers
    pub ca_cert: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("avc-packages"),
            max_attempts: 5,
            backoff_base_ms: 1000,
            chunk_timeout_secs: 30,
            connect_timeout_secs: 10,
            ca_cert: None,
        }
    }
}

impl DownloadConfig {
    pub fn downloader(&self) -> DownloaderConfig {
        DownloaderConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                ..RetryPolicy::default()
            },
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Minutes to wait after each failed session attempt, zero entries skipped
    pub retry_timers_min: Vec<u64>,
    pub activity_timer_secs: u64,
    /// Minutes between polling sessions, disabled when unset
    pub polling_interval_min: Option<u64>,
    pub download_user_agreement: bool,
    pub push_ack_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry_timers_min: vec![15, 60, 240, 480, 1440, 2880, 0, 0],
            activity_timer_secs: 20,
            polling_interval_min: None,
            download_user_agreement: true,
            push_ack_timeout_secs: 30,
        }
    }
}

impl SessionSettings {
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            retry_timers: self
                .retry_timers_min
                .iter()
                .map(|minutes| Duration::from_secs(minutes * 60))
                .collect(),
            activity_timeout: Duration::from_secs(self.activity_timer_secs),
            polling_interval: self
                .polling_interval_min
                .filter(|minutes| *minutes > 0)
                .map(|minutes| Duration::from_secs(minutes * 60)),
            download_user_agreement: self.download_user_agreement,
        }
    }

    pub fn push_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.push_ack_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Lwm2mConfig {
    /// In-process client that accepts every session and acks every push
    Mock {
        #[serde(default)]
        ack_delay_ms: u64,
    },
}

impl Default for Lwm2mConfig {
    fn default() -> Self {
        Lwm2mConfig::Mock { ack_delay_ms: 0 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InstallerConfig {
    #[default]
    Noop,
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Config {
    pub fn load(path: &PathBuf) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            },
            storage: StorageConfig::Memory,
            download: DownloadConfig::default(),
            session: SessionSettings::default(),
            lwm2m: Lwm2mConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}
