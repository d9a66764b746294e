use crate::engine::{EngineSettings, WebRtcTransportOptions};
use crate::sfu::Coordinator;
use crate::ws::connections::ConnectionManager;
use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Address RTC transports listen on
    pub listen_ip: IpAddr,
    /// Address put into ICE candidates; `listen_ip` when unset
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub idle_timeout_secs: u64,
    pub worker_exit_delay_ms: u64,
    pub static_dir: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: Some("127.0.0.1".to_string()),
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            idle_timeout_secs: 60,
            worker_exit_delay_ms: 2000,
            static_dir: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Defaults, then `conclave.toml` if present, then `CONCLAVE_*`
    /// environment variables (a `.env` file counts as environment).
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        let config: Config = ConfigBuilder::builder()
            .add_source(File::with_name("conclave").required(false))
            .add_source(Environment::with_prefix("CONCLAVE").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rtc_min_port == 0 {
            anyhow::bail!("rtc_min_port must be greater than 0");
        }
        if self.rtc_min_port > self.rtc_max_port {
            anyhow::bail!(
                "rtc_min_port ({}) is above rtc_max_port ({})",
                self.rtc_min_port,
                self.rtc_max_port
            );
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone().filter(|ip| !ip.is_empty()),
            ..Default::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            ..Default::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn worker_exit_delay(&self) -> Duration {
        Duration::from_millis(self.worker_exit_delay_ms)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(config: Config, coordinator: Arc<Coordinator>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
            coordinator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));

        let options = config.transport_options();
        assert_eq!(options.announced_ip.as_deref(), Some("127.0.0.1"));
        assert!(options.prefer_udp);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let config = Config {
            rtc_min_port: 3000,
            rtc_max_port: 2000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_announced_ip_falls_back_to_listen_ip() {
        let config = Config {
            announced_ip: Some(String::new()),
            ..Default::default()
        };
        assert!(config.transport_options().announced_ip.is_none());
    }
}
