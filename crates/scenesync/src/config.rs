use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{SyncError, SyncResult};

/// Relay settings, read from command line flags or the environment
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "scenesync-relay")]
#[command(about = "Shared 3D scene relay: room sessions, pose broadcast and scene replication")]
pub struct RelayConfig {
    /// Forces plaintext serving even when certificates are configured
    #[arg(
        long,
        env = "DEBUG",
        default_value = "false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub debug: bool,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    #[arg(long, env = "PORT_HTTP", default_value_t = 8080)]
    pub port_http: u16,

    #[arg(long, env = "PORT_HTTPS", default_value_t = 443)]
    pub port_https: u16,

    /// TLS certificate path
    #[arg(long, env = "CERT_PATH")]
    pub cert_path: Option<PathBuf>,

    /// TLS private key path
    #[arg(long, env = "KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Pose broadcasts per second
    #[arg(long, env = "TICK_HZ", default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    pub tick_hz: u32,

    /// Seconds an empty room is kept before eviction
    #[arg(long = "room-idle-secs", env = "ROOM_IDLE_SECS", default_value = "600", value_parser = parse_secs)]
    pub room_idle: Duration,

    /// Directory for room archives; persistence is off when unset
    #[arg(long, env = "STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[arg(
        long = "persist-interval-secs",
        env = "PERSIST_INTERVAL_SECS",
        default_value = "10",
        value_parser = parse_secs
    )]
    pub persist_interval: Duration,

    /// Directory of static client files served on plain GET requests
    #[arg(long, env = "PUBLIC_PATH")]
    pub public_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            debug: false,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_http: 8080,
            port_https: 443,
            cert_path: None,
            key_path: None,
            tick_hz: 30,
            room_idle: Duration::from_secs(600),
            storage_path: None,
            persist_interval: Duration::from_secs(10),
            public_path: None,
        }
    }
}

impl RelayConfig {
    /// Parse the process arguments and environment, exiting on `--help` or bad input
    pub fn load() -> Self {
        Self::parse()
    }

    /// Parse an explicit argument list, falling back to the environment
    pub fn try_load_from<I, T>(args: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Certificate and key paths when encrypted serving is enabled
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        if self.debug {
            return None;
        }
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_hz.max(1)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port_http)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port_https)
    }
}

fn parse_secs(value: &str) -> Result<Duration, ParseIntError> {
    value.trim().parse().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // environment variables are process wide
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(args: &[&str]) -> SyncResult<RelayConfig> {
        let argv = std::iter::once("scenesync-relay").chain(args.iter().copied());
        RelayConfig::try_load_from(argv)
    }

    #[test]
    fn test_defaults() {
        let _guard = env_lock();
        let config = load(&["--debug", "false"]).unwrap();
        assert_eq!(config.http_addr().port(), 8080);
        assert_eq!(config.https_addr().port(), 443);
        assert_eq!(config.tick_interval(), Duration::from_secs(1) / 30);
        assert_eq!(config.room_idle, RelayConfig::default().room_idle);
        assert_eq!(config.persist_interval, Duration::from_secs(10));
        assert!(config.tls().is_none());
    }

    #[test]
    fn test_tls_requires_both_paths_and_no_debug() {
        let _guard = env_lock();
        let config = load(&["--cert-path", "/etc/cert.pem", "--key-path", "/etc/key.pem"]).unwrap();
        assert_eq!(
            config.tls(),
            Some((Path::new("/etc/cert.pem"), Path::new("/etc/key.pem")))
        );

        let debug = load(&[
            "--cert-path",
            "/etc/cert.pem",
            "--key-path",
            "/etc/key.pem",
            "--debug",
            "true",
        ])
        .unwrap();
        assert!(debug.tls().is_none());

        let config = RelayConfig {
            cert_path: Some(PathBuf::from("/etc/cert.pem")),
            ..RelayConfig::default()
        };
        assert!(config.tls().is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let _guard = env_lock();
        let vars = [
            ("PORT_HTTP", "9000"),
            ("TICK_HZ", "60"),
            ("ROOM_IDLE_SECS", "5"),
            ("STORAGE_PATH", "/var/lib/scenes"),
            ("BIND_ADDR", "127.0.0.1"),
            ("DEBUG", "yes"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let loaded = load(&[]);
        // flags win over the environment
        let flagged = load(&["--port-http", "9100"]);
        for (key, _) in vars {
            std::env::remove_var(key);
        }

        let config = loaded.unwrap();
        assert_eq!(config.port_http, 9000);
        assert_eq!(config.tick_hz, 60);
        assert_eq!(config.room_idle, Duration::from_secs(5));
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/scenes")));
        assert_eq!(config.http_addr().to_string(), "127.0.0.1:9000");
        assert!(config.debug);
        assert_eq!(flagged.unwrap().port_http, 9100);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let _guard = env_lock();
        assert!(matches!(
            load(&["--port-http", "http"]),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            load(&["--room-idle-secs", "soon"]),
            Err(SyncError::Config(_))
        ));
        tokio_test::assert_err!(load(&["--tick-hz", "0"]));
        tokio_test::assert_ok!(load(&["--tick-hz", "1"]));
    }
}
