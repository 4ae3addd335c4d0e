//! Configuration module for detour
//!
//! JSON configuration. Every section has defaults, so `{}` is a valid file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::Address;
use crate::detour::{EngineConfig, Thresholds, DEFAULT_BLOCKED_DELTA, DEFAULT_DIRECT_DELTA};
use crate::error::{Error, Result};
use crate::protocol::Socks5Config;
use crate::router::{Rule, RulePolicy, Strategy};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// API configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,

    /// Local SOCKS5 listener
    #[serde(default)]
    pub inbound: InboundConfig,

    /// Upstream relay backing the proxy path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    /// Routing engine tuning
    #[serde(default)]
    pub detour: DetourConfig,

    /// Forced strategies, first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<RoutingRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            api: None,
            inbound: InboundConfig::default(),
            upstream: None,
            detour: DetourConfig::default(),
            rules: default_rules(),
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for stats API (e.g., "127.0.0.1:9090")
    pub listen: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detour;
        if d.blocked_delta < 1 || d.direct_delta < 1 {
            return Err(Error::Config("detour deltas must be at least 1".into()));
        }
        if d.dial_timeout_ms == 0 || d.blocked_dial_timeout_ms == 0 || d.read_timeout_ms == 0 {
            return Err(Error::Config("detour timeouts must be non-zero".into()));
        }
        if d.save_interval_secs == 0 {
            return Err(Error::Config("save_interval_secs must be non-zero".into()));
        }
        if let Some(upstream) = &self.upstream {
            if upstream.address.is_empty() || upstream.port == 0 {
                return Err(Error::Config("upstream needs an address and a port".into()));
            }
        }
        Ok(())
    }

    /// Compile the configured rules
    pub fn build_policy(&self) -> Result<RulePolicy> {
        RulePolicy::new(self.rules.iter().map(RoutingRule::to_rule).collect())
    }

    /// Create a default client configuration
    pub fn default_client() -> Self {
        Config {
            api: Some(ApiConfig {
                listen: "127.0.0.1:9090".to_string(),
            }),
            upstream: Some(UpstreamConfig {
                address: "relay.example.com".to_string(),
                port: 1080,
                username: None,
                password: None,
            }),
            ..Config::default()
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Local SOCKS5 inbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1080))
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            username: None,
            password: None,
        }
    }
}

impl InboundConfig {
    pub fn socks5(&self) -> Socks5Config {
        Socks5Config {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Upstream SOCKS5 relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Server address (IP or domain)
    pub address: String,

    /// Server port
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UpstreamConfig {
    pub fn server(&self) -> Address {
        match self.address.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, self.port)),
            Err(_) => Address::domain(self.address.clone(), self.port),
        }
    }

    pub fn socks5(&self) -> Socks5Config {
        Socks5Config {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Routing engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetourConfig {
    /// Statistics file; `<file>.bak` and `<file>.tmp` live next to it
    #[serde(default = "default_stat_file")]
    pub stat_file: PathBuf,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Direct dial timeout for hosts detoured since their last direct visit
    #[serde(default = "default_blocked_dial_timeout_ms")]
    pub blocked_dial_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Read errors within this many bytes are blocking signals
    #[serde(default = "default_early_window_bytes")]
    pub early_window_bytes: u64,

    #[serde(default = "default_blocked_delta")]
    pub blocked_delta: i8,

    #[serde(default = "default_direct_delta")]
    pub direct_delta: i8,

    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    /// Entries untouched for longer are not persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_days: Option<u32>,
}

fn default_stat_file() -> PathBuf {
    PathBuf::from("stat.json")
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_blocked_dial_timeout_ms() -> u64 {
    3000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_early_window_bytes() -> u64 {
    4096
}

fn default_blocked_delta() -> i8 {
    DEFAULT_BLOCKED_DELTA
}

fn default_direct_delta() -> i8 {
    DEFAULT_DIRECT_DELTA
}

fn default_save_interval_secs() -> u64 {
    30
}

impl Default for DetourConfig {
    fn default() -> Self {
        Self {
            stat_file: default_stat_file(),
            dial_timeout_ms: default_dial_timeout_ms(),
            blocked_dial_timeout_ms: default_blocked_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            early_window_bytes: default_early_window_bytes(),
            blocked_delta: default_blocked_delta(),
            direct_delta: default_direct_delta(),
            save_interval_secs: default_save_interval_secs(),
            stale_after_days: None,
        }
    }
}

impl DetourConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            blocked_dial_timeout: Duration::from_millis(self.blocked_dial_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            early_window: self.early_window_bytes,
            thresholds: Thresholds {
                blocked_delta: self.blocked_delta,
                direct_delta: self.direct_delta,
            },
        }
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

/// Routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Domain patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,

    /// IP patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,

    /// "direct", "proxy" or "auto"
    pub strategy: Strategy,
}

impl RoutingRule {
    fn to_rule(&self) -> Rule {
        Rule {
            domain: self.domain.clone(),
            ip: self.ip.clone(),
            strategy: self.strategy,
        }
    }
}

fn default_rules() -> Vec<RoutingRule> {
    vec![RoutingRule {
        domain: vec!["domain:cn".to_string()],
        ip: vec!["private".to_string()],
        strategy: Strategy::AlwaysDirect,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingPolicy;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.inbound.listen, "127.0.0.1:1080".parse().unwrap());
        assert!(config.upstream.is_none());
        assert_eq!(config.detour.engine_config(), EngineConfig::default());
        assert_eq!(config.detour.save_interval(), Duration::from_secs(30));
        assert_eq!(config.detour.stat_file, PathBuf::from("stat.json"));

        let policy = config.build_policy().unwrap();
        assert_eq!(policy.get_rule("www.b.cn"), Strategy::AlwaysDirect);
        assert_eq!(policy.get_rule("example.com"), Strategy::AutoTry);
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_json(
            r#"{
                "log": {"level": "debug"},
                "api": {"listen": "127.0.0.1:9191"},
                "inbound": {"listen": "0.0.0.0:1081", "username": "u", "password": "p"},
                "upstream": {"address": "10.1.2.3", "port": 1090},
                "detour": {"stat_file": "/tmp/s.json", "blocked_delta": 3, "stale_after_days": 90},
                "rules": [
                    {"domain": ["keyword:google"], "strategy": "proxy"},
                    {"ip": ["10.0.0.0/8"], "strategy": "direct"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.log.level, "debug");
        assert!(config.inbound.socks5().requires_auth());
        assert_eq!(
            config.upstream.as_ref().unwrap().server(),
            "10.1.2.3:1090".parse().unwrap()
        );
        assert_eq!(config.detour.engine_config().thresholds.blocked_delta, 3);
        assert_eq!(config.detour.stale_after_days, Some(90));

        let policy = config.build_policy().unwrap();
        assert_eq!(policy.len(), 2);
        assert_eq!(policy.get_rule("www.google.com"), Strategy::AlwaysProxy);
        // configured rules replace the defaults
        assert_eq!(policy.get_rule("b.cn"), Strategy::AutoTry);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_json(r#"{"detour": {"direct_delta": 0}}"#).is_err());
        assert!(Config::from_json(r#"{"detour": {"dial_timeout_ms": 0}}"#).is_err());
        assert!(Config::from_json(r#"{"rules": [{"strategy": "sometimes"}]}"#).is_err());
        assert!(Config::from_json(r#"{"upstream": {"address": "", "port": 1080}}"#).is_err());
    }

    #[test]
    fn test_default_client_config() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(
            parsed.upstream.unwrap().server(),
            Address::domain("relay.example.com", 1080)
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"inbound": {"listen": "127.0.0.1:2080"}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.inbound.listen.port(), 2080);
        assert!(Config::load(dir.path().join("missing.json")).is_err());
    }
}
