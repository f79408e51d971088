use std::env;
use std::time::Duration;

use crate::registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    /// Sockets silent for this long are dropped.
    pub heartbeat_timeout: Duration,
    pub idle_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            port: lookup("SETLIST_RELAY_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            bind: lookup("SETLIST_RELAY_BIND")
                .filter(|b| !b.trim().is_empty())
                .unwrap_or(defaults.bind),
            heartbeat_timeout: secs("HEARTBEAT_TIMEOUT")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.heartbeat_timeout),
            // Unset or zero means rooms never expire.
            idle_ttl: secs("ROOM_IDLE_TTL").filter(|d| !d.is_zero()),
            sweep_interval: secs("ROOM_SWEEP_INTERVAL")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            idle_ttl: self.idle_ttl,
            sweep_interval: self.sweep_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            heartbeat_timeout: Duration::from_secs(120),
            idle_ttl: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test_timeout::timeout]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.idle_ttl, None);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test_timeout::timeout]
    fn env_values_override_defaults() {
        let config = config_from(&[
            ("SETLIST_RELAY_PORT", "9000"),
            ("SETLIST_RELAY_BIND", "127.0.0.1"),
            ("HEARTBEAT_TIMEOUT", "30"),
            ("ROOM_IDLE_TTL", "3600"),
            ("ROOM_SWEEP_INTERVAL", "15"),
        ]);
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        let registry = config.registry_config();
        assert_eq!(registry.idle_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(registry.sweep_interval, Duration::from_secs(15));
    }

    #[test_timeout::timeout]
    fn garbage_and_zero_fall_back() {
        let config = config_from(&[
            ("SETLIST_RELAY_PORT", "not-a-port"),
            ("HEARTBEAT_TIMEOUT", "0"),
            ("ROOM_IDLE_TTL", "0"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.idle_ttl, None);
    }
}
