//! TOML config file loading and validation. Every section is optional; a
//! missing file means all defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Prefix under which the machine's keys live, e.g. `greenheat/status`.
    pub topic_prefix: String,
    pub keep_alive_sec: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "greenheat-dashboard".to_string(),
            topic_prefix: "greenheat".to_string(),
            keep_alive_sec: 30,
        }
    }
}

/// Liveness thresholds, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Maximum heartbeat age (server clock) still considered fresh.
    pub fresh_ms: u64,
    /// Maximum silence on the data stream (local clock) still considered alive.
    pub quiet_ms: u64,
    /// How long after start to wait for a first heartbeat before forcing offline.
    pub startup_grace_ms: u64,
    /// Period of the silence-detection tick.
    pub tick_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        // The machine beats every 5 s.
        Self {
            fresh_ms: 7_000,
            quiet_ms: 10_000,
            startup_grace_ms: 8_000,
            tick_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Delay before a written action is cleared back to "".
    pub clear_delay_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            clear_delay_ms: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_watchdog(&mut errors);

        if self.commands.clear_delay_ms == 0 {
            errors.push("commands: clear_delay_ms must be positive".to_string());
        }
        if self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }

        let prefix = m.topic_prefix.trim();
        if prefix.is_empty() {
            errors.push("mqtt: topic_prefix is empty".to_string());
        } else if prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt: topic_prefix '{prefix}' must not contain wildcards"
            ));
        } else if prefix.ends_with('/') {
            errors.push(format!(
                "mqtt: topic_prefix '{prefix}' must not end with '/'"
            ));
        }
    }

    fn validate_watchdog(&self, errors: &mut Vec<String>) {
        let w = &self.watchdog;

        for (name, value) in [
            ("fresh_ms", w.fresh_ms),
            ("quiet_ms", w.quiet_ms),
            ("startup_grace_ms", w.startup_grace_ms),
            ("tick_interval_ms", w.tick_interval_ms),
        ] {
            if value == 0 {
                errors.push(format!("watchdog: {name} must be positive"));
            }
        }

        // A tick coarser than the freshness window could miss a whole
        // expiry between two evaluations.
        if w.tick_interval_ms > w.fresh_ms {
            errors.push(format!(
                "watchdog: tick_interval_ms ({}) exceeds fresh_ms ({})",
                w.tick_interval_ms, w.fresh_ms
            ));
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `TOPIC_PREFIX` and `WEB_PORT`.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(prefix) = env::var("TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Load, apply env overrides, then validate.
pub fn resolve(path: &str) -> Result<Config> {
    let mut config = load(path)?;
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    let w = &config.watchdog;
    if w.quiet_ms < w.fresh_ms {
        tracing::warn!(
            quiet_ms = w.quiet_ms,
            fresh_ms = w.fresh_ms,
            "quiet_ms below fresh_ms: data-stream silence will expire before the heartbeat does"
        );
    }
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[mqtt]
host = "broker.local"
port = 8883
client_id = "dash-1"
topic_prefix = "site/greenheat"
keep_alive_sec = 15

[watchdog]
fresh_ms = 9000
quiet_ms = 15000
startup_grace_ms = 8000
tick_interval_ms = 1000

[commands]
clear_delay_ms = 1200

[web]
port = 9090
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.topic_prefix, "site/greenheat");
        assert_eq!(config.watchdog.fresh_ms, 9000);
        assert_eq!(config.watchdog.tick_interval_ms, 1000);
        assert_eq!(config.commands.clear_delay_ms, 1200);
        assert_eq!(config.web.port, 9090);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.watchdog, WatchdogConfig::default());
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.commands.clear_delay_ms, 900);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_section_fills_defaults() {
        let config: Config = toml::from_str("[watchdog]\nfresh_ms = 12000\n").unwrap();
        assert_eq!(config.watchdog.fresh_ms, 12_000);
        assert_eq!(config.watchdog.quiet_ms, 10_000);
        assert_eq!(config.watchdog.tick_interval_ms, 2_000);
    }

    #[test]
    fn default_thresholds() {
        let w = WatchdogConfig::default();
        assert_eq!(w.fresh_ms, 7_000);
        assert_eq!(w.quiet_ms, 10_000);
        assert_eq!(w.startup_grace_ms, 8_000);
        assert_eq!(w.tick_interval_ms, 2_000);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let config = load("/nonexistent/greenheat-dashboard.toml").unwrap();
        assert_eq!(config.mqtt.topic_prefix, "greenheat");
    }

    // -- Watchdog ---------------------------------------------------------

    #[test]
    fn zero_thresholds_rejected() {
        let mut cfg = Config::default();
        cfg.watchdog.quiet_ms = 0;
        assert_validation_err(&cfg, "quiet_ms must be positive");

        let mut cfg = Config::default();
        cfg.watchdog.startup_grace_ms = 0;
        assert_validation_err(&cfg, "startup_grace_ms must be positive");
    }

    #[test]
    fn tick_coarser_than_fresh_rejected() {
        let mut cfg = Config::default();
        cfg.watchdog.tick_interval_ms = 8_000;
        assert_validation_err(&cfg, "tick_interval_ms (8000) exceeds fresh_ms (7000)");
    }

    #[test]
    fn quiet_below_fresh_is_allowed() {
        let mut cfg = Config::default();
        cfg.watchdog.fresh_ms = 15_000;
        cfg.watchdog.quiet_ms = 10_000;
        cfg.validate().unwrap();
    }

    // -- MQTT -------------------------------------------------------------

    #[test]
    fn wildcard_prefix_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic_prefix = "greenheat/#".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn trailing_slash_prefix_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic_prefix = "greenheat/".into();
        assert_validation_err(&cfg, "must not end with '/'");
    }

    #[test]
    fn empty_client_id_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.client_id = " ".into();
        assert_validation_err(&cfg, "client_id is empty");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = "".into();
        cfg.watchdog.fresh_ms = 0;
        cfg.commands.clear_delay_ms = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("host is empty"), "missing host error in: {msg}");
        assert!(msg.contains("fresh_ms must be positive"), "missing fresh error in: {msg}");
        assert!(msg.contains("clear_delay_ms"), "missing command error in: {msg}");
        assert!(msg.contains("errors"), "expected plural count in: {msg}");
    }
}
