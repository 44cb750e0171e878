//! TOML configuration loading with `MIXER_`-prefixed environment overrides.
//!
//! Follows the `serde` + `toml` shape the rest of the workspace already uses
//! for on-disk state.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use mixer_types::{MixerError, Result};

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_tree_height() -> usize {
    20
}

/// On-disk / environment representation. Every field is a plain TOML scalar;
/// validation and type-narrowing (hex address, durations) happens in
/// [`Config::validate`], which runs once, up front, before any component
/// starts.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub rpc_url: String,
    pub poll_interval_sec: f64,
    #[serde(default = "default_rpc_retry_interval_sec")]
    pub rpc_retry_interval_sec: f64,
    #[serde(default = "default_rpc_query_interval_sec")]
    pub rpc_query_interval_sec: f64,
    pub contract_address: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_tree_height")]
    pub tree_height: usize,
    pub store_path: PathBuf,
    #[serde(default = "default_request_timeout_ms")]
    pub rpc_request_timeout_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub sqlite_busy_timeout_ms: u64,
}

fn default_rpc_retry_interval_sec() -> f64 {
    5.0
}

fn default_rpc_query_interval_sec() -> f64 {
    0.2
}

/// Validated configuration, ready to hand to the components it wires.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub poll_interval: Duration,
    pub rpc_retry_interval: Duration,
    pub rpc_query_interval: Duration,
    pub contract_address: String,
    pub start_block: u64,
    pub tree_height: usize,
    pub store_path: PathBuf,
    pub rpc_request_timeout: Duration,
    pub sqlite_busy_timeout: Duration,
}

impl Config {
    /// Load `path`, apply `MIXER_*` environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MixerError::Config(format!("reading {}: {e}", path.display())))?;
        let mut raw: RawConfig = toml::from_str(&text)
            .map_err(|e| MixerError::Config(format!("parsing {}: {e}", path.display())))?;
        apply_env_overrides(&mut raw)?;
        Config::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self> {
        let scheme_ok = raw.rpc_url.starts_with("http://")
            || raw.rpc_url.starts_with("https://")
            || raw.rpc_url.starts_with("ws://")
            || raw.rpc_url.starts_with("wss://");
        if !scheme_ok {
            return Err(MixerError::Config(format!(
                "unsupported rpc_url scheme: {}",
                raw.rpc_url
            )));
        }

        let address = raw.contract_address.trim();
        let hex_part = address.strip_prefix("0x").unwrap_or(address);
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MixerError::Config(format!(
                "contract_address is not a 20-byte hex string: {}",
                raw.contract_address
            )));
        }

        for (name, value) in [
            ("poll_interval_sec", raw.poll_interval_sec),
            ("rpc_retry_interval_sec", raw.rpc_retry_interval_sec),
            ("rpc_query_interval_sec", raw.rpc_query_interval_sec),
        ] {
            if !(value > 0.0) {
                return Err(MixerError::Config(format!("{name} must be positive, got {value}")));
            }
        }

        if raw.tree_height == 0 {
            return Err(MixerError::Config("tree_height must be >= 1".into()));
        }

        Ok(Config {
            rpc_url: raw.rpc_url,
            poll_interval: Duration::from_secs_f64(raw.poll_interval_sec),
            rpc_retry_interval: Duration::from_secs_f64(raw.rpc_retry_interval_sec),
            rpc_query_interval: Duration::from_secs_f64(raw.rpc_query_interval_sec),
            contract_address: format!("0x{}", hex_part.to_ascii_lowercase()),
            start_block: raw.start_block,
            tree_height: raw.tree_height,
            store_path: raw.store_path,
            rpc_request_timeout: Duration::from_millis(raw.rpc_request_timeout_ms),
            sqlite_busy_timeout: Duration::from_millis(raw.sqlite_busy_timeout_ms),
        })
    }
}

/// Overwrite any `RawConfig` field whose `MIXER_<FIELD>` variable is set.
/// Numeric overrides that fail to parse are reported immediately rather than
/// silently ignored, since a typo'd override should never fall back to the
/// file's value without the operator noticing.
fn apply_env_overrides(raw: &mut RawConfig) -> Result<()> {
    if let Some(v) = env_var("MIXER_RPC_URL") {
        raw.rpc_url = v;
    }
    if let Some(v) = env_var("MIXER_POLL_INTERVAL_SEC") {
        raw.poll_interval_sec = parse_env("MIXER_POLL_INTERVAL_SEC", &v)?;
    }
    if let Some(v) = env_var("MIXER_RPC_RETRY_INTERVAL_SEC") {
        raw.rpc_retry_interval_sec = parse_env("MIXER_RPC_RETRY_INTERVAL_SEC", &v)?;
    }
    if let Some(v) = env_var("MIXER_RPC_QUERY_INTERVAL_SEC") {
        raw.rpc_query_interval_sec = parse_env("MIXER_RPC_QUERY_INTERVAL_SEC", &v)?;
    }
    if let Some(v) = env_var("MIXER_CONTRACT_ADDRESS") {
        raw.contract_address = v;
    }
    if let Some(v) = env_var("MIXER_START_BLOCK") {
        raw.start_block = parse_env("MIXER_START_BLOCK", &v)?;
    }
    if let Some(v) = env_var("MIXER_TREE_HEIGHT") {
        raw.tree_height = parse_env("MIXER_TREE_HEIGHT", &v)?;
    }
    if let Some(v) = env_var("MIXER_STORE_PATH") {
        raw.store_path = PathBuf::from(v);
    }
    if let Some(v) = env_var("MIXER_RPC_REQUEST_TIMEOUT_MS") {
        raw.rpc_request_timeout_ms = parse_env("MIXER_RPC_REQUEST_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = env_var("MIXER_SQLITE_BUSY_TIMEOUT_MS") {
        raw.sqlite_busy_timeout_ms = parse_env("MIXER_SQLITE_BUSY_TIMEOUT_MS", &v)?;
    }
    Ok(())
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MixerError::Config(format!("{key}={value} is not a valid override")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(store: &str) -> RawConfig {
        RawConfig {
            rpc_url: "https://rpc.example.org".into(),
            poll_interval_sec: 15.0,
            rpc_retry_interval_sec: 5.0,
            rpc_query_interval_sec: 0.2,
            contract_address: "0x1111111111111111111111111111111111111111".into(),
            start_block: 0,
            tree_height: 20,
            store_path: PathBuf::from(store),
            rpc_request_timeout_ms: 10_000,
            sqlite_busy_timeout_ms: 5_000,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        let cfg = Config::validate(raw("mixer.sqlite")).unwrap();
        assert_eq!(cfg.contract_address, "0x1111111111111111111111111111111111111111");
        assert_eq!(cfg.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn validate_rejects_unsupported_scheme() {
        let mut r = raw("mixer.sqlite");
        r.rpc_url = "ftp://rpc.example.org".into();
        assert!(Config::validate(r).is_err());
    }

    #[test]
    fn validate_rejects_short_address() {
        let mut r = raw("mixer.sqlite");
        r.contract_address = "0xabcd".into();
        assert!(Config::validate(r).is_err());
    }

    #[test]
    fn validate_rejects_non_positive_interval() {
        let mut r = raw("mixer.sqlite");
        r.poll_interval_sec = 0.0;
        assert!(Config::validate(r).is_err());
    }

    #[test]
    fn validate_rejects_zero_tree_height() {
        let mut r = raw("mixer.sqlite");
        r.tree_height = 0;
        assert!(Config::validate(r).is_err());
    }

    #[test]
    fn validate_normalizes_address_case_and_prefix() {
        let mut r = raw("mixer.sqlite");
        r.contract_address = "ABCDEF0123456789ABCDEF0123456789ABCDEF01".into();
        let cfg = Config::validate(r).unwrap();
        assert_eq!(cfg.contract_address, "0xabcdef0123456789abcdef0123456789abcdef01");
    }
}
