//! Daemon configuration — environment variables plus an optional YAML
//! endpoint-policy file.
//!
//! Nothing here is required for normal operation: every variable has a
//! default except the API token, whose absence only produces a warning
//! (the provider will answer 401, which is classified non-retryable).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::state::StatePaths;

pub const DEFAULT_BASE_URL: &str = "https://api.unusualwhales.com";
pub const DEFAULT_MARKET_TZ: &str = "America/New_York";
pub const DEFAULT_SERVICE: &str = "flowd.service";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("no symbols configured (set FLOWD_SYMBOLS)")]
    NoSymbols,
    #[error("cannot determine home directory (set FLOWD_STATE_DIR)")]
    NoHomeDir,
    #[error("failed to read policy file {path}: {source}")]
    PolicyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {source}")]
    PolicyParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("policy {name:?}: {reason}")]
    BadPolicy { name: String, reason: String },
}

// ── Endpoint Policies ───────────────────────────────────────────────

/// How a raw provider payload is condensed before it reaches the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Flow,
    DarkPool,
    Passthrough,
}

/// Immutable polling policy for one upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    pub name: String,
    /// URL path template; `{symbol}` is substituted per request.
    pub path: String,
    pub base_interval_sec: u64,
    #[serde(default = "default_off_hours_multiplier")]
    pub off_hours_multiplier: u32,
    #[serde(default = "default_kind")]
    pub kind: EndpointKind,
    /// Cache field name; defaults to `name`.
    #[serde(default)]
    pub field: Option<String>,
}

fn default_off_hours_multiplier() -> u32 {
    3
}

fn default_kind() -> EndpointKind {
    EndpointKind::Passthrough
}

impl EndpointPolicy {
    pub fn new(name: &str, path: &str, base_interval_sec: u64, kind: EndpointKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            base_interval_sec,
            off_hours_multiplier: default_off_hours_multiplier(),
            kind,
            field: None,
        }
    }

    pub fn cache_field(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }

    pub fn path_for(&self, symbol: &str) -> String {
        self.path.replace("{symbol}", symbol)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bad = |reason: &str| ConfigError::BadPolicy {
            name: self.name.clone(),
            reason: reason.into(),
        };
        if self.name.trim().is_empty() {
            return Err(bad("name must not be empty"));
        }
        if self.base_interval_sec == 0 {
            return Err(bad("base_interval_sec must be positive"));
        }
        if self.off_hours_multiplier == 0 {
            return Err(bad("off_hours_multiplier must be positive"));
        }
        if self.cache_field().starts_with('_') {
            return Err(bad("cache field names starting with '_' are reserved"));
        }
        Ok(())
    }
}

/// Built-in feeds, used unless `FLOWD_POLICY_FILE` replaces them.
pub fn default_policies() -> Vec<EndpointPolicy> {
    vec![
        EndpointPolicy::new("flow_alerts", "/api/stock/{symbol}/flow-alerts", 300, EndpointKind::Flow),
        EndpointPolicy::new("dark_pool", "/api/darkpool/{symbol}", 600, EndpointKind::DarkPool),
        EndpointPolicy::new("net_premium", "/api/stock/{symbol}/net-prem-ticks", 900, EndpointKind::Passthrough),
        EndpointPolicy::new("greeks", "/api/stock/{symbol}/greek-exposure", 1800, EndpointKind::Passthrough),
    ]
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    endpoints: Vec<EndpointPolicy>,
}

// ── Budget ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLimits {
    pub per_minute_cap: u32,
    pub per_day_cap: u32,
    /// Fraction of the daily cap actually spent (headroom for other clients).
    pub safety_buffer: f64,
    pub per_endpoint_daily_cap: Option<u32>,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            per_minute_cap: 100,
            per_day_cap: 15_000,
            safety_buffer: 0.95,
            per_endpoint_daily_cap: None,
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub symbols: Vec<String>,
    pub api_token: Option<String>,
    pub base_url: String,
    pub state_dir: PathBuf,
    pub budget: BudgetLimits,
    pub policies: Vec<EndpointPolicy>,
    pub market_tz: String,
    /// Cache graceful-degradation window.
    pub freshness: Duration,
    pub request_timeout: Duration,
    pub inter_symbol_delay: Duration,
    pub cycle_interval: Duration,
    /// Long sleep after a 429 survives every retry.
    pub rate_limit_cooldown: Duration,
    /// Wake-up period while parked in rate-limited mode.
    pub rate_limited_check: Duration,
    /// Provider daily reset, as an offset after UTC midnight.
    pub daily_reset_offset: Duration,
    pub daily_count_header: String,
    pub daily_limit_header: String,
    pub service_name: String,
    pub log_json: bool,
}

impl Config {
    /// `state_dir` (the `--state-dir` flag) wins over `FLOWD_STATE_DIR`
    /// and is applied before the home directory is consulted.
    pub fn from_env(state_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_lookup_in(|key| std::env::var(key).ok(), state_dir)
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_in(lookup, None)
    }

    pub fn from_lookup_in<F>(lookup: F, state_dir: Option<PathBuf>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let symbols: Vec<String> = get("FLOWD_SYMBOLS")
            .unwrap_or_else(|| "SPY,QQQ".into())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }

        let state_dir = match (state_dir, get("FLOWD_STATE_DIR")) {
            (Some(dir), _) => dir,
            (None, Some(dir)) => PathBuf::from(dir),
            (None, None) => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".flowd"),
        };

        let defaults = BudgetLimits::default();
        let safety_buffer = parse_or(&get, "FLOWD_SAFETY_BUFFER", defaults.safety_buffer)?;
        if !(safety_buffer > 0.0 && safety_buffer <= 1.0) {
            return Err(ConfigError::Invalid {
                var: "FLOWD_SAFETY_BUFFER",
                value: safety_buffer.to_string(),
                reason: "must be in (0, 1]".into(),
            });
        }
        let budget = BudgetLimits {
            per_minute_cap: parse_or(&get, "FLOWD_PER_MINUTE_CAP", defaults.per_minute_cap)?,
            per_day_cap: parse_or(&get, "FLOWD_DAILY_CAP", defaults.per_day_cap)?,
            safety_buffer,
            per_endpoint_daily_cap: parse_opt(&get, "FLOWD_ENDPOINT_DAILY_CAP")?,
        };

        let policies = match get("FLOWD_POLICY_FILE") {
            Some(path) => load_policy_file(PathBuf::from(path))?,
            None => default_policies(),
        };
        for policy in &policies {
            policy.validate()?;
        }

        Ok(Self {
            symbols,
            api_token: get("FLOWD_API_TOKEN"),
            base_url: get("FLOWD_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            state_dir,
            budget,
            policies,
            market_tz: get("FLOWD_MARKET_TZ").unwrap_or_else(|| DEFAULT_MARKET_TZ.into()),
            freshness: Duration::from_secs(parse_or(&get, "FLOWD_FRESHNESS_SECS", 7200)?),
            request_timeout: Duration::from_secs(parse_or(&get, "FLOWD_REQUEST_TIMEOUT_SECS", 12)?),
            inter_symbol_delay: Duration::from_millis(parse_or(&get, "FLOWD_INTER_SYMBOL_DELAY_MS", 1500)?),
            cycle_interval: Duration::from_secs(parse_positive(&get, "FLOWD_CYCLE_SECS", 30)?),
            rate_limit_cooldown: Duration::from_secs(parse_or(&get, "FLOWD_RATE_LIMIT_COOLDOWN_SECS", 900)?),
            rate_limited_check: Duration::from_secs(parse_positive(&get, "FLOWD_RATE_LIMITED_CHECK_SECS", 300)?),
            daily_reset_offset: Duration::from_secs(parse_or(&get, "FLOWD_DAILY_RESET_OFFSET_SECS", 0)?),
            daily_count_header: get("FLOWD_DAILY_COUNT_HEADER")
                .unwrap_or_else(|| "x-ratelimit-daily-count".into()),
            daily_limit_header: get("FLOWD_DAILY_LIMIT_HEADER")
                .unwrap_or_else(|| "x-ratelimit-daily-limit".into()),
            service_name: get("FLOWD_SERVICE").unwrap_or_else(|| DEFAULT_SERVICE.into()),
            log_json: matches!(get("FLOWD_LOG_JSON").as_deref(), Some("1" | "true" | "yes")),
        })
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, var)?.unwrap_or(default))
}

/// Loop periods: zero would turn an idle sleep into a spin.
fn parse_positive<G>(get: &G, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

fn parse_opt<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

fn load_policy_file(path: PathBuf) -> Result<Vec<EndpointPolicy>, ConfigError> {
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::PolicyIo {
        path: path.clone(),
        source,
    })?;
    let file: PolicyFile =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::PolicyParse { path, source })?;
    Ok(file.endpoints)
}
