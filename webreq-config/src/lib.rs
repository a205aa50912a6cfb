//! Loader for orchestrator configuration with YAML + environment overlays.
//!
//! Precedence, low to high: the YAML file's own values, then any
//! `WEBREQ__`-prefixed environment variable (double underscore as the
//! nesting separator, e.g. `WEBREQ__API__BIND_ADDR`), then `${VAR}`
//! interpolation inside string values from either source.
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;

#[derive(Debug, Deserialize)]
pub struct WebReqConfig {
    pub version: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: DomainDefaults,
    #[serde(default)]
    pub domains: Vec<DomainOverride>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "webreq.sqlite3".into()
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".into()
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Policy defaults applied to any domain that doesn't override them.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainDefaults {
    #[serde(default)]
    pub bps_limit: Option<f64>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_min")]
    pub retry_delay_min_secs: f64,
    #[serde(default = "default_retry_delay_max")]
    pub retry_delay_max_secs: f64,
    #[serde(default)]
    pub retry_http: bool,
    #[serde(default)]
    pub retry_proxies: bool,
    #[serde(default)]
    pub proxy_default: bool,
    #[serde(default)]
    pub proxy_regions: Option<String>,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_tick_cap")]
    pub per_tick_domain_cap: usize,
    #[serde(default = "default_bps_capacity")]
    pub bps_sample_capacity: usize,
    #[serde(default = "default_idle_interval")]
    pub idle_tick_interval_secs: u64,
    #[serde(default = "default_proxy_ttl")]
    pub proxy_freshness_secs: u64,
}

impl Default for DomainDefaults {
    fn default() -> Self {
        Self {
            bps_limit: None,
            max_concurrent: None,
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_delay_min_secs: default_retry_delay_min(),
            retry_delay_max_secs: default_retry_delay_max(),
            retry_http: false,
            retry_proxies: false,
            proxy_default: false,
            proxy_regions: None,
            retry_interval_secs: default_retry_interval_secs(),
            per_tick_domain_cap: default_tick_cap(),
            bps_sample_capacity: default_bps_capacity(),
            idle_tick_interval_secs: default_idle_interval(),
            proxy_freshness_secs: default_proxy_ttl(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay_min() -> f64 {
    1.0
}
fn default_retry_delay_max() -> f64 {
    5.0
}
fn default_tick_cap() -> usize {
    50
}
fn default_bps_capacity() -> usize {
    25
}
fn default_idle_interval() -> u64 {
    1
}
fn default_proxy_ttl() -> u64 {
    300
}
/// 3 hours — how long a domain's `(header)` failure clock backs off retries
/// before the retry loop will consider that pair again.
fn default_retry_interval_secs() -> u64 {
    10_800
}

/// Per-domain override of [`DomainDefaults`], matched by hostname at
/// registration time.
#[derive(Debug, Deserialize)]
pub struct DomainOverride {
    pub name: String,
    #[serde(default)]
    pub bps_limit: Option<f64>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_http: Option<bool>,
    #[serde(default)]
    pub retry_proxies: Option<bool>,
    #[serde(default)]
    pub proxy_default: Option<bool>,
    #[serde(default)]
    pub proxy_regions: Option<String>,
    #[serde(default)]
    pub retry_interval_secs: Option<u64>,
}

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) => {
            if s.contains('$') {
                let mut cur = std::mem::take(s);
                for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                    let expanded = match shellexpand::env(&cur) {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => cur.clone(),
                    };
                    if expanded == cur {
                        break;
                    }
                    cur = expanded;
                }
                *s = cur;
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Builder hiding the `config` crate wiring (YAML + env overrides).
pub struct ConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Start with sensible defaults: YAML file + `WEBREQ__` env overrides.
    ///
    /// ```
    /// use webreq_config::ConfigLoader;
    ///
    /// let loader = ConfigLoader::new();
    /// let config = loader
    ///     .with_yaml_str("version: '1'\ndomains: []")
    ///     .load()
    ///     .expect("valid config");
    ///
    /// assert_eq!(config.version.as_deref(), Some("1"));
    /// assert!(config.domains.is_empty());
    /// ```
    pub fn new() -> Self {
        let builder =
            Config::builder().add_source(Environment::with_prefix("WEBREQ").separator("__"));
        Self { builder }
    }

    /// Attach a YAML/TOML/JSON file; the `config` crate infers format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(true));
        self
    }

    /// Merge an inline YAML snippet, mainly for tests and embedded defaults.
    ///
    /// ```
    /// use webreq_config::ConfigLoader;
    ///
    /// let cfg = ConfigLoader::new()
    ///     .with_yaml_str(
    ///         r#"
    /// version: "test"
    /// domains:
    ///   - name: "example.com"
    ///     bps_limit: 1000.0
    /// "#,
    ///     )
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(cfg.version.as_deref(), Some("test"));
    /// assert_eq!(cfg.domains.len(), 1);
    /// assert_eq!(cfg.domains[0].name, "example.com");
    /// ```
    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Consume the builder and deserialize the merged sources into strongly typed config.
    ///
    /// ```
    /// use webreq_config::ConfigLoader;
    ///
    /// unsafe { std::env::set_var("DB_PATH", "/tmp/injected.sqlite3"); }
    ///
    /// let config = ConfigLoader::new()
    ///     .with_yaml_str(r#"
    /// version: "1"
    /// database:
    ///   path: "${DB_PATH}"
    /// "#)
    ///     .load()
    ///     .expect("valid configuration");
    ///
    /// assert_eq!(config.database.path, "/tmp/injected.sqlite3");
    ///
    /// unsafe { std::env::remove_var("DB_PATH"); }
    /// ```
    pub fn load(self) -> Result<WebReqConfig, ConfigError> {
        let cfg = self.builder.build()?;

        let mut v: Value = cfg.try_deserialize()?;
        expand_env_in_value(&mut v);

        let typed: WebReqConfig =
            serde_json::from_value(v).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_simple_string() {
        temp_env::with_var("FOO", Some("bar"), || {
            let mut v = json!("prefix-${FOO}-suffix");
            expand_env_in_value(&mut v);
            assert_eq!(v, json!("prefix-bar-suffix"));
        });
    }

    #[test]
    fn expands_in_array_and_object() {
        temp_env::with_vars([("CITY", Some("Winston")), ("STATE", Some("NC"))], || {
            let mut v = json!([
                "hello-$CITY",
                { "loc": "${CITY}-${STATE}" },
                42,
                true,
                null
            ]);
            expand_env_in_value(&mut v);
            assert_eq!(
                v,
                json!(["hello-Winston", { "loc": "Winston-NC" }, 42, true, null])
            );
        });
    }

    #[test]
    fn expands_recursively_across_env_values() {
        temp_env::with_vars(
            [
                ("BAZ", Some("qux")),
                ("BAR", Some("mid-${BAZ}")),
                ("FOO", Some("start-${BAR}-end")),
            ],
            || {
                let mut v = json!("X=${FOO}");
                expand_env_in_value(&mut v);
                assert_eq!(v, json!("X=start-mid-qux-end"));
            },
        );
    }

    #[test]
    fn stops_on_cycles_and_leaves_value_reasonable() {
        temp_env::with_vars([("A", Some("${B}")), ("B", Some("${A}"))], || {
            let mut v = json!("x=${A}-y");
            expand_env_in_value(&mut v);
            let s = v.as_str().unwrap();
            assert!(s.starts_with("x=") && s.ends_with("-y"));
            assert!(s.contains("${"));
        });
    }

    #[test]
    fn unknown_vars_are_left_as_is() {
        let mut v = json!("hi-${DOES_NOT_EXIST}");
        expand_env_in_value(&mut v);
        assert_eq!(v, json!("hi-${DOES_NOT_EXIST}"));
    }

    #[test]
    fn domain_defaults_fill_in_when_absent() {
        let cfg = ConfigLoader::new()
            .with_yaml_str("version: '1'\ndomains: []")
            .load()
            .unwrap();
        assert_eq!(cfg.defaults.timeout_secs, 30);
        assert_eq!(cfg.defaults.retries, 3);
        assert_eq!(cfg.defaults.per_tick_domain_cap, 50);
        assert_eq!(cfg.defaults.bps_sample_capacity, 25);
    }
}
