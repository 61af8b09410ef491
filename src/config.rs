//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory (or
//! the path given with `--config`), then applies the `SENSEHUB_LOG_LEVEL`
//! env override.

use std::{
    collections::BTreeMap,
    env, fs,
    path::Path,
};

use serde::Deserialize;
use serde_json::Value;

use crate::canonical;
use crate::error::AppError;
use crate::registry::ComponentCatalog;
use crate::schedule::Schedule;

const DEFAULT_PATH: &str = "config/default.toml";

/// Timer and coordinator tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Coordinator command inbox size.
    pub command_buffer: usize,
    /// Coalescing window for inexact wakes, in milliseconds.
    pub inexact_window_ms: u64,
}

/// A standing request registered at startup.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Listener name; `None` means a generated one.
    pub listener: Option<String>,
    /// Component config, including `@type`.
    pub config: Value,
    /// Explicit schedule; `None` uses the component's default.
    pub schedule: Option<Schedule>,
}

/// Per-type overrides of the built-in catalog.
#[derive(Debug, Clone, Default)]
pub struct ComponentDefaults {
    pub config: Option<Value>,
    pub schedule: Option<Value>,
}

/// Fully-resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
    pub subscriptions: Vec<Subscription>,
    pub components: BTreeMap<String, ComponentDefaults>,
}

impl Config {
    /// Overlay the `[components.<type>]` tables onto `catalog`.
    ///
    /// Config tables overlay the declared default config; schedule tables
    /// overlay the declared default schedule field by field.
    pub fn apply_component_defaults(&self, mut catalog: ComponentCatalog) -> Result<ComponentCatalog, AppError> {
        for (type_name, defaults) in &self.components {
            let spec = catalog
                .get(type_name)
                .ok_or_else(|| AppError::Config(format!("[components.{type_name}]: unknown component type")))?;
            let mut spec = spec.clone();
            if let Some(cfg) = &defaults.config {
                let merged = canonical::overlay(spec.default_config(), cfg);
                spec = spec.with_default_config(merged);
            }
            if let Some(sched) = &defaults.schedule {
                let schedule = spec
                    .default_schedule()
                    .overlay(sched)
                    .map_err(|e| AppError::Config(format!("[components.{type_name}]: {e}")))?;
                spec = spec.with_default_schedule(schedule);
            }
            catalog.register(spec);
        }
        Ok(catalog)
    }
}

// ── Raw TOML shapes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemon,
    #[serde(default)]
    scheduler: RawScheduler,
    #[serde(default)]
    subscriptions: Vec<RawSubscription>,
    #[serde(default)]
    components: BTreeMap<String, RawComponent>,
}

#[derive(Deserialize)]
struct RawDaemon {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for RawDaemon {
    fn default() -> Self {
        Self { name: default_name(), log_level: default_log_level() }
    }
}

#[derive(Deserialize)]
struct RawScheduler {
    #[serde(default = "default_buffer")]
    command_buffer: usize,
    #[serde(default = "default_inexact_window_ms")]
    inexact_window_ms: u64,
}

impl Default for RawScheduler {
    fn default() -> Self {
        Self {
            command_buffer: default_buffer(),
            inexact_window_ms: default_inexact_window_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    #[serde(default)]
    listener: Option<String>,
    config: toml::Value,
    #[serde(default)]
    schedule: Option<toml::Value>,
}

#[derive(Deserialize)]
struct RawComponent {
    #[serde(default)]
    config: Option<toml::Value>,
    #[serde(default)]
    schedule: Option<toml::Value>,
}

fn default_name() -> String { "sensehub".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_buffer() -> usize { 64 }
fn default_inexact_window_ms() -> u64 { 5000 }

fn to_json(value: toml::Value, what: &str, path: &Path) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Config(format!("{what} in {}: {e}", path.display())))
}

/// Load config from `path` (default `config/default.toml`), then apply
/// env-var overrides.
pub fn load(path: Option<&Path>) -> Result<Config, AppError> {
    let log_level_override = env::var("SENSEHUB_LOG_LEVEL").ok();
    load_from(path.unwrap_or(Path::new(DEFAULT_PATH)), log_level_override.as_deref())
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(path: &Path, log_level_override: Option<&str>) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if parsed.scheduler.command_buffer == 0 {
        return Err(AppError::Config(format!("{}: scheduler.command_buffer must be positive", path.display())));
    }

    let mut subscriptions = Vec::with_capacity(parsed.subscriptions.len());
    for (i, s) in parsed.subscriptions.into_iter().enumerate() {
        let config = to_json(s.config, &format!("subscriptions[{i}].config"), path)?;
        let schedule = match s.schedule {
            Some(v) => {
                let v = to_json(v, &format!("subscriptions[{i}].schedule"), path)?;
                Some(Schedule::from_value(&v).map_err(|e| {
                    AppError::Config(format!("subscriptions[{i}] in {}: {e}", path.display()))
                })?)
            }
            None => None,
        };
        subscriptions.push(Subscription { listener: s.listener, config, schedule });
    }

    let mut components = BTreeMap::new();
    for (type_name, c) in parsed.components {
        let config = c
            .config
            .map(|v| to_json(v, &format!("components.{type_name}.config"), path))
            .transpose()?;
        let schedule = c
            .schedule
            .map(|v| to_json(v, &format!("components.{type_name}.schedule"), path))
            .transpose()?;
        components.insert(type_name, ComponentDefaults { config, schedule });
    }

    Ok(Config {
        name: parsed.daemon.name,
        log_level: log_level_override.unwrap_or(&parsed.daemon.log_level).to_string(),
        scheduler: SchedulerConfig {
            command_buffer: parsed.scheduler.command_buffer,
            inexact_window_ms: parsed.scheduler.inexact_window_ms,
        },
        subscriptions,
        components,
    })
}

// ── test helpers ──────────────────────────────────────────────────────────────

#[cfg(test)]
impl Config {
    pub fn test_default() -> Self {
        Self {
            name: "test".into(),
            log_level: "info".into(),
            scheduler: SchedulerConfig {
                command_buffer: 8,
                inexact_window_ms: 0,
            },
            subscriptions: Vec::new(),
            components: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[daemon]
name = "test-hub"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_basic_config() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None).unwrap();
        assert_eq!(cfg.name, "test-hub");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.scheduler.command_buffer, 64);
        assert_eq!(cfg.scheduler.inexact_window_ms, 5000);
        assert!(cfg.subscriptions.is_empty());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let f = write_toml("");
        let cfg = load_from(f.path(), None).unwrap();
        assert_eq!(cfg.name, "sensehub");
        assert_eq!(cfg.scheduler.command_buffer, 64);
        assert_eq!(cfg.scheduler.inexact_window_ms, 5000);
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None);
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn malformed_toml_errors() {
        let f = write_toml("[daemon\nname = 1");
        let msg = load_from(f.path(), None).unwrap_err().to_string();
        assert!(msg.contains("parse error"));
    }

    #[test]
    fn env_log_level_override() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("debug")).unwrap();
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn subscriptions_parse_into_json_and_schedules() {
        let f = write_toml(
            r#"
[[subscriptions]]
listener = "log-clock"
config = { "@type" = "clock", label = "wall" }
schedule = { interval = 30, duration = 2.5, strict = true }

[[subscriptions]]
config = { "@type" = "counter" }
"#,
        );
        let cfg = load_from(f.path(), None).unwrap();
        assert_eq!(cfg.subscriptions.len(), 2);

        let first = &cfg.subscriptions[0];
        assert_eq!(first.listener.as_deref(), Some("log-clock"));
        assert_eq!(first.config, json!({"@type": "clock", "label": "wall"}));
        let schedule = first.schedule.unwrap();
        assert_eq!(schedule.interval, Some(Duration::from_secs(30)));
        assert_eq!(schedule.duration, Duration::from_millis(2500));
        assert!(schedule.strict);

        assert!(cfg.subscriptions[1].listener.is_none());
        assert!(cfg.subscriptions[1].schedule.is_none());
    }

    #[test]
    fn malformed_subscription_schedule_errors() {
        let f = write_toml(
            r#"
[[subscriptions]]
config = { "@type" = "clock" }
schedule = { every = 30 }
"#,
        );
        let msg = load_from(f.path(), None).unwrap_err().to_string();
        assert!(msg.contains("subscriptions[0]"));
    }

    #[test]
    fn zero_buffer_rejected() {
        let f = write_toml("[scheduler]\ncommand_buffer = 0\n");
        assert!(load_from(f.path(), None).is_err());
    }

    #[test]
    fn component_defaults_overlay_the_catalog() {
        let f = write_toml(
            r#"
[components.clock]
config = { label = "wall" }
schedule = { interval = 10 }
"#,
        );
        let cfg = load_from(f.path(), None).unwrap();
        let catalog = cfg.apply_component_defaults(builtin::catalog()).unwrap();
        let clock = catalog.get("clock").unwrap();
        assert_eq!(clock.default_config(), &json!({"label": "wall"}));
        assert_eq!(clock.default_schedule().interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn unknown_component_defaults_rejected() {
        let mut cfg = Config::test_default();
        cfg.components.insert("radar".into(), ComponentDefaults::default());
        let err = cfg.apply_component_defaults(builtin::catalog()).unwrap_err();
        assert!(err.to_string().contains("radar"));
    }
}
