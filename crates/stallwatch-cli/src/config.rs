//! Configuration file – reads/writes `~/.stallwatch/config.toml`.
//!
//! ```toml
//! [watchdog]
//! timeout_secs = 0.25
//! interrupt = "alarm"   # or "none"
//! aggressive = true
//! ```

use serde::{Deserialize, Serialize};
use stallwatch_types::{InterruptMode, StallError, WatchdogConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// A loaded config and whether its timeout was set explicitly, by the file
/// or by `STALLWATCH_TIMEOUT`, rather than left at the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedConfig {
    pub config: Config,
    pub timeout_set: bool,
}

/// Return the path to `~/.stallwatch/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".stallwatch").join("config.toml")
}

/// Load `path`, or defaults when it does not exist, then apply environment
/// overrides.
pub fn load_or_default(path: &Path) -> Result<LoadedConfig, StallError> {
    let mut loaded = load_from(path)?.unwrap_or_default();
    if apply_env_overrides(&mut loaded.config) {
        loaded.timeout_set = true;
    }
    Ok(loaded)
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<LoadedConfig>, StallError> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
    let table: toml::Table = toml::from_str(&raw).map_err(|e| config_error(path, e))?;
    let timeout_set = table
        .get("watchdog")
        .and_then(|watchdog| watchdog.get("timeout_secs"))
        .is_some();
    let config: Config = toml::Value::Table(table)
        .try_into()
        .map_err(|e| config_error(path, e))?;
    config.watchdog.timeout()?;
    Ok(Some(LoadedConfig {
        config,
        timeout_set,
    }))
}

/// Apply `STALLWATCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `STALLWATCH_TIMEOUT` | `watchdog.timeout_secs` |
/// | `STALLWATCH_INTERRUPT` | `watchdog.interrupt` (`none` / `alarm`) |
/// | `STALLWATCH_AGGRESSIVE` | `watchdog.aggressive` (`true` / `false`) |
///
/// Unparseable values are ignored with a warning.  Returns `true` when
/// `STALLWATCH_TIMEOUT` set the timeout.
pub fn apply_env_overrides(cfg: &mut Config) -> bool {
    let mut timeout_set = false;
    if let Ok(v) = std::env::var("STALLWATCH_TIMEOUT") {
        match v.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => {
                cfg.watchdog.timeout_secs = secs;
                timeout_set = true;
            }
            _ => warn!(value = %v, "ignoring invalid STALLWATCH_TIMEOUT"),
        }
    }
    if let Ok(v) = std::env::var("STALLWATCH_INTERRUPT") {
        match v.parse::<InterruptMode>() {
            Ok(mode) => cfg.watchdog.interrupt = mode,
            Err(e) => warn!(error = %e, "ignoring invalid STALLWATCH_INTERRUPT"),
        }
    }
    if let Ok(v) = std::env::var("STALLWATCH_AGGRESSIVE") {
        match v.trim().parse::<bool>() {
            Ok(aggressive) => cfg.watchdog.aggressive = aggressive,
            Err(_) => warn!(value = %v, "ignoring invalid STALLWATCH_AGGRESSIVE"),
        }
    }
    timeout_set
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), StallError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = to_toml(cfg)?;
    fs::write(path, raw)?;
    Ok(())
}

/// Render `cfg` as TOML.
pub fn to_toml(cfg: &Config) -> Result<String, StallError> {
    toml::to_string_pretty(cfg).map_err(|e| StallError::Config {
        path: "<memory>".to_string(),
        details: e.to_string(),
    })
}

fn config_error(path: &Path, e: impl std::fmt::Display) -> StallError {
    StallError::Config {
        path: path.display().to_string(),
        details: e.to_string(),
    }
}
