//! Controller configuration and the key-value server-config collaborator.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::types::DataSavingMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub init_timeout: f64,
    pub recv_timeout: f64,
    pub data_saving: DataSavingMode,
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub enable_agc: bool,
    pub log_file_path: Option<String>,
    pub stats_dump_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_timeout: 30.0,
            recv_timeout: 20.0,
            data_saving: DataSavingMode::Never,
            enable_aec: true,
            enable_ns: true,
            enable_agc: true,
            log_file_path: None,
            stats_dump_path: None,
        }
    }
}

/// The embedder's key-value config store, consulted for knobs the
/// controller does not own outright (relay switch thresholds, bitrate
/// ceilings, and similar tunables named after the original's
/// `VoIPServerConfig` keys).
pub trait ServerConfig: Send + Sync {
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn get_double(&self, key: &str, default: f64) -> f64;
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn update(&self, json: &str) -> Result<(), serde_json::Error>;
}

#[derive(Default)]
pub struct JsonServerConfig {
    values: RwLock<HashMap<String, Value>>,
}

impl JsonServerConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerConfig for JsonServerConfig {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values.read().get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    fn get_double(&self, key: &str, default: f64) -> f64 {
        self.values.read().get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.values.read().get(key).and_then(Value::as_str).map(str::to_owned).unwrap_or_else(|| default.to_owned())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.read().get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn update(&self, json: &str) -> Result<(), serde_json::Error> {
        let parsed: HashMap<String, Value> = serde_json::from_str(json)?;
        self.values.write().extend(parsed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn update_merges_and_defaults_survive() {
        let cfg = JsonServerConfig::new();
        cfg.update(r#"{"relay_switch_threshold": 0.75}"#).unwrap();
        assert_eq!(cfg.get_double("relay_switch_threshold", 0.8), 0.75);
        assert_eq!(cfg.get_double("missing_key", 0.8), 0.8);
    }
}
