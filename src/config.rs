use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: String,
    pub log_level: Option<String>,
    pub cursor_timeout_secs: Option<u64>,
    pub cursor_sweep_interval_secs: Option<u64>,
    #[serde(default = "default_facet_concurrency")]
    pub facet_concurrency: usize,
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_facet_concurrency() -> usize {
    3
}

fn default_max_message_size_bytes() -> i32 {
    48 * 1024 * 1024
}

fn default_pool_size() -> u32 {
    (num_cpus::get() as u32 * 2).clamp(1, 16)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:27017".to_string(),
            db_path: "./oxlitedb.db".to_string(),
            log_level: None,
            cursor_timeout_secs: Some(1800),
            cursor_sweep_interval_secs: Some(60),
            facet_concurrency: default_facet_concurrency(),
            max_message_size_bytes: default_max_message_size_bytes(),
            pool_size: default_pool_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file is
    /// missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::bad_value(format!("failed to parse {path}: {e}"))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        db_path: Option<String>,
        log_level: Option<String>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(path) = db_path {
            self.db_path = path;
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::bad_value("listen_addr cannot be empty"));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::bad_value(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }

        if self.db_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(&self.db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(Error::bad_value(format!(
                        "db_path parent directory '{}' does not exist",
                        parent.display()
                    )));
                }
            }
        }

        if let Some(secs) = self.cursor_timeout_secs {
            if secs == 0 {
                return Err(Error::bad_value("cursor_timeout_secs must be positive"));
            }
        }
        if let Some(secs) = self.cursor_sweep_interval_secs {
            if secs == 0 {
                return Err(Error::bad_value(
                    "cursor_sweep_interval_secs must be positive",
                ));
            }
        }
        if self.facet_concurrency == 0 {
            return Err(Error::bad_value("facet_concurrency must be positive"));
        }
        if self.max_message_size_bytes < 16 {
            return Err(Error::bad_value("max_message_size_bytes too small"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_empty_listen_addr() {
        let mut cfg = Config::default();
        cfg.listen_addr = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let cfg = Config::default().with_overrides(
            Some("0.0.0.0:9999".to_string()),
            Some(":memory:".to_string()),
            Some("debug".to_string()),
        );
        assert_eq!(cfg.listen_addr, "0.0.0.0:9999");
        assert_eq!(cfg.db_path, ":memory:");
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
    }
}
