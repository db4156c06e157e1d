//! Configuration management for the session manager.
//!
//! This module handles loading and saving configuration from disk: the
//! adapter to use, scan signal thresholds and operation timeouts.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{CentralError, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// BlueZ adapter name; the default adapter is used when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_in_range_threshold")]
   pub in_range_threshold_dbm: i16,

   #[serde(default = "default_out_of_range_threshold")]
   pub out_of_range_threshold_dbm: i16,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_operation_timeout")]
   pub operation_timeout_sec: u64,
}

const fn default_in_range_threshold() -> i16 {
   -70
}

const fn default_out_of_range_threshold() -> i16 {
   -75
}

const fn default_connect_timeout() -> u64 {
   30
}

const fn default_operation_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         in_range_threshold_dbm: default_in_range_threshold(),
         out_of_range_threshold_dbm: default_out_of_range_threshold(),
         connect_timeout_sec: default_connect_timeout(),
         operation_timeout_sec: default_operation_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLUECENTRAL_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(CentralError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("bluecentral").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn operation_timeout(&self) -> Duration {
      Duration::from_secs(self.operation_timeout_sec)
   }
}
