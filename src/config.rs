//! Configuration management for the Switchmate service.
//!
//! This module handles loading and saving configuration from disk,
//! including the device allow-list, legacy auth codes, and scan timing.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

use crate::{
   error::{Result, SwitchmateError},
   switchmate::protocol::DeviceId,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub devices: Vec<DeviceConfig>,

   #[serde(default = "default_scan_gap")]
   pub scan_gap_sec: u64,

   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_sec: u64,

   #[serde(default = "default_battery_refresh")]
   pub battery_refresh_sec: u64,

   #[serde(default = "default_dbus")]
   pub dbus: bool,
}

/// One configured device.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
   /// 12 hex digits, colons allowed.
   pub id: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name: Option<String>,
   /// Base64 credential for legacy switches, as printed by `pair`.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub auth_code: Option<String>,
}

/// A configured device whose id parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub id: DeviceId,
   pub name: SmolStr,
   pub auth_code: Option<String>,
}

/// Longest accepted battery refresh period (one week)
const MAX_BATTERY_REFRESH_SEC: u64 = 7 * 24 * 3600;

const fn default_scan_gap() -> u64 {
   10
}

const fn default_scan_timeout() -> u64 {
   30
}

const fn default_battery_refresh() -> u64 {
   3600
}

const fn default_dbus() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         devices: vec![],
         scan_gap_sec: default_scan_gap(),
         scan_timeout_sec: default_scan_timeout(),
         battery_refresh_sec: default_battery_refresh(),
         dbus: default_dbus(),
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

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
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
      let config_dir = if let Ok(home) = env::var("SWITCHMATE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(SwitchmateError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("switchmated").join("config.toml"))
   }

   /// Battery refresh period for v3 switches. Zero turns periodic reads off;
   /// longer periods are capped at a week.
   pub fn battery_refresh(&self) -> Option<Duration> {
      match self.battery_refresh_sec {
         0 => None,
         secs if secs > MAX_BATTERY_REFRESH_SEC => {
            warn!("battery_refresh_sec {secs} is too long, using {MAX_BATTERY_REFRESH_SEC}");
            Some(Duration::from_secs(MAX_BATTERY_REFRESH_SEC))
         },
         secs => Some(Duration::from_secs(secs)),
      }
   }

   /// Configured devices with valid ids; the rest are logged and skipped.
   pub fn known_devices(&self) -> Vec<KnownDevice> {
      self
         .devices
         .iter()
         .filter_map(|d| match d.id.parse::<DeviceId>() {
            Ok(id) => Some(KnownDevice {
               name: d
                  .name
                  .as_deref()
                  .map_or_else(|| format_smolstr!("switchmate-{}", id.short()), SmolStr::new),
               auth_code: d.auth_code.clone(),
               id,
            }),
            Err(e) => {
               warn!("Skipping configured device: {e}");
               None
            },
         })
         .collect()
   }

   /// Records an auth code obtained by pairing, adding the device if needed.
   pub fn set_auth_code(&mut self, id: &DeviceId, auth_code: String) {
      let existing = self
         .devices
         .iter_mut()
         .find(|d| d.id.parse::<DeviceId>().is_ok_and(|parsed| parsed == *id));
      match existing {
         Some(device) => device.auth_code = Some(auth_code),
         None => self.devices.push(DeviceConfig {
            id: id.to_string(),
            name: None,
            auth_code: Some(auth_code),
         }),
      }
   }
}
