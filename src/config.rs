//! Configuration management for the link daemon.
//!
//! This module handles loading and saving configuration from disk:
//! addresses, pool sizes, retry policy, QoS tables, mirror timing and
//! the handsets to seed into the device registry.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   address::BdAddr,
   device::{DeviceProperties, DeviceRegistry},
   error::{LinkError, Result},
   link::qos::{QosLevel, QosTable, default_qos_table},
   peer::MirrorConfig,
   profile::{Profile, ProfileSet},
   session::SessionLimits,
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   #[serde(default = "default_local_address")]
   pub local_address: BdAddr,

   #[serde(default = "default_peer_address")]
   pub peer_address: BdAddr,

   /// Starting role.
   #[serde(default = "default_primary")]
   pub primary: bool,

   #[serde(default = "default_max_links")]
   pub max_links: usize,

   #[serde(default = "default_max_sessions")]
   pub max_sessions: usize,

   #[serde(default = "default_acl_attempts")]
   pub acl_connect_attempts: u32,

   #[serde(default = "default_acl_retry_delay")]
   pub acl_retry_delay_ms: u64,

   #[serde(default)]
   pub qos: QosConfig,

   #[serde(default)]
   pub mirror: MirrorSettings,

   #[serde(default = "default_handover_timeout")]
   pub handover_ack_timeout_ms: u64,

   /// Defaults to the platform data directory.
   #[serde(default)]
   pub device_store: Option<PathBuf>,

   #[serde(default)]
   pub known_handsets: Vec<KnownHandset>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QosConfig {
   #[serde(default = "default_qos_level")]
   pub default: QosLevel,

   #[serde(default = "default_qos_ceiling")]
   pub max: QosLevel,

   #[serde(default = "default_qos_table")]
   pub table: QosTable,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MirrorSettings {
   #[serde(default = "default_link_poll")]
   pub link_poll_ms: u64,

   #[serde(default = "default_mic_poll")]
   pub mic_poll_ms: u64,

   #[serde(default = "default_outbox_limit")]
   pub outbox_limit: usize,
}

/// A handset to put in the device registry on start-up.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownHandset {
   pub address: BdAddr,
   pub name: String,
   #[serde(default = "default_handset_profiles")]
   pub profiles: Vec<Profile>,
}

const fn default_local_address() -> BdAddr {
   BdAddr([0x00, 0x1b, 0xdc, 0x00, 0x00, 0x01])
}

const fn default_peer_address() -> BdAddr {
   BdAddr([0x00, 0x1b, 0xdc, 0x00, 0x00, 0x02])
}

const fn default_primary() -> bool {
   true
}

const fn default_max_links() -> usize {
   8
}

const fn default_max_sessions() -> usize {
   2
}

const fn default_acl_attempts() -> u32 {
   3
}

const fn default_acl_retry_delay() -> u64 {
   1000
}

const fn default_handover_timeout() -> u64 {
   2000
}

const fn default_qos_level() -> QosLevel {
   QosLevel::LowPower
}

const fn default_qos_ceiling() -> QosLevel {
   QosLevel::LowLatency
}

const fn default_link_poll() -> u64 {
   1000
}

const fn default_mic_poll() -> u64 {
   500
}

const fn default_outbox_limit() -> usize {
   16
}

fn default_handset_profiles() -> Vec<Profile> {
   vec![Profile::Hfp, Profile::A2dp, Profile::Avrcp]
}

impl Default for QosConfig {
   fn default() -> Self {
      Self {
         default: default_qos_level(),
         max: default_qos_ceiling(),
         table: default_qos_table(),
      }
   }
}

impl Default for MirrorSettings {
   fn default() -> Self {
      Self {
         link_poll_ms: default_link_poll(),
         mic_poll_ms: default_mic_poll(),
         outbox_limit: default_outbox_limit(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         local_address: default_local_address(),
         peer_address: default_peer_address(),
         primary: default_primary(),
         max_links: default_max_links(),
         max_sessions: default_max_sessions(),
         acl_connect_attempts: default_acl_attempts(),
         acl_retry_delay_ms: default_acl_retry_delay(),
         qos: QosConfig::default(),
         mirror: MirrorSettings::default(),
         handover_ack_timeout_ms: default_handover_timeout(),
         device_store: None,
         known_handsets: vec![],
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
      let config_dir = if let Ok(home) = env::var("BUDLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("budlinkd").join("config.toml"))
   }

   pub fn session_limits(&self) -> SessionLimits {
      SessionLimits {
         max_sessions: self.max_sessions,
         acl_attempts: self.acl_connect_attempts,
         acl_retry_delay: Duration::from_millis(self.acl_retry_delay_ms),
      }
   }

   pub fn mirror_config(&self) -> MirrorConfig {
      MirrorConfig {
         outbox_limit: self.mirror.outbox_limit,
         link_poll: Duration::from_millis(self.mirror.link_poll_ms),
         mic_poll: Duration::from_millis(self.mirror.mic_poll_ms),
      }
   }

   pub fn handover_ack_timeout(&self) -> Duration {
      Duration::from_millis(self.handover_ack_timeout_ms)
   }

   /// Adds configured handsets the registry does not know yet.
   pub fn seed_devices(&self, devices: &dyn DeviceRegistry) -> Result<usize> {
      let mut added = 0;
      for handset in &self.known_handsets {
         if devices.properties(&handset.address).is_some() {
            continue;
         }
         let supported: ProfileSet = handset.profiles.iter().copied().collect();
         let mut props = DeviceProperties::handset(handset.name.as_str(), supported);
         props.connect_order = handset.profiles.clone();
         devices.store(&handset.address, props)?;
         added += 1;
      }
      Ok(added)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::device::MemoryDevices;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("budlinkd").join("config.toml");
      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_fills_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "max_sessions = 4\n\n[qos]\ndefault = \"audio\"\n\n[[known_handsets]]\naddress = \"AA:BB:CC:DD:EE:FF\"\nname = \"Phone\"\n",
      )
      .unwrap();
      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.max_sessions, 4);
      assert_eq!(config.max_links, 8);
      assert_eq!(config.qos.default, QosLevel::Audio);
      assert_eq!(config.qos.max, QosLevel::LowLatency);
      assert_eq!(config.known_handsets[0].profiles.len(), 3);
   }

   #[test]
   fn test_seed_devices_skips_known() {
      let devices = MemoryDevices::new();
      let mut config = Config::default();
      config.known_handsets.push(KnownHandset {
         address: BdAddr([1; 6]),
         name: "Phone".into(),
         profiles: vec![Profile::A2dp, Profile::Hfp],
      });
      assert_eq!(config.seed_devices(&devices).unwrap(), 1);
      assert_eq!(config.seed_devices(&devices).unwrap(), 0);
      let props = devices.properties(&BdAddr([1; 6])).unwrap();
      assert_eq!(props.connect_order, [Profile::A2dp, Profile::Hfp]);
      assert_eq!(props.supported, ProfileSet::A2DP.union(ProfileSet::HFP));
   }
}
