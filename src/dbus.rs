use std::{collections::HashMap, str::FromStr};

use budlink::{
   Core, LinkError,
   address::BdAddr,
   link::{LinkState, QosLevel},
   peer::{BatteryState, BatteryStatus, Flag, LocalUpdate, NoiseControl, PhysicalState},
   profile::{Profile, ProfileSet},
};
use log::info;
use zbus::{interface, object_server::SignalEmitter, zvariant};

pub const OBJECT_PATH: &str = "/org/budlink/manager";

pub struct BudlinkService {
   core: Core,
}

impl BudlinkService {
   pub const fn new(core: Core) -> Self {
      Self { core }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<BdAddr> {
   BdAddr::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: LinkError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.budlink.Manager")]
impl BudlinkService {
   async fn get_links(&self) -> zbus::fdo::Result<String> {
      serde_json::to_string(&self.core.links()).map_err(|e| failed(e.into()))
   }

   async fn get_sessions(&self) -> zbus::fdo::Result<String> {
      serde_json::to_string(&self.core.sessions()).map_err(|e| failed(e.into()))
   }

   async fn get_state(&self) -> String {
      serde_json::json!({
         "role": self.core.role().to_string(),
         "local": self.core.local_snapshot().to_json(),
         "remote": self.core.remote_snapshot().to_json(),
      })
      .to_string()
   }

   /// Opens the handset's ACL and connects `profiles` over it. Returns
   /// the completion status.
   async fn connect_handset(
      &self,
      address: String,
      profiles: Vec<String>,
   ) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let profiles = profiles
         .iter()
         .map(|p| {
            Profile::from_str(p)
               .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown profile: {p}")))
         })
         .collect::<zbus::fdo::Result<ProfileSet>>()?;

      let notice = self
         .core
         .connect_handset(addr, profiles)
         .await
         .map_err(failed)?;
      info!("Connect {address}: {}", notice.status());
      Ok(notice.status().to_string())
   }

   async fn disconnect_handset(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let notice = self.core.disconnect_handset(addr).await.map_err(failed)?;
      Ok(notice.status().to_string())
   }

   async fn stop_handset(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let notice = self.core.stop_handset(addr).await.map_err(failed)?;
      Ok(notice.status().to_string())
   }

   /// Hands the primary role to the other earbud.
   async fn handover(&self) -> zbus::fdo::Result<String> {
      let report = self.core.handover().await.map_err(failed)?;
      info!(
         "Handover #{} moved {} blocks, now {}",
         report.attempt, report.transferred, report.role
      );
      Ok(
         serde_json::json!({
            "attempt": report.attempt,
            "transferred": report.transferred,
            "role": report.role.to_string(),
         })
         .to_string(),
      )
   }

   async fn mirror_pause(&self) -> zbus::fdo::Result<bool> {
      self.core.mirror_pause().await.map_err(failed)?;
      Ok(true)
   }

   async fn mirror_unpause(&self) -> zbus::fdo::Result<bool> {
      self.core.mirror_unpause().await.map_err(failed)?;
      Ok(true)
   }

   async fn set_connectable(&self, connectable: bool) -> zbus::fdo::Result<bool> {
      self
         .core
         .set_handset_connectable(connectable)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn request_default_qos(&self, level: String) -> zbus::fdo::Result<bool> {
      let level = QosLevel::from_str(&level)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown QoS level: {level}")))?;
      self.core.request_default_qos(level).await.map_err(failed)?;
      Ok(true)
   }

   async fn update_local(
      &self,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let update = match action.as_str() {
         "set_physical" => {
            let value = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;
            let state = PhysicalState::from_str(&value).map_err(|_| {
               zbus::fdo::Error::InvalidArgs(format!("Invalid physical state: {value}"))
            })?;
            LocalUpdate::Physical(state)
         },

         "set_flag" => {
            let flag = params
               .get("flag")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'flag' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'flag' parameter: {e}"))
               })?;
            let enabled = params
               .get("enabled")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'enabled' parameter".into()))?
               .downcast_ref::<bool>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'enabled' value for {flag}: {e}"))
               })?;
            let flag = Flag::from_str(&flag)
               .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown flag: {flag}")))?;
            LocalUpdate::Flag(flag, enabled)
         },

         "set_battery" => {
            let level = params
               .get("level")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'level' parameter".into()))?
               .downcast_ref::<u8>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'level' parameter: {e}"))
               })?;
            let status = match params.get("status") {
               Some(value) => {
                  let status = value.downcast_ref::<String>().map_err(|e| {
                     zbus::fdo::Error::InvalidArgs(format!("Invalid 'status' parameter: {e}"))
                  })?;
                  BatteryStatus::from_str(&status).map_err(|_| {
                     zbus::fdo::Error::InvalidArgs(format!("Unknown battery status: {status}"))
                  })?
               },
               None => BatteryStatus::Discharging,
            };
            let voltage_mv = self.core.local_snapshot().battery.voltage_mv;
            LocalUpdate::Battery(BatteryState::new(level.min(100), status, voltage_mv))
         },

         "set_noise_control" => {
            let value = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;
            let mode = NoiseControl::from_str(&value).map_err(|_| {
               zbus::fdo::Error::InvalidArgs(format!("Invalid noise mode: {value}"))
            })?;
            let mut feature_mode = self.core.local_snapshot().feature_mode;
            feature_mode.noise_control = mode;
            LocalUpdate::FeatureMode(feature_mode)
         },

         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
               "Unknown action: {action}"
            )));
         },
      };

      self.core.update_local(update).await.map_err(failed)?;
      Ok(true)
   }

   #[zbus(signal)]
   pub async fn link_connected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      incoming: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn link_disconnected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      reason: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn role_switched(emitter: &SignalEmitter<'_>, role: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn peer_state_changed(emitter: &SignalEmitter<'_>, state: &str)
   -> zbus::Result<()>;

   #[zbus(property)]
   async fn role(&self) -> String {
      self.core.role().to_string()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self
         .core
         .links()
         .iter()
         .filter(|l| l.state == LinkState::Connected)
         .count() as u32
   }
}
