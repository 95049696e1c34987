//! Device registry boundary and its two backends.
//!
//! Devices are identified by their public classic address. The registry
//! answers address resolution (resolvable private → public) and stores
//! per-device properties that the session machine persists across
//! connections: supported profiles, connect order, the most-recently-used
//! flag and the profiles that were connected last time.

use std::{
   borrow::Cow,
   collections::HashMap,
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   address::{BdAddr, TypedAddress},
   error::{LinkError, Result},
   profile::{Profile, ProfileSet},
};

/// Maps random addresses to the public identity behind them.
pub trait AddressResolver {
   fn resolve(&self, addr: &TypedAddress) -> Option<TypedAddress>;
}

/// Resolver that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl AddressResolver for NoResolver {
   fn resolve(&self, _addr: &TypedAddress) -> Option<TypedAddress> {
      None
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
   #[default]
   Handset,
   Earbud,
}

/// Persisted per-device record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceProperties {
   pub name: SmolStr,
   pub kind: DeviceKind,
   pub supported: ProfileSet,
   /// Order in which profiles are connected.
   pub connect_order: Vec<Profile>,
   /// Profiles that were connected when the device last disconnected.
   pub last_connected: ProfileSet,
   pub most_recently_used: bool,
   /// Resolvable private addresses known to belong to this device.
   pub aliases: Vec<BdAddr>,
}

impl DeviceProperties {
   pub fn handset(name: impl Into<SmolStr>, supported: ProfileSet) -> Self {
      Self {
         name: name.into(),
         kind: DeviceKind::Handset,
         supported,
         connect_order: supported.iter().collect(),
         ..Default::default()
      }
   }

   /// Profiles to connect when a client did not name any.
   pub fn default_profiles(&self) -> ProfileSet {
      if self.last_connected.is_empty() {
         self.supported
      } else {
         self.last_connected
      }
   }
}

/// Device registry operations used by the link core.
pub trait DeviceRegistry: AddressResolver + Send + Sync {
   fn properties(&self, addr: &BdAddr) -> Option<DeviceProperties>;

   /// Inserts or replaces a device.
   fn store(&self, addr: &BdAddr, props: DeviceProperties) -> Result<()>;

   fn devices(&self) -> Vec<(BdAddr, DeviceProperties)>;

   /// Applies `update` to an existing device.
   fn update(&self, addr: &BdAddr, update: &mut dyn FnMut(&mut DeviceProperties)) -> Result<()> {
      let mut props = self
         .properties(addr)
         .ok_or(LinkError::DeviceNotFound(*addr))?;
      update(&mut props);
      self.store(addr, props)
   }

   fn most_recently_used(&self) -> Option<BdAddr> {
      self
         .devices()
         .into_iter()
         .find(|(_, p)| p.kind == DeviceKind::Handset && p.most_recently_used)
         .map(|(addr, _)| addr)
   }

   /// Marks `addr` as the most recently used handset, clearing the flag
   /// everywhere else.
   fn set_most_recently_used(&self, addr: &BdAddr) -> Result<()> {
      if self.properties(addr).is_none() {
         return Err(LinkError::DeviceNotFound(*addr));
      }
      for (other, props) in self.devices() {
         let mru = other == *addr;
         if props.most_recently_used != mru {
            self.update(&other, &mut |p| p.most_recently_used = mru)?;
         }
      }
      Ok(())
   }
}

fn resolve_in<'a>(
   devices: impl IntoIterator<Item = (&'a BdAddr, &'a DeviceProperties)>,
   addr: &TypedAddress,
) -> Option<TypedAddress> {
   devices
      .into_iter()
      .find(|(_, p)| p.aliases.contains(&addr.addr))
      .map(|(public, _)| TypedAddress {
         transport: addr.transport,
         kind: crate::address::AddressType::Public,
         addr: *public,
      })
}

// === In-memory registry ===

/// Registry kept in memory. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevices {
   devices: Arc<RwLock<HashMap<BdAddr, DeviceProperties>>>,
}

impl MemoryDevices {
   pub fn new() -> Self {
      Self::default()
   }

   /// Teaches the registry that `rpa` belongs to `public`.
   pub fn add_resolvable(&self, rpa: BdAddr, public: BdAddr) {
      let mut devices = self.devices.write();
      let props = devices.entry(public).or_default();
      if !props.aliases.contains(&rpa) {
         props.aliases.push(rpa);
      }
   }
}

impl AddressResolver for MemoryDevices {
   fn resolve(&self, addr: &TypedAddress) -> Option<TypedAddress> {
      resolve_in(self.devices.read().iter(), addr)
   }
}

impl DeviceRegistry for MemoryDevices {
   fn properties(&self, addr: &BdAddr) -> Option<DeviceProperties> {
      self.devices.read().get(addr).cloned()
   }

   fn store(&self, addr: &BdAddr, props: DeviceProperties) -> Result<()> {
      self.devices.write().insert(*addr, props);
      Ok(())
   }

   fn devices(&self) -> Vec<(BdAddr, DeviceProperties)> {
      let mut all: Vec<_> = self
         .devices
         .read()
         .iter()
         .map(|(a, p)| (*a, p.clone()))
         .collect();
      all.sort_by_key(|(a, _)| *a);
      all
   }
}

// === LMDB-backed registry ===

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = BdAddr;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = BdAddr;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(BdAddr(s))
   }
}

struct Db {
   env: Env,
   /// Public address -> `DeviceProperties`
   devices: Database<KeyCodec, SerdeBincode<DeviceProperties>>,
}

/// Device registry persisted with heed (LMDB).
///
/// Reads go straight to the database; there is no cache, so every
/// clone sees every write as soon as it commits.
#[derive(Clone)]
pub struct DeviceStore {
   db: Arc<Db>,
}

impl DeviceStore {
   /// Opens or creates the store under `path`.
   pub fn open(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(path)?
      };

      let mut wtxn = env.write_txn()?;
      let devices = env.create_database(&mut wtxn, Some("devices"))?;
      wtxn.commit()?;

      info!("Device store opened at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, devices }),
      })
   }

   /// `~/.local/share/budlinkd/devices.db`, unless overridden.
   pub fn default_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BUDLINK_DEVICE_DB") {
         return Ok(PathBuf::from(path));
      }
      let base = dirs::data_local_dir().ok_or(LinkError::DataDirNotFound)?;
      Ok(base.join("budlinkd").join("devices.db"))
   }

   fn try_devices(&self) -> Result<Vec<(BdAddr, DeviceProperties)>> {
      let rtxn = self.db.env.read_txn()?;
      let mut out = Vec::new();
      for entry in self.db.devices.iter(&rtxn)? {
         out.push(entry?);
      }
      Ok(out)
   }
}

impl AddressResolver for DeviceStore {
   fn resolve(&self, addr: &TypedAddress) -> Option<TypedAddress> {
      let devices = self.devices();
      resolve_in(devices.iter().map(|(a, p)| (a, p)), addr)
   }
}

impl DeviceRegistry for DeviceStore {
   fn properties(&self, addr: &BdAddr) -> Option<DeviceProperties> {
      let lookup = || -> Result<Option<DeviceProperties>> {
         let rtxn = self.db.env.read_txn()?;
         Ok(self.db.devices.get(&rtxn, addr)?)
      };
      lookup().unwrap_or_else(|e| {
         warn!("Device store read for {addr} failed: {e}");
         None
      })
   }

   fn store(&self, addr: &BdAddr, props: DeviceProperties) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.devices.put(&mut wtxn, addr, &props)?;
      wtxn.commit()?;
      debug!("Stored device {addr} ({})", props.name);
      Ok(())
   }

   fn devices(&self) -> Vec<(BdAddr, DeviceProperties)> {
      self.try_devices().unwrap_or_else(|e| {
         warn!("Device store scan failed: {e}");
         Vec::new()
      })
   }
}
