//! Controller backed by BlueZ through `bluer`.
//!
//! BlueZ owns the HCI link layer, so connection parameters cannot be
//! set from here; those calls are logged and dropped. Link state is
//! tracked by watching adapter events and polling the connected
//! property of every device the adapter knows about.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::mpsc,
   time::{self, MissedTickBehavior},
};

use crate::{
   address::{BdAddr, TypedAddress},
   controller::{Controller, ControllerEvent, DisconnectReason},
   error::{Result, Status},
   link::qos::ConnParams,
};

/// Interval to poll device connection state and RSSI
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);

fn to_bluer(addr: &BdAddr) -> Address {
   Address::new(addr.0)
}

#[derive(Debug, Default)]
struct Tracked {
   connected: HashMap<BdAddr, bool>,
   rssi: HashMap<BdAddr, i8>,
}

pub struct BluezController {
   adapter: Adapter,
   events: mpsc::UnboundedSender<ControllerEvent>,
   tracked: Arc<Mutex<Tracked>>,
}

impl BluezController {
   /// Opens the default adapter, powers it and starts watching it.
   pub async fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
      }
      info!("Using adapter {} ({})", adapter.name(), adapter.address().await?);

      let controller = Self {
         adapter,
         events,
         tracked: Arc::default(),
      };
      controller.start_monitor();
      Ok(controller)
   }

   fn start_monitor(&self) {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let tracked = self.tracked.clone();
      tokio::spawn(async move {
         let Ok(mut adapter_events) = adapter.events().await else {
            warn!("Failed to get adapter events");
            return;
         };
         let mut health = time::interval(HEALTH_CHECK_INTERVAL);
         health.set_missed_tick_behavior(MissedTickBehavior::Skip);

         loop {
            tokio::select! {
               _ = health.tick() => Self::scan(&adapter, &events, &tracked).await,
               event = adapter_events.next() => match event {
                  Some(AdapterEvent::DeviceAdded(addr)) => {
                     debug!("bluez: device added {addr}");
                  },
                  Some(AdapterEvent::DeviceRemoved(addr)) => {
                     let addr = BdAddr(addr.0);
                     if tracked.lock().connected.remove(&addr) == Some(true) {
                        let _ = events.send(ControllerEvent::Disconnected {
                           addr: TypedAddress::bredr(addr),
                           reason: DisconnectReason::LinkLoss,
                        });
                     }
                  },
                  Some(_) => {},
                  None => {
                     warn!("Adapter event stream ended");
                     break;
                  },
               },
            }
         }
      });
   }

   async fn scan(
      adapter: &Adapter,
      events: &mpsc::UnboundedSender<ControllerEvent>,
      tracked: &Mutex<Tracked>,
   ) {
      let Ok(addresses) = adapter.device_addresses().await else {
         return;
      };
      for address in addresses {
         let Ok(device) = adapter.device(address) else {
            continue;
         };
         let addr = BdAddr(address.0);
         let connected = device.is_connected().await.unwrap_or(false);
         let rssi = device.rssi().await.ok().flatten();

         let previous = {
            let mut tracked = tracked.lock();
            if let Some(rssi) = rssi {
               tracked.rssi.insert(addr, rssi.clamp(i8::MIN.into(), i8::MAX.into()) as i8);
            }
            tracked.connected.insert(addr, connected)
         };
         let typed = TypedAddress::bredr(addr);
         match (previous.unwrap_or(false), connected) {
            (false, true) => {
               let _ = events.send(ControllerEvent::Connected {
                  addr: typed,
                  incoming: true,
                  status: Status::Success,
               });
            },
            (true, false) => {
               let _ = events.send(ControllerEvent::Disconnected {
                  addr: typed,
                  reason: DisconnectReason::RemoteTerminated,
               });
            },
            _ => {},
         }
      }
   }
}

impl Controller for BluezController {
   fn open_link(&self, addr: &TypedAddress) {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let tracked = self.tracked.clone();
      let addr = *addr;
      tokio::spawn(async move {
         let status = match adapter.device(to_bluer(&addr.addr)) {
            Ok(device) => match device.connect().await {
               Ok(()) => Status::Success,
               Err(e) => {
                  warn!("bluez: connect {addr} failed: {e}");
                  Status::Failure
               },
            },
            Err(e) => {
               warn!("bluez: no device {addr}: {e}");
               Status::NoSuchDevice
            },
         };
         if status.is_success() {
            tracked.lock().connected.insert(addr.addr, true);
         }
         let _ = events.send(ControllerEvent::Connected {
            addr,
            incoming: false,
            status,
         });
      });
   }

   fn close_link(&self, addr: &TypedAddress, force: bool) {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let tracked = self.tracked.clone();
      let addr = *addr;
      tokio::spawn(async move {
         if let Ok(device) = adapter.device(to_bluer(&addr.addr))
            && let Err(e) = device.disconnect().await
         {
            warn!("bluez: disconnect {addr} (force: {force}) failed: {e}");
         }
         tracked.lock().connected.insert(addr.addr, false);
         let _ = events.send(ControllerEvent::Disconnected {
            addr,
            reason: DisconnectReason::LocalTerminated,
         });
      });
   }

   fn set_default_parameters(&self, params: &ConnParams) {
      debug!("bluez: default parameters not settable, ignoring {params:?}");
   }

   fn update_parameters(&self, addr: &TypedAddress, params: &ConnParams) {
      debug!("bluez: parameters for {addr} not settable, ignoring {params:?}");
   }

   fn set_connectable(&self, connectable: bool) {
      let adapter = self.adapter.clone();
      tokio::spawn(async move {
         if let Err(e) = adapter.set_pairable(connectable).await {
            warn!("bluez: set pairable {connectable} failed: {e}");
         }
      });
   }

   fn signal_strength(&self, addr: &TypedAddress) -> Option<i8> {
      self.tracked.lock().rssi.get(&addr.addr).copied()
   }

   fn link_quality(&self, _addr: &TypedAddress) -> Option<u16> {
      None
   }

   fn mic_quality(&self) -> Option<u8> {
      None
   }
}
