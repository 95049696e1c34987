//! budlinkd D-Bus service
//!
//! Runs the link core for one earbud and exposes it on the session bus
//! as `org.budlink.Manager`. The other earbud of the pair is simulated
//! in-process and reached over a loopback peer channel.

use std::sync::Arc;

use budlink::{
   Backends, Core, Result,
   address::{BdAddr, TypedAddress},
   channel::{ChannelEvent, PeerLink},
   config::Config,
   controller::{Controller, ControllerEvent, SimController},
   device::{DeviceStore, MemoryDevices},
   error::Status,
   event::ConnectionEvent,
   handover::Role,
   peer::{EventMask, MirrorEvent, Side, SimSensors},
   profile::SimProfileEngine,
};
use log::{info, warn};
use tokio::{signal, sync::mpsc};
use zbus::{Connection, connection, object_server::InterfaceRef};

use dbus::{BudlinkService, BudlinkServiceSignals, OBJECT_PATH};

mod dbus;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting budlinkd D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known handsets ({} as {})",
      config.known_handsets.len(),
      config.local_address,
      if config.primary { "primary" } else { "secondary" }
   );

   // Open the device store and add configured handsets
   let store_path = match &config.device_store {
      Some(path) => path.clone(),
      None => DeviceStore::default_path()?,
   };
   let devices = DeviceStore::open(&store_path)?;
   let seeded = config.seed_devices(&devices)?;
   if seeded > 0 {
      info!("Added {seeded} handsets to the device store");
   }

   let (local_end, peer_end) = PeerLink::pair();

   // Local earbud
   let (ctl_tx, controller_events) = mpsc::unbounded_channel();
   let controller = local_controller(ctl_tx, config.peer_address).await?;
   let (prof_tx, profile_events) = mpsc::unbounded_channel();
   let (channel, channel_events) = local_end;
   let (core, dispatcher) = Core::start(
      &config,
      Backends {
         controller,
         controller_events,
         profiles: Arc::new(SimProfileEngine::new(prof_tx)),
         profile_events,
         channel: Arc::new(channel),
         channel_events,
         devices: Arc::new(devices),
         sensors: Arc::new(SimSensors::new()),
      },
   );

   let peer = spawn_peer(&config, peer_end)?;

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.budlink")?
      .serve_at(OBJECT_PATH, BudlinkService::new(core.clone()))?
      .build()
      .await?;

   info!("budlinkd D-Bus service started at org.budlink");

   spawn_signal_forwarder(&core, connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down budlinkd...");

   peer.shutdown().await?;
   core.shutdown().await?;
   if let Err(e) = dispatcher.await {
      warn!("Dispatcher ended abnormally: {e}");
   }

   Ok(())
}

#[cfg(feature = "bluez")]
async fn local_controller(
   events: mpsc::UnboundedSender<ControllerEvent>,
   _peer: BdAddr,
) -> Result<Arc<dyn Controller>> {
   Ok(Arc::new(
      budlink::controller::bluez::BluezController::new(events).await?,
   ))
}

/// Without a radio the link to the simulated peer is reported up
/// straight away.
#[cfg(not(feature = "bluez"))]
async fn local_controller(
   events: mpsc::UnboundedSender<ControllerEvent>,
   peer: BdAddr,
) -> Result<Arc<dyn Controller>> {
   let controller = SimController::new(events);
   controller.inject(peer_link_up(peer));
   Ok(Arc::new(controller))
}

/// Starts the simulated other earbud and brings its end of the peer
/// link up.
fn spawn_peer(
   config: &Config,
   (channel, channel_events): (PeerLink, mpsc::UnboundedReceiver<ChannelEvent>),
) -> Result<Core> {
   let peer_config = Config {
      local_address: config.peer_address,
      peer_address: config.local_address,
      primary: !config.primary,
      device_store: None,
      ..config.clone()
   };
   let devices = MemoryDevices::new();
   peer_config.seed_devices(&devices)?;

   let (ctl_tx, controller_events) = mpsc::unbounded_channel();
   let (prof_tx, profile_events) = mpsc::unbounded_channel();
   let controller = SimController::new(ctl_tx);
   let (peer, _) = Core::start(
      &peer_config,
      Backends {
         controller: Arc::new(controller.clone()),
         controller_events,
         profiles: Arc::new(SimProfileEngine::new(prof_tx)),
         profile_events,
         channel: Arc::new(channel),
         channel_events,
         devices: Arc::new(devices),
         sensors: Arc::new(SimSensors::new()),
      },
   );

   controller.inject(peer_link_up(config.local_address));
   info!("Simulated peer {} started", config.peer_address);
   Ok(peer)
}

const fn peer_link_up(addr: BdAddr) -> ControllerEvent {
   ControllerEvent::Connected {
      addr: TypedAddress::bredr(addr),
      incoming: true,
      status: Status::Success,
   }
}

/// Subscribes to the core and turns its events into D-Bus signals.
async fn spawn_signal_forwarder(core: &Core, connection: Connection) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, BudlinkService>(OBJECT_PATH)
      .await?;

   let (conn_tx, mut connections) = mpsc::unbounded_channel();
   let (role_tx, mut roles) = mpsc::unbounded_channel();
   let (mirror_tx, mut mirror) = mpsc::unbounded_channel();
   core.subscribe_connections(conn_tx, None).await?;
   core.subscribe_role(role_tx).await?;
   core.subscribe_mirror(mirror_tx, EventMask::ALL).await?;

   let core = core.clone();
   tokio::spawn(async move {
      loop {
         let result = tokio::select! {
            Some(event) = connections.recv() => forward_connection(&iface, event).await,
            Some(role) = roles.recv() => forward_role(&iface, role).await,
            Some(event) = mirror.recv() => forward_mirror(&iface, &core, &event).await,
            else => break,
         };
         if let Err(e) = result {
            warn!("Error dispatching event: {e}");
         }
      }
   });

   Ok(())
}

async fn forward_connection(
   iface: &InterfaceRef<BudlinkService>,
   event: ConnectionEvent,
) -> Result<()> {
   match event {
      ConnectionEvent::Connected { addr, incoming } => {
         iface
            .link_connected(&addr.addr.to_string(), incoming)
            .await?;
      },
      ConnectionEvent::Disconnected { addr, reason } => {
         iface
            .link_disconnected(&addr.addr.to_string(), reason.code())
            .await?;
      },
      ConnectionEvent::DisconnectRequested { .. } | ConnectionEvent::ParamsChanged { .. } => {},
   }
   Ok(())
}

async fn forward_role(iface: &InterfaceRef<BudlinkService>, role: Role) -> Result<()> {
   info!("Role is now {role}");
   let role: &'static str = role.into();
   iface.role_switched(role).await?;
   Ok(())
}

async fn forward_mirror(
   iface: &InterfaceRef<BudlinkService>,
   core: &Core,
   event: &MirrorEvent,
) -> Result<()> {
   let remote = match event {
      MirrorEvent::InitialStateReceived => true,
      MirrorEvent::PeerLinkChanged { .. } => false,
      MirrorEvent::Physical { side, .. }
      | MirrorEvent::Flag { side, .. }
      | MirrorEvent::Battery { side, .. }
      | MirrorEvent::Handset { side, .. }
      | MirrorEvent::LinkQuality { side, .. }
      | MirrorEvent::MicQuality { side, .. }
      | MirrorEvent::FeatureMode { side, .. } => *side == Side::Remote,
   };
   if remote {
      iface
         .peer_state_changed(&core.remote_snapshot().to_json().to_string())
         .await?;
   }
   Ok(())
}
