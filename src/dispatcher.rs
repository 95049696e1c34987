//! The core dispatcher and its public handle.
//!
//! One task owns every component: the link manager, the sessions, the
//! peer mirror and the handover coordinator. Everything reaches it as a
//! message: client commands through the bounded inbox, controller,
//! profile and peer-channel indications through their own receivers,
//! and the core's own deferred work through the loopback. After each
//! message the components' queued actions are executed until none are
//! left, and the read-only views in [`Shared`] are refreshed.

use std::{
   collections::{HashMap, VecDeque},
   mem,
   sync::Arc,
   time::Duration,
};

use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::{
   address::{BdAddr, TransportMask, TypedAddress},
   channel::{ChannelEvent, ChannelId, PeerChannel, PeerFrame},
   config::Config,
   controller::{Controller, ControllerEvent},
   device::DeviceRegistry,
   error::{LinkError, Result},
   event::{Client, ConnectableChanged, ConnectionEvent, SessionNotice, Subscriber},
   handover::{
      ComponentId, HandoverCoordinator, HandoverMessage, HandoverParticipant, HandoverReport,
      MarshalData, ParticipantSet, Role,
   },
   link::{LinkAction, LinkEvent, LinkImage, LinkInternal, LinkManager, QosEngine, QosLevel},
   notify::SubscriberList,
   peer::{
      EventMask, LocalSensors, LocalUpdate, Mirror, MirrorAction, MirrorEvent, PeerMessage,
      PeerSnapshot, collect,
   },
   profile::{ProfileEngine, ProfileEvent, ProfileSet},
   session::{SessionAction, SessionImage, SessionManager},
};

/// Inbox capacity
const CHANNEL_BUFFER_SIZE: usize = 256;

/// What the core runs against.
pub struct Backends {
   pub controller: Arc<dyn Controller>,
   pub controller_events: mpsc::UnboundedReceiver<ControllerEvent>,
   pub profiles: Arc<dyn ProfileEngine>,
   pub profile_events: mpsc::UnboundedReceiver<ProfileEvent>,
   pub channel: Arc<dyn PeerChannel>,
   pub channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
   pub devices: Arc<dyn DeviceRegistry>,
   pub sensors: Arc<dyn LocalSensors>,
}

// === Commands ===

enum Command {
   // Handset sessions
   Connect(Client, BdAddr, ProfileSet),
   Disconnect(Client, BdAddr),
   Stop(Client, BdAddr),

   // Links
   ConnectLink(TypedAddress),
   ReleaseLink(TypedAddress),
   DisconnectLink(TypedAddress, bool),
   RequestQos(TypedAddress, QosLevel),
   ReleaseQos(TypedAddress, QosLevel),
   RequestDefaultQos(QosLevel),
   SetQosCeiling(QosLevel),
   SetConnectable(bool),

   // Subscriptions
   SubscribeConnections(Subscriber<ConnectionEvent>, Option<TransportMask>),
   SubscribeConnectable(Subscriber<ConnectableChanged>),
   SubscribeMirror(Subscriber<MirrorEvent>, EventMask),
   UnsubscribeMirror(Subscriber<MirrorEvent>),
   SubscribeRole(Subscriber<Role>),

   // Mirror
   MirrorPause,
   MirrorUnpause,
   UpdateLocal(LocalUpdate),

   Handover(oneshot::Sender<Result<HandoverReport>>),
   Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
   AclRetry(BdAddr),
   LinkPoll,
   MicPoll,
   HandoverAck(u32),
}

/// Messages the dispatcher posts to itself.
#[derive(Debug)]
enum Loopback {
   Link(LinkInternal),
   /// Timer `key` fired; the sequence number tells stale firings apart.
   Timer(TimerKey, u64),
}

enum Input {
   Command(Command),
   Loopback(Loopback),
   Controller(ControllerEvent),
   Profile(ProfileEvent),
   Channel(ChannelEvent),
}

// === Shared views ===

/// State published by the dispatcher after every message.
#[derive(Default)]
struct Shared {
   role: AtomicCell<Role>,
   links: RwLock<Vec<LinkImage>>,
   sessions: RwLock<Vec<SessionImage>>,
   local: RwLock<PeerSnapshot>,
   remote: RwLock<PeerSnapshot>,
}

// === Public handle ===

/// Handle to a running core. Cheap to clone.
#[derive(Clone)]
pub struct Core {
   inbox: mpsc::Sender<Command>,
   shared: Arc<Shared>,
}

impl Core {
   /// Builds every component from `config` and spawns the dispatcher.
   pub fn start(config: &Config, backends: Backends) -> (Self, JoinHandle<()>) {
      let (inbox, inbox_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let shared = Arc::new(Shared::default());
      let Backends {
         controller,
         controller_events,
         profiles,
         profile_events,
         channel,
         channel_events,
         devices,
         sensors,
      } = backends;

      let qos = QosEngine::new(config.qos.default, config.qos.max, config.qos.table.clone());
      let links = LinkManager::new(
         config.max_links,
         qos,
         devices.clone(),
         config.local_address,
         config.peer_address,
      );
      let sessions = SessionManager::new(config.session_limits(), devices);
      let role = if config.primary { Role::Primary } else { Role::Secondary };
      let (loopback, loopback_rx) = mpsc::unbounded_channel();

      let mut dispatcher = Dispatcher {
         links,
         sessions,
         mirror: Mirror::new(config.mirror_config()),
         coordinator: HandoverCoordinator::with_default_participants(),
         role,
         controller,
         profiles,
         channel,
         sensors,
         loopback,
         deferred: Vec::new(),
         timers: HashMap::new(),
         timer_seq: 0,
         link_poll: None,
         mic_poll: None,
         ack_timeout: config.handover_ack_timeout(),
         pending_handover: None,
         held: VecDeque::new(),
         role_subscribers: SubscriberList::new(),
         shared: shared.clone(),
      };
      dispatcher.boot();

      let handle = tokio::spawn(dispatcher.run(
         inbox_rx,
         loopback_rx,
         controller_events,
         profile_events,
         channel_events,
      ));
      (Self { inbox, shared }, handle)
   }

   async fn send(&self, command: Command) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| LinkError::CoreShutdown)
   }

   async fn wait(mut rx: mpsc::UnboundedReceiver<SessionNotice>) -> Result<SessionNotice> {
      rx.recv().await.ok_or(LinkError::CoreShutdown)
   }

   /// Connects `profiles` on a handset, opening its link first if needed,
   /// and waits for the outcome. An empty set only brings the link up.
   pub async fn connect_handset(&self, addr: BdAddr, profiles: ProfileSet) -> Result<SessionNotice> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.connect_handset_for(tx, addr, profiles).await?;
      Self::wait(rx).await
   }

   /// Queues `client` on a handset connect; the completion is sent to it.
   pub async fn connect_handset_for(
      &self,
      client: Client,
      addr: BdAddr,
      profiles: ProfileSet,
   ) -> Result<()> {
      self.send(Command::Connect(client, addr, profiles)).await
   }

   pub async fn disconnect_handset(&self, addr: BdAddr) -> Result<SessionNotice> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.disconnect_handset_for(tx, addr).await?;
      Self::wait(rx).await
   }

   pub async fn disconnect_handset_for(&self, client: Client, addr: BdAddr) -> Result<()> {
      self.send(Command::Disconnect(client, addr)).await
   }

   /// Abandons an ongoing connect.
   pub async fn stop_handset(&self, addr: BdAddr) -> Result<SessionNotice> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.send(Command::Stop(tx, addr)).await?;
      Self::wait(rx).await
   }

   pub async fn connect_link(&self, addr: TypedAddress) -> Result<()> {
      self.send(Command::ConnectLink(addr)).await
   }

   pub async fn release_link(&self, addr: TypedAddress) -> Result<()> {
      self.send(Command::ReleaseLink(addr)).await
   }

   pub async fn disconnect_link(&self, addr: TypedAddress, force: bool) -> Result<()> {
      self.send(Command::DisconnectLink(addr, force)).await
   }

   pub async fn request_qos(&self, addr: TypedAddress, level: QosLevel) -> Result<()> {
      self.send(Command::RequestQos(addr, level)).await
   }

   pub async fn release_qos(&self, addr: TypedAddress, level: QosLevel) -> Result<()> {
      self.send(Command::ReleaseQos(addr, level)).await
   }

   pub async fn request_default_qos(&self, level: QosLevel) -> Result<()> {
      self.send(Command::RequestDefaultQos(level)).await
   }

   pub async fn set_qos_ceiling(&self, level: QosLevel) -> Result<()> {
      self.send(Command::SetQosCeiling(level)).await
   }

   pub async fn set_handset_connectable(&self, connectable: bool) -> Result<()> {
      self.send(Command::SetConnectable(connectable)).await
   }

   /// All connection events, or only those on `transports`.
   pub async fn subscribe_connections(
      &self,
      tx: Subscriber<ConnectionEvent>,
      transports: Option<TransportMask>,
   ) -> Result<()> {
      self.send(Command::SubscribeConnections(tx, transports)).await
   }

   pub async fn subscribe_connectable(&self, tx: Subscriber<ConnectableChanged>) -> Result<()> {
      self.send(Command::SubscribeConnectable(tx)).await
   }

   pub async fn subscribe_mirror(&self, tx: Subscriber<MirrorEvent>, mask: EventMask) -> Result<()> {
      self.send(Command::SubscribeMirror(tx, mask)).await
   }

   pub async fn unsubscribe_mirror(&self, tx: Subscriber<MirrorEvent>) -> Result<()> {
      self.send(Command::UnsubscribeMirror(tx)).await
   }

   pub async fn subscribe_role(&self, tx: Subscriber<Role>) -> Result<()> {
      self.send(Command::SubscribeRole(tx)).await
   }

   pub async fn mirror_pause(&self) -> Result<()> {
      self.send(Command::MirrorPause).await
   }

   pub async fn mirror_unpause(&self) -> Result<()> {
      self.send(Command::MirrorUnpause).await
   }

   pub async fn update_local(&self, update: LocalUpdate) -> Result<()> {
      self.send(Command::UpdateLocal(update)).await
   }

   /// Hands the primary role to the peer.
   pub async fn handover(&self) -> Result<HandoverReport> {
      let (tx, rx) = oneshot::channel();
      self.send(Command::Handover(tx)).await?;
      rx.await.map_err(|_| LinkError::CoreShutdown)?
   }

   pub async fn shutdown(&self) -> Result<()> {
      self.send(Command::Shutdown).await
   }

   pub fn role(&self) -> Role {
      self.shared.role.load()
   }

   pub fn links(&self) -> Vec<LinkImage> {
      self.shared.links.read().clone()
   }

   pub fn sessions(&self) -> Vec<SessionImage> {
      self.shared.sessions.read().clone()
   }

   pub fn local_snapshot(&self) -> PeerSnapshot {
      self.shared.local.read().clone()
   }

   pub fn remote_snapshot(&self) -> PeerSnapshot {
      self.shared.remote.read().clone()
   }
}

// === Dispatcher ===

struct Participants<'a> {
   links: &'a mut LinkManager,
   sessions: &'a mut SessionManager,
   mirror: &'a mut Mirror,
}

impl ParticipantSet for Participants<'_> {
   fn participant(&mut self, id: ComponentId) -> Option<&mut dyn HandoverParticipant> {
      let participant: &mut dyn HandoverParticipant = match id {
         ComponentId::Links => &mut *self.links,
         ComponentId::Qos => self.links.qos_mut(),
         ComponentId::Sessions => &mut *self.sessions,
         ComponentId::PeerState => &mut *self.mirror,
      };
      Some(participant)
   }
}

struct Dispatcher {
   links: LinkManager,
   sessions: SessionManager,
   mirror: Mirror,
   coordinator: HandoverCoordinator,
   role: Role,

   controller: Arc<dyn Controller>,
   profiles: Arc<dyn ProfileEngine>,
   channel: Arc<dyn PeerChannel>,
   sensors: Arc<dyn LocalSensors>,

   loopback: mpsc::UnboundedSender<Loopback>,
   /// Classic links to open once their lock clears.
   deferred: Vec<TypedAddress>,
   timers: HashMap<TimerKey, (u64, JoinHandle<()>)>,
   timer_seq: u64,
   link_poll: Option<Duration>,
   mic_poll: Option<Duration>,

   ack_timeout: Duration,
   pending_handover: Option<oneshot::Sender<Result<HandoverReport>>>,
   /// Inputs that arrived while a handover waited for its ack.
   held: VecDeque<Input>,
   role_subscribers: SubscriberList<Role>,
   shared: Arc<Shared>,
}

impl Dispatcher {
   fn boot(&mut self) {
      let snapshot = collect::assemble(
         self.role,
         &*self.sensors,
         &self.links,
         &self.sessions,
         &*self.controller,
      );
      self.mirror.start(snapshot);
      self.shared.role.store(self.role);
      self.publish();
   }

   async fn run(
      mut self,
      mut inbox: mpsc::Receiver<Command>,
      mut loopback: mpsc::UnboundedReceiver<Loopback>,
      mut controller: mpsc::UnboundedReceiver<ControllerEvent>,
      mut profiles: mpsc::UnboundedReceiver<ProfileEvent>,
      mut channel: mpsc::UnboundedReceiver<ChannelEvent>,
   ) {
      info!("Link core starting up as {}", self.role);
      loop {
         let input = select! {
            biased;
            Some(msg) = loopback.recv() => Input::Loopback(msg),
            Some(event) = controller.recv() => Input::Controller(event),
            Some(event) = profiles.recv() => Input::Profile(event),
            Some(event) = channel.recv() => Input::Channel(event),
            cmd = inbox.recv() => {
               let Some(cmd) = cmd else {
                  info!("Link core inbox closed");
                  break;
               };
               Input::Command(cmd)
            }
         };
         if matches!(input, Input::Command(Command::Shutdown)) {
            info!("Link core shutting down");
            break;
         }
         self.dispatch(input);
      }

      for (_, (_, handle)) in self.timers.drain() {
         handle.abort();
      }
      if let Some(reply) = self.pending_handover.take() {
         let _ = reply.send(Err(LinkError::CoreShutdown));
      }
   }

   fn dispatch(&mut self, input: Input) {
      if self.pending_handover.is_some() && !Self::is_handover_input(&input) {
         self.held.push_back(input);
         return;
      }
      match input {
         Input::Command(cmd) => self.handle_command(cmd),
         Input::Loopback(Loopback::Link(msg)) => self.links.on_internal(msg),
         Input::Loopback(Loopback::Timer(key, seq)) => self.on_timer(key, seq),
         Input::Controller(event) => self.links.on_controller(event),
         Input::Profile(event) => self.sessions.on_profile_event(&self.links, event),
         Input::Channel(event) => self.on_channel(event),
      }
      self.pump();
   }

   fn is_handover_input(input: &Input) -> bool {
      match input {
         Input::Channel(ChannelEvent::Frame(frame)) => frame.channel == ChannelId::Handover,
         Input::Loopback(Loopback::Timer(TimerKey::HandoverAck(_), _)) => true,
         _ => false,
      }
   }

   fn handle_command(&mut self, cmd: Command) {
      match cmd {
         Command::Connect(client, addr, profiles) => {
            self.sessions.connect(&self.links, client, addr, profiles);
         },
         Command::Disconnect(client, addr) => self.sessions.disconnect(&self.links, client, addr),
         Command::Stop(client, addr) => self.sessions.stop(&self.links, client, addr),
         Command::ConnectLink(addr) => self.links.connect(addr),
         Command::ReleaseLink(addr) => self.links.release(&addr),
         Command::DisconnectLink(addr, force) => self.links.disconnect(&addr, force),
         Command::RequestQos(addr, level) => self.links.request_qos(&addr, level),
         Command::ReleaseQos(addr, level) => self.links.release_qos(&addr, level),
         Command::RequestDefaultQos(level) => self.links.request_default_qos(level),
         Command::SetQosCeiling(level) => self.links.set_qos_ceiling(level),
         Command::SetConnectable(on) => self.links.set_handset_connectable(on),
         Command::SubscribeConnections(tx, None) => {
            self.links.notifier_mut().register_connections(tx);
         },
         Command::SubscribeConnections(tx, Some(mask)) => {
            self.links.notifier_mut().register_transport(tx, mask);
         },
         Command::SubscribeConnectable(tx) => {
            self.links.notifier_mut().register_connectable(tx);
         },
         Command::SubscribeMirror(tx, mask) => {
            self.mirror.subscribe(tx, mask);
         },
         Command::UnsubscribeMirror(tx) => {
            self.mirror.unsubscribe(&tx);
         },
         Command::SubscribeRole(tx) => {
            self.role_subscribers.register(tx, ());
         },
         Command::MirrorPause => self.mirror.pause(),
         Command::MirrorUnpause => self.mirror.unpause(),
         Command::UpdateLocal(update) => self.mirror.update_local(update),
         Command::Handover(reply) => self.start_handover(reply),
         Command::Shutdown => {},
      }
   }

   /// Executes queued actions until every component is quiet, then
   /// flushes the mirror and republishes.
   fn pump(&mut self) {
      loop {
         self
            .mirror
            .apply_connection(collect::connection(&self.links, &self.sessions));

         let mut progressed = false;
         for action in self.links.take_actions() {
            progressed = true;
            self.exec_link(action);
         }
         for action in self.sessions.take_actions() {
            progressed = true;
            self.exec_session(action);
         }
         for action in self.mirror.take_actions() {
            progressed = true;
            self.exec_mirror(action);
         }
         progressed |= self.run_deferred();
         if !progressed {
            break;
         }
      }
      self.mirror.flush(&*self.channel);
      self.publish();
   }

   fn exec_link(&mut self, action: LinkAction) {
      match action {
         LinkAction::Open(addr) => self.controller.open_link(&addr),
         LinkAction::Close { addr, force } => self.controller.close_link(&addr, force),
         LinkAction::SetDefaultParams(params) => self.controller.set_default_parameters(&params),
         LinkAction::UpdateParams { addr, params } => {
            self.controller.update_parameters(&addr, &params);
         },
         LinkAction::SetConnectable(on) => self.controller.set_connectable(on),
         LinkAction::Internal(msg) => {
            if self.loopback.send(Loopback::Link(msg)).is_err() {
               error!("Loopback closed, dropping {msg:?}");
            }
         },
         LinkAction::Event(event) => {
            if self.links.is_peer(event.addr()) {
               match event {
                  LinkEvent::Connected { .. } => self.mirror.on_peer_link(true),
                  LinkEvent::Disconnected { .. } => self.mirror.on_peer_link(false),
                  LinkEvent::ConnectFailed { .. } => {},
               }
            }
            self.sessions.on_link_event(&self.links, event);
         },
      }
   }

   fn exec_session(&mut self, action: SessionAction) {
      match action {
         SessionAction::OpenAcl(addr) => {
            if !self.deferred.contains(&addr) {
               self.deferred.push(addr);
            }
         },
         SessionAction::CloseAcl(addr) => {
            self.deferred.retain(|a| *a != addr);
            self.links.disconnect(&addr, false);
         },
         SessionAction::ConnectProfiles(addr, profiles) => {
            self.profiles.connect_profiles(addr, profiles);
         },
         SessionAction::DisconnectProfiles(addr, profiles) => {
            self.profiles.disconnect_profiles(addr, profiles);
         },
         SessionAction::StartRetryTimer(addr, delay) => {
            self.start_timer(TimerKey::AclRetry(addr), delay);
         },
         SessionAction::CancelRetryTimer(addr) => self.cancel_timer(TimerKey::AclRetry(addr)),
      }
   }

   fn exec_mirror(&mut self, action: MirrorAction) {
      match action {
         MirrorAction::StartLinkPoll(interval) => {
            self.link_poll = Some(interval);
            self.start_timer(TimerKey::LinkPoll, interval);
         },
         MirrorAction::StopLinkPoll => {
            self.link_poll = None;
            self.cancel_timer(TimerKey::LinkPoll);
         },
         MirrorAction::StartMicPoll(interval) => {
            self.mic_poll = Some(interval);
            self.start_timer(TimerKey::MicPoll, interval);
         },
         MirrorAction::StopMicPoll => {
            self.mic_poll = None;
            self.cancel_timer(TimerKey::MicPoll);
         },
      }
   }

   /// Opens the deferred links whose lock has cleared.
   fn run_deferred(&mut self) -> bool {
      let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.deferred)
         .into_iter()
         .partition(|addr| self.links.lock(addr).is_clear());
      self.deferred = waiting;
      for addr in &ready {
         debug!("opening deferred link {addr}");
         self.links.connect(*addr);
      }
      !ready.is_empty()
   }

   fn publish(&self) {
      *self.shared.links.write() = self.links.images();
      *self.shared.sessions.write() = self.sessions.images();
      *self.shared.local.write() = self.mirror.local().clone();
      *self.shared.remote.write() = self.mirror.remote().clone();
   }

   // === Timers ===

   fn start_timer(&mut self, key: TimerKey, delay: Duration) {
      self.timer_seq += 1;
      let seq = self.timer_seq;
      let loopback = self.loopback.clone();
      let handle = tokio::spawn(async move {
         tokio::time::sleep(delay).await;
         let _ = loopback.send(Loopback::Timer(key, seq));
      });
      if let Some((_, previous)) = self.timers.insert(key, (seq, handle)) {
         previous.abort();
      }
   }

   fn cancel_timer(&mut self, key: TimerKey) {
      if let Some((_, handle)) = self.timers.remove(&key) {
         handle.abort();
      }
   }

   fn on_timer(&mut self, key: TimerKey, seq: u64) {
      match self.timers.get(&key) {
         Some((current, _)) if *current == seq => {
            self.timers.remove(&key);
         },
         _ => {
            debug!("stale timer {key:?}");
            return;
         },
      }
      match key {
         TimerKey::AclRetry(addr) => self.sessions.on_retry(addr),
         TimerKey::LinkPoll => {
            let links = collect::links(&self.links, &*self.controller);
            self.mirror.update_local(LocalUpdate::LinkQuality(links));
            if let Some(interval) = self.link_poll {
               self.start_timer(TimerKey::LinkPoll, interval);
            }
         },
         TimerKey::MicPoll => {
            let quality = self.controller.mic_quality();
            self.mirror.update_local(LocalUpdate::MicQuality(quality));
            if let Some(interval) = self.mic_poll {
               self.start_timer(TimerKey::MicPoll, interval);
            }
         },
         TimerKey::HandoverAck(attempt) => self.on_handover_timeout(attempt),
      }
   }

   // === Peer channel ===

   fn on_channel(&mut self, event: ChannelEvent) {
      match event {
         ChannelEvent::Connected(up) => self.mirror.on_channel(up),
         ChannelEvent::Frame(frame) => match frame.channel {
            ChannelId::StateProxy => match PeerMessage::from_frame(&frame) {
               Ok(message) => self.mirror.on_message(message),
               Err(e) => warn!("Undecodable peer message (tag {}): {e}", frame.tag),
            },
            ChannelId::Handover => match frame.decode::<HandoverMessage>() {
               Ok(HandoverMessage::Transfer { attempt, items }) => self.on_transfer(attempt, items),
               Ok(HandoverMessage::Ack { attempt, accepted }) => self.on_ack(attempt, accepted),
               Err(e) => warn!("Undecodable handover message: {e}"),
            },
         },
      }
   }

   fn send_handover(&self, message: &HandoverMessage) -> Result<()> {
      let tag = match message {
         HandoverMessage::Transfer { .. } => 0,
         HandoverMessage::Ack { .. } => 1,
      };
      self
         .channel
         .send(PeerFrame::encode(ChannelId::Handover, tag, message)?)
   }

   // === Handover ===

   fn participants(&mut self) -> (&mut HandoverCoordinator, Participants<'_>) {
      (
         &mut self.coordinator,
         Participants {
            links: &mut self.links,
            sessions: &mut self.sessions,
            mirror: &mut self.mirror,
         },
      )
   }

   fn set_role(&mut self, role: Role) {
      if self.role == role {
         return;
      }
      info!("Role changed: {} -> {role}", self.role);
      self.role = role;
      self.shared.role.store(role);
      self.role_subscribers.deliver(&role, |_| true);
   }

   fn start_handover(&mut self, reply: oneshot::Sender<Result<HandoverReport>>) {
      if self.role != Role::Primary {
         let _ = reply.send(Err(LinkError::HandoverFailed("not primary".into())));
         return;
      }
      if !self.channel.is_connected() {
         let _ = reply.send(Err(LinkError::PeerNotConnected));
         return;
      }

      let (coordinator, mut set) = self.participants();
      let message = match coordinator.begin(&mut set) {
         Ok(message) => message,
         Err(e) => {
            let _ = reply.send(Err(e));
            return;
         },
      };
      let Some(attempt) = self.coordinator.awaiting_ack() else {
         let _ = reply.send(Err(LinkError::HandoverFailed("no attempt outstanding".into())));
         return;
      };
      if let Err(e) = self.send_handover(&message) {
         self.coordinator.abort(attempt);
         let _ = reply.send(Err(e));
         return;
      }
      self.pending_handover = Some(reply);
      self.start_timer(TimerKey::HandoverAck(attempt), self.ack_timeout);
   }

   fn on_transfer(&mut self, attempt: u32, items: Vec<MarshalData>) {
      if self.role == Role::Primary {
         warn!("Handover transfer {attempt} received while primary, rejecting");
         let ack = HandoverMessage::Ack {
            attempt,
            accepted: false,
         };
         if let Err(e) = self.send_handover(&ack) {
            warn!("Failed to reject handover: {e}");
         }
         return;
      }

      let (coordinator, mut set) = self.participants();
      let (ack, outcome) = coordinator.receive(&mut set, attempt, items);
      if let Err(e) = self.send_handover(&ack) {
         warn!("Failed to acknowledge handover {attempt}: {e}");
      }
      match outcome {
         Ok(report) => {
            info!("Took over primary role ({} items)", report.transferred);
            self.set_role(Role::Primary);
         },
         Err(e) => warn!("Handover {attempt} failed on this side: {e}"),
      }
   }

   fn on_ack(&mut self, attempt: u32, accepted: bool) {
      if self.coordinator.awaiting_ack() != Some(attempt) {
         debug!("ignoring ack for attempt {attempt}");
         return;
      }
      self.cancel_timer(TimerKey::HandoverAck(attempt));
      let (coordinator, mut set) = self.participants();
      let result = coordinator.on_ack(&mut set, attempt, accepted);
      if result.is_ok() {
         self.set_role(Role::Secondary);
      }
      self.finish_handover(result);
   }

   fn on_handover_timeout(&mut self, attempt: u32) {
      if self.coordinator.abort(attempt) {
         self.finish_handover(Err(LinkError::RequestTimeout));
      }
   }

   /// Answers the requester and replays what was held back.
   fn finish_handover(&mut self, result: Result<HandoverReport>) {
      if let Some(reply) = self.pending_handover.take() {
         let _ = reply.send(result);
      }
      let held = mem::take(&mut self.held);
      if !held.is_empty() {
         debug!("replaying {} held inputs", held.len());
      }
      for input in held {
         self.dispatch(input);
      }
   }
}
