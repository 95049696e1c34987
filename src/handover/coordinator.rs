//! Veto, transfer and commit over the registered participants.

use log::{debug, info, warn};

use crate::{
   error::{LinkError, Result},
   handover::{
      ComponentId, HandoverMessage, HandoverParticipant, MarshalData, MarshalType, Role,
      Unmarshalled,
   },
};

/// A participant and the state types it hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
   pub component: ComponentId,
   pub types: &'static [MarshalType],
}

/// Gives the coordinator access to the participants it iterates.
pub trait ParticipantSet {
   fn participant(&mut self, id: ComponentId) -> Option<&mut dyn HandoverParticipant>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverReport {
   pub attempt: u32,
   pub transferred: usize,
   /// Role this device now holds.
   pub role: Role,
}

#[derive(Debug, Default)]
pub struct HandoverCoordinator {
   registrations: Vec<Registration>,
   attempt: u32,
   awaiting_ack: Option<u32>,
}

impl HandoverCoordinator {
   pub fn new() -> Self {
      Self::default()
   }

   /// Links, QoS, sessions, peer state.
   pub fn with_default_participants() -> Self {
      let mut coordinator = Self::new();
      coordinator.register(ComponentId::Links, &[MarshalType::LinkRecords]);
      coordinator.register(ComponentId::Qos, &[]);
      coordinator.register(ComponentId::Sessions, &[MarshalType::HandsetSession]);
      coordinator.register(ComponentId::PeerState, &[MarshalType::PeerState]);
      coordinator
   }

   pub fn register(&mut self, component: ComponentId, types: &'static [MarshalType]) {
      if self.registrations.iter().any(|r| r.component == component) {
         warn!("{component} registered twice for handover, ignoring");
         return;
      }
      debug!("handover participant {component} types {types:?}");
      self.registrations.push(Registration { component, types });
   }

   pub fn registrations(&self) -> &[Registration] {
      &self.registrations
   }

   pub fn is_busy(&self) -> bool {
      self.awaiting_ack.is_some()
   }

   pub fn awaiting_ack(&self) -> Option<u32> {
      self.awaiting_ack
   }

   fn lookup<'a>(
      set: &'a mut dyn ParticipantSet,
      component: ComponentId,
   ) -> Result<&'a mut dyn HandoverParticipant> {
      set.participant(component)
         .ok_or_else(|| LinkError::HandoverFailed(format!("{component} not available")))
   }

   /// Asks every participant in registration order; the first veto wins.
   pub fn veto(&self, set: &mut dyn ParticipantSet) -> Result<()> {
      for reg in &self.registrations {
         if Self::lookup(set, reg.component)?.veto() {
            info!("Handover vetoed by {}", reg.component);
            return Err(LinkError::HandoverVetoed(reg.component.name()));
         }
      }
      Ok(())
   }

   pub fn marshal(&self, set: &mut dyn ParticipantSet) -> Result<Vec<MarshalData>> {
      let mut items = Vec::new();
      for reg in &self.registrations {
         let participant = Self::lookup(set, reg.component)?;
         for &ty in reg.types {
            if let Some(data) = participant.marshal(ty) {
               debug!("marshalled {ty} from {}", reg.component);
               items.push(data);
            }
         }
      }
      Ok(items)
   }

   /// Hands every item to the participant registered for its type.
   ///
   /// Stops at the first failure. Items already unmarshalled by earlier
   /// participants stay applied.
   pub fn unmarshal(
      &self,
      set: &mut dyn ParticipantSet,
      items: Vec<MarshalData>,
   ) -> Result<usize> {
      let mut count = 0;
      for item in items {
         let ty = item.ty;
         let reg = self
            .registrations
            .iter()
            .find(|r| r.types.contains(&ty))
            .ok_or_else(|| LinkError::HandoverFailed(format!("no participant for {ty}")))?;
         match Self::lookup(set, reg.component)?.unmarshal(item) {
            Unmarshalled::Failed(e) => {
               warn!("Unmarshal of {ty} by {} failed: {e}", reg.component);
               return Err(LinkError::HandoverFailed(format!("{}: {e}", reg.component)));
            },
            Unmarshalled::Copied(data) => drop(data),
            Unmarshalled::Adopted => {},
         }
         count += 1;
      }
      Ok(count)
   }

   /// Every participant commits exactly once.
   pub fn commit(&self, set: &mut dyn ParticipantSet, role: Role) -> Result<()> {
      for reg in &self.registrations {
         Self::lookup(set, reg.component)?.commit(role);
      }
      info!("Handover committed, now {role}");
      Ok(())
   }

   /// Moves the primary role from `src` to `dst` with both sides in
   /// reach, with nothing else running in between.
   pub fn run_local(
      &mut self,
      src: &mut dyn ParticipantSet,
      dst: &mut dyn ParticipantSet,
   ) -> Result<HandoverReport> {
      if self.is_busy() {
         return Err(LinkError::HandoverBusy);
      }
      self.veto(src)?;
      self.veto(dst)?;
      self.attempt += 1;
      let items = self.marshal(src)?;
      let transferred = self.unmarshal(dst, items)?;
      self.commit(dst, Role::Primary)?;
      self.commit(src, Role::Secondary)?;
      Ok(HandoverReport {
         attempt: self.attempt,
         transferred,
         role: Role::Secondary,
      })
   }

   /// Source side: veto and marshal, then wait for the ack.
   pub fn begin(&mut self, set: &mut dyn ParticipantSet) -> Result<HandoverMessage> {
      if self.is_busy() {
         return Err(LinkError::HandoverBusy);
      }
      self.veto(set)?;
      let items = self.marshal(set)?;
      self.attempt += 1;
      self.awaiting_ack = Some(self.attempt);
      info!(
         "Handover attempt {} started, {} items",
         self.attempt,
         items.len()
      );
      Ok(HandoverMessage::Transfer {
         attempt: self.attempt,
         items,
      })
   }

   /// Destination side: veto, unmarshal and, when that succeeds, commit
   /// as primary. Returns the ack to send back.
   pub fn receive(
      &mut self,
      set: &mut dyn ParticipantSet,
      attempt: u32,
      items: Vec<MarshalData>,
   ) -> (HandoverMessage, Result<HandoverReport>) {
      let outcome = self
         .veto(set)
         .and_then(|()| self.unmarshal(set, items))
         .and_then(|transferred| {
            self.commit(set, Role::Primary)?;
            Ok(HandoverReport {
               attempt,
               transferred,
               role: Role::Primary,
            })
         });
      let ack = HandoverMessage::Ack {
         attempt,
         accepted: outcome.is_ok(),
      };
      (ack, outcome)
   }

   /// Source side: the destination answered.
   pub fn on_ack(
      &mut self,
      set: &mut dyn ParticipantSet,
      attempt: u32,
      accepted: bool,
   ) -> Result<HandoverReport> {
      if self.awaiting_ack != Some(attempt) {
         warn!("Stale handover ack for attempt {attempt}");
         return Err(LinkError::HandoverFailed(format!("unexpected ack {attempt}")));
      }
      self.awaiting_ack = None;
      if !accepted {
         return Err(LinkError::HandoverFailed("peer rejected transfer".into()));
      }
      self.commit(set, Role::Secondary)?;
      Ok(HandoverReport {
         attempt,
         transferred: 0,
         role: Role::Secondary,
      })
   }

   /// Gives up on `attempt` without committing. Returns `false` if it
   /// was not outstanding.
   pub fn abort(&mut self, attempt: u32) -> bool {
      if self.awaiting_ack == Some(attempt) {
         warn!("Handover attempt {attempt} aborted");
         self.awaiting_ack = None;
         true
      } else {
         false
      }
   }
}

#[cfg(test)]
mod tests {
   use std::collections::HashMap;

   use super::*;

   #[derive(Debug, Default)]
   struct Fake {
      veto: bool,
      value: Option<u32>,
      fail_unmarshal: bool,
      commits: Vec<Role>,
   }

   impl HandoverParticipant for Fake {
      fn veto(&self) -> bool {
         self.veto
      }

      fn marshal(&mut self, ty: MarshalType) -> Option<MarshalData> {
         self.value.and_then(|v| MarshalData::encode(ty, &v))
      }

      fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled {
         if self.fail_unmarshal {
            return Unmarshalled::Failed("refused".into());
         }
         self.value = data.decode().ok();
         Unmarshalled::Copied(data)
      }

      fn commit(&mut self, role: Role) {
         self.commits.push(role);
      }
   }

   #[derive(Debug, Default)]
   struct Side(HashMap<ComponentId, Fake>);

   impl Side {
      fn new() -> Self {
         Self(
            [
               ComponentId::Links,
               ComponentId::Qos,
               ComponentId::Sessions,
               ComponentId::PeerState,
            ]
            .into_iter()
            .map(|id| (id, Fake::default()))
            .collect(),
         )
      }

      fn get(&mut self, id: ComponentId) -> &mut Fake {
         self.0.get_mut(&id).unwrap()
      }
   }

   impl ParticipantSet for Side {
      fn participant(&mut self, id: ComponentId) -> Option<&mut dyn HandoverParticipant> {
         self.0.get_mut(&id).map(|p| p as &mut dyn HandoverParticipant)
      }
   }

   #[test]
   fn test_veto_aborts_without_commit() {
      let mut coordinator = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      src.get(ComponentId::Links).value = Some(1);
      src.get(ComponentId::Sessions).veto = true;

      let err = coordinator.run_local(&mut src, &mut dst).unwrap_err();
      assert!(matches!(err, LinkError::HandoverVetoed("sessions")));
      for side in [&mut src, &mut dst] {
         for fake in side.0.values() {
            assert!(fake.commits.is_empty());
         }
      }
      assert_eq!(src.get(ComponentId::Links).value, Some(1));
      assert_eq!(dst.get(ComponentId::Links).value, None);
   }

   #[test]
   fn test_transfer_and_commit_each_once() {
      let mut coordinator = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      src.get(ComponentId::Links).value = Some(7);
      src.get(ComponentId::Sessions).value = Some(3);

      let report = coordinator.run_local(&mut src, &mut dst).unwrap();
      assert_eq!(report.transferred, 2);
      assert_eq!(dst.get(ComponentId::Links).value, Some(7));
      assert_eq!(dst.get(ComponentId::Sessions).value, Some(3));
      for (id, fake) in &dst.0 {
         assert_eq!(fake.commits, [Role::Primary], "{id}");
      }
      for (id, fake) in &src.0 {
         assert_eq!(fake.commits, [Role::Secondary], "{id}");
      }
   }

   #[test]
   fn test_commit_runs_with_nothing_transferred() {
      let mut coordinator = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      let report = coordinator.run_local(&mut src, &mut dst).unwrap();
      assert_eq!(report.transferred, 0);
      assert_eq!(dst.get(ComponentId::Qos).commits, [Role::Primary]);
      assert_eq!(src.get(ComponentId::Qos).commits, [Role::Secondary]);
   }

   #[test]
   fn test_failed_unmarshal_commits_nothing() {
      let mut coordinator = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      src.get(ComponentId::Links).value = Some(1);
      src.get(ComponentId::Sessions).value = Some(2);
      dst.get(ComponentId::Sessions).fail_unmarshal = true;

      assert!(coordinator.run_local(&mut src, &mut dst).is_err());
      // Earlier participants keep what they unmarshalled.
      assert_eq!(dst.get(ComponentId::Links).value, Some(1));
      assert!(dst.0.values().all(|f| f.commits.is_empty()));
      assert!(src.0.values().all(|f| f.commits.is_empty()));
   }

   #[test]
   fn test_two_device_flow() {
      let mut source = HandoverCoordinator::with_default_participants();
      let mut destination = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      src.get(ComponentId::PeerState).value = Some(5);

      let HandoverMessage::Transfer { attempt, items } = source.begin(&mut src).unwrap() else {
         panic!("expected transfer");
      };
      assert!(source.is_busy());
      assert!(matches!(source.begin(&mut src), Err(LinkError::HandoverBusy)));

      let (ack, report) = destination.receive(&mut dst, attempt, items);
      assert_eq!(report.unwrap().role, Role::Primary);
      let HandoverMessage::Ack { attempt, accepted } = ack else {
         panic!("expected ack");
      };
      assert!(accepted);

      let report = source.on_ack(&mut src, attempt, accepted).unwrap();
      assert_eq!(report.role, Role::Secondary);
      assert!(!source.is_busy());
      assert_eq!(src.get(ComponentId::PeerState).commits, [Role::Secondary]);
      assert_eq!(dst.get(ComponentId::PeerState).value, Some(5));
   }

   #[test]
   fn test_destination_veto_rejects_transfer() {
      let mut source = HandoverCoordinator::with_default_participants();
      let mut destination = HandoverCoordinator::with_default_participants();
      let (mut src, mut dst) = (Side::new(), Side::new());
      src.get(ComponentId::Sessions).value = Some(4);
      dst.get(ComponentId::Links).veto = true;

      let HandoverMessage::Transfer { attempt, items } = source.begin(&mut src).unwrap() else {
         panic!("expected transfer");
      };
      let (ack, report) = destination.receive(&mut dst, attempt, items);
      assert!(matches!(report, Err(LinkError::HandoverVetoed("links"))));
      assert_eq!(ack, HandoverMessage::Ack { attempt, accepted: false });
      assert_eq!(dst.get(ComponentId::Sessions).value, None);
      assert!(dst.0.values().all(|f| f.commits.is_empty()));

      assert!(source.on_ack(&mut src, attempt, false).is_err());
      assert!(src.0.values().all(|f| f.commits.is_empty()));
   }

   #[test]
   fn test_abort_drops_late_ack() {
      let mut source = HandoverCoordinator::with_default_participants();
      let mut src = Side::new();
      let HandoverMessage::Transfer { attempt, .. } = source.begin(&mut src).unwrap() else {
         panic!("expected transfer");
      };
      assert!(source.abort(attempt));
      assert!(source.on_ack(&mut src, attempt, true).is_err());
      assert!(src.0.values().all(|f| f.commits.is_empty()));
   }
}
