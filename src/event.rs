//! Events delivered to clients of the link core.
//!
//! Clients are tasks holding the receiving end of an unbounded channel.
//! Link-level changes go out through the fan-out lists in
//! [`crate::notify`]; session requests are answered with a
//! [`SessionNotice`] sent to every client queued on the request.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
   address::{BdAddr, TypedAddress},
   controller::DisconnectReason,
   error::Status,
   link::qos::ConnParams,
};

/// Link connection changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
   Connected {
      addr: TypedAddress,
      incoming: bool,
   },
   Disconnected {
      addr: TypedAddress,
      reason: DisconnectReason,
   },
   /// A local disconnect was issued; the link is still up.
   DisconnectRequested { addr: TypedAddress },
   ParamsChanged {
      addr: TypedAddress,
      params: ConnParams,
   },
}

impl ConnectionEvent {
   pub const fn addr(&self) -> &TypedAddress {
      match self {
         Self::Connected { addr, .. }
         | Self::Disconnected { addr, .. }
         | Self::DisconnectRequested { addr }
         | Self::ParamsChanged { addr, .. } => addr,
      }
   }
}

/// Whether handsets can currently page us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectableChanged {
   pub connectable: bool,
}

/// Completions for handset session requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionNotice {
   ConnectCfm { addr: BdAddr, status: Status },
   DisconnectCfm { addr: BdAddr, status: Status },
   StopCfm { addr: BdAddr, status: Status },
}

impl SessionNotice {
   pub const fn status(&self) -> Status {
      match self {
         Self::ConnectCfm { status, .. }
         | Self::DisconnectCfm { status, .. }
         | Self::StopCfm { status, .. } => *status,
      }
   }
}

/// Sending half a client hands over to receive events.
pub type Subscriber<T> = mpsc::UnboundedSender<T>;

/// Handle of a client waiting on a session request.
pub type Client = Subscriber<SessionNotice>;
