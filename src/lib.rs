//! Link management core for a pair of true-wireless earbuds.
//!
//! Tracks every radio link and the handset sessions running over them,
//! keeps each earbud's view of the other in sync, and moves the primary
//! role between the two without dropping the handset.

pub mod address;
pub mod channel;
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handover;
pub mod link;
pub mod notify;
pub mod peer;
pub mod profile;
pub mod session;

pub use crate::{
   dispatcher::{Backends, Core},
   error::{LinkError, Result},
};
