//! Radio links: the record table, the per-link state machine and the QoS
//! policy applied to them.

pub mod manager;
pub mod qos;
pub mod registry;
pub mod state;

pub use manager::{LinkAction, LinkEvent, LinkInternal, LinkManager};
pub use qos::{ConnParams, QosEngine, QosLevel};
pub use registry::{LinkImage, LinkRecord, Registry};
pub use state::{LinkLock, LinkState};
