//! Coordination of one two-phase-commit transaction view
//!
//! The monitor:
//! 1. Follows the coordinator's channel and opens a session on `init`
//! 2. Registers participants and opens their own channels
//! 3. Routes relayed `*_child` events to the participant they name
//! 4. Ticks every deadline tracker from a single interval

pub mod coordinator;
pub mod engine;
pub mod notify;
pub mod participant;
pub mod registry;
pub mod session;
pub mod status;

pub use coordinator::{CoordinatorSnapshot, CoordinatorStateMachine, EndpointResolver};
pub use engine::{ChannelSnapshot, Dashboard, DashboardSnapshot, MonitorEngine, SharedObserver};
pub use notify::{Entity, Notifier, StateChange, TrackerChange, TrackerKind};
pub use participant::{ParticipantSnapshot, ParticipantStateMachine};
pub use registry::ParticipantRegistry;
pub use session::TransactionSession;
pub use status::{CoordinatorStatus, Indicator, Indicators, OwnStatus, RelayedStatus};
