//! Two-phase-commit transaction monitor
//!
//! Follows a coordinator's server-sent event stream, discovers the
//! participants it registers, follows their own streams, and keeps the
//! status, deadlines and audit log of every entity current.

pub mod api;
pub mod channel;
pub mod config;
pub mod coordination;
pub mod deadline;
pub mod error;
pub mod events;
pub mod metrics;

pub use config::Settings;
pub use coordination::MonitorEngine;
pub use error::{MonitorError, MonitorResult};
