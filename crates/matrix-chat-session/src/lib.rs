//! Session orchestration for the matrix chat service.
//!
//! Provides:
//! - `Session` - Lifecycle state of one connection
//! - `Registry` - Shared set of active sessions behind one lock
//! - `Hub` - Globally ordered broadcast to every active session

pub mod hub;
pub mod registry;
pub mod session;

pub use hub::{Hub, HubError, Outbound};
pub use registry::Registry;
pub use session::{Session, SessionState};
