//! Connection lifecycle: pure state transitions plus the per-connection task

pub mod actor;
pub mod state;

pub use actor::{Acknowledgement, ConnectionActor, ConnectionHandle};
pub use state::{apply, ClientState, InvalidTransition, LifecycleEvent};
