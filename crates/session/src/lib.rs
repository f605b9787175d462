//! Top-level coordination: the per-node session state machine, the command
//! sequencer that drives interrogation retries, and the config
//! broadcaster.

pub mod broadcast;
pub mod manager;
pub mod sequencer;
pub mod statelog;
pub mod states;

pub use broadcast::ConfigBroadcaster;
pub use manager::{SessionConfig, SessionManager};
pub use sequencer::CommandSequencer;
pub use statelog::StateLog;
pub use states::SessionState;
