//! Observer interfaces and event distribution

pub mod event;
pub mod listener;

pub use event::{BroadcastListener, CommEvent, EventDispatcher, JobEvent};
pub use listener::{CommListener, LaserAnalytics, NoOpListener, PauseOracle};
