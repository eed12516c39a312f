//! Event system for communication manager notifications
//!
//! Provides:
//! - Job lifecycle events
//! - A serializable event type mirroring every observer call
//! - A broadcast dispatcher and a listener that republishes observer calls onto it

use crate::core::listener::CommListener;
use crate::data::{ConnectionInfo, JobProgress, Position, SelectedFile};
use crate::state::MachineState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Job lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Streaming started
    Started {
        /// Job identifier
        job_id: Uuid,
        /// File name
        file: String,
    },
    /// Job paused
    Paused {
        /// Job identifier
        job_id: Uuid,
        /// What caused the pause
        trigger: Option<String>,
    },
    /// Job resumed
    Resumed {
        /// Job identifier
        job_id: Uuid,
        /// What caused the resume
        trigger: Option<String>,
    },
    /// All passes acknowledged
    Done {
        /// Job identifier
        job_id: Uuid,
        /// Print time excluding pauses
        print_time_secs: f64,
    },
    /// Cancelled by the operator
    Cancelled {
        /// Job identifier
        job_id: Uuid,
    },
    /// Aborted by a disconnect
    Failed {
        /// Job identifier
        job_id: Uuid,
        /// Reason for the failure
        reason: String,
    },
}

impl JobEvent {
    /// Identifier of the job this event belongs to
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Started { job_id, .. }
            | Self::Paused { job_id, .. }
            | Self::Resumed { job_id, .. }
            | Self::Done { job_id, .. }
            | Self::Cancelled { job_id }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started { file, .. } => write!(f, "Print started: {}", file),
            Self::Paused { trigger, .. } => {
                write!(f, "Print paused ({})", trigger.as_deref().unwrap_or("operator"))
            }
            Self::Resumed { trigger, .. } => {
                write!(f, "Print resumed ({})", trigger.as_deref().unwrap_or("operator"))
            }
            Self::Done {
                print_time_secs, ..
            } => write!(f, "Print done after {:.1}s", print_time_secs),
            Self::Cancelled { .. } => write!(f, "Print cancelled"),
            Self::Failed { reason, .. } => write!(f, "Print failed: {}", reason),
        }
    }
}

/// Communication events, one per observer call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommEvent {
    /// State transition
    StateChanged {
        /// Previous state
        old: MachineState,
        /// New state
        new: MachineState,
    },
    /// Position update
    PositionUpdated {
        /// Machine position, if reported
        machine: Option<Position>,
        /// Work position
        work: Position,
    },
    /// Job progress
    Progress(JobProgress),
    /// File selection changed
    FileSelected(Option<SelectedFile>),
    /// Job finished
    PrintJobDone,
    /// Job lifecycle
    Job(JobEvent),
    /// Terminal traffic
    Log(String),
    /// Error message
    Error(String),
    /// Firmware banner received
    Connected(ConnectionInfo),
    /// Host should disconnect
    ForceDisconnect,
}

impl std::fmt::Display for CommEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommEvent::StateChanged { old, new } => write!(f, "State: {} -> {}", old, new),
            CommEvent::PositionUpdated { machine, work } => match machine {
                Some(machine) => write!(f, "Position - Machine: {}, Work: {}", machine, work),
                None => write!(f, "Position - Work: {}", work),
            },
            CommEvent::Progress(p) => write!(f, "Progress: {:.1}%", p.completion * 100.0),
            CommEvent::FileSelected(Some(file)) => {
                write!(f, "File selected: {} ({} bytes)", file.name, file.size)
            }
            CommEvent::FileSelected(None) => write!(f, "File unselected"),
            CommEvent::PrintJobDone => write!(f, "Print job done"),
            CommEvent::Job(event) => write!(f, "{}", event),
            CommEvent::Log(line) => write!(f, "{}", line),
            CommEvent::Error(msg) => write!(f, "Error: {}", msg),
            CommEvent::Connected(info) => write!(
                f,
                "Connected to {} @ {} (Grbl {})",
                info.port,
                info.baud_rate,
                info.firmware_version.as_deref().unwrap_or("unknown")
            ),
            CommEvent::ForceDisconnect => write!(f, "Forced disconnect"),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for communication events.
    tx: broadcast::Sender<CommEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<CommEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers; zero when nobody listens.
    pub fn publish(&self, event: CommEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Observer that republishes every call as a [`CommEvent`]
#[derive(Clone, Default)]
pub struct BroadcastListener {
    dispatcher: EventDispatcher,
}

impl BroadcastListener {
    /// Wrap a dispatcher
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self { dispatcher }
    }

    /// The dispatcher events are published on
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

impl CommListener for BroadcastListener {
    fn on_state_changed(&self, old: MachineState, new: MachineState) {
        self.dispatcher.publish(CommEvent::StateChanged { old, new });
    }

    fn on_position_updated(&self, machine: Option<Position>, work: Position) {
        self.dispatcher
            .publish(CommEvent::PositionUpdated { machine, work });
    }

    fn on_progress(&self, progress: &JobProgress) {
        self.dispatcher.publish(CommEvent::Progress(*progress));
    }

    fn on_file_selected(&self, file: Option<&SelectedFile>) {
        self.dispatcher
            .publish(CommEvent::FileSelected(file.cloned()));
    }

    fn on_print_job_done(&self) {
        self.dispatcher.publish(CommEvent::PrintJobDone);
    }

    fn on_job_event(&self, event: &JobEvent) {
        self.dispatcher.publish(CommEvent::Job(event.clone()));
    }

    fn on_log(&self, message: &str) {
        self.dispatcher.publish(CommEvent::Log(message.to_string()));
    }

    fn on_error(&self, message: &str) {
        self.dispatcher
            .publish(CommEvent::Error(message.to_string()));
    }

    fn on_connected(&self, info: &ConnectionInfo) {
        self.dispatcher.publish(CommEvent::Connected(info.clone()));
    }

    fn on_force_disconnect(&self) {
        self.dispatcher.publish(CommEvent::ForceDisconnect);
    }
}
