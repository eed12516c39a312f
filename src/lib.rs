//! # grbllink
//!
//! Serial communication manager for GRBL driven laser cutters.
//!
//! ## Architecture
//!
//! grbllink is organized as a workspace with multiple crates:
//!
//! 1. **grbllink-core** - Machine state, errors, observer traits, events
//! 2. **grbllink-settings** - Communication configuration and machine profiles
//! 3. **grbllink-communication** - Serial transport, flow control, GRBL controller
//! 4. **grbllink** - Operator console binary that integrates all crates
//!
//! ## Features
//!
//! - **Flow Control**: Receive-buffer accounting with FIFO acknowledgments
//! - **Job Streaming**: Multi-pass jobs with pause, resume and cancel
//! - **Settings Sync**: `$$` verification against the machine profile with corrections
//! - **Firmware Flashing**: avrdude based write and verify, auto-update on connect

pub use grbllink_communication::{
    list_ports, ConnectionParams, FirmwareInfo, FlashMode, GrblController, GrblControllerBuilder,
    PrintJob, WriteOutcome,
};

pub use grbllink_core::{
    BroadcastListener, CommEvent, CommListener, ConnectionError, ControllerError, Error,
    EventDispatcher, FirmwareError, JobError, JobEvent, MachineState, Position, Result,
};

pub use grbllink_settings::{CommConfig, MachineProfile};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Sets up structured logging with:
/// - RUST_LOG environment variable support, `info` by default
/// - Target, thread and line information on every record
/// - JSON records instead of the pretty format when `json` is set
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
            .pretty();
        registry.with(fmt_layer).try_init()?;
    }

    Ok(())
}
