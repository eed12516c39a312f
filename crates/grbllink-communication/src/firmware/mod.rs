//! Firmware support
//!
//! The GRBL protocol implementation, the feedrate and intensity overrides
//! applied to outgoing commands and the firmware image flasher.

pub mod flasher;
pub mod grbl;
pub mod override_manager;

pub use flasher::{AvrdudeFlasher, FirmwareFlasher, FlashMode, FlashOutcome, FlashRequest};
pub use override_manager::FeedIntensityOverrides;
