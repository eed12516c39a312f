//! Firmware image flashing
//!
//! Flashing shells out to an AVR programmer. [`FirmwareFlasher`] is the seam
//! the controller calls; [`AvrdudeFlasher`] runs `avrdude` and tests plug in
//! their own implementation.

use grbllink_core::{Error, FirmwareError, Result};
use grbllink_settings::FirmwareSettings;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Write a new image or compare the installed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    /// Write the image
    Write,
    /// Verify the installed image against the file
    Verify,
}

impl FlashMode {
    fn memory_op(self) -> char {
        match self {
            Self::Write => 'w',
            Self::Verify => 'v',
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "flashing"),
            Self::Verify => write!(f, "verifying"),
        }
    }
}

/// Everything the programmer needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Intel hex image
    pub image: PathBuf,
    /// Serial port of the controller
    pub port: String,
    /// Baud rate of the bootloader
    pub baud_rate: u32,
    /// Write or verify
    pub mode: FlashMode,
}

/// Result of a programmer run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOutcome {
    /// Process exit code
    pub code: i32,
    /// Combined output of the programmer
    pub output: String,
}

impl FlashOutcome {
    /// Whether the programmer exited with 0
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs the external programmer
pub trait FirmwareFlasher: Send + Sync {
    /// Run the programmer for a request
    fn flash(&self, request: &FlashRequest) -> Result<FlashOutcome>;
}

/// Default image name for an installed firmware version
pub fn default_image_name(version: Option<&str>) -> Option<String> {
    version.map(|v| format!("grbl_{}.hex", v))
}

/// Resolve the image file inside the firmware directory
pub fn resolve_image(
    directory: &Path,
    file: Option<&str>,
    version: Option<&str>,
) -> std::result::Result<PathBuf, FirmwareError> {
    let name = file
        .map(str::to_string)
        .or_else(|| default_image_name(version))
        .ok_or_else(|| FirmwareError::FlashRefused {
            reason: format!(
                "no default filename for installed version '{}'",
                version.unwrap_or("unknown")
            ),
        })?;

    if name.starts_with("..") || name.starts_with('/') {
        return Err(FirmwareError::FlashRefused {
            reason: format!("invalid filename '{}'", name),
        });
    }

    let path = directory.join(&name);
    if !path.is_file() {
        return Err(FirmwareError::FlashRefused {
            reason: format!("file '{}' not found", name),
        });
    }
    Ok(path)
}

/// `avrdude` based flasher
#[derive(Debug, Clone)]
pub struct AvrdudeFlasher {
    settings: FirmwareSettings,
}

impl AvrdudeFlasher {
    /// Create a flasher with programmer settings
    pub fn new(settings: FirmwareSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the programmer
    pub fn args(&self, request: &FlashRequest) -> Vec<String> {
        vec![
            format!("-p{}", self.settings.part),
            format!("-c{}", self.settings.protocol),
            format!("-b{}", request.baud_rate),
            format!("-P{}", request.port),
            "-u".to_string(),
            "-q".to_string(),
            format!(
                "-Uflash:{}:{}:i",
                request.mode.memory_op(),
                request.image.display()
            ),
        ]
    }
}

impl FirmwareFlasher for AvrdudeFlasher {
    fn flash(&self, request: &FlashRequest) -> Result<FlashOutcome> {
        let args = self.args(request);
        debug!("{} {}", self.settings.programmer, args.join(" "));

        let output = Command::new(&self.settings.programmer)
            .args(&args)
            .output()
            .map_err(|e| {
                Error::from(FirmwareError::FlashRefused {
                    reason: format!("cannot run {}: {}", self.settings.programmer, e),
                })
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text
            .replace("strace: |autoreset: Broken pipe\n", "")
            .replace("done with autoreset\n", "");

        Ok(FlashOutcome {
            code: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}
