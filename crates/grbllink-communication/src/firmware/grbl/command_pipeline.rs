//! Outgoing command pipeline
//!
//! Every command is classified by its leading G/M code or single letter token
//! and passed through the hook registered for that class at two points: right
//! before it is written (`Sending`) and right after it left the local buffer
//! (`Sent`). Sending hooks rewrite feedrate and intensity tokens; sent hooks
//! request state transitions.

use crate::firmware::override_manager::FeedIntensityOverrides;
use grbllink_core::MachineState;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

static COMMAND_REGEX: OnceLock<Regex> = OnceLock::new();

fn command_regex() -> &'static Regex {
    COMMAND_REGEX
        .get_or_init(|| Regex::new(r"^\s*\$?([GM]\d+|[THFSX])").expect("invalid regex pattern"))
}

/// Point in a command's life at which hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the command is written
    Sending,
    /// After the command was written
    Sent,
}

/// Class of an outgoing command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Leading token such as `G1`, `M3`, `F`, `H`
    Code(String),
    /// Feed hold
    Hold,
    /// Cycle start
    Resume,
}

impl CommandClass {
    /// Classify a command, `None` when it has no recognizable token
    pub fn of(command: &str) -> Option<Self> {
        match command {
            "!" => Some(Self::Hold),
            "~" => Some(Self::Resume),
            _ => command_regex()
                .captures(command)
                .and_then(|caps| caps.get(1))
                .map(|m| Self::Code(m.as_str().to_string())),
        }
    }

    fn code(code: &str) -> Self {
        Self::Code(code.to_string())
    }
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{}", code),
            Self::Hold => write!(f, "Hold"),
            Self::Resume => write!(f, "Resume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    RewriteFeedAndIntensity,
    ObserveFeedrate,
    ObserveIntensity,
    EnterState(MachineState),
}

/// Result of running a command through one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    /// The command, possibly rewritten
    pub command: String,
    /// State the controller should enter
    pub transition: Option<MachineState>,
}

/// Hook table plus the overrides the hooks operate on
#[derive(Debug)]
pub struct CommandPipeline {
    hooks: HashMap<(CommandClass, Phase), Hook>,
    overrides: FeedIntensityOverrides,
}

impl CommandPipeline {
    /// Build the pipeline with the laser hook table
    pub fn new(overrides: FeedIntensityOverrides) -> Self {
        let mut hooks = HashMap::new();
        for code in ["G1", "G2", "G3", "M3", "G01", "G02", "G03", "M03"] {
            hooks.insert(
                (CommandClass::code(code), Phase::Sending),
                Hook::RewriteFeedAndIntensity,
            );
        }
        hooks.insert((CommandClass::code("F"), Phase::Sending), Hook::ObserveFeedrate);
        hooks.insert((CommandClass::code("S"), Phase::Sending), Hook::ObserveIntensity);
        hooks.insert(
            (CommandClass::code("H"), Phase::Sent),
            Hook::EnterState(MachineState::Homing),
        );
        hooks.insert(
            (CommandClass::Hold, Phase::Sent),
            Hook::EnterState(MachineState::Paused),
        );
        hooks.insert(
            (CommandClass::Resume, Phase::Sent),
            Hook::EnterState(MachineState::Printing),
        );

        Self { hooks, overrides }
    }

    /// Run a command through the hook registered for its class
    pub fn apply(&mut self, phase: Phase, command: &str) -> PhaseOutcome {
        let hook = CommandClass::of(command).and_then(|class| self.hooks.get(&(class, phase)).copied());

        let mut outcome = PhaseOutcome {
            command: command.to_string(),
            transition: None,
        };
        match hook {
            Some(Hook::RewriteFeedAndIntensity) => {
                let rewritten = self.overrides.rewrite_feedrate(command);
                outcome.command = self.overrides.rewrite_intensity(&rewritten);
            }
            Some(Hook::ObserveFeedrate) => self.overrides.observe_feedrate(command),
            Some(Hook::ObserveIntensity) => self.overrides.observe_intensity(command),
            Some(Hook::EnterState(state)) => outcome.transition = Some(state),
            None => {}
        }
        outcome
    }

    /// Overrides the hooks apply
    pub fn overrides(&self) -> &FeedIntensityOverrides {
        &self.overrides
    }

    /// Mutable access to the overrides
    pub fn overrides_mut(&mut self) -> &mut FeedIntensityOverrides {
        &mut self.overrides
    }
}
