//! GRBL Controller
//!
//! [`GrblController`] owns one connection to a GRBL laser controller. It
//! opens the transport, runs the reader, writer and status poller threads,
//! streams print jobs under the flow-control ledger and keeps the firmware
//! settings in line with the machine profile.
//!
//! The threads share a single [`Shared`] block. The reader only appends
//! acknowledgments, status and settings; the writer is the only consumer of
//! the command queue. Observer callbacks never run while a lock is held.

use super::command_pipeline::{CommandPipeline, Phase};
use super::error_decoder::AlarmInfo;
use super::meta_commands::{MetaCommand, HELP};
use super::rx_stats::RxBufferStats;
use super::settings::{GrblSettingsTable, SettingsSynchronizer, SettingsVerification};
use super::state_machine::StateMachine;
use super::status_parser::StatusParser;
use super::tracker::PositionTracker;
use super::FirmwareInfo;
use crate::communication::wake::DEFAULT_MAX_SIGNALS;
use crate::communication::{
    CommandQueue, ConnectionParams, FlowControlLedger, QueuedCommand, RealTimeCommand,
    RealTimeFlags, SerialTransportFactory, Transport, TransportFactory, TransportWriter,
    WakeSignal, DEFAULT_BAUD_RATE,
};
use crate::firmware::flasher::{
    resolve_image, AvrdudeFlasher, FirmwareFlasher, FlashMode, FlashRequest,
};
use crate::firmware::override_manager::FeedIntensityOverrides;
use crate::job::{process_gcode_line, PrintJob};
use grbllink_core::{
    CommListener, ConnectionError, ControllerError, Error, FirmwareError, JobEvent, JobProgress,
    LaserAnalytics, MachineState, NoOpListener, PauseOracle, Position, Result, RunState,
};
use grbllink_settings::{CommConfig, MachineProfile};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Log target for wire traffic
pub(super) const SERIAL_TARGET: &str = "grbllink::serial";

/// Lines kept for terminal dumps
const TERMINAL_HISTORY: usize = 100;

/// Time between hold and reset when cancelling
const CANCEL_HOLD_DELAY: Duration = Duration::from_millis(500);

/// Time the programmer gets to claim or release the port
const FLASH_PORT_SETTLE: Duration = Duration::from_secs(1);

static EEPROM_WRITE_REGEX: OnceLock<Regex> = OnceLock::new();

fn eeprom_write_regex() -> &'static Regex {
    EEPROM_WRITE_REGEX
        .get_or_init(|| Regex::new(r"^\$[0-9]+=.+$").expect("invalid regex pattern"))
}

/// Result of offering a line to the flow-control ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Recorded in the ledger and written
    Written,
    /// Does not fit right now, try again after the next acknowledgment
    Deferred,
    /// Can never fit the receive buffer
    Rejected,
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Written => write!(f, "written"),
            Self::Deferred => write!(f, "deferred"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// State shared by the controller handle and its threads
pub(super) struct Shared {
    pub(super) config: CommConfig,
    pub(super) profile: RwLock<MachineProfile>,
    pub(super) listener: Arc<dyn CommListener>,
    pub(super) analytics: Option<Arc<dyn LaserAnalytics>>,
    pub(super) pause_oracle: Option<Arc<dyn PauseOracle>>,
    pub(super) factory: Arc<dyn TransportFactory>,
    pub(super) flasher: Arc<dyn FirmwareFlasher>,

    pub(super) machine: Mutex<StateMachine>,
    /// Reading half, locked by the reader for the length of one read
    pub(super) reader_port: Mutex<Option<Box<dyn Transport>>>,
    /// Writing half; lock before `reader_port` when taking both
    pub(super) writer_port: Mutex<Option<Box<dyn TransportWriter>>>,
    pub(super) params: Mutex<Option<ConnectionParams>>,
    /// Bumped on every open and close
    pub(super) session: AtomicU64,

    pub(super) queue: CommandQueue,
    pub(super) realtime: RealTimeFlags,
    pub(super) wake: WakeSignal,
    pub(super) ledger: Mutex<FlowControlLedger>,
    pub(super) current: Mutex<Option<QueuedCommand>>,
    /// Bumped on every queue reset so the writer can tell its command is stale
    pub(super) epoch: AtomicU64,
    pub(super) sync_poll_pending: AtomicBool,

    pub(super) pipeline: Mutex<CommandPipeline>,
    pub(super) tracker: Mutex<PositionTracker>,
    pub(super) status_parser: RwLock<StatusParser>,
    pub(super) firmware: RwLock<FirmwareInfo>,
    pub(super) settings: Mutex<GrblSettingsTable>,
    pub(super) synchronizer: SettingsSynchronizer,

    pub(super) job: Mutex<Option<PrintJob>>,
    pub(super) passes: AtomicU32,
    pub(super) rx_stats: Mutex<RxBufferStats>,
    pub(super) corrupted: Mutex<Vec<String>>,
    pub(super) terminal: Mutex<VecDeque<String>>,
    pub(super) next_poll: Mutex<Instant>,

    pub(super) reading: AtomicBool,
    pub(super) writing: AtomicBool,
    pub(super) polling: AtomicBool,
    pub(super) threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(super) fn state(&self) -> MachineState {
        self.machine.lock().state()
    }

    /// Transition and notify; a no-op when already in `new`
    pub(super) fn change_state(&self, new: MachineState) {
        let changed = self.machine.lock().transition(new);
        if let Some((old, new)) = changed {
            self.listener.on_state_changed(old, new);
        }
    }

    pub(super) fn set_error(&self, message: impl Into<String>) {
        self.machine.lock().set_last_error(message);
    }

    /// Update the last error and notify the observer
    pub(super) fn report_error(&self, message: &str) {
        error!("{}", message);
        self.set_error(message);
        self.listener.on_error(message);
    }

    /// Operator-facing message
    pub(super) fn log_operator(&self, message: &str) {
        info!("{}", message);
        self.listener.on_log(message);
    }

    pub(super) fn enqueue(&self, command: QueuedCommand) {
        self.queue.push(command);
        self.wake.set();
    }

    pub(super) fn enqueue_all(&self, commands: impl IntoIterator<Item = QueuedCommand>) {
        self.queue.extend(commands);
        self.wake.set();
    }

    /// Forget everything waiting for or owed by the firmware
    pub(super) fn reset_pipeline(&self, clear_wake: bool) {
        let dropped = self.queue.clear();
        *self.current.lock() = None;
        self.ledger.lock().clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sync_poll_pending.store(false, Ordering::SeqCst);
        if clear_wake {
            self.wake.clear_all();
        }
        if dropped > 0 {
            debug!("Dropped {} queued commands", dropped);
        }
    }

    pub(super) fn record_terminal(&self, line: String) {
        let mut terminal = self.terminal.lock();
        if terminal.len() >= TERMINAL_HISTORY {
            terminal.pop_front();
        }
        terminal.push_back(line);
    }

    /// Log the recent wire traffic
    pub(super) fn dump_terminal(&self) {
        let lines: Vec<String> = self.terminal.lock().iter().cloned().collect();
        warn!("Terminal dump ({} lines):", lines.len());
        for line in lines {
            warn!(target: SERIAL_TARGET, "{}", line);
        }
    }

    pub(super) fn write_raw(&self, data: &[u8]) -> io::Result<()> {
        match self.writer_port.lock().as_mut() {
            Some(port) => port.write_all(data),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port not open",
            )),
        }
    }

    pub(super) fn write_line(&self, line: &str) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_raw(&data)?;
        debug!(target: SERIAL_TARGET, "Send: {}", line);
        self.record_terminal(format!("Send: {}", line));
        Ok(())
    }

    /// Send a real-time byte and run its "sent" hook
    pub(super) fn write_realtime(&self, command: RealTimeCommand) -> io::Result<()> {
        self.write_raw(&[command.byte()])?;
        if command == RealTimeCommand::SoftReset {
            self.tracker.lock().set_run_state(RunState::Unknown);
        }
        if command != RealTimeCommand::StatusReport {
            debug!(target: SERIAL_TARGET, "Send: {}", command);
            self.record_terminal(format!("Send: {}", command));
        }
        let outcome = self
            .pipeline
            .lock()
            .apply(Phase::Sent, &command.to_string());
        if let Some(target) = outcome.transition {
            self.apply_transition(target);
        }
        Ok(())
    }

    /// Transition requested by a "sent" hook
    pub(super) fn apply_transition(&self, target: MachineState) {
        let state = self.state();
        let allowed = match target {
            MachineState::Paused => state.is_printing(),
            MachineState::Printing => state.is_paused(),
            _ => true,
        };
        if allowed {
            self.change_state(target);
        }
    }

    pub(super) fn reset_poll_timer(&self) {
        let interval = self.machine.lock().poll_interval_secs();
        *self.next_poll.lock() = Instant::now() + Duration::from_secs_f64(interval);
    }

    pub(super) fn print_time_secs(&self) -> f64 {
        self.job
            .lock()
            .as_ref()
            .map_or(0.0, |job| job.print_time_secs(Instant::now()))
    }

    pub(super) fn log_rx_stats(&self) {
        let report = self.rx_stats.lock().report(self.print_time_secs());
        info!("{}", report);
    }

    fn job_id(&self) -> Option<Uuid> {
        self.job.lock().as_ref().map(PrintJob::id)
    }

    /// Give up on a running job
    pub(super) fn abort_job(&self, reason: &str) {
        let job_id = {
            let mut job = self.job.lock();
            job.as_mut().map(|job| {
                job.close();
                job.id()
            })
        };
        if let Some(job_id) = job_id {
            self.listener.on_job_event(&JobEvent::Failed {
                job_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Handle an alarm, reported by the firmware or raised locally
    pub(super) fn raise_alarm(&self, alarm: AlarmInfo) {
        if alarm.notify {
            self.report_error(&alarm.message);
        } else {
            warn!("{}", alarm.message);
            self.set_error(alarm.message.as_str());
            self.listener.on_log(&alarm.message);
        }
        if alarm.dump_terminal {
            self.dump_terminal();
        }

        let was_printing = {
            let state = self.state();
            state.is_printing() || state.is_paused()
        };
        self.reset_pipeline(true);
        self.change_state(MachineState::Locked);
        if was_printing {
            self.abort_job(&alarm.message);
        }
        self.reopen_transport();
    }

    /// Open a transport and clone its writing handle
    fn open_ports(
        &self,
        params: &ConnectionParams,
    ) -> Result<(Box<dyn Transport>, Box<dyn TransportWriter>)> {
        let transport = self.factory.open(params)?;
        let writer = transport.try_clone_writer()?;
        Ok((transport, writer))
    }

    /// Close and reopen the serial handle with the last parameters.
    ///
    /// Both halves stay locked until the new port is attached, so writes
    /// issued meanwhile wait for it instead of failing.
    fn reopen_transport(&self) {
        let Some(params) = self.params.lock().clone() else {
            return;
        };
        info!("Reopening serial port {}", params.port);
        let reopened = {
            let mut writer = self.writer_port.lock();
            let mut reader = self.reader_port.lock();
            *writer = None;
            *reader = None;
            self.open_ports(&params).map(|(transport, handle)| {
                *reader = Some(transport);
                *writer = Some(handle);
            })
        };
        if let Err(e) = reopened {
            self.fail_transport(e);
        }
    }

    /// Unrecoverable transport fault
    pub(super) fn fail_transport(&self, cause: impl fmt::Display) {
        let message = format!("Unexpected error on serial port: {}", cause);
        self.report_error(&message);
        self.close(true, None);
    }

    /// Stop all threads and drop the transport
    pub(super) fn close(&self, is_error: bool, next_state: Option<MachineState>) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.reading.store(false, Ordering::SeqCst);
        self.writing.store(false, Ordering::SeqCst);
        self.polling.store(false, Ordering::SeqCst);
        self.machine.lock().set_poll_interval(0.0);
        self.wake.set();

        let was_printing = {
            let state = self.state();
            state.is_printing() || state.is_paused()
        };

        drop(self.writer_port.lock().take());
        let transport = self.reader_port.lock().take();
        if let Some(transport) = transport {
            let target = if is_error {
                MachineState::ClosedWithError
            } else {
                next_state.unwrap_or(MachineState::Closed)
            };
            debug!("Closing {}", transport.name());
            drop(transport);
            self.change_state(target);
        }
        self.ledger.lock().clear();
        *self.current.lock() = None;

        if was_printing {
            self.abort_job("connection closed");
        } else if let Some(job) = self.job.lock().as_mut() {
            job.close();
        }

        self.join_threads();
    }

    fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("A controller thread panicked");
            }
        }
    }

    pub(super) fn spawn(self: &Arc<Self>, name: &str, body: fn(&Arc<Shared>)) -> Result<()> {
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&shared))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Start the writer unless it already runs
    pub(super) fn start_writer(self: &Arc<Self>) {
        if self.writing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.spawn("grbl-writer", Shared::writer_loop) {
            self.writing.store(false, Ordering::SeqCst);
            self.fail_transport(e);
        }
    }

    /// Open the transport and start reader and poller
    fn open_connection(self: &Arc<Self>) -> Result<()> {
        let settings = &self.config.connection;
        let port = if settings.wants_port_detection() {
            self.change_state(MachineState::DetectingPort);
            match self.factory.detect_port() {
                Some(port) => {
                    info!("Detected serial port {}", port);
                    port
                }
                None => {
                    self.report_error("Failed to autodetect serial port, please set it manually.");
                    self.change_state(MachineState::ClosedWithError);
                    return Err(ConnectionError::NoPortFound.into());
                }
            }
        } else {
            settings.port.clone()
        };
        let baud_rate = if settings.baud_rate == 0 {
            DEFAULT_BAUD_RATE
        } else {
            settings.baud_rate
        };
        let params = ConnectionParams::new(port, baud_rate)
            .with_read_timeout(settings.read_timeout())
            .with_parity_handshake(settings.parity_handshake);

        let auto_update = self.profile.read().grbl.auto_update_file.clone();
        if let Some(file) = auto_update {
            info!("GRBL auto-update with {}", file);
            if let Err(e) = self.run_flasher(&params, Some(&file), FlashMode::Write) {
                warn!("GRBL auto-update failed: {}", e);
            }
        }

        self.change_state(MachineState::OpeningPort);
        let (transport, writer) = match self.open_ports(&params) {
            Ok(ports) => ports,
            Err(e) => {
                self.report_error(&format!("Connection error: {}", e));
                self.change_state(MachineState::ClosedWithError);
                return Err(e);
            }
        };
        info!("Connected to {} at {} baud", params.port, params.baud_rate);
        *self.writer_port.lock() = Some(writer);
        *self.reader_port.lock() = Some(transport);
        *self.params.lock() = Some(params);
        self.session.fetch_add(1, Ordering::SeqCst);

        *self.firmware.write() = FirmwareInfo::default();
        self.settings.lock().clear();
        self.reset_pipeline(true);
        self.realtime.clear();
        self.corrupted.lock().clear();
        self.change_state(MachineState::Connecting);

        if settings.reset_on_connect {
            self.write_realtime(RealTimeCommand::SoftReset)?;
        }

        self.reading.store(true, Ordering::SeqCst);
        self.polling.store(true, Ordering::SeqCst);
        self.spawn("grbl-reader", Shared::reader_loop)?;
        self.spawn("grbl-poller", Shared::poller_loop)?;
        Ok(())
    }

    /// Run the programmer against `params.port`
    fn run_flasher(
        &self,
        params: &ConnectionParams,
        file: Option<&str>,
        mode: FlashMode,
    ) -> Result<()> {
        let version = self.firmware.read().version.clone();
        let image = resolve_image(&self.config.firmware.directory, file, version.as_deref())
            .map_err(|e| {
                warn!("{} GRBL: {}", mode, e);
                e
            })?;

        self.log_operator(&format!("{} GRBL with {}", mode, image.display()));
        let outcome = self.flasher.flash(&FlashRequest {
            image,
            port: params.port.clone(),
            baud_rate: params.baud_rate,
            mode,
        })?;

        if !outcome.success() && mode == FlashMode::Write {
            error!("avrdude output:\n{}", outcome.output);
            self.set_error(format!("avrdude returncode: {}", outcome.code));
            self.change_state(MachineState::ClosedWithError);
            return Err(FirmwareError::FlashFailed {
                code: outcome.code,
                output: outcome.output,
            }
            .into());
        }

        match mode {
            FlashMode::Write => self.log_operator("Flashing GRBL successful"),
            FlashMode::Verify if outcome.success() => self.log_operator("GRBL verify: OK"),
            FlashMode::Verify => {
                warn!("avrdude output:\n{}", outcome.output);
                self.log_operator("GRBL verify: FAILED");
            }
        }
        Ok(())
    }

    /// Request `$$` and verify the result in the background
    pub(super) fn correct_settings(self: &Arc<Self>, retries: u32, retry: bool) {
        let now = Instant::now();
        if retry {
            self.synchronizer.begin_retry(now);
        } else if !self.synchronizer.try_begin(now) {
            warn!(
                "Settings correction requested again within {:?}, ignoring",
                self.synchronizer.config().read_window()
            );
            return;
        }

        self.settings.lock().clear();
        self.enqueue(QueuedCommand::line("$$"));

        let shared = Arc::clone(self);
        let session = self.session.load(Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("grbl-settings".to_string())
            .spawn(move || shared.verify_settings(retries, session));
        if let Err(e) = spawned {
            warn!("Unable to schedule settings verification: {}", e);
        }
    }

    /// Whether the connection that `session` was taken from is still open
    fn in_session(&self, session: u64) -> bool {
        self.reading.load(Ordering::SeqCst) && self.session.load(Ordering::SeqCst) == session
    }

    fn verify_settings(self: &Arc<Self>, retries: u32, session: u64) {
        let (expected, settings_count) = {
            let profile = self.profile.read();
            (profile.expected_settings(), profile.grbl.settings_count)
        };
        let expected = match expected {
            Ok(expected) => expected,
            Err(e) => {
                warn!("Invalid expected settings in machine profile: {}", e);
                return;
            }
        };

        let target = settings_count.max(expected.len());
        if !self
            .synchronizer
            .wait_for_table(target, || self.settings.lock().len())
        {
            warn!("Settings table incomplete after the read window");
        }
        if !self.in_session(session) {
            debug!("Connection closed during settings verification");
            return;
        }

        let verification =
            SettingsVerification::compare(&self.settings.lock(), &expected, settings_count);
        if !verification.count_matches() {
            error!(
                "GRBL Settings count mismatch: {} settings, expected {}",
                verification.actual_count, verification.expected_count
            );
        }

        if verification.is_ok() {
            self.log_operator("GRBL Settings - Verification: OK");
            self.synchronizer.record(verification);
            return;
        }

        warn!(
            "GRBL Settings - Verification: FAILED, {} setting(s) to correct",
            verification.mismatches.len()
        );
        for (id, value) in &verification.mismatches {
            let actual = self.settings.lock().get(*id).map(|entry| entry.value);
            match actual {
                Some(actual) => warn!("${} is {}, expected {}", id, actual, value),
                None => warn!("${} missing, expected {}", id, value),
            }
        }
        self.enqueue_all(verification.corrective_commands());
        let mismatches = verification.mismatches.len();
        self.synchronizer.record(verification);

        if retries > 0 {
            thread::sleep(self.synchronizer.config().retry_backoff());
            if self.in_session(session) {
                self.correct_settings(retries - 1, true);
            } else {
                debug!("Connection changed during settings back-off, retry dropped");
            }
        } else {
            let failure = FirmwareError::SettingsVerificationFailed { mismatches };
            self.report_error(&format!("{}, no retries left", failure));
        }
    }

    /// Pause or resume the job; see [`GrblController::set_pause`]
    pub(super) fn set_pause(&self, pause: bool, send_cmd: bool, trigger: Option<&str>, force: bool) {
        let state = self.state();
        let now = Instant::now();

        let resume = !pause && (state.is_paused() || force);
        let hold = pause && (state.is_printing() || force);
        if !resume && !hold {
            return;
        }

        let job_id = {
            let mut job = self.job.lock();
            let Some(job) = job.as_mut() else {
                return;
            };
            if resume {
                job.end_pause(now);
            } else {
                job.begin_pause(now);
            }
            job.id()
        };
        self.tracker.lock().mark_pause_request(now);
        let trigger = trigger.map(str::to_string);

        if resume {
            info!("Resuming job (trigger: {:?})", trigger);
            if send_cmd {
                self.realtime.request(RealTimeCommand::CycleStart);
            } else {
                self.change_state(MachineState::Printing);
            }
            self.wake.set();
            self.listener
                .on_job_event(&JobEvent::Resumed { job_id, trigger });
        } else {
            info!("Pausing job (trigger: {:?})", trigger);
            if send_cmd {
                self.realtime.request(RealTimeCommand::FeedHold);
            } else {
                self.change_state(MachineState::Paused);
            }
            self.wake.set();
            self.listener
                .on_job_event(&JobEvent::Paused { job_id, trigger });
            self.log_rx_stats();
        }
    }

    /// All passes are read and acknowledged
    pub(super) fn finish_job(&self) {
        let now = Instant::now();
        let finished = {
            let mut job = self.job.lock();
            job.as_mut().map(|job| {
                job.close();
                (job.id(), job.print_time_secs(now))
            })
        };
        let Some((job_id, print_time_secs)) = finished else {
            return;
        };

        info!("Job done after {:.1}s", print_time_secs);
        self.listener.on_print_job_done();
        self.change_state(MachineState::Operational);

        let (x, y) = self.profile.read().home_position();
        self.enqueue_all([
            QueuedCommand::line("M5"),
            QueuedCommand::line(format!("G0X{}Y{}", x, y)),
            QueuedCommand::line("M9"),
        ]);
        self.listener.on_job_event(&JobEvent::Done {
            job_id,
            print_time_secs,
        });
        let report = self.rx_stats.lock().report(print_time_secs);
        info!("{}", report);
    }
}

/// Handle to a GRBL connection
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct GrblController {
    shared: Arc<Shared>,
}

impl fmt::Debug for GrblController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrblController")
            .field("state", &self.state())
            .finish()
    }
}

impl GrblController {
    /// Start building a controller
    pub fn builder(config: CommConfig) -> GrblControllerBuilder {
        GrblControllerBuilder::new(config)
    }

    /// Open the port and wait for the firmware in the background.
    ///
    /// Returns once the port is open; the state becomes `Locked` when the
    /// startup banner arrives.
    pub fn connect(&self) -> Result<()> {
        let state = self.state();
        if state.is_connecting() || state.is_operational() || state == MachineState::Locked {
            return Err(ControllerError::Busy {
                state: state.to_string(),
            }
            .into());
        }
        self.shared.machine.lock().set_poll_interval(0.0);
        if let Err(e) = self.shared.open_connection() {
            self.shared.close(true, None);
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// `next_state` replaces `Closed` as the final state unless `is_error`.
    pub fn close(&self, is_error: bool, next_state: Option<MachineState>) {
        info!("Closing connection");
        self.shared.close(is_error, next_state);
    }

    /// Handle one operator line: a meta-command, a real-time byte or G-code
    pub fn send_command(&self, command: &str) -> Result<()> {
        let trimmed = command.trim();
        if MetaCommand::is_meta(trimmed) {
            return self.run_meta(MetaCommand::parse(trimmed));
        }
        if let Some(realtime) = RealTimeCommand::from_command(trimmed) {
            self.shared.realtime.request(realtime);
            self.shared.wake.set();
            return Ok(());
        }
        let Some(line) = process_gcode_line(command) else {
            return Ok(());
        };
        if self.state().is_printing() && eeprom_write_regex().is_match(&line) {
            warn!("Configuration changes during print are not allowed: {}", line);
            self.shared
                .listener
                .on_log("Configuration changes during print are not allowed!");
        }
        self.shared.enqueue(QueuedCommand::from_line(line));
        Ok(())
    }

    /// Queue a FLUSH barrier: later commands wait until every written line
    /// was acknowledged
    pub fn flush(&self) {
        self.shared.enqueue(QueuedCommand::Flush);
    }

    /// Queue a SYNC barrier: later commands wait until every written line
    /// was acknowledged and the firmware stopped moving
    pub fn sync(&self) {
        self.shared.enqueue(QueuedCommand::Sync);
    }

    fn run_meta(&self, meta: MetaCommand) -> Result<()> {
        debug!("Meta-command {}", meta);
        match meta {
            MetaCommand::ToggleStatusReport => {
                let enabled = self.shared.machine.lock().toggle_status_reports();
                self.shared.log_operator(&format!(
                    "Status reports {}",
                    if enabled { "enabled" } else { "disabled" }
                ));
            }
            MetaCommand::SetStatusFrequency(secs) => self.set_status_frequency(secs),
            MetaCommand::Feedrate(percent) => self.set_feedrate_override(percent),
            MetaCommand::Intensity(percent) => self.set_intensity_override(percent),
            MetaCommand::Disconnect => self.close(false, None),
            MetaCommand::Reset => {
                self.shared.log_operator("Reset initiated");
                self.shared.write_realtime(RealTimeCommand::SoftReset)?;
            }
            MetaCommand::CorrectSettings => self.correct_settings(),
            MetaCommand::VerifyGrbl(file) => self.flash_grbl(file.as_deref(), FlashMode::Verify)?,
            MetaCommand::FlashGrbl(file) => self.flash_grbl(file.as_deref(), FlashMode::Write)?,
            MetaCommand::Invalid { command, reason } => {
                return Err(ControllerError::InvalidCommand { command, reason }.into());
            }
            MetaCommand::Unknown(line) => {
                self.shared
                    .log_operator(&format!("Command not found: {}", line));
                self.shared
                    .log_operator(&format!("Available commands: {}", HELP.join(", ")));
            }
        }
        Ok(())
    }

    /// Offer one line directly to the flow-control ledger, bypassing the queue.
    ///
    /// A rejected line raises the command-too-long alarm.
    pub fn try_write(&self, command: &str) -> Result<WriteOutcome> {
        if self.shared.writer_port.lock().is_none() {
            return Err(ControllerError::NotConnected.into());
        }
        Ok(self.shared.write_command(command)?)
    }

    /// Select the job file
    pub fn select_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_not_busy()?;
        let job = PrintJob::new(path)?;
        let selected = job.selected_file();
        info!("Selected {} ({} bytes)", selected.name, selected.size);
        *self.shared.job.lock() = Some(job);
        self.shared.listener.on_file_selected(Some(&selected));
        Ok(())
    }

    /// Drop the job file
    pub fn unselect_file(&self) -> Result<()> {
        self.ensure_not_busy()?;
        *self.shared.job.lock() = None;
        self.shared.listener.on_file_selected(None);
        Ok(())
    }

    fn ensure_not_busy(&self) -> Result<()> {
        let state = self.state();
        if state.is_printing() || state.is_paused() {
            return Err(ControllerError::Busy {
                state: state.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Stream the selected file
    pub fn start_print(&self) -> Result<()> {
        let state = self.state();
        if state != MachineState::Operational {
            return Err(ControllerError::NotOperational {
                state: state.to_string(),
            }
            .into());
        }

        self.shared.pipeline.lock().overrides_mut().reset();
        let supported = self.shared.firmware.read().reports_rx_buffer;
        self.shared.rx_stats.lock().reset(supported);

        let started = {
            let mut job = self.shared.job.lock();
            let Some(job) = job.as_mut() else {
                return Err(ControllerError::NoFileSelected.into());
            };
            job.set_passes(self.shared.passes.load(Ordering::SeqCst));
            job.start().map(|()| (job.id(), job.name().to_string()))
        };

        self.shared.enqueue(QueuedCommand::line("M08"));
        match started {
            Ok((job_id, file)) => {
                info!("Starting job {} ({})", job_id, file);
                self.shared.change_state(MachineState::Printing);
                self.shared
                    .listener
                    .on_job_event(&JobEvent::Started { job_id, file });
                self.shared.wake.set();
                Ok(())
            }
            Err(e) => {
                self.shared.report_error(&format!("Error starting print: {}", e));
                self.shared.change_state(MachineState::Error);
                Err(e.into())
            }
        }
    }

    /// Stop the job: hold, wait for the machine to stop, then reset
    pub fn cancel_print(&self) -> Result<()> {
        let state = self.state();
        if !state.is_operational() {
            return Err(ControllerError::NotOperational {
                state: state.to_string(),
            }
            .into());
        }

        let shared = &self.shared;
        shared.write_realtime(RealTimeCommand::FeedHold)?;
        thread::sleep(CANCEL_HOLD_DELAY);
        shared.queue.clear();
        *shared.current.lock() = None;
        shared.write_realtime(RealTimeCommand::SoftReset)?;
        shared.reset_pipeline(true);
        shared.change_state(MachineState::Locked);

        let job_id = {
            let mut job = shared.job.lock();
            job.as_mut().map(|job| {
                job.close();
                job.id()
            })
        };
        if let Some(job_id) = job_id {
            info!("Job {} cancelled", job_id);
            shared.listener.on_job_event(&JobEvent::Cancelled { job_id });
        }
        shared.log_rx_stats();
        Ok(())
    }

    /// Pause or resume the running job.
    ///
    /// With `send_cmd` the hold or resume byte goes to the firmware and the
    /// state follows once it is sent; without it the firmware already did it
    /// and the state changes right away. `force` skips the state check.
    pub fn set_pause(&self, pause: bool, send_cmd: bool, trigger: Option<&str>, force: bool) {
        self.shared.set_pause(pause, send_cmd, trigger, force);
    }

    /// Passes the next job runs
    pub fn passes(&self) -> u32 {
        self.shared.passes.load(Ordering::SeqCst)
    }

    /// Set the number of passes, at least one
    pub fn set_passes(&self, passes: u32) {
        let passes = passes.max(1);
        self.shared.passes.store(passes, Ordering::SeqCst);
        if let Some(job) = self.shared.job.lock().as_mut() {
            job.set_passes(passes);
        }
        debug!("Passes set to {}", passes);
    }

    /// One more pass
    pub fn increase_passes(&self) {
        self.set_passes(self.passes().saturating_add(1));
    }

    /// One pass less, never below one
    pub fn decrease_passes(&self) {
        self.set_passes(self.passes().saturating_sub(1));
    }

    /// Run the homing cycle
    pub fn home(&self) {
        self.shared.enqueue(QueuedCommand::line("$H"));
    }

    /// Move the head off the limit switches.
    ///
    /// Returns whether a rescue move was queued.
    pub fn rescue_from_home_pos(&self) -> Result<bool> {
        let firmware = self.shared.firmware.read().clone();
        if firmware.version.is_none() {
            warn!("GRBL version unknown, not rescuing from home position");
            return Ok(false);
        }
        if !firmware.rescue_from_home {
            info!("GRBL {:?} cannot rescue from home position", firmware.version);
            return Ok(false);
        }

        if !self.shared.tracker.lock().limits_known() {
            self.shared.realtime.request(RealTimeCommand::StatusReport);
            self.shared.wake.set();
            for _ in 0..200 {
                if self.shared.tracker.lock().limits_known() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        let (limit_x, limit_y) = {
            let tracker = self.shared.tracker.lock();
            if !tracker.in_home_position() {
                return Ok(false);
            }
            tracker.limits()
        };
        info!("Rescue from home position, limits x={} y={}", limit_x, limit_y);
        let step = |hit: bool| if hit { -5 } else { 0 };
        self.shared.enqueue_all([
            QueuedCommand::line("$X"),
            QueuedCommand::Flush,
            QueuedCommand::line("G91"),
            QueuedCommand::line(format!(
                "G1X{}Y{}F500S0",
                step(limit_x),
                step(limit_y)
            )),
            QueuedCommand::line("G90"),
            QueuedCommand::Flush,
        ]);
        Ok(true)
    }

    /// Verify the firmware settings and correct mismatches
    pub fn correct_settings(&self) {
        let retries = self.shared.config.settings_sync.retries;
        self.shared.correct_settings(retries, false);
    }

    /// Write or verify a firmware image, reconnecting afterwards
    pub fn flash_grbl(&self, file: Option<&str>, mode: FlashMode) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            MachineState::Flashing | MachineState::Printing | MachineState::Paused
        ) {
            let reason = format!("{} GRBL not possible in current printer state", mode);
            warn!("{}", reason);
            return Err(FirmwareError::FlashRefused { reason }.into());
        }

        let params = self.shared.params.lock().clone().ok_or_else(|| {
            Error::from(FirmwareError::FlashRefused {
                reason: "no serial port known".to_string(),
            })
        })?;
        let version = self.shared.firmware.read().version.clone();
        resolve_image(&self.shared.config.firmware.directory, file, version.as_deref())?;

        let connected = self.shared.writer_port.lock().is_some();
        if connected {
            self.shared.close(false, Some(MachineState::Flashing));
            thread::sleep(FLASH_PORT_SETTLE);
        }

        self.shared.run_flasher(&params, file, mode)?;

        thread::sleep(FLASH_PORT_SETTLE);
        self.connect()
    }

    /// Set the feedrate override in percent
    pub fn set_feedrate_override(&self, percent: f64) {
        let command = self
            .shared
            .pipeline
            .lock()
            .overrides_mut()
            .set_feedrate_override(percent);
        info!("Feedrate override {}%", percent);
        if let Some(command) = command {
            self.shared.enqueue(QueuedCommand::line(command));
        }
    }

    /// Set the intensity override in percent
    pub fn set_intensity_override(&self, percent: f64) {
        let command = self
            .shared
            .pipeline
            .lock()
            .overrides_mut()
            .set_intensity_override(percent);
        info!("Intensity override {}%", percent);
        if let Some(command) = command {
            self.shared.enqueue(QueuedCommand::line(command));
        }
    }

    /// Switch periodic status polling on or off
    pub fn toggle_status_report(&self) -> bool {
        self.shared.machine.lock().toggle_status_reports()
    }

    /// Set the status poll interval in seconds
    pub fn set_status_frequency(&self, secs: f64) {
        self.shared.machine.lock().set_poll_interval(secs);
        self.shared.reset_poll_timer();
    }

    /// Current state
    pub fn state(&self) -> MachineState {
        self.shared.state()
    }

    /// State name, with the last error in error states
    pub fn state_string(&self) -> String {
        self.shared.machine.lock().state_string()
    }

    /// Last error message
    pub fn last_error(&self) -> Option<String> {
        self.shared.machine.lock().last_error().map(str::to_string)
    }

    /// Machine position from the latest status report
    pub fn machine_position(&self) -> Position {
        self.shared.tracker.lock().machine_position()
    }

    /// Firmware run-state from the latest status report
    pub fn run_state(&self) -> RunState {
        self.shared.tracker.lock().run_state().clone()
    }

    /// Work position, refined by acknowledged moves
    pub fn work_position(&self) -> Position {
        self.shared.tracker.lock().work_position()
    }

    /// Progress of the selected job
    pub fn progress(&self) -> Option<JobProgress> {
        self.shared
            .job
            .lock()
            .as_ref()
            .map(|job| job.progress(Instant::now()))
    }

    /// Seconds printed, without pauses
    pub fn print_time_secs(&self) -> f64 {
        self.shared.print_time_secs()
    }

    /// Firmware version from the startup banner
    pub fn firmware_version(&self) -> Option<String> {
        self.shared.firmware.read().version.clone()
    }

    /// Features of the connected firmware
    pub fn firmware_info(&self) -> FirmwareInfo {
        self.shared.firmware.read().clone()
    }

    /// Copy of the settings table
    pub fn settings(&self) -> GrblSettingsTable {
        self.shared.settings.lock().clone()
    }

    /// Outcome of the latest settings verification
    pub fn last_settings_verification(&self) -> Option<SettingsVerification> {
        self.shared.synchronizer.last_result()
    }

    /// Machine profile, including auto-update flags cleared at runtime
    pub fn profile(&self) -> MachineProfile {
        self.shared.profile.read().clone()
    }

    /// Bytes sent but not yet acknowledged
    pub fn outstanding_bytes(&self) -> usize {
        self.shared.ledger.lock().outstanding_bytes()
    }

    /// Commands waiting in the queue
    pub fn queued_commands(&self) -> usize {
        self.shared.queue.len()
    }

    /// Receive buffer report for the current job
    pub fn rx_stats_report(&self) -> String {
        self.shared
            .rx_stats
            .lock()
            .report(self.shared.print_time_secs())
    }

    /// Selected job id
    pub fn job_id(&self) -> Option<Uuid> {
        self.shared.job_id()
    }
}

/// Builder for [`GrblController`]
pub struct GrblControllerBuilder {
    config: CommConfig,
    profile: MachineProfile,
    listener: Arc<dyn CommListener>,
    analytics: Option<Arc<dyn LaserAnalytics>>,
    pause_oracle: Option<Arc<dyn PauseOracle>>,
    factory: Option<Arc<dyn TransportFactory>>,
    flasher: Option<Arc<dyn FirmwareFlasher>>,
}

impl GrblControllerBuilder {
    /// Builder with defaults: serial transport, avrdude, no observer
    pub fn new(config: CommConfig) -> Self {
        Self {
            config,
            profile: MachineProfile::default(),
            listener: Arc::new(NoOpListener),
            analytics: None,
            pause_oracle: None,
            factory: None,
            flasher: None,
        }
    }

    /// Machine profile with expected settings and home position
    pub fn profile(mut self, profile: MachineProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Observer for state, position and job events
    pub fn listener(mut self, listener: Arc<dyn CommListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Receiver of laser intensity samples
    pub fn analytics(mut self, analytics: Arc<dyn LaserAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Oracle deciding whether a firmware hold was intended
    pub fn pause_oracle(mut self, oracle: Arc<dyn PauseOracle>) -> Self {
        self.pause_oracle = Some(oracle);
        self
    }

    /// Transport factory, serial by default
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Firmware flasher, avrdude by default
    pub fn flasher(mut self, flasher: Arc<dyn FirmwareFlasher>) -> Self {
        self.flasher = Some(flasher);
        self
    }

    /// Build the controller; nothing is opened yet
    pub fn build(self) -> GrblController {
        let Self {
            config,
            profile,
            listener,
            analytics,
            pause_oracle,
            factory,
            flasher,
        } = self;

        let overrides = FeedIntensityOverrides::new(config.overrides, profile.laser.intensity_limit);
        let shared = Shared {
            machine: Mutex::new(StateMachine::new(config.status_poll)),
            reader_port: Mutex::new(None),
            writer_port: Mutex::new(None),
            params: Mutex::new(None),
            session: AtomicU64::new(0),
            queue: CommandQueue::new(),
            realtime: RealTimeFlags::new(),
            wake: WakeSignal::new(DEFAULT_MAX_SIGNALS),
            ledger: Mutex::new(FlowControlLedger::new(config.flow.working_buffer_size())),
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
            sync_poll_pending: AtomicBool::new(false),
            pipeline: Mutex::new(CommandPipeline::new(overrides)),
            tracker: Mutex::new(PositionTracker::new()),
            status_parser: RwLock::new(StatusParser::new()),
            firmware: RwLock::new(FirmwareInfo::default()),
            settings: Mutex::new(GrblSettingsTable::new()),
            synchronizer: SettingsSynchronizer::new(config.settings_sync),
            job: Mutex::new(None),
            passes: AtomicU32::new(1),
            rx_stats: Mutex::new(RxBufferStats::new()),
            corrupted: Mutex::new(Vec::new()),
            terminal: Mutex::new(VecDeque::with_capacity(TERMINAL_HISTORY)),
            next_poll: Mutex::new(Instant::now()),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            factory: factory.unwrap_or_else(|| Arc::new(SerialTransportFactory)),
            flasher: flasher
                .unwrap_or_else(|| Arc::new(AvrdudeFlasher::new(config.firmware.clone()))),
            profile: RwLock::new(profile),
            listener,
            analytics,
            pause_oracle,
            config,
        };

        GrblController {
            shared: Arc::new(shared),
        }
    }
}
