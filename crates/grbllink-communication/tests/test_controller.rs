mod common;

use common::{wait_until, MockFactory, MockFirmware, RecordingListener};
use grbllink_communication::firmware::{FlashOutcome, FlashRequest};
use grbllink_communication::{
    FirmwareFlasher, FlashMode, GrblController, RealTimeCommand, WriteOutcome,
};
use grbllink_core::{JobEvent, MachineState, Result, RunState};
use grbllink_settings::{CommConfig, MachineProfile, SettingValue};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> CommConfig {
    let mut config = CommConfig::default();
    config.connection.port = "/dev/ttyMOCK0".to_string();
    config.connection.baud_rate = 115_200;
    config.settings_sync.read_window_secs = 0.5;
    config.settings_sync.check_interval_secs = 0.02;
    config.settings_sync.retries = 1;
    config.settings_sync.retry_backoff_secs = 0.05;
    config.status_poll.printing = 0.1;
    config
}

struct Harness {
    controller: GrblController,
    firmware: MockFirmware,
    listener: Arc<RecordingListener>,
}

impl Harness {
    fn start(firmware: MockFirmware, profile: MachineProfile) -> Self {
        Self::start_with(firmware, profile, test_config())
    }

    fn start_with(firmware: MockFirmware, profile: MachineProfile, config: CommConfig) -> Self {
        let listener = Arc::new(RecordingListener::default());
        let controller = GrblController::builder(config)
            .profile(profile)
            .listener(listener.clone())
            .transport_factory(Arc::new(MockFactory::new(firmware.clone())))
            .build();
        controller.connect().unwrap();
        assert!(
            wait_until(TIMEOUT, || controller.state() == MachineState::Locked),
            "no banner, state {}",
            controller.state()
        );
        Self {
            controller,
            firmware,
            listener,
        }
    }

    fn unlock(&self) {
        self.controller.send_command("$X").unwrap();
        assert!(wait_until(TIMEOUT, || self.controller.state()
            == MachineState::Operational));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.controller.close(false, None);
    }
}

fn job_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_banner_locks_and_unlock_makes_operational() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    assert!(harness.listener.saw_state(MachineState::Connecting));

    let connected = harness.listener.connected.lock().clone();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].port, "/dev/ttyMOCK0");
    assert_eq!(
        connected[0].firmware_version.as_deref(),
        Some("0.9g_20180223_61638c5")
    );
    assert!(harness.controller.firmware_info().rescue_from_home);

    harness.unlock();
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"$X".to_string())));
}

#[test]
fn test_print_job_with_two_passes() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    let file = job_file("; laser job\nG0 X1\nG0 X2 ; move\nG0 X3\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.set_passes(2);
    harness.controller.start_print().unwrap();

    assert!(wait_until(TIMEOUT, || *harness.listener.jobs_done.lock() == 1));
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"M9".to_string())));
    assert_eq!(harness.controller.state(), MachineState::Operational);

    let lines = harness.firmware.lines();
    let start = lines.iter().position(|line| line == "M08").unwrap();
    assert_eq!(
        &lines[start..],
        &[
            "M08", "G0X1", "G0X2", "G0X3", "G0X1", "G0X2", "G0X3", "M5", "G0X500Y390", "M9"
        ]
    );

    let events = harness.listener.job_events.lock().clone();
    assert!(matches!(events.first(), Some(JobEvent::Started { .. })));
    assert!(matches!(events.last(), Some(JobEvent::Done { .. })));
    assert!(harness.listener.saw_state(MachineState::Printing));

    let progress = harness.listener.progress.lock().clone();
    assert!(progress.iter().any(|p| p.finished_passes == 1));
    assert!(progress.iter().all(|p| p.passes == 2));
}

#[test]
fn test_start_print_requires_operational() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    let file = job_file("G0X1\n");
    harness.controller.select_file(file.path()).unwrap();

    assert!(harness.controller.start_print().is_err());
    assert_eq!(harness.controller.state(), MachineState::Locked);
}

#[test]
fn test_passes_never_below_one() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.controller.set_passes(0);
    assert_eq!(harness.controller.passes(), 1);
    harness.controller.decrease_passes();
    assert_eq!(harness.controller.passes(), 1);
    harness.controller.increase_passes();
    assert_eq!(harness.controller.passes(), 2);
}

#[test]
fn test_settings_converge_after_one_correction() {
    let firmware = MockFirmware::new().with_settings(&[(0, "10"), (1, "25")]);
    let mut profile = MachineProfile::default();
    profile.set_expected_setting(22, SettingValue::Int(1));
    profile.set_expected_setting(23, SettingValue::Int(3));
    profile.set_expected_setting(110, SettingValue::Float(5000.0));

    let harness = Harness::start(firmware, profile);

    assert!(wait_until(TIMEOUT, || harness
        .controller
        .last_settings_verification()
        .is_some_and(|v| v.is_ok())));

    let writes: Vec<String> = harness
        .firmware
        .lines()
        .into_iter()
        .filter(|line| line.starts_with('$') && line.contains('='))
        .collect();
    assert_eq!(writes, vec!["$22=1", "$23=3", "$110=5000"]);
    assert_eq!(harness.firmware.setting(110).as_deref(), Some("5000"));
    assert_eq!(harness.controller.settings().len(), 5);
    assert!(harness
        .listener
        .logs
        .lock()
        .iter()
        .any(|log| log == "GRBL Settings - Verification: OK"));
}

#[test]
fn test_command_too_long_never_reaches_the_wire() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    let long = format!("G1X{}", "1".repeat(130));
    let outcome = harness.controller.try_write(&long).unwrap();
    assert_eq!(outcome, WriteOutcome::Rejected);

    assert_eq!(harness.controller.state(), MachineState::Locked);
    assert!(harness
        .controller
        .last_error()
        .is_some_and(|e| e.starts_with("Command too long")));
    assert!(!harness.firmware.lines().contains(&long));
    assert_eq!(harness.firmware.opens(), 2);
}

#[test]
fn test_error_locks_and_fails_job() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.firmware.set_auto_ok(false);
    let file = job_file("G0X1\nG0X2\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();
    assert!(wait_until(TIMEOUT, || harness
        .firmware
        .lines()
        .contains(&"G0X2".to_string())));

    harness.firmware.emit("error: Bad number format");
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Locked));
    assert_eq!(harness.controller.outstanding_bytes(), 0);
    assert!(harness
        .listener
        .errors
        .lock()
        .contains(&"GRBL Error: Bad number format".to_string()));
    assert!(wait_until(TIMEOUT, || harness
        .listener
        .job_events
        .lock()
        .iter()
        .any(|e| matches!(e, JobEvent::Failed { .. }))));
}

#[test]
fn test_eeprom_read_failure_is_ignored() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.firmware.emit("error: EEPROM read fail. Using defaults");
    harness.controller.send_command("G0X1").unwrap();
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    assert_eq!(harness.controller.state(), MachineState::Operational);
}

#[test]
fn test_cancel_holds_then_resets() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.firmware.set_auto_ok(false);
    let file = job_file("G0X1\nG0X2\nG0X3\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();
    assert!(wait_until(TIMEOUT, || harness
        .firmware
        .lines()
        .contains(&"G0X3".to_string())));

    harness.controller.cancel_print().unwrap();
    assert_eq!(harness.controller.outstanding_bytes(), 0);
    assert_eq!(harness.controller.queued_commands(), 0);

    let realtime = harness.firmware.realtime();
    let hold = realtime
        .iter()
        .position(|b| *b == RealTimeCommand::FeedHold.byte())
        .unwrap();
    let reset = realtime
        .iter()
        .position(|b| *b == RealTimeCommand::SoftReset.byte())
        .unwrap();
    assert!(hold < reset);

    assert!(harness
        .listener
        .job_events
        .lock()
        .iter()
        .any(|e| matches!(e, JobEvent::Cancelled { .. })));
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Locked));
}

#[test]
fn test_firmware_hold_pauses_and_run_resumes() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.firmware.set_auto_ok(false);
    let file = job_file("G0X1\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();

    harness.firmware.set_run_state("Queue");
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Paused));

    harness.firmware.set_run_state("Run");
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Printing));

    let events = harness.listener.job_events.lock().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Paused { trigger: Some(t), .. } if t == "grbl_state_queue"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Resumed { trigger: Some(t), .. } if t == "grbl_state_run"
    )));
}

#[test]
fn test_operator_pause_sends_feed_hold() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.firmware.set_auto_ok(false);
    let file = job_file("G0X1\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();

    harness.controller.set_pause(true, true, Some("button"), false);
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Paused));
    assert!(harness
        .firmware
        .realtime()
        .contains(&RealTimeCommand::FeedHold.byte()));

    harness.controller.set_pause(false, true, Some("button"), false);
    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::Printing));
    assert!(harness
        .firmware
        .realtime()
        .contains(&RealTimeCommand::CycleStart.byte()));
}

#[test]
fn test_rescue_from_home_position() {
    let firmware = MockFirmware::new();
    firmware.set_limits("x");
    let harness = Harness::start(firmware, MachineProfile::default());

    assert!(harness.controller.rescue_from_home_pos().unwrap());
    assert!(wait_until(TIMEOUT, || harness
        .firmware
        .lines()
        .contains(&"G90".to_string())));

    let lines = harness.firmware.lines();
    let start = lines.iter().position(|line| line == "$X").unwrap();
    assert_eq!(&lines[start..start + 4], &["$X", "G91", "G1X-5Y0F500S0", "G90"]);
}

#[test]
fn test_meta_commands() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());

    harness.controller.send_command("/foo").unwrap();
    assert!(harness
        .listener
        .logs
        .lock()
        .iter()
        .any(|log| log == "Command not found: /foo"));

    harness.controller.send_command("/disconnect").unwrap();
    assert_eq!(harness.controller.state(), MachineState::Closed);
}

#[test]
fn test_read_failure_closes_with_error() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.firmware.fail_reads();

    assert!(wait_until(TIMEOUT, || harness.controller.state()
        == MachineState::ClosedWithError));
    assert!(harness
        .controller
        .last_error()
        .is_some_and(|e| e.starts_with("Unexpected error on serial port")));
}

#[test]
fn test_connect_failure() {
    let listener = Arc::new(RecordingListener::default());
    let mut factory = MockFactory::new(MockFirmware::new());
    factory.fail_open = true;
    let controller = GrblController::builder(test_config())
        .listener(listener.clone())
        .transport_factory(Arc::new(factory))
        .build();

    assert!(controller.connect().is_err());
    assert_eq!(controller.state(), MachineState::ClosedWithError);
    assert!(listener
        .errors
        .lock()
        .iter()
        .any(|e| e.starts_with("Connection error")));
}

#[test]
fn test_silent_firmware_gets_soft_reset() {
    let firmware = MockFirmware::new().with_banner(None);
    let mut config = test_config();
    config.connection.connect_timeout_ms = 50;
    let listener = Arc::new(RecordingListener::default());
    let controller = GrblController::builder(config)
        .listener(listener)
        .transport_factory(Arc::new(MockFactory::new(firmware.clone())))
        .build();
    controller.connect().unwrap();

    assert!(wait_until(TIMEOUT, || firmware
        .realtime()
        .contains(&RealTimeCommand::SoftReset.byte())));
    assert_eq!(controller.state(), MachineState::Connecting);
    controller.close(false, None);
}

fn status_polls(firmware: &MockFirmware) -> usize {
    firmware
        .realtime()
        .iter()
        .filter(|&&byte| byte == RealTimeCommand::StatusReport.byte())
        .count()
}

/// Teach the controller that the firmware is moving
fn report_running(harness: &Harness) {
    harness.firmware.set_run_state("Run");
    harness.controller.send_command("?").unwrap();
    assert!(wait_until(TIMEOUT, || harness.controller.run_state() == RunState::Run));
}

#[test]
fn test_barrier_lines_never_reach_the_wire() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    harness.controller.send_command("FLUSH").unwrap();
    harness.controller.send_command("SYNC").unwrap();
    harness.controller.send_command("G0X1").unwrap();

    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    assert!(!harness
        .firmware
        .lines()
        .iter()
        .any(|line| line == "FLUSH" || line == "SYNC"));
}

#[test]
fn test_job_barriers_are_not_written() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();

    let file = job_file("G0 X1\nFLUSH\nG0 X2\nSYNC\nG0 X3\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();

    assert!(wait_until(TIMEOUT, || *harness.listener.jobs_done.lock() == 1));
    let lines = harness.firmware.lines();
    let start = lines.iter().position(|line| line == "M08").unwrap();
    assert_eq!(&lines[start..start + 4], &["M08", "G0X1", "G0X2", "G0X3"]);
}

#[test]
fn test_flush_on_drained_ledger_passes_through() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    assert!(wait_until(TIMEOUT, || harness.controller.outstanding_bytes() == 0));

    let before = harness.firmware.lines().len();
    harness.controller.flush();
    harness.controller.flush();
    harness.controller.send_command("G0X1").unwrap();

    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    assert_eq!(&harness.firmware.lines()[before..], &["G0X1"]);
}

#[test]
fn test_flush_waits_for_acknowledgments() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    harness.firmware.set_auto_ok(false);

    harness.controller.send_command("G0X1").unwrap();
    harness.controller.flush();
    harness.controller.send_command("G0X2").unwrap();

    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    thread::sleep(Duration::from_millis(300));
    assert!(!harness.firmware.lines().contains(&"G0X2".to_string()));

    harness.firmware.emit("ok");
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X2".to_string())));
}

#[test]
fn test_sync_waits_while_firmware_moves() {
    let mut config = test_config();
    config.status_poll.operational = 60.0;
    config.status_poll.syncing = 60.0;
    let harness = Harness::start_with(MockFirmware::new(), MachineProfile::default(), config);
    harness.unlock();
    report_running(&harness);

    harness.firmware.set_status_replies(false);
    let polls = status_polls(&harness.firmware);
    harness.controller.sync();
    harness.controller.send_command("G0X1").unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(!harness.firmware.lines().contains(&"G0X1".to_string()));
    assert_eq!(status_polls(&harness.firmware), polls + 1);

    harness.firmware.set_run_state("Idle");
    let status = harness.firmware.status_report();
    harness.firmware.emit(&status);
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    assert!(!harness.firmware.lines().contains(&"SYNC".to_string()));
}

#[test]
fn test_soft_reset_forgets_run_state() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    report_running(&harness);

    harness.firmware.set_status_replies(false);
    harness.controller.send_command("\u{18}").unwrap();
    assert!(wait_until(TIMEOUT, || harness.controller.run_state() == RunState::Unknown));
    assert!(wait_until(TIMEOUT, || harness.controller.state() == MachineState::Locked));

    harness.controller.sync();
    harness.controller.send_command("G0X1").unwrap();
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
}

#[test]
fn test_writes_do_not_wait_for_slow_reads() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    harness.firmware.set_read_delay(Duration::from_millis(300));
    thread::sleep(Duration::from_millis(50));

    let mut slowest = Duration::ZERO;
    for _ in 0..5 {
        let started = Instant::now();
        let outcome = harness.controller.try_write("G4P0").unwrap();
        slowest = slowest.max(started.elapsed());
        assert_eq!(outcome, WriteOutcome::Written);
        thread::sleep(Duration::from_millis(20));
    }
    assert!(
        slowest < Duration::from_millis(150),
        "write took {:?}",
        slowest
    );
}

#[test]
fn test_writes_during_alarm_reopen_wait_for_the_port() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    harness.firmware.set_open_delay(Duration::from_millis(300));

    harness.firmware.emit("ALARM: Hard/soft limit");
    assert!(wait_until(TIMEOUT, || harness.controller.state() == MachineState::Locked));
    harness.controller.send_command("?").unwrap();
    harness.controller.send_command("G0X1").unwrap();

    assert!(wait_until(TIMEOUT, || harness.firmware.opens() == 2));
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"G0X1".to_string())));
    assert_eq!(harness.controller.state(), MachineState::Locked);
    assert!(!harness.listener.saw_state(MachineState::ClosedWithError));
}

#[test]
fn test_settings_retry_dropped_after_reconnect() {
    let mut config = test_config();
    config.settings_sync.read_window_secs = 0.2;
    config.settings_sync.retry_backoff_secs = 1.0;
    let mut profile = MachineProfile::default();
    profile.set_expected_setting(22, SettingValue::Int(1));

    let started = Instant::now();
    let harness = Harness::start_with(MockFirmware::new(), profile, config);
    assert!(wait_until(TIMEOUT, || harness.firmware.lines().contains(&"$22=1".to_string())));

    let window = Duration::from_millis(350);
    thread::sleep(window.saturating_sub(started.elapsed()));
    harness.controller.close(false, None);
    let before = harness.firmware.lines().len();
    harness.controller.connect().unwrap();
    assert!(wait_until(TIMEOUT, || harness.controller.state() == MachineState::Locked));

    thread::sleep(Duration::from_millis(1500));
    let reads = harness.firmware.lines()[before..]
        .iter()
        .filter(|line| *line == "$$")
        .count();
    assert_eq!(reads, 1);
}

#[derive(Default)]
struct RecordingFlasher {
    requests: Mutex<Vec<FlashRequest>>,
    code: i32,
}

impl FirmwareFlasher for RecordingFlasher {
    fn flash(&self, request: &FlashRequest) -> Result<FlashOutcome> {
        self.requests.lock().push(request.clone());
        Ok(FlashOutcome {
            code: self.code,
            output: String::new(),
        })
    }
}

fn firmware_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("grbl_next.hex"), ":00000001FF\n").unwrap();
    dir
}

#[test]
fn test_flash_reconnects() {
    let dir = firmware_dir();
    let mut config = test_config();
    config.firmware.directory = dir.path().to_path_buf();
    let firmware = MockFirmware::new();
    let flasher = Arc::new(RecordingFlasher::default());
    let listener = Arc::new(RecordingListener::default());
    let controller = GrblController::builder(config)
        .listener(listener.clone())
        .transport_factory(Arc::new(MockFactory::new(firmware.clone())))
        .flasher(flasher.clone())
        .build();
    controller.connect().unwrap();
    assert!(wait_until(TIMEOUT, || controller.state() == MachineState::Locked));

    controller
        .flash_grbl(Some("grbl_next.hex"), FlashMode::Write)
        .unwrap();

    assert!(listener.saw_state(MachineState::Flashing));
    let requests = flasher.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].port, "/dev/ttyMOCK0");
    assert!(requests[0].image.ends_with("grbl_next.hex"));
    assert!(wait_until(TIMEOUT, || controller.state() == MachineState::Locked));
    assert_eq!(firmware.opens(), 2);
    controller.close(false, None);
}

#[test]
fn test_failed_flash_closes_with_error() {
    let dir = firmware_dir();
    let mut config = test_config();
    config.firmware.directory = dir.path().to_path_buf();
    let flasher = Arc::new(RecordingFlasher {
        code: 1,
        ..RecordingFlasher::default()
    });
    let controller = GrblController::builder(config)
        .transport_factory(Arc::new(MockFactory::new(MockFirmware::new())))
        .flasher(flasher)
        .build();
    controller.connect().unwrap();
    assert!(wait_until(TIMEOUT, || controller.state() == MachineState::Locked));

    assert!(controller
        .flash_grbl(Some("grbl_next.hex"), FlashMode::Write)
        .is_err());
    assert_eq!(controller.state(), MachineState::ClosedWithError);
    assert_eq!(controller.last_error().as_deref(), Some("avrdude returncode: 1"));
}

#[test]
fn test_flash_refused_while_printing() {
    let harness = Harness::start(MockFirmware::new(), MachineProfile::default());
    harness.unlock();
    harness.firmware.set_auto_ok(false);
    let file = job_file("G0X1\n");
    harness.controller.select_file(file.path()).unwrap();
    harness.controller.start_print().unwrap();

    assert!(harness
        .controller
        .flash_grbl(Some("grbl_next.hex"), FlashMode::Write)
        .is_err());
    assert_eq!(harness.controller.state(), MachineState::Printing);
}
