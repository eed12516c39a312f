//! Scripted GRBL firmware behind the transport seam
//!
//! The mock answers every line with `ok`, dumps its settings table on `$$`,
//! applies `$id=value` writes and answers `?` with a status report built from
//! its current run-state. Hold, resume and reset bytes move the run-state
//! like the firmware does. Every open delivers the startup banner.
//! Empty reads and opens can be slowed down to mimic real serial timing.

#![allow(dead_code)]

use grbllink_communication::{ConnectionParams, Transport, TransportFactory, TransportWriter};
use grbllink_core::{
    CommListener, ConnectionError, ConnectionInfo, JobEvent, JobProgress, MachineState, Result,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const BANNER: &str = "Grbl 0.9g_20180223_61638c5 ['$' for help]";

#[derive(Debug)]
struct FirmwareState {
    outbox: VecDeque<u8>,
    partial: Vec<u8>,
    lines: Vec<String>,
    realtime: Vec<u8>,
    settings: BTreeMap<u32, String>,
    run_state: String,
    limits: String,
    banner: Option<String>,
    auto_ok: bool,
    status_replies: bool,
    fail_reads: bool,
    read_delay: Duration,
    open_delay: Duration,
    opens: usize,
}

/// Shared firmware state, survives reopening the port
#[derive(Debug, Clone)]
pub struct MockFirmware {
    state: Arc<Mutex<FirmwareState>>,
}

impl Default for MockFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFirmware {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FirmwareState {
                outbox: VecDeque::new(),
                partial: Vec::new(),
                lines: Vec::new(),
                realtime: Vec::new(),
                settings: BTreeMap::new(),
                run_state: "Idle".to_string(),
                limits: String::new(),
                banner: Some(BANNER.to_string()),
                auto_ok: true,
                status_replies: true,
                fail_reads: false,
                read_delay: Duration::from_millis(2),
                open_delay: Duration::ZERO,
                opens: 0,
            })),
        }
    }

    pub fn with_settings(self, settings: &[(u32, &str)]) -> Self {
        {
            let mut state = self.state.lock();
            for (id, value) in settings {
                state.settings.insert(*id, value.to_string());
            }
        }
        self
    }

    pub fn with_banner(self, banner: Option<&str>) -> Self {
        self.state.lock().banner = banner.map(str::to_string);
        self
    }

    /// Stop acknowledging lines
    pub fn set_auto_ok(&self, enabled: bool) {
        self.state.lock().auto_ok = enabled;
    }

    /// Stop answering `?` with a status report
    pub fn set_status_replies(&self, enabled: bool) {
        self.state.lock().status_replies = enabled;
    }

    /// How long an empty read blocks, like a serial read timeout
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    /// How long opening the port takes
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    pub fn set_run_state(&self, run_state: &str) {
        self.state.lock().run_state = run_state.to_string();
    }

    pub fn set_limits(&self, limits: &str) {
        self.state.lock().limits = limits.to_string();
    }

    pub fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }

    /// Queue a line for the host
    pub fn emit(&self, line: &str) {
        let mut state = self.state.lock();
        state.outbox.extend(line.bytes());
        state.outbox.extend(b"\r\n");
    }

    /// Lines the host wrote, terminator stripped
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    /// Real-time bytes the host wrote
    pub fn realtime(&self) -> Vec<u8> {
        self.state.lock().realtime.clone()
    }

    pub fn setting(&self, id: u32) -> Option<String> {
        self.state.lock().settings.get(&id).cloned()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// Status report as the firmware would send it right now
    pub fn status_report(&self) -> String {
        Self::status_line(&self.state.lock())
    }

    fn status_line(state: &FirmwareState) -> String {
        format!(
            "<{},MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000,RX:0,limits:{},laser off:0>",
            state.run_state, state.limits
        )
    }

    fn push_line(state: &mut FirmwareState, line: &str) {
        state.outbox.extend(line.bytes());
        state.outbox.extend(b"\r\n");
    }

    fn receive(&self, data: &[u8]) {
        let mut state = self.state.lock();
        for &byte in data {
            match byte {
                b'?' => {
                    state.realtime.push(byte);
                    if state.status_replies {
                        let status = Self::status_line(&state);
                        Self::push_line(&mut state, &status);
                    }
                }
                b'!' => {
                    state.realtime.push(byte);
                    state.run_state = "Hold".to_string();
                }
                b'~' => {
                    state.realtime.push(byte);
                    state.run_state = "Run".to_string();
                }
                0x18 => {
                    state.realtime.push(byte);
                    state.partial.clear();
                    state.run_state = "Idle".to_string();
                    if let Some(banner) = state.banner.clone() {
                        Self::push_line(&mut state, &banner);
                    }
                }
                b'\n' => {
                    let line = String::from_utf8_lossy(&state.partial).into_owned();
                    state.partial.clear();
                    Self::answer(&mut state, &line);
                    state.lines.push(line);
                }
                _ => state.partial.push(byte),
            }
        }
    }

    fn answer(state: &mut FirmwareState, line: &str) {
        if !state.auto_ok {
            return;
        }
        if line == "$$" {
            let settings: Vec<String> = state
                .settings
                .iter()
                .map(|(id, value)| format!("${}={} (setting {})", id, value, id))
                .collect();
            for setting in settings {
                Self::push_line(state, &setting);
            }
        } else if let Some((id, value)) = line
            .strip_prefix('$')
            .and_then(|rest| rest.split_once('='))
        {
            if let Ok(id) = id.parse::<u32>() {
                state.settings.insert(id, value.to_string());
            }
        }
        Self::push_line(state, "ok");
    }
}

pub struct MockTransport {
    firmware: MockFirmware,
    name: String,
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (read, delay) = {
            let mut state = self.firmware.state.lock();
            if state.fail_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            let n = buf.len().min(state.outbox.len());
            for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                *slot = byte;
            }
            (n, state.read_delay)
        };
        if read == 0 {
            thread::sleep(delay);
        }
        Ok(read)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn try_clone_writer(&self) -> io::Result<Box<dyn TransportWriter>> {
        Ok(Box::new(MockWriter {
            firmware: self.firmware.clone(),
        }))
    }
}

pub struct MockWriter {
    firmware: MockFirmware,
}

impl TransportWriter for MockWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.firmware.receive(data);
        Ok(())
    }
}

pub struct MockFactory {
    pub firmware: MockFirmware,
    pub fail_open: bool,
}

impl MockFactory {
    pub fn new(firmware: MockFirmware) -> Self {
        Self {
            firmware,
            fail_open: false,
        }
    }
}

impl TransportFactory for MockFactory {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        if self.fail_open {
            return Err(ConnectionError::FailedToOpen {
                port: params.port.clone(),
                reason: "permission denied".to_string(),
            }
            .into());
        }
        let delay = self.firmware.state.lock().open_delay;
        thread::sleep(delay);
        {
            let mut state = self.firmware.state.lock();
            state.opens += 1;
            state.outbox.clear();
            if let Some(banner) = state.banner.clone() {
                MockFirmware::push_line(&mut state, &banner);
            }
        }
        Ok(Box::new(MockTransport {
            firmware: self.firmware.clone(),
            name: params.port.clone(),
        }))
    }

    fn detect_port(&self) -> Option<String> {
        Some("/dev/ttyMOCK0".to_string())
    }
}

/// Observer recording everything it is told
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub states: Mutex<Vec<MachineState>>,
    pub job_events: Mutex<Vec<JobEvent>>,
    pub errors: Mutex<Vec<String>>,
    pub logs: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<JobProgress>>,
    pub connected: Mutex<Vec<ConnectionInfo>>,
    pub jobs_done: Mutex<usize>,
}

impl RecordingListener {
    pub fn saw_state(&self, state: MachineState) -> bool {
        self.states.lock().contains(&state)
    }
}

impl CommListener for RecordingListener {
    fn on_state_changed(&self, _old: MachineState, new: MachineState) {
        self.states.lock().push(new);
    }

    fn on_progress(&self, progress: &JobProgress) {
        self.progress.lock().push(*progress);
    }

    fn on_print_job_done(&self) {
        *self.jobs_done.lock() += 1;
    }

    fn on_job_event(&self, event: &JobEvent) {
        self.job_events.lock().push(event.clone());
    }

    fn on_log(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_connected(&self, info: &ConnectionInfo) {
        self.connected.lock().push(info.clone());
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
