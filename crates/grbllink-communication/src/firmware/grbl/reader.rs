//! Reader thread
//!
//! Reads the transport, assembles lines and dispatches them by response
//! class. While the firmware stays silent during connect, a soft reset is
//! sent to provoke the startup banner.

use super::controller::{Shared, SERIAL_TARGET};
use super::error_decoder::{decode_alarm, format_error, is_benign_error};
use super::response_parser::GrblResponse;
use super::status_parser::StatusParser;
use super::tracker::PauseDecision;
use super::FirmwareInfo;
use crate::communication::{LineBuffer, RealTimeCommand};
use grbllink_core::{ConnectionInfo, MachineState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Corrupted lines collected before they are reported
const CORRUPTED_REPORT_THRESHOLD: usize = 2;

impl Shared {
    pub(super) fn reader_loop(self: &Arc<Self>) {
        debug!("Reader started");
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 256];
        let mut last_data = Instant::now();
        let connect_timeout = self.config.connection.connect_timeout();

        while self.reading.load(Ordering::SeqCst) {
            let read = self
                .reader_port
                .lock()
                .as_mut()
                .map(|transport| transport.read(&mut buf));
            let Some(read) = read else {
                debug!("Serial port closed");
                break;
            };

            match read {
                Ok(0) => {
                    if self.state().is_connecting() && last_data.elapsed() >= connect_timeout {
                        info!(
                            "No data from GRBL within {:?}, sending soft reset",
                            connect_timeout
                        );
                        if let Err(e) = self.write_realtime(RealTimeCommand::SoftReset) {
                            self.fail_transport(e);
                            break;
                        }
                        last_data = Instant::now();
                    }
                }
                Ok(n) => {
                    last_data = Instant::now();
                    for line in lines.push(&buf[..n]) {
                        self.handle_line(&line);
                    }
                }
                Err(e) => {
                    if self.reading.load(Ordering::SeqCst) {
                        self.fail_transport(e);
                    }
                    break;
                }
            }
        }
        debug!("Reader stopped");
    }

    fn handle_line(self: &Arc<Self>, line: &str) {
        let response = GrblResponse::parse(line);
        match &response {
            GrblResponse::Empty => return,
            GrblResponse::Status(_) => trace!(target: SERIAL_TARGET, "Recv: {}", line.trim()),
            _ => {
                debug!(target: SERIAL_TARGET, "Recv: {}", line.trim());
                self.record_terminal(format!("Recv: {}", line.trim()));
            }
        }

        match response {
            GrblResponse::Empty => {}
            GrblResponse::Status(status) => self.handle_status(&status),
            GrblResponse::Ok(rx_free) => self.handle_ok(rx_free),
            GrblResponse::Error(error) => self.handle_error(&error),
            GrblResponse::Alarm(alarm) => self.raise_alarm(decode_alarm(&alarm)),
            GrblResponse::Feedback(feedback) => self.handle_feedback(&feedback),
            GrblResponse::Startup { version } => self.handle_startup(line.trim(), version),
            GrblResponse::Setting(setting) => self.handle_setting(&setting),
            GrblResponse::CorruptedLine(corrupted) => self.handle_corrupted(&corrupted),
            GrblResponse::Other(other) => debug!("Unhandled line from GRBL: {}", other),
        }
        self.wake.set();
    }

    fn handle_ok(&self, rx_free: Option<u32>) {
        let command = self.ledger.lock().acknowledge();
        if command.is_none() {
            warn!("Received ok without an outstanding command");
        }

        if self.firmware.read().reports_rx_buffer {
            self.rx_stats.lock().add(rx_free);
        }

        let acked = command.as_deref().unwrap_or_default();
        let state = self.state();
        if (state == MachineState::Homing && acked.eq_ignore_ascii_case("$H"))
            || (state == MachineState::Locked && acked.eq_ignore_ascii_case("$X"))
        {
            self.change_state(MachineState::Operational);
        }

        let position = self.tracker.lock().apply_ack(acked);
        if let Some(work) = position {
            self.listener.on_position_updated(None, work);
        }
        self.reset_poll_timer();
    }

    fn handle_error(&self, line: &str) {
        let command = self.ledger.lock().acknowledge();
        if is_benign_error(line) {
            debug!("Ignoring {}", line);
            return;
        }

        let message = format_error(line);
        warn!("{} (command: {})", message, command.as_deref().unwrap_or("-"));
        self.report_error(&message);

        let was_printing = {
            let state = self.state();
            state.is_printing() || state.is_paused()
        };
        self.reset_pipeline(false);
        self.change_state(MachineState::Locked);
        if was_printing {
            self.abort_job(&message);
        }
        self.dump_terminal();
        self.log_rx_stats();
    }

    fn handle_feedback(&self, line: &str) {
        let body = line.trim_start_matches('[');
        if body.starts_with("Res") {
            info!("GRBL asks for a reset, sending soft reset");
            if let Err(e) = self.write_realtime(RealTimeCommand::SoftReset) {
                self.fail_transport(e);
            }
        } else if body.starts_with("'$H'") {
            let state = self.state();
            self.change_state(MachineState::Locked);
            if state.is_operational() {
                let was_printing = state.is_printing() || state.is_paused();
                self.reset_pipeline(true);
                self.report_error("Machine reset.");
                if was_printing {
                    self.abort_job("Machine reset.");
                }
                self.dump_terminal();
            }
        } else if body.starts_with("G24") {
            self.corrupted.lock().clear();
            warn!("GRBL reports avoided G24, collecting corrupted lines");
        } else if body.starts_with("Cau") || body.starts_with("Ena") || body.starts_with("Dis") {
            trace!("Ignoring {}", line);
        } else {
            debug!("GRBL feedback: {}", line);
        }
    }

    fn handle_startup(self: &Arc<Self>, line: &str, version: Option<String>) {
        match &version {
            Some(version) => info!("GRBL version {}", version),
            None => warn!("Unable to parse GRBL version from startup message: {}", line),
        }

        let info = FirmwareInfo::from_version(version.as_deref());
        *self.status_parser.write() = if info.legacy_status {
            StatusParser::legacy()
        } else {
            StatusParser::new()
        };
        *self.firmware.write() = info;

        {
            let mut profile = self.profile.write();
            if profile.grbl.auto_update_file.is_some() {
                if version.is_some() && profile.grbl.auto_update_version == version {
                    info!("GRBL auto-update to {:?} done", version);
                    profile.clear_auto_update();
                } else {
                    warn!(
                        "GRBL auto-update to {:?} pending, firmware reports {:?}",
                        profile.grbl.auto_update_version, version
                    );
                }
            }
        }

        let state = self.state();
        if state.is_operational() {
            warn!("GRBL restarted while {}", state);
            if state.is_printing() || state.is_paused() {
                self.abort_job("GRBL restarted");
            }
            self.reset_pipeline(false);
        } else {
            // Nothing written before the banner will be acknowledged.
            self.ledger.lock().clear();
        }

        self.change_state(MachineState::Locked);
        self.start_writer();

        let connection = self.params.lock().clone().map(|params| ConnectionInfo {
            port: params.port,
            baud_rate: params.baud_rate,
            firmware_version: version,
        });
        if let Some(connection) = connection {
            self.listener.on_connected(&connection);
        }

        let retries = self.config.settings_sync.retries;
        self.correct_settings(retries, false);
    }

    fn handle_setting(&self, line: &str) {
        match self.settings.lock().parse_line(line) {
            Some(id) => trace!("Setting ${} received", id),
            None => warn!("Unable to parse setting line: {}", line),
        }
    }

    fn handle_corrupted(&self, line: &str) {
        let data = line
            .split_once(':')
            .map_or(line, |(_, rest)| rest.trim_start())
            .to_string();

        let report = {
            let mut corrupted = self.corrupted.lock();
            corrupted.push(data);
            if corrupted.len() < CORRUPTED_REPORT_THRESHOLD {
                return;
            }
            std::mem::take(&mut *corrupted)
        };

        for line in &report {
            warn!("G24_AVOIDED line: '{}' (hex: {})", line, hex_dump(line));
        }
        self.dump_terminal();
    }

    fn handle_status(self: &Arc<Self>, line: &str) {
        let report = self.status_parser.read().parse(line);
        let Some(report) = report else {
            warn!("Unable to parse status report: {}", line);
            return;
        };
        self.sync_poll_pending.store(false, Ordering::SeqCst);

        let laser = self.tracker.lock().apply_status(&report);
        if let (Some(intensity), Some(analytics)) = (laser, &self.analytics) {
            analytics.add_laser_intensity(intensity);
        }
        self.listener
            .on_position_updated(Some(report.machine), report.work);

        let state = self.state();
        if !state.is_printing() && !state.is_paused() {
            return;
        }
        let decision = self
            .tracker
            .lock()
            .pause_decision(Instant::now(), state.is_paused(), || {
                self.pause_oracle
                    .as_ref()
                    .map_or(true, |oracle| oracle.is_intended_pause())
            });

        match decision {
            PauseDecision::None => {}
            PauseDecision::Pause => {
                info!("GRBL holds on its own, pausing job");
                self.set_pause(true, false, Some("grbl_state_queue"), false);
            }
            PauseDecision::ForceResume => {
                warn!("GRBL holds but no pause is intended, resuming");
                self.set_pause(false, true, Some("unintended_pause"), true);
            }
            PauseDecision::Resume => {
                info!("GRBL runs again, resuming job");
                self.set_pause(false, false, Some("grbl_state_run"), false);
            }
        }
    }
}

/// `[47] [31] ...` rendering of a line's bytes
fn hex_dump(line: &str) -> String {
    line.bytes()
        .map(|b| format!("[{:02X}]", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump("G1"), "[47] [31]");
        assert_eq!(hex_dump(""), "");
    }
}
