//! Writer and status poller threads
//!
//! Each writer cycle sends pending real-time bytes first, then works through
//! the queue, refilling it from the job whenever it runs dry, until a command
//! has to wait for buffer space or a barrier. Afterwards it sleeps on the
//! wake signal.

use super::command_pipeline::Phase;
use super::controller::{Shared, WriteOutcome};
use super::error_decoder::command_too_long_alarm;
use crate::communication::{Admission, QueuedCommand, RealTimeCommand};
use crate::job::PrintJob;
use grbllink_core::{JobError, MachineState};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest sleep between writer cycles
const WRITER_WAIT: Duration = Duration::from_secs(1);

/// Poller tick
const POLL_TICK: Duration = Duration::from_millis(100);

enum Step {
    /// Command done, take the next one
    Next,
    /// Blocked until an acknowledgment or status arrives
    Wait,
}

impl Shared {
    pub(super) fn writer_loop(self: &Arc<Self>) {
        debug!("Writer started");
        while self.writing.load(Ordering::SeqCst) {
            if let Err(e) = self.service() {
                if self.writing.load(Ordering::SeqCst) {
                    self.fail_transport(e);
                }
                break;
            }
            self.wake.wait(WRITER_WAIT);
            self.wake.clear();
        }
        self.writing.store(false, Ordering::SeqCst);
        debug!("Writer stopped");
    }

    /// One writer cycle
    fn service(&self) -> io::Result<()> {
        while let Some(command) = self.realtime.take_next() {
            self.write_realtime(command)?;
        }

        while self.writing.load(Ordering::SeqCst) {
            if self.state().is_printing() && self.queue.is_empty() && self.current.lock().is_none()
            {
                self.feed_job();
            }
            match self.step()? {
                Step::Next => continue,
                Step::Wait => break,
            }
        }
        Ok(())
    }

    /// Work on the current command, taking a new one from the queue when idle
    fn step(&self) -> io::Result<Step> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let command = {
            let mut current = self.current.lock();
            if current.is_none() {
                *current = self.queue.pop();
            }
            match current.clone() {
                Some(command) => command,
                None => return Ok(Step::Wait),
            }
        };

        match command {
            QueuedCommand::Flush => {
                if !self.ledger.lock().is_empty() {
                    return Ok(Step::Wait);
                }
                debug!("FLUSHed");
            }
            QueuedCommand::Sync => {
                let drained = self.ledger.lock().is_empty();
                let moving = self.tracker.lock().run_state().is_moving();
                if !drained || moving {
                    if drained && !self.sync_poll_pending.swap(true, Ordering::SeqCst) {
                        self.realtime.request(RealTimeCommand::StatusReport);
                        self.wake.set();
                    }
                    return Ok(Step::Wait);
                }
                self.sync_poll_pending.store(false, Ordering::SeqCst);
                debug!("SYNCed");
            }
            QueuedCommand::Line(line) => match self.write_command(&line)? {
                WriteOutcome::Written | WriteOutcome::Rejected => {}
                WriteOutcome::Deferred => return Ok(Step::Wait),
            },
        }

        let mut current = self.current.lock();
        if self.epoch.load(Ordering::SeqCst) == epoch {
            *current = None;
        }
        Ok(Step::Next)
    }

    /// Transform, admit and write one line
    pub(super) fn write_command(&self, command: &str) -> io::Result<WriteOutcome> {
        let line = self.pipeline.lock().apply(Phase::Sending, command).command;

        let outcome = {
            let mut ledger = self.ledger.lock();
            match ledger.admit(&line) {
                Admission::TooLong => WriteOutcome::Rejected,
                Admission::Deferred => WriteOutcome::Deferred,
                Admission::Fits => {
                    ledger.record(&line);
                    WriteOutcome::Written
                }
            }
        };

        match outcome {
            WriteOutcome::Written => {
                self.write_line(&line)?;
                let sent = self.pipeline.lock().apply(Phase::Sent, &line);
                if let Some(target) = sent.transition {
                    self.apply_transition(target);
                }
            }
            WriteOutcome::Rejected => {
                let max = self.ledger.lock().max_command_length();
                self.raise_alarm(command_too_long_alarm(&line, max));
            }
            WriteOutcome::Deferred => {}
        }
        Ok(outcome)
    }

    /// Queue the next job line, start the next pass or finish the job
    fn feed_job(&self) {
        let now = Instant::now();
        let next = {
            let mut job = self.job.lock();
            let Some(job) = job.as_mut() else {
                return;
            };
            if job.finished_passes() >= job.passes() {
                Ok(None)
            } else {
                next_job_line(job).map(|line| line.map(|line| (line, job.progress(now))))
            }
        };

        match next {
            Ok(Some((line, progress))) => {
                self.enqueue(QueuedCommand::from_line(line));
                self.listener.on_progress(&progress);
            }
            Ok(None) => {
                if self.ledger.lock().is_empty() {
                    self.finish_job();
                }
            }
            Err(e) => {
                let message = format!("Error reading job file: {}", e);
                self.report_error(&message);
                self.abort_job(&message);
                self.change_state(MachineState::Error);
            }
        }
    }

    pub(super) fn poller_loop(self: &Arc<Self>) {
        debug!("Status poller started");
        while self.polling.load(Ordering::SeqCst) {
            thread::sleep(POLL_TICK);

            if !self.state().is_operational() {
                continue;
            }
            let barrier = self
                .current
                .lock()
                .as_ref()
                .is_some_and(QueuedCommand::is_barrier);
            let interval = {
                let machine = self.machine.lock();
                if barrier {
                    machine.syncing_interval_secs()
                } else {
                    machine.poll_interval_secs()
                }
            };
            if interval <= 0.0 {
                continue;
            }

            let now = Instant::now();
            let mut next_poll = self.next_poll.lock();
            if now >= *next_poll {
                self.realtime.request(RealTimeCommand::StatusReport);
                self.wake.set();
                *next_poll = now + Duration::from_secs_f64(interval);
            }
        }
        debug!("Status poller stopped");
    }
}

/// Next line of the job, rewinding for the next pass at end of file
fn next_job_line(job: &mut PrintJob) -> Result<Option<String>, JobError> {
    if let Some(line) = job.next_line()? {
        return Ok(Some(line));
    }
    if job.finish_pass() {
        info!("All {} passes sent", job.passes());
        return Ok(None);
    }
    info!(
        "Pass {} of {} done, starting over",
        job.finished_passes(),
        job.passes()
    );
    job.rewind()?;
    let line = job.next_line()?;
    if line.is_none() {
        warn!("Job file holds no commands");
    }
    Ok(line)
}
