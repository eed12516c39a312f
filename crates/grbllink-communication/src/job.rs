//! Print job streaming
//!
//! A [`PrintJob`] reads a G-code file line by line, strips comments and
//! whitespace, and keeps the bookkeeping the controller reports: byte position,
//! bytes spent on comments, passes and the time lost while paused.

use chrono::{DateTime, Utc};
use grbllink_core::{JobError, JobProgress, SelectedFile};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Strip a `;` comment; a backslash escapes the next character.
pub fn strip_comment(line: &str) -> &str {
    if !line.contains(';') {
        return line;
    }
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        if c == ';' && !escaped {
            return &line[..index];
        }
        escaped = c == '\\' && !escaped;
    }
    line
}

/// Turn a raw file line into a command, `None` when nothing is left
pub fn process_gcode_line(line: &str) -> Option<String> {
    let command: String = strip_comment(line)
        .trim()
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    (!command.is_empty()).then_some(command)
}

/// A job file being streamed
#[derive(Debug)]
pub struct PrintJob {
    id: Uuid,
    path: PathBuf,
    name: String,
    size: u64,
    reader: Option<BufReader<File>>,
    position: u64,
    comment_bytes: u64,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    passes: u32,
    finished_passes: u32,
    pause_started: Option<Instant>,
    pause_lost: Duration,
}

impl PrintJob {
    /// Prepare a job for an existing file
    pub fn new(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let metadata = std::fs::metadata(&path)
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| JobError::FileNotFound {
                path: display.clone(),
            })?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: display,
            path,
            size: metadata.len(),
            reader: None,
            position: 0,
            comment_bytes: 0,
            started: None,
            started_at: None,
            passes: 1,
            finished_passes: 0,
            pause_started: None,
            pause_lost: Duration::ZERO,
        })
    }

    fn open(&self) -> Result<BufReader<File>, JobError> {
        File::open(&self.path)
            .map(BufReader::new)
            .map_err(|e| JobError::Read {
                path: self.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Open the file and start the clock
    pub fn start(&mut self) -> Result<(), JobError> {
        self.reader = Some(self.open()?);
        self.id = Uuid::new_v4();
        self.position = 0;
        self.comment_bytes = 0;
        self.finished_passes = 0;
        self.pause_started = None;
        self.pause_lost = Duration::ZERO;
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Next command of the file, `None` at end of file.
    ///
    /// Comment-only and blank lines are skipped and counted as comment bytes.
    pub fn next_line(&mut self) -> Result<Option<String>, JobError> {
        let mut raw = String::new();
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            raw.clear();
            let read = reader.read_line(&mut raw).map_err(|e| JobError::Read {
                path: self.name.clone(),
                reason: e.to_string(),
            })?;
            if read == 0 {
                self.close();
                return Ok(None);
            }
            self.position += read as u64;
            match process_gcode_line(&raw) {
                Some(command) => return Ok(Some(command)),
                None => self.comment_bytes += read as u64,
            }
        }
    }

    /// Start the file over for the next pass
    pub fn rewind(&mut self) -> Result<(), JobError> {
        self.reader = Some(self.open()?);
        self.position = 0;
        self.comment_bytes = 0;
        Ok(())
    }

    /// Close the file handle
    pub fn close(&mut self) {
        self.reader = None;
    }

    /// Whether the file handle is open
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Job identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Selection info for observers
    pub fn selected_file(&self) -> SelectedFile {
        SelectedFile {
            name: self.name.clone(),
            size: self.size,
        }
    }

    /// Payload bytes read so far
    pub fn file_position(&self) -> u64 {
        self.position.saturating_sub(self.comment_bytes)
    }

    /// Fraction of payload read, `-1.0` when the file holds no payload
    pub fn completion(&self) -> f64 {
        let payload = self.size.saturating_sub(self.comment_bytes);
        if self.size == 0 || payload == 0 {
            return -1.0;
        }
        self.file_position() as f64 / payload as f64
    }

    /// Requested passes
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Set the requested passes
    pub fn set_passes(&mut self, passes: u32) {
        self.passes = passes;
    }

    /// Passes finished
    pub fn finished_passes(&self) -> u32 {
        self.finished_passes
    }

    /// Count a finished pass; returns whether all passes are done
    pub fn finish_pass(&mut self) -> bool {
        self.finished_passes += 1;
        self.finished_passes >= self.passes
    }

    /// When the job started
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Start counting pause time, unless already counting
    pub fn begin_pause(&mut self, now: Instant) {
        self.pause_started.get_or_insert(now);
    }

    /// Stop counting pause time
    pub fn end_pause(&mut self, now: Instant) {
        if let Some(started) = self.pause_started.take() {
            self.pause_lost += now.saturating_duration_since(started);
        }
    }

    /// Time spent paused, including a pause still running
    pub fn pause_lost(&self, now: Instant) -> Duration {
        self.pause_lost
            + self
                .pause_started
                .map_or(Duration::ZERO, |started| now.saturating_duration_since(started))
    }

    /// Seconds since start minus time lost in pauses, 0 before start
    pub fn print_time_secs(&self, now: Instant) -> f64 {
        self.started.map_or(0.0, |started| {
            now.saturating_duration_since(started)
                .saturating_sub(self.pause_lost(now))
                .as_secs_f64()
        })
    }

    /// Progress snapshot
    pub fn progress(&self, now: Instant) -> JobProgress {
        JobProgress {
            completion: self.completion(),
            file_position: self.file_position(),
            print_time_secs: self.print_time_secs(now),
            finished_passes: self.finished_passes,
            passes: self.passes,
        }
    }
}
