//! Feedrate and intensity overrides
//!
//! Motion and laser commands carry `F` (feedrate) and `S` (intensity) tokens.
//! Before a command goes out the tokens are rewritten: the feedrate is scaled
//! by the operator factor and clamped to the configured range, the intensity
//! is clamped to the laser ceiling, then scaled by the legacy factor and
//! clamped again. Rewritten tokens are cached until a factor changes.

use grbllink_settings::OverrideSettings;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

static FEEDRATE_REGEX: OnceLock<Regex> = OnceLock::new();
static INTENSITY_REGEX: OnceLock<Regex> = OnceLock::new();

fn feedrate_regex() -> &'static Regex {
    FEEDRATE_REGEX.get_or_init(|| Regex::new(r"(?i)F\d+").expect("invalid regex pattern"))
}

fn intensity_regex() -> &'static Regex {
    INTENSITY_REGEX.get_or_init(|| Regex::new(r"(?i)S\d+").expect("invalid regex pattern"))
}

/// Operator overrides for feedrate and laser intensity
#[derive(Debug, Clone)]
pub struct FeedIntensityOverrides {
    feedrate_factor: f64,
    intensity_factor: f64,
    feedrate_min: u32,
    feedrate_max: u32,
    intensity_limit: u32,
    feedrate_cache: HashMap<String, u32>,
    intensity_cache: HashMap<String, u32>,
    actual_feedrate: Option<u32>,
    actual_intensity: Option<u32>,
}

impl FeedIntensityOverrides {
    /// Create overrides with factor 1.0
    pub fn new(limits: OverrideSettings, intensity_limit: u32) -> Self {
        Self {
            feedrate_factor: 1.0,
            intensity_factor: 1.0,
            feedrate_min: limits.feedrate_min,
            feedrate_max: limits.feedrate_max,
            intensity_limit,
            feedrate_cache: HashMap::new(),
            intensity_cache: HashMap::new(),
            actual_feedrate: None,
            actual_intensity: None,
        }
    }

    /// Current feedrate factor
    pub fn feedrate_factor(&self) -> f64 {
        self.feedrate_factor
    }

    /// Current intensity factor
    pub fn intensity_factor(&self) -> f64 {
        self.intensity_factor
    }

    /// Last feedrate seen in an outgoing command
    pub fn actual_feedrate(&self) -> Option<u32> {
        self.actual_feedrate
    }

    /// Last intensity seen in an outgoing command, after the ceiling
    pub fn actual_intensity(&self) -> Option<u32> {
        self.actual_intensity
    }

    fn scaled_feedrate(&self, feedrate: u32) -> u32 {
        let scaled = (feedrate as f64 * self.feedrate_factor).round();
        (scaled as u32).clamp(self.feedrate_min, self.feedrate_max)
    }

    fn scaled_intensity(&self, intensity: u32) -> u32 {
        let scaled = (intensity as f64 * self.intensity_factor).round();
        (scaled as u32).min(self.intensity_limit)
    }

    /// Rewrite the first `F` token of a command
    pub fn rewrite_feedrate(&mut self, command: &str) -> String {
        let Some(token) = feedrate_regex().find(command) else {
            return command.to_string();
        };
        let Ok(feedrate) = token.as_str()[1..].parse::<u32>() else {
            return command.to_string();
        };
        self.actual_feedrate = Some(feedrate);

        let replacement = match self.feedrate_cache.get(token.as_str()) {
            Some(cached) => *cached,
            None => {
                let value = self.scaled_feedrate(feedrate);
                self.feedrate_cache.insert(token.as_str().to_string(), value);
                value
            }
        };

        splice(command, token.range(), &format!("F{}", replacement))
    }

    /// Rewrite the first `S` token of a command
    pub fn rewrite_intensity(&mut self, command: &str) -> String {
        let Some(token) = intensity_regex().find(command) else {
            return command.to_string();
        };
        let Ok(parsed) = token.as_str()[1..].parse::<u32>() else {
            return command.to_string();
        };

        let limited = parsed.min(self.intensity_limit);
        self.actual_intensity = Some(limited);

        if limited != parsed {
            return splice(command, token.range(), &format!("S{}", limited));
        }
        if self.intensity_factor == 1.0 {
            return command.to_string();
        }

        let replacement = match self.intensity_cache.get(token.as_str()) {
            Some(cached) => *cached,
            None => {
                let value = self.scaled_intensity(limited);
                self.intensity_cache.insert(token.as_str().to_string(), value);
                value
            }
        };

        splice(command, token.range(), &format!("S{}", replacement))
    }

    /// Record the feedrate of a standalone `F` command without rewriting it
    pub fn observe_feedrate(&mut self, command: &str) {
        if let Some(value) = first_value(feedrate_regex(), command) {
            self.actual_feedrate = Some(value);
        }
    }

    /// Record the intensity of a standalone `S` command without rewriting it
    pub fn observe_intensity(&mut self, command: &str) {
        if let Some(value) = first_value(intensity_regex(), command) {
            self.actual_intensity = Some(value.min(self.intensity_limit));
        }
    }

    /// Set the feedrate override in percent.
    ///
    /// Returns the `F` command to send when a feedrate is in effect.
    pub fn set_feedrate_override(&mut self, percent: f64) -> Option<String> {
        let factor = percent / 100.0;
        if factor <= 0.0 {
            return None;
        }
        self.feedrate_factor = factor;
        self.feedrate_cache.clear();
        self.actual_feedrate
            .map(|feedrate| format!("F{}", self.scaled_feedrate(feedrate)))
    }

    /// Set the intensity override in percent.
    ///
    /// Returns the `S` command to send when an intensity is in effect.
    pub fn set_intensity_override(&mut self, percent: f64) -> Option<String> {
        let factor = percent / 100.0;
        if factor < 0.0 {
            return None;
        }
        self.intensity_factor = factor;
        self.intensity_cache.clear();
        self.actual_intensity
            .map(|intensity| format!("S{}", self.scaled_intensity(intensity)))
    }

    /// Back to factor 1.0 with empty caches
    pub fn reset(&mut self) {
        self.feedrate_factor = 1.0;
        self.intensity_factor = 1.0;
        self.feedrate_cache.clear();
        self.intensity_cache.clear();
    }
}

fn first_value(regex: &Regex, command: &str) -> Option<u32> {
    regex.find(command)?.as_str()[1..].parse().ok()
}

fn splice(command: &str, range: std::ops::Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(command.len() + replacement.len());
    out.push_str(&command[..range.start]);
    out.push_str(replacement);
    out.push_str(&command[range.end..]);
    out
}
