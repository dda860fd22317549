use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub loaded: usize,
    pub total: Option<usize>,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

/// Receives progress observations. Purely advisory.
pub trait ProgressSink: Send + Sync {
    fn update(&self, update: &ProgressUpdate);

    fn finish(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn update(&self, _update: &ProgressUpdate) {}
}

/// Measures rate since construction and turns counts into updates.
#[derive(Debug, Clone, Copy)]
pub struct RateClock {
    started: Instant,
}

impl RateClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self, loaded: usize, total: Option<usize>) -> ProgressUpdate {
        let elapsed = self.started.elapsed();
        ProgressUpdate {
            loaded,
            total,
            elapsed,
            eta: estimate_remaining(loaded, total, elapsed),
        }
    }
}

pub fn estimate_remaining(done: usize, total: Option<usize>, elapsed: Duration) -> Option<Duration> {
    let total = total?;
    let remaining = total.saturating_sub(done);
    if remaining == 0 {
        return Some(Duration::ZERO);
    }
    let secs = elapsed.as_secs_f64();
    if done == 0 || secs <= 0.0 {
        return None;
    }
    let rate = done as f64 / secs;
    Some(Duration::from_secs_f64(remaining as f64 / rate))
}

/// Terminal progress bar. Hidden when stderr is not a terminal.
pub struct BarProgress {
    bar: ProgressBar,
    unit: &'static str,
}

impl BarProgress {
    pub fn new(prefix: &str, unit: &'static str, total: Option<usize>) -> Self {
        let bar = match total {
            Some(total) => bounded_bar(total as u64, prefix, unit),
            None => spinner_bar(prefix),
        };
        Self { bar, unit }
    }
}

impl ProgressSink for BarProgress {
    fn update(&self, update: &ProgressUpdate) {
        if let Some(total) = update.total {
            self.bar.set_length(total as u64);
        }
        self.bar.set_position(update.loaded as u64);
        let secs = update.elapsed.as_secs_f64().max(1.0);
        self.bar.set_message(format!(
            "{} {} ({:.2}/s) | ETA {}",
            format_usize_commas(update.loaded),
            self.unit,
            update.loaded as f64 / secs,
            format_eta(update.eta),
        ));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn bounded_bar(total: u64, message: &str, unit_label: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let template = format!(
        "{{spinner:.cyan}} {{prefix}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit_label} ({{percent:>3}}%) | {{msg}}"
    );
    pb.set_style(ProgressStyle::with_template(&template).unwrap());
    pb.set_prefix(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn spinner_bar(message: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner:.cyan} {prefix} {msg}").unwrap());
    pb.set_prefix(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => format_duration(eta.as_secs_f64().ceil() as u64),
        None => "--:--".to_string(),
    }
}

pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn format_usize_commas(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}
