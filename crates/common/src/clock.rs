//! Timing utilities shared by the export pipeline.
//!
//! Timeline positions are `f64` seconds. Renderers work in whole frames, so
//! this module owns the single seconds <-> frames mapping every stage uses:
//! frame `i` is sampled at `i / fps`, and a span of `d` seconds covers
//! `ceil(d * fps)` frames.

use std::time::Instant;

/// Tolerance used when snapping timeline seconds onto frame boundaries.
const FRAME_EPSILON: f64 = 1e-9;

/// Frame-accurate conversions for a fixed frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClock {
    fps: u32,
}

impl FrameClock {
    /// Create a clock for `fps` frames per second (clamped to at least 1).
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Duration of one frame in seconds.
    pub fn frame_duration(&self) -> f64 {
        1.0 / self.fps as f64
    }

    /// Presentation time of frame `index`.
    pub fn frame_time(&self, index: u64) -> f64 {
        index as f64 / self.fps as f64
    }

    /// Number of frames needed to cover `duration_secs`.
    pub fn frame_count(&self, duration_secs: f64) -> u64 {
        if duration_secs <= 0.0 {
            return 0;
        }
        (duration_secs * self.fps as f64 - FRAME_EPSILON).ceil() as u64
    }

    /// Index of the frame displayed at `time_secs`.
    pub fn frame_at(&self, time_secs: f64) -> u64 {
        if time_secs <= 0.0 {
            return 0;
        }
        (time_secs * self.fps as f64 + FRAME_EPSILON).floor() as u64
    }
}

/// Format seconds for encoder arguments (fixed 6-decimal precision).
pub fn format_secs(secs: f64) -> String {
    format!("{:.6}", secs.max(0.0))
}

/// Estimates remaining wall-clock time from fractional progress.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    started: Instant,
}

impl EtaEstimator {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Remaining seconds assuming constant throughput; `0.0` until progress starts.
    pub fn eta_secs(&self, progress: f64) -> f64 {
        eta_from(self.elapsed_secs(), progress)
    }
}

fn eta_from(elapsed_secs: f64, progress: f64) -> f64 {
    if progress > 0.0 {
        ((elapsed_secs / progress) - elapsed_secs).max(0.0)
    } else {
        0.0
    }
}

/// Rate controller for progress event emission.
#[derive(Debug)]
pub struct RateController {
    target_interval_ns: u64,
    last_tick_ns: Option<u64>,
}

impl RateController {
    /// Create a controller targeting the given Hz rate.
    pub fn new(target_hz: u32) -> Self {
        Self {
            target_interval_ns: 1_000_000_000 / target_hz.max(1) as u64,
            last_tick_ns: None,
        }
    }

    /// Check if enough time has passed for the next tick.
    /// Returns true and updates internal state if ready.
    /// The first call always returns true.
    pub fn should_tick(&mut self, current_ns: u64) -> bool {
        match self.last_tick_ns {
            None => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            Some(last) if current_ns >= last + self.target_interval_ns => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            _ => false,
        }
    }

    /// Target interval in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.target_interval_ns
    }
}
