// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Progress snapshots for display
//!
//! Missions only count bytes. Speed, ETA and the throttling of UI updates
//! live here, fed from `on_progress` events.

use crate::download::mission::{Mission, MissionStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Progress snapshot for a single mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// File name of the mission
    pub name: String,

    /// Bytes confirmed written
    pub bytes_downloaded: u64,

    /// Total bytes (0 before the probe ran)
    pub total_bytes: u64,

    /// Percentage complete (0.0 - 100.0)
    pub percent_complete: f64,

    /// Current download speed in bytes per second
    pub download_speed: f64,

    /// Estimated time remaining in seconds (0 if unknown)
    pub eta_seconds: u64,

    pub status: MissionStatus,

    /// Set when the mission failed
    pub error_message: Option<String>,
}

impl DownloadProgress {
    pub fn new(name: String, total_bytes: u64) -> Self {
        Self {
            name,
            bytes_downloaded: 0,
            total_bytes,
            percent_complete: 0.0,
            download_speed: 0.0,
            eta_seconds: 0,
            status: MissionStatus::Created,
            error_message: None,
        }
    }

    /// Snapshot of a mission's counters, without speed information
    pub fn of(mission: &Mission) -> Self {
        let mut progress = Self::new(mission.name().to_string(), mission.length());
        progress.bytes_downloaded = mission.done();
        progress.status = mission.status();
        progress.error_message = mission
            .error()
            .map(|code| format!("{} (code {})", code, code.code()));
        progress.calculate_percentage();
        progress
    }

    pub fn calculate_percentage(&mut self) {
        if self.total_bytes > 0 {
            self.percent_complete = (self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0;
        } else {
            self.percent_complete = 0.0;
        }
    }

    pub fn calculate_eta(&mut self) {
        if self.download_speed > 0.0 && self.total_bytes > 0 {
            let remaining_bytes = self.total_bytes.saturating_sub(self.bytes_downloaded);
            self.eta_seconds = (remaining_bytes as f64 / self.download_speed) as u64;
        } else {
            self.eta_seconds = 0;
        }
    }

    /// e.g. "2.5 MB/s"
    pub fn speed_string(&self) -> String {
        let mb_per_sec = self.download_speed / 1_000_000.0;
        format!("{:.1} MB/s", mb_per_sec)
    }

    /// e.g. "5m 30s"
    pub fn eta_string(&self) -> String {
        if self.eta_seconds == 0 {
            return "calculating...".to_string();
        }

        let hours = self.eta_seconds / 3600;
        let minutes = (self.eta_seconds % 3600) / 60;
        let seconds = self.eta_seconds % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// e.g. "45.2 MB"
    pub fn bytes_string(bytes: u64) -> String {
        let mb = bytes as f64 / 1_000_000.0;
        format!("{:.1} MB", mb)
    }

    pub fn display_string(&self) -> String {
        match self.status {
            MissionStatus::Created => format!("{}: Queued", self.name),
            MissionStatus::Probing => format!("{}: Contacting server", self.name),
            MissionStatus::Running => format!(
                "{}: {:.1}% ({} / {}) - {} - {}",
                self.name,
                self.percent_complete,
                Self::bytes_string(self.bytes_downloaded),
                Self::bytes_string(self.total_bytes),
                self.speed_string(),
                self.eta_string()
            ),
            MissionStatus::Paused => {
                format!("{}: Paused at {:.1}%", self.name, self.percent_complete)
            }
            MissionStatus::Finished => format!("{}: Completed", self.name),
            MissionStatus::Errored => format!(
                "{}: Failed - {}",
                self.name,
                self.error_message.as_deref().unwrap_or("Unknown error")
            ),
        }
    }
}

/// Transfer rate over a sliding window of `(time, done)` samples
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    /// Tracker averaging over the last 10 seconds
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, done: u64) {
        self.record_at(Instant::now(), done);
    }

    /// Add a sample taken at `at`, dropping samples older than the window
    pub fn record_at(&mut self, at: Instant, done: u64) {
        self.samples.push_back((at, done));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.saturating_duration_since(oldest) <= self.window {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the window, 0 with fewer than two samples
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(t0, first)), Some(&(t1, last))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let seconds = t1.saturating_duration_since(t0).as_secs_f64();
        if seconds <= 0.0 {
            return 0.0;
        }
        // retracted attempts can move done backwards
        last.saturating_sub(first) as f64 / seconds
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds `on_progress` events into a [`DownloadProgress`] and decides when a
/// redraw is due
#[derive(Debug)]
pub struct ProgressTracker {
    progress: DownloadProgress,
    speed: SpeedTracker,
    redraw_every: Duration,
    last_redraw: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(name: String, total_bytes: u64) -> Self {
        Self::with_interval(name, total_bytes, Duration::from_millis(200))
    }

    pub fn with_interval(name: String, total_bytes: u64, redraw_every: Duration) -> Self {
        let mut progress = DownloadProgress::new(name, total_bytes);
        progress.status = MissionStatus::Running;
        Self {
            progress,
            speed: SpeedTracker::new(),
            redraw_every,
            last_redraw: None,
        }
    }

    /// Record a progress event
    ///
    /// Returns true when the caller should redraw: the first update, then at
    /// most once per interval.
    pub fn update(&mut self, done: u64, total: u64) -> bool {
        let now = Instant::now();
        self.speed.record_at(now, done);

        self.progress.bytes_downloaded = done;
        self.progress.total_bytes = total;
        self.progress.download_speed = self.speed.bytes_per_second();
        self.progress.calculate_percentage();
        self.progress.calculate_eta();

        let due = self
            .last_redraw
            .map_or(true, |last| now.saturating_duration_since(last) >= self.redraw_every);
        if due {
            self.last_redraw = Some(now);
        }
        due
    }

    pub fn set_error(&mut self, message: String) {
        self.progress.status = MissionStatus::Errored;
        self.progress.error_message = Some(message);
    }

    pub fn progress(&self) -> &DownloadProgress {
        &self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut progress = DownloadProgress::new("movie.mkv".to_string(), 1_000_000);

        progress.bytes_downloaded = 250_000;
        progress.calculate_percentage();
        assert_eq!(progress.percent_complete, 25.0);

        progress.bytes_downloaded = 1_000_000;
        progress.calculate_percentage();
        assert_eq!(progress.percent_complete, 100.0);
    }

    #[test]
    fn test_unknown_total_is_zero_percent() {
        let mut progress = DownloadProgress::new("probing.bin".to_string(), 0);
        progress.bytes_downloaded = 10;
        progress.calculate_percentage();
        assert_eq!(progress.percent_complete, 0.0);
        assert_eq!(progress.display_string(), "probing.bin: Queued");
    }

    #[test]
    fn test_speed_over_window() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::with_window(Duration::from_secs(10));
        assert_eq!(tracker.bytes_per_second(), 0.0);

        tracker.record_at(t0, 0);
        tracker.record_at(t0 + Duration::from_secs(2), 1_000_000);
        assert_eq!(tracker.bytes_per_second(), 500_000.0);

        // the first sample falls out of the window
        tracker.record_at(t0 + Duration::from_secs(12), 3_000_000);
        assert_eq!(tracker.bytes_per_second(), 200_000.0);
    }

    #[test]
    fn test_speed_ignores_retractions() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record_at(t0, 500);
        tracker.record_at(t0 + Duration::from_millis(10), 100);
        assert_eq!(tracker.bytes_per_second(), 0.0);
    }

    #[test]
    fn test_eta_calculation() {
        let mut progress = DownloadProgress::new("movie.mkv".to_string(), 10_000_000);

        progress.bytes_downloaded = 5_000_000;
        progress.download_speed = 1_000_000.0;
        progress.calculate_eta();

        assert_eq!(progress.eta_seconds, 5);
        assert_eq!(progress.eta_string(), "5s");
    }

    #[test]
    fn test_tracker_throttles_updates() {
        let mut tracker = ProgressTracker::with_interval("a.bin".to_string(), 100, Duration::from_secs(60));
        assert!(tracker.update(10, 100));
        assert!(!tracker.update(20, 100));
        assert_eq!(tracker.progress().bytes_downloaded, 20);
        assert_eq!(tracker.progress().percent_complete, 20.0);
    }

    #[test]
    fn test_error_display() {
        let mut tracker = ProgressTracker::new("a.bin".to_string(), 100);
        tracker.set_error("server unsupported".to_string());
        assert_eq!(
            tracker.progress().display_string(),
            "a.bin: Failed - server unsupported"
        );
    }
}
