//! Frame statistics for periodic logging
use crate::backend::BackendKind;
use std::time::{Duration, Instant};

/// Rolling frame-rate counter with per-backend totals
#[derive(Debug)]
pub struct FrameStats {
    last_report: Instant,
    frame_count: u32,
    report_interval: Duration,
    software_frames: u64,
    hardware_frames: u64,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(5))
    }

    pub fn with_interval(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frame_count: 0,
            report_interval,
            software_frames: 0,
            hardware_frames: 0,
        }
    }

    /// Call after each presented frame
    pub fn tick(&mut self, backend: BackendKind) {
        self.frame_count += 1;
        match backend {
            BackendKind::Software => self.software_frames += 1,
            BackendKind::Hardware => self.hardware_frames += 1,
        }
    }

    /// Returns Some(fps) once per report interval
    pub fn poll_report(&mut self) -> Option<f64> {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.report_interval {
            return None;
        }
        let fps = self.frame_count as f64 / elapsed.as_secs_f64();
        self.frame_count = 0;
        self.last_report = Instant::now();
        Some(fps)
    }

    pub fn software_frames(&self) -> u64 {
        self.software_frames
    }

    pub fn hardware_frames(&self) -> u64 {
        self.hardware_frames
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_backend() {
        let mut stats = FrameStats::with_interval(Duration::ZERO);
        stats.tick(BackendKind::Software);
        stats.tick(BackendKind::Hardware);
        stats.tick(BackendKind::Hardware);
        assert_eq!(stats.software_frames(), 1);
        assert_eq!(stats.hardware_frames(), 2);
        assert!(stats.poll_report().is_some());
    }
}
