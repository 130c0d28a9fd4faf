use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Deserialize;
use syspulse_proto::{CpuTimes, CpuUtilization};

use crate::format::round_to;

/// Youngest baseline that may be replaced. Keeps sessions that tick a few
/// milliseconds apart from measuring near-empty windows.
///
/// All sessions share one baseline, so a session ticking 100 ms after another
/// measures only those 100 ms, not its own interval. At 100 Hz jiffies that
/// resolves utilization to about 10%.
pub const MIN_DELTA_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuMode {
    /// Utilization over the window since the previous sample.
    #[default]
    Delta,
    /// Ratio of the since-boot counters.
    Cumulative,
}

#[derive(Debug)]
struct Baseline {
    taken_at: Instant,
    times: Vec<CpuTimes>,
    last: Vec<CpuUtilization>,
}

/// Turns per-core counters into utilization percentages.
#[derive(Debug)]
pub struct DeltaEngine {
    mode: CpuMode,
    baseline: Mutex<Option<Baseline>>,
}

impl DeltaEngine {
    pub fn new(mode: CpuMode) -> Self {
        DeltaEngine {
            mode,
            baseline: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn utilization(&self, current: &[CpuTimes], now: Instant) -> Vec<CpuUtilization> {
        match self.mode {
            CpuMode::Cumulative => current.iter().map(ratio).collect(),
            CpuMode::Delta => self.delta(current, now),
        }
    }

    fn delta(&self, current: &[CpuTimes], now: Instant) -> Vec<CpuUtilization> {
        let mut guard = self
            .baseline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let baseline = match guard.as_mut() {
            Some(b) if b.times.len() == current.len() => b,
            _ => {
                // nothing to diff against yet
                let seeded: Vec<_> = current.iter().map(ratio).collect();
                *guard = Some(Baseline {
                    taken_at: now,
                    times: current.to_vec(),
                    last: seeded.clone(),
                });
                return seeded;
            }
        };

        let usage: Vec<_> = current
            .iter()
            .zip(&baseline.times)
            .zip(&baseline.last)
            .map(|((curr, prev), last)| {
                let window = curr.saturating_sub(prev);
                if window.total() == 0 {
                    *last
                } else {
                    ratio(&window)
                }
            })
            .collect();

        baseline.last.clone_from(&usage);
        if now.saturating_duration_since(baseline.taken_at) >= MIN_DELTA_WINDOW {
            baseline.taken_at = now;
            baseline.times = current.to_vec();
        }

        usage
    }
}

/// Share of each state in `times`, one decimal each.
pub fn ratio(times: &CpuTimes) -> CpuUtilization {
    let total = times.total();
    if total == 0 {
        return CpuUtilization::default();
    }
    let pct = |ticks: u64| round_to(ticks as f64 / total as f64 * 100.0, 1);
    CpuUtilization {
        user: pct(times.user),
        system: pct(times.system),
        idle: pct(times.idle),
        other: pct(times.other()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(user: u64, system: u64, idle: u64) -> CpuTimes {
        CpuTimes {
            user,
            system,
            idle,
            ..Default::default()
        }
    }

    #[test]
    fn test_ratio_fixed_counters() {
        let usage = ratio(&times(200, 100, 700));
        assert_eq!(usage.user, 20.0);
        assert_eq!(usage.system, 10.0);
        assert_eq!(usage.idle, 70.0);
        assert_eq!(usage.other, 0.0);
    }

    #[test]
    fn test_ratio_sums_to_hundred_with_extra_states() {
        let t = CpuTimes {
            user: 1234,
            nice: 17,
            system: 567,
            idle: 8901,
            iowait: 33,
            irq: 9,
            softirq: 41,
            steal: 2,
        };
        let usage = ratio(&t);
        assert!((usage.total() - 100.0).abs() <= 0.2, "{usage:?}");
        assert!(usage.other > 0.0);
    }

    #[test]
    fn test_ratio_of_empty_counters() {
        assert_eq!(ratio(&CpuTimes::default()), CpuUtilization::default());
    }

    #[test]
    fn test_cumulative_mode_ignores_history() {
        let engine = DeltaEngine::new(CpuMode::Cumulative);
        let now = Instant::now();
        engine.utilization(&[times(100, 0, 900)], now);
        let usage = engine.utilization(&[times(200, 100, 700)], now + Duration::from_secs(1));
        assert_eq!(usage[0].user, 20.0);
    }

    #[test]
    fn test_delta_mode_first_sample_is_cumulative() {
        let engine = DeltaEngine::new(CpuMode::Delta);
        let usage = engine.utilization(&[times(200, 100, 700)], Instant::now());
        assert_eq!(usage[0].user, 20.0);
        assert_eq!(usage[0].idle, 70.0);
    }

    #[test]
    fn test_delta_mode_reports_window() {
        let engine = DeltaEngine::new(CpuMode::Delta);
        let t0 = Instant::now();
        engine.utilization(&[times(1000, 1000, 8000)], t0);

        // 50 user, 25 system, 25 idle ticks in the last second
        let usage = engine.utilization(&[times(1050, 1025, 8025)], t0 + Duration::from_secs(1));
        assert_eq!(usage[0].user, 50.0);
        assert_eq!(usage[0].system, 25.0);
        assert_eq!(usage[0].idle, 25.0);
    }

    #[test]
    fn test_delta_mode_empty_window_repeats_last() {
        let engine = DeltaEngine::new(CpuMode::Delta);
        let t0 = Instant::now();
        engine.utilization(&[times(1000, 1000, 8000)], t0);
        let first = engine.utilization(&[times(1050, 1025, 8025)], t0 + Duration::from_secs(1));
        let again = engine.utilization(&[times(1050, 1025, 8025)], t0 + Duration::from_secs(1));
        assert_eq!(first, again);
    }

    #[test]
    fn test_delta_mode_keeps_young_baseline() {
        let engine = DeltaEngine::new(CpuMode::Delta);
        let t0 = Instant::now();
        engine.utilization(&[times(0, 0, 0)], t0);

        // too young to replace the baseline, so both are measured from t0
        engine.utilization(&[times(10, 0, 10)], t0 + Duration::from_millis(50));
        let usage = engine.utilization(&[times(30, 0, 10)], t0 + Duration::from_millis(100));
        assert_eq!(usage[0].user, 75.0);
        assert_eq!(usage[0].idle, 25.0);
    }

    #[test]
    fn test_delta_mode_reseeds_on_core_count_change() {
        let engine = DeltaEngine::new(CpuMode::Delta);
        let t0 = Instant::now();
        engine.utilization(&[times(100, 0, 900)], t0);
        let usage = engine.utilization(
            &[times(200, 100, 700), times(0, 0, 10)],
            t0 + Duration::from_secs(1),
        );
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].user, 20.0);
        assert_eq!(usage[1].idle, 100.0);
    }
}
