//! Run timing
//!
//! Wall-clock records around protocol runs. The measurement binaries
//! print one [`RunTiming`] as JSON per completed run and aggregate them
//! across group-size sweeps, so the field names here are a stable
//! contract.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::net::messages::ProtocolKind;

/// Wall-clock record of one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTiming {
    pub protocol: String,
    pub run_id: u64,
    pub group_size: usize,
    pub started_unix_us: u64,
    pub finished_unix_us: u64,
}

impl RunTiming {
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.finished_unix_us.saturating_sub(self.started_unix_us))
    }
}

/// An in-flight measurement. Begun before the open barrier, finished
/// after the close barrier, so the span covers the full group lockstep.
pub struct TimingSession {
    protocol: &'static str,
    run_id: u64,
    group_size: usize,
    started_unix_us: u64,
    started_at: Instant,
}

impl TimingSession {
    pub fn begin(kind: ProtocolKind, run_id: u64, group_size: usize) -> Self {
        TimingSession {
            protocol: kind.label(),
            run_id,
            group_size,
            started_unix_us: unix_micros(),
            started_at: Instant::now(),
        }
    }

    pub fn finish(self) -> RunTiming {
        let elapsed = self.started_at.elapsed().as_micros() as u64;
        RunTiming {
            protocol: self.protocol.to_string(),
            run_id: self.run_id,
            group_size: self.group_size,
            started_unix_us: self.started_unix_us,
            finished_unix_us: self.started_unix_us + elapsed,
        }
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_micros() as u64)
        .unwrap_or(0)
}

/// Group sizes for a measurement sweep: `datapoints` values from `min`
/// to `max` inclusive, evenly spaced on a linear or logarithmic axis,
/// rounded to integers, deduplicated, ascending.
pub fn scale_points(min: usize, max: usize, datapoints: usize, log: bool) -> Vec<usize> {
    if datapoints == 0 || max < min {
        return Vec::new();
    }
    if datapoints == 1 {
        return vec![min];
    }
    let mut points = Vec::with_capacity(datapoints);
    if log {
        let lo = (min.max(1) as f64).ln();
        let hi = (max.max(1) as f64).ln();
        for i in 0..datapoints {
            let t = i as f64 / (datapoints - 1) as f64;
            points.push((lo + t * (hi - lo)).exp().round() as usize);
        }
    } else {
        let lo = min as f64;
        let hi = max as f64;
        for i in 0..datapoints {
            let t = i as f64 / (datapoints - 1) as f64;
            points.push((lo + t * (hi - lo)).round() as usize);
        }
    }
    points.dedup();
    points
}
