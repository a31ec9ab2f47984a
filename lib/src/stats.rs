/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Per-endpoint request statistics.
//!
//! Durations live in a rolling window of the most recent [`DURATION_WINDOW`] samples.
//! Percentiles use the nearest-rank rule `sorted[floor(n * q)]` on that window, with the
//! index clamped to the last element. Averages, minimum and maximum cover every sample
//! ever recorded, not only the window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::events::Hit;

pub const DURATION_WINDOW: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub endpoint: String,
    #[serde(default)]
    pub total_hits: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub status_codes: BTreeMap<u16, u64>,
    #[serde(default)]
    pub durations: VecDeque<f64>,
    #[serde(default)]
    pub duration_samples: u64,
    #[serde(default)]
    pub avg_duration_ms: f64,
    #[serde(default)]
    pub min_duration_ms: Option<f64>,
    #[serde(default)]
    pub max_duration_ms: Option<f64>,
    #[serde(default)]
    pub p50: f64,
    #[serde(default)]
    pub p95: f64,
    #[serde(default)]
    pub p99: f64,
    #[serde(default)]
    pub last_hit: Option<DateTime<Utc>>,
}

impl EndpointStats {
    pub fn new(endpoint: impl Into<String>) -> Self {
        EndpointStats {
            endpoint: endpoint.into(),
            total_hits: 0,
            success_count: 0,
            error_count: 0,
            status_codes: BTreeMap::new(),
            durations: VecDeque::with_capacity(DURATION_WINDOW),
            duration_samples: 0,
            avg_duration_ms: 0.0,
            min_duration_ms: None,
            max_duration_ms: None,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            last_hit: None,
        }
    }

    /// Counts a distinct request id. Callers invoke this once per id, on first sight.
    pub fn record_hit(&mut self, at: DateTime<Utc>) {
        self.total_hits += 1;
        self.last_hit = Some(at);
    }

    pub fn record_status(&mut self, status: u16) {
        if status < 400 {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        *self.status_codes.entry(status).or_insert(0) += 1;
    }

    pub fn record_duration(&mut self, duration_ms: f64) {
        self.durations.push_back(duration_ms);
        while self.durations.len() > DURATION_WINDOW {
            self.durations.pop_front();
        }

        self.duration_samples += 1;
        let n = self.duration_samples as f64;
        self.avg_duration_ms += (duration_ms - self.avg_duration_ms) / n;

        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));

        self.recompute_percentiles();
    }

    /// Feeds the terminal fields of a completed hit.
    pub fn record_completion(&mut self, hit: &Hit) {
        if let Some(status) = hit.status_code {
            self.record_status(status);
        }
        if let Some(duration) = hit.duration_ms {
            self.record_duration(duration);
        }
    }

    fn recompute_percentiles(&mut self) {
        let mut sorted: Vec<f64> = self.durations.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        self.p50 = percentile(&sorted, 0.50);
        self.p95 = percentile(&sorted, 0.95);
        self.p99 = percentile(&sorted, 0.99);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_hits == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_hits as f64 * 100.0
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_hits == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.total_hits as f64 * 100.0
    }

    /// Status histogram folded into `2xx`..`5xx` classes.
    pub fn status_distribution(&self) -> BTreeMap<&'static str, u64> {
        let mut classes = BTreeMap::from([("2xx", 0), ("3xx", 0), ("4xx", 0), ("5xx", 0)]);
        for (code, count) in &self.status_codes {
            let class = match code {
                200..=299 => "2xx",
                300..=399 => "3xx",
                400..=499 => "4xx",
                500..=599 => "5xx",
                _ => continue,
            };
            if let Some(slot) = classes.get_mut(class) {
                *slot += count;
            }
        }
        classes
    }
}

/// Nearest-rank percentile of an ascending slice. Empty input yields zero.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Human readable duration: microseconds below 1 ms, seconds from 1000 ms.
pub fn format_duration(ms: Option<f64>) -> String {
    match ms {
        None => "N/A".to_string(),
        Some(ms) if ms < 1.0 => format!("{:.2}μs", ms * 1000.0),
        Some(ms) if ms < 1000.0 => format!("{ms:.2}ms"),
        Some(ms) => format!("{:.2}s", ms / 1000.0),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_hits: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub success_rate: f64,
    /// Mean of the per-endpoint averages, ignoring endpoints without timings.
    pub avg_duration_ms: f64,
    pub endpoint_count: usize,
}

pub fn aggregate(stats: &HashMap<String, EndpointStats>) -> AggregateStats {
    let total_hits = stats.values().map(|s| s.total_hits).sum();
    let total_success = stats.values().map(|s| s.success_count).sum();
    let total_errors = stats.values().map(|s| s.error_count).sum();

    let timed: Vec<f64> = stats
        .values()
        .filter(|s| s.duration_samples > 0)
        .map(|s| s.avg_duration_ms)
        .collect();
    let avg_duration_ms = if timed.is_empty() {
        0.0
    } else {
        timed.iter().sum::<f64>() / timed.len() as f64
    };

    AggregateStats {
        total_hits,
        total_success,
        total_errors,
        success_rate: if total_hits > 0 {
            total_success as f64 / total_hits as f64 * 100.0
        } else {
            0.0
        },
        avg_duration_ms,
        endpoint_count: stats.len(),
    }
}
