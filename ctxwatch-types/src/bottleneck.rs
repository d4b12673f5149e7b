//! Performance bottlenecks detected from windowed sample history.

use std::fmt;

use crate::Severity;

/// Which signal degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BottleneckKind {
    Memory,
    Cpu,
    Latency,
    Throughput,
}

impl BottleneckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BottleneckKind::Memory => "memory",
            BottleneckKind::Cpu => "cpu",
            BottleneckKind::Latency => "latency",
            BottleneckKind::Throughput => "throughput",
        }
    }
}

impl fmt::Display for BottleneckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sustained deviation of one context from its own baseline.
///
/// Each analysis pass produces a fresh set; a bottleneck is never updated in
/// place and simply disappears once the signal normalizes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bottleneck {
    pub context_id: String,
    pub kind: BottleneckKind,
    pub severity: Severity,
    /// Relative increase over baseline, in percent.
    pub estimated_slowdown_pct: f64,
    /// Baseline mean of the deviating signal.
    pub baseline: f64,
    /// Trailing-window mean of the deviating signal.
    pub current: f64,
    /// Consecutive analysis passes the deviation has held.
    pub sustained_passes: u32,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub detected_at_ms: u64,
}

impl Bottleneck {
    /// Ratio of current to baseline (inverted for throughput, where a drop is bad).
    pub fn deviation_ratio(&self) -> f64 {
        1.0 + self.estimated_slowdown_pct / 100.0
    }
}
