//! Health score computation.

use ctxwatch_types::clamp_unit;

use crate::config::HealthConfig;

/// Weighted health model over memory, response time and error signals.
#[derive(Debug, Clone)]
pub struct HealthModel {
    config: HealthConfig,
}

impl HealthModel {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    /// Score a context in `[0, 1]`.
    ///
    /// Each present signal is normalized as `1 - value / ceiling` and clipped
    /// before weighting. A missing signal gives its weight to the others.
    pub fn score(&self, memory_mb: Option<f64>, response_ms: Option<f64>, errors: u64) -> f64 {
        let c = &self.config;
        let signals = [
            (memory_mb, c.memory_ceiling_mb, c.memory_weight),
            (response_ms, c.response_ceiling_ms, c.response_weight),
            (Some(errors as f64), c.error_ceiling, c.error_weight),
        ];

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (value, ceiling, weight) in signals {
            let Some(value) = value else { continue };
            weighted += weight * normalize(value, ceiling);
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            return 1.0;
        }
        clamp_unit(weighted / total_weight)
    }

    pub fn is_healthy(&self, score: f64) -> bool {
        score >= self.config.healthy_threshold
    }
}

fn normalize(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 0.0;
    }
    clamp_unit(1.0 - value / ceiling)
}
