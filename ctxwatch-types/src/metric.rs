//! Metric paths - the addressable signals alert rules can refer to.

use std::fmt;
use std::str::FromStr;

/// Where a metric path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricScope {
    /// Resolved per context from a [`crate::ContextMetrics`].
    Context,
    /// Resolved once per sample from [`crate::AggregateMetrics`].
    Aggregate,
    /// Resolved from the flow/propagation trackers, not from the sample.
    Tracker,
}

/// A parsed metric path.
///
/// Paths are written the way they appear in rule configuration, for example
/// `response_time_ms` or `aggregate.cpu_usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub enum MetricPath {
    MemoryUsage,
    ResponseTime,
    ErrorCount,
    HealthScore,
    NetworkRequests,
    CpuUsage,
    NetworkLatency,
    FlaggedRoutes,
    UnhandledChains,
}

impl MetricPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricPath::MemoryUsage => "memory_usage",
            MetricPath::ResponseTime => "response_time_ms",
            MetricPath::ErrorCount => "error_count",
            MetricPath::HealthScore => "health_score",
            MetricPath::NetworkRequests => "network_requests",
            MetricPath::CpuUsage => "aggregate.cpu_usage",
            MetricPath::NetworkLatency => "aggregate.network_latency_ms",
            MetricPath::FlaggedRoutes => "flow.flagged_routes",
            MetricPath::UnhandledChains => "propagation.unhandled_chains",
        }
    }

    pub fn scope(&self) -> MetricScope {
        match self {
            MetricPath::MemoryUsage
            | MetricPath::ResponseTime
            | MetricPath::ErrorCount
            | MetricPath::HealthScore
            | MetricPath::NetworkRequests => MetricScope::Context,
            MetricPath::CpuUsage | MetricPath::NetworkLatency => MetricScope::Aggregate,
            MetricPath::FlaggedRoutes | MetricPath::UnhandledChains => MetricScope::Tracker,
        }
    }
}

impl fmt::Display for MetricPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for a metric path outside the known set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetricPath(pub String);

impl fmt::Display for UnknownMetricPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown metric path '{}'", self.0)
    }
}

impl std::error::Error for UnknownMetricPath {}

impl FromStr for MetricPath {
    type Err = UnknownMetricPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = match s.trim() {
            "memory_usage" | "memory_usage_mb" | "memory" => MetricPath::MemoryUsage,
            "response_time_ms" | "response_time" | "latency" => MetricPath::ResponseTime,
            "error_count" | "errors" => MetricPath::ErrorCount,
            "health_score" | "health" => MetricPath::HealthScore,
            "network_requests" => MetricPath::NetworkRequests,
            "aggregate.cpu_usage" | "cpu_usage" => MetricPath::CpuUsage,
            "aggregate.network_latency_ms" | "aggregate.network_latency" | "network_latency_ms" => {
                MetricPath::NetworkLatency
            }
            "flow.flagged_routes" => MetricPath::FlaggedRoutes,
            "propagation.unhandled_chains" => MetricPath::UnhandledChains,
            other => return Err(UnknownMetricPath(other.to_string())),
        };
        Ok(path)
    }
}

impl TryFrom<String> for MetricPath {
    type Error = UnknownMetricPath;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricPath> for String {
    fn from(path: MetricPath) -> Self {
        path.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_parse_back() {
        for path in [
            MetricPath::MemoryUsage,
            MetricPath::ResponseTime,
            MetricPath::ErrorCount,
            MetricPath::HealthScore,
            MetricPath::NetworkRequests,
            MetricPath::CpuUsage,
            MetricPath::NetworkLatency,
            MetricPath::FlaggedRoutes,
            MetricPath::UnhandledChains,
        ] {
            assert_eq!(path.as_str().parse::<MetricPath>(), Ok(path));
        }
    }

    #[test]
    fn aliases_are_accepted() {
        assert_eq!("latency".parse::<MetricPath>(), Ok(MetricPath::ResponseTime));
        assert_eq!("cpu_usage".parse::<MetricPath>(), Ok(MetricPath::CpuUsage));
    }

    #[test]
    fn scopes() {
        assert_eq!(MetricPath::HealthScore.scope(), MetricScope::Context);
        assert_eq!(MetricPath::CpuUsage.scope(), MetricScope::Aggregate);
        assert_eq!(MetricPath::UnhandledChains.scope(), MetricScope::Tracker);
    }

    #[test]
    fn unknown_path_is_an_error() {
        let err = "dom.node_count".parse::<MetricPath>().unwrap_err();
        assert_eq!(err.to_string(), "unknown metric path 'dom.node_count'");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&MetricPath::CpuUsage).unwrap();
        assert_eq!(json, "\"aggregate.cpu_usage\"");
        let parsed: MetricPath = serde_json::from_str("\"error_count\"").unwrap();
        assert_eq!(parsed, MetricPath::ErrorCount);
    }
}
